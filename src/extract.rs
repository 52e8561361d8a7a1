//! Incremental extraction of history objects from chunked JSON responses
//!
//! Upstream history responses can run to many megabytes. Instead of buffering
//! a whole response and parsing it in one go, [`StreamExtractor`] consumes the
//! body as a sequence of arbitrarily-sized byte chunks and emits each
//! per-device history object the moment its closing brace arrives. Scanning
//! state (string/escape tracking, brace depth, the partial object carried so
//! far) lives in the extractor's fields, so correctness does not depend on
//! where the transport happens to split the stream.
//!
//! After the target array closes, trailing bytes are retained in a bounded
//! tail buffer so [`StreamExtractor::finalize`] can recover the optional
//! status message some responses append after the data.

use crate::error::{HistoryError, Result};
use crate::model::DeviceHistory;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Quoted-string status message trailing the data array, e.g. `"message": "OK"`
static TRAILING_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""message"\s*:\s*("(?:[^"\\]|\\.)*")"#).expect("valid trailing message pattern")
});

/// Configuration for the stream extractor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// JSON key whose array value holds the per-device history blocks
    pub target_key: String,

    /// Maximum bytes carried between chunks (partial object plus unscanned
    /// remainder); exceeding this aborts the stream
    pub max_buffer_size: usize,

    /// Maximum trailing bytes retained after the target array closes
    pub tail_capacity: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            target_key: "ThermostatHistory".to_string(),
            max_buffer_size: 10 * 1024 * 1024, // 10MB
            tail_capacity: 10_000,
        }
    }
}

/// Outcome summary returned by [`StreamExtractor::finalize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Whether the target key and its opening bracket were located
    pub found: bool,

    /// Whether the target array's closing bracket was seen
    pub completed: bool,

    /// Number of objects emitted
    pub emitted: usize,

    /// Status message recovered from the tail buffer, if any
    pub trailing_message: Option<String>,
}

/// String/escape scanning state inside the target array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Outside any quoted string
    Scanning,
    /// Inside a quoted string
    InString,
    /// Inside a string, immediately after a backslash
    Escaped,
}

/// Coarse position within the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Still looking for `"<target_key>" : [`
    SeekingArray,
    /// Between the array's brackets, emitting objects
    InArray,
    /// Array closed; collecting tail bytes only
    AfterArray,
}

enum SeekOutcome {
    /// Key not in the buffer (a suffix window is kept for the next chunk)
    NotFound,
    /// Key found at this offset but its `:` `[` has not fully arrived yet
    NeedMore(usize),
    /// Array entered; first data byte is at this offset
    Entered(usize),
}

/// Chunk-resumable scanner that emits complete objects from one named JSON array.
///
/// Feed the response body in arrival order via [`feed`](Self::feed); every call
/// returns the [`DeviceHistory`] objects whose closing brace arrived within
/// that chunk. Call [`finalize`](Self::finalize) once the stream ends. After a
/// feed call returns an error the extractor must be discarded; the stream is
/// considered aborted.
pub struct StreamExtractor {
    config: ExtractorConfig,
    /// Quoted target key bytes, e.g. `"ThermostatHistory"`
    pattern: Vec<u8>,
    phase: Phase,
    state: ScanState,
    /// Brace nesting depth inside the target array
    depth: usize,
    /// Carry-over buffer: partial object plus unscanned remainder
    buf: Vec<u8>,
    /// Next unscanned offset into `buf`
    scan_pos: usize,
    /// Offset of the currently open object's `{`, if one is open
    object_start: Option<usize>,
    /// Bounded trailing bytes after the array closed
    tail: Vec<u8>,
    emitted: usize,
    found: bool,
    completed: bool,
}

impl StreamExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let pattern = format!("\"{}\"", config.target_key).into_bytes();
        Self {
            config,
            pattern,
            phase: Phase::SeekingArray,
            state: ScanState::Scanning,
            depth: 0,
            buf: Vec::new(),
            scan_pos: 0,
            object_start: None,
            tail: Vec::new(),
            emitted: 0,
            found: false,
            completed: false,
        }
    }

    /// Consume one chunk of response bytes, returning any objects completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<DeviceHistory>> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out)?;
        Ok(out)
    }

    /// Consume one chunk, appending objects completed by it to `out`.
    ///
    /// When a malformed object aborts the scan, the objects that preceded
    /// it in the same chunk have already been appended, so callers can
    /// persist them before propagating the error.
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<DeviceHistory>) -> Result<()> {
        if self.phase == Phase::AfterArray {
            self.push_tail(chunk);
            return Ok(());
        }

        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.config.max_buffer_size {
            return Err(HistoryError::parse(format!(
                "carry buffer exceeded {} bytes while scanning history objects",
                self.config.max_buffer_size
            )));
        }

        if self.phase == Phase::SeekingArray {
            match self.seek_array() {
                SeekOutcome::NotFound => {
                    // keep a window in case the key straddles the chunk boundary
                    let keep = self.pattern.len() + 16;
                    if self.buf.len() > keep {
                        let cut = self.buf.len() - keep;
                        self.buf.drain(..cut);
                    }
                    return Ok(());
                }
                SeekOutcome::NeedMore(at) => {
                    if at > 0 {
                        self.buf.drain(..at);
                    }
                    return Ok(());
                }
                SeekOutcome::Entered(data_start) => {
                    self.found = true;
                    self.phase = Phase::InArray;
                    self.scan_pos = data_start;
                }
            }
        }

        if self.phase == Phase::InArray {
            self.scan_array(out)?;
            if self.phase == Phase::InArray {
                // drop consumed bytes, keep any open object from its first brace
                if let Some(start) = self.object_start {
                    if start > 0 {
                        self.buf.drain(..start);
                        self.scan_pos -= start;
                        self.object_start = Some(0);
                    }
                } else if self.scan_pos > 0 {
                    self.buf.drain(..self.scan_pos);
                    self.scan_pos = 0;
                }
            }
        }

        Ok(())
    }

    /// Finish the stream and summarize what was seen.
    pub fn finalize(self) -> ExtractSummary {
        ExtractSummary {
            found: self.found,
            completed: self.completed,
            emitted: self.emitted,
            trailing_message: extract_trailing_message(&self.tail),
        }
    }

    /// Objects emitted so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Locate `"<target_key>"` followed by `:` and `[`, tolerating whitespace
    /// and occurrences of the key text that are not the array (searching
    /// resumes after a mismatch).
    fn seek_array(&self) -> SeekOutcome {
        let mut from = 0;
        while let Some(rel) = find_bytes(&self.buf[from..], &self.pattern) {
            let at = from + rel;
            let mut j = at + self.pattern.len();
            while j < self.buf.len() && self.buf[j].is_ascii_whitespace() {
                j += 1;
            }
            if j >= self.buf.len() {
                return SeekOutcome::NeedMore(at);
            }
            if self.buf[j] != b':' {
                from = at + 1;
                continue;
            }
            j += 1;
            while j < self.buf.len() && self.buf[j].is_ascii_whitespace() {
                j += 1;
            }
            if j >= self.buf.len() {
                return SeekOutcome::NeedMore(at);
            }
            if self.buf[j] != b'[' {
                from = at + 1;
                continue;
            }
            return SeekOutcome::Entered(j + 1);
        }
        SeekOutcome::NotFound
    }

    /// Scan buffered bytes inside the target array, emitting each object as
    /// its closing brace is reached.
    fn scan_array(&mut self, out: &mut Vec<DeviceHistory>) -> Result<()> {
        let mut pos = self.scan_pos;
        while pos < self.buf.len() {
            let byte = self.buf[pos];
            match self.state {
                ScanState::Escaped => self.state = ScanState::InString,
                ScanState::InString => match byte {
                    b'\\' => self.state = ScanState::Escaped,
                    b'"' => self.state = ScanState::Scanning,
                    _ => {}
                },
                ScanState::Scanning => match byte {
                    b'"' => self.state = ScanState::InString,
                    b'{' => {
                        if self.depth == 0 {
                            self.object_start = Some(pos);
                        }
                        self.depth += 1;
                    }
                    b'}' => {
                        if self.depth == 0 {
                            return Err(HistoryError::parse(format!(
                                "unbalanced '}}' in history array after {} objects",
                                self.emitted
                            )));
                        }
                        self.depth -= 1;
                        if self.depth == 0 {
                            let start = self.object_start.take().ok_or_else(|| {
                                HistoryError::parse("object close without recorded start")
                            })?;
                            let slice = &self.buf[start..=pos];
                            let record: DeviceHistory =
                                serde_json::from_slice(slice).map_err(|e| {
                                    HistoryError::parse(format!(
                                        "malformed object in history array after {} objects \
                                         ({} bytes): {e}",
                                        self.emitted,
                                        pos + 1 - start
                                    ))
                                })?;
                            self.emitted += 1;
                            out.push(record);
                        }
                    }
                    b']' => {
                        if self.depth == 0 {
                            self.completed = true;
                            self.phase = Phase::AfterArray;
                            let rest = self.buf[pos + 1..].to_vec();
                            self.buf.clear();
                            self.scan_pos = 0;
                            self.push_tail(&rest);
                            return Ok(());
                        }
                    }
                    _ => {}
                },
            }
            pos += 1;
        }
        self.scan_pos = pos;
        Ok(())
    }

    /// Append to the tail buffer, keeping only the last `tail_capacity` bytes.
    fn push_tail(&mut self, bytes: &[u8]) {
        self.tail.extend_from_slice(bytes);
        if self.tail.len() > self.config.tail_capacity {
            let cut = self.tail.len() - self.config.tail_capacity;
            self.tail.drain(..cut);
        }
    }
}

/// Whole-document parse of a fully buffered response.
///
/// Fallback for callers that already hold the complete body. Returns the
/// device blocks found under `result[*].<target_key>` plus the top-level
/// status message.
pub fn parse_document(bytes: &[u8], target_key: &str) -> Result<(Vec<DeviceHistory>, Option<String>)> {
    let doc: serde_json::Value = serde_json::from_slice(bytes)?;
    let message = doc
        .get("message")
        .and_then(|m| m.as_str())
        .map(|s| s.to_string());

    let mut blocks = Vec::new();
    if let Some(result) = doc.get("result").and_then(|r| r.as_array()) {
        for entry in result {
            if let Some(items) = entry.get(target_key).and_then(|v| v.as_array()) {
                for item in items {
                    blocks.push(serde_json::from_value(item.clone())?);
                }
            }
        }
    }
    Ok((blocks, message))
}

fn extract_trailing_message(tail: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(tail);
    let captures = TRAILING_MESSAGE.captures(&text)?;
    serde_json::from_str(captures.get(1)?.as_str()).ok()
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
