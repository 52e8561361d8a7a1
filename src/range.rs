//! Date range splitting for upstream span limits
//!
//! The upstream history endpoint rejects spans longer than a fixed number of
//! days, so ingestion slices a requested range into contiguous sub-spans
//! before fetching.

use crate::error::{HistoryError, Result};
use chrono::{Days, NaiveDate, NaiveDateTime};

/// Inclusive time span handed to the upstream API in a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpan {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeSpan {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    /// Span covering one whole calendar day
    pub fn full_day(date: NaiveDate) -> Self {
        Self {
            start: day_start(date),
            end: day_end(date),
        }
    }

    /// Number of calendar days this span touches
    pub fn num_days(&self) -> i64 {
        (self.end.date() - self.start.date()).num_days() + 1
    }
}

impl std::fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// First instant of a calendar day
pub(crate) fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).expect("valid time of day")
}

/// Last instant of a calendar day (second precision)
pub(crate) fn day_end(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59).expect("valid time of day")
}

/// Split `[start, end]` into contiguous sub-spans of at most `max_days`
/// calendar days each.
///
/// Every sub-span except the last ends at the last instant of its final day;
/// the last sub-span's end is clamped to the original `end` and never rounded
/// past it. The union of the returned spans equals the input range exactly,
/// with no gaps or overlaps.
pub fn split_span(start: NaiveDateTime, end: NaiveDateTime, max_days: u32) -> Result<Vec<TimeSpan>> {
    if start > end {
        return Err(HistoryError::invalid_input(format!(
            "range start {start} is after end {end}"
        )));
    }
    if max_days == 0 {
        return Err(HistoryError::invalid_input(
            "maximum span length must be at least one day",
        ));
    }

    let mut spans = Vec::new();
    let mut cursor = start;
    loop {
        let last_day = cursor
            .date()
            .checked_add_days(Days::new(u64::from(max_days) - 1))
            .ok_or_else(|| HistoryError::invalid_input("range end is out of calendar bounds"))?;
        let span_end = day_end(last_day).min(end);
        spans.push(TimeSpan::new(cursor, span_end));
        if span_end >= end {
            break;
        }
        let next_day = span_end
            .date()
            .checked_add_days(Days::new(1))
            .ok_or_else(|| HistoryError::invalid_input("range end is out of calendar bounds"))?;
        cursor = day_start(next_day);
    }

    Ok(spans)
}
