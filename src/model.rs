//! Wire and storage data types for thermostat telemetry history
//!
//! The upstream API returns per-device history blocks; each block carries a
//! nested array of timestamped samples. Persisted records flatten the device
//! identity into every sample so a partition file is self-describing.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Field set requested from the upstream for every history fetch
pub const DEFAULT_FIELDS: &[&str] = &[
    "serialNo",
    "deviceName",
    "groupName",
    "timestamp",
    "runStatus",
    "fanStatus",
    "operatingMode",
    "heatSetting",
    "coolSetting",
    "temperature",
    "humidity",
    "outdoorTemperature",
];

/// Selection body sent to the upstream history endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySelection {
    /// Inclusive span start, day-boundary normalized
    pub start_date_time: NaiveDateTime,

    /// Inclusive span end
    pub end_date_time: NaiveDateTime,

    /// Restrict the fetch to one device serial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_no: Option<String>,

    /// Requested sample fields
    pub fields: Vec<String>,
}

impl HistorySelection {
    /// Selection over a span with the default field set
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start_date_time: start,
            end_date_time: end,
            serial_no: None,
            fields: DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Restrict the selection to a single device
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_no = Some(serial.into());
        self
    }
}

/// One raw timestamped sample as the upstream emits it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySample {
    /// Sample time, naive local datetime (`YYYY-MM-DDTHH:MM:SS`)
    pub timestamp: NaiveDateTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat_setting: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cool_setting: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdoor_temperature: Option<f64>,
}

/// One per-device block from the upstream's target array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHistory {
    /// Device serial number, the device identity everywhere in this crate
    pub serial_no: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,

    /// Nested sample array; may be empty for devices with no data in the span
    #[serde(rename = "History", default)]
    pub history: Vec<HistorySample>,
}

impl DeviceHistory {
    /// Flatten this block into persisted records carrying the device identity
    pub fn into_records(self) -> Vec<HistoryRecord> {
        let DeviceHistory {
            serial_no,
            device_name,
            group_name,
            history,
        } = self;
        history
            .into_iter()
            .map(|sample| HistoryRecord {
                timestamp: sample.timestamp,
                device_serial: serial_no.clone(),
                device_name: device_name.clone(),
                group_name: group_name.clone(),
                run_status: sample.run_status,
                fan_status: sample.fan_status,
                operating_mode: sample.operating_mode,
                heat_setting: sample.heat_setting,
                cool_setting: sample.cool_setting,
                temperature: sample.temperature,
                humidity: sample.humidity,
                outdoor_temperature: sample.outdoor_temperature,
            })
            .collect()
    }
}

/// One persisted history sample. Immutable once written; unique by timestamp
/// within its partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub timestamp: NaiveDateTime,

    pub device_serial: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat_setting: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cool_setting: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdoor_temperature: Option<f64>,
}

impl HistoryRecord {
    /// Calendar day this record belongs to, the partition key component
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}
