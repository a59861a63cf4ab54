use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// date format used in directory names, queue files and ledger keys
pub const DATE_FORMAT: &str = "%Y%m%d";

/// parse a fixed width `YYYYMMDD` string, anything else is rejected
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    if value.len() != 8 || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }

    NaiveDate::parse_from_str(value, DATE_FORMAT).ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Where a work item came from
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Discovered,
    Manual,
}

/// unique identity of a unit of work
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SensorDate {
    pub sensor_id: String,
    pub date: NaiveDate,
}

impl SensorDate {
    pub fn new(sensor_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            date,
        }
    }

    /// key used by the input warning ledger, e.g. `mc/20220701`
    pub fn key(&self) -> String {
        format!("{}/{}", self.sensor_id, format_date(self.date))
    }
}

impl fmt::Display for SensorDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sensor_id, format_date(self.date))
    }
}

/// A single (sensor, date) unit scheduled for retrieval
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub sensor_id: String,
    pub date: NaiveDate,
    pub priority: i64,
    pub origin: Origin,
}

impl WorkItem {
    pub fn discovered(sensor_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            date,
            priority: 0,
            origin: Origin::Discovered,
        }
    }

    pub fn manual(sensor_id: impl Into<String>, date: NaiveDate, priority: i64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            date,
            priority,
            origin: Origin::Manual,
        }
    }

    pub fn sensor_date(&self) -> SensorDate {
        SensorDate::new(self.sensor_id.clone(), self.date)
    }

    pub fn date_string(&self) -> String {
        format_date(self.date)
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sensor_id, format_date(self.date))
    }
}
