use super::JsonStore;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunResult {
    Success,
    Failure,
}

/// One in-flight or recently finished retrieval
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RetrievalStatus {
    pub container_id: Option<String>,
    pub sensor_id: String,
    pub from_datetime: DateTime<Utc>,
    pub location_id: String,
    pub ifg_count: Option<u64>,
    pub process_start_time: Option<DateTime<Utc>>,
    pub process_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub outcome: Option<RunResult>,
}

impl RetrievalStatus {
    /// started but never finished, the run crashed or was killed
    pub fn is_orphaned(&self) -> bool {
        self.process_start_time.is_some() && self.process_end_time.is_none()
    }

    fn matches(&self, sensor_id: &str, from_datetime: &DateTime<Utc>) -> bool {
        self.sensor_id == sensor_id && &self.from_datetime == from_datetime
    }
}

/// Fields to change on an existing entry, `None` leaves the field untouched
#[derive(Clone, Debug, Default)]
pub struct StatusUpdate {
    pub container_id: Option<String>,
    pub ifg_count: Option<u64>,
    pub process_start_time: Option<DateTime<Utc>>,
    pub process_end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub outcome: Option<RunResult>,
}

impl StatusUpdate {
    fn apply(self, status: &mut RetrievalStatus) {
        if let Some(container_id) = self.container_id {
            status.container_id = Some(container_id);
        }
        if let Some(ifg_count) = self.ifg_count {
            status.ifg_count = Some(ifg_count);
        }
        if let Some(start) = self.process_start_time {
            status.process_start_time = Some(start);
        }
        if let Some(end) = self.process_end_time {
            status.process_end_time = Some(end);
        }
        if let Some(exit_code) = self.exit_code {
            status.exit_code = Some(exit_code);
        }
        if let Some(outcome) = self.outcome {
            status.outcome = Some(outcome);
        }
    }
}

/// start of the retrieval day in UTC, the ledger key together with the sensor id
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Lock guarded JSON array of `RetrievalStatus`.
/// Purely observational: lock timeouts skip the operation instead of failing the caller.
#[derive(Debug, Clone)]
pub struct RetrievalStatusLedger {
    store: JsonStore,
}

impl RetrievalStatusLedger {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            store: JsonStore::new(path, lock_timeout),
        }
    }

    pub fn add(&self, sensor_id: &str, from_datetime: DateTime<Utc>, location_id: &str) {
        let added = self.store.modify(|entries: &mut Vec<RetrievalStatus>| {
            let before = entries.len();
            entries.retain(|entry| !entry.matches(sensor_id, &from_datetime));

            if entries.len() != before {
                debug!(sensor = sensor_id, %from_datetime, "Replacing stale ledger entry");
            }

            entries.push(RetrievalStatus {
                container_id: None,
                sensor_id: sensor_id.to_string(),
                from_datetime,
                location_id: location_id.to_string(),
                ifg_count: None,
                process_start_time: None,
                process_end_time: None,
                exit_code: None,
                outcome: None,
            });

            true
        });

        if added.is_none() {
            warn!(sensor = sensor_id, %from_datetime, "Ledger entry was not added");
        }
    }

    /// Mutate the entry for `(sensor_id, from_datetime)`, a no-op for unknown entries
    pub fn update(&self, sensor_id: &str, from_datetime: DateTime<Utc>, update: StatusUpdate) {
        let updated = self.store.modify(|entries: &mut Vec<RetrievalStatus>| {
            match entries
                .iter_mut()
                .find(|entry| entry.matches(sensor_id, &from_datetime))
            {
                Some(entry) => {
                    update.apply(entry);
                    true
                }
                None => {
                    debug!(sensor = sensor_id, %from_datetime, "No ledger entry to update");
                    false
                }
            }
        });

        if updated.is_none() {
            warn!(sensor = sensor_id, %from_datetime, "Ledger entry was not updated");
        }
    }

    pub fn load(&self) -> Vec<RetrievalStatus> {
        self.store.load()
    }

    pub fn reset(&self) {
        if self.store.replace(&Vec::<RetrievalStatus>::new()).is_some() {
            info!(path = ?self.store.path(), "Reset retrieval status ledger");
        }
    }

    pub fn orphaned(&self) -> Vec<RetrievalStatus> {
        self.load()
            .into_iter()
            .filter(RetrievalStatus::is_orphaned)
            .collect()
    }
}
