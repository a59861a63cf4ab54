use super::JsonStore;
use crate::work::SensorDate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use tracing::{debug, warn};

/// Last seen input deficiency for a `sensor_id/date` key
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InputWarning {
    pub message: String,
    pub last_checked: DateTime<Utc>,
}

pub type InputWarnings = BTreeMap<String, InputWarning>;

/// Lock guarded JSON object of unresolved input problems
#[derive(Debug, Clone)]
pub struct InputWarningLedger {
    store: JsonStore,
}

impl InputWarningLedger {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            store: JsonStore::new(path, lock_timeout),
        }
    }

    /// record (or overwrite) the deficiency for this sensor date
    pub fn add(&self, sensor_date: &SensorDate, message: &str) {
        let key = sensor_date.key();
        let result = self.store.modify(|warnings: &mut InputWarnings| {
            warnings.insert(
                key.clone(),
                InputWarning {
                    message: message.to_string(),
                    last_checked: Utc::now(),
                },
            );

            true
        });

        if result.is_none() {
            warn!(key = %key, "Input warning was not recorded");
        }
    }

    pub fn remove(&self, sensor_date: &SensorDate) {
        let key = sensor_date.key();
        let result = self
            .store
            .modify(|warnings: &mut InputWarnings| warnings.remove(&key).is_some());

        match result {
            Some(true) => debug!(key = %key, "Resolved input warning"),
            Some(false) => {}
            None => warn!(key = %key, "Input warning was not removed"),
        }
    }

    pub fn load(&self) -> InputWarnings {
        self.store.load()
    }
}
