use crate::{
    sync::{FileLock, LockError},
    work::{parse_date, SensorDate, WorkItem},
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ManualQueueError {
    #[error("Failed to access manual queue: {0}")]
    Io(#[from] std::io::Error),
    #[error("Manual queue is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Manual queue item {index}: {date:?} is not a YYYYMMDD date")]
    InvalidDate { index: usize, date: String },
    #[error("Manual queue item {index}: priority cannot be zero")]
    ZeroPriority { index: usize },
    #[error("Manual queue item {index}: sensor {sensor} is not configured")]
    UnknownSensor { index: usize, sensor: String },
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManualQueueEntry {
    pub sensor_id: String,
    pub date: String,
    pub priority: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManualQueueDocument {
    #[serde(default)]
    pub items: Vec<ManualQueueEntry>,
}

impl ManualQueueDocument {
    /// Validate every entry and convert to work items in file order.
    /// Fails on the first bad entry, nothing is silently dropped.
    pub fn validate(&self, sensors: &[String]) -> Result<Vec<WorkItem>, ManualQueueError> {
        self.items
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let date = parse_date(&entry.date).ok_or_else(|| ManualQueueError::InvalidDate {
                    index,
                    date: entry.date.clone(),
                })?;

                if entry.priority == 0 {
                    return Err(ManualQueueError::ZeroPriority { index });
                }
                if !sensors.contains(&entry.sensor_id) {
                    return Err(ManualQueueError::UnknownSensor {
                        index,
                        sensor: entry.sensor_id.clone(),
                    });
                }

                Ok(WorkItem::manual(entry.sensor_id.clone(), date, entry.priority))
            })
            .collect()
    }
}

/// User editable override file, `{"items": [{"sensor_id", "date", "priority"}]}`
#[derive(Debug, Clone)]
pub struct ManualQueue {
    path: PathBuf,
    lock: FileLock,
}

impl ManualQueue {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let lock = FileLock::for_resource(&path, lock_timeout);

        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<ManualQueueDocument, ManualQueueError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(ManualQueueDocument::default()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ManualQueueDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// validated items in file order, a missing file is an empty queue
    pub fn load(&self, sensors: &[String]) -> Result<Vec<WorkItem>, ManualQueueError> {
        let items = self.read()?.validate(sensors)?;
        debug!(path = ?self.path, count = items.len(), "Loaded manual queue");

        Ok(items)
    }

    /// Drop every entry for this sensor date. Returns whether the file changed.
    pub fn remove_item(&self, sensor_date: &SensorDate) -> Result<bool, ManualQueueError> {
        let _guard = self.lock.acquire()?;
        let mut document = self.read()?;
        let before = document.items.len();

        document.items.retain(|entry| {
            !(entry.sensor_id == sensor_date.sensor_id
                && parse_date(&entry.date) == Some(sensor_date.date))
        });

        if document.items.len() == before {
            return Ok(false);
        }

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(format!(".{}.tmp", std::process::id()));
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, serde_json::to_string_pretty(&document)?)?;
        fs::rename(&tmp, &self.path)?;
        info!(item = %sensor_date, "Removed item from manual queue");

        Ok(true)
    }
}
