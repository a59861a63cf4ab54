use crate::{
    config::SchedulerConfig,
    work::{format_date, parse_date},
};
use chrono::{Duration, NaiveDate, Utc};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use serde::Deserialize;
use std::{
    collections::BTreeSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, warn};

/// marker file excluding a date directory from discovery
pub const DO_NOT_TOUCH: &str = ".do-not-touch";
/// written by the uploader, `complete: false` means the upload is still in progress
pub const UPLOAD_META: &str = "upload-meta.json";

/// Source of candidate dates per sensor, ascending and free of already processed dates
pub trait PendingDates {
    fn list_pending_dates(&self, sensor_id: &str) -> Vec<NaiveDate>;
}

#[derive(Deserialize)]
struct UploadMeta {
    complete: bool,
}

/// Work item discovery backed by the interferogram and results directories
#[derive(Debug, Clone)]
pub struct DirectoryCollector {
    roots: Vec<PathBuf>,
    results: PathBuf,
    from_date: NaiveDate,
    to_date: Option<NaiveDate>,
    min_days_delay: u32,
}

/// `YYYYMMDD_NN` directory names left behind by repeated uploads
fn strip_upload_suffix(name: &str) -> Option<&str> {
    let date = name.get(..8)?;
    let suffix = name.get(8..)?.strip_prefix('_')?;

    (suffix.len() == 2 && suffix.bytes().all(|byte| byte.is_ascii_digit()) && parse_date(date).is_some())
        .then_some(date)
}

/// immediate subdirectories of `dir`, a missing directory has none
fn subdirectories(dir: &Path) -> Vec<DirEntry> {
    if !dir.is_dir() {
        return Vec::new();
    }

    WalkBuilder::new(dir)
        .standard_filters(false)
        .max_depth(Some(1))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(dir = ?dir, "Failed to list directory entry: {e}");
                None
            }
        })
        .filter(|entry| entry.depth() == 1)
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_dir()))
        .collect_vec()
}

/// whether the upload of this date directory is finished and nobody asked us to keep out
pub fn is_ready(date_dir: &Path) -> bool {
    if date_dir.join(DO_NOT_TOUCH).exists() {
        debug!(path = ?date_dir, "Skipping, marked as do-not-touch");
        return false;
    }

    let meta_path = date_dir.join(UPLOAD_META);
    if !meta_path.exists() {
        return true;
    }

    match fs::read_to_string(&meta_path)
        .map_err(|e| e.to_string())
        .and_then(|content| {
            serde_json::from_str::<UploadMeta>(&content).map_err(|e| e.to_string())
        }) {
        Ok(meta) if meta.complete => true,
        Ok(_) => {
            debug!(path = ?date_dir, "Skipping, upload still in progress");
            false
        }
        Err(e) => {
            warn!(path = ?meta_path, "Skipping, unreadable upload metadata: {e}");
            false
        }
    }
}

impl DirectoryCollector {
    pub fn new(config: &SchedulerConfig) -> Option<Self> {
        Some(Self {
            roots: config.data.interferograms.clone(),
            results: config.data.results.clone(),
            from_date: config.from_date()?,
            to_date: config.to_date(),
            min_days_delay: config.discovery.min_days_delay,
        })
    }

    /// Rename `YYYYMMDD_NN` directories to their bare date so every date has one directory.
    /// Renames that would clobber an existing directory are skipped.
    fn normalize_upload_names(&self, sensor_dir: &Path) {
        for entry in subdirectories(sensor_dir) {
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Some(date) = strip_upload_suffix(name) else {
                continue;
            };
            let target = sensor_dir.join(date);

            if target.exists() {
                warn!(
                    path = ?entry.path(),
                    "Not renaming, {date} already exists next to it"
                );
                continue;
            }

            match fs::rename(entry.path(), &target) {
                Ok(()) => info!(from = ?entry.path(), to = ?target, "Renamed upload directory"),
                // somebody else got there first
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = ?entry.path(), "Vanished between listing and rename")
                }
                Err(e) => error!(path = ?entry.path(), "Failed to rename upload directory: {e}"),
            }
        }
    }

    fn latest_date(&self) -> NaiveDate {
        let delayed = Utc::now().date_naive() - Duration::days(i64::from(self.min_days_delay));

        match self.to_date {
            Some(to_date) => to_date.min(delayed),
            None => delayed,
        }
    }

    /// dates with a result in either the successful or the failed tree
    pub fn processed_dates(&self, sensor_id: &str) -> BTreeSet<NaiveDate> {
        ["successful", "failed"]
            .iter()
            .flat_map(|outcome| subdirectories(&self.results.join(sensor_id).join(outcome)))
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_date))
            .collect()
    }

    /// first root holding a ready directory for this date
    pub fn date_dir(&self, sensor_id: &str, date: NaiveDate) -> Option<PathBuf> {
        let name = format_date(date);

        self.roots
            .iter()
            .map(|root| root.join(sensor_id).join(&name))
            .find(|dir| dir.is_dir() && is_ready(dir))
    }
}

impl PendingDates for DirectoryCollector {
    fn list_pending_dates(&self, sensor_id: &str) -> Vec<NaiveDate> {
        let latest = self.latest_date();
        let processed = self.processed_dates(sensor_id);
        let mut dates = BTreeSet::new();

        for root in self.roots.iter() {
            let sensor_dir = root.join(sensor_id);

            if !sensor_dir.is_dir() {
                debug!(sensor = sensor_id, root = ?root, "No data directory for sensor");
                continue;
            }

            self.normalize_upload_names(&sensor_dir);

            for entry in subdirectories(&sensor_dir) {
                let Some(date) = entry.file_name().to_str().and_then(parse_date) else {
                    continue;
                };

                if date < self.from_date || date > latest || processed.contains(&date) {
                    continue;
                }
                if is_ready(entry.path()) {
                    dates.insert(date);
                }
            }
        }

        debug!(sensor = sensor_id, count = dates.len(), "Discovered pending dates");

        // BTreeSet iterates in ascending order
        dates.into_iter().collect_vec()
    }
}
