use crate::work::{format_date, parse_date};
use chrono::NaiveDate;
use globset::GlobBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file: {0}")]
    Io(#[from] Error),
    #[error("Config file is not valid: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Globs were invalid: {0}")]
    InvalidGlobs(#[from] globset::Error),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found: {0}")]
    MetadataNotFound(Error),
    #[error("Preflight checks failed, refusing to dispatch")]
    PreflightFailed,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    // sensor ids to consider for discovery, manual items must reference one of them
    pub sensors: Vec<String>,
    // maximum number of concurrently running retrievals
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    pub discovery: DiscoveryConfig,
    pub data: DataConfig,
    pub algorithm: AlgorithmConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default = "default_manual_queue_path")]
    pub manual_queue: PathBuf,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    // YYYYMMDD floor, dates before it are never discovered
    pub from_date: String,
    pub to_date: Option<String>,
    // only consider dates at least this many days in the past
    #[serde(default)]
    pub min_days_delay: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    // raw interferogram roots (e.g. upload and archive), layout `<root>/<sensor>/<YYYYMMDD>`
    pub interferograms: Vec<PathBuf>,
    #[serde(default = "default_ifg_pattern")]
    pub ifg_pattern: String,
    pub datalogger: DataloggerConfig,
    pub profiles: ProfilesConfig,
    // results tree, layout `<root>/<sensor>/{successful,failed}/<YYYYMMDD>`
    pub results: PathBuf,
    pub metadata: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DataloggerConfig {
    // layout `<root>/<sensor>/<file>`
    pub root: PathBuf,
    #[serde(default = "default_datalogger_pattern")]
    pub pattern: String,
    #[serde(default = "default_min_records")]
    pub min_records: usize,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProfileModel {
    GGG2014,
    #[default]
    GGG2020,
}

impl ProfileModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GGG2014 => "GGG2014",
            Self::GGG2020 => "GGG2020",
        }
    }

    /// file slugs required for a full day
    pub fn slugs(&self, date: NaiveDate) -> Vec<String> {
        let date = format_date(date);

        match self {
            Self::GGG2014 => vec![date],
            Self::GGG2020 => (0..24)
                .step_by(3)
                .map(|hour| format!("{date}{hour:02}"))
                .collect(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProfilesConfig {
    // layout `<root>/<model>/<slug>_<coords>.map`
    pub root: PathBuf,
    #[serde(default)]
    pub model: ProfileModel,
    // seconds to wait for profiles requested from the profile source
    #[serde(default)]
    pub wait: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AlgorithmConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    // code linked into every container
    pub code_dir: PathBuf,
    pub config_template: PathBuf,
    // files that must exist inside code_dir, e.g. compiled binaries or a venv
    #[serde(default)]
    pub required_files: Vec<PathBuf>,
    // seconds, no timeout if unset
    pub timeout: Option<u64>,
    pub code_version: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    // seconds to wait for a ledger lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

impl StateConfig {
    pub fn status_path(&self) -> PathBuf {
        self.dir.join("logs").join("active-processes.json")
    }

    pub fn warnings_path(&self) -> PathBuf {
        self.dir
            .join("logs")
            .join("input-warnings-to-be-resolved.json")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.dir.join("containers")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.dir.join("containers-archive")
    }

    pub fn instance_lock_path(&self) -> PathBuf {
        self.dir.join("scheduler.lock")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    // serve negative priority manual items only after discovered work
    #[serde(default)]
    pub defer_negative_priority: bool,
}

impl SchedulerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn from_date(&self) -> Option<NaiveDate> {
        parse_date(&self.discovery.from_date)
    }

    pub fn to_date(&self) -> Option<NaiveDate> {
        self.discovery.to_date.as_deref().and_then(parse_date)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.algorithm.timeout.map(Duration::from_secs)
    }

    /// Validate the environment before anything is dispatched.
    /// Returns true if at least one fatal problem was found.
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.sensors.is_empty() {
            error!("No sensor was defined, unable to build a queue of retrievals");
            contains_error = true;
        }
        self.sensors = self.sensors.iter().unique().cloned().collect_vec();

        if self.parallelism == 0 {
            error!("parallelism cannot be 0, nothing would ever be dispatched");
            contains_error = true;
        }

        if self.from_date().is_none() {
            error!(
                "discovery.from_date ({}) is not a valid YYYYMMDD date",
                self.discovery.from_date
            );
            contains_error = true;
        }

        if let Some(ref to_date) = self.discovery.to_date {
            if self.to_date().is_none() {
                error!("discovery.to_date ({to_date}) is not a valid YYYYMMDD date");
                contains_error = true;
            }
        }

        match check_executable(&self.algorithm.exec) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    "algorithm.exec ({}) is not executable",
                    self.algorithm.exec.to_string_lossy()
                );
                contains_error = true;
            }
            Err(e) => {
                error!(
                    "Failed to determine if algorithm.exec ({}) is an executable: {e}",
                    self.algorithm.exec.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if !self.algorithm.code_dir.is_dir() {
            error!(
                "algorithm.code_dir ({}) is not a directory",
                self.algorithm.code_dir.to_string_lossy()
            );
            contains_error = true;
        } else {
            for required in self.algorithm.required_files.iter() {
                if !self.algorithm.code_dir.join(required).exists() {
                    error!(
                        "Incomplete installation, {} is missing in algorithm.code_dir",
                        required.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if !self.algorithm.config_template.is_file() {
            error!(
                "algorithm.config_template ({}) not found",
                self.algorithm.config_template.to_string_lossy()
            );
            contains_error = true;
        }

        for (name, pattern) in [
            ("data.ifg_pattern", &self.data.ifg_pattern),
            ("data.datalogger.pattern", &self.data.datalogger.pattern),
        ] {
            let candidate = pattern
                .replace("%SENSOR_ID%", "sensor")
                .replace("%DATE%", "20000101");

            if let Err(e) = GlobBuilder::new(&candidate).build() {
                error!("{name} ({pattern}) is not a valid glob: {e}");
                contains_error = true;
            }
        }

        if self.data.interferograms.is_empty() {
            error!("data.interferograms needs at least one root directory");
            contains_error = true;
        }
        for root in self.data.interferograms.iter() {
            if !root.is_dir() {
                warn!(
                    "Interferogram root {} does not exist, it will not contribute any dates",
                    root.to_string_lossy()
                );
            }
        }

        if !self.data.metadata.is_file() {
            error!(
                "data.metadata ({}) not found",
                self.data.metadata.to_string_lossy()
            );
            contains_error = true;
        }

        for dir in [
            self.data.results.clone(),
            self.state.containers_dir(),
            self.state.archive_dir(),
            self.state.dir.join("logs"),
        ] {
            if !dir.is_dir() {
                info!("Creating missing directory {}", dir.to_string_lossy());

                if let Err(e) = fs::create_dir_all(&dir) {
                    error!("Failed to create {}: {e}", dir.to_string_lossy());
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_parallelism() -> usize {
    2
}

fn default_manual_queue_path() -> PathBuf {
    PathBuf::from("config/manual-queue.json")
}

fn default_ifg_pattern() -> String {
    String::from("%SENSOR_ID%[0-9]*.ifg.*")
}

fn default_datalogger_pattern() -> String {
    String::from("datalogger-%SENSOR_ID%-%DATE%*.csv")
}

fn default_min_records() -> usize {
    1440
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_lock_timeout() -> u64 {
    15
}
