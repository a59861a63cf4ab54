use crate::{
    collector::is_ready,
    config::{DataloggerConfig, ProfileModel, ProfilesConfig, SchedulerConfig},
    metadata::{MetadataProvider, SensorMetadata},
    work::format_date,
};
use chrono::NaiveDate;
use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use itertools::Itertools;
use std::{
    fmt,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument};

const PROFILE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What exactly is wrong with a datalogger lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataloggerProblem {
    Missing,
    Duplicate(usize),
    Incomplete { records: usize, expected: usize },
    Unreadable(String),
}

/// Reason a (sensor, date) cannot be processed right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deficiency {
    LocationData,
    IfgFiles(String),
    DataloggerFiles(DataloggerProblem),
    VerticalProfiles(String),
}

impl Deficiency {
    pub fn category(&self) -> &'static str {
        match self {
            Self::LocationData => "location data",
            Self::IfgFiles(_) => "ifg files",
            Self::DataloggerFiles(_) => "datalogger files",
            Self::VerticalProfiles(_) => "vertical profiles",
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::LocationData => String::from("no sensor setup covers this date"),
            Self::IfgFiles(detail) | Self::VerticalProfiles(detail) => detail.clone(),
            Self::DataloggerFiles(DataloggerProblem::Missing) => {
                String::from("no datalogger file found")
            }
            Self::DataloggerFiles(DataloggerProblem::Duplicate(count)) => {
                format!("{count} datalogger files match, expected exactly one")
            }
            Self::DataloggerFiles(DataloggerProblem::Incomplete { records, expected }) => {
                format!("datalogger file has {records} records, expected at least {expected}")
            }
            Self::DataloggerFiles(DataloggerProblem::Unreadable(reason)) => {
                format!("datalogger file is unreadable: {reason}")
            }
        }
    }
}

impl fmt::Display for Deficiency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inputs incomplete ({}): {}", self.category(), self.detail())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Ok,
    Deficient(Deficiency),
}

/// Decides whether all inputs for a (sensor, date) are in place
pub trait InputChecker {
    fn check(&self, sensor_id: &str, date: NaiveDate) -> Availability;
}

/// Collaborator able to fetch vertical profiles, files are expected to appear in place
pub trait ProfileSource: Send + Sync {
    fn request(&self, model: ProfileModel, missing: &[PathBuf]);
}

/// profile source for setups where profiles are placed by an external job
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProfileSource;

impl ProfileSource for NoProfileSource {
    fn request(&self, model: ProfileModel, missing: &[PathBuf]) {
        debug!(
            model = model.as_str(),
            count = missing.len(),
            "No profile source configured, waiting for files to appear"
        );
    }
}

/// Where the raw inputs of a (sensor, date) live on disk
#[derive(Debug, Clone)]
pub struct InputLayout {
    interferograms: Vec<PathBuf>,
    ifg_pattern: String,
    datalogger: DataloggerConfig,
    profiles: ProfilesConfig,
}

fn file_matcher(pattern: &str, sensor_id: &str, date: NaiveDate) -> Option<GlobMatcher> {
    let pattern = pattern
        .replace("%SENSOR_ID%", sensor_id)
        .replace("%DATE%", &format_date(date));

    match GlobBuilder::new(&pattern).literal_separator(true).build() {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(e) => {
            error!(sensor = sensor_id, %date, "Invalid file pattern {pattern}: {e}");
            None
        }
    }
}

/// files directly inside `dir` whose name matches, sorted by name
fn matching_files(dir: &Path, matcher: &GlobMatcher) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }

    WalkBuilder::new(dir)
        .standard_filters(false)
        .max_depth(Some(1))
        .build()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(|entry| entry.into_path())
        .sorted()
        .collect_vec()
}

/// data records of a datalogger file, the header line is not counted
fn count_records(path: &Path) -> std::io::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = 0;

    for line in reader.lines().skip(1) {
        if !line?.trim().is_empty() {
            records += 1;
        }
    }

    Ok(records)
}

impl InputLayout {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            interferograms: config.data.interferograms.clone(),
            ifg_pattern: config.data.ifg_pattern.clone(),
            datalogger: config.data.datalogger.clone(),
            profiles: config.data.profiles.clone(),
        }
    }

    pub fn profile_model(&self) -> ProfileModel {
        self.profiles.model
    }

    /// first interferogram root holding a ready directory for the date, the same one discovery accepted
    pub fn ifg_dir(&self, sensor_id: &str, date: NaiveDate) -> Option<PathBuf> {
        let name = format_date(date);

        self.interferograms
            .iter()
            .map(|root| root.join(sensor_id).join(&name))
            .find(|dir| dir.is_dir() && is_ready(dir))
    }

    pub fn ifg_files(&self, sensor_id: &str, date: NaiveDate) -> Vec<PathBuf> {
        match (
            self.ifg_dir(sensor_id, date),
            file_matcher(&self.ifg_pattern, sensor_id, date),
        ) {
            (Some(dir), Some(matcher)) => matching_files(&dir, &matcher),
            _ => Vec::new(),
        }
    }

    pub fn datalogger_files(&self, sensor_id: &str, date: NaiveDate) -> Vec<PathBuf> {
        file_matcher(&self.datalogger.pattern, sensor_id, date)
            .map(|matcher| matching_files(&self.datalogger.root.join(sensor_id), &matcher))
            .unwrap_or_default()
    }

    /// every profile file a full day needs, present or not
    pub fn profile_paths(&self, metadata: &SensorMetadata, date: NaiveDate) -> Vec<PathBuf> {
        let dir = self.profiles.root.join(self.profiles.model.as_str());
        let coordinates = metadata.coordinates_slug();

        self.profiles
            .model
            .slugs(date)
            .into_iter()
            .map(|slug| dir.join(format!("{slug}_{coordinates}.map")))
            .collect_vec()
    }

    /// the single datalogger file with enough records for a full day
    pub fn datalogger_file(&self, sensor_id: &str, date: NaiveDate) -> Result<PathBuf, DataloggerProblem> {
        let mut files = self.datalogger_files(sensor_id, date);

        match files.len() {
            0 => Err(DataloggerProblem::Missing),
            1 => {
                let file = files.remove(0);
                let records =
                    count_records(&file).map_err(|e| DataloggerProblem::Unreadable(e.to_string()))?;

                if records < self.datalogger.min_records {
                    Err(DataloggerProblem::Incomplete {
                        records,
                        expected: self.datalogger.min_records,
                    })
                } else {
                    Ok(file)
                }
            }
            count => Err(DataloggerProblem::Duplicate(count)),
        }
    }
}

/// Availability checks against the local filesystem
pub struct FilesystemChecker {
    layout: InputLayout,
    metadata: Arc<dyn MetadataProvider>,
    profile_source: Arc<dyn ProfileSource>,
    profile_wait: Duration,
}

impl FilesystemChecker {
    pub fn new(
        config: &SchedulerConfig,
        metadata: Arc<dyn MetadataProvider>,
        profile_source: Arc<dyn ProfileSource>,
    ) -> Self {
        Self {
            layout: InputLayout::new(config),
            metadata,
            profile_source,
            profile_wait: Duration::from_secs(config.data.profiles.wait),
        }
    }

    pub fn layout(&self) -> &InputLayout {
        &self.layout
    }

    fn check_ifgs(&self, sensor_id: &str, date: NaiveDate) -> Result<(), Deficiency> {
        let Some(dir) = self.layout.ifg_dir(sensor_id, date) else {
            return Err(Deficiency::IfgFiles(String::from("no interferogram directory")));
        };

        if self.layout.ifg_files(sensor_id, date).is_empty() {
            return Err(Deficiency::IfgFiles(format!(
                "no interferograms in {}",
                dir.to_string_lossy()
            )));
        }

        Ok(())
    }

    /// profiles present now or delivered by the profile source within the wait
    fn check_profiles(&self, metadata: &SensorMetadata, date: NaiveDate) -> Result<(), Deficiency> {
        let missing = |paths: &[PathBuf]| {
            paths
                .iter()
                .filter(|path| !path.is_file())
                .cloned()
                .collect_vec()
        };
        let paths = self.layout.profile_paths(metadata, date);
        let mut absent = missing(&paths);

        if absent.is_empty() {
            return Ok(());
        }

        self.profile_source
            .request(self.layout.profile_model(), &absent);
        let start = Instant::now();
        absent = missing(&absent);

        while !absent.is_empty() && start.elapsed() < self.profile_wait {
            thread::sleep(PROFILE_POLL_INTERVAL.min(self.profile_wait.saturating_sub(start.elapsed())));
            absent = missing(&absent);
        }

        match absent.first() {
            None => {
                info!(sensor = %metadata.sensor_id, %date, "Vertical profiles arrived");
                Ok(())
            }
            Some(first) => Err(Deficiency::VerticalProfiles(format!(
                "{} of {} {} profiles missing, e.g. {}",
                absent.len(),
                paths.len(),
                self.layout.profile_model().as_str(),
                first.to_string_lossy()
            ))),
        }
    }

    fn run_checks(&self, sensor_id: &str, date: NaiveDate) -> Result<(), Deficiency> {
        let metadata = self
            .metadata
            .get(sensor_id, date)
            .ok_or(Deficiency::LocationData)?;

        self.check_ifgs(sensor_id, date)?;
        self.layout
            .datalogger_file(sensor_id, date)
            .map_err(Deficiency::DataloggerFiles)?;
        self.check_profiles(&metadata, date)
    }
}

impl InputChecker for FilesystemChecker {
    #[instrument(skip(self), level = "debug")]
    fn check(&self, sensor_id: &str, date: NaiveDate) -> Availability {
        match self.run_checks(sensor_id, date) {
            Ok(()) => Availability::Ok,
            Err(deficiency) => {
                debug!(sensor = sensor_id, %date, "{deficiency}");
                Availability::Deficient(deficiency)
            }
        }
    }
}
