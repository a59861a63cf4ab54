use crate::{
    checker::InputLayout,
    config::SchedulerConfig,
    metadata::SensorMetadata,
    work::format_date,
};
use chrono::NaiveDate;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fs, io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONTAINER_PREFIX: &str = "retrieval-container-";

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("{action} {path:?} failed: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("Inputs changed since they were checked: {0}")]
    Inputs(String),
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> ContainerError {
    let path = path.to_path_buf();

    move |source| ContainerError::Io {
        action,
        path,
        source,
    }
}

/// What happened to a container directory after its run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    Removed,
    Archived(PathBuf),
}

/// An exclusively owned working directory for a single run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub path: PathBuf,
}

impl Container {
    pub fn code_path(&self) -> PathBuf {
        self.path.join("code")
    }

    pub fn input_path(&self) -> PathBuf {
        self.path.join("inputs")
    }

    pub fn ifg_dir(&self) -> PathBuf {
        self.input_path().join("ifg")
    }

    pub fn map_dir(&self) -> PathBuf {
        self.input_path().join("map")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.input_path().join("log")
    }

    pub fn output_path(&self) -> PathBuf {
        self.path.join("outputs")
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.yml")
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.path.join("stdout.log")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.path.join("stderr.log")
    }
}

/// Creates, populates and disposes of containers
#[derive(Debug)]
pub struct ContainerFactory {
    containers_dir: PathBuf,
    archive_dir: PathBuf,
    code_dir: PathBuf,
    template: PathBuf,
    code_version: Option<String>,
    commit_sha: OnceCell<String>,
    active: Mutex<HashSet<String>>,
}

/// short hash of the checked out commit in `dir`
fn git_commit_sha(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "--verify", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

impl ContainerFactory {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            containers_dir: config.state.containers_dir(),
            archive_dir: config.state.archive_dir(),
            code_dir: config.algorithm.code_dir.clone(),
            template: config.algorithm.config_template.clone(),
            code_version: config.algorithm.code_version.clone(),
            commit_sha: OnceCell::new(),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// version stamped into configs and result metadata, resolved once
    pub fn commit_sha(&self) -> &str {
        self.commit_sha.get_or_init(|| {
            self.code_version
                .clone()
                .or_else(|| git_commit_sha(&self.code_dir))
                .unwrap_or_else(|| {
                    warn!(dir = ?self.code_dir, "Could not determine the algorithm version");
                    String::from("unknown")
                })
        })
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.lock().iter().cloned().collect()
    }

    /// id not used by an active container nor by any directory on disk
    fn allocate_id(&self) -> String {
        let mut active = self.active.lock();

        loop {
            let mut id = Uuid::new_v4().simple().to_string();
            id.truncate(12);
            let name = format!("{CONTAINER_PREFIX}{id}");

            if !active.contains(&id)
                && !self.containers_dir.join(&name).exists()
                && !self.archive_dir.join(&name).exists()
            {
                active.insert(id.clone());
                return id;
            }
        }
    }

    fn release(&self, id: &str) {
        self.active.lock().remove(id);
    }

    /// Fresh container with empty input and output directories and the code linked in
    pub fn create(&self) -> Result<Container, ContainerError> {
        let id = self.allocate_id();
        let container = Container {
            path: self.containers_dir.join(format!("{CONTAINER_PREFIX}{id}")),
            id,
        };

        let result = (|| {
            for dir in [
                container.ifg_dir(),
                container.map_dir(),
                container.log_dir(),
                container.output_path(),
            ] {
                fs::create_dir_all(&dir).map_err(io_error("Creating", &dir))?;
            }

            symlink(&self.code_dir, container.code_path())
                .map_err(io_error("Linking code into", &container.path))
        })();

        if let Err(e) = result {
            self.release(&container.id);
            if let Err(cleanup) = fs::remove_dir_all(&container.path) {
                debug!(container = %container.id, "Nothing to clean up: {cleanup}");
            }

            return Err(e);
        }

        debug!(container = %container.id, path = ?container.path, "Created container");
        Ok(container)
    }

    /// Substitute the `%KEY%` placeholders of the template and write the run config
    pub fn render_config(
        &self,
        container: &Container,
        metadata: &SensorMetadata,
        date: NaiveDate,
    ) -> Result<PathBuf, ContainerError> {
        let template =
            fs::read_to_string(&self.template).map_err(io_error("Reading", &self.template))?;
        let replacements = [
            ("SERIAL_NUMBER", format!("{:03}", metadata.serial_number)),
            ("SITE", metadata.sensor_id.clone()),
            ("SENSOR_ID", metadata.sensor_id.clone()),
            ("LOCATION_ID", metadata.location_id.clone()),
            ("UTC_OFFSET", metadata.utc_offset.to_string()),
            ("DATE", format_date(date)),
            ("PROJECT_DIR", container.code_path().to_string_lossy().into_owned()),
            ("COMMIT_SHA", self.commit_sha().to_string()),
            ("CONTAINER_ID", container.id.clone()),
            ("CONTAINER_PATH", container.path.to_string_lossy().into_owned()),
            ("DATA_INPUT_PATH", container.input_path().to_string_lossy().into_owned()),
            ("DATA_OUTPUT_PATH", container.output_path().to_string_lossy().into_owned()),
        ];

        let rendered = replacements
            .iter()
            .fold(template, |content, (key, value)| {
                content.replace(&format!("%{key}%"), value)
            });
        let path = container.config_path();
        fs::write(&path, rendered).map_err(io_error("Writing", &path))?;

        Ok(path)
    }

    /// Link interferograms and copy the datalogger file and profiles into the container.
    /// Returns the number of interferograms.
    pub fn route_inputs(
        &self,
        container: &Container,
        layout: &InputLayout,
        metadata: &SensorMetadata,
        date: NaiveDate,
    ) -> Result<u64, ContainerError> {
        let ifgs = layout.ifg_files(&metadata.sensor_id, date);
        if ifgs.is_empty() {
            return Err(ContainerError::Inputs(String::from("interferograms vanished")));
        }

        for ifg in ifgs.iter() {
            let Some(name) = ifg.file_name() else {
                continue;
            };
            symlink(ifg, container.ifg_dir().join(name)).map_err(io_error("Linking", ifg))?;
        }

        let datalogger = layout
            .datalogger_file(&metadata.sensor_id, date)
            .map_err(|problem| ContainerError::Inputs(format!("datalogger file: {problem:?}")))?;
        if let Some(name) = datalogger.file_name() {
            fs::copy(&datalogger, container.log_dir().join(name))
                .map_err(io_error("Copying", &datalogger))?;
        }

        for profile in layout.profile_paths(metadata, date) {
            let Some(name) = profile.file_name() else {
                continue;
            };
            fs::copy(&profile, container.map_dir().join(name))
                .map_err(io_error("Copying", &profile))?;
        }

        debug!(
            container = %container.id,
            ifg_count = ifgs.len(),
            "Routed inputs into container"
        );
        Ok(ifgs.len() as u64)
    }

    /// Move container directories left behind by a crashed scheduler into the archive
    pub fn archive_leftovers(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.containers_dir) else {
            return 0;
        };
        let active = self.active_ids();
        let mut archived = 0;

        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|name| name.strip_prefix(CONTAINER_PREFIX)) else {
                continue;
            };
            if active.iter().any(|active| active == id) {
                continue;
            }

            let target = self.archive_dir.join(&name);
            match fs::create_dir_all(&self.archive_dir).and_then(|()| fs::rename(entry.path(), &target)) {
                Ok(()) => {
                    warn!(container = id, archive = ?target, "Archived container of an interrupted run");
                    archived += 1;
                }
                Err(e) => warn!(container = id, "Failed to archive leftover container: {e}"),
            }
        }

        archived
    }

    /// Remove the container after a successful run, archive it after a failed one
    pub fn teardown(&self, container: &Container, success: bool) -> Result<Teardown, ContainerError> {
        let result = if success {
            fs::remove_dir_all(&container.path)
                .map(|()| Teardown::Removed)
                .map_err(io_error("Removing", &container.path))
        } else {
            let target = self
                .archive_dir
                .join(container.path.file_name().unwrap_or(container.id.as_ref()));

            fs::create_dir_all(&self.archive_dir)
                .and_then(|()| fs::rename(&container.path, &target))
                .map(|()| Teardown::Archived(target))
                .map_err(io_error("Archiving", &container.path))
        };
        self.release(&container.id);

        match &result {
            Ok(Teardown::Removed) => info!(container = %container.id, "Removed container"),
            Ok(Teardown::Archived(target)) => {
                info!(container = %container.id, archive = ?target, "Archived container")
            }
            Err(_) => {}
        }

        result
    }
}
