use crate::{
    checker::InputLayout,
    config::SchedulerConfig,
    container::{Container, ContainerError, ContainerFactory, Teardown},
    executors::{run_algorithm, ExecutorError, Invocation, LocalExecutor, Outcome},
    ledger::{status::day_start, InputWarningLedger, RetrievalStatusLedger, RunResult, StatusUpdate},
    manual_queue::ManualQueue,
    metadata::{MetadataProvider, SensorMetadata},
    shutdown::Shutdown,
    work::{format_date, SensorDate, WorkItem},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashSet,
    fs, io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0} is already running")]
    AlreadyActive(SensorDate),
    #[error("No metadata for {0}")]
    MissingMetadata(SensorDate),
    #[error("Shutting down, not launching {0}")]
    ShuttingDown(SensorDate),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Metadata stored next to every result
#[derive(Serialize, Debug)]
struct About {
    sensor_id: String,
    date: String,
    location_id: String,
    container_id: String,
    code_version: String,
    generation_time: DateTime<Utc>,
    exit_code: Option<i32>,
    outcome: RunResult,
}

/// (sensor, date) pairs with a live container, released when dropped
struct ActiveClaim {
    active: Arc<Mutex<HashSet<SensorDate>>>,
    key: SensorDate,
}

impl ActiveClaim {
    fn new(active: &Arc<Mutex<HashSet<SensorDate>>>, key: SensorDate) -> Option<Self> {
        active.lock().insert(key.clone()).then(|| Self {
            active: active.clone(),
            key,
        })
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.active.lock().remove(&self.key);
    }
}

/// Handle on a launched run
#[derive(Debug)]
pub struct RunHandle {
    pub item: WorkItem,
    pub container_id: String,
    receiver: mpsc::Receiver<Outcome>,
}

impl RunHandle {
    /// block until the run and its bookkeeping are complete
    pub fn wait(self) -> Outcome {
        self.receiver.recv().unwrap_or_else(|_| {
            error!(item = %self.item, "Run ended without reporting an outcome");
            Outcome::Failure(None)
        })
    }
}

/// State shared between the scheduling thread and the workers
struct Shared {
    factory: ContainerFactory,
    status: RetrievalStatusLedger,
    warnings: InputWarningLedger,
    manual: ManualQueue,
    results: PathBuf,
}

/// one run from spawn to teardown, executed on a worker
struct Run {
    item: WorkItem,
    metadata: SensorMetadata,
    container: Container,
    invocation: Invocation,
    from_datetime: DateTime<Utc>,
}

/// Recursively copy `from` into the new directory `to`, symlinks are copied as links.
/// Works across filesystems, the source is left untouched.
fn copy_tree(from: &Path, to: &Path) -> io::Result<u64> {
    let mut copied = 0;

    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = to.join(relative);
        let kind = entry.file_type();

        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else if kind.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

impl Shared {
    fn write_result(&self, run: &Run, outcome: Outcome, dir: &Path) -> io::Result<()> {
        let outputs = run.container.output_path();

        if outputs.is_dir() {
            let copied = copy_tree(&outputs, dir)?;
            debug!(item = %run.item, copied, "Copied outputs");
        } else {
            warn!(item = %run.item, "Algorithm removed its output directory");
            fs::create_dir_all(dir)?;
        }

        for log in [run.container.stdout_path(), run.container.stderr_path()] {
            if let Some(name) = log.file_name() {
                if log.is_file() {
                    fs::copy(&log, dir.join(name))?;
                }
            }
        }

        let about = About {
            sensor_id: run.item.sensor_id.clone(),
            date: run.item.date_string(),
            location_id: run.metadata.location_id.clone(),
            container_id: run.container.id.clone(),
            code_version: self.factory.commit_sha().to_string(),
            generation_time: Utc::now(),
            exit_code: outcome.exit_code(),
            outcome: outcome.into(),
        };
        let about = serde_json::to_string_pretty(&about)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join("about.json"), about)
    }

    /// Store the outputs in the results tree. The result is assembled next to its final
    /// location and only then replaces older results for the same date.
    fn extract_outputs(&self, run: &Run, outcome: Outcome) -> io::Result<PathBuf> {
        let sensor_results = self.results.join(&run.item.sensor_id);
        let date = run.item.date_string();
        let tree = sensor_results.join(if outcome.is_success() { "successful" } else { "failed" });
        let target = tree.join(&date);
        let staging = tree.join(format!(".{date}-{}", run.container.id));

        fs::create_dir_all(&tree)?;
        if let Err(e) = self.write_result(run, outcome, &staging) {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                debug!(path = ?staging, "Nothing to clean up: {cleanup}");
            }
            return Err(e);
        }

        for old in ["successful", "failed"].map(|tree| sensor_results.join(tree).join(&date)) {
            if old.is_dir() {
                debug!(item = %run.item, path = ?old, "Removing old result");
                fs::remove_dir_all(&old)?;
            }
        }
        fs::rename(&staging, &target)?;

        Ok(target)
    }

    #[instrument(skip_all, fields(item = %run.item, container = %run.container.id))]
    fn execute(&self, run: Run) -> Outcome {
        let outcome = match run_algorithm(&run.invocation) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Failed to run the algorithm: {e}");
                Outcome::Failure(None)
            }
        };

        let outcome = match outcome {
            // no result is stored so the date is discovered again by the next run
            Outcome::Cancelled => {
                warn!("Retrieval cancelled");
                outcome
            }
            _ => {
                if outcome.is_success() {
                    info!("Retrieval succeeded");
                } else {
                    warn!(exit_code = ?outcome.exit_code(), "Retrieval failed");
                }

                match self.extract_outputs(&run, outcome) {
                    Ok(target) => {
                        info!(results = ?target, "Stored results");
                        outcome
                    }
                    Err(e) => {
                        error!("Failed to store results, archiving the container: {e}");
                        Outcome::Failure(outcome.exit_code())
                    }
                }
            }
        };

        match self.factory.teardown(&run.container, outcome.is_success()) {
            Ok(Teardown::Archived(path)) => debug!(archive = ?path, "Archived container"),
            Ok(Teardown::Removed) => {}
            Err(e) => error!("Container teardown failed: {e}"),
        }

        self.status.update(
            &run.item.sensor_id,
            run.from_datetime,
            StatusUpdate {
                process_end_time: Some(Utc::now()),
                exit_code: outcome.exit_code(),
                outcome: Some(outcome.into()),
                ..Default::default()
            },
        );

        if outcome == Outcome::Cancelled {
            return outcome;
        }

        let sensor_date = run.item.sensor_date();
        if outcome.is_success() {
            self.warnings.remove(&sensor_date);
        }
        if let Err(e) = self.manual.remove_item(&sensor_date) {
            warn!("Failed to remove item from manual queue: {e}");
        }

        outcome
    }
}

/// Launches work items into containers and supervises them to completion
pub struct Orchestrator {
    shared: Arc<Shared>,
    executor: LocalExecutor,
    layout: InputLayout,
    metadata: Arc<dyn MetadataProvider>,
    active: Arc<Mutex<HashSet<SensorDate>>>,
    exec: PathBuf,
    params: Vec<String>,
    timeout: Option<Duration>,
    shutdown: Shutdown,
}

impl Orchestrator {
    pub fn new(
        config: &SchedulerConfig,
        metadata: Arc<dyn MetadataProvider>,
        shutdown: Shutdown,
    ) -> Result<Self, OrchestratorError> {
        let lock_timeout = config.state.lock_timeout();

        Ok(Self {
            shared: Arc::new(Shared {
                factory: ContainerFactory::new(config),
                status: RetrievalStatusLedger::new(config.state.status_path(), lock_timeout),
                warnings: InputWarningLedger::new(config.state.warnings_path(), lock_timeout),
                manual: ManualQueue::new(&config.manual_queue, lock_timeout),
                results: config.data.results.clone(),
            }),
            executor: LocalExecutor::new(config.parallelism)?,
            layout: InputLayout::new(config),
            metadata,
            active: Arc::new(Mutex::new(HashSet::new())),
            exec: config.algorithm.exec.clone(),
            params: config.algorithm.params.clone(),
            timeout: config.run_timeout(),
            shutdown,
        })
    }

    pub fn factory(&self) -> &ContainerFactory {
        &self.shared.factory
    }

    /// number of runs currently holding a slot
    pub fn running(&self) -> usize {
        self.executor.running()
    }

    /// (sensor, date) pairs with a live container
    pub fn active(&self) -> Vec<SensorDate> {
        self.active.lock().iter().cloned().collect()
    }

    /// Materialize a container for `item` and start the algorithm in it.
    /// Blocks while all execution slots are taken.
    #[instrument(skip(self), fields(item = %item), level = "info")]
    pub fn launch(&self, item: WorkItem) -> Result<RunHandle, OrchestratorError> {
        let sensor_date = item.sensor_date();
        let claim = ActiveClaim::new(&self.active, sensor_date.clone())
            .ok_or_else(|| OrchestratorError::AlreadyActive(sensor_date.clone()))?;
        let metadata = self
            .metadata
            .get(&item.sensor_id, item.date)
            .ok_or_else(|| OrchestratorError::MissingMetadata(sensor_date.clone()))?;

        let permit = self.executor.reserve();
        if self.shutdown.is_triggered() {
            return Err(OrchestratorError::ShuttingDown(sensor_date));
        }
        let factory = &self.shared.factory;
        let container = factory.create()?;

        let prepared = factory
            .render_config(&container, &metadata, item.date)
            .and_then(|config_path| {
                factory
                    .route_inputs(&container, &self.layout, &metadata, item.date)
                    .map(|ifg_count| (config_path, ifg_count))
            });
        let (config_path, ifg_count) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(teardown) = factory.teardown(&container, false) {
                    error!(container = %container.id, "Container teardown failed: {teardown}");
                }
                return Err(e.into());
            }
        };

        let from_datetime = day_start(item.date);
        let status = &self.shared.status;
        status.add(&item.sensor_id, from_datetime, &metadata.location_id);
        status.update(
            &item.sensor_id,
            from_datetime,
            StatusUpdate {
                container_id: Some(container.id.clone()),
                ifg_count: Some(ifg_count),
                process_start_time: Some(Utc::now()),
                ..Default::default()
            },
        );

        let invocation = Invocation {
            exec: self.exec.clone(),
            params: self.params.clone(),
            container_dir: container.path.clone(),
            container_id: container.id.clone(),
            config_path,
            stdout: container.stdout_path(),
            stderr: container.stderr_path(),
            timeout: self.timeout,
            shutdown: self.shutdown.clone(),
        };
        let (sender, receiver) = mpsc::channel();
        let handle = RunHandle {
            item: item.clone(),
            container_id: container.id.clone(),
            receiver,
        };
        let run = Run {
            item,
            metadata,
            container,
            invocation,
            from_datetime,
        };

        info!(
            container = %handle.container_id,
            ifg_count,
            date = %format_date(run.item.date),
            "Launching retrieval"
        );

        let shared = self.shared.clone();
        self.executor.execute(permit, move || {
            let outcome = shared.execute(run);
            drop(claim);

            // the handle may have been dropped, nobody is waiting then
            let _ = sender.send(outcome);
        });

        Ok(handle)
    }

    /// block until every launched run has finished
    pub fn wait_idle(&self) {
        self.executor.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checker::tests::{write_inputs, METADATA},
        config::tests::fixture,
        metadata::JsonMetadata,
        work::parse_date,
    };

    fn prepare(root: &Path, script: &str) -> SchedulerConfig {
        let mut config = fixture(root);
        let script_path = root.join("algorithm.sh");
        fs::write(&script_path, script).unwrap();
        config.algorithm.exec = PathBuf::from("/bin/sh");
        config.algorithm.params = vec![script_path.to_string_lossy().into_owned()];
        assert!(!config.preflight_checks());

        config
    }

    fn build(config: &SchedulerConfig, shutdown: Shutdown) -> Orchestrator {
        Orchestrator::new(
            config,
            Arc::new(JsonMetadata::parse(METADATA).unwrap()),
            shutdown,
        )
        .unwrap()
    }

    fn orchestrator(root: &Path, script: &str) -> (SchedulerConfig, Orchestrator) {
        let config = prepare(root, script);
        let orchestrator = build(&config, Shutdown::new());

        (config, orchestrator)
    }

    fn statuses(config: &SchedulerConfig) -> Vec<crate::ledger::RetrievalStatus> {
        RetrievalStatusLedger::new(config.state.status_path(), Duration::from_secs(1)).load()
    }

    #[test]
    fn successful_run_stores_results_and_removes_container() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), "mc", "20220701");
        let (config, orchestrator) = orchestrator(
            dir.path(),
            "ls inputs/ifg > outputs/ifgs.txt\necho done\n",
        );
        let date = parse_date("20220701").unwrap();

        let handle = orchestrator.launch(WorkItem::discovered("mc", date)).unwrap();
        let container_id = handle.container_id.clone();
        assert_eq!(handle.wait(), Outcome::Success);
        orchestrator.wait_idle();

        let result = config.data.results.join("mc/successful/20220701");
        assert_eq!(
            fs::read_to_string(result.join("ifgs.txt")).unwrap(),
            "mc20220701.ifg.001\nmc20220701.ifg.002\n"
        );
        assert_eq!(fs::read_to_string(result.join("stdout.log")).unwrap(), "done\n");
        let about: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(result.join("about.json")).unwrap()).unwrap();
        assert_eq!(about["code_version"], "abc1234");
        assert_eq!(about["outcome"], "success");

        assert!(fs::read_dir(config.state.containers_dir()).unwrap().next().is_none());

        let entries = statuses(&config);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].container_id.as_deref(), Some(container_id.as_str()));
        assert_eq!(entries[0].ifg_count, Some(2));
        assert_eq!(entries[0].exit_code, Some(0));
        assert_eq!(entries[0].outcome, Some(RunResult::Success));
        assert!(entries[0].process_end_time.is_some());
    }

    #[test]
    fn failed_run_is_archived_and_replaces_old_result() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), "mc", "20220701");
        let (config, orchestrator) = orchestrator(dir.path(), "echo broken >&2\nexit 4\n");
        let old = config.data.results.join("mc/successful/20220701");
        fs::create_dir_all(&old).unwrap();

        let handle = orchestrator
            .launch(WorkItem::discovered("mc", parse_date("20220701").unwrap()))
            .unwrap();
        assert_eq!(handle.wait(), Outcome::Failure(Some(4)));
        orchestrator.wait_idle();

        assert!(!old.exists());
        let failed = config.data.results.join("mc/failed/20220701");
        assert_eq!(fs::read_to_string(failed.join("stderr.log")).unwrap(), "broken\n");
        assert_eq!(
            fs::read_dir(config.state.archive_dir()).unwrap().count(),
            1
        );
        assert!(fs::read_dir(config.state.containers_dir()).unwrap().next().is_none());

        let entries = statuses(&config);
        assert_eq!(entries[0].exit_code, Some(4));
        assert_eq!(entries[0].outcome, Some(RunResult::Failure));
    }

    #[test]
    fn refuses_a_second_container_for_the_same_item() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), "mc", "20220701");
        let (_config, orchestrator) = orchestrator(dir.path(), "sleep 1\n");
        let item = WorkItem::discovered("mc", parse_date("20220701").unwrap());

        let handle = orchestrator.launch(item.clone()).unwrap();
        assert!(matches!(
            orchestrator.launch(item),
            Err(OrchestratorError::AlreadyActive(_))
        ));
        assert_eq!(orchestrator.active().len(), 1);

        handle.wait();
        orchestrator.wait_idle();
        assert!(orchestrator.active().is_empty());
    }

    #[test]
    fn completed_manual_items_leave_the_override_file() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), "mc", "20220701");
        let (config, orchestrator) = orchestrator(dir.path(), "exit 1\n");
        fs::write(
            &config.manual_queue,
            r#"{"items": [{"sensor_id": "mc", "date": "20220701", "priority": 1}]}"#,
        )
        .unwrap();

        let handle = orchestrator
            .launch(WorkItem::manual("mc", parse_date("20220701").unwrap(), 1))
            .unwrap();
        handle.wait();
        orchestrator.wait_idle();

        let remaining = ManualQueue::new(&config.manual_queue, Duration::from_secs(1))
            .load(&config.sensors)
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[test]
    fn copies_nested_outputs_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("outputs");
        fs::create_dir_all(from.join("nested/deeper")).unwrap();
        fs::write(from.join("result.csv"), "a,b\n").unwrap();
        fs::write(from.join("nested/deeper/spectrum.bin"), "xyz").unwrap();
        symlink("result.csv", from.join("latest.csv")).unwrap();

        let to = dir.path().join("copy");
        assert_eq!(copy_tree(&from, &to).unwrap(), 2);

        assert_eq!(fs::read_to_string(to.join("result.csv")).unwrap(), "a,b\n");
        assert_eq!(fs::read_to_string(to.join("nested/deeper/spectrum.bin")).unwrap(), "xyz");
        assert_eq!(fs::read_link(to.join("latest.csv")).unwrap(), PathBuf::from("result.csv"));
        assert!(from.join("result.csv").is_file());
    }

    #[test]
    fn results_on_another_filesystem_are_stored() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let shm = Path::new("/dev/shm");
        if !shm.is_dir() {
            return;
        }
        let results = tempfile::tempdir_in(shm).unwrap();
        if fs::metadata(dir.path()).unwrap().dev() == fs::metadata(results.path()).unwrap().dev() {
            return;
        }

        write_inputs(dir.path(), "mc", "20220701");
        let mut config = prepare(dir.path(), "echo 1,2 > outputs/result.csv\n");
        config.data.results = results.path().to_path_buf();
        let old = results.path().join("mc/failed/20220701");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("result.csv"), "stale").unwrap();
        let orchestrator = build(&config, Shutdown::new());

        let handle = orchestrator
            .launch(WorkItem::discovered("mc", parse_date("20220701").unwrap()))
            .unwrap();
        assert_eq!(handle.wait(), Outcome::Success);
        orchestrator.wait_idle();

        let stored = results.path().join("mc/successful/20220701");
        assert_eq!(fs::read_to_string(stored.join("result.csv")).unwrap(), "1,2\n");
        assert!(stored.join("about.json").is_file());
        assert!(!old.exists());
        assert!(fs::read_dir(config.state.containers_dir()).unwrap().next().is_none());
    }

    #[test]
    fn unstorable_results_keep_the_container() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), "mc", "20220701");
        let config = prepare(dir.path(), "echo 1,2 > outputs/result.csv\n");
        fs::remove_dir_all(&config.data.results).unwrap();
        fs::write(&config.data.results, "not a directory").unwrap();
        let orchestrator = build(&config, Shutdown::new());

        let handle = orchestrator
            .launch(WorkItem::discovered("mc", parse_date("20220701").unwrap()))
            .unwrap();
        assert_eq!(handle.wait(), Outcome::Failure(Some(0)));
        orchestrator.wait_idle();

        let archived: Vec<_> = fs::read_dir(config.state.archive_dir())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(archived.len(), 1);
        assert_eq!(
            fs::read_to_string(archived[0].join("outputs/result.csv")).unwrap(),
            "1,2\n"
        );
        assert_eq!(statuses(&config)[0].outcome, Some(RunResult::Failure));
    }

    #[test]
    fn cancelled_runs_store_nothing_and_stay_pending() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), "mc", "20220701");
        let config = prepare(dir.path(), "exec sleep 30\n");
        fs::write(
            &config.manual_queue,
            r#"{"items": [{"sensor_id": "mc", "date": "20220701", "priority": 1}]}"#,
        )
        .unwrap();
        let shutdown = Shutdown::new();
        let orchestrator = build(&config, shutdown.clone());

        let handle = orchestrator
            .launch(WorkItem::manual("mc", parse_date("20220701").unwrap(), 1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));
        shutdown.trigger();
        assert_eq!(handle.wait(), Outcome::Cancelled);
        orchestrator.wait_idle();

        assert!(!config.data.results.join("mc").exists());
        assert_eq!(fs::read_dir(config.state.archive_dir()).unwrap().count(), 1);
        assert!(statuses(&config)[0].process_end_time.is_some());
        let remaining = ManualQueue::new(&config.manual_queue, Duration::from_secs(1))
            .load(&config.sensors)
            .unwrap();
        assert_eq!(remaining.len(), 1);

        assert!(matches!(
            orchestrator.launch(WorkItem::discovered("ma", parse_date("20220701").unwrap())),
            Err(OrchestratorError::ShuttingDown(_))
        ));
    }
}
