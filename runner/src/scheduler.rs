use crate::{
    checker::{FilesystemChecker, NoProfileSource},
    collector::DirectoryCollector,
    config::{ConfigErrors, SchedulerConfig},
    executors::Outcome,
    ledger::{InputWarningLedger, RetrievalStatusLedger},
    manual_queue::ManualQueue,
    metadata::{JsonMetadata, MetadataError, MetadataProvider},
    orchestrator::{Orchestrator, OrchestratorError, RunHandle},
    queue::RetrievalQueue,
    shutdown::Shutdown,
    sync::{InstanceLock, LockError},
    work::WorkItem,
};
use std::{fs, io, sync::Arc};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Failed to load metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("discovery.from_date ({0}) is not a valid date")]
    InvalidDate(String),
    #[error("Failed to prepare state directory: {0}")]
    State(io::Error),
}

/// Counts of one scheduler run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub not_launched: usize,
    /// stopped by a shutdown request, their dates stay pending
    pub cancelled: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    shutdown: Shutdown,
}

impl Scheduler {
    /// Refuses configs that fail the preflight checks
    pub fn new(mut config: SchedulerConfig) -> Result<Self, SchedulerError> {
        if config.preflight_checks() {
            return Err(ConfigErrors::PreflightFailed.into());
        }

        Ok(Self {
            config,
            shutdown: Shutdown::new(),
        })
    }

    /// stop dispatching and terminate running algorithms once `shutdown` is triggered
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn metadata(&self) -> Result<Arc<dyn MetadataProvider>, SchedulerError> {
        Ok(Arc::new(JsonMetadata::load(&self.config.data.metadata)?))
    }

    fn build_queue(&self, metadata: Arc<dyn MetadataProvider>) -> Result<RetrievalQueue, SchedulerError> {
        let config = &self.config;
        let lock_timeout = config.state.lock_timeout();
        let collector = DirectoryCollector::new(config)
            .ok_or_else(|| SchedulerError::InvalidDate(config.discovery.from_date.clone()))?;
        let checker = FilesystemChecker::new(config, metadata, Arc::new(NoProfileSource));

        Ok(RetrievalQueue::new(
            config.sensors.clone(),
            Box::new(collector),
            Box::new(checker),
            InputWarningLedger::new(config.state.warnings_path(), lock_timeout),
        )
        .with_manual_queue(
            ManualQueue::new(&config.manual_queue, lock_timeout),
            config.queue.defer_negative_priority,
        ))
    }

    /// The order in which items would be dispatched right now, nothing is launched
    #[instrument(skip_all)]
    pub fn preview_queue(&self) -> Result<Vec<WorkItem>, SchedulerError> {
        Ok(self.build_queue(self.metadata()?)?.collect())
    }

    /// Drain the queue, running every item in its own container, and wait for all runs
    #[instrument(skip_all, fields(parallelism = self.config.parallelism))]
    pub fn run(&self) -> Result<RunSummary, SchedulerError> {
        let config = &self.config;
        fs::create_dir_all(&config.state.dir).map_err(SchedulerError::State)?;
        let _instance = InstanceLock::acquire(&config.state.instance_lock_path())?;

        let metadata = self.metadata()?;

        let status = RetrievalStatusLedger::new(config.state.status_path(), config.state.lock_timeout());
        for orphan in status.orphaned() {
            warn!(
                sensor = %orphan.sensor_id,
                date = %orphan.from_datetime.format("%Y%m%d"),
                container = ?orphan.container_id,
                "Retrieval of a previous run never finished"
            );
        }
        status.reset();

        let orchestrator = Orchestrator::new(config, metadata.clone(), self.shutdown.clone())?;
        let archived = orchestrator.factory().archive_leftovers();
        if archived > 0 {
            warn!("Archived {archived} containers left over by a previous run");
        }

        let mut summary = RunSummary::default();
        let mut handles: Vec<RunHandle> = Vec::new();

        for item in self.build_queue(metadata)? {
            if self.shutdown.is_triggered() {
                break;
            }

            match orchestrator.launch(item.clone()) {
                Ok(handle) => handles.push(handle),
                Err(OrchestratorError::ShuttingDown(_)) => break,
                Err(e) => {
                    error!(item = %item, "Failed to launch retrieval: {e}");
                    summary.not_launched += 1;
                }
            }
        }

        if self.shutdown.is_triggered() {
            warn!("Shutdown requested, waiting for {} runs to stop", orchestrator.running());
        } else {
            info!("Queue is exhausted, waiting for {} runs", orchestrator.running());
        }
        for handle in handles {
            match handle.wait() {
                Outcome::Success => summary.succeeded += 1,
                Outcome::Failure(_) => summary.failed += 1,
                Outcome::Cancelled => summary.cancelled += 1,
            }
        }
        orchestrator.wait_idle();

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            not_launched = summary.not_launched,
            cancelled = summary.cancelled,
            "All retrievals finished"
        );

        Ok(summary)
    }
}
