use super::{ExecutorError, Invocation, Outcome};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    fs::File,
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Counting gate bounding the number of concurrently running jobs
#[derive(Debug)]
pub struct SlotGate {
    capacity: usize,
    running: Mutex<usize>,
    changed: Condvar,
}

/// A held slot, returned to the gate when dropped
#[derive(Debug)]
pub struct SlotPermit {
    gate: Arc<SlotGate>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let mut running = self.gate.running.lock();
        *running = running.saturating_sub(1);
        self.gate.changed.notify_all();
    }
}

impl SlotGate {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            running: Mutex::new(0),
            changed: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running(&self) -> usize {
        *self.running.lock()
    }

    /// block until a slot is free and take it
    pub fn acquire(self: &Arc<Self>) -> SlotPermit {
        let mut running = self.running.lock();

        while *running >= self.capacity {
            self.changed.wait(&mut running);
        }
        *running += 1;

        SlotPermit { gate: self.clone() }
    }

    /// block until every slot is free
    pub fn wait_idle(&self) {
        let mut running = self.running.lock();

        while *running > 0 {
            self.changed.wait(&mut running);
        }
    }
}

/// Runs jobs on a local thread pool, never more than `parallelism` at once
pub struct LocalExecutor {
    pool: ThreadPool,
    gate: Arc<SlotGate>,
}

impl LocalExecutor {
    pub fn new(parallelism: usize) -> Result<Self, ExecutorError> {
        let gate = SlotGate::new(parallelism);
        debug!("Starting thread pool with {} threads", gate.capacity());

        let pool = ThreadPoolBuilder::new()
            .num_threads(gate.capacity())
            .thread_name(|index| format!("retrieval-worker-{index}"))
            .panic_handler(|_| error!("A retrieval worker panicked, its slot was released"))
            .build()?;

        Ok(Self { pool, gate })
    }

    pub fn parallelism(&self) -> usize {
        self.gate.capacity()
    }

    pub fn running(&self) -> usize {
        self.gate.running()
    }

    /// block until a slot is free, the slot is held until the permit is dropped
    pub fn reserve(&self) -> SlotPermit {
        self.gate.acquire()
    }

    /// run `job` on the pool in the slot held by `permit`
    pub fn execute<F>(&self, permit: SlotPermit, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(move || {
            job();
            drop(permit);
        });
    }

    /// Wait for a free slot, then run `job` on the pool.
    /// The calling thread only blocks while all slots are taken.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permit = self.reserve();
        self.execute(permit, job);
    }

    /// block until all spawned jobs have finished
    pub fn wait_idle(&self) {
        self.gate.wait_idle();
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// time between SIGTERM and SIGKILL when stopping an algorithm
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

fn classify(status: ExitStatus) -> Outcome {
    match status.code() {
        Some(0) => Outcome::Success,
        code => Outcome::Failure(code),
    }
}

fn log_file(path: &std::path::Path) -> Result<File, ExecutorError> {
    File::create(path).map_err(|source| ExecutorError::Logs {
        path: path.to_path_buf(),
        source,
    })
}

/// SIGTERM the algorithm's process group, SIGKILL it if it is still alive after the grace period
fn terminate(child: &mut Child) -> Result<(), ExecutorError> {
    let group = Pid::from_raw(child.id() as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!("Failed to signal process group {group}: {e}");
    }
    if child
        .wait_timeout(TERMINATION_GRACE)
        .map_err(ExecutorError::Wait)?
        .is_none()
    {
        warn!("Algorithm ignored SIGTERM for {TERMINATION_GRACE:?}, killing it");
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            debug!("Failed to kill process group {group}: {e}");
        }
        child.wait().map_err(ExecutorError::Wait)?;
    }

    Ok(())
}

/// wait for the child, stopping it on timeout or shutdown
fn supervise(child: &mut Child, invocation: &Invocation) -> Result<Outcome, ExecutorError> {
    let deadline = invocation.timeout.map(|timeout| Instant::now() + timeout);

    loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL).map_err(ExecutorError::Wait)? {
            return Ok(classify(status));
        }

        if invocation.shutdown.is_triggered() {
            warn!("Shutdown requested, terminating algorithm");
            terminate(child)?;
            return Ok(Outcome::Cancelled);
        }

        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            warn!(
                "Algorithm exceeded its timeout of {:?}, terminating it",
                invocation.timeout.unwrap_or_default()
            );
            terminate(child)?;
            return Ok(Outcome::Failure(None));
        }
    }
}

/// Run the algorithm as `exec [params] <container_dir> <container_id> <config_path>` inside the
/// container, capturing stdout and stderr into the given files.
/// The algorithm gets its own process group so it can be stopped together with its children.
#[instrument(skip_all, fields(container = %invocation.container_id), level = "info")]
pub fn run_algorithm(invocation: &Invocation) -> Result<Outcome, ExecutorError> {
    if invocation.shutdown.is_triggered() {
        debug!("Shutdown requested, not starting the algorithm");
        return Ok(Outcome::Cancelled);
    }

    let start = Instant::now();
    let mut child = Command::new(&invocation.exec)
        .args(invocation.params.iter())
        .arg(&invocation.container_dir)
        .arg(&invocation.container_id)
        .arg(&invocation.config_path)
        .current_dir(&invocation.container_dir)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(log_file(&invocation.stdout)?)
        .stderr(log_file(&invocation.stderr)?)
        .spawn()
        .map_err(|source| ExecutorError::Spawn {
            exec: invocation.exec.clone(),
            source,
        })?;

    let outcome = supervise(&mut child, invocation)?;

    info!(
        exit_code = ?outcome.exit_code(),
        "Algorithm finished in {:.1}s",
        start.elapsed().as_secs_f64()
    );

    Ok(outcome)
}
