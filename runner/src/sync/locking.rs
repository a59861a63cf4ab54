use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
};
use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to open lock file {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Timed out after {0:?} waiting for the lock")]
    Timeout(Duration),
    #[error("flock failed: {0}")]
    Flock(#[from] Errno),
    #[error("Another scheduler instance is already running ({0})")]
    AlreadyRunning(String),
    #[error("Failed to record pid in lock file: {0}")]
    Io(#[from] std::io::Error),
}

/// Advisory, exclusive file lock with a bounded wait
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
}

/// Held lock, released when dropped
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            Ok(()) => debug!(path = ?self.path, "Released lock"),
            // closing the descriptor releases the lock anyway
            Err(errno) => debug!(path = ?self.path, errno = ?errno, "Explicit unlock failed"),
        }
    }
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    /// lock file guarding `resource`, e.g. `active-processes.json.lock`
    pub fn for_resource(resource: &Path, timeout: Duration) -> Self {
        let mut path = resource.as_os_str().to_owned();
        path.push(".lock");

        Self::new(PathBuf::from(path), timeout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })?;
        let start = Instant::now();

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    return Ok(LockGuard {
                        file,
                        path: self.path.clone(),
                    })
                }
                Err(Errno::EINTR) => continue,
                Err(errno) if errno == Errno::EWOULDBLOCK => {
                    let elapsed = start.elapsed();

                    if elapsed >= self.timeout {
                        return Err(LockError::Timeout(self.timeout));
                    }

                    thread::sleep(POLL_INTERVAL.min(self.timeout - elapsed));
                }
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Run `f` while holding the lock.
    /// Returns `None` (and logs) if the lock could not be acquired, the caller treats the
    /// resource as busy and skips the operation.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        match self.acquire() {
            Ok(guard) => {
                let result = f();
                drop(guard);

                Some(result)
            }
            Err(LockError::Timeout(timeout)) => {
                warn!(path = ?self.path, "Lock busy for {timeout:?}, skipping operation");
                None
            }
            Err(e) => {
                error!(path = ?self.path, "Failed to acquire lock, skipping operation: {e}");
                None
            }
        }
    }
}

/// Process wide lock gating "is a scheduler already running"
#[derive(Debug)]
pub struct InstanceLock {
    _guard: LockGuard,
}

impl InstanceLock {
    /// acquire without waiting and record our pid in the lock file
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let lock = FileLock::new(path, Duration::ZERO);

        match lock.acquire() {
            Ok(mut guard) => {
                guard.file.set_len(0)?;
                guard.file.seek(SeekFrom::Start(0))?;
                write!(guard.file, "{}", std::process::id())?;
                guard.file.flush()?;

                Ok(Self { _guard: guard })
            }
            Err(LockError::Timeout(_)) => {
                let holder = Self::read_pid(path)
                    .map(|pid| format!("pid {pid}"))
                    .unwrap_or_else(|| String::from("unknown pid"));

                Err(LockError::AlreadyRunning(holder))
            }
            Err(e) => Err(e),
        }
    }

    /// pid of the process holding (or last holding) the lock
    pub fn read_pid(path: &Path) -> Option<i32> {
        let mut content = String::new();
        File::open(path).ok()?.read_to_string(&mut content).ok()?;

        content.trim().parse().ok()
    }

    /// whether some process currently holds the lock
    pub fn is_held(path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }

        matches!(
            FileLock::new(path, Duration::ZERO).acquire(),
            Err(LockError::Timeout(_))
        )
    }
}
