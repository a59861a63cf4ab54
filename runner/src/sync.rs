pub mod locking;

pub use locking::{FileLock, InstanceLock, LockError, LockGuard};
