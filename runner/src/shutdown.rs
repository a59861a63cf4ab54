use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::warn;

/// Cooperative stop request shared by the scheduling loop and every running algorithm
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Trigger on SIGINT, SIGTERM and SIGHUP. Only one handler can exist per process.
    pub fn install_handler(&self) -> Result<(), ctrlc::Error> {
        let shutdown = self.clone();

        ctrlc::set_handler(move || {
            warn!("Received termination signal, stopping running retrievals");
            shutdown.trigger();
        })
    }
}
