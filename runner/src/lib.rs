pub mod checker;
pub mod collector;
pub mod config;
pub mod container;
pub mod executors;
pub mod ledger;
pub mod manual_queue;
pub mod metadata;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod shutdown;
pub mod sync;
pub mod work;
