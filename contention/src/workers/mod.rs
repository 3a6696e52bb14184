//! Update workers and the pool supervising them.

pub mod pool;
pub mod update;

pub use pool::{UpdateWorkerHandle, WorkerCompletion, WorkerPool};
pub use update::{UpdateWorker, UpdateWorkerConfig, WorkerExit, WorkerId, WorkerReport};
