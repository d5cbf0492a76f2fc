//! Dispatch workers.
//!
//! `WorkerPool` leases batches from the queue and `DispatchWorker` delivers
//! them, settling each message on its own.

mod dispatch;
mod pool;

pub use dispatch::{BatchItemFailure, BatchResponse, DispatchConfig, DispatchWorker};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolReport};
