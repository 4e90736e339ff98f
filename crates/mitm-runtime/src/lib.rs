//! # mitm-runtime — Threads and readiness for the MitM service layer
//!
//! - `event` - level-triggered wakeup fd (eventfd, or a self-pipe elsewhere)
//! - `manager` - `WaitableManager`, the multi-threaded wait/dispatch loop
//! - `worker` - `BackgroundWorker`, one FIFO thread for deferred work
//! - `bringup` - `BringUp`, one-shot startup tasks with explicit ownership
//! - `config` - `ManagerConfig` / `WorkerConfig` with env overrides

pub mod config;
pub mod event;
pub mod manager;
pub mod worker;
pub mod bringup;

pub use config::{ConfigError, ManagerConfig, WorkerConfig};
pub use event::Event;
pub use manager::{ManagerError, ManagerHandle, ManagerStats, WaitableManager};
pub use worker::{BackgroundWorker, TaskReceipt, WorkerHandle, WorkerStats};
pub use bringup::{BringUp, BringUpError, BringUpReport, Criticality, FatalHook, Ownership, TaskError};
