//! Library defaults, overridable through `MITM_*` environment variables.

/// Manager waiter threads.
pub const NUM_THREADS: usize = 5;

/// Upper bound on one wait before re-checking shutdown.
pub const WAIT_TIMEOUT_MS: u64 = 500;

/// Stack size of manager and bring-up threads.
pub const THREAD_STACK_SIZE: usize = 0x20000;

pub const WORKER_STACK_SIZE: usize = 0x20000;

/// How long the background worker parks when its queue is empty.
pub const WORKER_IDLE_MS: u64 = 50;

pub const MAX_THREADS: usize = 64;
pub const MIN_STACK_SIZE: usize = 0x4000;
