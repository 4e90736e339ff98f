//! Runtime configuration
//!
//! Library defaults with environment overrides, then builder tweaks:
//!
//! ```rust,ignore
//! use mitm_runtime::config::ManagerConfig;
//!
//! let config = ManagerConfig::from_env().num_threads(3);
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use mitm_core::env::{env_get, env_get_ms};

/// Waitable manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Threads that take turns waiting and then handle what became ready
    pub num_threads: usize,
    /// Per-wait bound; `None` waits until readiness or an explicit wakeup
    pub wait_timeout: Option<Duration>,
    pub thread_stack_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ManagerConfig {
    /// Defaults with environment overrides.
    ///
    /// - `MITM_NUM_THREADS`
    /// - `MITM_WAIT_TIMEOUT_MS` (0 = no timeout)
    /// - `MITM_THREAD_STACK_SIZE`
    pub fn from_env() -> Self {
        let timeout_ms: u64 = env_get("MITM_WAIT_TIMEOUT_MS", defaults::WAIT_TIMEOUT_MS);
        Self {
            num_threads: env_get("MITM_NUM_THREADS", defaults::NUM_THREADS),
            wait_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            thread_stack_size: env_get("MITM_THREAD_STACK_SIZE", defaults::THREAD_STACK_SIZE),
        }
    }

    /// Defaults only, no environment.
    pub fn new() -> Self {
        Self {
            num_threads: defaults::NUM_THREADS,
            wait_timeout: Some(Duration::from_millis(defaults::WAIT_TIMEOUT_MS)),
            thread_stack_size: defaults::THREAD_STACK_SIZE,
        }
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::InvalidValue("num_threads must be > 0"));
        }
        if self.num_threads > defaults::MAX_THREADS {
            return Err(ConfigError::InvalidValue("num_threads must be <= 64"));
        }
        if let Some(t) = self.wait_timeout {
            if t.is_zero() {
                return Err(ConfigError::InvalidValue("wait_timeout must be > 0 when set"));
            }
            if t.as_millis() > u16::MAX as u128 {
                return Err(ConfigError::InvalidValue("wait_timeout must be <= 65535ms"));
            }
        }
        if self.thread_stack_size < defaults::MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("thread_stack_size must be >= 16KB"));
        }
        Ok(())
    }

    pub fn print(&self) {
        eprintln!("Waitable manager configuration:");
        eprintln!("  num_threads:        {}", self.num_threads);
        eprintln!("  wait_timeout:       {:?}", self.wait_timeout);
        eprintln!("  thread_stack_size:  {:#x}", self.thread_stack_size);
    }
}

/// Background worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub stack_size: usize,
    /// Park interval while the queue is empty
    pub idle: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl WorkerConfig {
    /// - `MITM_WORKER_STACK_SIZE`
    /// - `MITM_WORKER_IDLE_MS`
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("MITM_WORKER_STACK_SIZE", defaults::WORKER_STACK_SIZE),
            idle: env_get_ms(
                "MITM_WORKER_IDLE_MS",
                Duration::from_millis(defaults::WORKER_IDLE_MS),
            ),
        }
    }

    pub fn new() -> Self {
        Self {
            stack_size: defaults::WORKER_STACK_SIZE,
            idle: Duration::from_millis(defaults::WORKER_IDLE_MS),
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn idle(mut self, d: Duration) -> Self {
        self.idle = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < defaults::MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.idle.is_zero() {
            return Err(ConfigError::InvalidValue("idle must be > 0"));
        }
        Ok(())
    }

    pub fn print(&self) {
        eprintln!("Background worker configuration:");
        eprintln!("  stack_size:  {:#x}", self.stack_size);
        eprintln!("  idle:        {:?}", self.idle);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
