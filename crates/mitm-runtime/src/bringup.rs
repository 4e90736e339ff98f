//! One-shot bring-up tasks
//!
//! Each task runs once on its own thread. Two explicit choices per task:
//!
//! - [`Ownership`]: `Joined` tasks are waited for by [`BringUp::join`];
//!   `Detached` tasks are left to finish on their own.
//! - [`Criticality`]: a failing `Fatal` task invokes the `on_fatal` hook
//!   (typically a manager shutdown request); an `Optional` one is logged.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use mitm_core::{kdebug, kerror, kwarn};

pub type TaskError = Box<dyn Error + Send + Sync + 'static>;
pub type FatalHook = Arc<dyn Fn(&BringUpError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Joined,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    Fatal,
    Optional,
}

#[derive(Debug)]
pub enum BringUpError {
    Spawn {
        task: String,
        source: io::Error,
    },
    Failed {
        task: String,
        criticality: Criticality,
        reason: String,
    },
    Panicked {
        task: String,
        criticality: Criticality,
        message: String,
    },
}

impl BringUpError {
    pub fn task(&self) -> &str {
        match self {
            Self::Spawn { task, .. } | Self::Failed { task, .. } | Self::Panicked { task, .. } => {
                task
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Spawn { .. } => true,
            Self::Failed { criticality, .. } | Self::Panicked { criticality, .. } => {
                *criticality == Criticality::Fatal
            }
        }
    }
}

impl fmt::Display for BringUpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { task, source } => write!(f, "{}: spawn failed: {}", task, source),
            Self::Failed { task, reason, .. } => write!(f, "{}: {}", task, reason),
            Self::Panicked { task, message, .. } => write!(f, "{}: panicked: {}", task, message),
        }
    }
}

impl Error for BringUpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Outcome of the joined tasks plus detached failures seen so far.
#[derive(Debug, Default)]
pub struct BringUpReport {
    pub completed: Vec<String>,
    pub failures: Vec<BringUpError>,
    pub detached: usize,
}

impl BringUpReport {
    /// First failure of a `Fatal` task.
    pub fn fatal(&self) -> Option<&BringUpError> {
        self.failures.iter().find(|e| e.is_fatal())
    }
}

fn take_all<T>(m: &Mutex<Vec<T>>) -> Vec<T> {
    std::mem::take(&mut *m.lock().unwrap_or_else(PoisonError::into_inner))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic".to_string()
    }
}

pub struct BringUp {
    stack_size: usize,
    on_fatal: Option<FatalHook>,
    joined: Vec<(String, JoinHandle<()>)>,
    detached: usize,
    failures: Arc<Mutex<Vec<BringUpError>>>,
    completed: Arc<Mutex<Vec<String>>>,
}

impl BringUp {
    pub fn new(stack_size: usize) -> Self {
        Self {
            stack_size,
            on_fatal: None,
            joined: Vec::new(),
            detached: 0,
            failures: Arc::new(Mutex::new(Vec::new())),
            completed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn on_fatal(mut self, hook: FatalHook) -> Self {
        self.on_fatal = Some(hook);
        self
    }

    pub fn spawn<F>(
        &mut self,
        name: &str,
        ownership: Ownership,
        criticality: Criticality,
        task: F,
    ) -> Result<(), BringUpError>
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        let task_name = name.to_string();
        let hook = self.on_fatal.clone();
        let failures = Arc::clone(&self.failures);
        let completed = Arc::clone(&self.completed);

        let body = move || {
            kdebug!("bring-up task {} started", task_name);
            let error = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(BringUpError::Failed {
                    task: task_name.clone(),
                    criticality,
                    reason: e.to_string(),
                }),
                Err(payload) => Some(BringUpError::Panicked {
                    task: task_name.clone(),
                    criticality,
                    message: panic_message(&*payload),
                }),
            };
            match error {
                None => {
                    kdebug!("bring-up task {} finished", task_name);
                    completed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(task_name);
                }
                Some(err) => {
                    if err.is_fatal() {
                        kerror!("fatal bring-up failure: {}", err);
                        if let Some(hook) = hook.as_ref() {
                            hook(&err);
                        }
                    } else {
                        kwarn!("optional bring-up task failed: {}", err);
                    }
                    failures
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(err);
                }
            }
        };

        let handle = thread::Builder::new()
            .name(format!("bringup-{}", name))
            .stack_size(self.stack_size)
            .spawn(body)
            .map_err(|source| BringUpError::Spawn {
                task: name.to_string(),
                source,
            })?;

        match ownership {
            Ownership::Joined => self.joined.push((name.to_string(), handle)),
            Ownership::Detached => self.detached += 1,
        }
        Ok(())
    }

    /// Wait for every `Joined` task.
    pub fn join(self) -> BringUpReport {
        for (name, handle) in self.joined {
            if handle.join().is_err() {
                kerror!("bring-up thread {} died outside its task", name);
            }
        }
        BringUpReport {
            completed: take_all(&self.completed),
            failures: take_all(&self.failures),
            detached: self.detached,
        }
    }
}
