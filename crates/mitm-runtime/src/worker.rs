//! Background worker
//!
//! One long-lived thread running deferred tasks in FIFO order so IPC
//! dispatch threads never block on slow work. Tasks are queued on a
//! lock-free `SegQueue`; the worker parks with a timeout when idle.
//!
//! Shutdown closes the queue to new work, then the worker drains what is
//! already queued and exits. A task enqueued concurrently with shutdown
//! either runs or is refused with `WorkerClosedError`, never lost: the
//! `enqueuing` counter keeps the worker alive until in-flight pushes land.

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mitm_core::{kdebug, kerror, kinfo, WorkerClosedError};

use crate::config::WorkerConfig;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Counters returned by [`BackgroundWorker::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub executed: u64,
    pub panicked: u64,
}

struct Inner {
    queue: SegQueue<Task>,
    closed: AtomicBool,
    enqueuing: AtomicUsize,
    executed: AtomicU64,
    panicked: AtomicU64,
    idle: Duration,
    thread: Mutex<Option<Thread>>,
}

impl Inner {
    fn unpark(&self) {
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(t) = thread.as_ref() {
            t.unpark();
        }
    }

    fn enqueue(&self, task: Task) -> Result<(), WorkerClosedError> {
        self.enqueuing.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.enqueuing.fetch_sub(1, Ordering::SeqCst);
            return Err(WorkerClosedError);
        }
        self.queue.push(task);
        self.enqueuing.fetch_sub(1, Ordering::SeqCst);
        self.unpark();
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic"
    }
}

fn worker_loop(inner: Arc<Inner>) {
    kdebug!("background worker started");
    loop {
        match inner.queue.pop() {
            Some(task) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    kerror!("background task panicked: {}", panic_message(&*payload));
                    inner.panicked.fetch_add(1, Ordering::Relaxed);
                }
                inner.executed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                if inner.closed.load(Ordering::SeqCst)
                    && inner.enqueuing.load(Ordering::SeqCst) == 0
                    && inner.queue.is_empty()
                {
                    break;
                }
                thread::park_timeout(inner.idle);
            }
        }
    }
    kdebug!("background worker exiting");
}

pub struct BackgroundWorker {
    inner: Arc<Inner>,
    join: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn start(config: &WorkerConfig) -> io::Result<Self> {
        let inner = Arc::new(Inner {
            queue: SegQueue::new(),
            closed: AtomicBool::new(false),
            enqueuing: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            idle: config.idle,
            thread: Mutex::new(None),
        });

        let worker_inner = Arc::clone(&inner);
        let join = thread::Builder::new()
            .name("mitm-background".to_string())
            .stack_size(config.stack_size)
            .spawn(move || worker_loop(worker_inner))?;

        *inner.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(join.thread().clone());

        Ok(Self {
            inner,
            join: Some(join),
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Refuse new tasks, run the queued ones, join the thread.
    pub fn shutdown(mut self) -> WorkerStats {
        self.close_and_join();
        WorkerStats {
            executed: self.inner.executed.load(Ordering::Relaxed),
            panicked: self.inner.panicked.load(Ordering::Relaxed),
        }
    }

    fn close_and_join(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.unpark();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                kerror!("background worker thread panicked");
            }
            kinfo!(
                "background worker stopped after {} tasks",
                self.inner.executed.load(Ordering::Relaxed)
            );
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.close_and_join();
    }
}

/// Cloneable enqueue access.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<Inner>,
}

impl WorkerHandle {
    /// Queue a fire-and-forget task. Never runs it inline.
    pub fn enqueue<F>(&self, task: F) -> Result<(), WorkerClosedError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.enqueue(Box::new(task))
    }

    /// Queue a task whose result is delivered through the receipt.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskReceipt<T>, WorkerClosedError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.inner.enqueue(Box::new(move || {
            // Receipt may have been dropped.
            let _ = tx.send(task());
        }))?;
        Ok(TaskReceipt { rx })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("queued", &self.inner.queue.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Result side channel of a submitted task.
///
/// Waiting yields `None` if the task panicked.
pub struct TaskReceipt<T> {
    rx: Receiver<T>,
}

impl<T> TaskReceipt<T> {
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// `Err(self)` on timeout so the caller can keep waiting.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Option<T>, Self> {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => Ok(Some(v)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig::new().idle(Duration::from_millis(5))
    }

    #[test]
    fn test_fifo_order() {
        let worker = BackgroundWorker::start(&config()).unwrap();
        let handle = worker.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 1..=3 {
            let seen = seen.clone();
            handle
                .enqueue(move || seen.lock().unwrap().push(i))
                .unwrap();
        }
        let stats = worker.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(stats.executed, 3);
    }

    #[test]
    fn test_enqueue_never_runs_inline() {
        let worker = BackgroundWorker::start(&config()).unwrap();
        let caller = thread::current().id();
        let receipt = worker
            .handle()
            .submit(move || thread::current().id() != caller)
            .unwrap();
        assert_eq!(receipt.wait(), Some(true));
        worker.shutdown();
    }

    #[test]
    fn test_closed_after_shutdown() {
        let worker = BackgroundWorker::start(&config()).unwrap();
        let handle = worker.handle();
        worker.shutdown();
        assert!(handle.is_closed());
        assert_eq!(handle.enqueue(|| {}), Err(WorkerClosedError));
        assert!(handle.submit(|| 1).is_err());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let worker = BackgroundWorker::start(&config()).unwrap();
        let handle = worker.handle();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let count = count.clone();
            handle
                .enqueue(move || {
                    thread::sleep(Duration::from_millis(1));
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let stats = worker.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 20);
        assert_eq!(stats.executed, 20);
    }

    #[test]
    fn test_panic_is_contained() {
        let worker = BackgroundWorker::start(&config()).unwrap();
        let handle = worker.handle();
        let receipt = handle.submit(|| -> u32 { panic!("task failure") }).unwrap();
        assert_eq!(receipt.wait(), None);

        let after = handle.submit(|| 42).unwrap();
        assert_eq!(after.wait(), Some(42));

        let stats = worker.shutdown();
        assert_eq!(stats, WorkerStats { executed: 2, panicked: 1 });
    }

    #[test]
    fn test_wait_timeout_returns_receipt() {
        let worker = BackgroundWorker::start(&config()).unwrap();
        let receipt = worker
            .handle()
            .submit(|| {
                thread::sleep(Duration::from_millis(100));
                5
            })
            .unwrap();
        let receipt = match receipt.wait_timeout(Duration::from_millis(1)) {
            Err(r) => r,
            Ok(v) => panic!("finished too early: {:?}", v),
        };
        assert_eq!(receipt.wait(), Some(5));
        worker.shutdown();
    }
}
