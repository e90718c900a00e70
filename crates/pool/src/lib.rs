//! Fixed-size worker-thread pool and the [`parallel_for`] range splitter built on top of it.
//!
//! Kernels in `fabric-tensor` and the coordinator's per-connection dispatcher both route their
//! work through a single [`WorkerPool`]: the former for CPU-bound numeric work, the latter for
//! short control-plane closures. The pool itself never interprets what it runs.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use futures::channel::oneshot;

mod range;
pub use range::parallel_for;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool task panicked: {0}")]
    TaskPanicked(String),
    #[error("worker pool shut down before the task completed")]
    ShutDown,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    stopping: AtomicBool,
}

/// A fixed-size pool of OS threads sharing one FIFO queue of boxed closures.
///
/// Construction spawns `n` threads immediately; each parks on the shared queue's condition
/// variable until a job arrives or the pool is dropped. The pool is cheap to share via `Arc`
/// and is the single synchronization point both the coordinator's dispatcher and the tensor
/// kernels submit work through.
pub struct WorkerPool {
    shared: Arc<Shared>,
    num_threads: usize,
    threads: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

impl WorkerPool {
    /// Spawns `num_threads.max(1)` worker threads.
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stopping: AtomicBool::new(false),
        });

        let threads = (0..num_threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("fabric-pool-{i}"))
                    .spawn(move || work_loop(shared))
                    .expect("failed to spawn worker pool thread")
            })
            .collect();

        Self {
            shared,
            num_threads,
            threads: Mutex::new(Some(threads)),
        }
    }

    /// Number of worker threads backing this pool.
    pub fn size(&self) -> usize {
        self.num_threads
    }

    /// Enqueues `f` and returns a handle that resolves once a worker thread has run it.
    ///
    /// A panic inside `f` is captured and surfaced through the returned handle rather than
    /// unwinding the pool thread, so one failing task never poisons the pool.
    pub fn spawn<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            // A dropped receiver (handle discarded) is not an error for the pool.
            let _ = tx.send(result);
        });
        self.enqueue(job);
        TaskHandle { rx }
    }

    fn spawn_boxed(&self, job: Box<dyn FnOnce() + Send + 'static>) -> TaskHandle<()> {
        self.spawn(move || job())
    }

    fn enqueue(&self, job: Job) {
        self.shared.queue.lock().unwrap().push_back(job);
        self.shared.condvar.notify_one();
    }

    /// Runs `f` with a [`Scope`] that lets the caller submit closures borrowing local data.
    ///
    /// All closures spawned on the scope are guaranteed to complete before `scope` returns, so
    /// it is sound for them to borrow from the enclosing stack frame even though the pool's
    /// threads are long-lived and outlive any single call.
    pub fn scope<'env, F, R>(&self, f: F) -> R
    where
        F: for<'scope> FnOnce(&Scope<'scope, 'env>) -> R,
    {
        let scope = Scope {
            pool: self,
            handles: Mutex::new(Vec::new()),
            _scope: PhantomData,
            _env: PhantomData,
        };
        let result = f(&scope);
        let handles = scope.handles.into_inner().unwrap();
        for handle in handles {
            if let Err(err) = handle.join() {
                // A scoped task failing is a programming error in the kernel, not a runtime
                // condition callers can recover from: the borrowed data it was operating on is
                // in an unknown state.
                panic!("worker pool task panicked inside scope: {err}");
            }
        }
        result
    }
}

fn work_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut guard = shared.queue.lock().unwrap();
            loop {
                if let Some(job) = guard.pop_front() {
                    break Some(job);
                }
                if shared.stopping.load(Ordering::Acquire) {
                    break None;
                }
                guard = shared.condvar.wait(guard).unwrap();
            }
        };
        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.condvar.notify_all();
        if let Some(threads) = self.threads.lock().unwrap().take() {
            for handle in threads {
                // Tasks still queued at this point are dropped, per contract.
                let _ = handle.join();
            }
        }
    }
}

/// A scope tied to one [`WorkerPool::scope`] call; every closure spawned on it is joined before
/// that call returns.
pub struct Scope<'scope, 'env: 'scope> {
    pool: &'scope WorkerPool,
    handles: Mutex<Vec<TaskHandle<()>>>,
    _scope: PhantomData<&'scope mut &'scope ()>,
    _env: PhantomData<&'env ()>,
}

impl<'scope, 'env> Scope<'scope, 'env> {
    /// Submits `f` to the pool. `f` may borrow anything that outlives the scope.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'scope,
    {
        let boxed: Box<dyn FnOnce() + Send + 'scope> = Box::new(f);
        // SAFETY: `WorkerPool::scope` joins every handle pushed here before it returns, so the
        // artificially extended 'static lifetime never outlives the real 'scope borrows that
        // `f` captured.
        let boxed: Box<dyn FnOnce() + Send + 'static> =
            unsafe { std::mem::transmute(boxed) };
        let handle = self.pool.spawn_boxed(boxed);
        self.handles.lock().unwrap().push(handle);
    }
}

/// A future (and, for non-async callers, a blocking join point) for one submitted task.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<thread::Result<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(Ok(value)),
            Poll::Ready(Ok(Err(panic))) => Poll::Ready(Err(PoolError::TaskPanicked(describe_panic(panic)))),
            Poll::Ready(Err(_canceled)) => Poll::Ready(Err(PoolError::ShutDown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> TaskHandle<T> {
    /// Blocks the current (non-async) thread until the task completes.
    ///
    /// Kernels call tensor ops from plain synchronous code, so `parallel_for` needs a way to
    /// wait on pool futures without an `async` executor in scope.
    pub fn join(self) -> Result<T, PoolError> {
        futures::executor::block_on(self)
    }
}

fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use test_log::test;

    #[test]
    fn runs_tasks_and_returns_results() {
        let pool = WorkerPool::new(4);
        let handles: Vec<_> = (0..16).map(|i| pool.spawn(move || i * i)).collect();
        let mut results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, (0..16).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn captures_panics_without_poisoning_the_pool() {
        let pool = WorkerPool::new(2);
        let failed = pool.spawn(|| -> i32 { panic!("boom") });
        assert!(matches!(failed.join(), Err(PoolError::TaskPanicked(_))));

        // The pool must still be usable after a task panicked.
        let ok = pool.spawn(|| 7);
        assert_eq!(ok.join().unwrap(), 7);
    }

    #[test]
    fn scope_allows_borrowed_closures() {
        let pool = WorkerPool::new(4);
        let counters: Vec<AtomicUsize> = (0..8).map(|_| AtomicUsize::new(0)).collect();
        pool.scope(|s| {
            for c in &counters {
                s.spawn(|| {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        for c in &counters {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn size_reports_thread_count() {
        let pool = WorkerPool::new(5);
        assert_eq!(pool.size(), 5);
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
