//! The proxy task runner.
//!
//! One dedicated OS thread ("felix-proxy") runs a current-thread tokio
//! runtime with a `LocalSet`; every user-visible callback in the runtime
//! executes there, in enqueue order.  Handles are cheap to clone and safe
//! to use from any thread.
//!
//! Quitting drains the queue: tasks posted with a cancel arm resolve their
//! pending callbacks with `Cancelled` instead of running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::trace;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum TaskKind {
    /// Plain closure; dropped silently if the runner quit first.
    Run(Task),
    /// Closure plus a cancel arm fired when the queue is drained on quit.
    Cancellable { run: Task, cancel: Task },
    /// Closure executed after `delay` (dropped, not cancelled, on quit).
    Delayed { run: Task, delay: Duration },
}

impl TaskKind {
    fn cancel(self) {
        if let TaskKind::Cancellable { cancel, .. } = self {
            cancel();
        }
    }
}

#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    tx: mpsc::UnboundedSender<TaskKind>,
    thread_id: ThreadId,
    quitting: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Spawn the proxy thread and return a handle bound to it.
    pub fn spawn() -> TaskRunner {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let quitting = Arc::new(AtomicBool::new(false));
        let quitting_for_loop = quitting.clone();

        let join = std::thread::Builder::new()
            .name("felix-proxy".to_owned())
            .spawn(move || {
                ready_tx
                    .send(std::thread::current().id())
                    .expect("runner parent vanished before spawn completed");
                dispatch_loop(rx, &quitting_for_loop);
            })
            .expect("failed to spawn proxy thread");

        let thread_id = ready_rx
            .recv()
            .expect("proxy thread died before reporting its id");

        TaskRunner {
            inner: Arc::new(RunnerInner {
                tx,
                thread_id,
                quitting,
                join: Mutex::new(Some(join)),
            }),
        }
    }

    pub fn is_bound_to_current_thread(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// Enqueue a closure.  Returns false if the runner has quit.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.inner.tx.send(TaskKind::Run(Box::new(task))).is_ok()
    }

    /// Enqueue a closure with a cancel arm.  Exactly one of the two runs:
    /// `run`, in order on the proxy thread, or `cancel` when the runner is
    /// quitting.
    pub fn post_cancellable(
        &self,
        run: impl FnOnce() + Send + 'static,
        cancel: impl FnOnce() + Send + 'static,
    ) -> bool {
        if self.inner.quitting.load(Ordering::Acquire) {
            cancel();
            return false;
        }
        match self.inner.tx.send(TaskKind::Cancellable {
            run: Box::new(run),
            cancel: Box::new(cancel),
        }) {
            Ok(()) => true,
            Err(e) => {
                e.0.cancel();
                false
            }
        }
    }

    /// Enqueue a closure to run after `delay`.
    pub fn post_delayed(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> bool {
        self.inner
            .tx
            .send(TaskKind::Delayed {
                run: Box::new(task),
                delay,
            })
            .is_ok()
    }

    /// Ask the dispatcher to stop after the task it is currently running.
    /// Queued cancellable tasks resolve with their cancel arm; everything
    /// else is dropped.  Safe to call from any thread, repeatedly.
    pub fn quit(&self) {
        self.inner.quitting.store(true, Ordering::Release);
        // Wake the dispatcher in case the queue is empty.
        let _ = self.inner.tx.send(TaskKind::Run(Box::new(|| {})));
    }

    pub fn is_quitting(&self) -> bool {
        self.inner.quitting.load(Ordering::Acquire)
    }

    /// Block until the proxy thread has exited.  Must not be called from
    /// the proxy thread itself.
    pub fn join(&self) {
        assert!(
            !self.is_bound_to_current_thread(),
            "joining the proxy thread from itself would deadlock"
        );
        let handle = self
            .inner
            .join
            .lock()
            .expect("runner join lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Runs on the proxy thread for the runner's whole life.
fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<TaskKind>, quitting: &AtomicBool) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build proxy runtime");
    let local = LocalSet::new();

    local.block_on(&rt, async {
        while let Some(task) = rx.recv().await {
            if quitting.load(Ordering::Acquire) {
                task.cancel();
                break;
            }
            match task {
                TaskKind::Run(run) => run(),
                TaskKind::Cancellable { run, .. } => run(),
                TaskKind::Delayed { run, delay } => {
                    tokio::task::spawn_local(async move {
                        tokio::time::sleep(delay).await;
                        run();
                    });
                }
            }
            // Let spawned locals make progress between queued closures.
            tokio::task::yield_now().await;
            if quitting.load(Ordering::Acquire) {
                break;
            }
        }

        // Drain: resolve cancellable tasks, drop the rest.
        rx.close();
        while let Ok(task) = rx.try_recv() {
            task.cancel();
        }
        trace!("proxy task runner drained");
    });
}

/// Completion callback resolved with a [`felix_protocol::Status`].
pub type StatusCallback = Box<dyn FnOnce(felix_protocol::Status) + Send + 'static>;

/// A one-shot callback that may be resolved from either the run or the
/// cancel arm of a posted task; whichever fires first wins.
pub(crate) struct SharedOnce<T> {
    slot: Arc<Mutex<Option<Box<dyn FnOnce(T) + Send + 'static>>>>,
}

impl<T> Clone for SharedOnce<T> {
    fn clone(&self) -> Self {
        SharedOnce {
            slot: self.slot.clone(),
        }
    }
}

impl<T> SharedOnce<T> {
    pub(crate) fn new(done: Box<dyn FnOnce(T) + Send + 'static>) -> Self {
        SharedOnce {
            slot: Arc::new(Mutex::new(Some(done))),
        }
    }

    pub(crate) fn invoke(&self, value: T) {
        let done = self.slot.lock().expect("shared callback poisoned").take();
        if let Some(done) = done {
            done(value);
        }
    }
}

/// [`SharedOnce`] specialised to status completions.
pub(crate) type SharedDone = SharedOnce<felix_protocol::Status>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_run_in_enqueue_order_on_the_proxy_thread() {
        let runner = TaskRunner::spawn();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        for i in 0..10 {
            let order = order.clone();
            let runner2 = runner.clone();
            let done = done_tx.clone();
            runner.post(move || {
                assert!(runner2.is_bound_to_current_thread());
                order.lock().unwrap().push(i);
                if i == 9 {
                    done.send(()).unwrap();
                }
            });
        }

        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn delayed_task_fires_after_delay() {
        let runner = TaskRunner::spawn();
        let (tx, rx) = std::sync::mpsc::channel();
        let started = std::time::Instant::now();
        runner.post_delayed(Duration::from_millis(50), move || {
            tx.send(started.elapsed()).unwrap();
        });
        let elapsed = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(elapsed >= Duration::from_millis(45), "fired after {elapsed:?}");
    }

    #[test]
    fn is_bound_is_false_off_thread() {
        let runner = TaskRunner::spawn();
        assert!(!runner.is_bound_to_current_thread());
    }

    #[test]
    fn quit_drains_cancellable_tasks() {
        let runner = TaskRunner::spawn();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();

        // First task parks the dispatcher so the rest stay queued.
        runner.post(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(2));
        });
        for _ in 0..5 {
            let cancelled = cancelled.clone();
            runner.post_cancellable(
                || panic!("must not run after quit"),
                move || {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        runner.quit();
        gate_tx.send(()).unwrap();
        runner.join();

        assert_eq!(cancelled.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn post_after_drain_resolves_cancel_arm() {
        let runner = TaskRunner::spawn();
        runner.quit();
        runner.join();

        let cancelled = Arc::new(AtomicUsize::new(0));
        let cancelled2 = cancelled.clone();
        let accepted = runner.post_cancellable(
            || panic!("must not run"),
            move || {
                cancelled2.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(!accepted);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }
}
