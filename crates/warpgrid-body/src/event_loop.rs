//! Thread-affinity execution.
//!
//! Every connection has one owning thread, and all shared-buffer state for
//! that connection is mutated there. [`EventLoopFlow::execute_now`] runs an
//! action inline when the caller is already on the owning thread, and
//! otherwise schedules it on that thread. Callers on foreign threads observe
//! asynchronous completion and never block.
//!
//! # Ordering
//!
//! Once an action has been scheduled, later actions from the owning thread
//! are scheduled behind it instead of running inline, so actions submitted
//! through one flow always run in submission order.
//!
//! # Implementations
//!
//! - [`TaskQueue`]: a per-connection task queue bound to one thread, drained
//!   by [`TaskQueue::run_pending`] or the async [`TaskQueue::run`] loop.
//! - [`InlineEventLoop`]: every thread counts as the owner; actions always
//!   run immediately. Used for bodies that are not tied to a connection.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tokio::sync::Notify;

/// A unit of work scheduled on an event loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A single-threaded execution context owning a connection's state.
pub trait EventLoop: Send + Sync + 'static {
    /// Returns `true` if the calling thread is the owning thread.
    fn in_event_loop(&self) -> bool;

    /// Schedule `task` to run later on the owning thread.
    fn execute(&self, task: Task);
}

/// Runs actions on an [`EventLoop`], inline when possible.
#[derive(Clone)]
pub struct EventLoopFlow {
    event_loop: Arc<dyn EventLoop>,
    pending: Arc<AtomicUsize>,
}

impl EventLoopFlow {
    pub fn new(event_loop: Arc<dyn EventLoop>) -> Self {
        Self {
            event_loop,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A flow over [`InlineEventLoop`].
    pub fn inline() -> Self {
        Self::new(Arc::new(InlineEventLoop))
    }

    pub fn event_loop(&self) -> &Arc<dyn EventLoop> {
        &self.event_loop
    }

    /// Run `action` now if on the owning thread with nothing queued ahead of
    /// it, returning `true`. Otherwise schedule it and return `false`.
    pub fn execute_now<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.pending.load(Ordering::Acquire) == 0 && self.event_loop.in_event_loop() {
            action();
            return true;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        let pending = Arc::clone(&self.pending);
        self.event_loop.execute(Box::new(move || {
            pending.fetch_sub(1, Ordering::AcqRel);
            action();
        }));
        false
    }

    /// Number of actions scheduled but not yet started.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl fmt::Debug for EventLoopFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopFlow")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// Event loop for which every thread is the owning thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineEventLoop;

impl EventLoop for InlineEventLoop {
    fn in_event_loop(&self) -> bool {
        true
    }

    fn execute(&self, task: Task) {
        task();
    }
}

/// A per-connection task queue bound to one owning thread.
///
/// Clones share the same queue. Tasks scheduled from any thread run in FIFO
/// order when the owning thread drains the queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<TaskQueueInner>,
}

struct TaskQueueInner {
    owner: Mutex<ThreadId>,
    tasks: Mutex<VecDeque<Task>>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl TaskQueue {
    /// Create a queue owned by the calling thread.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TaskQueueInner {
                owner: Mutex::new(thread::current().id()),
                tasks: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Make the calling thread the owner, e.g. after moving the runner.
    pub fn bind_to_current_thread(&self) {
        *self.inner.owner.lock().expect("task queue owner lock") = thread::current().id();
    }

    /// A flow that runs actions on this queue.
    pub fn flow(&self) -> EventLoopFlow {
        EventLoopFlow::new(Arc::new(self.clone()))
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.inner.tasks.lock().expect("task queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run scheduled tasks until the queue is empty, including tasks
    /// scheduled while draining. Returns the number of tasks run.
    ///
    /// Must be called on the owning thread.
    pub fn run_pending(&self) -> usize {
        debug_assert!(self.in_event_loop(), "task queue drained off its owning thread");
        let mut ran = 0;
        loop {
            let task = self.inner.tasks.lock().expect("task queue lock").pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Drain tasks as they arrive until [`shutdown`](Self::shutdown) is called.
    ///
    /// Each pass binds the queue to the thread polling this future, so the
    /// owner follows the future if a multi-thread runtime moves it.
    pub async fn run(&self) {
        loop {
            // read before draining so tasks scheduled ahead of shutdown still run
            let shutdown = self.inner.shutdown.load(Ordering::Acquire);
            self.bind_to_current_thread();
            let ran = self.run_pending();
            if ran > 0 {
                tracing::trace!(ran, "task queue drained");
            }
            if shutdown {
                return;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Stop [`run`](Self::run) after its current pass.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop for TaskQueue {
    fn in_event_loop(&self) -> bool {
        *self.inner.owner.lock().expect("task queue owner lock") == thread::current().id()
    }

    fn execute(&self, task: Task) {
        self.inner.tasks.lock().expect("task queue lock").push_back(task);
        self.inner.notify.notify_one();
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
