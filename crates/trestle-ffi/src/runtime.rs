//! Runtime-instance state, the process-wide instance registry, and the
//! wake/drain loop.
//!
//! Each managed-runtime instance registers exactly one [`RuntimeState`]: the
//! identity of the thread managed code runs on, a mutex-guarded FIFO of
//! cross-thread work, and a wake handle the instance's own event loop
//! observes. Foreign threads signal the wake handle after enqueuing; the
//! runtime thread answers by calling [`RuntimeHandle::drain`].
//!
//! Teardown closes the queue first, so a foreign thread racing against it
//! gets a `RuntimeUnavailable` error instead of blocking forever, then drains
//! whatever was already queued so nothing stays parked on a rendezvous.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;

use crate::error::FfiError;
use crate::queue::DispatchTask;

/// Wake handle supplied by the runtime instance. Must tolerate being called
/// from any thread at any time, including after teardown has begun.
pub type WakeFn = Box<dyn Fn() + Send + Sync>;

struct QueueInner {
    tasks: VecDeque<DispatchTask>,
    closed: bool,
}

/// Per-runtime-instance dispatch state.
pub struct RuntimeState {
    id: u64,
    thread: ThreadId,
    queue: Mutex<QueueInner>,
    wake: WakeFn,
}

impl RuntimeState {
    /// The identity of the thread managed code executes on.
    pub fn owning_thread(&self) -> ThreadId {
        self.thread
    }

    /// The registry id of this instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the calling thread is this instance's runtime thread.
    pub fn is_runtime_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Hand a task to the runtime thread and signal its wake handle.
    ///
    /// Fails once teardown has begun; the caller must not block expecting the
    /// task to ever run.
    pub(crate) fn enqueue(&self, task: DispatchTask) -> Result<(), FfiError> {
        {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if queue.closed {
                return Err(FfiError::RuntimeUnavailable { id: self.id });
            }
            queue.tasks.push_back(task);
        }
        // Signal outside the queue lock; the wake handle may do arbitrary
        // work.
        (self.wake)();
        Ok(())
    }

    fn pop(&self) -> Option<DispatchTask> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .pop_front()
    }

    fn close(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .len()
    }

    /// Pop and execute queued tasks in strict FIFO order until the queue is
    /// observed empty. The queue mutex is only held while popping.
    fn drain_tasks(&self) -> usize {
        let mut executed = 0;
        while let Some(task) = self.pop() {
            match task {
                DispatchTask::Callback(inv) => {
                    crate::callback::dispatch_queued(&inv);
                    inv.rendezvous.signal();
                }
                DispatchTask::Completion(ctx) => ctx.finish(),
            }
            executed += 1;
        }
        executed
    }

    /// Unblock queued work without executing it. Only used when state is
    /// being discarded from a thread that cannot run managed code.
    fn abort_tasks(&self) -> usize {
        let mut aborted = 0;
        while let Some(task) = self.pop() {
            match task {
                DispatchTask::Callback(inv) => {
                    log::error!(
                        "runtime instance {} discarded with a queued closure invocation; \
                         releasing the blocked thread without running the callback",
                        self.id
                    );
                    inv.rendezvous.signal();
                }
                DispatchTask::Completion(ctx) => ctx.abandon(),
            }
            aborted += 1;
        }
        aborted
    }
}

/// Process-wide table mapping runtime-instance ids to their dispatch state.
///
/// Guarded by its own lock, separate from every per-instance queue lock, so
/// unrelated instances never contend.
pub struct RuntimeRegistry {
    runtimes: Mutex<HashMap<u64, Arc<RuntimeState>>>,
    next_id: AtomicU64,
}

impl RuntimeRegistry {
    fn new() -> Self {
        Self {
            runtimes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, wake: WakeFn) -> Arc<RuntimeState> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(RuntimeState {
            id,
            thread: thread::current().id(),
            queue: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            wake,
        });
        self.runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&state));
        log::debug!("registered runtime instance {id}");
        state
    }

    fn unregister(&self, id: u64) {
        self.runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        log::debug!("unregistered runtime instance {id}");
    }

    /// Look up a live instance by id.
    pub fn get(&self, id: u64) -> Option<Arc<RuntimeState>> {
        self.runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: Lazy<RuntimeRegistry> = Lazy::new(RuntimeRegistry::new);

/// The process-wide runtime-instance registry.
pub fn registry() -> &'static RuntimeRegistry {
    &REGISTRY
}

/// Owning handle for one registered runtime instance.
///
/// The handle must live on the runtime thread that registered it. Dropping it
/// without an explicit [`RuntimeHandle::teardown`] performs a best-effort
/// teardown.
pub struct RuntimeHandle {
    state: Arc<RuntimeState>,
    torn_down: bool,
}

impl RuntimeHandle {
    /// Register the calling thread as a runtime instance's thread.
    ///
    /// `wake` is invoked (possibly from foreign threads) whenever work is
    /// queued; the instance's event loop should respond by calling
    /// [`RuntimeHandle::drain`] from the registering thread.
    pub fn register(wake: WakeFn) -> Self {
        Self {
            state: registry().register(wake),
            torn_down: false,
        }
    }

    /// The registry id of this instance.
    pub fn id(&self) -> u64 {
        self.state.id()
    }

    pub(crate) fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    /// Execute all queued cross-thread work. Must be called from the runtime
    /// thread; returns the number of tasks executed.
    pub fn drain(&self) -> Result<usize, FfiError> {
        if !self.state.is_runtime_thread() {
            return Err(FfiError::WrongThread { id: self.state.id });
        }
        Ok(self.state.drain_tasks())
    }

    /// Shut the instance down: stop accepting work, run everything already
    /// queued so no foreign thread stays blocked, then unregister.
    pub fn teardown(mut self) -> Result<(), FfiError> {
        if !self.state.is_runtime_thread() {
            return Err(FfiError::WrongThread { id: self.state.id });
        }
        self.teardown_on_runtime_thread();
        Ok(())
    }

    fn teardown_on_runtime_thread(&mut self) {
        self.state.close();
        let drained = self.state.drain_tasks();
        if drained > 0 {
            log::debug!(
                "runtime instance {} drained {drained} task(s) during teardown",
                self.state.id
            );
        }
        registry().unregister(self.state.id);
        self.torn_down = true;
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if self.state.is_runtime_thread() {
            self.teardown_on_runtime_thread();
        } else {
            // Can't run managed callbacks here; release anyone blocked and
            // take the instance out of the table.
            log::warn!(
                "runtime handle for instance {} dropped off its runtime thread",
                self.state.id
            );
            self.state.close();
            self.state.abort_tasks();
            registry().unregister(self.state.id);
        }
    }
}
