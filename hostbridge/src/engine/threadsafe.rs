//! Thread-safe functions and the event loop that drains them.
//!
//! Producers on any thread enqueue boxed payloads; the engine thread pops
//! them in FIFO order from [`Env::run_once`] and hands each to the
//! function's `call_js` inside its own handle scope.

use std::{
    any::Any,
    collections::VecDeque,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::engine::{Env, Status};

static NEXT_TSFN_ID: AtomicU64 = AtomicU64::new(1);

/// Receives each queued payload on the engine thread. `env` is `None` when
/// the function was aborted and the payload is only being drained.
pub type CallJsCallback =
    fn(Option<&Env>, &Rc<dyn Any>, Box<dyn Any + Send>);

pub type ThreadsafeFinalizer = Box<dyn FnOnce(&Env, &Rc<dyn Any>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadsafeCallMode {
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadsafeReleaseMode {
    Release,
    Abort,
}

#[derive(Debug, Default)]
struct LoopState {
    ready: VecDeque<u64>,
    alive: usize,
}

/// Wake-up queue shared between the engine thread and producers.
#[derive(Debug, Default)]
pub(crate) struct LoopShared {
    state: Mutex<LoopState>,
    wakeup: Condvar,
}

impl LoopShared {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn notify(&self, id: u64) {
        self.state.lock().ready.push_back(id);
        self.wakeup.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TsfnState {
    Open,
    Closing,
    Aborted,
}

struct TsfnQueue {
    items: VecDeque<Box<dyn Any + Send>>,
    thread_count: usize,
    state: TsfnState,
}

struct TsfnShared {
    id: u64,
    max_queue_size: usize,
    queue: Mutex<TsfnQueue>,
    space: Condvar,
    event_loop: Arc<LoopShared>,
}

/// The cross-thread half of a thread-safe function. Cloning does not
/// acquire; use [`RawThreadsafeFunction::acquire`] per producer thread.
#[derive(Clone)]
pub struct RawThreadsafeFunction(Arc<TsfnShared>);

impl std::fmt::Debug for RawThreadsafeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RawThreadsafeFunction").field(&self.0.id).finish()
    }
}

impl RawThreadsafeFunction {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Enqueues `data`. A full queue blocks in [`ThreadsafeCallMode::Blocking`]
    /// and fails with [`Status::QueueFull`] otherwise.
    pub fn call(
        &self,
        data: Box<dyn Any + Send>,
        mode: ThreadsafeCallMode,
    ) -> Status {
        let mut queue = self.0.queue.lock();
        loop {
            if queue.state != TsfnState::Open {
                return Status::Closing;
            }
            let max = self.0.max_queue_size;
            if max == 0 || queue.items.len() < max {
                queue.items.push_back(data);
                drop(queue);
                self.0.event_loop.notify(self.0.id);
                return Status::Ok;
            }
            if mode == ThreadsafeCallMode::NonBlocking {
                return Status::QueueFull;
            }
            self.0.space.wait(&mut queue);
        }
    }

    pub fn acquire(&self) -> Status {
        let mut queue = self.0.queue.lock();
        if queue.state != TsfnState::Open {
            return Status::Closing;
        }
        queue.thread_count += 1;
        Status::Ok
    }

    pub fn release(&self, mode: ThreadsafeReleaseMode) -> Status {
        let mut queue = self.0.queue.lock();
        if queue.thread_count == 0 {
            return Status::InvalidArg;
        }
        queue.thread_count -= 1;
        if mode == ThreadsafeReleaseMode::Abort {
            queue.state = TsfnState::Aborted;
        } else if queue.thread_count == 0 && queue.state == TsfnState::Open {
            queue.state = TsfnState::Closing;
        }
        let closing = queue.state != TsfnState::Open;
        drop(queue);
        if closing {
            self.0.space.notify_all();
            self.0.event_loop.notify(self.0.id);
        }
        Status::Ok
    }

    pub fn queued(&self) -> usize {
        self.0.queue.lock().items.len()
    }
}

/// The engine-thread half, owned by the [`Env`].
pub(crate) struct TsfnLocal {
    shared: Arc<TsfnShared>,
    context: Rc<dyn Any>,
    call_js: CallJsCallback,
    finalize: Option<ThreadsafeFinalizer>,
    referenced: bool,
}

enum Delivery {
    Stale,
    Item {
        item: Box<dyn Any + Send>,
        context: Rc<dyn Any>,
        call_js: CallJsCallback,
        aborted: bool,
        done: bool,
    },
    Drained,
}

impl Env {
    /// Creates a thread-safe function. `max_queue_size == 0` means
    /// unbounded. The function starts referenced, keeping [`Env::run`]
    /// alive until it is released or unreferenced.
    pub fn create_threadsafe_function(
        &self,
        max_queue_size: usize,
        initial_thread_count: usize,
        context: Rc<dyn Any>,
        call_js: CallJsCallback,
        finalize: Option<ThreadsafeFinalizer>,
    ) -> Result<RawThreadsafeFunction, Status> {
        if initial_thread_count == 0 {
            return self.finish(Err(Status::InvalidArg));
        }
        if self.0.shut_down.get() {
            return self.finish(Err(Status::Closing));
        }
        let shared = Arc::new(TsfnShared {
            id: NEXT_TSFN_ID.fetch_add(1, Ordering::Relaxed),
            max_queue_size,
            queue: Mutex::new(TsfnQueue {
                items: VecDeque::new(),
                thread_count: initial_thread_count,
                state: TsfnState::Open,
            }),
            space: Condvar::new(),
            event_loop: self.0.event_loop.clone(),
        });
        self.0.tsfns.borrow_mut().insert(
            shared.id,
            TsfnLocal {
                shared: shared.clone(),
                context,
                call_js,
                finalize,
                referenced: true,
            },
        );
        self.0.event_loop.state.lock().alive += 1;
        log::trace!("threadsafe function {} created", shared.id);
        self.finish(Ok(RawThreadsafeFunction(shared)))
    }

    fn set_referenced(
        &self,
        tsfn: &RawThreadsafeFunction,
        referenced: bool,
    ) -> Result<(), Status> {
        let result = (|| {
            let mut tsfns = self.0.tsfns.borrow_mut();
            let local = tsfns.get_mut(&tsfn.id()).ok_or(Status::InvalidArg)?;
            if local.referenced != referenced {
                local.referenced = referenced;
                let mut state = self.0.event_loop.state.lock();
                if referenced {
                    state.alive += 1;
                } else {
                    state.alive -= 1;
                }
            }
            Ok(())
        })();
        self.finish(result)
    }

    pub fn ref_threadsafe_function(
        &self,
        tsfn: &RawThreadsafeFunction,
    ) -> Result<(), Status> {
        self.set_referenced(tsfn, true)
    }

    pub fn unref_threadsafe_function(
        &self,
        tsfn: &RawThreadsafeFunction,
    ) -> Result<(), Status> {
        self.set_referenced(tsfn, false)
    }

    pub fn threadsafe_function_count(&self) -> usize {
        self.0.tsfns.borrow().len()
    }

    fn next_delivery(&self, id: u64) -> Delivery {
        let tsfns = self.0.tsfns.borrow();
        let Some(local) = tsfns.get(&id) else {
            return Delivery::Stale;
        };
        let mut queue = local.shared.queue.lock();
        let item = queue.items.pop_front();
        let aborted = queue.state == TsfnState::Aborted;
        let done = queue.items.is_empty() && queue.state != TsfnState::Open;
        drop(queue);
        match item {
            Some(item) => {
                local.shared.space.notify_one();
                Delivery::Item {
                    item,
                    context: local.context.clone(),
                    call_js: local.call_js,
                    aborted,
                    done,
                }
            }
            None if done => Delivery::Drained,
            None => Delivery::Stale,
        }
    }

    fn finalize_threadsafe_function(&self, id: u64) {
        let Some(local) = self.0.tsfns.borrow_mut().remove(&id) else {
            return;
        };
        if local.referenced {
            self.0.event_loop.state.lock().alive -= 1;
        }
        log::trace!("threadsafe function {id} finalized");
        if let Some(finalize) = local.finalize {
            finalize(self, &local.context);
        }
    }

    /// Processes one pending notification. Returns `false` when nothing was
    /// ready.
    pub fn run_once(&self) -> bool {
        self.maybe_collect();
        let Some(id) = self.0.event_loop.state.lock().ready.pop_front() else {
            return false;
        };
        match self.next_delivery(id) {
            Delivery::Stale => {}
            Delivery::Drained => self.finalize_threadsafe_function(id),
            Delivery::Item {
                item,
                context,
                call_js,
                aborted,
                done,
            } => {
                if aborted {
                    call_js(None, &context, item);
                } else {
                    let scope = self.open_scope_record(false);
                    call_js(Some(self), &context, item);
                    self.unwind_scope_record(scope);
                    if self.is_exception_pending() {
                        log::warn!(
                            "uncaught exception in threadsafe function {id}"
                        );
                        let _ = self.get_and_clear_last_exception();
                    }
                }
                if done {
                    self.finalize_threadsafe_function(id);
                }
            }
        }
        true
    }

    pub fn run_until_idle(&self) {
        while self.run_once() {}
    }

    fn run_with_deadline(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.run_once() {
                continue;
            }
            let mut state = self.0.event_loop.state.lock();
            if !state.ready.is_empty() {
                continue;
            }
            if state.alive == 0 {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    self.0.event_loop.wakeup.wait_until(&mut state, deadline);
                }
                None => self.0.event_loop.wakeup.wait(&mut state),
            }
        }
    }

    /// Drains notifications, blocking while any referenced thread-safe
    /// function is alive.
    pub fn run(&self) {
        self.run_with_deadline(None);
    }

    /// Like [`Env::run`] but gives up after `timeout`. Returns whether the
    /// loop went idle.
    pub fn run_for(&self, timeout: Duration) -> bool {
        self.run_with_deadline(Some(Instant::now() + timeout))
    }

    pub(crate) fn abort_threadsafe_functions(&self) {
        let ids: Vec<u64> = self.0.tsfns.borrow().keys().copied().collect();
        for id in ids {
            let drained = {
                let tsfns = self.0.tsfns.borrow();
                let Some(local) = tsfns.get(&id) else {
                    continue;
                };
                let mut queue = local.shared.queue.lock();
                queue.state = TsfnState::Aborted;
                let items: Vec<_> = queue.items.drain(..).collect();
                drop(queue);
                local.shared.space.notify_all();
                (items, local.context.clone(), local.call_js)
            };
            let (items, context, call_js) = drained;
            for item in items {
                call_js(None, &context, item);
            }
            self.finalize_threadsafe_function(id);
        }
        self.0.event_loop.state.lock().ready.clear();
    }
}
