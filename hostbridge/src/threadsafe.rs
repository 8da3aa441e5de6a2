//! Host-side dispatch queues bound to a context's script thread.

use std::{
    any::Any,
    fmt,
    rc::{Rc, Weak},
    thread::{self, ThreadId},
};

use crate::{
    Error, Result,
    context::{Context, ContextInner},
    engine::{
        Env, RawThreadsafeFunction, Status, ThreadsafeCallMode,
        ThreadsafeReleaseMode,
    },
};

/// One unit of work for the script thread.
pub type DispatchFn = Box<dyn FnOnce(&Context) -> Result<()> + Send>;

#[derive(Debug, Default)]
pub struct ThreadSafeFunctionCreateInfo {
    /// `Some(0)` is unbounded; defaults to the context's queue size.
    pub max_queue_size: Option<usize>,
    pub initial_thread_count: Option<usize>,
    /// Whether the queue keeps [`Env::run`] alive. Defaults to `true`.
    pub referenced: Option<bool>,
}

struct Dispatcher {
    cx: Weak<ContextInner>,
}

fn call_js(env: Option<&Env>, context: &Rc<dyn Any>, data: Box<dyn Any + Send>) {
    let Ok(work) = data.downcast::<DispatchFn>() else {
        log::error!("dispatch queue received a foreign payload");
        return;
    };
    if env.is_none() {
        log::trace!("dropping work item of an aborted queue");
        return;
    }
    let Some(dispatcher) = context.downcast_ref::<Dispatcher>() else {
        return;
    };
    let Some(cx) = dispatcher.cx.upgrade().map(Context::from_inner) else {
        log::debug!("dropping work item: its context is gone");
        return;
    };
    let work: DispatchFn = *work;
    if let Err(error) = cx.scope(|cx| work(cx)) {
        log::error!("dispatched work failed: {error}");
    }
}

/// A queue of closures executed in FIFO order on the script thread, each in
/// a fresh handle scope. Clones share the queue and may be used from any
/// thread.
#[derive(Clone)]
pub struct ThreadSafeFunction {
    raw: RawThreadsafeFunction,
    owner: ThreadId,
}

impl ThreadSafeFunction {
    pub fn new(cx: &Context, info: ThreadSafeFunctionCreateInfo) -> Result<Self> {
        let max_queue_size = info
            .max_queue_size
            .unwrap_or(cx.settings().dispatch_queue_size);
        let initial_thread_count = info.initial_thread_count.unwrap_or(1);
        let dispatcher: Rc<dyn Any> = Rc::new(Dispatcher {
            cx: cx.downgrade(),
        });
        let raw = cx.check(cx.env().create_threadsafe_function(
            max_queue_size,
            initial_thread_count,
            dispatcher,
            call_js,
            None,
        ))?;
        let tsfn = Self {
            raw,
            owner: cx.env().thread(),
        };
        if info.referenced == Some(false) {
            tsfn.unref(cx)?;
        }
        log::trace!(
            "dispatch queue {} created (max {max_queue_size})",
            tsfn.id()
        );
        Ok(tsfn)
    }

    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn enqueue(&self, work: DispatchFn, mode: ThreadsafeCallMode) -> Status {
        self.raw.call(Box::new(work), mode)
    }

    /// Enqueues `work`, waiting for space when the queue is full. On the
    /// script thread itself it never waits and fails with `QueueFull`.
    pub fn blocking_call(
        &self,
        work: impl FnOnce(&Context) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let mode = if self.is_owner_thread() {
            ThreadsafeCallMode::NonBlocking
        } else {
            ThreadsafeCallMode::Blocking
        };
        match self.enqueue(Box::new(work), mode) {
            Status::Ok => Ok(()),
            status => Err(Error::engine(status)),
        }
    }

    /// Enqueues `work` unless the queue is full. `Ok(false)` means full and
    /// is worth retrying.
    pub fn non_blocking_call(
        &self,
        work: impl FnOnce(&Context) -> Result<()> + Send + 'static,
    ) -> Result<bool> {
        match self.enqueue(Box::new(work), ThreadsafeCallMode::NonBlocking) {
            Status::Ok => Ok(true),
            Status::QueueFull => Ok(false),
            status => Err(Error::engine(status)),
        }
    }

    /// Registers one more producer. Each acquire needs a matching release.
    pub fn acquire(&self) -> Result<()> {
        match self.raw.acquire() {
            Status::Ok => Ok(()),
            status => Err(Error::engine(status)),
        }
    }

    /// Drops one producer; the queue closes once the last one is gone and
    /// its backlog has run.
    pub fn release(&self) -> Result<()> {
        match self.raw.release(ThreadsafeReleaseMode::Release) {
            Status::Ok => Ok(()),
            status => Err(Error::engine(status)),
        }
    }

    /// Closes the queue immediately. Pending work is dropped unrun and
    /// further calls fail with `Closing`.
    pub fn abort(&self) -> Result<()> {
        match self.raw.release(ThreadsafeReleaseMode::Abort) {
            Status::Ok => Ok(()),
            status => Err(Error::engine(status)),
        }
    }

    pub fn ref_(&self, cx: &Context) -> Result<()> {
        cx.check(cx.env().ref_threadsafe_function(&self.raw))
    }

    pub fn unref(&self, cx: &Context) -> Result<()> {
        cx.check(cx.env().unref_threadsafe_function(&self.raw))
    }

    pub fn queued(&self) -> usize {
        self.raw.queued()
    }
}

impl fmt::Debug for ThreadSafeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeFunction")
            .field("id", &self.id())
            .field("owner", &self.owner)
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::ContextCreateInfo, engine::EngineCreateInfo};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn context() -> (Env, Context) {
        let env = Env::new(EngineCreateInfo::default());
        let cx = Context::new(&env, ContextCreateInfo::default()).unwrap();
        (env, cx)
    }

    #[test]
    fn work_runs_on_the_script_thread_in_order() {
        let (env, cx) = context();
        let tsfn = ThreadSafeFunction::new(&cx, Default::default()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let producer = tsfn.clone();
        let sink = log.clone();
        thread::spawn(move || {
            for i in 0..10 {
                let sink = sink.clone();
                producer
                    .blocking_call(move |cx| {
                        let value = cx.int32(i)?;
                        sink.lock().push(value.to_i32()?);
                        Ok(())
                    })
                    .unwrap();
            }
            producer.release().unwrap();
        })
        .join()
        .unwrap();

        env.run();
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
        assert_eq!(env.threadsafe_function_count(), 0);
    }

    #[test]
    fn dispatched_work_gets_its_own_scope() {
        let (env, cx) = context();
        let tsfn = ThreadSafeFunction::new(&cx, Default::default()).unwrap();
        let before = env.open_handle_count();
        tsfn.blocking_call(|cx| {
            assert_ne!(cx.current_scope().id(), 0);
            cx.object()?;
            Ok(())
        })
        .unwrap();
        env.run_until_idle();
        assert_eq!(env.open_handle_count(), before);
        assert_eq!(cx.current_scope().id(), 0);
    }

    #[test]
    fn full_queues_report_false() {
        let (env, cx) = context();
        let tsfn = ThreadSafeFunction::new(
            &cx,
            ThreadSafeFunctionCreateInfo {
                max_queue_size: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(tsfn.non_blocking_call(|_| Ok(())).unwrap());
        assert!(!tsfn.non_blocking_call(|_| Ok(())).unwrap());
        // the script thread never blocks on its own queue
        assert!(tsfn.blocking_call(|_| Ok(())).is_err());
        env.run_until_idle();
        assert!(tsfn.non_blocking_call(|_| Ok(())).unwrap());
    }

    #[test]
    fn aborted_queues_drop_pending_work() {
        let (env, cx) = context();
        let tsfn = ThreadSafeFunction::new(&cx, Default::default()).unwrap();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        tsfn.blocking_call(move |_| {
            *flag.lock() = true;
            Ok(())
        })
        .unwrap();
        tsfn.abort().unwrap();
        env.run_until_idle();
        assert!(!*ran.lock());
        assert!(tsfn.non_blocking_call(|_| Ok(())).is_err());
    }
}
