use std::{
    fmt,
    rc::Weak,
    sync::{Arc, mpsc},
    thread::{self, ThreadId},
};

use parking_lot::Mutex;

use crate::{
    Error, Result,
    bound::ThreadBound,
    context::{Context, ContextInner},
    engine::{EnvId, Status},
    threadsafe::{ThreadSafeFunction, ThreadSafeFunctionCreateInfo},
    value::Value,
};

struct SyncContextInner {
    tsfn: ThreadSafeFunction,
    env: EnvId,
    cx: ThreadBound<Weak<ContextInner>>,
    /// Open async scopes; the queue is referenced while non-zero.
    pending: Mutex<usize>,
}

impl Drop for SyncContextInner {
    fn drop(&mut self) {
        // fails harmlessly once the queue was aborted
        let _ = self.tsfn.release();
    }
}

/// Marshals work onto a context's script thread.
///
/// Its queue does not keep the event loop running on its own; an open
/// [`AsyncScope`] does.
#[derive(Clone)]
pub struct SyncContext(Arc<SyncContextInner>);

impl SyncContext {
    pub(crate) fn new(cx: &Context) -> Result<SyncContext> {
        let tsfn = ThreadSafeFunction::new(
            cx,
            ThreadSafeFunctionCreateInfo {
                referenced: Some(false),
                ..Default::default()
            },
        )?;
        Ok(SyncContext(Arc::new(SyncContextInner {
            tsfn,
            env: cx.env_id(),
            cx: ThreadBound::new(cx.downgrade()),
            pending: Mutex::new(0),
        })))
    }

    pub fn is_owner_thread(&self) -> bool {
        self.0.cx.is_owner()
    }

    pub fn owner(&self) -> ThreadId {
        self.0.cx.owner()
    }

    pub fn ptr_eq(&self, other: &SyncContext) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The owning context, when called on its thread while it still exists.
    pub(crate) fn context(&self) -> Option<Context> {
        self.0
            .cx
            .get()
            .and_then(Weak::upgrade)
            .map(Context::from_inner)
    }

    /// Fire and forget. Off the script thread this waits for queue space;
    /// on it, a full queue fails with `QueueFull` instead.
    pub fn post(
        &self,
        work: impl FnOnce(&Context) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.0.tsfn.blocking_call(work)
    }

    /// Runs `work` on the script thread and waits for its result. Already
    /// on that thread it runs inline.
    pub fn send<R: Send + 'static>(
        &self,
        work: impl FnOnce(&Context) -> Result<R> + Send + 'static,
    ) -> Result<R> {
        if self.is_owner_thread() {
            let cx = self
                .context()
                .ok_or_else(|| Error::engine(Status::Closing))?;
            return cx.scope(work);
        }
        let (tx, rx) = mpsc::channel();
        self.0.tsfn.blocking_call(move |cx| {
            // the receiver only goes away if the sender gave up waiting
            let _ = tx.send(work(cx));
            Ok(())
        })?;
        rx.recv().map_err(|_| Error::engine(Status::Cancelled))?
    }

    fn check_context(&self, cx: &Context) -> Result<()> {
        if !self.is_owner_thread() {
            return Err(Error::usage("sync context used off its script thread"));
        }
        if cx.env_id() != self.0.env {
            return Err(Error::usage("sync context belongs to another engine"));
        }
        match self.context() {
            Some(owner) if owner.ptr_eq(cx) => Ok(()),
            Some(_) => Err(Error::usage("sync context belongs to another context")),
            None => Err(Error::engine(Status::Closing)),
        }
    }

    /// Marks one more asynchronous operation in flight.
    pub fn enter(&self, cx: &Context) -> Result<()> {
        self.check_context(cx)?;
        let mut pending = self.0.pending.lock();
        if *pending == 0 {
            self.0.tsfn.ref_(cx)?;
        }
        *pending += 1;
        Ok(())
    }

    pub fn exit(&self, cx: &Context) -> Result<()> {
        self.check_context(cx)?;
        let mut pending = self.0.pending.lock();
        if *pending == 0 {
            return Err(Error::usage(
                "async scope closed without a matching open",
            ));
        }
        *pending -= 1;
        if *pending == 0 {
            self.0.tsfn.unref(cx)?;
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        *self.0.pending.lock()
    }

    /// Runs `work` on a worker thread and returns a promise settled on the
    /// script thread with `convert`'s result, or rejected with the error.
    pub fn run_async<T, W, C>(&self, cx: &Context, work: W, convert: C) -> Result<Value>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(&Context, T) -> Result<Value> + Send + 'static,
    {
        let (deferred, promise) = cx.promise()?;
        let scope = AsyncScope::enter(self, cx)?;
        let sync = self.clone();
        thread::Builder::new()
            .name("hostbridge-async".to_string())
            .spawn(move || {
                let result = work();
                let posted = sync.post(move |cx| {
                    let settled = match result.and_then(|value| convert(cx, value)) {
                        Ok(value) => deferred.resolve(cx, &value),
                        Err(error) => {
                            let reason = cx.error_value(&error)?;
                            deferred.reject(cx, &reason)
                        }
                    };
                    scope.close(cx)?;
                    settled
                });
                if let Err(error) = posted {
                    log::error!("async result could not be delivered: {error}");
                }
            })
            .map_err(|error| {
                Error::host(format!("failed to start async worker: {error}"))
            })?;
        Ok(promise)
    }

    pub(crate) fn shutdown(&self) {
        if let Err(error) = self.0.tsfn.abort() {
            log::debug!("sync context already closed: {error}");
        }
    }
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("queue", &self.0.tsfn.id())
            .field("owner", &self.owner())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Keeps a context's dispatch queue, and with it the event loop, alive while
/// an asynchronous host operation is in flight.
///
/// Close it on the script thread with the context it was opened on; an
/// unclosed scope closes itself when dropped.
pub struct AsyncScope {
    sync: Option<SyncContext>,
}

impl AsyncScope {
    pub fn open(cx: &Context) -> Result<AsyncScope> {
        let sync = cx.sync_context()?;
        AsyncScope::enter(&sync, cx)
    }

    fn enter(sync: &SyncContext, cx: &Context) -> Result<AsyncScope> {
        sync.enter(cx)?;
        Ok(AsyncScope {
            sync: Some(sync.clone()),
        })
    }

    pub fn sync_context(&self) -> Option<&SyncContext> {
        self.sync.as_ref()
    }

    pub fn close(mut self, cx: &Context) -> Result<()> {
        let Some(sync) = self.sync.take() else {
            return Ok(());
        };
        let current = match cx.sync_context() {
            Ok(current) => current,
            Err(error) => {
                self.sync = Some(sync);
                return Err(error);
            }
        };
        if !sync.is_owner_thread() || !sync.ptr_eq(&current) {
            self.sync = Some(sync);
            return Err(Error::usage(
                "async scope closed from a different context",
            ));
        }
        sync.exit(cx)
    }
}

impl Drop for AsyncScope {
    fn drop(&mut self) {
        let Some(sync) = self.sync.take() else {
            return;
        };
        let result = match sync.context() {
            Some(cx) => sync.exit(&cx),
            None => {
                let owner = sync.clone();
                sync.post(move |cx| owner.exit(cx))
            }
        };
        if let Err(error) = result {
            log::warn!("async scope not closed cleanly: {error}");
        }
    }
}

impl fmt::Debug for AsyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncScope")
            .field("open", &self.sync.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ContextCreateInfo,
        engine::{EngineCreateInfo, Env, PromiseStatus},
    };
    use std::time::Duration;

    fn context() -> (Env, Context) {
        let env = Env::new(EngineCreateInfo::default());
        let cx = Context::new(&env, ContextCreateInfo::default()).unwrap();
        (env, cx)
    }

    #[test]
    fn send_runs_inline_on_the_owner() {
        let (_env, cx) = context();
        let sync = cx.sync_context().unwrap();
        let answer = sync.send(|cx| cx.int32(6)?.to_i32()).unwrap();
        assert_eq!(answer, 6);
    }

    #[test]
    fn send_from_a_worker_waits_for_the_script_thread() {
        let (env, cx) = context();
        let sync = cx.sync_context().unwrap();
        let scope = AsyncScope::open(&cx).unwrap();
        let worker = thread::spawn(move || {
            let doubled = sync.send(|cx| Ok(cx.number(21.0)?.to_f64()? * 2.0));
            drop(scope);
            doubled
        });
        // the open async scope keeps the loop alive until the worker is done
        assert!(env.run_for(Duration::from_secs(5)));
        assert_eq!(worker.join().unwrap().unwrap(), 42.0);
        assert_eq!(cx.sync_context().unwrap().pending(), 0);
    }

    #[test]
    fn async_scopes_detect_mismatched_closes() {
        let (env, cx) = context();
        let other = Context::new(&env, ContextCreateInfo::default()).unwrap();
        let scope = AsyncScope::open(&cx).unwrap();
        assert!(matches!(scope.close(&other), Err(Error::Usage(_))));
        // the rejected scope closed itself on drop
        assert_eq!(cx.sync_context().unwrap().pending(), 0);

        let sync = cx.sync_context().unwrap();
        assert!(matches!(sync.exit(&cx), Err(Error::Usage(_))));
    }

    #[test]
    fn other_contexts_cannot_touch_the_keep_alive_count() {
        let (env, cx) = context();
        let other = Context::new(&env, ContextCreateInfo::default()).unwrap();
        let sync = cx.sync_context().unwrap();
        let scope = AsyncScope::open(&cx).unwrap();
        assert!(matches!(sync.exit(&other), Err(Error::Usage(_))));
        assert!(matches!(sync.enter(&other), Err(Error::Usage(_))));
        assert_eq!(sync.pending(), 1);
        scope.close(&cx).unwrap();
        assert_eq!(sync.pending(), 0);
    }

    #[test]
    fn run_async_settles_a_promise() {
        let (env, cx) = context();
        let sync = cx.sync_context().unwrap();
        let promise = sync
            .run_async(&cx, || Ok(6 * 7), |cx, n| cx.int32(n))
            .unwrap();
        assert!(env.run_for(Duration::from_secs(5)));
        match env.get_promise_state(promise.raw().unwrap()).unwrap() {
            PromiseStatus::Fulfilled(raw) => {
                let value = Value::new(&cx, raw).unwrap();
                assert_eq!(value.to_i32().unwrap(), 42);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn run_async_rejects_with_the_error_message() {
        let (env, cx) = context();
        let sync = cx.sync_context().unwrap();
        let promise = sync
            .run_async(
                &cx,
                || Err::<i32, _>(Error::host("worker failed")),
                |cx, n| cx.int32(n),
            )
            .unwrap();
        assert!(env.run_for(Duration::from_secs(5)));
        match env.get_promise_state(promise.raw().unwrap()).unwrap() {
            PromiseStatus::Rejected(raw) => {
                let reason = Value::new(&cx, raw).unwrap();
                let message = reason.get_named("message").unwrap();
                assert_eq!(message.to_string_utf8().unwrap(), "worker failed");
            }
            other => panic!("unexpected state {other:?}"),
        }
    }
}
