use std::fmt;

use parking_lot::Mutex;

use crate::{
    Error, Result,
    context::Context,
    engine::{Env, EnvId, RawRef},
    sync_context::SyncContext,
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceState {
    Strong,
    Weak,
    Disposed,
}

/// A durable handle to a script value that outlives scopes.
///
/// Strong references keep their target alive; weak ones resolve to `None`
/// once the target is collected. References can be moved to and dropped on
/// any thread: a release from a foreign thread is posted back to the owning
/// thread through its [`SyncContext`].
pub struct Reference {
    raw: RawRef,
    env: EnvId,
    state: Mutex<ReferenceState>,
    releaser: Option<SyncContext>,
}

impl Reference {
    fn create(value: &Value, strong: bool) -> Result<Reference> {
        let cx = value.context()?;
        let raw = cx.check(
            cx.env()
                .create_reference(value.raw()?, u32::from(strong)),
        )?;
        let releaser = match cx.sync_context() {
            Ok(sync) => Some(sync),
            Err(error) => {
                log::warn!("reference without a releaser: {error}");
                None
            }
        };
        let state = if strong {
            ReferenceState::Strong
        } else {
            ReferenceState::Weak
        };
        Ok(Reference {
            raw,
            env: cx.env().id(),
            state: Mutex::new(state),
            releaser,
        })
    }

    pub fn strong(value: &Value) -> Result<Reference> {
        Reference::create(value, true)
    }

    pub fn weak(value: &Value) -> Result<Reference> {
        Reference::create(value, false)
    }

    pub fn state(&self) -> ReferenceState {
        *self.state.lock()
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == ReferenceState::Disposed
    }

    pub(crate) fn raw_ref(&self) -> RawRef {
        self.raw
    }

    fn check_owner(&self, env: &Env) -> Result<()> {
        if env.id() != self.env {
            return Err(Error::usage("reference belongs to another engine"));
        }
        Ok(())
    }

    /// Resolves to a value in `cx`'s current scope, or `None` when disposed
    /// or when a weak target was collected.
    pub fn get_value(&self, cx: &Context) -> Result<Option<Value>> {
        let state = self.state.lock();
        if *state == ReferenceState::Disposed {
            return Ok(None);
        }
        self.check_owner(cx.env())?;
        let raw = cx.check(cx.env().get_reference_value(self.raw))?;
        drop(state);
        raw.map(|raw| Value::new(cx, raw)).transpose()
    }

    pub fn make_weak(&self, cx: &Context) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ReferenceState::Weak => Ok(()),
            ReferenceState::Disposed => {
                Err(Error::usage("cannot weaken a disposed reference"))
            }
            ReferenceState::Strong => {
                self.check_owner(cx.env())?;
                cx.check(cx.env().reference_unref(self.raw))?;
                *state = ReferenceState::Weak;
                Ok(())
            }
        }
    }

    pub fn make_strong(&self, cx: &Context) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ReferenceState::Strong => Ok(()),
            ReferenceState::Disposed => {
                Err(Error::usage("cannot strengthen a disposed reference"))
            }
            ReferenceState::Weak => {
                self.check_owner(cx.env())?;
                cx.check(cx.env().reference_ref(self.raw))?;
                *state = ReferenceState::Strong;
                Ok(())
            }
        }
    }

    /// Releases the engine reference synchronously. Must run on the owning
    /// thread; a second call is a no-op.
    pub fn dispose_in(&self, cx: &Context) -> Result<()> {
        self.check_owner(cx.env())?;
        let mut state = self.state.lock();
        if *state == ReferenceState::Disposed {
            return Ok(());
        }
        *state = ReferenceState::Disposed;
        cx.check(cx.env().delete_reference(self.raw))
    }

    /// Releases from inside a finalizer, where only the engine is at hand.
    pub(crate) fn release_on(&self, env: &Env) {
        let mut state = self.state.lock();
        if *state == ReferenceState::Disposed || env.id() != self.env {
            return;
        }
        *state = ReferenceState::Disposed;
        if let Err(status) = env.delete_reference(self.raw) {
            log::warn!("failed to release reference {:?}: {status}", self.raw);
        }
    }

    /// Releases the engine reference from any thread. On the owning thread
    /// the delete happens immediately; elsewhere it is posted there. A second
    /// call is a no-op.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if *state == ReferenceState::Disposed {
                return;
            }
            *state = ReferenceState::Disposed;
        }
        let raw = self.raw;
        let Some(releaser) = &self.releaser else {
            log::warn!("leaking reference {raw:?}: no owning context to release it");
            return;
        };
        if let Some(cx) = releaser.context() {
            if let Err(status) = cx.env().delete_reference(raw) {
                log::warn!("failed to release reference {raw:?}: {status}");
            }
            return;
        }
        log::trace!("posting release of {raw:?} to its owning thread");
        let posted = releaser.post(move |cx| {
            cx.check(cx.env().delete_reference(raw))
        });
        if let Err(error) = posted {
            log::warn!("reference {raw:?} not released: {error}");
        }
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("raw", &self.raw)
            .field("state", &self.state())
            .finish()
    }
}
