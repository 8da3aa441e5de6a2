//! Lifetime scopes for value handles.
//!
//! Scopes form an explicit parent chain owned by a [`Context`]; the context
//! always points at the innermost open scope. A [`Value`] remembers the scope
//! that produced it and refuses to touch the engine once that scope closed.

use std::{
    cell::Cell,
    fmt,
    rc::{Rc, Weak},
    thread,
};

use crate::{
    Error, Result,
    context::{Context, ContextInner},
    engine::{RawEscapableScope, RawScope},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// The bottom of a context's chain; never closed.
    Root,
    /// Wraps module registration.
    Module,
    /// Opened by the trampoline around every host callback.
    Callback,
    Handle,
    Escapable,
}

impl ScopeKind {
    fn can_escape(self) -> bool {
        matches!(
            self,
            ScopeKind::Module | ScopeKind::Callback | ScopeKind::Escapable
        )
    }
}

pub(crate) enum RawHandleScope {
    None,
    Handle(RawScope),
    Escapable(RawEscapableScope),
}

pub struct ScopeState {
    pub(crate) id: u64,
    pub(crate) kind: ScopeKind,
    pub(crate) parent: Option<Rc<ScopeState>>,
    pub(crate) raw: RawHandleScope,
    pub(crate) disposed: Cell<bool>,
    pub(crate) escaped: Cell<bool>,
    pub(crate) cx: Weak<ContextInner>,
}

impl ScopeState {
    pub(crate) fn root(id: u64, cx: Weak<ContextInner>) -> Self {
        Self {
            id,
            kind: ScopeKind::Root,
            parent: None,
            raw: RawHandleScope::None,
            disposed: Cell::new(false),
            escaped: Cell::new(false),
            cx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.disposed.get() {
            return Err(Error::usage(format!(
                "value used after its {:?} scope {} was closed",
                self.kind, self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn context(&self) -> Result<Context> {
        self.ensure_open()?;
        self.cx
            .upgrade()
            .map(Context::from_inner)
            .ok_or_else(|| Error::usage("context was torn down"))
    }
}

impl fmt::Debug for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeState")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("disposed", &self.disposed.get())
            .finish()
    }
}

/// An open scope. Closing is idempotent; dropping an open scope closes it.
///
/// Scopes must close innermost first. Dropping one out of order panics, the
/// same way a handle set refuses to drop while another depends on it.
pub struct Scope {
    state: Rc<ScopeState>,
}

impl Scope {
    pub(crate) fn open(cx: &Context, kind: ScopeKind) -> Result<Scope> {
        if kind == ScopeKind::Root {
            return Err(Error::usage("the root scope cannot be opened"));
        }
        let env = cx.env();
        let raw = if kind.can_escape() {
            RawHandleScope::Escapable(
                cx.check(env.open_escapable_handle_scope())?,
            )
        } else {
            RawHandleScope::Handle(cx.check(env.open_handle_scope())?)
        };
        let state = Rc::new(ScopeState {
            id: cx.next_scope_id(),
            kind,
            parent: Some(cx.current_scope()),
            raw,
            disposed: Cell::new(false),
            escaped: Cell::new(false),
            cx: cx.downgrade(),
        });
        // only after the engine accepted the scope
        cx.set_current_scope(state.clone());
        log::trace!("opened {kind:?} scope {}", state.id);
        Ok(Scope { state })
    }

    pub fn handle(cx: &Context) -> Result<Scope> {
        Scope::open(cx, ScopeKind::Handle)
    }

    pub fn escapable(cx: &Context) -> Result<Scope> {
        Scope::open(cx, ScopeKind::Escapable)
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn kind(&self) -> ScopeKind {
        self.state.kind
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    pub(crate) fn state(&self) -> &Rc<ScopeState> {
        &self.state
    }

    /// Promotes `value` into the parent scope. Allowed once per scope.
    pub fn escape(&self, value: &Value) -> Result<Value> {
        let state = &self.state;
        state.ensure_open()?;
        let RawHandleScope::Escapable(raw_scope) = state.raw else {
            return Err(Error::usage(format!(
                "{:?} scope {} cannot escape values",
                state.kind, state.id
            )));
        };
        let Some(parent) = state.parent.clone() else {
            return Err(Error::usage("escape requires a parent scope"));
        };
        if state.escaped.get() {
            return Err(Error::usage(format!(
                "a value was already escaped from scope {}",
                state.id
            )));
        }
        let cx = state.context()?;
        let raw = cx.check(cx.env().escape_handle(raw_scope, value.raw()?))?;
        state.escaped.set(true);
        Value::from_raw_in(raw, parent)
    }

    pub fn close(&self) -> Result<()> {
        close_state(&self.state)
    }

    /// Closes this scope together with any inner scope still open above it,
    /// innermost first.
    pub(crate) fn close_unwinding(&self) -> Result<()> {
        let state = &self.state;
        if state.disposed.get() {
            return Ok(());
        }
        let Some(inner) = state.cx.upgrade() else {
            return self.close();
        };
        let mut leaked = Vec::new();
        let mut chain = Some(Context::from_inner(inner).current_scope());
        loop {
            match chain {
                Some(open) if Rc::ptr_eq(&open, state) => break,
                Some(open) => {
                    chain = open.parent.clone();
                    leaked.push(open);
                }
                None => {
                    return Err(Error::usage(format!(
                        "scope {} is not on the open scope chain",
                        state.id
                    )));
                }
            }
        }
        for open in leaked {
            log::warn!("closing leaked {:?} scope {}", open.kind, open.id);
            close_state(&open)?;
        }
        close_state(state)
    }
}

fn close_state(state: &Rc<ScopeState>) -> Result<()> {
    if state.disposed.get() {
        return Ok(());
    }
    let Some(inner) = state.cx.upgrade() else {
        state.disposed.set(true);
        return Ok(());
    };
    let cx = Context::from_inner(inner);
    let current = cx.current_scope();
    if !Rc::ptr_eq(&current, state) {
        return Err(Error::usage(format!(
            "scope {} closed while scope {} is still open",
            state.id, current.id
        )));
    }
    let env = cx.env();
    let result = match state.raw {
        RawHandleScope::None => Ok(()),
        RawHandleScope::Handle(raw) => env.close_handle_scope(raw),
        RawHandleScope::Escapable(raw) => env.close_escapable_handle_scope(raw),
    };
    cx.check(result)?;
    state.disposed.set(true);
    if let Some(parent) = &state.parent {
        cx.set_current_scope(parent.clone());
    }
    log::trace!("closed {:?} scope {}", state.kind, state.id);
    Ok(())
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state.fmt(f)
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            if !thread::panicking() {
                panic!("Scope cannot be dropped while another depends on it: {error}");
            }
            log::error!("failed to close scope during unwinding: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ContextCreateInfo,
        engine::{EngineCreateInfo, Env, Status},
    };

    fn context() -> Context {
        let env = Env::new(EngineCreateInfo::default());
        Context::new(&env, ContextCreateInfo::default()).unwrap()
    }

    #[test]
    fn closing_a_scope_invalidates_its_values() {
        let cx = context();
        let scope = Scope::handle(&cx).unwrap();
        let value = cx.number(1.5).unwrap();
        assert_eq!(value.to_f64().unwrap(), 1.5);
        scope.close().unwrap();

        let error = value.to_f64().unwrap_err();
        assert!(matches!(error, Error::Usage(_)), "got {error:?}");
    }

    #[test]
    fn close_is_idempotent_and_restores_parent() {
        let cx = context();
        let root = cx.current_scope();
        let scope = Scope::handle(&cx).unwrap();
        assert_eq!(cx.current_scope().id(), scope.id());
        scope.close().unwrap();
        scope.close().unwrap();
        assert!(Rc::ptr_eq(&cx.current_scope(), &root));
    }

    #[test]
    fn out_of_order_close_is_rejected() {
        let cx = context();
        let outer = Scope::handle(&cx).unwrap();
        let inner = Scope::handle(&cx).unwrap();
        assert!(outer.close().is_err());
        assert!(!outer.is_disposed());
        inner.close().unwrap();
        outer.close().unwrap();
    }

    #[test]
    fn escape_promotes_exactly_once() {
        let cx = context();
        let outer = Scope::handle(&cx).unwrap();
        let scope = Scope::escapable(&cx).unwrap();
        let value = cx.string("kept").unwrap();
        let escaped = scope.escape(&value).unwrap();
        assert!(scope.escape(&value).is_err());
        scope.close().unwrap();

        assert!(value.to_string_utf8().is_err());
        assert_eq!(escaped.to_string_utf8().unwrap(), "kept");
        drop(escaped);
        outer.close().unwrap();
    }

    #[test]
    fn plain_scopes_cannot_escape() {
        let cx = context();
        let scope = Scope::handle(&cx).unwrap();
        let value = cx.number(2.0).unwrap();
        assert!(scope.escape(&value).is_err());
    }

    #[test]
    fn failed_open_leaves_the_chain_intact() {
        let env = Env::new(EngineCreateInfo {
            max_scope_depth: Some(2),
            ..Default::default()
        });
        let cx = Context::new(&env, ContextCreateInfo::default()).unwrap();
        let first = Scope::handle(&cx).unwrap();
        let second = Scope::escapable(&cx).unwrap();
        let before = cx.current_scope();

        let error = Scope::handle(&cx).unwrap_err();
        assert!(
            matches!(error, Error::Engine { status: Status::GenericFailure, .. }),
            "got {error:?}"
        );
        assert_eq!(error.message(), "handle scope depth limit reached");
        assert!(Rc::ptr_eq(&cx.current_scope(), &before));
        assert!(Scope::escapable(&cx).is_err());
        assert!(Rc::ptr_eq(&cx.current_scope(), &before));

        second.close().unwrap();
        first.close().unwrap();
        assert_eq!(cx.current_scope().id(), 0);
    }

    #[test]
    #[should_panic(expected = "Scope cannot be dropped")]
    fn dropping_out_of_order_panics() {
        let cx = context();
        let outer = Scope::handle(&cx).unwrap();
        let inner = Scope::handle(&cx).unwrap();
        drop(outer);
        drop(inner);
    }
}
