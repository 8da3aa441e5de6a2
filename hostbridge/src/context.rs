use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::{Rc, Weak},
    sync::Arc,
};

use crate::{
    Error, Result,
    callback::{self, CallbackArgs, CallbackData, CallbackKind},
    descriptor::{PropertyDescriptor, PropertyKind, PropertyName},
    engine::{
        Env, EnvId, ErrorKind, RawCallback, RawDeferred, RawPropertyDescriptor,
        RawPropertyKey, RawValue, Status, TypedArrayKind, ValueType,
        WellKnownSymbol,
    },
    error::fatal_error,
    reference::Reference,
    registry::Registry,
    scope::{Scope, ScopeState},
    sync_context::SyncContext,
    value::Value,
};

/// Upper bound for arguments copied into the trampoline's stack buffer.
pub(crate) const INLINE_ARGS: usize = 8;

#[derive(Debug, Default)]
pub struct ContextCreateInfo {
    /// Backlog of the context's dispatch queue. `Some(0)` is unbounded.
    pub dispatch_queue_size: Option<usize>,
    pub inline_args: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub dispatch_queue_size: usize,
    pub inline_args: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            dispatch_queue_size: 0,
            inline_args: INLINE_ARGS,
        }
    }
}

/// A script error object created from a host [`Error`]; recovered when the
/// object is caught by host code again.
struct HostErrorPayload(Error);

pub(crate) struct ContextInner {
    env: Env,
    settings: ContextSettings,
    current: RefCell<Rc<ScopeState>>,
    next_scope: Cell<u64>,
    registry: Arc<Registry>,
    imports: RefCell<HashMap<(String, Option<String>), Reference>>,
    sync: RefCell<Option<SyncContext>>,
    reading_error: Cell<bool>,
    torn_down: Cell<bool>,
}

/// One module instance bound to an engine: owns the scope chain, the
/// registry and the lazily created dispatch queue.
#[derive(Clone)]
pub struct Context(Rc<ContextInner>);

impl Context {
    pub fn new(env: &Env, info: ContextCreateInfo) -> Result<Context> {
        let mut settings = ContextSettings::default();
        info.dispatch_queue_size
            .inspect(|&val| settings.dispatch_queue_size = val);
        info.inline_args
            .inspect(|&val| settings.inline_args = val.min(INLINE_ARGS));

        if env.is_shut_down() {
            return Err(Error::engine(Status::Closing));
        }
        let inner = Rc::new_cyclic(|weak: &Weak<ContextInner>| {
            let root = Rc::new(ScopeState::root(0, weak.clone()));
            ContextInner {
                env: env.clone(),
                settings,
                current: RefCell::new(root),
                next_scope: Cell::new(1),
                registry: Arc::new(Registry::new()),
                imports: RefCell::new(HashMap::new()),
                sync: RefCell::new(None),
                reading_error: Cell::new(false),
                torn_down: Cell::new(false),
            }
        });
        log::debug!("context created on engine {:?}", env.id());
        Ok(Context(inner))
    }

    pub(crate) fn from_inner(inner: Rc<ContextInner>) -> Context {
        Context(inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Rc::downgrade(&self.0)
    }

    pub fn env(&self) -> &Env {
        &self.0.env
    }

    pub fn env_id(&self) -> EnvId {
        self.0.env.id()
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.0.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.0.registry
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_torn_down(&self) -> bool {
        self.0.torn_down.get()
    }

    pub fn current_scope(&self) -> Rc<ScopeState> {
        self.0.current.borrow().clone()
    }

    pub(crate) fn set_current_scope(&self, scope: Rc<ScopeState>) {
        *self.0.current.borrow_mut() = scope;
    }

    pub(crate) fn next_scope_id(&self) -> u64 {
        let id = self.0.next_scope.get();
        self.0.next_scope.set(id + 1);
        id
    }

    /// Runs `f` inside a fresh handle scope.
    pub fn scope<R>(&self, f: impl FnOnce(&Context) -> Result<R>) -> Result<R> {
        let scope = Scope::handle(self)?;
        let result = f(self);
        scope.close()?;
        result
    }

    // ── errors ─────────────────────────────────────────────────────

    /// Translates an engine status into an [`Error`], taking and clearing a
    /// pending script exception first.
    pub fn check<T>(&self, result: std::result::Result<T, Status>) -> Result<T> {
        result.map_err(|status| self.last_error(status))
    }

    fn last_error(&self, status: Status) -> Error {
        if self.0.reading_error.replace(true) {
            fatal_error(
                "Context::check",
                "engine error raised while reading the last engine error",
            );
        }
        let env = &self.0.env;
        let error = if env.is_exception_pending() {
            self.take_exception()
        } else {
            let info = env.get_last_error_info();
            let message = if info.status == status && !info.message.is_empty() {
                info.message
            } else {
                status.message()
            };
            Error::Engine {
                status,
                message: message.to_string(),
            }
        };
        self.0.reading_error.set(false);
        error
    }

    fn take_exception(&self) -> Error {
        let env = &self.0.env;
        let raw = match env.get_and_clear_last_exception() {
            Ok(raw) => raw,
            Err(status) => return Error::engine(status),
        };
        if let Ok(payload) = env.unwrap(raw) {
            if let Some(HostErrorPayload(error)) = payload.downcast_ref() {
                return error.clone();
            }
        }
        let message = exception_message(env, raw);
        // the engine state is read; building the reference may itself fail
        // and report through `check`
        self.0.reading_error.set(false);
        let value = Value::new(self, raw)
            .and_then(|value| Reference::strong(&value))
            .map(Arc::new)
            .ok();
        Error::Exception { message, value }
    }

    /// The script value `error` becomes when it crosses into the engine.
    pub fn error_value(&self, error: &Error) -> Result<Value> {
        if let Error::Exception {
            value: Some(reference),
            ..
        } = error
        {
            if let Some(value) = reference.get_value(self)? {
                return Ok(value);
            }
        }
        let value = self.error(error.message(), error.code().as_deref())?;
        if !matches!(error, Error::Exception { .. }) {
            let payload: Rc<dyn Any> = Rc::new(HostErrorPayload(error.clone()));
            self.check(self.0.env.wrap(value.raw()?, payload, None))?;
        }
        Ok(value)
    }

    /// Makes `error` the pending script exception.
    pub fn throw_error(&self, error: &Error) {
        let thrown = self.error_value(error).and_then(|value| value.throw());
        if let Err(nested) = thrown {
            log::error!("failed to throw \"{error}\": {nested}");
            let _ = self
                .0
                .env
                .throw_error(ErrorKind::Error, None, error.message());
        }
    }

    // ── value factories ────────────────────────────────────────────

    fn make(&self, result: std::result::Result<RawValue, Status>) -> Result<Value> {
        let raw = self.check(result)?;
        Value::new(self, raw)
    }

    pub fn undefined(&self) -> Result<Value> {
        self.make(self.0.env.get_undefined())
    }

    pub fn null(&self) -> Result<Value> {
        self.make(self.0.env.get_null())
    }

    pub fn boolean(&self, value: bool) -> Result<Value> {
        self.make(self.0.env.get_boolean(value))
    }

    pub fn number(&self, value: f64) -> Result<Value> {
        self.make(self.0.env.create_double(value))
    }

    pub fn int32(&self, value: i32) -> Result<Value> {
        self.make(self.0.env.create_int32(value))
    }

    pub fn uint32(&self, value: u32) -> Result<Value> {
        self.make(self.0.env.create_uint32(value))
    }

    pub fn int64(&self, value: i64) -> Result<Value> {
        self.make(self.0.env.create_int64(value))
    }

    pub fn string(&self, value: &str) -> Result<Value> {
        self.make(self.0.env.create_string_utf8(value.as_bytes()))
    }

    pub fn string_utf16(&self, value: &[u16]) -> Result<Value> {
        self.make(self.0.env.create_string_utf16(value))
    }

    pub fn string_latin1(&self, value: &[u8]) -> Result<Value> {
        self.make(self.0.env.create_string_latin1(value))
    }

    pub fn symbol(&self, description: Option<&str>) -> Result<Value> {
        let description = description
            .map(|text| self.string(text).and_then(|value| value.raw()))
            .transpose()?;
        self.make(self.0.env.create_symbol(description))
    }

    pub fn well_known_symbol(&self, sym: WellKnownSymbol) -> Result<Value> {
        self.make(self.0.env.get_well_known_symbol(sym))
    }

    pub fn global(&self) -> Result<Value> {
        self.make(self.0.env.get_global())
    }

    pub fn object(&self) -> Result<Value> {
        self.make(self.0.env.create_object())
    }

    pub fn array(&self, length: usize) -> Result<Value> {
        self.make(self.0.env.create_array_with_length(length))
    }

    pub fn array_from(&self, values: &[Value]) -> Result<Value> {
        let array = self.make(self.0.env.create_array())?;
        for (i, value) in values.iter().enumerate() {
            array.set_index(i as u32, value)?;
        }
        Ok(array)
    }

    pub fn array_buffer(&self, bytes: &[u8]) -> Result<Value> {
        self.make(self.0.env.create_arraybuffer(bytes))
    }

    pub fn typed_array(
        &self,
        kind: TypedArrayKind,
        buffer: &Value,
        byte_offset: usize,
        length: usize,
    ) -> Result<Value> {
        let buffer = buffer.raw()?;
        self.make(
            self.0
                .env
                .create_typedarray(kind, length, buffer, byte_offset),
        )
    }

    /// An opaque value carrying `object`; see [`Value::external`].
    pub fn external<T: Any + Send + Sync>(&self, object: Arc<T>) -> Result<Value> {
        let payload: Rc<dyn Any> = Rc::new(object);
        self.make(self.0.env.create_external(payload, None))
    }

    pub fn error(&self, message: &str, code: Option<&str>) -> Result<Value> {
        self.error_of_kind(ErrorKind::Error, message, code)
    }

    pub fn type_error(&self, message: &str, code: Option<&str>) -> Result<Value> {
        self.error_of_kind(ErrorKind::TypeError, message, code)
    }

    pub fn range_error(&self, message: &str, code: Option<&str>) -> Result<Value> {
        self.error_of_kind(ErrorKind::RangeError, message, code)
    }

    fn error_of_kind(
        &self,
        kind: ErrorKind,
        message: &str,
        code: Option<&str>,
    ) -> Result<Value> {
        let message = self.string(message)?.raw()?;
        let code = code
            .map(|code| self.string(code).and_then(|value| value.raw()))
            .transpose()?;
        self.make(self.0.env.create_error(kind, code, message))
    }

    pub fn function(
        &self,
        name: &str,
        f: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
    ) -> Result<Value> {
        let data =
            CallbackData::new(self, CallbackKind::Function(Rc::new(f)), None);
        self.make(self.0.env.create_function(
            name,
            callback::invoke_function,
            data,
        ))
    }

    pub fn promise(&self) -> Result<(Deferred, Value)> {
        let (raw, promise) = self.check(self.0.env.create_promise())?;
        let deferred = Deferred {
            raw,
            env: self.env_id(),
        };
        Ok((deferred, Value::new(self, promise)?))
    }

    // ── registration ───────────────────────────────────────────────

    fn lower<'a>(
        &self,
        descriptors: &'a [PropertyDescriptor],
    ) -> Result<Vec<RawPropertyDescriptor<'a>>> {
        descriptors
            .iter()
            .map(|descriptor| self.lower_one(descriptor))
            .collect()
    }

    fn lower_one<'a>(
        &self,
        descriptor: &'a PropertyDescriptor,
    ) -> Result<RawPropertyDescriptor<'a>> {
        let key = match &descriptor.name {
            PropertyName::Name(name) => RawPropertyKey::Name(name.as_str()),
            PropertyName::Symbol(sym) => {
                RawPropertyKey::Value(self.well_known_symbol(*sym)?.raw()?)
            }
            PropertyName::Key(value) => RawPropertyKey::Value(value.raw()?),
        };
        let mut raw = RawPropertyDescriptor {
            key,
            method: None,
            getter: None,
            setter: None,
            value: None,
            flags: descriptor.attributes.to_flags(),
            data: None,
        };
        match &descriptor.kind {
            PropertyKind::Value(value) => raw.value = Some(value.raw()?),
            PropertyKind::Method(method) => {
                raw.method = Some(callback::invoke_function as RawCallback);
                raw.data = Some(CallbackData::new(
                    self,
                    CallbackKind::Function(method.clone()),
                    descriptor.data.clone(),
                ));
            }
            PropertyKind::Accessor { getter, setter } => {
                raw.getter = getter
                    .as_ref()
                    .map(|_| callback::invoke_getter as RawCallback);
                raw.setter = setter
                    .as_ref()
                    .map(|_| callback::invoke_setter as RawCallback);
                raw.data = Some(CallbackData::new(
                    self,
                    CallbackKind::Accessor {
                        getter: getter.clone(),
                        setter: setter.clone(),
                    },
                    descriptor.data.clone(),
                ));
            }
        }
        Ok(raw)
    }

    /// Defines a constructor function named `name`. Static descriptors land
    /// on the constructor, the rest on its prototype.
    pub fn define_class(
        &self,
        name: &str,
        constructor: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
        descriptors: &[PropertyDescriptor],
    ) -> Result<Value> {
        let raw = self.lower(descriptors)?;
        let data = CallbackData::new(
            self,
            CallbackKind::Constructor(Rc::new(constructor)),
            None,
        );
        let class = self.make(self.0.env.define_class(
            name,
            callback::invoke_constructor,
            data,
            &raw,
        ))?;
        log::debug!("defined class {name} with {} members", descriptors.len());
        Ok(class)
    }

    pub fn define_properties(
        &self,
        target: &Value,
        descriptors: &[PropertyDescriptor],
    ) -> Result<()> {
        let raw = self.lower(descriptors)?;
        self.check(self.0.env.define_properties(target.raw()?, &raw))
    }

    /// Resolves `global[property]` once and caches it for the lifetime of
    /// the context.
    pub fn import(&self, global: &str, property: Option<&str>) -> Result<Value> {
        let key = (global.to_string(), property.map(str::to_string));
        if let Some(reference) = self.0.imports.borrow().get(&key) {
            if let Some(value) = reference.get_value(self)? {
                return Ok(value);
            }
        }

        let mut value = self.global()?.get_named(global)?;
        if value.is_undefined()? {
            return Err(Error::host(format!("{global} is not defined")));
        }
        if let Some(property) = property {
            value = value.get_named(property)?;
            if value.is_undefined()? {
                return Err(Error::host(format!(
                    "{global}.{property} is not defined"
                )));
            }
        }
        let reference = Reference::strong(&value)?;
        let previous = self.0.imports.borrow_mut().insert(key, reference);
        if let Some(previous) = previous {
            previous.dispose_in(self)?;
        }
        Ok(value)
    }

    /// Installs `descriptors` onto the module's `exports` and returns the
    /// object that should be handed back to the engine.
    pub fn export_module(
        &self,
        exports: &Value,
        descriptors: &[PropertyDescriptor],
    ) -> Result<Value> {
        if !exports.is_object()? {
            return Err(Error::engine(Status::ObjectExpected));
        }
        self.define_properties(exports, descriptors)?;
        log::debug!("exported {} module members", descriptors.len());
        Ok(exports.clone())
    }

    /// The context's dispatch adapter, created on first use.
    pub fn sync_context(&self) -> Result<SyncContext> {
        if let Some(sync) = self.0.sync.borrow().as_ref() {
            return Ok(sync.clone());
        }
        if self.0.torn_down.get() {
            return Err(Error::engine(Status::Closing));
        }
        let sync = SyncContext::new(self)?;
        *self.0.sync.borrow_mut() = Some(sync.clone());
        Ok(sync)
    }

    /// Releases everything the context tracks: registry entries, imports and
    /// the dispatch queue. Failures are logged; a second call is a no-op.
    pub fn teardown(&self) {
        if self.0.torn_down.replace(true) {
            return;
        }
        self.0.registry.teardown(self);
        let imports: Vec<Reference> = self
            .0
            .imports
            .borrow_mut()
            .drain()
            .map(|(_, reference)| reference)
            .collect();
        for reference in imports {
            if let Err(error) = reference.dispose_in(self) {
                log::warn!("failed to release import: {error}");
            }
        }
        let sync = self.0.sync.borrow_mut().take();
        if let Some(sync) = sync {
            sync.shutdown();
        }
        log::debug!("context on engine {:?} torn down", self.env_id());
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("env", &self.0.env.id())
            .field("scope", &self.0.current.borrow().id())
            .field("torn_down", &self.0.torn_down.get())
            .finish()
    }
}

fn exception_message(env: &Env, raw: RawValue) -> String {
    let read = |raw: RawValue| -> Option<String> {
        let len = env.get_value_string_utf8(raw, None).ok()?;
        let mut buf = vec![0u8; len + 1];
        let written = env.get_value_string_utf8(raw, Some(&mut buf)).ok()?;
        buf.truncate(written);
        String::from_utf8(buf).ok()
    };
    let is_object = matches!(
        env.typeof_value(raw),
        Ok(ValueType::Object | ValueType::Function)
    );
    let message = is_object
        .then(|| env.get_named_property(raw, "message").ok())
        .flatten()
        .and_then(read)
        .or_else(|| env.coerce_to_string(raw).ok().and_then(read));
    // a throwing `message` getter must not leave a new exception behind
    if env.is_exception_pending() {
        let _ = env.get_and_clear_last_exception();
    }
    message.unwrap_or_else(|| "unknown script exception".to_string())
}

/// The settle-once half of a promise. `Send`, so it can travel to the worker
/// producing the result, but settling happens on the script thread.
///
/// A deferred that is never settled keeps its promise pending and alive.
#[derive(Debug)]
pub struct Deferred {
    raw: RawDeferred,
    env: EnvId,
}

impl Deferred {
    pub fn resolve(self, cx: &Context, value: &Value) -> Result<()> {
        self.settle(cx, value, true)
    }

    pub fn reject(self, cx: &Context, reason: &Value) -> Result<()> {
        self.settle(cx, reason, false)
    }

    fn settle(self, cx: &Context, value: &Value, fulfill: bool) -> Result<()> {
        if cx.env_id() != self.env {
            return Err(Error::usage("deferred belongs to another engine"));
        }
        let value = value.raw()?;
        let env = cx.env();
        let result = if fulfill {
            env.resolve_deferred(self.raw, value)
        } else {
            env.reject_deferred(self.raw, value)
        };
        cx.check(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCreateInfo, PromiseStatus};

    fn context() -> (Env, Context) {
        let env = Env::new(EngineCreateInfo::default());
        let cx = Context::new(&env, ContextCreateInfo::default()).unwrap();
        (env, cx)
    }

    #[test]
    fn settings_apply_overrides_and_cap_inline_args() {
        let env = Env::new(EngineCreateInfo::default());
        let cx = Context::new(
            &env,
            ContextCreateInfo {
                dispatch_queue_size: Some(4),
                inline_args: Some(64),
            },
        )
        .unwrap();
        assert_eq!(cx.settings().dispatch_queue_size, 4);
        assert_eq!(cx.settings().inline_args, INLINE_ARGS);
    }

    #[test]
    fn pending_exception_message_wins_over_status() {
        let (_env, cx) = context();
        let thrower = cx
            .function("thrower", |args| {
                Err(Error::host(format!("bad input: {}", args.len())))
            })
            .unwrap();
        let error = thrower
            .call(&cx.undefined().unwrap(), &[cx.number(1.0).unwrap()])
            .unwrap_err();
        assert_eq!(error.message(), "bad input: 1");
        assert!(!cx.env().is_exception_pending());
    }

    #[test]
    fn host_errors_survive_a_trip_through_the_engine() {
        let (_env, cx) = context();
        let original = Error::usage("scope misuse");
        cx.throw_error(&original);
        let recovered = cx.check::<()>(Err(Status::PendingException)).unwrap_err();
        assert!(matches!(recovered, Error::Usage(ref m) if m == "scope misuse"));
    }

    #[test]
    fn script_exceptions_rethrow_the_same_value() {
        let (_env, cx) = context();
        let thrown = cx.object().unwrap();
        thrown.set_named("message", &cx.string("custom").unwrap()).unwrap();
        thrown.throw().unwrap();
        let error = cx.check::<()>(Err(Status::PendingException)).unwrap_err();
        assert_eq!(error.message(), "custom");

        cx.throw_error(&error);
        let raw = cx.env().get_and_clear_last_exception().unwrap();
        let rethrown = Value::new(&cx, raw).unwrap();
        assert!(rethrown.strict_equals(&thrown).unwrap());
    }

    #[test]
    fn non_object_exceptions_are_stringified() {
        let (_env, cx) = context();
        cx.number(42.0).unwrap().throw().unwrap();
        let error = cx.check::<()>(Err(Status::PendingException)).unwrap_err();
        assert_eq!(error.message(), "42");
    }

    #[test]
    fn exceptions_surface_after_engine_shutdown() {
        let (env, cx) = context();
        env.shutdown();
        cx.number(1.0).unwrap().throw().unwrap();
        let error = cx.check::<()>(Err(Status::PendingException)).unwrap_err();
        assert!(matches!(error, Error::Exception { .. }), "got {error:?}");
        assert_eq!(error.message(), "1");
        assert!(!cx.env().is_exception_pending());
    }

    #[test]
    fn imports_are_cached() {
        let (_env, cx) = context();
        let first = cx.import("Proxy", None).unwrap();
        let second = cx.import("Proxy", None).unwrap();
        assert!(first.strict_equals(&second).unwrap());
        let iterator = cx.import("Symbol", Some("iterator")).unwrap();
        assert!(iterator.is_symbol().unwrap());
        assert!(cx.import("Nope", None).is_err());
    }

    #[test]
    fn deferreds_settle_their_promise() {
        let (env, cx) = context();
        let (deferred, promise) = cx.promise().unwrap();
        deferred.resolve(&cx, &cx.number(9.0).unwrap()).unwrap();
        match env.get_promise_state(promise.raw().unwrap()).unwrap() {
            PromiseStatus::Fulfilled(raw) => {
                let value = Value::new(&cx, raw).unwrap();
                assert_eq!(value.to_f64().unwrap(), 9.0);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn export_module_requires_an_object() {
        let (_env, cx) = context();
        let exports = cx.object().unwrap();
        let returned = cx
            .export_module(
                &exports,
                &[PropertyDescriptor::value("answer", cx.int32(42).unwrap())],
            )
            .unwrap();
        assert!(returned.strict_equals(&exports).unwrap());
        assert_eq!(exports.get_named("answer").unwrap().to_i32().unwrap(), 42);
        assert!(cx.export_module(&cx.number(1.0).unwrap(), &[]).is_err());
    }

    #[test]
    fn teardown_is_idempotent() {
        let (_env, cx) = context();
        cx.import("Proxy", None).unwrap();
        cx.teardown();
        cx.teardown();
        assert!(cx.is_torn_down());
        assert!(cx.sync_context().is_err());
    }
}
