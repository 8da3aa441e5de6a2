//! The native entry points the engine calls for every registered function,
//! accessor and constructor.
//!
//! All of them share one shape: open a callback scope, copy the arguments,
//! run the host closure carried in the callback data, escape the result and
//! close the scope again. Host errors and panics become script exceptions.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    rc::{Rc, Weak},
    sync::Arc,
};

use crate::{
    Error, Result,
    context::{Context, ContextInner, INLINE_ARGS},
    engine::{CallbackInfo, Env, ErrorKind, RawValue},
    scope::{Scope, ScopeKind, ScopeState},
    value::Value,
};

pub type HostFn = Rc<dyn Fn(&CallbackArgs<'_>) -> Result<Value>>;
pub type SetterFn = Rc<dyn Fn(&CallbackArgs<'_>, Value) -> Result<()>>;

#[derive(Clone)]
pub(crate) enum CallbackKind {
    Function(HostFn),
    Accessor {
        getter: Option<HostFn>,
        setter: Option<SetterFn>,
    },
    Constructor(HostFn),
}

pub(crate) struct CallbackData {
    cx: Weak<ContextInner>,
    kind: CallbackKind,
    data: Option<Arc<dyn Any + Send + Sync>>,
}

impl CallbackData {
    pub(crate) fn new(
        cx: &Context,
        kind: CallbackKind,
        data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Rc<dyn Any> {
        Rc::new(CallbackData {
            cx: cx.downgrade(),
            kind,
            data,
        })
    }
}

/// What a host callback sees of its invocation.
pub struct CallbackArgs<'a> {
    cx: &'a Context,
    scope: Rc<ScopeState>,
    this: Value,
    args: &'a [RawValue],
    new_target: Option<Value>,
    data: Option<&'a Arc<dyn Any + Send + Sync>>,
}

impl CallbackArgs<'_> {
    pub fn context(&self) -> &Context {
        self.cx
    }

    pub fn this(&self) -> &Value {
        &self.this
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// The argument at `index`, `undefined` past the end. Arguments stay
    /// valid for the whole call, whatever scope is current when read.
    pub fn get(&self, index: usize) -> Result<Value> {
        match self.args.get(index) {
            Some(&raw) => Value::from_raw_in(raw, self.scope.clone()),
            None => self.cx.undefined(),
        }
    }

    pub fn new_target(&self) -> Option<&Value> {
        self.new_target.as_ref()
    }

    pub fn is_construct_call(&self) -> bool {
        self.new_target.is_some()
    }

    /// Data attached to the descriptor this callback was registered with.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data?.downcast_ref::<T>()
    }

    /// The host object wrapped by `this`.
    pub fn this_object<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.this.unwrap::<T>()
    }

    /// `Some(object)` when the only argument is an external carrying a `T`:
    /// the registry asks a constructor to adopt an existing host object.
    pub(crate) fn adopted<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>> {
        if self.len() != 1 {
            return Ok(None);
        }
        let arg = self.get(0)?;
        if !arg.is_external()? {
            return Ok(None);
        }
        Ok(arg.external::<T>().ok())
    }
}

#[derive(Clone, Copy)]
enum Entry {
    Function,
    Getter,
    Setter,
    Constructor,
}

pub(crate) fn invoke_function(env: &Env, info: &CallbackInfo) -> RawValue {
    trampoline(env, info, Entry::Function)
}

pub(crate) fn invoke_getter(env: &Env, info: &CallbackInfo) -> RawValue {
    trampoline(env, info, Entry::Getter)
}

pub(crate) fn invoke_setter(env: &Env, info: &CallbackInfo) -> RawValue {
    trampoline(env, info, Entry::Setter)
}

pub(crate) fn invoke_constructor(env: &Env, info: &CallbackInfo) -> RawValue {
    trampoline(env, info, Entry::Constructor)
}

fn trampoline(env: &Env, info: &CallbackInfo, entry: Entry) -> RawValue {
    let data = match env.get_cb_info(info, &mut []) {
        Ok(cb) => cb.data,
        Err(status) => {
            log::error!("callback info unavailable: {status}");
            return RawValue::NULL;
        }
    };
    let Some(data) = data.downcast_ref::<CallbackData>() else {
        let _ = env.throw_error(
            ErrorKind::TypeError,
            None,
            "callback data is not a host callback",
        );
        return RawValue::NULL;
    };
    let Some(cx) = data.cx.upgrade().map(Context::from_inner) else {
        let _ = env.throw_error(
            ErrorKind::Error,
            Some("ERR_USAGE"),
            "callback invoked after its context was torn down",
        );
        return RawValue::NULL;
    };

    let scope = match Scope::open(&cx, ScopeKind::Callback) {
        Ok(scope) => scope,
        Err(error) => {
            cx.throw_error(&error);
            return RawValue::NULL;
        }
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        dispatch(&cx, env, info, data, entry, scope.state())
    }));
    let result = match outcome {
        Ok(Ok(value)) => scope.escape(&value).and_then(|value| value.raw()),
        Ok(Err(error)) => Err(error),
        Err(payload) => Err(Error::host(format!(
            "host callback panicked: {}",
            panic_message(&*payload)
        ))),
    };
    let raw = match result {
        Ok(raw) => raw,
        Err(error) => {
            log::trace!("callback failed: {error}");
            cx.throw_error(&error);
            RawValue::NULL
        }
    };
    if let Err(error) = scope.close_unwinding() {
        log::error!("callback scope left open: {error}");
        // its drop would panic across the engine boundary
        std::mem::forget(scope);
    }
    raw
}

fn dispatch(
    cx: &Context,
    env: &Env,
    info: &CallbackInfo,
    data: &CallbackData,
    entry: Entry,
    scope: &Rc<ScopeState>,
) -> Result<Value> {
    let argc = cx.check(env.get_cb_info(info, &mut []))?.argc;
    let mut inline = [RawValue::NULL; INLINE_ARGS];
    let mut spilled = Vec::new();
    let argv: &mut [RawValue] = if argc <= cx.settings().inline_args {
        &mut inline[..argc]
    } else {
        spilled.resize(argc, RawValue::NULL);
        &mut spilled
    };
    let cb = cx.check(env.get_cb_info(info, argv))?;
    let new_target = cx
        .check(env.get_new_target(info))?
        .map(|raw| Value::new(cx, raw))
        .transpose()?;
    let args = CallbackArgs {
        cx,
        scope: scope.clone(),
        this: Value::new(cx, cb.this)?,
        args: argv,
        new_target,
        data: data.data.as_ref(),
    };

    match (&data.kind, entry) {
        (CallbackKind::Function(f), Entry::Function)
        | (CallbackKind::Constructor(f), Entry::Constructor) => f(&args),
        (CallbackKind::Accessor { getter: Some(get), .. }, Entry::Getter) => {
            get(&args)
        }
        (CallbackKind::Accessor { setter: Some(set), .. }, Entry::Setter) => {
            let value = args.get(0)?;
            set(&args, value)?;
            cx.undefined()
        }
        _ => Err(Error::usage("callback registered for a different entry")),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ContextCreateInfo,
        descriptor::PropertyDescriptor,
        engine::EngineCreateInfo,
    };

    fn context() -> Context {
        let env = Env::new(EngineCreateInfo::default());
        Context::new(&env, ContextCreateInfo::default()).unwrap()
    }

    #[test]
    fn missing_arguments_read_as_undefined() {
        let cx = context();
        let f = cx
            .function("count", |args| {
                assert_eq!(args.len(), 1);
                assert!(args.get(3)?.is_undefined()?);
                args.context().int32(args.get(0)?.to_i32()? * 2)
            })
            .unwrap();
        let result = f
            .call(&cx.undefined().unwrap(), &[cx.int32(21).unwrap()])
            .unwrap();
        assert_eq!(result.to_i32().unwrap(), 42);
    }

    #[test]
    fn many_arguments_spill_to_the_heap() {
        let cx = context();
        let f = cx
            .function("sum", |args| {
                let mut total = 0.0;
                for i in 0..args.len() {
                    total += args.get(i)?.to_f64()?;
                }
                args.context().number(total)
            })
            .unwrap();
        let args: Vec<Value> =
            (1..=20).map(|n| cx.number(n as f64).unwrap()).collect();
        let result = f.call(&cx.undefined().unwrap(), &args).unwrap();
        assert_eq!(result.to_f64().unwrap(), 210.0);
    }

    #[test]
    fn callback_scope_is_closed_on_every_path() {
        let cx = context();
        let ok = cx.function("ok", |args| args.context().object()).unwrap();
        let failing = cx
            .function("failing", |_| Err(Error::host("nope")))
            .unwrap();
        let baseline = cx.env().open_handle_count();

        cx.scope(|cx| {
            let undefined = cx.undefined()?;
            ok.call(&undefined, &[])?;
            assert!(failing.call(&undefined, &[]).is_err());
            Ok(())
        })
        .unwrap();
        assert_eq!(cx.env().open_handle_count(), baseline);
        assert_eq!(cx.current_scope().id(), 0);
    }

    #[test]
    fn arguments_outlive_nested_scopes() {
        let cx = context();
        let f = cx
            .function("nested", |args| {
                let inner = Scope::handle(args.context())?;
                let value = args.get(0)?;
                inner.close()?;
                args.context().number(value.to_f64()? + 1.0)
            })
            .unwrap();
        let result = f
            .call(&cx.undefined().unwrap(), &[cx.number(1.5).unwrap()])
            .unwrap();
        assert_eq!(result.to_f64().unwrap(), 2.5);
    }

    #[test]
    fn leaked_inner_scopes_are_unwound() {
        let cx = context();
        let leaky = cx
            .function("leaky", |args| {
                std::mem::forget(Scope::handle(args.context())?);
                args.context().int32(5)
            })
            .unwrap();
        let root = cx.current_scope();
        let result = leaky.call(&cx.undefined().unwrap(), &[]).unwrap();
        assert_eq!(result.to_i32().unwrap(), 5);
        assert!(Rc::ptr_eq(&cx.current_scope(), &root));
        assert!(!cx.env().is_exception_pending());
    }

    #[test]
    fn panics_become_script_exceptions() {
        let cx = context();
        let f = cx.function("explode", |_| panic!("kaboom")).unwrap();
        let error = f.call(&cx.undefined().unwrap(), &[]).unwrap_err();
        assert_eq!(error.message(), "host callback panicked: kaboom");
        assert!(!cx.env().is_exception_pending());
    }

    #[test]
    fn descriptor_data_reaches_the_callback() {
        let cx = context();
        let target = cx.object().unwrap();
        cx.define_properties(
            &target,
            &[PropertyDescriptor::getter("label", |args| {
                let label = args.data::<String>().cloned().unwrap_or_default();
                args.context().string(&label)
            })
            .with_data(Arc::new(String::from("tagged")))],
        )
        .unwrap();
        let label = target.get_named("label").unwrap();
        assert_eq!(label.to_string_utf8().unwrap(), "tagged");
    }

    #[test]
    fn setters_receive_the_assigned_value() {
        let cx = context();
        let seen = Rc::new(std::cell::Cell::new(0.0));
        let sink = seen.clone();
        let target = cx.object().unwrap();
        cx.define_properties(
            &target,
            &[PropertyDescriptor::setter("value", move |_, value| {
                sink.set(value.to_f64()?);
                Ok(())
            })],
        )
        .unwrap();
        target.set_named("value", &cx.number(2.5).unwrap()).unwrap();
        assert_eq!(seen.get(), 2.5);
    }

    #[test]
    fn callbacks_fail_after_their_context_is_gone() {
        let env = Env::new(EngineCreateInfo::default());
        let outer = Context::new(&env, ContextCreateInfo::default()).unwrap();
        let scope = Scope::handle(&outer).unwrap();
        let f = {
            let inner = Context::new(&env, ContextCreateInfo::default()).unwrap();
            let f = inner.function("orphan", |args| args.context().null()).unwrap();
            let raw = f.raw().unwrap();
            Value::new(&outer, raw).unwrap()
        };
        let error = f.call(&outer.undefined().unwrap(), &[]).unwrap_err();
        assert!(error.message().contains("torn down"), "{error:?}");
        scope.close().unwrap();
    }
}
