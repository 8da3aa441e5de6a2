use crate::{
    Result,
    context::{Context, ContextCreateInfo},
    engine::{Env, ErrorKind, RawValue},
    scope::{Scope, ScopeKind},
    value::Value,
};

/// Module entry point. Builds the module's [`Context`], runs `init` against
/// `exports` inside a module scope and hands back the exports object the
/// engine should use.
///
/// A failing `init` is logged and thrown into the engine, and the original
/// `exports` is returned. The context is torn down when the engine shuts
/// down.
pub fn register_module(
    env: &Env,
    exports: RawValue,
    info: ContextCreateInfo,
    init: impl FnOnce(&Context, &Value) -> Result<Value>,
) -> RawValue {
    let cx = match Context::new(env, info) {
        Ok(cx) => cx,
        Err(error) => {
            log::error!("module context could not be created: {error}");
            if env
                .throw_error(ErrorKind::Error, None, error.message())
                .is_err()
            {
                log::error!("module error could not be thrown");
            }
            return exports;
        }
    };

    let cleanup = cx.clone();
    env.add_cleanup_hook(Box::new(move || cleanup.teardown()));

    match initialize(&cx, exports, init) {
        Ok(raw) => raw,
        Err(error) => {
            log::error!("module registration failed: {error}");
            cx.throw_error(&error);
            exports
        }
    }
}

fn initialize(
    cx: &Context,
    exports: RawValue,
    init: impl FnOnce(&Context, &Value) -> Result<Value>,
) -> Result<RawValue> {
    let scope = Scope::open(cx, ScopeKind::Module)?;
    let result = Value::new(cx, exports)
        .and_then(|exports| init(cx, &exports))
        .and_then(|value| scope.escape(&value));
    scope.close()?;
    result?.raw()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Error,
        descriptor::PropertyDescriptor,
        engine::EngineCreateInfo,
    };

    #[test]
    fn exports_are_populated() {
        let env = Env::new(EngineCreateInfo::default());
        let exports = env.create_object().unwrap();
        let out = register_module(
            &env,
            exports,
            ContextCreateInfo::default(),
            |cx, exports| {
                cx.export_module(
                    exports,
                    &[PropertyDescriptor::method("answer", |args| {
                        args.context().int32(42)
                    })],
                )
            },
        );
        assert!(env.strict_equals(out, exports).unwrap());
        let answer = env.get_named_property(out, "answer").unwrap();
        let global = env.get_global().unwrap();
        let result = env.call_function(global, answer, &[]).unwrap();
        assert_eq!(env.get_value_int32(result).unwrap(), 42);
    }

    #[test]
    fn exports_can_be_replaced() {
        let env = Env::new(EngineCreateInfo::default());
        let exports = env.create_object().unwrap();
        let out = register_module(
            &env,
            exports,
            ContextCreateInfo::default(),
            |cx, _| cx.string("replaced"),
        );
        assert!(!env.strict_equals(out, exports).unwrap());
        assert_eq!(env.typeof_value(out).unwrap(), crate::engine::ValueType::String);
    }

    #[test]
    fn failures_throw_and_keep_the_original_exports() {
        let env = Env::new(EngineCreateInfo::default());
        let exports = env.create_object().unwrap();
        let out = register_module(
            &env,
            exports,
            ContextCreateInfo::default(),
            |_, _| Err(Error::host("bad module")),
        );
        assert!(env.strict_equals(out, exports).unwrap());
        assert!(env.is_exception_pending());
        let error = env.get_and_clear_last_exception().unwrap();
        let message = env.get_named_property(error, "message").unwrap();
        let mut buf = vec![0u8; 32];
        let len = env.get_value_string_utf8(message, Some(&mut buf)).unwrap();
        assert_eq!(&buf[..len], b"bad module");
    }

    #[test]
    fn shutdown_tears_the_context_down() {
        let env = Env::new(EngineCreateInfo::default());
        let exports = env.create_object().unwrap();
        let mut seen = None;
        register_module(
            &env,
            exports,
            ContextCreateInfo::default(),
            |cx, exports| {
                seen = Some(cx.clone());
                Ok(exports.clone())
            },
        );
        let cx = seen.unwrap();
        assert!(!cx.is_torn_down());
        env.shutdown();
        assert!(cx.is_torn_down());
    }
}
