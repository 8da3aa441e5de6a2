use std::collections::HashMap;

use hostbridge::{
    ClassBuilder, Context, ContextCreateInfo, Error, FromScript,
    PropertyDescriptor, Scope, ToScript, Value,
    engine::{EngineCreateInfo, Env, ErrorKind},
    register_module,
};
use parking_lot::RwLock;

fn context() -> (Env, Context) {
    let _ = env_logger::builder().is_test(true).try_init();
    let env = Env::new(EngineCreateInfo::default());
    let cx = Context::new(&env, ContextCreateInfo::default()).unwrap();
    (env, cx)
}

fn round_trip<T>(cx: &Context, value: T) -> T
where
    T: ToScript + FromScript,
{
    let script = value.to_script(cx).unwrap();
    T::from_script(&script).unwrap()
}

#[test]
fn primitives_round_trip_exactly() {
    let (_env, cx) = context();
    assert!(round_trip(&cx, true));
    assert_eq!(round_trip(&cx, i32::MIN), i32::MIN);
    assert_eq!(round_trip(&cx, u32::MAX), u32::MAX);
    assert_eq!(round_trip(&cx, -(1i64 << 53)), -(1i64 << 53));
    for number in [0.1 + 0.2, -0.0, f64::MAX, f64::MIN_POSITIVE, 1e-310] {
        assert_eq!(round_trip(&cx, number).to_bits(), number.to_bits());
    }
    assert!(round_trip(&cx, f64::NAN).is_nan());
}

#[test]
fn strings_round_trip_in_every_encoding() {
    let (_env, cx) = context();
    let text = "grüße, 世界 🚀";
    assert_eq!(round_trip(&cx, text.to_string()), text);

    let units: Vec<u16> = text.encode_utf16().collect();
    let value = cx.string_utf16(&units).unwrap();
    assert_eq!(value.to_utf16().unwrap(), units);
    assert_eq!(value.to_string_utf8().unwrap(), text);

    let latin1 = cx.string_latin1(b"caf\xe9").unwrap();
    assert_eq!(latin1.to_string_utf8().unwrap(), "café");
    assert_eq!(latin1.to_latin1().unwrap(), b"caf\xe9");
}

#[test]
fn arrays_and_nested_objects_round_trip() {
    let (_env, cx) = context();
    let matrix = vec![vec![1.5, 2.5], vec![], vec![-3.0]];
    assert_eq!(round_trip(&cx, matrix.clone()), matrix);

    let mut inner = HashMap::new();
    inner.insert("depth".to_string(), vec!["a".to_string(), "b".to_string()]);
    let mut outer = HashMap::new();
    outer.insert("nested".to_string(), inner.clone());
    outer.insert("empty".to_string(), HashMap::new());
    assert_eq!(round_trip(&cx, outer.clone()), outer);

    let value = outer.to_script(&cx).unwrap();
    let depth = value
        .get_named("nested")
        .unwrap()
        .get_named("depth")
        .unwrap();
    assert_eq!(depth.array_length().unwrap(), 2);
}

#[test]
fn script_error_messages_reach_the_host_unchanged() {
    let (_env, cx) = context();
    let message = "the script said no: ünïcode & \"quotes\"";
    let thrower = cx
        .function("thrower", move |args| {
            let cx = args.context();
            cx.error(message, None)?.throw()?;
            cx.undefined()
        })
        .unwrap();
    let error = thrower.call(&cx.undefined().unwrap(), &[]).unwrap_err();
    assert!(matches!(error, Error::Exception { .. }));
    assert_eq!(error.message(), message);
    assert_eq!(error.to_string(), message);
}

#[test]
fn engine_errors_thrown_by_script_are_not_masked() {
    let (env, cx) = context();
    let thrower = cx
        .function("thrower", |args| {
            let env = args.context().env();
            env.throw_error(ErrorKind::RangeError, Some("E_RANGE"), "out of range")
                .map_err(Error::engine)?;
            args.context().undefined()
        })
        .unwrap();
    let error = thrower.call(&cx.undefined().unwrap(), &[]).unwrap_err();
    assert_eq!(error.message(), "out of range");
    assert!(!env.is_exception_pending());
}

#[test]
fn host_errors_survive_a_trip_through_script() {
    let (_env, cx) = context();
    let failing = cx
        .function("failing", |_| Err(Error::usage("double registration")))
        .unwrap();
    let error = failing.call(&cx.undefined().unwrap(), &[]).unwrap_err();
    assert!(matches!(error, Error::Usage(ref message) if message == "double registration"));
}

#[derive(Default)]
struct Point {
    x: RwLock<f64>,
    y: RwLock<f64>,
}

fn define_point(cx: &Context) -> Value {
    ClassBuilder::<Point>::new("Point")
        .constructor(|_| Ok(Point::default()))
        .property(
            "x",
            |args, point| args.context().number(*point.x.read()),
            |_, point, value| {
                *point.x.write() = value.to_f64()?;
                Ok(())
            },
        )
        .property(
            "y",
            |args, point| args.context().number(*point.y.read()),
            |_, point, value| {
                *point.y.write() = value.to_f64()?;
                Ok(())
            },
        )
        .define(cx)
        .unwrap()
}

#[test]
fn point_class_round_trip() {
    let (_env, cx) = context();
    let point_class = define_point(&cx);
    let scope = Scope::handle(&cx).unwrap();
    let point = point_class.construct(&[]).unwrap();
    point.set_named("x", &cx.number(3.0).unwrap()).unwrap();
    point.set_named("y", &cx.number(4.0).unwrap()).unwrap();
    let x = point.get_named("x").unwrap().to_f64().unwrap();
    let y = point.get_named("y").unwrap().to_f64().unwrap();
    assert_eq!(x + y, 7.0);

    let host = point.unwrap::<Point>().unwrap();
    assert_eq!(*host.x.read(), 3.0);
    assert_eq!(*host.y.read(), 4.0);
    scope.close().unwrap();
}

#[test]
fn modules_export_classes() {
    let _ = env_logger::builder().is_test(true).try_init();
    let env = Env::new(EngineCreateInfo::default());
    let exports = env.create_object().unwrap();
    let mut context = None;
    let out = register_module(
        &env,
        exports,
        ContextCreateInfo::default(),
        |cx, exports| {
            let point = define_point(cx);
            context = Some(cx.clone());
            cx.export_module(
                exports,
                &[
                    PropertyDescriptor::value("Point", point),
                    PropertyDescriptor::method("origin", |args| {
                        let cx = args.context();
                        let point = std::sync::Arc::new(Point::default());
                        cx.registry().get_or_create_object_wrapper(cx, &point)
                    }),
                ],
            )
        },
    );
    let cx = context.unwrap();
    let exports = Value::new(&cx, out).unwrap();
    let origin = exports.call_method("origin", &[]).unwrap();
    let point_class = exports.get_named("Point").unwrap();
    assert!(origin.instance_of(&point_class).unwrap());
    assert_eq!(origin.get_named("x").unwrap().to_f64().unwrap(), 0.0);

    env.shutdown();
    assert!(cx.is_torn_down());
}
