use std::{any::Any, fmt, rc::Rc, sync::Arc};

use crate::{
    Error, Result,
    context::Context,
    engine::{Env, RawValue, Status, TypedArrayKind, ValueType},
    scope::ScopeState,
};

/// One script value, valid while the scope that produced it is open.
///
/// Values are cheap to clone and own no engine resources. Every operation
/// checks the owning scope first and fails with [`Error::Usage`] once it
/// has closed.
#[derive(Clone)]
pub struct Value {
    raw: RawValue,
    scope: Rc<ScopeState>,
}

/// A typed array's layout as reported by the engine.
#[derive(Debug, Clone)]
pub struct TypedArrayView {
    pub kind: TypedArrayKind,
    pub length: usize,
    pub buffer: Value,
    pub byte_offset: usize,
}

impl Value {
    /// Wraps `raw` in the context's current scope.
    pub fn new(cx: &Context, raw: RawValue) -> Result<Value> {
        Value::from_raw_in(raw, cx.current_scope())
    }

    pub(crate) fn from_raw_in(
        raw: RawValue,
        scope: Rc<ScopeState>,
    ) -> Result<Value> {
        if raw.is_null() {
            return Err(Error::usage("cannot create a value from a null handle"));
        }
        scope.ensure_open()?;
        Ok(Value { raw, scope })
    }

    /// The engine handle, if the owning scope is still open.
    pub fn raw(&self) -> Result<RawValue> {
        self.scope.ensure_open()?;
        Ok(self.raw)
    }

    pub fn is_live(&self) -> bool {
        !self.scope.is_disposed()
    }

    pub fn scope_id(&self) -> u64 {
        self.scope.id()
    }

    pub fn context(&self) -> Result<Context> {
        self.scope.context()
    }

    fn engine<T>(
        &self,
        op: impl FnOnce(&Env, RawValue) -> std::result::Result<T, Status>,
    ) -> Result<T> {
        let cx = self.context()?;
        let result = op(cx.env(), self.raw);
        cx.check(result)
    }

    fn derive(
        &self,
        op: impl FnOnce(&Env, RawValue) -> std::result::Result<RawValue, Status>,
    ) -> Result<Value> {
        let cx = self.context()?;
        let result = op(cx.env(), self.raw);
        let raw = cx.check(result)?;
        Value::new(&cx, raw)
    }

    fn raw_of(&self, cx: &Context, other: &Value) -> Result<RawValue> {
        let other_cx = other.context()?;
        if !other_cx.env().ptr_eq(cx.env()) {
            return Err(Error::usage("values belong to different engines"));
        }
        other.raw()
    }

    // ── type tests ─────────────────────────────────────────────────

    pub fn value_type(&self) -> Result<ValueType> {
        self.engine(|env, raw| env.typeof_value(raw))
    }

    pub fn is_undefined(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Undefined)
    }

    pub fn is_null(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Null)
    }

    pub fn is_nullish(&self) -> Result<bool> {
        Ok(matches!(
            self.value_type()?,
            ValueType::Undefined | ValueType::Null
        ))
    }

    pub fn is_bool(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Boolean)
    }

    pub fn is_number(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Number)
    }

    pub fn is_string(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::String)
    }

    pub fn is_symbol(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Symbol)
    }

    /// True for every object-like value: plain objects, functions and
    /// externals.
    pub fn is_object(&self) -> Result<bool> {
        Ok(matches!(
            self.value_type()?,
            ValueType::Object | ValueType::Function | ValueType::External
        ))
    }

    pub fn is_function(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Function)
    }

    pub fn is_external(&self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::External)
    }

    pub fn is_array(&self) -> Result<bool> {
        self.engine(|env, raw| env.is_array(raw))
    }

    pub fn is_array_buffer(&self) -> Result<bool> {
        self.engine(|env, raw| env.is_arraybuffer(raw))
    }

    pub fn is_typed_array(&self) -> Result<bool> {
        self.engine(|env, raw| env.is_typedarray(raw))
    }

    pub fn is_error(&self) -> Result<bool> {
        self.engine(|env, raw| env.is_error(raw))
    }

    pub fn is_promise(&self) -> Result<bool> {
        self.engine(|env, raw| env.is_promise(raw))
    }

    // ── extraction ─────────────────────────────────────────────────

    pub fn to_bool(&self) -> Result<bool> {
        self.engine(|env, raw| env.get_value_bool(raw))
    }

    pub fn to_f64(&self) -> Result<f64> {
        self.engine(|env, raw| env.get_value_double(raw))
    }

    pub fn to_i32(&self) -> Result<i32> {
        self.engine(|env, raw| env.get_value_int32(raw))
    }

    pub fn to_u32(&self) -> Result<u32> {
        self.engine(|env, raw| env.get_value_uint32(raw))
    }

    pub fn to_i64(&self) -> Result<i64> {
        self.engine(|env, raw| env.get_value_int64(raw))
    }

    pub fn to_string_utf8(&self) -> Result<String> {
        self.engine(|env, raw| {
            let len = env.get_value_string_utf8(raw, None)?;
            let mut buf = vec![0u8; len + 1];
            let written = env.get_value_string_utf8(raw, Some(&mut buf))?;
            buf.truncate(written);
            // the engine only ever copies whole characters
            String::from_utf8(buf).map_err(|_| Status::StringExpected)
        })
    }

    pub fn to_utf16(&self) -> Result<Vec<u16>> {
        self.engine(|env, raw| {
            let len = env.get_value_string_utf16(raw, None)?;
            let mut buf = vec![0u16; len + 1];
            let written = env.get_value_string_utf16(raw, Some(&mut buf))?;
            buf.truncate(written);
            Ok(buf)
        })
    }

    pub fn to_latin1(&self) -> Result<Vec<u8>> {
        self.engine(|env, raw| {
            let len = env.get_value_string_latin1(raw, None)?;
            let mut buf = vec![0u8; len + 1];
            let written = env.get_value_string_latin1(raw, Some(&mut buf))?;
            buf.truncate(written);
            Ok(buf)
        })
    }

    // ── coercion ───────────────────────────────────────────────────

    pub fn coerce_to_bool(&self) -> Result<Value> {
        self.derive(|env, raw| env.coerce_to_bool(raw))
    }

    pub fn coerce_to_number(&self) -> Result<Value> {
        self.derive(|env, raw| env.coerce_to_number(raw))
    }

    pub fn coerce_to_string(&self) -> Result<Value> {
        self.derive(|env, raw| env.coerce_to_string(raw))
    }

    pub fn coerce_to_object(&self) -> Result<Value> {
        self.derive(|env, raw| env.coerce_to_object(raw))
    }

    // ── properties ─────────────────────────────────────────────────

    pub fn get(&self, key: &Value) -> Result<Value> {
        let cx = self.context()?;
        let key = self.raw_of(&cx, key)?;
        self.derive(|env, raw| env.get_property(raw, key))
    }

    pub fn set(&self, key: &Value, value: &Value) -> Result<()> {
        let cx = self.context()?;
        let key = self.raw_of(&cx, key)?;
        let value = self.raw_of(&cx, value)?;
        self.engine(|env, raw| env.set_property(raw, key, value))
    }

    pub fn has(&self, key: &Value) -> Result<bool> {
        let cx = self.context()?;
        let key = self.raw_of(&cx, key)?;
        self.engine(|env, raw| env.has_property(raw, key))
    }

    pub fn has_own(&self, key: &Value) -> Result<bool> {
        let cx = self.context()?;
        let key = self.raw_of(&cx, key)?;
        self.engine(|env, raw| env.has_own_property(raw, key))
    }

    pub fn delete(&self, key: &Value) -> Result<bool> {
        let cx = self.context()?;
        let key = self.raw_of(&cx, key)?;
        self.engine(|env, raw| env.delete_property(raw, key))
    }

    pub fn get_named(&self, name: &str) -> Result<Value> {
        self.derive(|env, raw| env.get_named_property(raw, name))
    }

    pub fn set_named(&self, name: &str, value: &Value) -> Result<()> {
        let cx = self.context()?;
        let value = self.raw_of(&cx, value)?;
        self.engine(|env, raw| env.set_named_property(raw, name, value))
    }

    pub fn has_named(&self, name: &str) -> Result<bool> {
        self.engine(|env, raw| env.has_named_property(raw, name))
    }

    pub fn get_index(&self, index: u32) -> Result<Value> {
        self.derive(|env, raw| env.get_element(raw, index))
    }

    pub fn set_index(&self, index: u32, value: &Value) -> Result<()> {
        let cx = self.context()?;
        let value = self.raw_of(&cx, value)?;
        self.engine(|env, raw| env.set_element(raw, index, value))
    }

    pub fn has_index(&self, index: u32) -> Result<bool> {
        self.engine(|env, raw| env.has_element(raw, index))
    }

    pub fn delete_index(&self, index: u32) -> Result<bool> {
        self.engine(|env, raw| env.delete_element(raw, index))
    }

    pub fn array_length(&self) -> Result<u32> {
        self.engine(|env, raw| env.get_array_length(raw))
    }

    /// Enumerable own string keys as a script array.
    pub fn property_names(&self) -> Result<Value> {
        self.derive(|env, raw| env.get_property_names(raw))
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let names = self.property_names()?;
        (0..names.array_length()?)
            .map(|i| names.get_index(i)?.to_string_utf8())
            .collect()
    }

    pub fn prototype(&self) -> Result<Value> {
        self.derive(|env, raw| env.get_prototype(raw))
    }

    // ── buffers ────────────────────────────────────────────────────

    pub fn array_buffer_bytes(&self) -> Result<Vec<u8>> {
        self.engine(|env, raw| env.get_arraybuffer_data(raw))
    }

    pub fn write_array_buffer(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.engine(|env, raw| env.write_arraybuffer_data(raw, offset, bytes))
    }

    pub fn typed_array_info(&self) -> Result<TypedArrayView> {
        let cx = self.context()?;
        let info = self.engine(|env, raw| env.get_typedarray_info(raw))?;
        Ok(TypedArrayView {
            kind: info.kind,
            length: info.length,
            buffer: Value::new(&cx, info.buffer)?,
            byte_offset: info.byte_offset,
        })
    }

    // ── calls ──────────────────────────────────────────────────────

    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value> {
        let cx = self.context()?;
        let this = self.raw_of(&cx, this)?;
        let args = args
            .iter()
            .map(|arg| self.raw_of(&cx, arg))
            .collect::<Result<Vec<_>>>()?;
        self.derive(|env, raw| env.call_function(this, raw, &args))
    }

    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Value> {
        let method = self.get_named(name)?;
        if !method.is_function()? {
            return Err(Error::host(format!("{name} is not a function")));
        }
        method.call(self, args)
    }

    pub fn construct(&self, args: &[Value]) -> Result<Value> {
        let cx = self.context()?;
        let args = args
            .iter()
            .map(|arg| self.raw_of(&cx, arg))
            .collect::<Result<Vec<_>>>()?;
        self.derive(|env, raw| env.new_instance(raw, &args))
    }

    pub fn strict_equals(&self, other: &Value) -> Result<bool> {
        let cx = self.context()?;
        let other = self.raw_of(&cx, other)?;
        self.engine(|env, raw| env.strict_equals(raw, other))
    }

    pub fn instance_of(&self, constructor: &Value) -> Result<bool> {
        let cx = self.context()?;
        let constructor = self.raw_of(&cx, constructor)?;
        self.engine(|env, raw| env.instanceof(raw, constructor))
    }

    // ── host payloads ──────────────────────────────────────────────

    /// The host object carried by an external created with
    /// [`Context::external`].
    pub fn external<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let payload = self.engine(|env, raw| env.get_value_external(raw))?;
        downcast_payload(payload)
    }

    /// The host object wrapped by this script object.
    pub fn unwrap<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        let payload = self.engine(|env, raw| env.unwrap(raw))?;
        downcast_payload(payload)
    }

    /// Like [`Value::unwrap`] but `None` when nothing, or something of a
    /// different type, is wrapped.
    pub fn try_unwrap<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>> {
        let cx = self.context()?;
        match cx.env().unwrap(self.raw) {
            Ok(payload) => Ok(payload.downcast_ref::<Arc<T>>().cloned()),
            Err(Status::InvalidArg) if self.is_object()? => Ok(None),
            Err(status) => cx.check(Err(status)),
        }
    }

    /// Makes this value the pending exception.
    pub fn throw(&self) -> Result<()> {
        self.engine(|env, raw| env.throw(raw))
    }
}

fn downcast_payload<T: Any + Send + Sync>(
    payload: Rc<dyn Any>,
) -> Result<Arc<T>> {
    payload.downcast_ref::<Arc<T>>().cloned().ok_or_else(|| {
        Error::usage(format!(
            "host payload is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("raw", &self.raw)
            .field("scope", &self.scope.id())
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ContextCreateInfo,
        engine::{EngineCreateInfo, Env},
        scope::Scope,
    };

    fn context() -> Context {
        let env = Env::new(EngineCreateInfo::default());
        Context::new(&env, ContextCreateInfo::default()).unwrap()
    }

    #[test]
    fn null_handles_are_rejected() {
        let cx = context();
        let error = Value::new(&cx, RawValue::NULL).unwrap_err();
        assert!(matches!(error, Error::Usage(_)));
    }

    #[test]
    fn strings_round_trip_through_every_encoding() {
        let cx = context();
        let text = "grüße, 世界 🎉";
        let value = cx.string(text).unwrap();
        assert_eq!(value.to_string_utf8().unwrap(), text);
        assert_eq!(
            value.to_utf16().unwrap(),
            text.encode_utf16().collect::<Vec<_>>()
        );

        let utf16 = cx.string_utf16(&value.to_utf16().unwrap()).unwrap();
        assert!(utf16.strict_equals(&value).unwrap());

        let latin1 = cx.string_latin1(b"caf\xe9").unwrap();
        assert_eq!(latin1.to_latin1().unwrap(), b"caf\xe9");
        assert_eq!(latin1.to_string_utf8().unwrap(), "café");
    }

    #[test]
    fn numbers_keep_their_bits() {
        let cx = context();
        for n in [0.1, -0.0, f64::MAX, f64::MIN_POSITIVE, 1e-300] {
            let value = cx.number(n).unwrap();
            assert_eq!(value.to_f64().unwrap().to_bits(), n.to_bits());
        }
        assert_eq!(cx.int32(i32::MIN).unwrap().to_i32().unwrap(), i32::MIN);
        assert_eq!(cx.uint32(u32::MAX).unwrap().to_u32().unwrap(), u32::MAX);
        let big = 1i64 << 53;
        assert_eq!(cx.int64(big).unwrap().to_i64().unwrap(), big);
    }

    #[test]
    fn type_mismatch_reports_engine_status() {
        let cx = context();
        let value = cx.string("nope").unwrap();
        match value.to_f64().unwrap_err() {
            Error::Engine { status, message } => {
                assert_eq!(status, Status::NumberExpected);
                assert_eq!(message, "A number was expected");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn property_access_by_name_index_and_key() {
        let cx = context();
        let object = cx.object().unwrap();
        object.set_named("a", &cx.number(1.0).unwrap()).unwrap();
        let key = cx.string("b").unwrap();
        object.set(&key, &cx.number(2.0).unwrap()).unwrap();
        object.set_index(0, &cx.boolean(true).unwrap()).unwrap();

        assert!(object.has_named("a").unwrap());
        assert!(object.has_own(&key).unwrap());
        assert!(object.get_index(0).unwrap().to_bool().unwrap());
        assert_eq!(object.get(&key).unwrap().to_f64().unwrap(), 2.0);

        let mut keys = object.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["0", "a", "b"]);

        assert!(object.delete(&key).unwrap());
        assert!(!object.has(&key).unwrap());
    }

    #[test]
    fn values_from_closed_scopes_fail_loudly() {
        let cx = context();
        let object = cx.object().unwrap();
        let scope = Scope::handle(&cx).unwrap();
        let inner = cx.number(5.0).unwrap();
        scope.close().unwrap();

        assert!(!inner.is_live());
        assert!(matches!(
            object.set_named("x", &inner).unwrap_err(),
            Error::Usage(_)
        ));
    }

    #[test]
    fn externals_carry_host_objects() {
        let cx = context();
        let payload = Arc::new(String::from("host"));
        let external = cx.external(payload.clone()).unwrap();
        assert!(external.is_external().unwrap());
        let back = external.external::<String>().unwrap();
        assert!(Arc::ptr_eq(&payload, &back));
        assert!(external.external::<u32>().is_err());
    }

    #[test]
    fn typed_array_views_expose_their_buffer() {
        let cx = context();
        let buffer = cx.array_buffer(&[1, 2, 3, 4]).unwrap();
        let view = cx
            .typed_array(TypedArrayKind::Uint8, &buffer, 1, 2)
            .unwrap();
        let info = view.typed_array_info().unwrap();
        assert_eq!(info.length, 2);
        assert_eq!(info.byte_offset, 1);
        assert_eq!(info.buffer.array_buffer_bytes().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(view.get_index(1).unwrap().to_u32().unwrap(), 3);
    }
}
