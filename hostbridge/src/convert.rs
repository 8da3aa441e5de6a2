//! Conversions between host values and script values.
//!
//! Adapters that need a conversion without a concrete type in hand (the
//! proxy projections, for instance) take a [`ToScriptFn`] / [`FromScriptFn`]
//! pair instead of a trait bound.

use std::{collections::HashMap, sync::Arc};

use crate::{Error, Result, context::Context, value::Value};

pub type ToScriptFn<T> = Arc<dyn Fn(&Context, &T) -> Result<Value> + Send + Sync>;
pub type FromScriptFn<T> = Arc<dyn Fn(&Value) -> Result<T> + Send + Sync>;

pub trait ToScript {
    fn to_script(&self, cx: &Context) -> Result<Value>;
}

pub trait FromScript: Sized {
    fn from_script(value: &Value) -> Result<Self>;
}

/// The conversion pair of `T` as shareable function values.
pub fn converters<T: ToScript + FromScript + 'static>() -> (ToScriptFn<T>, FromScriptFn<T>) {
    (
        Arc::new(|cx: &Context, value: &T| value.to_script(cx)),
        Arc::new(|value: &Value| T::from_script(value)),
    )
}

impl ToScript for Value {
    fn to_script(&self, _cx: &Context) -> Result<Value> {
        Ok(self.clone())
    }
}

impl FromScript for Value {
    fn from_script(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl ToScript for () {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        cx.undefined()
    }
}

impl FromScript for () {
    fn from_script(_value: &Value) -> Result<Self> {
        Ok(())
    }
}

impl ToScript for bool {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        cx.boolean(*self)
    }
}

impl FromScript for bool {
    fn from_script(value: &Value) -> Result<Self> {
        value.to_bool()
    }
}

impl ToScript for i32 {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        cx.int32(*self)
    }
}

impl FromScript for i32 {
    fn from_script(value: &Value) -> Result<Self> {
        value.to_i32()
    }
}

impl ToScript for u32 {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        cx.uint32(*self)
    }
}

impl FromScript for u32 {
    fn from_script(value: &Value) -> Result<Self> {
        value.to_u32()
    }
}

impl ToScript for i64 {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        cx.int64(*self)
    }
}

impl FromScript for i64 {
    fn from_script(value: &Value) -> Result<Self> {
        value.to_i64()
    }
}

impl ToScript for f64 {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        cx.number(*self)
    }
}

impl FromScript for f64 {
    fn from_script(value: &Value) -> Result<Self> {
        value.to_f64()
    }
}

impl ToScript for str {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        cx.string(self)
    }
}

impl ToScript for String {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        cx.string(self)
    }
}

impl FromScript for String {
    fn from_script(value: &Value) -> Result<Self> {
        value.to_string_utf8()
    }
}

impl<T: ToScript> ToScript for Option<T> {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        match self {
            Some(value) => value.to_script(cx),
            None => cx.null(),
        }
    }
}

impl<T: FromScript> FromScript for Option<T> {
    fn from_script(value: &Value) -> Result<Self> {
        if value.is_nullish()? {
            return Ok(None);
        }
        T::from_script(value).map(Some)
    }
}

impl<T: ToScript> ToScript for [T] {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        let array = cx.array(self.len())?;
        for (i, item) in self.iter().enumerate() {
            array.set_index(i as u32, &item.to_script(cx)?)?;
        }
        Ok(array)
    }
}

impl<T: ToScript> ToScript for Vec<T> {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        self.as_slice().to_script(cx)
    }
}

impl<T: FromScript> FromScript for Vec<T> {
    fn from_script(value: &Value) -> Result<Self> {
        if !value.is_array()? {
            return Err(Error::host("expected an array"));
        }
        (0..value.array_length()?)
            .map(|i| T::from_script(&value.get_index(i)?))
            .collect()
    }
}

impl<T: ToScript> ToScript for HashMap<String, T> {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        let object = cx.object()?;
        for (key, item) in self {
            object.set_named(key, &item.to_script(cx)?)?;
        }
        Ok(object)
    }
}

impl<T: FromScript> FromScript for HashMap<String, T> {
    fn from_script(value: &Value) -> Result<Self> {
        if !value.is_object()? {
            return Err(Error::host("expected an object"));
        }
        value
            .keys()?
            .into_iter()
            .map(|key| {
                let item = T::from_script(&value.get_named(&key)?)?;
                Ok((key, item))
            })
            .collect()
    }
}

impl<T: ToScript + ?Sized> ToScript for &T {
    fn to_script(&self, cx: &Context) -> Result<Value> {
        (**self).to_script(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ContextCreateInfo,
        engine::{EngineCreateInfo, Env},
    };

    fn context() -> Context {
        let env = Env::new(EngineCreateInfo::default());
        Context::new(&env, ContextCreateInfo::default()).unwrap()
    }

    #[test]
    fn nested_collections_round_trip() {
        let cx = context();
        let mut map = HashMap::new();
        map.insert("primes".to_string(), vec![2i64, 3, 5, 7]);
        map.insert("empty".to_string(), Vec::new());
        let value = map.to_script(&cx).unwrap();
        assert!(value.get_named("primes").unwrap().is_array().unwrap());
        let back = HashMap::<String, Vec<i64>>::from_script(&value).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn options_map_to_null() {
        let cx = context();
        let none: Option<f64> = None;
        let value = none.to_script(&cx).unwrap();
        assert!(value.is_null().unwrap());
        assert_eq!(Option::<f64>::from_script(&value).unwrap(), None);
        let undefined = cx.undefined().unwrap();
        assert_eq!(Option::<String>::from_script(&undefined).unwrap(), None);
        let some = Some(1.25).to_script(&cx).unwrap();
        assert_eq!(Option::<f64>::from_script(&some).unwrap(), Some(1.25));
    }

    #[test]
    fn mismatched_shapes_fail() {
        let cx = context();
        let object = cx.object().unwrap();
        assert!(Vec::<i32>::from_script(&object).is_err());
        let text = "not a number".to_script(&cx).unwrap();
        assert!(f64::from_script(&text).is_err());
    }

    #[test]
    fn converter_pairs_use_the_trait_impls() {
        let cx = context();
        let (to, from) = converters::<String>();
        let value = to(&cx, &"pair".to_string()).unwrap();
        assert_eq!(from(&value).unwrap(), "pair");
    }
}
