//! Script proxies whose traps call straight into host collections.
//!
//! A [`ProxyHandler`] turns a [`ProxyTraps`] implementation into a script
//! handler object once and reuses it for every proxy it creates. The host
//! collection travels as an external in the proxy target, so one handler
//! serves any number of collections.

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    rc::Rc,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    Error, Result,
    context::Context,
    convert::{FromScriptFn, ToScriptFn},
    descriptor::PropertyDescriptor,
    engine::WellKnownSymbol,
    reference::Reference,
    value::Value,
};

/// Host side of a proxy. Unimplemented traps fall back to failing loudly
/// (`set`) or reporting absence.
pub trait ProxyTraps: 'static {
    fn get(&self, cx: &Context, target: &Value, key: &Value) -> Result<Value>;

    fn set(
        &self,
        _cx: &Context,
        _target: &Value,
        _key: &Value,
        _value: &Value,
    ) -> Result<bool> {
        Err(Error::host("proxy is read-only"))
    }

    fn has(&self, cx: &Context, target: &Value, key: &Value) -> Result<bool> {
        Ok(!self.get(cx, target, key)?.is_undefined()?)
    }

    fn delete(&self, _cx: &Context, _target: &Value, _key: &Value) -> Result<bool> {
        Ok(false)
    }

    fn own_keys(&self, _cx: &Context, _target: &Value) -> Result<Vec<Value>> {
        Ok(Vec::new())
    }
}

pub struct ProxyHandler {
    traps: Rc<dyn ProxyTraps>,
    handler: RefCell<Option<Reference>>,
}

impl ProxyHandler {
    pub fn new(traps: impl ProxyTraps) -> Self {
        Self {
            traps: Rc::new(traps),
            handler: RefCell::new(None),
        }
    }

    pub fn is_built(&self) -> bool {
        self.handler.borrow().is_some()
    }

    /// The script handler object, built on first use.
    pub fn handler(&self, cx: &Context) -> Result<Value> {
        if let Some(reference) = self.handler.borrow().as_ref() {
            if let Some(handler) = reference.get_value(cx)? {
                return Ok(handler);
            }
        }
        let handler = self.build(cx)?;
        *self.handler.borrow_mut() = Some(Reference::strong(&handler)?);
        log::debug!("built proxy handler");
        Ok(handler)
    }

    fn build(&self, cx: &Context) -> Result<Value> {
        let handler = cx.object()?;
        let get = self.traps.clone();
        let set = self.traps.clone();
        let has = self.traps.clone();
        let delete = self.traps.clone();
        let own_keys = self.traps.clone();
        cx.define_properties(
            &handler,
            &[
                PropertyDescriptor::method("get", move |args| {
                    get.get(args.context(), &args.get(0)?, &args.get(1)?)
                }),
                PropertyDescriptor::method("set", move |args| {
                    let cx = args.context();
                    let done =
                        set.set(cx, &args.get(0)?, &args.get(1)?, &args.get(2)?)?;
                    cx.boolean(done)
                }),
                PropertyDescriptor::method("has", move |args| {
                    let cx = args.context();
                    cx.boolean(has.has(cx, &args.get(0)?, &args.get(1)?)?)
                }),
                PropertyDescriptor::method("deleteProperty", move |args| {
                    let cx = args.context();
                    cx.boolean(delete.delete(cx, &args.get(0)?, &args.get(1)?)?)
                }),
                PropertyDescriptor::method("ownKeys", move |args| {
                    let cx = args.context();
                    let keys = own_keys.own_keys(cx, &args.get(0)?)?;
                    cx.array_from(&keys)
                }),
            ],
        )?;
        Ok(handler)
    }

    /// A new proxy over `target` using the shared handler.
    pub fn create_proxy(&self, cx: &Context, target: &Value) -> Result<Value> {
        let constructor = cx.import("Proxy", None)?;
        let handler = self.handler(cx)?;
        constructor.construct(&[target.clone(), handler])
    }
}

impl fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("built", &self.is_built())
            .finish()
    }
}

enum TrapKey {
    Index(u32),
    Name(String),
    Iterator,
    Symbol,
}

impl TrapKey {
    fn classify(cx: &Context, key: &Value) -> Result<TrapKey> {
        if key.is_symbol()? {
            let iterator = cx.well_known_symbol(WellKnownSymbol::Iterator)?;
            return Ok(if key.strict_equals(&iterator)? {
                TrapKey::Iterator
            } else {
                TrapKey::Symbol
            });
        }
        let name = key.coerce_to_string()?.to_string_utf8()?;
        Ok(match name.parse::<u32>() {
            Ok(index) if index.to_string() == name => TrapKey::Index(index),
            _ => TrapKey::Name(name),
        })
    }
}

/// A script iterator object yielding `items` through `yield_item`.
fn iterator<I>(
    cx: &Context,
    items: I,
    yield_item: impl Fn(&Context, I::Item) -> Result<Value> + 'static,
) -> Result<Value>
where
    I: Iterator + 'static,
{
    let items = RefCell::new(items);
    let object = cx.object()?;
    cx.define_properties(
        &object,
        &[
            PropertyDescriptor::method("next", move |args| {
                let cx = args.context();
                let result = cx.object()?;
                let next = items.borrow_mut().next();
                match next {
                    Some(item) => {
                        result.set_named("value", &yield_item(cx, item)?)?;
                        result.set_named("done", &cx.boolean(false)?)?;
                    }
                    None => {
                        result.set_named("value", &cx.undefined()?)?;
                        result.set_named("done", &cx.boolean(true)?)?;
                    }
                }
                Ok(result)
            }),
            PropertyDescriptor::method(WellKnownSymbol::Iterator, |args| {
                Ok(args.this().clone())
            }),
        ],
    )?;
    Ok(object)
}

pub type SharedList<T> = Arc<RwLock<Vec<T>>>;
pub type SharedMap<T> = Arc<RwLock<HashMap<String, T>>>;

struct ListTraps<T> {
    to: ToScriptFn<T>,
    from: FromScriptFn<T>,
}

impl<T: Clone + Send + Sync + 'static> ListTraps<T> {
    fn list(target: &Value) -> Result<SharedList<T>> {
        target.external::<RwLock<Vec<T>>>()
    }
}

impl<T: Clone + Send + Sync + 'static> ProxyTraps for ListTraps<T> {
    fn get(&self, cx: &Context, target: &Value, key: &Value) -> Result<Value> {
        let list = Self::list(target)?;
        match TrapKey::classify(cx, key)? {
            TrapKey::Index(index) => match list.read().get(index as usize) {
                Some(item) => (self.to)(cx, item),
                None => cx.undefined(),
            },
            TrapKey::Name(name) if name == "length" => {
                cx.uint32(list.read().len() as u32)
            }
            TrapKey::Iterator => {
                let to = self.to.clone();
                cx.function("values", move |args| {
                    let snapshot = list.read().clone();
                    let to = to.clone();
                    iterator(args.context(), snapshot.into_iter(), move |cx, item| {
                        to(cx, &item)
                    })
                })
            }
            TrapKey::Name(_) | TrapKey::Symbol => cx.undefined(),
        }
    }

    fn set(
        &self,
        cx: &Context,
        target: &Value,
        key: &Value,
        value: &Value,
    ) -> Result<bool> {
        let list = Self::list(target)?;
        match TrapKey::classify(cx, key)? {
            TrapKey::Index(index) => {
                let item = (self.from)(value)?;
                let mut list = list.write();
                let index = index as usize;
                if index < list.len() {
                    list[index] = item;
                } else if index == list.len() {
                    list.push(item);
                } else {
                    return Err(Error::host(format!(
                        "index {index} is out of range for a list of {}",
                        list.len()
                    )));
                }
                Ok(true)
            }
            TrapKey::Name(name) if name == "length" => {
                let length = value.to_u32()? as usize;
                let mut list = list.write();
                if length > list.len() {
                    return Err(Error::host("lists cannot grow through length"));
                }
                list.truncate(length);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn has(&self, cx: &Context, target: &Value, key: &Value) -> Result<bool> {
        let list = Self::list(target)?;
        Ok(match TrapKey::classify(cx, key)? {
            TrapKey::Index(index) => (index as usize) < list.read().len(),
            TrapKey::Name(name) => name == "length",
            TrapKey::Iterator => true,
            TrapKey::Symbol => false,
        })
    }

    fn own_keys(&self, cx: &Context, target: &Value) -> Result<Vec<Value>> {
        let length = Self::list(target)?.read().len();
        (0..length).map(|i| cx.string(&i.to_string())).collect()
    }
}

/// Exposes `Arc<RwLock<Vec<T>>>` collections as array-like proxies.
pub struct ListProjection<T> {
    handler: ProxyHandler,
    marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> ListProjection<T> {
    pub fn new(to: ToScriptFn<T>, from: FromScriptFn<T>) -> Self {
        Self {
            handler: ProxyHandler::new(ListTraps { to, from }),
            marker: std::marker::PhantomData,
        }
    }

    pub fn handler(&self) -> &ProxyHandler {
        &self.handler
    }

    pub fn project(&self, cx: &Context, list: &SharedList<T>) -> Result<Value> {
        let target = cx.external(list.clone())?;
        self.handler.create_proxy(cx, &target)
    }
}

struct MapTraps<T> {
    to: ToScriptFn<T>,
    from: FromScriptFn<T>,
}

impl<T: Clone + Send + Sync + 'static> MapTraps<T> {
    fn map(target: &Value) -> Result<SharedMap<T>> {
        target.external::<RwLock<HashMap<String, T>>>()
    }
}

fn key_name(key: TrapKey) -> Option<String> {
    match key {
        TrapKey::Index(index) => Some(index.to_string()),
        TrapKey::Name(name) => Some(name),
        TrapKey::Iterator | TrapKey::Symbol => None,
    }
}

impl<T: Clone + Send + Sync + 'static> ProxyTraps for MapTraps<T> {
    fn get(&self, cx: &Context, target: &Value, key: &Value) -> Result<Value> {
        let map = Self::map(target)?;
        let key = TrapKey::classify(cx, key)?;
        if let TrapKey::Iterator = key {
            let to = self.to.clone();
            return cx.function("entries", move |args| {
                let snapshot: Vec<(String, T)> = map
                    .read()
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                let to = to.clone();
                iterator(
                    args.context(),
                    snapshot.into_iter(),
                    move |cx, (key, value)| {
                        cx.array_from(&[cx.string(&key)?, to(cx, &value)?])
                    },
                )
            });
        }
        let Some(name) = key_name(key) else {
            return cx.undefined();
        };
        match map.read().get(&name) {
            Some(value) => (self.to)(cx, value),
            None => cx.undefined(),
        }
    }

    fn set(
        &self,
        cx: &Context,
        target: &Value,
        key: &Value,
        value: &Value,
    ) -> Result<bool> {
        let Some(name) = key_name(TrapKey::classify(cx, key)?) else {
            return Ok(false);
        };
        let value = (self.from)(value)?;
        Self::map(target)?.write().insert(name, value);
        Ok(true)
    }

    fn has(&self, cx: &Context, target: &Value, key: &Value) -> Result<bool> {
        match key_name(TrapKey::classify(cx, key)?) {
            Some(name) => Ok(Self::map(target)?.read().contains_key(&name)),
            None => Ok(false),
        }
    }

    fn delete(&self, cx: &Context, target: &Value, key: &Value) -> Result<bool> {
        match key_name(TrapKey::classify(cx, key)?) {
            Some(name) => Ok(Self::map(target)?.write().remove(&name).is_some()),
            None => Ok(false),
        }
    }

    fn own_keys(&self, cx: &Context, target: &Value) -> Result<Vec<Value>> {
        let map = Self::map(target)?;
        let keys: Vec<String> = map.read().keys().cloned().collect();
        keys.iter().map(|key| cx.string(key)).collect()
    }
}

/// Exposes `Arc<RwLock<HashMap<String, T>>>` collections as dictionary
/// proxies.
pub struct MapProjection<T> {
    handler: ProxyHandler,
    marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> MapProjection<T> {
    pub fn new(to: ToScriptFn<T>, from: FromScriptFn<T>) -> Self {
        Self {
            handler: ProxyHandler::new(MapTraps { to, from }),
            marker: std::marker::PhantomData,
        }
    }

    pub fn handler(&self) -> &ProxyHandler {
        &self.handler
    }

    pub fn project(&self, cx: &Context, map: &SharedMap<T>) -> Result<Value> {
        let target = cx.external(map.clone())?;
        self.handler.create_proxy(cx, &target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ContextCreateInfo,
        convert::converters,
        engine::{EngineCreateInfo, Env},
    };

    fn context() -> Context {
        let env = Env::new(EngineCreateInfo::default());
        Context::new(&env, ContextCreateInfo::default()).unwrap()
    }

    fn drain(cx: &Context, iterable: &Value) -> Vec<Value> {
        let key = cx.well_known_symbol(WellKnownSymbol::Iterator).unwrap();
        let iterator = iterable.get(&key).unwrap().call(iterable, &[]).unwrap();
        let mut out = Vec::new();
        loop {
            let step = iterator.call_method("next", &[]).unwrap();
            if step.get_named("done").unwrap().to_bool().unwrap() {
                return out;
            }
            out.push(step.get_named("value").unwrap());
        }
    }

    #[test]
    fn lists_are_read_and_written_in_place() {
        let cx = context();
        let (to, from) = converters::<i32>();
        let projection = ListProjection::new(to, from);
        let list: SharedList<i32> = Arc::new(RwLock::new(vec![1, 2, 3]));
        let proxy = projection.project(&cx, &list).unwrap();

        assert_eq!(proxy.get_named("length").unwrap().to_u32().unwrap(), 3);
        assert_eq!(proxy.get_index(1).unwrap().to_i32().unwrap(), 2);
        assert!(proxy.get_index(7).unwrap().is_undefined().unwrap());

        proxy.set_index(0, &cx.int32(10).unwrap()).unwrap();
        proxy.set_index(3, &cx.int32(4).unwrap()).unwrap();
        assert_eq!(*list.read(), vec![10, 2, 3, 4]);

        list.write().push(5);
        assert_eq!(proxy.get_named("length").unwrap().to_u32().unwrap(), 5);
        assert!(proxy.has_index(4).unwrap());
        assert_eq!(proxy.keys().unwrap(), vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn list_iteration_walks_a_snapshot() {
        let cx = context();
        let (to, from) = converters::<String>();
        let projection = ListProjection::new(to, from);
        let list: SharedList<String> =
            Arc::new(RwLock::new(vec!["a".to_string(), "b".to_string()]));
        let proxy = projection.project(&cx, &list).unwrap();

        let key = cx.well_known_symbol(WellKnownSymbol::Iterator).unwrap();
        let iterator = proxy.get(&key).unwrap().call(&proxy, &[]).unwrap();
        list.write().push("c".to_string());
        let mut seen = Vec::new();
        loop {
            let step = iterator.call_method("next", &[]).unwrap();
            if step.get_named("done").unwrap().to_bool().unwrap() {
                break;
            }
            seen.push(step.get_named("value").unwrap().to_string_utf8().unwrap());
        }
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(drain(&cx, &proxy).len(), 3);
    }

    #[test]
    fn handlers_are_built_once_and_shared() {
        let cx = context();
        let (to, from) = converters::<f64>();
        let projection = ListProjection::new(to, from);
        assert!(!projection.handler().is_built());

        let first = projection
            .project(&cx, &Arc::new(RwLock::new(vec![1.0])))
            .unwrap();
        let handler = projection.handler().handler(&cx).unwrap();
        let second = projection
            .project(&cx, &Arc::new(RwLock::new(vec![2.0, 3.0])))
            .unwrap();
        assert!(handler.strict_equals(&projection.handler().handler(&cx).unwrap()).unwrap());
        assert_eq!(first.get_named("length").unwrap().to_u32().unwrap(), 1);
        assert_eq!(second.get_named("length").unwrap().to_u32().unwrap(), 2);
    }

    #[test]
    fn maps_support_every_trap() {
        let cx = context();
        let (to, from) = converters::<i64>();
        let projection = MapProjection::new(to, from);
        let map: SharedMap<i64> = Arc::new(RwLock::new(HashMap::new()));
        map.write().insert("one".to_string(), 1);
        let proxy = projection.project(&cx, &map).unwrap();

        assert_eq!(proxy.get_named("one").unwrap().to_i64().unwrap(), 1);
        assert!(proxy.get_named("two").unwrap().is_undefined().unwrap());
        proxy.set_named("two", &cx.int64(2).unwrap()).unwrap();
        assert_eq!(map.read().get("two"), Some(&2));
        assert!(proxy.has_named("two").unwrap());

        let mut keys = proxy.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["one", "two"]);

        let entries = drain(&cx, &proxy);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_array().unwrap());

        assert!(proxy.delete(&cx.string("one").unwrap()).unwrap());
        assert!(!map.read().contains_key("one"));
    }

    #[test]
    fn custom_traps_see_the_target() {
        struct Echo;

        impl ProxyTraps for Echo {
            fn get(&self, cx: &Context, _target: &Value, key: &Value) -> Result<Value> {
                let name = key.coerce_to_string()?.to_string_utf8()?;
                cx.string(&name.to_uppercase())
            }
        }

        let cx = context();
        let handler = ProxyHandler::new(Echo);
        let proxy = handler.create_proxy(&cx, &cx.object().unwrap()).unwrap();
        let shout = proxy.get_named("hello").unwrap();
        assert_eq!(shout.to_string_utf8().unwrap(), "HELLO");
        assert!(proxy.set_named("x", &cx.null().unwrap()).is_err());
    }
}
