//! Per-context bookkeeping of host types and host objects.
//!
//! Classes and structs map a host type to a strong reference on its script
//! constructor. Objects map a host object's identity to a weak reference on
//! its current wrapper, so a wrapper can be collected independently of the
//! host object and rebuilt on demand.

use std::{
    any::{Any, TypeId, type_name},
    fmt,
    rc::Rc,
    sync::{Arc, Weak},
};

use ahash::RandomState;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    Error, Result,
    context::Context,
    engine::{Env, Finalizer},
    reference::Reference,
    value::Value,
};

/// Identity of a host object: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey(usize);

impl ObjectKey {
    pub fn of<T: ?Sized>(object: &Arc<T>) -> Self {
        ObjectKey(Arc::as_ptr(object) as *const () as usize)
    }
}

type RefMap<K> = DashMap<K, Reference, RandomState>;

pub struct Registry {
    objects: RefMap<ObjectKey>,
    classes: RefMap<TypeId>,
    structs: RefMap<TypeId>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            objects: DashMap::with_hasher(RandomState::new()),
            classes: DashMap::with_hasher(RandomState::new()),
            structs: DashMap::with_hasher(RandomState::new()),
        }
    }

    fn register(
        map: &RefMap<TypeId>,
        what: &str,
        type_id: TypeId,
        name: &str,
        constructor: &Value,
    ) -> Result<()> {
        if !constructor.is_function()? {
            return Err(Error::usage(format!(
                "{what} constructor for {name} is not a function"
            )));
        }
        match map.entry(type_id) {
            Entry::Occupied(_) => Err(Error::usage(format!(
                "{what} {name} is already registered"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Reference::strong(constructor)?);
                log::debug!("registered {what} {name}");
                Ok(())
            }
        }
    }

    /// Records `constructor` as the script class for `T`. Each type
    /// registers once.
    pub fn register_class<T: Any>(&self, constructor: &Value) -> Result<()> {
        Self::register(
            &self.classes,
            "class",
            TypeId::of::<T>(),
            type_name::<T>(),
            constructor,
        )
    }

    pub fn register_struct<T: Any>(&self, constructor: &Value) -> Result<()> {
        Self::register(
            &self.structs,
            "struct",
            TypeId::of::<T>(),
            type_name::<T>(),
            constructor,
        )
    }

    pub fn is_class_registered<T: Any>(&self) -> bool {
        self.classes.contains_key(&TypeId::of::<T>())
    }

    fn constructor(
        map: &RefMap<TypeId>,
        what: &str,
        cx: &Context,
        type_id: TypeId,
        name: &str,
    ) -> Result<Value> {
        let constructor = match map.get(&type_id) {
            Some(reference) => reference.get_value(cx)?,
            None => None,
        };
        constructor.ok_or_else(|| {
            Error::usage(format!("{what} {name} is not registered"))
        })
    }

    pub fn class_constructor<T: Any>(&self, cx: &Context) -> Result<Value> {
        Self::constructor(
            &self.classes,
            "class",
            cx,
            TypeId::of::<T>(),
            type_name::<T>(),
        )
    }

    pub fn struct_constructor<T: Any>(&self, cx: &Context) -> Result<Value> {
        Self::constructor(
            &self.structs,
            "struct",
            cx,
            TypeId::of::<T>(),
            type_name::<T>(),
        )
    }

    /// Attaches `object` to `wrapper` and makes `wrapper` the object's
    /// current script identity, replacing any previous one. Called from
    /// class constructors.
    pub fn initialize_object_wrapper<T: Any + Send + Sync>(
        self: &Arc<Self>,
        cx: &Context,
        wrapper: &Value,
        object: Arc<T>,
    ) -> Result<()> {
        let key = ObjectKey::of(&object);
        let reference = Reference::weak(wrapper)?;
        let raw_ref = reference.raw_ref();
        let registry: Weak<Registry> = Arc::downgrade(self);
        let finalizer: Finalizer = Box::new(move |env: &Env| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let stale = registry
                .objects
                .remove_if(&key, |_, current| current.raw_ref() == raw_ref);
            if let Some((_, stale)) = stale {
                log::trace!("wrapper for {key:?} collected");
                stale.release_on(env);
            }
        });
        let payload: Rc<dyn Any> = Rc::new(object);
        cx.check(cx.env().wrap(wrapper.raw()?, payload, Some(finalizer)))?;

        if let Some(previous) = self.objects.insert(key, reference) {
            log::debug!("replaced the wrapper of {key:?}");
            previous.dispose_in(cx)?;
        }
        Ok(())
    }

    /// The live wrapper of `object`, or a new one built by the registered
    /// class constructor of `T`.
    pub fn get_or_create_object_wrapper<T: Any + Send + Sync>(
        &self,
        cx: &Context,
        object: &Arc<T>,
    ) -> Result<Value> {
        let key = ObjectKey::of(object);
        let existing = match self.objects.get(&key) {
            Some(reference) => reference.get_value(cx)?,
            None => None,
        };
        if let Some(wrapper) = existing {
            return Ok(wrapper);
        }

        let constructor = self.class_constructor::<T>(cx)?;
        let external = cx.external(object.clone())?;
        let wrapper = constructor.construct(&[external])?;
        if !self.objects.contains_key(&key) {
            log::warn!(
                "constructor of {} did not register its wrapper",
                type_name::<T>()
            );
        }
        Ok(wrapper)
    }

    /// Host objects with a recorded wrapper, live or not yet swept.
    pub fn tracked_objects(&self) -> usize {
        self.objects.len()
    }

    /// Disposes every tracked reference. Failures are logged and skipped.
    pub fn teardown(&self, cx: &Context) {
        for map in [&self.classes, &self.structs] {
            let keys: Vec<TypeId> = map.iter().map(|entry| *entry.key()).collect();
            for key in keys {
                if let Some((_, reference)) = map.remove(&key) {
                    if let Err(error) = reference.dispose_in(cx) {
                        log::warn!("failed to release a constructor: {error}");
                    }
                }
            }
        }
        let keys: Vec<ObjectKey> =
            self.objects.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, reference)) = self.objects.remove(&key) {
                if let Err(error) = reference.dispose_in(cx) {
                    log::warn!("failed to release wrapper of {key:?}: {error}");
                }
            }
        }
        log::debug!("registry torn down");
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("objects", &self.objects.len())
            .field("classes", &self.classes.len())
            .field("structs", &self.structs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ContextCreateInfo,
        engine::EngineCreateInfo,
        scope::Scope,
    };

    struct Widget {
        id: u32,
    }

    fn context() -> (Env, Context) {
        let env = Env::new(EngineCreateInfo::default());
        let cx = Context::new(&env, ContextCreateInfo::default()).unwrap();
        (env, cx)
    }

    fn define_widget(cx: &Context) -> Value {
        let class = cx
            .define_class(
                "Widget",
                |args| {
                    let widget = match args.adopted::<Widget>()? {
                        Some(widget) => widget,
                        None => Arc::new(Widget { id: 0 }),
                    };
                    let cx = args.context();
                    cx.registry()
                        .initialize_object_wrapper(cx, args.this(), widget)?;
                    Ok(args.this().clone())
                },
                &[],
            )
            .unwrap();
        cx.registry().register_class::<Widget>(&class).unwrap();
        class
    }

    #[test]
    fn classes_register_once() {
        let (_env, cx) = context();
        let class = define_widget(&cx);
        assert!(cx.registry().is_class_registered::<Widget>());
        let error = cx.registry().register_class::<Widget>(&class).unwrap_err();
        assert!(matches!(error, Error::Usage(_)));
    }

    #[test]
    fn wrappers_are_reused_while_alive() {
        let (_env, cx) = context();
        define_widget(&cx);
        let widget = Arc::new(Widget { id: 7 });
        let first = cx
            .registry()
            .get_or_create_object_wrapper(&cx, &widget)
            .unwrap();
        let second = cx
            .registry()
            .get_or_create_object_wrapper(&cx, &widget)
            .unwrap();
        assert!(first.strict_equals(&second).unwrap());
        assert_eq!(first.unwrap::<Widget>().unwrap().id, 7);
        assert_eq!(cx.registry().tracked_objects(), 1);
    }

    #[test]
    fn collected_wrappers_are_rebuilt() {
        let (env, cx) = context();
        define_widget(&cx);
        let widget = Arc::new(Widget { id: 9 });

        let scope = Scope::handle(&cx).unwrap();
        let first = cx
            .registry()
            .get_or_create_object_wrapper(&cx, &widget)
            .unwrap();
        let marker = Reference::weak(&first).unwrap();
        scope.close().unwrap();

        env.collect_garbage();
        assert!(marker.get_value(&cx).unwrap().is_none());
        assert_eq!(cx.registry().tracked_objects(), 0);

        let second = cx
            .registry()
            .get_or_create_object_wrapper(&cx, &widget)
            .unwrap();
        assert!(Arc::ptr_eq(&second.unwrap::<Widget>().unwrap(), &widget));
    }

    #[test]
    fn unregistered_types_are_usage_errors() {
        let (_env, cx) = context();
        let widget = Arc::new(Widget { id: 1 });
        let error = cx
            .registry()
            .get_or_create_object_wrapper(&cx, &widget)
            .unwrap_err();
        assert!(matches!(error, Error::Usage(_)));
    }

    #[test]
    fn teardown_releases_everything() {
        let (_env, cx) = context();
        define_widget(&cx);
        let widget = Arc::new(Widget { id: 2 });
        cx.registry()
            .get_or_create_object_wrapper(&cx, &widget)
            .unwrap();
        cx.registry().teardown(&cx);
        assert_eq!(cx.registry().tracked_objects(), 0);
        assert!(!cx.registry().is_class_registered::<Widget>());
        assert!(cx.registry().class_constructor::<Widget>(&cx).is_err());
    }
}
