//! Builders that expose host types to scripts.
//!
//! [`ClassBuilder`] gives reference semantics: every script instance wraps
//! an `Arc<T>` and the registry keeps one wrapper per host object.
//! [`StructBuilder`] gives value semantics: instances are plain objects
//! copied field by field.

use std::{any::Any, marker::PhantomData, rc::Rc, sync::Arc};

use crate::{
    Error, Result,
    callback::{CallbackArgs, HostFn},
    context::Context,
    convert::{FromScript, ToScript},
    descriptor::{PropertyAttributes, PropertyDescriptor},
    value::Value,
};

type Construct<T> = Rc<dyn Fn(&CallbackArgs<'_>) -> Result<T>>;

pub struct ClassBuilder<T> {
    name: String,
    constructor: Option<Construct<T>>,
    members: Vec<PropertyDescriptor>,
}

impl<T: Any + Send + Sync> ClassBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            members: Vec::new(),
        }
    }

    /// How `new Class(...)` builds a fresh host object. Without one, the
    /// class can only wrap objects handed out by the host.
    pub fn constructor(
        mut self,
        construct: impl Fn(&CallbackArgs<'_>) -> Result<T> + 'static,
    ) -> Self {
        self.constructor = Some(Rc::new(construct));
        self
    }

    pub fn getter(
        mut self,
        name: &str,
        get: impl Fn(&CallbackArgs<'_>, &T) -> Result<Value> + 'static,
    ) -> Self {
        self.members
            .push(PropertyDescriptor::getter(name, bind(get)));
        self
    }

    pub fn property(
        mut self,
        name: &str,
        get: impl Fn(&CallbackArgs<'_>, &T) -> Result<Value> + 'static,
        set: impl Fn(&CallbackArgs<'_>, &T, Value) -> Result<()> + 'static,
    ) -> Self {
        let set = move |args: &CallbackArgs<'_>, value: Value| {
            let this = args.this_object::<T>()?;
            set(args, &this, value)
        };
        self.members
            .push(PropertyDescriptor::accessor(name, bind(get), set));
        self
    }

    pub fn method(
        mut self,
        name: &str,
        method: impl Fn(&CallbackArgs<'_>, &T) -> Result<Value> + 'static,
    ) -> Self {
        self.members
            .push(PropertyDescriptor::method(name, bind(method)));
        self
    }

    pub fn static_method(
        mut self,
        name: &str,
        method: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
    ) -> Self {
        self.members
            .push(PropertyDescriptor::method(name, method).into_static());
        self
    }

    pub fn static_value(mut self, name: &str, value: Value) -> Self {
        self.members.push(
            PropertyDescriptor::value(name, value).with_attributes(
                PropertyAttributes::ENUMERABLE | PropertyAttributes::STATIC,
            ),
        );
        self
    }

    /// Any other member, as a raw descriptor.
    pub fn member(mut self, descriptor: PropertyDescriptor) -> Self {
        self.members.push(descriptor);
        self
    }

    /// Defines the class and registers it for `T`.
    pub fn define(self, cx: &Context) -> Result<Value> {
        let ClassBuilder {
            name,
            constructor,
            members,
        } = self;
        let class_name = name.clone();
        let construct: HostFn = Rc::new(move |args: &CallbackArgs<'_>| {
            if !args.is_construct_call() {
                return Err(Error::host(format!(
                    "Class constructor {class_name} cannot be invoked without 'new'"
                )));
            }
            let object = match args.adopted::<T>()? {
                Some(object) => object,
                None => match &constructor {
                    Some(construct) => Arc::new(construct(args)?),
                    None => {
                        return Err(Error::host(format!(
                            "{class_name} has no public constructor"
                        )));
                    }
                },
            };
            let cx = args.context();
            cx.registry()
                .initialize_object_wrapper(cx, args.this(), object)?;
            Ok(args.this().clone())
        });
        let class =
            cx.define_class(&name, move |args| construct(args), &members)?;
        cx.registry().register_class::<T>(&class)?;
        Ok(class)
    }
}

fn bind<T: Any + Send + Sync>(
    f: impl Fn(&CallbackArgs<'_>, &T) -> Result<Value> + 'static,
) -> impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static {
    move |args: &CallbackArgs<'_>| {
        let this = args.this_object::<T>()?;
        f(args, &this)
    }
}

struct StructField<T> {
    name: String,
    get: Rc<dyn Fn(&Context, &T) -> Result<Value>>,
    set: Rc<dyn Fn(&mut T, &Value) -> Result<()>>,
}

pub struct StructBuilder<T> {
    name: String,
    fields: Vec<StructField<T>>,
}

impl<T: Any + Default> StructBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field<V: ToScript + FromScript + 'static>(
        mut self,
        name: &str,
        get: fn(&T) -> V,
        set: fn(&mut T, V),
    ) -> Self {
        self.fields.push(StructField {
            name: name.to_string(),
            get: Rc::new(move |cx, object| get(object).to_script(cx)),
            set: Rc::new(move |object, value| {
                set(object, V::from_script(value)?);
                Ok(())
            }),
        });
        self
    }

    /// Defines the script constructor, which copies matching fields from an
    /// optional initializer object, and registers it for `T`.
    pub fn define(self, cx: &Context) -> Result<StructClass<T>> {
        let fields = Rc::new(self.fields);
        let init_fields = fields.clone();
        let class = cx.define_class(
            &self.name,
            move |args| {
                let cx = args.context();
                let this = args.this();
                let init = args.get(0)?;
                let has_init = init.is_object()?;
                let defaults = T::default();
                for field in init_fields.iter() {
                    let value = if has_init && init.has_named(&field.name)? {
                        init.get_named(&field.name)?
                    } else {
                        (field.get)(cx, &defaults)?
                    };
                    this.set_named(&field.name, &value)?;
                }
                Ok(this.clone())
            },
            &[],
        )?;
        cx.registry().register_struct::<T>(&class)?;
        Ok(StructClass {
            name: self.name,
            fields,
            marker: PhantomData,
        })
    }
}

/// Converts `T` to and from fresh script objects of its struct class.
pub struct StructClass<T> {
    name: String,
    fields: Rc<Vec<StructField<T>>>,
    marker: PhantomData<fn() -> T>,
}

impl<T: Any + Default> StructClass<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn to_script(&self, cx: &Context, value: &T) -> Result<Value> {
        let constructor = cx.registry().struct_constructor::<T>(cx)?;
        let object = constructor.construct(&[])?;
        for field in self.fields.iter() {
            object.set_named(&field.name, &(field.get)(cx, value)?)?;
        }
        Ok(object)
    }

    /// Reads every field present on `value`; absent ones keep their default.
    pub fn from_script(&self, value: &Value) -> Result<T> {
        if !value.is_object()? {
            return Err(Error::host(format!("expected a {} object", self.name)));
        }
        let mut out = T::default();
        for field in self.fields.iter() {
            let field_value = value.get_named(&field.name)?;
            if !field_value.is_undefined()? {
                (field.set)(&mut out, &field_value)?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::ContextCreateInfo,
        engine::{EngineCreateInfo, Env},
    };
    use parking_lot::RwLock;

    fn context() -> Context {
        let env = Env::new(EngineCreateInfo::default());
        Context::new(&env, ContextCreateInfo::default()).unwrap()
    }

    #[derive(Default)]
    struct Counter {
        count: RwLock<i32>,
    }

    fn counter_class(cx: &Context) -> Value {
        ClassBuilder::<Counter>::new("Counter")
            .constructor(|args| {
                let start = args.get(0)?;
                let count = if start.is_number()? { start.to_i32()? } else { 0 };
                Ok(Counter {
                    count: RwLock::new(count),
                })
            })
            .getter("count", |args, counter| {
                args.context().int32(*counter.count.read())
            })
            .method("increment", |args, counter| {
                let mut count = counter.count.write();
                *count += 1;
                args.context().int32(*count)
            })
            .static_method("zero", |args| args.context().int32(0))
            .define(cx)
            .unwrap()
    }

    #[test]
    fn instances_wrap_fresh_host_objects() {
        let cx = context();
        let class = counter_class(&cx);
        let counter = class.construct(&[cx.int32(5).unwrap()]).unwrap();
        assert!(counter.instance_of(&class).unwrap());
        counter.call_method("increment", &[]).unwrap();
        assert_eq!(counter.get_named("count").unwrap().to_i32().unwrap(), 6);
        assert_eq!(*counter.unwrap::<Counter>().unwrap().count.read(), 6);

        let zero = class.call_method("zero", &[]).unwrap();
        assert_eq!(zero.to_i32().unwrap(), 0);
    }

    #[test]
    fn calling_without_new_is_rejected() {
        let cx = context();
        let class = counter_class(&cx);
        let error = class.call(&cx.undefined().unwrap(), &[]).unwrap_err();
        assert!(error.message().contains("without 'new'"), "{error:?}");
    }

    #[test]
    fn host_objects_get_a_single_wrapper() {
        let cx = context();
        counter_class(&cx);
        let counter = Arc::new(Counter::default());
        let registry = cx.registry();
        let a = registry.get_or_create_object_wrapper(&cx, &counter).unwrap();
        let b = registry.get_or_create_object_wrapper(&cx, &counter).unwrap();
        assert!(a.strict_equals(&b).unwrap());
        a.call_method("increment", &[]).unwrap();
        assert_eq!(*counter.count.read(), 1);
    }

    #[test]
    fn classes_without_constructor_only_wrap() {
        let cx = context();
        let class = ClassBuilder::<Counter>::new("Opaque").define(&cx).unwrap();
        assert!(class.construct(&[]).is_err());
        let counter = Arc::new(Counter::default());
        let wrapper = cx
            .registry()
            .get_or_create_object_wrapper(&cx, &counter)
            .unwrap();
        assert!(Arc::ptr_eq(&wrapper.unwrap::<Counter>().unwrap(), &counter));
    }

    #[derive(Debug, Default, PartialEq)]
    struct Size {
        width: f64,
        height: f64,
        label: String,
    }

    fn size_class(cx: &Context) -> StructClass<Size> {
        StructBuilder::<Size>::new("Size")
            .field("width", |s| s.width, |s, v| s.width = v)
            .field("height", |s| s.height, |s, v| s.height = v)
            .field("label", |s| s.label.clone(), |s, v| s.label = v)
            .define(cx)
            .unwrap()
    }

    #[test]
    fn structs_copy_by_value() {
        let cx = context();
        let sizes = size_class(&cx);
        let size = Size {
            width: 2.5,
            height: 4.0,
            label: "box".to_string(),
        };
        let object = sizes.to_script(&cx, &size).unwrap();
        assert_eq!(object.get_named("width").unwrap().to_f64().unwrap(), 2.5);

        object.set_named("height", &cx.number(8.0).unwrap()).unwrap();
        let back = sizes.from_script(&object).unwrap();
        assert_eq!(back.height, 8.0);
        assert_eq!(size.height, 4.0);
    }

    #[test]
    fn struct_constructor_reads_an_initializer() {
        let cx = context();
        let sizes = size_class(&cx);
        let class = cx.registry().struct_constructor::<Size>(&cx).unwrap();
        let init = cx.object().unwrap();
        init.set_named("width", &cx.number(3.0).unwrap()).unwrap();
        let object = class.construct(&[init]).unwrap();
        let size = sizes.from_script(&object).unwrap();
        assert_eq!(
            size,
            Size {
                width: 3.0,
                height: 0.0,
                label: String::new(),
            }
        );
    }
}
