use std::{any::Any, fmt, rc::Rc, sync::Arc};

use bitflags::bitflags;

use crate::{
    callback::{CallbackArgs, HostFn, SetterFn},
    engine::{PropertyFlags, WellKnownSymbol},
    value::Value,
    Result,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropertyAttributes: u32 {
        const WRITABLE = 1 << 0;
        const ENUMERABLE = 1 << 1;
        const CONFIGURABLE = 1 << 2;
        /// Class members only: define on the constructor.
        const STATIC = 1 << 3;
    }
}

impl PropertyAttributes {
    pub const DEFAULT: Self = Self::WRITABLE
        .union(Self::ENUMERABLE)
        .union(Self::CONFIGURABLE);

    pub(crate) fn to_flags(self) -> PropertyFlags {
        let mut flags = PropertyFlags::empty();
        flags.set(
            PropertyFlags::WRITABLE,
            self.contains(PropertyAttributes::WRITABLE),
        );
        flags.set(
            PropertyFlags::ENUMERABLE,
            self.contains(PropertyAttributes::ENUMERABLE),
        );
        flags.set(
            PropertyFlags::CONFIGURABLE,
            self.contains(PropertyAttributes::CONFIGURABLE),
        );
        flags.set(
            PropertyFlags::STATIC,
            self.contains(PropertyAttributes::STATIC),
        );
        flags
    }
}

impl Default for PropertyAttributes {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone)]
pub enum PropertyName {
    Name(String),
    Symbol(WellKnownSymbol),
    Key(Value),
}

impl fmt::Debug for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyName::Name(name) => write!(f, "{name}"),
            PropertyName::Symbol(sym) => write!(f, "[{sym:?}]"),
            PropertyName::Key(value) => write!(f, "[{value:?}]"),
        }
    }
}

impl From<&str> for PropertyName {
    fn from(name: &str) -> Self {
        PropertyName::Name(name.to_string())
    }
}

impl From<String> for PropertyName {
    fn from(name: String) -> Self {
        PropertyName::Name(name)
    }
}

impl From<WellKnownSymbol> for PropertyName {
    fn from(sym: WellKnownSymbol) -> Self {
        PropertyName::Symbol(sym)
    }
}

#[derive(Clone)]
pub enum PropertyKind {
    Value(Value),
    Method(HostFn),
    Accessor {
        getter: Option<HostFn>,
        setter: Option<SetterFn>,
    },
}

/// One exposed member. Descriptors are consumed in bulk by
/// [`Context::define_class`](crate::Context::define_class) and
/// [`Context::define_properties`](crate::Context::define_properties).
#[derive(Clone)]
pub struct PropertyDescriptor {
    pub name: PropertyName,
    pub kind: PropertyKind,
    pub attributes: PropertyAttributes,
    /// Handed to the callback through [`CallbackArgs::data`].
    pub data: Option<Arc<dyn Any + Send + Sync>>,
}

impl PropertyDescriptor {
    pub fn value(name: impl Into<PropertyName>, value: Value) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Value(value),
            attributes: PropertyAttributes::DEFAULT,
            data: None,
        }
    }

    pub fn method(
        name: impl Into<PropertyName>,
        method: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Method(Rc::new(method)),
            attributes: PropertyAttributes::WRITABLE
                | PropertyAttributes::CONFIGURABLE,
            data: None,
        }
    }

    pub fn getter(
        name: impl Into<PropertyName>,
        getter: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Accessor {
                getter: Some(Rc::new(getter)),
                setter: None,
            },
            attributes: PropertyAttributes::ENUMERABLE
                | PropertyAttributes::CONFIGURABLE,
            data: None,
        }
    }

    pub fn accessor(
        name: impl Into<PropertyName>,
        getter: impl Fn(&CallbackArgs<'_>) -> Result<Value> + 'static,
        setter: impl Fn(&CallbackArgs<'_>, Value) -> Result<()> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Accessor {
                getter: Some(Rc::new(getter)),
                setter: Some(Rc::new(setter)),
            },
            attributes: PropertyAttributes::ENUMERABLE
                | PropertyAttributes::CONFIGURABLE,
            data: None,
        }
    }

    pub fn setter(
        name: impl Into<PropertyName>,
        setter: impl Fn(&CallbackArgs<'_>, Value) -> Result<()> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PropertyKind::Accessor {
                getter: None,
                setter: Some(Rc::new(setter)),
            },
            attributes: PropertyAttributes::ENUMERABLE
                | PropertyAttributes::CONFIGURABLE,
            data: None,
        }
    }

    pub fn with_attributes(mut self, attributes: PropertyAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn into_static(mut self) -> Self {
        self.attributes |= PropertyAttributes::STATIC;
        self
    }

    pub fn is_static(&self) -> bool {
        self.attributes.contains(PropertyAttributes::STATIC)
    }
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            PropertyKind::Value(_) => "value",
            PropertyKind::Method(_) => "method",
            PropertyKind::Accessor { .. } => "accessor",
        };
        f.debug_struct("PropertyDescriptor")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("attributes", &self.attributes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_lower_to_engine_flags() {
        let attrs = PropertyAttributes::ENUMERABLE | PropertyAttributes::STATIC;
        let flags = attrs.to_flags();
        assert!(flags.contains(PropertyFlags::ENUMERABLE));
        assert!(flags.contains(PropertyFlags::STATIC));
        assert!(!flags.contains(PropertyFlags::WRITABLE));
    }

    #[test]
    fn methods_are_not_enumerable_by_default() {
        let descriptor = PropertyDescriptor::method("f", |args| {
            args.context().undefined()
        });
        assert!(!descriptor.attributes.contains(PropertyAttributes::ENUMERABLE));
        assert!(descriptor.into_static().is_static());
    }
}
