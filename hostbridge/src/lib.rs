pub mod engine;

mod bound;
mod callback;
mod class;
mod context;
mod convert;
mod descriptor;
mod error;
mod module;
mod proxy;
mod reference;
mod registry;
mod scope;
mod sync_context;
mod threadsafe;
mod value;

pub use bound::ThreadBound;
pub use callback::{CallbackArgs, HostFn, SetterFn};
pub use class::{ClassBuilder, StructBuilder, StructClass};
pub use context::{Context, ContextCreateInfo, ContextSettings, Deferred};
pub use convert::{FromScript, FromScriptFn, ToScript, ToScriptFn, converters};
pub use descriptor::{
    PropertyAttributes, PropertyDescriptor, PropertyKind, PropertyName,
};
pub use error::{Error, Result, fatal_error};
pub use module::register_module;
pub use proxy::{
    ListProjection, MapProjection, ProxyHandler, ProxyTraps, SharedList,
    SharedMap,
};
pub use reference::{Reference, ReferenceState};
pub use registry::{ObjectKey, Registry};
pub use scope::{Scope, ScopeKind, ScopeState};
pub use sync_context::{AsyncScope, SyncContext};
pub use threadsafe::{
    DispatchFn, ThreadSafeFunction, ThreadSafeFunctionCreateInfo,
};
pub use value::{TypedArrayView, Value};
