//! A small single-threaded script engine exposing a flat, status-returning
//! ABI: opaque value handles valid inside handle scopes, persistent
//! references, native callbacks with callback data, wrapping, externals,
//! proxies and thread-safe functions feeding an event loop.
//!
//! Every entry point returns `Result<_, Status>` and records the outcome so
//! that [`Env::get_last_error_info`] describes the most recent call.

pub mod heap;
pub mod threadsafe;
pub mod value;

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use heap::{
    FunctionData, Heap, HeapObject, ObjectKind, PromiseState, Property,
};
pub use heap::{Finalizer, PropertyFlags, TypedArrayKind};
use threadsafe::{LoopShared, TsfnLocal};
pub use threadsafe::{
    CallJsCallback, RawThreadsafeFunction, ThreadsafeCallMode,
    ThreadsafeFinalizer, ThreadsafeReleaseMode,
};
use value::{
    JsStr, ObjectId, PropertyKey, SymbolId, Val, js_str, number_to_string,
    string_to_number, to_int32, to_int64, utf16_to_string,
};
pub use value::{ValueType, WellKnownSymbol};

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidArg,
    ObjectExpected,
    StringExpected,
    NameExpected,
    FunctionExpected,
    NumberExpected,
    BooleanExpected,
    ArrayExpected,
    GenericFailure,
    PendingException,
    Cancelled,
    EscapeCalledTwice,
    HandleScopeMismatch,
    CallbackScopeMismatch,
    QueueFull,
    Closing,
    ArrayBufferExpected,
    TypedArrayExpected,
    ExternalExpected,
}

impl Status {
    pub fn message(self) -> &'static str {
        match self {
            Status::Ok => "",
            Status::InvalidArg => "Invalid argument",
            Status::ObjectExpected => "An object was expected",
            Status::StringExpected => "A string was expected",
            Status::NameExpected => "A string or symbol was expected",
            Status::FunctionExpected => "A function was expected",
            Status::NumberExpected => "A number was expected",
            Status::BooleanExpected => "A boolean was expected",
            Status::ArrayExpected => "An array was expected",
            Status::GenericFailure => "Unknown failure",
            Status::PendingException => "An exception is pending",
            Status::Cancelled => "The async work item was cancelled",
            Status::EscapeCalledTwice => {
                "escape_handle already called on scope"
            }
            Status::HandleScopeMismatch => "Invalid handle scope usage",
            Status::CallbackScopeMismatch => "Invalid callback scope usage",
            Status::QueueFull => "Thread-safe function queue is full",
            Status::Closing => "Thread-safe function handle is closing",
            Status::ArrayBufferExpected => "An arraybuffer was expected",
            Status::TypedArrayExpected => "A typed array was expected",
            Status::ExternalExpected => "An external value was expected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The outcome of the most recent engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorInfo {
    pub status: Status,
    pub message: &'static str,
}

impl ErrorInfo {
    const OK: Self = Self {
        status: Status::Ok,
        message: "",
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(u64);

/// A handle-stack slot. Only meaningful while the handle scope that produced
/// it is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawValue(u32);

impl RawValue {
    pub const NULL: RawValue = RawValue(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawScope(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEscapableScope(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawRef {
    index: u32,
    generation: u32,
}

#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RawDeferred(RawRef);

/// Native entry point invoked by the engine for functions, accessors and
/// constructors. Returning [`RawValue::NULL`] means `undefined`.
pub type RawCallback = fn(&Env, &CallbackInfo) -> RawValue;

/// The arguments the engine passes to a [`RawCallback`].
pub struct CallbackInfo {
    this: RawValue,
    args: Vec<RawValue>,
    new_target: RawValue,
    data: Rc<dyn Any>,
}

/// Result of [`Env::get_cb_info`].
pub struct CbInfo {
    pub argc: usize,
    pub this: RawValue,
    pub data: Rc<dyn Any>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
}

impl ErrorKind {
    fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RawPropertyKey<'a> {
    Name(&'a str),
    Value(RawValue),
}

/// A flat property descriptor consumed by `define_properties` and
/// `define_class`.
#[derive(Clone)]
pub struct RawPropertyDescriptor<'a> {
    pub key: RawPropertyKey<'a>,
    pub method: Option<RawCallback>,
    pub getter: Option<RawCallback>,
    pub setter: Option<RawCallback>,
    pub value: Option<RawValue>,
    pub flags: PropertyFlags,
    pub data: Option<Rc<dyn Any>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedArrayInfo {
    pub kind: TypedArrayKind,
    pub length: usize,
    pub buffer: RawValue,
    pub byte_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    Pending,
    Fulfilled(RawValue),
    Rejected(RawValue),
}

#[derive(Debug, Default)]
pub struct EngineCreateInfo {
    /// Allocations between automatic collections at event-loop turns.
    /// `Some(0)` disables automatic collection.
    pub gc_interval: Option<usize>,
    pub handle_capacity: Option<usize>,
    /// Handle scopes that may be open at once. `Some(0)` removes the limit.
    pub max_scope_depth: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    gc_interval: usize,
    handle_capacity: usize,
    max_scope_depth: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gc_interval: 64 * 1024,
            handle_capacity: 256,
            max_scope_depth: 64 * 1024,
        }
    }
}

struct ScopeRecord {
    id: u32,
    base: usize,
    escape_slot: Option<usize>,
    escaped: bool,
}

#[derive(Default)]
struct RefEntry {
    generation: u32,
    target: Option<(Val, u32)>,
}

#[derive(Default)]
struct RefTable {
    entries: Vec<RefEntry>,
    free: Vec<u32>,
}

impl RefTable {
    fn insert(&mut self, value: Val, count: u32) -> RawRef {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entries.push(RefEntry::default());
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        entry.target = Some((value, count));
        RawRef {
            index,
            generation: entry.generation,
        }
    }

    fn get_mut(&mut self, raw: RawRef) -> Result<&mut (Val, u32), Status> {
        self.entries
            .get_mut(raw.index as usize)
            .filter(|entry| entry.generation == raw.generation)
            .and_then(|entry| entry.target.as_mut())
            .ok_or(Status::InvalidArg)
    }

    fn remove(&mut self, raw: RawRef) -> Result<(), Status> {
        let entry = self
            .entries
            .get_mut(raw.index as usize)
            .filter(|entry| entry.generation == raw.generation)
            .ok_or(Status::InvalidArg)?;
        entry.target.take().ok_or(Status::InvalidArg)?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(raw.index);
        Ok(())
    }

    fn strong_roots(&self) -> impl Iterator<Item = &Val> {
        self.entries
            .iter()
            .filter_map(|entry| entry.target.as_ref())
            .filter(|(_, count)| *count > 0)
            .map(|(value, _)| value)
    }
}

pub struct EnvInner {
    id: EnvId,
    thread: ThreadId,
    settings: EngineSettings,
    heap: RefCell<Heap>,
    handles: RefCell<Vec<Val>>,
    scopes: RefCell<Vec<ScopeRecord>>,
    next_scope: Cell<u32>,
    refs: RefCell<RefTable>,
    global: ObjectId,
    symbols: RefCell<Vec<Option<JsStr>>>,
    last_error: Cell<ErrorInfo>,
    exception: RefCell<Option<Val>>,
    instance_data: RefCell<Option<Rc<dyn Any>>>,
    cleanup_hooks: RefCell<Vec<Box<dyn FnOnce()>>>,
    event_loop: Arc<LoopShared>,
    tsfns: RefCell<HashMap<u64, TsfnLocal>>,
    shut_down: Cell<bool>,
}

/// One engine instance, bound to the thread that created it.
#[derive(Clone)]
pub struct Env(Rc<EnvInner>);

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("id", &self.0.id)
            .field("thread", &self.0.thread)
            .field("handles", &self.0.handles.borrow().len())
            .finish()
    }
}

enum GetStep {
    Done(Val),
    Getter(ObjectId),
    Proxy(ObjectId, ObjectId),
    Next(Option<ObjectId>),
}

enum SetStep {
    Done,
    Setter(Option<ObjectId>),
    Proxy(ObjectId, ObjectId),
    Define,
}

impl Env {
    pub fn new(info: EngineCreateInfo) -> Self {
        let mut settings = EngineSettings::default();
        info.gc_interval.inspect(|&val| settings.gc_interval = val);
        info.handle_capacity
            .inspect(|&val| settings.handle_capacity = val);
        info.max_scope_depth
            .inspect(|&val| settings.max_scope_depth = val);

        let mut heap = Heap::new();
        let global = heap.alloc(HeapObject::new(ObjectKind::Ordinary, None));
        let symbols = WellKnownSymbol::ALL
            .iter()
            .map(|sym| Some(js_str(sym.description())))
            .collect();

        let inner = EnvInner {
            id: EnvId(NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed)),
            thread: thread::current().id(),
            handles: RefCell::new(Vec::with_capacity(settings.handle_capacity)),
            settings,
            heap: RefCell::new(heap),
            scopes: RefCell::new(Vec::new()),
            next_scope: Cell::new(1),
            refs: RefCell::new(RefTable::default()),
            global,
            symbols: RefCell::new(symbols),
            last_error: Cell::new(ErrorInfo::OK),
            exception: RefCell::new(None),
            instance_data: RefCell::new(None),
            cleanup_hooks: RefCell::new(Vec::new()),
            event_loop: Arc::new(LoopShared::new()),
            tsfns: RefCell::new(HashMap::new()),
            shut_down: Cell::new(false),
        };
        let env = Env(Rc::new(inner));
        env.install_builtins();
        log::debug!("engine {:?} created on {:?}", env.0.id, env.0.thread);
        env
    }

    pub fn id(&self) -> EnvId {
        self.0.id
    }

    pub fn thread(&self) -> ThreadId {
        self.0.thread
    }

    pub fn ptr_eq(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn finish<T>(&self, result: Result<T, Status>) -> Result<T, Status> {
        match &result {
            Ok(_) => self.0.last_error.set(ErrorInfo::OK),
            Err(status) => self.0.last_error.set(ErrorInfo {
                status: *status,
                message: status.message(),
            }),
        }
        result
    }

    fn preamble(&self) -> Result<(), Status> {
        if self.0.exception.borrow().is_some() {
            return Err(Status::PendingException);
        }
        Ok(())
    }

    pub fn get_last_error_info(&self) -> ErrorInfo {
        self.0.last_error.get()
    }

    // ── handle stack ───────────────────────────────────────────────

    fn push(&self, value: Val) -> RawValue {
        let mut handles = self.0.handles.borrow_mut();
        handles.push(value);
        RawValue(handles.len() as u32)
    }

    fn val(&self, raw: RawValue) -> Result<Val, Status> {
        if raw.is_null() {
            return Err(Status::InvalidArg);
        }
        self.0
            .handles
            .borrow()
            .get(raw.0 as usize - 1)
            .cloned()
            .ok_or(Status::InvalidArg)
    }

    fn object(&self, raw: RawValue) -> Result<ObjectId, Status> {
        self.val(raw)?.as_object().ok_or(Status::ObjectExpected)
    }

    fn open_scope_record(&self, escapable: bool) -> u32 {
        let id = self.0.next_scope.get();
        self.0.next_scope.set(id.wrapping_add(1).max(1));
        let escape_slot = escapable.then(|| {
            let mut handles = self.0.handles.borrow_mut();
            handles.push(Val::Undefined);
            handles.len() - 1
        });
        let base = self.0.handles.borrow().len();
        self.0.scopes.borrow_mut().push(ScopeRecord {
            id,
            base,
            escape_slot,
            escaped: false,
        });
        id
    }

    fn close_scope_record(&self, id: u32) -> Result<(), Status> {
        let base = {
            let mut scopes = self.0.scopes.borrow_mut();
            match scopes.last() {
                Some(record) if record.id == id => {}
                _ => return Err(Status::HandleScopeMismatch),
            }
            scopes.pop().map(|record| record.base).unwrap_or(0)
        };
        self.0.handles.borrow_mut().truncate(base);
        Ok(())
    }

    /// Closes `id` together with any scope a callback left open above it.
    fn unwind_scope_record(&self, id: u32) {
        loop {
            let top = self.0.scopes.borrow().last().map(|record| record.id);
            match top {
                Some(top) if top == id => {
                    let _ = self.close_scope_record(id);
                    return;
                }
                Some(top) => {
                    log::warn!("callback leaked handle scope {top}");
                    let _ = self.close_scope_record(top);
                }
                None => return,
            }
        }
    }

    fn reserve_scope(&self) -> Result<(), Status> {
        let limit = self.0.settings.max_scope_depth;
        if limit != 0 && self.0.scopes.borrow().len() >= limit {
            self.0.last_error.set(ErrorInfo {
                status: Status::GenericFailure,
                message: "handle scope depth limit reached",
            });
            return Err(Status::GenericFailure);
        }
        Ok(())
    }

    pub fn open_handle_scope(&self) -> Result<RawScope, Status> {
        self.reserve_scope()?;
        let id = self.open_scope_record(false);
        self.finish(Ok(RawScope(id)))
    }

    pub fn close_handle_scope(&self, scope: RawScope) -> Result<(), Status> {
        let result = self.close_scope_record(scope.0);
        self.finish(result)
    }

    pub fn open_escapable_handle_scope(
        &self,
    ) -> Result<RawEscapableScope, Status> {
        self.reserve_scope()?;
        let id = self.open_scope_record(true);
        self.finish(Ok(RawEscapableScope(id)))
    }

    pub fn close_escapable_handle_scope(
        &self,
        scope: RawEscapableScope,
    ) -> Result<(), Status> {
        let result = self.close_scope_record(scope.0);
        self.finish(result)
    }

    pub fn escape_handle(
        &self,
        scope: RawEscapableScope,
        escapee: RawValue,
    ) -> Result<RawValue, Status> {
        let result = (|| {
            let value = self.val(escapee)?;
            let slot = {
                let mut scopes = self.0.scopes.borrow_mut();
                let record = scopes
                    .iter_mut()
                    .find(|record| record.id == scope.0)
                    .ok_or(Status::HandleScopeMismatch)?;
                if record.escaped {
                    return Err(Status::EscapeCalledTwice);
                }
                let slot =
                    record.escape_slot.ok_or(Status::HandleScopeMismatch)?;
                record.escaped = true;
                slot
            };
            self.0.handles.borrow_mut()[slot] = value;
            Ok(RawValue(slot as u32 + 1))
        })();
        self.finish(result)
    }

    pub fn open_handle_count(&self) -> usize {
        self.0.handles.borrow().len()
    }

    // ── allocation helpers ─────────────────────────────────────────

    fn alloc(&self, kind: ObjectKind, proto: Option<ObjectId>) -> ObjectId {
        self.0.heap.borrow_mut().alloc(HeapObject::new(kind, proto))
    }

    fn alloc_function(
        &self,
        name: &str,
        callback: RawCallback,
        data: Rc<dyn Any>,
    ) -> ObjectId {
        self.alloc(
            ObjectKind::Function(FunctionData {
                name: js_str(name),
                callback,
                data,
            }),
            None,
        )
    }

    fn alloc_array(&self, values: Vec<Val>) -> ObjectId {
        self.alloc(
            ObjectKind::Array(values.into_iter().map(Some).collect()),
            None,
        )
    }

    fn define_own(
        &self,
        obj: ObjectId,
        key: PropertyKey,
        property: Property,
    ) -> Result<(), Status> {
        self.0.heap.borrow_mut().get_mut(obj)?.define(key, property);
        Ok(())
    }

    fn install_builtins(&self) {
        let global = self.0.global;
        let builtins: [(&str, RawCallback); 2] = [
            ("Proxy", builtins::proxy_constructor),
            ("Symbol", builtins::symbol_function),
        ];
        for (name, callback) in builtins {
            let function = self.alloc_function(name, callback, Rc::new(()));
            let _ = self.define_own(
                global,
                PropertyKey::from_str(name),
                Property::Data {
                    value: Val::Object(function),
                    flags: PropertyFlags::WRITABLE
                        | PropertyFlags::CONFIGURABLE,
                },
            );
            if name == "Symbol" {
                for sym in WellKnownSymbol::ALL {
                    let _ = self.define_own(
                        function,
                        PropertyKey::from_str(sym.property_name()),
                        Property::Data {
                            value: Val::Symbol(self.well_known(sym)),
                            flags: PropertyFlags::empty(),
                        },
                    );
                }
            }
        }
        let _ = self.define_own(
            global,
            PropertyKey::from_str("globalThis"),
            Property::Data {
                value: Val::Object(global),
                flags: PropertyFlags::WRITABLE | PropertyFlags::CONFIGURABLE,
            },
        );
    }

    fn well_known(&self, sym: WellKnownSymbol) -> SymbolId {
        let index = WellKnownSymbol::ALL
            .iter()
            .position(|&candidate| candidate == sym)
            .unwrap_or(0);
        SymbolId(index as u64)
    }

    // ── primitives ─────────────────────────────────────────────────

    pub fn get_undefined(&self) -> Result<RawValue, Status> {
        self.finish(Ok(self.push(Val::Undefined)))
    }

    pub fn get_null(&self) -> Result<RawValue, Status> {
        self.finish(Ok(self.push(Val::Null)))
    }

    pub fn get_boolean(&self, value: bool) -> Result<RawValue, Status> {
        self.finish(Ok(self.push(Val::Bool(value))))
    }

    pub fn get_global(&self) -> Result<RawValue, Status> {
        self.finish(Ok(self.push(Val::Object(self.0.global))))
    }

    pub fn create_double(&self, value: f64) -> Result<RawValue, Status> {
        self.finish(Ok(self.push(Val::Number(value))))
    }

    pub fn create_int32(&self, value: i32) -> Result<RawValue, Status> {
        self.create_double(f64::from(value))
    }

    pub fn create_uint32(&self, value: u32) -> Result<RawValue, Status> {
        self.create_double(f64::from(value))
    }

    pub fn create_int64(&self, value: i64) -> Result<RawValue, Status> {
        self.create_double(value as f64)
    }

    pub fn create_string_utf8(&self, bytes: &[u8]) -> Result<RawValue, Status> {
        let text = String::from_utf8_lossy(bytes);
        self.finish(Ok(self.push(Val::String(js_str(&text)))))
    }

    pub fn create_string_latin1(
        &self,
        bytes: &[u8],
    ) -> Result<RawValue, Status> {
        let units: Vec<u16> = bytes.iter().map(|&b| u16::from(b)).collect();
        self.finish(Ok(self.push(Val::String(units.into()))))
    }

    pub fn create_string_utf16(
        &self,
        units: &[u16],
    ) -> Result<RawValue, Status> {
        self.finish(Ok(self.push(Val::String(units.into()))))
    }

    pub fn create_symbol(
        &self,
        description: Option<RawValue>,
    ) -> Result<RawValue, Status> {
        let result = (|| {
            let description = match description {
                Some(raw) => match self.val(raw)? {
                    Val::String(s) => Some(s),
                    _ => return Err(Status::StringExpected),
                },
                None => None,
            };
            let id = {
                let mut symbols = self.0.symbols.borrow_mut();
                symbols.push(description);
                SymbolId(symbols.len() as u64 - 1)
            };
            Ok(self.push(Val::Symbol(id)))
        })();
        self.finish(result)
    }

    pub fn get_well_known_symbol(
        &self,
        sym: WellKnownSymbol,
    ) -> Result<RawValue, Status> {
        self.finish(Ok(self.push(Val::Symbol(self.well_known(sym)))))
    }

    pub fn get_symbol_description(
        &self,
        raw: RawValue,
    ) -> Result<Option<String>, Status> {
        let result = match self.val(raw) {
            Ok(Val::Symbol(id)) => Ok(self
                .0
                .symbols
                .borrow()
                .get(id.0 as usize)
                .cloned()
                .flatten()
                .map(|units| utf16_to_string(&units))),
            Ok(_) => Err(Status::InvalidArg),
            Err(status) => Err(status),
        };
        self.finish(result)
    }

    // ── objects ────────────────────────────────────────────────────

    pub fn create_object(&self) -> Result<RawValue, Status> {
        let obj = self.alloc(ObjectKind::Ordinary, None);
        self.finish(Ok(self.push(Val::Object(obj))))
    }

    pub fn create_array(&self) -> Result<RawValue, Status> {
        self.create_array_with_length(0)
    }

    pub fn create_array_with_length(
        &self,
        length: usize,
    ) -> Result<RawValue, Status> {
        let obj = self.alloc(ObjectKind::Array(vec![None; length]), None);
        self.finish(Ok(self.push(Val::Object(obj))))
    }

    pub fn create_function(
        &self,
        name: &str,
        callback: RawCallback,
        data: Rc<dyn Any>,
    ) -> Result<RawValue, Status> {
        let function = self.alloc_function(name, callback, data);
        self.finish(Ok(self.push(Val::Object(function))))
    }

    fn alloc_error(
        &self,
        kind: ErrorKind,
        code: Option<Val>,
        message: JsStr,
    ) -> Result<ObjectId, Status> {
        let error = self.alloc(ObjectKind::Error, None);
        let hidden = PropertyFlags::WRITABLE | PropertyFlags::CONFIGURABLE;
        self.define_own(
            error,
            PropertyKey::from_str("message"),
            Property::Data {
                value: Val::String(message),
                flags: hidden,
            },
        )?;
        self.define_own(
            error,
            PropertyKey::from_str("name"),
            Property::Data {
                value: Val::from_str(kind.name()),
                flags: hidden,
            },
        )?;
        if let Some(code) = code {
            self.define_own(
                error,
                PropertyKey::from_str("code"),
                Property::Data {
                    value: code,
                    flags: PropertyFlags::DEFAULT,
                },
            )?;
        }
        Ok(error)
    }

    pub fn create_error(
        &self,
        kind: ErrorKind,
        code: Option<RawValue>,
        message: RawValue,
    ) -> Result<RawValue, Status> {
        let result = (|| {
            let Val::String(message) = self.val(message)? else {
                return Err(Status::StringExpected);
            };
            let code = match code {
                Some(raw) => match self.val(raw)? {
                    code @ Val::String(_) => Some(code),
                    _ => return Err(Status::StringExpected),
                },
                None => None,
            };
            let error = self.alloc_error(kind, code, message)?;
            Ok(self.push(Val::Object(error)))
        })();
        self.finish(result)
    }

    pub fn create_external(
        &self,
        payload: Rc<dyn Any>,
        finalizer: Option<Finalizer>,
    ) -> Result<RawValue, Status> {
        let external = self.alloc(ObjectKind::External(payload), None);
        if let Some(finalizer) = finalizer {
            let _ = self.add_finalizer_to(external, finalizer);
        }
        self.finish(Ok(self.push(Val::Object(external))))
    }

    pub fn get_value_external(
        &self,
        raw: RawValue,
    ) -> Result<Rc<dyn Any>, Status> {
        let result = (|| {
            let obj = self.object(raw)?;
            let heap = self.0.heap.borrow();
            match &heap.get(obj)?.kind {
                ObjectKind::External(payload) => Ok(payload.clone()),
                _ => Err(Status::ExternalExpected),
            }
        })();
        self.finish(result)
    }

    pub fn create_arraybuffer(&self, bytes: &[u8]) -> Result<RawValue, Status> {
        let buffer = self.alloc(ObjectKind::ArrayBuffer(bytes.to_vec()), None);
        self.finish(Ok(self.push(Val::Object(buffer))))
    }

    pub fn get_arraybuffer_data(
        &self,
        raw: RawValue,
    ) -> Result<Vec<u8>, Status> {
        let result = (|| {
            let obj = self.object(raw)?;
            let heap = self.0.heap.borrow();
            match &heap.get(obj)?.kind {
                ObjectKind::ArrayBuffer(bytes) => Ok(bytes.clone()),
                _ => Err(Status::ArrayBufferExpected),
            }
        })();
        self.finish(result)
    }

    pub fn write_arraybuffer_data(
        &self,
        raw: RawValue,
        offset: usize,
        data: &[u8],
    ) -> Result<(), Status> {
        let result = (|| {
            let obj = self.object(raw)?;
            let mut heap = self.0.heap.borrow_mut();
            match &mut heap.get_mut(obj)?.kind {
                ObjectKind::ArrayBuffer(bytes) => {
                    let end = offset
                        .checked_add(data.len())
                        .filter(|&end| end <= bytes.len())
                        .ok_or(Status::InvalidArg)?;
                    bytes[offset..end].copy_from_slice(data);
                    Ok(())
                }
                _ => Err(Status::ArrayBufferExpected),
            }
        })();
        self.finish(result)
    }

    pub fn create_typedarray(
        &self,
        kind: TypedArrayKind,
        length: usize,
        arraybuffer: RawValue,
        byte_offset: usize,
    ) -> Result<RawValue, Status> {
        let result = (|| {
            let buffer = self.object(arraybuffer)?;
            {
                let heap = self.0.heap.borrow();
                let ObjectKind::ArrayBuffer(bytes) = &heap.get(buffer)?.kind
                else {
                    return Err(Status::ArrayBufferExpected);
                };
                if byte_offset % kind.element_size() != 0 {
                    return Err(Status::InvalidArg);
                }
                let needed = length
                    .checked_mul(kind.element_size())
                    .and_then(|n| n.checked_add(byte_offset))
                    .ok_or(Status::InvalidArg)?;
                if needed > bytes.len() {
                    return Err(Status::InvalidArg);
                }
            }
            let array = self.alloc(
                ObjectKind::TypedArray {
                    kind,
                    buffer,
                    byte_offset,
                    length,
                },
                None,
            );
            Ok(self.push(Val::Object(array)))
        })();
        self.finish(result)
    }

    pub fn get_typedarray_info(
        &self,
        raw: RawValue,
    ) -> Result<TypedArrayInfo, Status> {
        let result = (|| {
            let obj = self.object(raw)?;
            let info = {
                let heap = self.0.heap.borrow();
                match heap.get(obj)?.kind {
                    ObjectKind::TypedArray {
                        kind,
                        buffer,
                        byte_offset,
                        length,
                    } => (kind, buffer, byte_offset, length),
                    _ => return Err(Status::TypedArrayExpected),
                }
            };
            let (kind, buffer, byte_offset, length) = info;
            Ok(TypedArrayInfo {
                kind,
                length,
                buffer: self.push(Val::Object(buffer)),
                byte_offset,
            })
        })();
        self.finish(result)
    }

    pub fn create_promise(&self) -> Result<(RawDeferred, RawValue), Status> {
        let promise =
            self.alloc(ObjectKind::Promise(PromiseState::Pending), None);
        let deferred = self
            .0
            .refs
            .borrow_mut()
            .insert(Val::Object(promise), 1);
        self.finish(Ok((RawDeferred(deferred), self.push(Val::Object(promise)))))
    }

    fn settle(
        &self,
        deferred: RawDeferred,
        value: RawValue,
        fulfilled: bool,
    ) -> Result<(), Status> {
        let result = (|| {
            let value = self.val(value)?;
            let promise = {
                let mut refs = self.0.refs.borrow_mut();
                let (target, _) = refs.get_mut(deferred.0)?;
                target.as_object().ok_or(Status::InvalidArg)?
            };
            {
                let mut heap = self.0.heap.borrow_mut();
                let ObjectKind::Promise(state) = &mut heap.get_mut(promise)?.kind
                else {
                    return Err(Status::InvalidArg);
                };
                if matches!(state, PromiseState::Pending) {
                    *state = if fulfilled {
                        PromiseState::Fulfilled(value)
                    } else {
                        PromiseState::Rejected(value)
                    };
                }
            }
            self.0.refs.borrow_mut().remove(deferred.0)
        })();
        self.finish(result)
    }

    pub fn resolve_deferred(
        &self,
        deferred: RawDeferred,
        value: RawValue,
    ) -> Result<(), Status> {
        self.settle(deferred, value, true)
    }

    pub fn reject_deferred(
        &self,
        deferred: RawDeferred,
        reason: RawValue,
    ) -> Result<(), Status> {
        self.settle(deferred, reason, false)
    }

    pub fn get_promise_state(
        &self,
        raw: RawValue,
    ) -> Result<PromiseStatus, Status> {
        let result = (|| {
            let obj = self.object(raw)?;
            let state = {
                let heap = self.0.heap.borrow();
                match &heap.get(obj)?.kind {
                    ObjectKind::Promise(state) => state.clone(),
                    _ => return Err(Status::InvalidArg),
                }
            };
            Ok(match state {
                PromiseState::Pending => PromiseStatus::Pending,
                PromiseState::Fulfilled(v) => {
                    PromiseStatus::Fulfilled(self.push(v))
                }
                PromiseState::Rejected(v) => PromiseStatus::Rejected(self.push(v)),
            })
        })();
        self.finish(result)
    }

    // ── inspection ─────────────────────────────────────────────────

    fn type_of(&self, value: &Val) -> Result<ValueType, Status> {
        Ok(match value {
            Val::Undefined => ValueType::Undefined,
            Val::Null => ValueType::Null,
            Val::Bool(_) => ValueType::Boolean,
            Val::Number(_) => ValueType::Number,
            Val::String(_) => ValueType::String,
            Val::Symbol(_) => ValueType::Symbol,
            Val::Object(id) => {
                if self.is_callable(*id)? {
                    ValueType::Function
                } else if matches!(
                    self.0.heap.borrow().get(*id)?.kind,
                    ObjectKind::External(_)
                ) {
                    ValueType::External
                } else {
                    ValueType::Object
                }
            }
        })
    }

    fn is_callable(&self, mut id: ObjectId) -> Result<bool, Status> {
        let heap = self.0.heap.borrow();
        loop {
            match &heap.get(id)?.kind {
                ObjectKind::Function(_) => return Ok(true),
                ObjectKind::Proxy { target, .. } => id = *target,
                _ => return Ok(false),
            }
        }
    }

    pub fn typeof_value(&self, raw: RawValue) -> Result<ValueType, Status> {
        let result = self.val(raw).and_then(|v| self.type_of(&v));
        self.finish(result)
    }

    fn kind_matches(
        &self,
        raw: RawValue,
        predicate: impl Fn(&ObjectKind) -> bool,
    ) -> Result<bool, Status> {
        let result = (|| {
            let Val::Object(id) = self.val(raw)? else {
                return Ok(false);
            };
            let heap = self.0.heap.borrow();
            let mut current = id;
            loop {
                let kind = &heap.get(current)?.kind;
                match kind {
                    ObjectKind::Proxy { target, .. } if !predicate(kind) => {
                        current = *target
                    }
                    _ => return Ok(predicate(kind)),
                }
            }
        })();
        self.finish(result)
    }

    pub fn is_array(&self, raw: RawValue) -> Result<bool, Status> {
        self.kind_matches(raw, |kind| matches!(kind, ObjectKind::Array(_)))
    }

    pub fn is_arraybuffer(&self, raw: RawValue) -> Result<bool, Status> {
        self.kind_matches(raw, |kind| matches!(kind, ObjectKind::ArrayBuffer(_)))
    }

    pub fn is_typedarray(&self, raw: RawValue) -> Result<bool, Status> {
        self.kind_matches(raw, |kind| {
            matches!(kind, ObjectKind::TypedArray { .. })
        })
    }

    pub fn is_error(&self, raw: RawValue) -> Result<bool, Status> {
        self.kind_matches(raw, |kind| matches!(kind, ObjectKind::Error))
    }

    pub fn is_promise(&self, raw: RawValue) -> Result<bool, Status> {
        self.kind_matches(raw, |kind| matches!(kind, ObjectKind::Promise(_)))
    }

    pub fn strict_equals(
        &self,
        lhs: RawValue,
        rhs: RawValue,
    ) -> Result<bool, Status> {
        let result = (|| Ok(self.val(lhs)?.strict_equals(&self.val(rhs)?)))();
        self.finish(result)
    }

    pub fn get_value_bool(&self, raw: RawValue) -> Result<bool, Status> {
        let result = match self.val(raw) {
            Ok(Val::Bool(b)) => Ok(b),
            Ok(_) => Err(Status::BooleanExpected),
            Err(status) => Err(status),
        };
        self.finish(result)
    }

    pub fn get_value_double(&self, raw: RawValue) -> Result<f64, Status> {
        let result = match self.val(raw) {
            Ok(Val::Number(n)) => Ok(n),
            Ok(_) => Err(Status::NumberExpected),
            Err(status) => Err(status),
        };
        self.finish(result)
    }

    pub fn get_value_int32(&self, raw: RawValue) -> Result<i32, Status> {
        self.get_value_double(raw).map(to_int32)
    }

    pub fn get_value_uint32(&self, raw: RawValue) -> Result<u32, Status> {
        self.get_value_double(raw).map(|n| to_int32(n) as u32)
    }

    pub fn get_value_int64(&self, raw: RawValue) -> Result<i64, Status> {
        self.get_value_double(raw).map(to_int64)
    }

    fn string_units(&self, raw: RawValue) -> Result<JsStr, Status> {
        match self.val(raw)? {
            Val::String(units) => Ok(units),
            _ => Err(Status::StringExpected),
        }
    }

    /// Two-call idiom: `None` returns the UTF-8 byte length; `Some(buf)`
    /// copies as many whole characters as fit before a NUL terminator and
    /// returns the number of bytes copied.
    pub fn get_value_string_utf8(
        &self,
        raw: RawValue,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let result = self.string_units(raw).map(|units| {
            let text = utf16_to_string(&units);
            let Some(buf) = buf else {
                return text.len();
            };
            if buf.is_empty() {
                return 0;
            }
            let capacity = buf.len() - 1;
            let mut written = 0;
            for ch in text.chars() {
                let len = ch.len_utf8();
                if written + len > capacity {
                    break;
                }
                ch.encode_utf8(&mut buf[written..written + len]);
                written += len;
            }
            buf[written] = 0;
            written
        });
        self.finish(result)
    }

    /// Two-call idiom over UTF-16 code units.
    pub fn get_value_string_utf16(
        &self,
        raw: RawValue,
        buf: Option<&mut [u16]>,
    ) -> Result<usize, Status> {
        let result = self.string_units(raw).map(|units| {
            let Some(buf) = buf else {
                return units.len();
            };
            if buf.is_empty() {
                return 0;
            }
            let written = units.len().min(buf.len() - 1);
            buf[..written].copy_from_slice(&units[..written]);
            buf[written] = 0;
            written
        });
        self.finish(result)
    }

    /// Two-call idiom over Latin-1; code units above 0xFF keep their low
    /// byte.
    pub fn get_value_string_latin1(
        &self,
        raw: RawValue,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, Status> {
        let result = self.string_units(raw).map(|units| {
            let Some(buf) = buf else {
                return units.len();
            };
            if buf.is_empty() {
                return 0;
            }
            let written = units.len().min(buf.len() - 1);
            for (dst, &unit) in buf.iter_mut().zip(units[..written].iter()) {
                *dst = unit as u8;
            }
            buf[written] = 0;
            written
        });
        self.finish(result)
    }

    // ── coercion ───────────────────────────────────────────────────

    pub fn coerce_to_bool(&self, raw: RawValue) -> Result<RawValue, Status> {
        let result = self.val(raw).map(|v| self.push(Val::Bool(v.truthy())));
        self.finish(result)
    }

    fn to_number(&self, value: &Val) -> Result<f64, Status> {
        Ok(match value {
            Val::Undefined => f64::NAN,
            Val::Null => 0.0,
            Val::Bool(b) => f64::from(u8::from(*b)),
            Val::Number(n) => *n,
            Val::String(s) => string_to_number(s),
            Val::Symbol(_) => return Err(Status::NumberExpected),
            Val::Object(id) => {
                let primitive = match &self.0.heap.borrow().get(*id)?.kind {
                    ObjectKind::Primitive(p) => Some(p.clone()),
                    _ => None,
                };
                match primitive {
                    Some(p) => self.to_number(&p)?,
                    None => f64::NAN,
                }
            }
        })
    }

    pub fn coerce_to_number(&self, raw: RawValue) -> Result<RawValue, Status> {
        let result = (|| {
            let n = self.to_number(&self.val(raw)?)?;
            Ok(self.push(Val::Number(n)))
        })();
        self.finish(result)
    }

    fn data_property(&self, obj: ObjectId, name: &str) -> Option<Val> {
        let heap = self.0.heap.borrow();
        match heap.get(obj).ok()?.own(&PropertyKey::from_str(name))? {
            Property::Data { value, .. } => Some(value.clone()),
            Property::Accessor { .. } => None,
        }
    }

    fn to_display_string(&self, value: &Val) -> Result<String, Status> {
        Ok(match value {
            Val::Undefined => "undefined".to_string(),
            Val::Null => "null".to_string(),
            Val::Bool(b) => b.to_string(),
            Val::Number(n) => number_to_string(*n),
            Val::String(s) => utf16_to_string(s),
            Val::Symbol(_) => return Err(Status::StringExpected),
            Val::Object(id) => {
                enum Shape {
                    Primitive(Val),
                    Error,
                    Array(Vec<Option<Val>>),
                    Function(JsStr),
                    Other,
                }
                let shape = match &self.0.heap.borrow().get(*id)?.kind {
                    ObjectKind::Primitive(p) => Shape::Primitive(p.clone()),
                    ObjectKind::Error => Shape::Error,
                    ObjectKind::Array(elements) => Shape::Array(elements.clone()),
                    ObjectKind::Function(f) => Shape::Function(f.name.clone()),
                    _ => Shape::Other,
                };
                match shape {
                    Shape::Primitive(p) => self.to_display_string(&p)?,
                    Shape::Error => {
                        let name = self
                            .data_property(*id, "name")
                            .map(|v| self.to_display_string(&v))
                            .transpose()?
                            .unwrap_or_else(|| "Error".to_string());
                        let message = self
                            .data_property(*id, "message")
                            .map(|v| self.to_display_string(&v))
                            .transpose()?
                            .unwrap_or_default();
                        if message.is_empty() {
                            name
                        } else {
                            format!("{name}: {message}")
                        }
                    }
                    Shape::Array(elements) => {
                        let parts = elements
                            .iter()
                            .map(|e| match e {
                                None | Some(Val::Undefined | Val::Null) => {
                                    Ok(String::new())
                                }
                                Some(v) => self.to_display_string(v),
                            })
                            .collect::<Result<Vec<_>, _>>()?;
                        parts.join(",")
                    }
                    Shape::Function(name) => format!(
                        "function {}() {{ [native code] }}",
                        utf16_to_string(&name)
                    ),
                    Shape::Other => "[object Object]".to_string(),
                }
            }
        })
    }

    pub fn coerce_to_string(&self, raw: RawValue) -> Result<RawValue, Status> {
        let result = (|| {
            let text = self.to_display_string(&self.val(raw)?)?;
            Ok(self.push(Val::String(js_str(&text))))
        })();
        self.finish(result)
    }

    pub fn coerce_to_object(&self, raw: RawValue) -> Result<RawValue, Status> {
        let result = (|| {
            let value = self.val(raw)?;
            match value {
                Val::Object(_) => Ok(raw),
                Val::Undefined | Val::Null => Err(Status::ObjectExpected),
                primitive => {
                    let obj = self.alloc(ObjectKind::Primitive(primitive), None);
                    Ok(self.push(Val::Object(obj)))
                }
            }
        })();
        self.finish(result)
    }

    // ── property access ────────────────────────────────────────────

    fn key_of(&self, value: &Val) -> Result<PropertyKey, Status> {
        Ok(match value {
            Val::String(s) => PropertyKey::String(s.clone()),
            Val::Symbol(sym) => PropertyKey::Symbol(*sym),
            Val::Object(_) => return Err(Status::NameExpected),
            other => PropertyKey::from_str(&self.to_display_string(other)?),
        })
    }

    fn raw_key(&self, key: RawValue) -> Result<PropertyKey, Status> {
        self.key_of(&self.val(key)?)
    }

    fn exotic_get(
        heap: &Heap,
        object: &HeapObject,
        key: &PropertyKey,
    ) -> Result<Option<Val>, Status> {
        match &object.kind {
            ObjectKind::Array(elements) => {
                if let Some(index) = key.array_index() {
                    if let Some(Some(v)) = elements.get(index as usize) {
                        return Ok(Some(v.clone()));
                    }
                } else if key.is_named("length") {
                    return Ok(Some(Val::Number(elements.len() as f64)));
                }
            }
            ObjectKind::TypedArray {
                kind,
                buffer,
                byte_offset,
                length,
            } => {
                if let Some(index) = key.array_index() {
                    let index = index as usize;
                    if index >= *length {
                        return Ok(Some(Val::Undefined));
                    }
                    let ObjectKind::ArrayBuffer(bytes) = &heap.get(*buffer)?.kind
                    else {
                        return Err(Status::ArrayBufferExpected);
                    };
                    let start = byte_offset + index * kind.element_size();
                    return Ok(Some(Val::Number(kind.read(&bytes[start..]))));
                } else if key.is_named("length") {
                    return Ok(Some(Val::Number(*length as f64)));
                }
            }
            ObjectKind::ArrayBuffer(bytes) if key.is_named("byteLength") => {
                return Ok(Some(Val::Number(bytes.len() as f64)));
            }
            ObjectKind::Function(f) if key.is_named("name") => {
                if object.own(key).is_none() {
                    return Ok(Some(Val::String(f.name.clone())));
                }
            }
            _ => {}
        }
        Ok(None)
    }

    fn get_from(
        &self,
        obj: ObjectId,
        key: &PropertyKey,
        receiver: &Val,
    ) -> Result<Val, Status> {
        let mut current = Some(obj);
        while let Some(id) = current {
            let step = {
                let heap = self.0.heap.borrow();
                let object = heap.get(id)?;
                if let ObjectKind::Proxy { target, handler } = object.kind {
                    GetStep::Proxy(target, handler)
                } else if let Some(v) = Self::exotic_get(&heap, object, key)? {
                    GetStep::Done(v)
                } else {
                    match object.own(key) {
                        Some(Property::Data { value, .. }) => {
                            GetStep::Done(value.clone())
                        }
                        Some(Property::Accessor {
                            getter: Some(getter),
                            ..
                        }) => GetStep::Getter(*getter),
                        Some(Property::Accessor { getter: None, .. }) => {
                            GetStep::Done(Val::Undefined)
                        }
                        None => GetStep::Next(object.proto),
                    }
                }
            };
            match step {
                GetStep::Done(v) => return Ok(v),
                GetStep::Getter(getter) => {
                    return self.invoke(getter, receiver.clone(), &[], None);
                }
                GetStep::Proxy(target, handler) => {
                    return match self.trap(handler, "get")? {
                        Some(trap) => self.invoke(
                            trap,
                            Val::Object(handler),
                            &[Val::Object(target), key.to_val(), receiver.clone()],
                            None,
                        ),
                        None => self.get_from(target, key, receiver),
                    };
                }
                GetStep::Next(next) => current = next,
            }
        }
        Ok(Val::Undefined)
    }

    fn trap(
        &self,
        handler: ObjectId,
        name: &str,
    ) -> Result<Option<ObjectId>, Status> {
        let trap = self.get_from(
            handler,
            &PropertyKey::from_str(name),
            &Val::Object(handler),
        )?;
        match trap {
            Val::Undefined | Val::Null => Ok(None),
            Val::Object(id) if self.is_callable(id)? => Ok(Some(id)),
            _ => Err(Status::FunctionExpected),
        }
    }

    fn exotic_set(
        heap: &mut Heap,
        obj: ObjectId,
        key: &PropertyKey,
        value: &Val,
    ) -> Result<bool, Status> {
        let typed = match &mut heap.get_mut(obj)?.kind {
            ObjectKind::Array(elements) => {
                if let Some(index) = key.array_index() {
                    let index = index as usize;
                    if index >= elements.len() {
                        elements.resize(index + 1, None);
                    }
                    elements[index] = Some(value.clone());
                    return Ok(true);
                }
                if key.is_named("length") {
                    let Val::Number(n) = value else {
                        return Err(Status::NumberExpected);
                    };
                    if *n < 0.0 || n.fract() != 0.0 || *n > f64::from(u32::MAX) {
                        return Err(Status::InvalidArg);
                    }
                    elements.resize(*n as usize, None);
                    return Ok(true);
                }
                None
            }
            ObjectKind::TypedArray {
                kind,
                buffer,
                byte_offset,
                length,
            } => key.array_index().map(|index| {
                (*kind, *buffer, *byte_offset, *length, index as usize)
            }),
            _ => None,
        };
        let Some((kind, buffer, byte_offset, length, index)) = typed else {
            return Ok(false);
        };
        if index < length {
            let n = match value {
                Val::Number(n) => *n,
                Val::Bool(b) => f64::from(u8::from(*b)),
                _ => f64::NAN,
            };
            let ObjectKind::ArrayBuffer(bytes) = &mut heap.get_mut(buffer)?.kind
            else {
                return Err(Status::ArrayBufferExpected);
            };
            let start = byte_offset + index * kind.element_size();
            kind.write(&mut bytes[start..], n);
        }
        Ok(true)
    }

    fn set_on(
        &self,
        obj: ObjectId,
        key: &PropertyKey,
        value: Val,
    ) -> Result<(), Status> {
        let step = {
            let mut heap = self.0.heap.borrow_mut();
            if let ObjectKind::Proxy { target, handler } = heap.get(obj)?.kind {
                SetStep::Proxy(target, handler)
            } else if Self::exotic_set(&mut heap, obj, key, &value)? {
                SetStep::Done
            } else {
                let object = heap.get_mut(obj)?;
                let mut proto = object.proto;
                match object.own_mut(key) {
                    Some(Property::Data { value: slot, flags }) => {
                        if flags.contains(PropertyFlags::WRITABLE) {
                            *slot = value.clone();
                        }
                        SetStep::Done
                    }
                    Some(Property::Accessor { setter, .. }) => {
                        SetStep::Setter(*setter)
                    }
                    None => {
                        let mut step = SetStep::Define;
                        while let Some(id) = proto {
                            let parent = heap.get(id)?;
                            match parent.own(key) {
                                Some(Property::Accessor { setter, .. }) => {
                                    step = SetStep::Setter(*setter);
                                    break;
                                }
                                Some(Property::Data { flags, .. })
                                    if !flags.contains(PropertyFlags::WRITABLE) =>
                                {
                                    step = SetStep::Done;
                                    break;
                                }
                                _ => proto = parent.proto,
                            }
                        }
                        step
                    }
                }
            }
        };
        match step {
            SetStep::Done | SetStep::Setter(None) => Ok(()),
            SetStep::Setter(Some(setter)) => {
                self.invoke(setter, Val::Object(obj), &[value], None)?;
                Ok(())
            }
            SetStep::Proxy(target, handler) => {
                match self.trap(handler, "set")? {
                    Some(trap) => {
                        self.invoke(
                            trap,
                            Val::Object(handler),
                            &[
                                Val::Object(target),
                                key.to_val(),
                                value,
                                Val::Object(obj),
                            ],
                            None,
                        )?;
                        Ok(())
                    }
                    None => self.set_on(target, key, value),
                }
            }
            SetStep::Define => self.define_own(
                obj,
                key.clone(),
                Property::Data {
                    value,
                    flags: PropertyFlags::DEFAULT,
                },
            ),
        }
    }

    fn has_in(
        &self,
        obj: ObjectId,
        key: &PropertyKey,
        own_only: bool,
    ) -> Result<bool, Status> {
        enum HasStep {
            Found(bool),
            Proxy(ObjectId, ObjectId),
            Next(Option<ObjectId>),
        }
        let mut current = Some(obj);
        while let Some(id) = current {
            let step = {
                let heap = self.0.heap.borrow();
                let object = heap.get(id)?;
                let exotic = match &object.kind {
                    ObjectKind::Proxy { target, handler } => {
                        Some(HasStep::Proxy(*target, *handler))
                    }
                    ObjectKind::Array(elements) => {
                        if let Some(index) = key.array_index() {
                            matches!(elements.get(index as usize), Some(Some(_)))
                                .then_some(HasStep::Found(true))
                        } else {
                            key.is_named("length").then_some(HasStep::Found(true))
                        }
                    }
                    ObjectKind::TypedArray { length, .. } => {
                        match key.array_index() {
                            Some(index) => {
                                Some(HasStep::Found((index as usize) < *length))
                            }
                            None => key
                                .is_named("length")
                                .then_some(HasStep::Found(true)),
                        }
                    }
                    _ => None,
                };
                match exotic {
                    Some(step) => step,
                    None if object.own(key).is_some() => HasStep::Found(true),
                    None if own_only => HasStep::Found(false),
                    None => HasStep::Next(object.proto),
                }
            };
            match step {
                HasStep::Found(found) => return Ok(found),
                HasStep::Proxy(target, handler) => {
                    return match self.trap(handler, "has")? {
                        Some(trap) => Ok(self
                            .invoke(
                                trap,
                                Val::Object(handler),
                                &[Val::Object(target), key.to_val()],
                                None,
                            )?
                            .truthy()),
                        None => self.has_in(target, key, own_only),
                    };
                }
                HasStep::Next(next) => current = next,
            }
        }
        Ok(false)
    }

    fn delete_from(
        &self,
        obj: ObjectId,
        key: &PropertyKey,
    ) -> Result<bool, Status> {
        let (target, handler) = {
            let mut heap = self.0.heap.borrow_mut();
            let object = heap.get_mut(obj)?;
            match &mut object.kind {
                ObjectKind::Proxy { target, handler } => (*target, *handler),
                ObjectKind::Array(elements) if key.array_index().is_some() => {
                    let index = key.array_index().unwrap_or_default() as usize;
                    if let Some(slot) = elements.get_mut(index) {
                        *slot = None;
                    }
                    return Ok(true);
                }
                ObjectKind::Array(_) if key.is_named("length") => {
                    return Ok(false);
                }
                ObjectKind::TypedArray { length, .. } => match key.array_index()
                {
                    Some(index) => return Ok(index as usize >= *length),
                    None => return Ok(object.remove(key)),
                },
                _ => return Ok(object.remove(key)),
            }
        };
        match self.trap(handler, "deleteProperty")? {
            Some(trap) => Ok(self
                .invoke(
                    trap,
                    Val::Object(handler),
                    &[Val::Object(target), key.to_val()],
                    None,
                )?
                .truthy()),
            None => self.delete_from(target, key),
        }
    }

    fn own_keys(&self, obj: ObjectId) -> Result<Vec<Val>, Status> {
        let proxy = {
            let heap = self.0.heap.borrow();
            let object = heap.get(obj)?;
            let mut keys = Vec::new();
            match &object.kind {
                ObjectKind::Proxy { target, handler } => {
                    Some((*target, *handler))
                }
                kind => {
                    match kind {
                        ObjectKind::Array(elements) => {
                            keys.extend(
                                elements
                                    .iter()
                                    .enumerate()
                                    .filter(|(_, e)| e.is_some())
                                    .map(|(i, _)| Val::from_str(&i.to_string())),
                            );
                        }
                        ObjectKind::TypedArray { length, .. } => {
                            keys.extend(
                                (0..*length).map(|i| Val::from_str(&i.to_string())),
                            );
                        }
                        _ => {}
                    }
                    keys.extend(
                        object
                            .properties
                            .iter()
                            .filter(|(key, property)| {
                                matches!(key, PropertyKey::String(_))
                                    && property
                                        .flags()
                                        .contains(PropertyFlags::ENUMERABLE)
                            })
                            .map(|(key, _)| key.to_val()),
                    );
                    return Ok(keys);
                }
            }
        };
        let Some((target, handler)) = proxy else {
            return Ok(Vec::new());
        };
        match self.trap(handler, "ownKeys")? {
            Some(trap) => {
                let result = self.invoke(
                    trap,
                    Val::Object(handler),
                    &[Val::Object(target)],
                    None,
                )?;
                let id = result.as_object().ok_or(Status::ArrayExpected)?;
                let heap = self.0.heap.borrow();
                match &heap.get(id)?.kind {
                    ObjectKind::Array(elements) => {
                        Ok(elements.iter().flatten().cloned().collect())
                    }
                    _ => Err(Status::ArrayExpected),
                }
            }
            None => self.own_keys(target),
        }
    }

    pub fn get_property(
        &self,
        object: RawValue,
        key: RawValue,
    ) -> Result<RawValue, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            let key = self.raw_key(key)?;
            let value = self.get_from(obj, &key, &Val::Object(obj))?;
            Ok(self.push(value))
        })();
        self.finish(result)
    }

    pub fn set_property(
        &self,
        object: RawValue,
        key: RawValue,
        value: RawValue,
    ) -> Result<(), Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            let key = self.raw_key(key)?;
            self.set_on(obj, &key, self.val(value)?)
        })();
        self.finish(result)
    }

    pub fn has_property(
        &self,
        object: RawValue,
        key: RawValue,
    ) -> Result<bool, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            self.has_in(obj, &self.raw_key(key)?, false)
        })();
        self.finish(result)
    }

    pub fn has_own_property(
        &self,
        object: RawValue,
        key: RawValue,
    ) -> Result<bool, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            let key = match self.val(key)? {
                Val::String(s) => PropertyKey::String(s),
                Val::Symbol(sym) => PropertyKey::Symbol(sym),
                _ => return Err(Status::NameExpected),
            };
            self.has_in(obj, &key, true)
        })();
        self.finish(result)
    }

    pub fn delete_property(
        &self,
        object: RawValue,
        key: RawValue,
    ) -> Result<bool, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            self.delete_from(obj, &self.raw_key(key)?)
        })();
        self.finish(result)
    }

    pub fn get_named_property(
        &self,
        object: RawValue,
        name: &str,
    ) -> Result<RawValue, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            let value =
                self.get_from(obj, &PropertyKey::from_str(name), &Val::Object(obj))?;
            Ok(self.push(value))
        })();
        self.finish(result)
    }

    pub fn set_named_property(
        &self,
        object: RawValue,
        name: &str,
        value: RawValue,
    ) -> Result<(), Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            self.set_on(obj, &PropertyKey::from_str(name), self.val(value)?)
        })();
        self.finish(result)
    }

    pub fn has_named_property(
        &self,
        object: RawValue,
        name: &str,
    ) -> Result<bool, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            self.has_in(obj, &PropertyKey::from_str(name), false)
        })();
        self.finish(result)
    }

    pub fn get_element(
        &self,
        object: RawValue,
        index: u32,
    ) -> Result<RawValue, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            let value = self.get_from(
                obj,
                &PropertyKey::from_index(index),
                &Val::Object(obj),
            )?;
            Ok(self.push(value))
        })();
        self.finish(result)
    }

    pub fn set_element(
        &self,
        object: RawValue,
        index: u32,
        value: RawValue,
    ) -> Result<(), Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            self.set_on(obj, &PropertyKey::from_index(index), self.val(value)?)
        })();
        self.finish(result)
    }

    pub fn has_element(
        &self,
        object: RawValue,
        index: u32,
    ) -> Result<bool, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            self.has_in(obj, &PropertyKey::from_index(index), false)
        })();
        self.finish(result)
    }

    pub fn delete_element(
        &self,
        object: RawValue,
        index: u32,
    ) -> Result<bool, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(object)?;
            self.delete_from(obj, &PropertyKey::from_index(index))
        })();
        self.finish(result)
    }

    pub fn get_array_length(&self, raw: RawValue) -> Result<u32, Status> {
        let result = (|| {
            let obj = self.object(raw)?;
            let heap = self.0.heap.borrow();
            match &heap.get(obj)?.kind {
                ObjectKind::Array(elements) => Ok(elements.len() as u32),
                _ => Err(Status::ArrayExpected),
            }
        })();
        self.finish(result)
    }

    /// Enumerable own string keys, array indices first.
    pub fn get_property_names(&self, raw: RawValue) -> Result<RawValue, Status> {
        let result = (|| {
            self.preamble()?;
            let obj = self.object(raw)?;
            let keys = self.own_keys(obj)?;
            let array = self.alloc_array(keys);
            Ok(self.push(Val::Object(array)))
        })();
        self.finish(result)
    }

    pub fn get_prototype(&self, raw: RawValue) -> Result<RawValue, Status> {
        let result = (|| {
            let obj = self.object(raw)?;
            let proto = self.0.heap.borrow().get(obj)?.proto;
            Ok(self.push(proto.map_or(Val::Null, Val::Object)))
        })();
        self.finish(result)
    }

    pub fn instanceof(
        &self,
        object: RawValue,
        constructor: RawValue,
    ) -> Result<bool, Status> {
        let result = (|| {
            self.preamble()?;
            let ctor = self.object(constructor)?;
            if !self.is_callable(ctor)? {
                return Err(Status::FunctionExpected);
            }
            let Val::Object(obj) = self.val(object)? else {
                return Ok(false);
            };
            let prototype = self.get_from(
                ctor,
                &PropertyKey::from_str("prototype"),
                &Val::Object(ctor),
            )?;
            let Some(prototype) = prototype.as_object() else {
                return Ok(false);
            };
            let heap = self.0.heap.borrow();
            let mut current = heap.get(obj)?.proto;
            while let Some(id) = current {
                if id == prototype {
                    return Ok(true);
                }
                current = heap.get(id)?.proto;
            }
            Ok(false)
        })();
        self.finish(result)
    }

    fn lower_descriptor(
        &self,
        descriptor: &RawPropertyDescriptor<'_>,
    ) -> Result<(PropertyKey, Property), Status> {
        let key = match descriptor.key {
            RawPropertyKey::Name(name) => PropertyKey::from_str(name),
            RawPropertyKey::Value(raw) => match self.val(raw)? {
                Val::String(s) => PropertyKey::String(s),
                Val::Symbol(sym) => PropertyKey::Symbol(sym),
                _ => return Err(Status::NameExpected),
            },
        };
        let name = match &key {
            PropertyKey::String(s) => utf16_to_string(s),
            PropertyKey::Symbol(_) => String::new(),
        };
        let data = descriptor
            .data
            .clone()
            .unwrap_or_else(|| Rc::new(()) as Rc<dyn Any>);
        let flags = descriptor.flags - PropertyFlags::STATIC;
        let property = if descriptor.getter.is_some() || descriptor.setter.is_some()
        {
            Property::Accessor {
                getter: descriptor
                    .getter
                    .map(|cb| self.alloc_function(&name, cb, data.clone())),
                setter: descriptor
                    .setter
                    .map(|cb| self.alloc_function(&name, cb, data.clone())),
                flags: flags - PropertyFlags::WRITABLE,
            }
        } else if let Some(method) = descriptor.method {
            Property::Data {
                value: Val::Object(self.alloc_function(&name, method, data)),
                flags,
            }
        } else {
            let value = match descriptor.value {
                Some(raw) => self.val(raw)?,
                None => Val::Undefined,
            };
            Property::Data { value, flags }
        };
        Ok((key, property))
    }

    pub fn define_properties(
        &self,
        object: RawValue,
        descriptors: &[RawPropertyDescriptor<'_>],
    ) -> Result<(), Status> {
        let result = (|| {
            let obj = self.object(object)?;
            for descriptor in descriptors {
                let (key, property) = self.lower_descriptor(descriptor)?;
                self.define_own(obj, key, property)?;
            }
            Ok(())
        })();
        self.finish(result)
    }

    /// Defines a constructor function whose `prototype` carries the
    /// non-static descriptors; static descriptors land on the constructor.
    pub fn define_class(
        &self,
        name: &str,
        constructor: RawCallback,
        data: Rc<dyn Any>,
        descriptors: &[RawPropertyDescriptor<'_>],
    ) -> Result<RawValue, Status> {
        let result = (|| {
            let ctor = self.alloc_function(name, constructor, data);
            // root the constructor before allocating anything else
            let raw = self.push(Val::Object(ctor));
            let prototype = self.alloc(ObjectKind::Ordinary, None);
            self.define_own(
                ctor,
                PropertyKey::from_str("prototype"),
                Property::Data {
                    value: Val::Object(prototype),
                    flags: PropertyFlags::WRITABLE,
                },
            )?;
            self.define_own(
                prototype,
                PropertyKey::from_str("constructor"),
                Property::Data {
                    value: Val::Object(ctor),
                    flags: PropertyFlags::WRITABLE | PropertyFlags::CONFIGURABLE,
                },
            )?;
            for descriptor in descriptors {
                let (key, property) = self.lower_descriptor(descriptor)?;
                let target = if descriptor.flags.contains(PropertyFlags::STATIC) {
                    ctor
                } else {
                    prototype
                };
                self.define_own(target, key, property)?;
            }
            Ok(raw)
        })();
        self.finish(result)
    }

    // ── calls ──────────────────────────────────────────────────────

    fn invoke(
        &self,
        func: ObjectId,
        this: Val,
        args: &[Val],
        new_target: Option<Val>,
    ) -> Result<Val, Status> {
        enum Callee {
            Native(RawCallback, Rc<dyn Any>),
            Proxy(ObjectId, ObjectId),
        }
        let callee = match &self.0.heap.borrow().get(func)?.kind {
            ObjectKind::Function(f) => Callee::Native(f.callback, f.data.clone()),
            ObjectKind::Proxy { target, handler } => {
                Callee::Proxy(*target, *handler)
            }
            _ => return Err(Status::FunctionExpected),
        };
        match callee {
            Callee::Proxy(target, handler) => match self.trap(handler, "apply")? {
                Some(trap) => {
                    let arguments = self.alloc_array(args.to_vec());
                    self.invoke(
                        trap,
                        Val::Object(handler),
                        &[Val::Object(target), this, Val::Object(arguments)],
                        None,
                    )
                }
                None => self.invoke(target, this, args, new_target),
            },
            Callee::Native(callback, data) => {
                let scope = self.open_scope_record(false);
                let info = CallbackInfo {
                    this: self.push(this),
                    args: args.iter().map(|arg| self.push(arg.clone())).collect(),
                    new_target: new_target
                        .map(|target| self.push(target))
                        .unwrap_or(RawValue::NULL),
                    data,
                };
                let result = callback(self, &info);
                let outcome = if self.0.exception.borrow().is_some() {
                    Err(Status::PendingException)
                } else if result.is_null() {
                    Ok(Val::Undefined)
                } else {
                    self.val(result)
                };
                self.unwind_scope_record(scope);
                outcome
            }
        }
    }

    fn construct(
        &self,
        func: ObjectId,
        args: &[Val],
        new_target: Val,
    ) -> Result<Val, Status> {
        let proxy = match &self.0.heap.borrow().get(func)?.kind {
            ObjectKind::Proxy { target, handler } => Some((*target, *handler)),
            ObjectKind::Function(_) => None,
            _ => return Err(Status::FunctionExpected),
        };
        if let Some((target, handler)) = proxy {
            return match self.trap(handler, "construct")? {
                Some(trap) => {
                    let arguments = self.alloc_array(args.to_vec());
                    let result = self.invoke(
                        trap,
                        Val::Object(handler),
                        &[Val::Object(target), Val::Object(arguments), new_target],
                        None,
                    )?;
                    match result {
                        Val::Object(_) => Ok(result),
                        _ => Err(Status::ObjectExpected),
                    }
                }
                None => self.construct(target, args, new_target),
            };
        }
        let prototype = self.get_from(
            func,
            &PropertyKey::from_str("prototype"),
            &Val::Object(func),
        )?;
        let this = self.alloc(ObjectKind::Ordinary, prototype.as_object());
        let result = self.invoke(func, Val::Object(this), args, Some(new_target))?;
        Ok(match result {
            Val::Object(_) => result,
            _ => Val::Object(this),
        })
    }

    pub fn call_function(
        &self,
        recv: RawValue,
        func: RawValue,
        args: &[RawValue],
    ) -> Result<RawValue, Status> {
        let result = (|| {
            self.preamble()?;
            let this = self.val(recv)?;
            let Val::Object(func) = self.val(func)? else {
                return Err(Status::FunctionExpected);
            };
            let args = args
                .iter()
                .map(|&raw| self.val(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let value = self.invoke(func, this, &args, None)?;
            Ok(self.push(value))
        })();
        self.finish(result)
    }

    pub fn new_instance(
        &self,
        constructor: RawValue,
        args: &[RawValue],
    ) -> Result<RawValue, Status> {
        let result = (|| {
            self.preamble()?;
            let ctor_val = self.val(constructor)?;
            let Val::Object(ctor) = ctor_val else {
                return Err(Status::FunctionExpected);
            };
            let args = args
                .iter()
                .map(|&raw| self.val(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let value = self.construct(ctor, &args, ctor_val)?;
            Ok(self.push(value))
        })();
        self.finish(result)
    }

    /// Copies up to `argv.len()` arguments into `argv`, padding with
    /// `undefined`, and reports the actual argument count.
    pub fn get_cb_info(
        &self,
        info: &CallbackInfo,
        argv: &mut [RawValue],
    ) -> Result<CbInfo, Status> {
        for (i, slot) in argv.iter_mut().enumerate() {
            *slot = match info.args.get(i) {
                Some(&raw) => raw,
                None => self.push(Val::Undefined),
            };
        }
        self.finish(Ok(CbInfo {
            argc: info.args.len(),
            this: info.this,
            data: info.data.clone(),
        }))
    }

    pub fn get_new_target(
        &self,
        info: &CallbackInfo,
    ) -> Result<Option<RawValue>, Status> {
        self.finish(Ok((!info.new_target.is_null()).then_some(info.new_target)))
    }

    // ── wrapping ───────────────────────────────────────────────────

    pub fn wrap(
        &self,
        object: RawValue,
        payload: Rc<dyn Any>,
        finalizer: Option<Finalizer>,
    ) -> Result<(), Status> {
        let result = (|| {
            let obj = self.object(object)?;
            let mut heap = self.0.heap.borrow_mut();
            let target = heap.get_mut(obj)?;
            if target.wrap.is_some() {
                return Err(Status::InvalidArg);
            }
            target.wrap = Some(payload);
            target.finalizers.extend(finalizer);
            Ok(())
        })();
        self.finish(result)
    }

    pub fn unwrap(&self, object: RawValue) -> Result<Rc<dyn Any>, Status> {
        let result = (|| {
            let obj = self.object(object)?;
            let heap = self.0.heap.borrow();
            heap.get(obj)?.wrap.clone().ok_or(Status::InvalidArg)
        })();
        self.finish(result)
    }

    pub fn remove_wrap(&self, object: RawValue) -> Result<Rc<dyn Any>, Status> {
        let result = (|| {
            let obj = self.object(object)?;
            let mut heap = self.0.heap.borrow_mut();
            heap.get_mut(obj)?.wrap.take().ok_or(Status::InvalidArg)
        })();
        self.finish(result)
    }

    fn add_finalizer_to(
        &self,
        obj: ObjectId,
        finalizer: Finalizer,
    ) -> Result<(), Status> {
        self.0.heap.borrow_mut().get_mut(obj)?.finalizers.push(finalizer);
        Ok(())
    }

    pub fn add_finalizer(
        &self,
        object: RawValue,
        finalizer: Finalizer,
    ) -> Result<(), Status> {
        let result = self
            .object(object)
            .and_then(|obj| self.add_finalizer_to(obj, finalizer));
        self.finish(result)
    }

    // ── exceptions ─────────────────────────────────────────────────

    pub fn throw(&self, error: RawValue) -> Result<(), Status> {
        let result = self.val(error).map(|value| {
            *self.0.exception.borrow_mut() = Some(value);
        });
        self.finish(result)
    }

    pub fn throw_error(
        &self,
        kind: ErrorKind,
        code: Option<&str>,
        message: &str,
    ) -> Result<(), Status> {
        let result = self
            .alloc_error(kind, code.map(Val::from_str), js_str(message))
            .map(|error| {
                *self.0.exception.borrow_mut() = Some(Val::Object(error));
            });
        self.finish(result)
    }

    pub fn is_exception_pending(&self) -> bool {
        self.0.exception.borrow().is_some()
    }

    /// Takes the pending exception, or `undefined` when none is pending.
    pub fn get_and_clear_last_exception(&self) -> Result<RawValue, Status> {
        let exception = self.0.exception.borrow_mut().take();
        self.finish(Ok(self.push(exception.unwrap_or(Val::Undefined))))
    }

    // ── references ─────────────────────────────────────────────────

    pub fn create_reference(
        &self,
        value: RawValue,
        initial_count: u32,
    ) -> Result<RawRef, Status> {
        let result = self
            .val(value)
            .map(|value| self.0.refs.borrow_mut().insert(value, initial_count));
        self.finish(result)
    }

    pub fn delete_reference(&self, reference: RawRef) -> Result<(), Status> {
        let result = self.0.refs.borrow_mut().remove(reference);
        self.finish(result)
    }

    pub fn reference_ref(&self, reference: RawRef) -> Result<u32, Status> {
        let result = self.0.refs.borrow_mut().get_mut(reference).map(|entry| {
            entry.1 += 1;
            entry.1
        });
        self.finish(result)
    }

    pub fn reference_unref(&self, reference: RawRef) -> Result<u32, Status> {
        let result = self.0.refs.borrow_mut().get_mut(reference).and_then(
            |entry| {
                if entry.1 == 0 {
                    return Err(Status::GenericFailure);
                }
                entry.1 -= 1;
                Ok(entry.1)
            },
        );
        self.finish(result)
    }

    /// `None` once a weakly held object has been collected.
    pub fn get_reference_value(
        &self,
        reference: RawRef,
    ) -> Result<Option<RawValue>, Status> {
        let result = (|| {
            let value = self.0.refs.borrow_mut().get_mut(reference)?.0.clone();
            if let Val::Object(id) = value {
                if !self.0.heap.borrow().is_valid(id) {
                    return Ok(None);
                }
            }
            Ok(Some(self.push(value)))
        })();
        self.finish(result)
    }

    // ── garbage collection ─────────────────────────────────────────

    pub fn collect_garbage(&self) {
        let swept = {
            let handles = self.0.handles.borrow();
            let refs = self.0.refs.borrow();
            let exception = self.0.exception.borrow();
            let global = Val::Object(self.0.global);
            let roots = handles
                .iter()
                .chain(refs.strong_roots())
                .chain(exception.iter())
                .chain(std::iter::once(&global));
            self.0.heap.borrow_mut().collect(roots)
        };
        for mut object in swept {
            for finalizer in object.finalizers.drain(..) {
                finalizer(self);
            }
        }
    }

    pub fn live_objects(&self) -> usize {
        self.0.heap.borrow().live_objects()
    }

    pub fn gc_runs(&self) -> u64 {
        self.0.heap.borrow().gc_runs()
    }

    fn maybe_collect(&self) {
        let interval = self.0.settings.gc_interval;
        if interval == 0 {
            return;
        }
        if self.0.heap.borrow().allocations_since_gc() >= interval {
            self.collect_garbage();
        }
    }

    // ── instance lifecycle ─────────────────────────────────────────

    pub fn set_instance_data(&self, data: Rc<dyn Any>) {
        *self.0.instance_data.borrow_mut() = Some(data);
    }

    pub fn get_instance_data(&self) -> Option<Rc<dyn Any>> {
        self.0.instance_data.borrow().clone()
    }

    pub fn add_cleanup_hook(&self, hook: Box<dyn FnOnce()>) {
        self.0.cleanup_hooks.borrow_mut().push(hook);
    }

    pub fn is_shut_down(&self) -> bool {
        self.0.shut_down.get()
    }

    /// Runs cleanup hooks in reverse registration order, then aborts every
    /// thread-safe function still alive.
    pub fn shutdown(&self) {
        if self.0.shut_down.replace(true) {
            return;
        }
        log::debug!("engine {:?} shutting down", self.0.id);
        loop {
            let hook = self.0.cleanup_hooks.borrow_mut().pop();
            match hook {
                Some(hook) => hook(),
                None => break,
            }
        }
        self.abort_threadsafe_functions();
        *self.0.instance_data.borrow_mut() = None;
    }
}

mod builtins {
    use super::*;

    pub(super) fn proxy_constructor(env: &Env, info: &CallbackInfo) -> RawValue {
        if info.new_target.is_null() {
            let _ = env.throw_error(
                ErrorKind::TypeError,
                None,
                "Constructor Proxy requires 'new'",
            );
            return RawValue::NULL;
        }
        let target = info.args.first().and_then(|&raw| env.object(raw).ok());
        let handler = info.args.get(1).and_then(|&raw| env.object(raw).ok());
        let (Some(target), Some(handler)) = (target, handler) else {
            let _ = env.throw_error(
                ErrorKind::TypeError,
                None,
                "Cannot create proxy with a non-object as target or handler",
            );
            return RawValue::NULL;
        };
        let proxy = env.alloc(ObjectKind::Proxy { target, handler }, None);
        env.push(Val::Object(proxy))
    }

    pub(super) fn symbol_function(env: &Env, info: &CallbackInfo) -> RawValue {
        if !info.new_target.is_null() {
            let _ = env.throw_error(
                ErrorKind::TypeError,
                None,
                "Symbol is not a constructor",
            );
            return RawValue::NULL;
        }
        let description = match info.args.first() {
            Some(&raw) => match env.coerce_to_string(raw) {
                Ok(s) => Some(s),
                Err(_) => return RawValue::NULL,
            },
            None => None,
        };
        env.create_symbol(description).unwrap_or(RawValue::NULL)
    }
}
