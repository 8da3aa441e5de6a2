use std::{any::Any, fmt, rc::Rc};

use bitflags::bitflags;

use crate::engine::{
    Env, RawCallback, Status,
    value::{JsStr, ObjectId, PropertyKey, Val},
};

pub type Finalizer = Box<dyn FnOnce(&Env)>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropertyFlags: u32 {
        const WRITABLE = 1 << 0;
        const ENUMERABLE = 1 << 1;
        const CONFIGURABLE = 1 << 2;
        /// Only meaningful for `define_class`: place on the constructor.
        const STATIC = 1 << 10;
    }
}

impl PropertyFlags {
    pub const DEFAULT: Self = Self::WRITABLE
        .union(Self::ENUMERABLE)
        .union(Self::CONFIGURABLE);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypedArrayKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl TypedArrayKind {
    pub fn element_size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Uint8Clamped => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub(crate) fn read(self, bytes: &[u8]) -> f64 {
        match self {
            Self::Int8 => f64::from(bytes[0] as i8),
            Self::Uint8 | Self::Uint8Clamped => f64::from(bytes[0]),
            Self::Int16 => f64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            Self::Uint16 => {
                f64::from(u16::from_le_bytes([bytes[0], bytes[1]]))
            }
            Self::Int32 => f64::from(i32::from_le_bytes(quad(bytes))),
            Self::Uint32 => f64::from(u32::from_le_bytes(quad(bytes))),
            Self::Float32 => f64::from(f32::from_le_bytes(quad(bytes))),
            Self::Float64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw)
            }
        }
    }

    pub(crate) fn write(self, bytes: &mut [u8], value: f64) {
        let int = crate::engine::value::to_int32(value);
        match self {
            Self::Int8 | Self::Uint8 => bytes[0] = int as u8,
            Self::Uint8Clamped => {
                bytes[0] = if value.is_nan() {
                    0
                } else {
                    value.round().clamp(0.0, 255.0) as u8
                }
            }
            Self::Int16 | Self::Uint16 => {
                bytes[..2].copy_from_slice(&(int as u16).to_le_bytes())
            }
            Self::Int32 | Self::Uint32 => {
                bytes[..4].copy_from_slice(&int.to_le_bytes())
            }
            Self::Float32 => {
                bytes[..4].copy_from_slice(&(value as f32).to_le_bytes())
            }
            Self::Float64 => bytes[..8].copy_from_slice(&value.to_le_bytes()),
        }
    }
}

fn quad(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

#[derive(Debug, Clone)]
pub(crate) enum PromiseState {
    Pending,
    Fulfilled(Val),
    Rejected(Val),
}

pub(crate) struct FunctionData {
    pub name: JsStr,
    pub callback: RawCallback,
    pub data: Rc<dyn Any>,
}

pub(crate) enum ObjectKind {
    Ordinary,
    Array(Vec<Option<Val>>),
    Function(FunctionData),
    External(Rc<dyn Any>),
    ArrayBuffer(Vec<u8>),
    TypedArray {
        kind: TypedArrayKind,
        buffer: ObjectId,
        byte_offset: usize,
        length: usize,
    },
    Error,
    Promise(PromiseState),
    Proxy {
        target: ObjectId,
        handler: ObjectId,
    },
    /// Object wrapper around a primitive produced by `coerce_to_object`.
    Primitive(Val),
}

#[derive(Debug, Clone)]
pub(crate) enum Property {
    Data {
        value: Val,
        flags: PropertyFlags,
    },
    Accessor {
        getter: Option<ObjectId>,
        setter: Option<ObjectId>,
        flags: PropertyFlags,
    },
}

impl Property {
    pub fn flags(&self) -> PropertyFlags {
        match self {
            Property::Data { flags, .. } | Property::Accessor { flags, .. } => {
                *flags
            }
        }
    }
}

pub(crate) struct HeapObject {
    pub kind: ObjectKind,
    pub proto: Option<ObjectId>,
    pub properties: Vec<(PropertyKey, Property)>,
    pub wrap: Option<Rc<dyn Any>>,
    pub finalizers: Vec<Finalizer>,
}

impl fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapObject")
            .field("proto", &self.proto)
            .field("properties", &self.properties.len())
            .field("wrapped", &self.wrap.is_some())
            .finish()
    }
}

impl HeapObject {
    pub fn new(kind: ObjectKind, proto: Option<ObjectId>) -> Self {
        Self {
            kind,
            proto,
            properties: Vec::new(),
            wrap: None,
            finalizers: Vec::new(),
        }
    }

    pub fn own(&self, key: &PropertyKey) -> Option<&Property> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, p)| p)
    }

    pub fn own_mut(&mut self, key: &PropertyKey) -> Option<&mut Property> {
        self.properties
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, p)| p)
    }

    pub fn define(&mut self, key: PropertyKey, property: Property) {
        match self.own_mut(&key) {
            Some(existing) => *existing = property,
            None => self.properties.push((key, property)),
        }
    }

    pub fn remove(&mut self, key: &PropertyKey) -> bool {
        let Some(pos) = self.properties.iter().position(|(k, _)| k == key)
        else {
            return true;
        };
        if !self.properties[pos].1.flags().contains(PropertyFlags::CONFIGURABLE)
        {
            return false;
        }
        self.properties.remove(pos);
        true
    }
}

pub(crate) trait Visitor {
    fn visit(&mut self, value: &Val);

    fn visit_object(&mut self, id: ObjectId) {
        self.visit(&Val::Object(id));
    }
}

pub(crate) trait Visitable {
    fn visit_edges(&self, visitor: &mut impl Visitor);
}

impl Visitable for HeapObject {
    fn visit_edges(&self, visitor: &mut impl Visitor) {
        if let Some(proto) = self.proto {
            visitor.visit_object(proto);
        }
        for (key, property) in &self.properties {
            if let PropertyKey::Symbol(sym) = key {
                visitor.visit(&Val::Symbol(*sym));
            }
            match property {
                Property::Data { value, .. } => visitor.visit(value),
                Property::Accessor { getter, setter, .. } => {
                    getter.iter().chain(setter).for_each(|&f| {
                        visitor.visit_object(f);
                    });
                }
            }
        }
        match &self.kind {
            ObjectKind::Array(elements) => {
                elements.iter().flatten().for_each(|v| visitor.visit(v));
            }
            ObjectKind::TypedArray { buffer, .. } => {
                visitor.visit_object(*buffer)
            }
            ObjectKind::Promise(
                PromiseState::Fulfilled(v) | PromiseState::Rejected(v),
            ) => visitor.visit(v),
            ObjectKind::Proxy { target, handler } => {
                visitor.visit_object(*target);
                visitor.visit_object(*handler);
            }
            ObjectKind::Primitive(v) => visitor.visit(v),
            _ => {}
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

/// Non-moving mark/sweep heap over generation-checked slots.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    slots: Vec<Slot>,
    marks: Vec<bool>,
    free_list: Vec<u32>,
    live: usize,
    allocations_since_gc: usize,
    gc_runs: u64,
}

struct Marker<'a> {
    slots: &'a [Slot],
    marks: &'a mut [bool],
    work: Vec<ObjectId>,
}

impl Visitor for Marker<'_> {
    fn visit(&mut self, value: &Val) {
        if let Val::Object(id) = value {
            let idx = id.index() as usize;
            let valid = self.slots.get(idx).is_some_and(|slot| {
                slot.generation == id.generation() && slot.object.is_some()
            });
            if valid && !self.marks[idx] {
                self.marks[idx] = true;
                self.work.push(*id);
            }
        }
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_objects(&self) -> usize {
        self.live
    }

    pub fn gc_runs(&self) -> u64 {
        self.gc_runs
    }

    pub fn allocations_since_gc(&self) -> usize {
        self.allocations_since_gc
    }

    pub fn alloc(&mut self, object: HeapObject) -> ObjectId {
        self.live += 1;
        self.allocations_since_gc += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.object.is_none());
            slot.object = Some(object);
            return ObjectId::from_parts(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            object: Some(object),
        });
        self.marks.push(false);
        ObjectId::from_parts(index, 0)
    }

    pub fn is_valid(&self, id: ObjectId) -> bool {
        self.get(id).is_ok()
    }

    pub fn get(&self, id: ObjectId) -> Result<&HeapObject, Status> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.object.as_ref())
            .ok_or(Status::InvalidArg)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Result<&mut HeapObject, Status> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.object.as_mut())
            .ok_or(Status::InvalidArg)
    }

    /// Marks from `roots`, sweeps the rest and hands back the swept objects'
    /// finalizers and payloads so the caller can run them without holding a
    /// borrow of the heap.
    pub fn collect<'v>(
        &mut self,
        roots: impl IntoIterator<Item = &'v Val>,
    ) -> Vec<HeapObject> {
        self.gc_runs += 1;
        self.allocations_since_gc = 0;

        {
            let mut marker = Marker {
                slots: &self.slots,
                marks: &mut self.marks,
                work: Vec::new(),
            };
            for root in roots {
                marker.visit(root);
            }
            while let Some(id) = marker.work.pop() {
                let slots = marker.slots;
                if let Some(object) = slots[id.index() as usize].object.as_ref()
                {
                    object.visit_edges(&mut marker);
                }
            }
        }

        let mut swept = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let marked = std::mem::replace(&mut self.marks[idx], false);
            if marked || slot.object.is_none() {
                continue;
            }
            if let Some(object) = slot.object.take() {
                swept.push(object);
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free_list.push(idx as u32);
            self.live -= 1;
        }
        log::trace!(
            "gc #{}: swept {} objects, {} live",
            self.gc_runs,
            swept.len(),
            self.live
        );
        swept
    }
}
