//! Engine interface consumed by the boundary
//!
//! The boundary never reaches into an engine's internals. Everything it needs
//! from a script engine (object primitives, class templates, persistent
//! handles, promises, script execution) goes through the [`Engine`] trait, and
//! every native callback comes back through [`NativeDispatcher`].
//!
//! ## Reentrancy
//!
//! All methods take `&self`. Implementations keep their state behind interior
//! mutability and must not hold a borrow while calling into the dispatcher or
//! running reclaim callbacks, since those call straight back into the engine.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroU32;
use std::rc::{Rc, Weak};

/// Largest generation an engine may hand out. Keeps a packed
/// `(generation, index)` pair below 2^63 so the handle tag bit stays free.
pub const MAX_GENERATION: u32 = (1 << 31) - 1;

/// Number of opaque pointer slots on every class instance.
pub const INTERNAL_FIELD_COUNT: usize = 2;

macro_rules! slot_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            index: u32,
            generation: NonZeroU32,
        }

        impl $name {
            /// Returns `None` for generation 0 or a generation above [`MAX_GENERATION`].
            pub fn new(index: u32, generation: u32) -> Option<Self> {
                if generation > MAX_GENERATION {
                    return None;
                }
                NonZeroU32::new(generation).map(|generation| Self { index, generation })
            }

            /// First generation of slot `index`.
            pub fn first(index: u32) -> Self {
                Self { index, generation: NonZeroU32::MIN }
            }

            /// Same slot, next generation. `None` once generations run out.
            pub fn next_generation(self) -> Option<Self> {
                Self::new(self.index, self.generation.get().checked_add(1)?)
            }

            pub fn index(self) -> u32 {
                self.index
            }

            pub fn generation(self) -> u32 {
                self.generation.get()
            }

            /// Packs into a value that is never zero and always below 2^63.
            pub fn to_bits(self) -> u64 {
                ((self.generation.get() as u64) << 32) | self.index as u64
            }

            pub fn from_bits(bits: u64) -> Option<Self> {
                Self::new(bits as u32, (bits >> 32) as u32)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}v{})", stringify!($name), self.index, self.generation)
            }
        }
    };
}

slot_ref! {
    /// Reference to an engine object, rooted in the engine's current local scope.
    ObjRef
}

slot_ref! {
    /// Reference to an engine persistent slot. Survives scope pops.
    PersistentId
}

slot_ref! {
    /// Reference to a class template owned by the engine.
    TemplateId
}

/// Engine-side string storage: raw UTF-16 code units.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct EngineString(Rc<[u16]>);

impl EngineString {
    pub fn from_utf16(units: &[u16]) -> Self {
        EngineString(Rc::from(units))
    }

    pub fn units(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for EngineString {
    fn from(s: &str) -> Self {
        let units: Vec<u16> = s.encode_utf16().collect();
        EngineString(Rc::from(units))
    }
}

impl From<Vec<u16>> for EngineString {
    fn from(units: Vec<u16>) -> Self {
        EngineString(Rc::from(units))
    }
}

impl fmt::Debug for EngineString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

/// A value as the engine sees it.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum EngineValue {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Int(i32),
    Number(f64),
    String(EngineString),
    Symbol(u32),
    BigInt(i64),
    Object(ObjRef),
}

impl EngineValue {
    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            EngineValue::Object(obj) => Some(*obj),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, EngineValue::Undefined | EngineValue::Null)
    }

    pub fn string(s: &str) -> Self {
        EngineValue::String(EngineString::from(s))
    }
}

/// Broad classification of an engine object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Plain,
    Function,
    Array,
    TypedArray,
    ArrayBuffer,
    DataView,
    Promise,
    Resolver,
}

/// Element type of a typed array.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypedArrayKind {
    Int8 = 0,
    Uint8 = 1,
    Uint8Clamped = 2,
    Int16 = 3,
    Uint16 = 4,
    Int32 = 5,
    Uint32 = 6,
    BigInt64 = 7,
    BigUint64 = 8,
    Float32 = 9,
    Float64 = 10,
}

/// Boundary code for "not a typed array".
pub const NOT_TYPED_ARRAY: i32 = -1;

impl TypedArrayKind {
    pub const ALL: [TypedArrayKind; 11] = [
        TypedArrayKind::Int8,
        TypedArrayKind::Uint8,
        TypedArrayKind::Uint8Clamped,
        TypedArrayKind::Int16,
        TypedArrayKind::Uint16,
        TypedArrayKind::Int32,
        TypedArrayKind::Uint32,
        TypedArrayKind::BigInt64,
        TypedArrayKind::BigUint64,
        TypedArrayKind::Float32,
        TypedArrayKind::Float64,
    ];

    pub fn from_i32(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| *kind as i32 == code)
    }

    pub fn element_size(self) -> usize {
        match self {
            TypedArrayKind::Int8 | TypedArrayKind::Uint8 | TypedArrayKind::Uint8Clamped => 1,
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => 2,
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 | TypedArrayKind::Float32 => 4,
            TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 | TypedArrayKind::Float64 => 8,
        }
    }
}

/// Layout of a typed array view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypedArrayInfo {
    pub kind: TypedArrayKind,
    pub buffer: ObjRef,
    pub byte_offset: usize,
    pub length: usize,
}

/// Byte range of a data view over a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataViewInfo {
    pub buffer: ObjRef,
    pub byte_offset: usize,
    pub byte_length: usize,
}

/// Promise state
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PromiseState {
    Pending = 0,
    Fulfilled = 1,
    Rejected = 2,
}

/// Boundary code for "not a promise".
pub const PROMISE_NO_STATE: i32 = -1;

/// Opaque integer threaded through the engine's callback-data slot.
///
/// The engine stores and returns it verbatim. It never carries a native
/// address: the boundary decodes it into a table kind and an index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CallbackData(pub u64);

/// What the engine is asking a native callback to do.
#[derive(Clone, Debug, PartialEq)]
pub enum InvocationKind {
    Call,
    Construct,
    Get,
    Set(EngineValue),
}

/// One native dispatch request.
#[derive(Debug)]
pub struct Invocation<'a> {
    pub kind: InvocationKind,
    /// Receiver. For `Construct` this is the freshly allocated instance.
    pub this: EngineValue,
    pub args: &'a [EngineValue],
}

/// Outcome of a native dispatch: a return value or a value to throw.
pub type Completion = Result<EngineValue, EngineValue>;

/// Receives every native function, constructor and accessor call.
pub trait NativeDispatcher {
    fn dispatch(&self, data: CallbackData, invocation: Invocation<'_>) -> Completion;
}

/// Location details attached to a script-level throw.
#[derive(Clone, Debug, PartialEq)]
pub struct ThrowMessage {
    pub resource_name: String,
    pub line: i32,
    pub start: i32,
    pub end: i32,
    pub source_line: Option<String>,
}

/// A script-level throw as observed from outside the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineThrow {
    pub value: EngineValue,
    /// `String(value)` as the engine would print it.
    pub text: String,
    pub message: Option<ThrowMessage>,
    pub stack: Option<String>,
}

/// Engine-internal view handed to a reclaim callback: the collected object's
/// internal fields, read before the object is freed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReclaimInfo {
    pub internal_fields: [*mut c_void; INTERNAL_FIELD_COUNT],
}

pub type ReclaimCallback = Box<dyn FnOnce(ReclaimInfo)>;

/// Called once when an external array buffer's backing store is released.
pub type ExternalRelease = Box<dyn FnOnce(*mut c_void, usize)>;

/// Shape of a class template.
#[derive(Clone, Debug, Default)]
pub struct TemplateDesc {
    pub class_name: Option<String>,
    /// Constructor callback. `None` yields an object-only template.
    pub constructor: Option<CallbackData>,
    pub parent: Option<TemplateId>,
    pub internal_field_count: usize,
}

/// Per-context storage slot for embedder state.
#[derive(Default)]
pub struct EmbedderSlot(RefCell<Option<Rc<dyn Any>>>);

impl EmbedderSlot {
    pub fn get(&self) -> Option<Rc<dyn Any>> {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: Rc<dyn Any>) {
        *self.0.borrow_mut() = Some(value);
    }

    pub fn take(&self) -> Option<Rc<dyn Any>> {
        self.0.borrow_mut().take()
    }
}

/// The script engine as seen from the boundary.
pub trait Engine {
    // Scopes
    fn push_scope(&self);
    fn pop_scope(&self);

    // Dispatch wiring
    fn set_dispatcher(&self, dispatcher: Weak<dyn NativeDispatcher>);
    fn embedder_slot(&self) -> &EmbedderSlot;

    // Introspection
    fn global(&self) -> ObjRef;
    fn is_alive(&self, obj: ObjRef) -> bool;
    fn object_kind(&self, obj: ObjRef) -> Option<ObjectKind>;
    fn display_string(&self, value: &EngineValue) -> String;

    // Persistent handles
    fn new_persistent(&self, obj: ObjRef) -> Option<PersistentId>;
    /// Resolves a persistent slot into the current local scope.
    fn persistent_target(&self, id: PersistentId) -> Option<ObjRef>;
    /// Stops the slot from keeping its target alive. `callback` runs at most
    /// once, after the target is found unreachable.
    fn set_weak(&self, id: PersistentId, callback: Option<ReclaimCallback>) -> bool;
    fn dispose_persistent(&self, id: PersistentId) -> bool;

    // Scripts
    fn execute_script(
        &self,
        source: &EngineString,
        resource_name: &str,
        start_line: i32,
    ) -> Result<EngineValue, EngineThrow>;

    // Objects
    fn new_object(&self) -> ObjRef;
    fn get(&self, obj: ObjRef, key: &EngineValue) -> Result<EngineValue, EngineThrow>;
    fn set(&self, obj: ObjRef, key: &EngineValue, value: EngineValue) -> Result<(), EngineThrow>;
    fn own_property_names(&self, obj: ObjRef) -> Option<Vec<EngineValue>>;
    fn internal_field(&self, obj: ObjRef, index: usize) -> Option<*mut c_void>;
    fn set_internal_field(&self, obj: ObjRef, index: usize, value: *mut c_void) -> bool;
    fn new_error(&self, message: &str) -> EngineValue;

    // Arrays
    fn new_array(&self, length: usize) -> ObjRef;
    fn array_length(&self, obj: ObjRef) -> Option<usize>;

    // Functions
    fn new_function(&self, data: CallbackData, name: Option<&str>) -> ObjRef;
    fn call(
        &self,
        func: ObjRef,
        this: EngineValue,
        args: &[EngineValue],
    ) -> Result<EngineValue, EngineThrow>;
    fn construct(&self, func: ObjRef, args: &[EngineValue]) -> Result<ObjRef, EngineThrow>;

    // Templates
    fn new_template(&self, desc: TemplateDesc) -> Option<TemplateId>;
    fn template_add_accessor(
        &self,
        template: TemplateId,
        name: &str,
        getter: Option<CallbackData>,
        setter: Option<CallbackData>,
    ) -> bool;
    fn template_add_method(&self, template: TemplateId, name: &str, data: CallbackData) -> bool;
    fn template_is_constructible(&self, template: TemplateId) -> bool;
    fn template_function(&self, template: TemplateId) -> Option<ObjRef>;
    fn template_new_instance(&self, template: TemplateId) -> Option<ObjRef>;
    fn discard_template(&self, template: TemplateId);

    // Array buffers and views
    fn new_array_buffer(&self, byte_length: usize) -> Option<ObjRef>;
    fn new_external_array_buffer(
        &self,
        data: *mut c_void,
        byte_length: usize,
        release: Option<ExternalRelease>,
    ) -> Option<ObjRef>;
    /// Backing store address and byte length.
    fn array_buffer_contents(&self, obj: ObjRef) -> Option<(*mut u8, usize)>;
    fn new_typed_array(
        &self,
        kind: TypedArrayKind,
        buffer: ObjRef,
        byte_offset: usize,
        length: usize,
    ) -> Option<ObjRef>;
    fn typed_array_info(&self, obj: ObjRef) -> Option<TypedArrayInfo>;
    fn new_data_view(&self, buffer: ObjRef, byte_offset: usize, byte_length: usize) -> Option<ObjRef>;
    fn data_view_info(&self, obj: ObjRef) -> Option<DataViewInfo>;

    // Promises
    fn new_resolver(&self) -> ObjRef;
    fn resolver_promise(&self, resolver: ObjRef) -> Option<ObjRef>;
    fn resolve(&self, resolver: ObjRef, value: EngineValue) -> bool;
    fn reject(&self, resolver: ObjRef, value: EngineValue) -> bool;
    fn promise_then(
        &self,
        promise: ObjRef,
        on_fulfilled: Option<ObjRef>,
        on_rejected: Option<ObjRef>,
    ) -> Option<ObjRef>;
    fn promise_state(&self, promise: ObjRef) -> Option<PromiseState>;
    fn promise_result(&self, promise: ObjRef) -> Option<EngineValue>;
    fn promise_has_handler(&self, promise: ObjRef) -> bool;
    fn run_microtasks(&self);

    // Escape hatches
    fn dispatch_command(&self, command: i32, data: *mut c_void) -> *mut c_void;
    fn collect_garbage(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_ref_bits() {
        let obj = ObjRef::new(7, 3).unwrap();
        assert_eq!(obj.index(), 7);
        assert_eq!(obj.generation(), 3);
        assert_eq!(ObjRef::from_bits(obj.to_bits()), Some(obj));
        assert_ne!(obj.to_bits(), 0);
    }

    #[test]
    fn test_slot_ref_rejects_bad_generation() {
        assert!(ObjRef::new(0, 0).is_none());
        assert!(ObjRef::new(0, MAX_GENERATION + 1).is_none());
        let top = PersistentId::new(u32::MAX, MAX_GENERATION).unwrap();
        assert!(top.to_bits() < (1u64 << 63));
    }

    #[test]
    fn test_typed_array_kind_codes() {
        for kind in TypedArrayKind::ALL {
            assert_eq!(TypedArrayKind::from_i32(kind as i32), Some(kind));
        }
        assert_eq!(TypedArrayKind::from_i32(NOT_TYPED_ARRAY), None);
        assert_eq!(TypedArrayKind::BigUint64.element_size(), 8);
        assert_eq!(TypedArrayKind::Uint8Clamped.element_size(), 1);
    }

    #[test]
    fn test_engine_string_units() {
        let s = EngineString::from("héllo");
        assert_eq!(s.len(), 5);
        assert_eq!(s.to_string_lossy(), "héllo");
        let raw = EngineString::from_utf16(&[0xD800]);
        assert_eq!(raw.units(), &[0xD800]);
    }
}
