//! Heap object layout

use crate::promise::PromiseData;
use jsenv::engine::{
    CallbackData, DataViewInfo, EngineString, EngineValue, ExternalRelease, ObjRef, TemplateId,
    TypedArrayInfo, TypedArrayKind, INTERNAL_FIELD_COUNT,
};
use std::ffi::c_void;

/// Normalized property key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Index(u32),
    Name(String),
}

impl Key {
    /// Canonical array index strings become `Index`.
    pub fn from_name(name: &str) -> Key {
        match name.parse::<u32>() {
            Ok(index) if index != u32::MAX && index.to_string() == name => Key::Index(index),
            _ => Key::Name(name.to_string()),
        }
    }

    pub fn to_engine(&self) -> EngineValue {
        match self {
            Key::Index(index) => EngineValue::string(&index.to_string()),
            Key::Name(name) => EngineValue::string(name),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        matches!(self, Key::Name(n) if n == name)
    }
}

#[derive(Clone, Debug)]
pub enum Slot {
    Data(EngineValue),
    Accessor {
        getter: Option<CallbackData>,
        setter: Option<CallbackData>,
    },
}

#[derive(Clone, Debug)]
pub struct Property {
    pub key: Key,
    pub slot: Slot,
    pub enumerable: bool,
}

/// Backing store of an array buffer.
pub enum Backing {
    Owned(Box<[u8]>),
    External {
        data: *mut c_void,
        length: usize,
        release: Option<ExternalRelease>,
    },
}

impl Backing {
    pub fn contents(&mut self) -> (*mut u8, usize) {
        match self {
            Backing::Owned(bytes) => (bytes.as_mut_ptr(), bytes.len()),
            Backing::External { data, length, .. } => (*data as *mut u8, *length),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Backing::Owned(bytes) => &bytes[..],
            Backing::External { data, length, .. } if !data.is_null() => {
                // SAFETY: the embedder guarantees `length` bytes at `data`
                // until the release hook runs.
                unsafe { std::slice::from_raw_parts(*data as *const u8, *length) }
            }
            Backing::External { .. } => &[],
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Backing::Owned(bytes) => &mut bytes[..],
            Backing::External { data, length, .. } if !data.is_null() => {
                // SAFETY: as for `bytes`.
                unsafe { std::slice::from_raw_parts_mut(*data as *mut u8, *length) }
            }
            Backing::External { .. } => &mut [],
        }
    }

    /// The release hook of an external store, if it still has one.
    pub fn take_release(&mut self) -> Option<PendingRelease> {
        match self {
            Backing::Owned(_) => None,
            Backing::External {
                data,
                length,
                release,
            } => release.take().map(|release| PendingRelease {
                release,
                data: *data,
                length: *length,
            }),
        }
    }
}

/// An external release hook detached from its buffer, to run once no heap
/// borrow is held.
pub struct PendingRelease {
    release: ExternalRelease,
    data: *mut c_void,
    length: usize,
}

impl PendingRelease {
    pub fn run(self) {
        (self.release)(self.data, self.length)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum FunctionBody {
    Native(CallbackData),
    Template(TemplateId),
}

pub enum Body {
    Plain,
    Error,
    Function(FunctionBody),
    Array(Vec<EngineValue>),
    ArrayBuffer(Backing),
    TypedArray(TypedArrayInfo),
    DataView(DataViewInfo),
    Promise(PromiseData),
    Resolver(ObjRef),
}

pub struct HeapObject {
    pub body: Body,
    pub properties: Vec<Property>,
    pub prototype: Option<ObjRef>,
    pub internal_fields: Option<[*mut c_void; INTERNAL_FIELD_COUNT]>,
}

impl HeapObject {
    pub fn new(body: Body) -> Self {
        HeapObject {
            body,
            properties: Vec::new(),
            prototype: None,
            internal_fields: None,
        }
    }

    pub fn own(&self, key: &Key) -> Option<&Property> {
        self.properties.iter().find(|p| &p.key == key)
    }

    pub fn own_data(&self, name: &str) -> Option<&EngineValue> {
        self.properties.iter().find_map(|p| match (&p.key, &p.slot) {
            (Key::Name(n), Slot::Data(value)) if n == name => Some(value),
            _ => None,
        })
    }

    /// Defines or overwrites an own data property.
    pub fn define(&mut self, key: Key, value: EngineValue, enumerable: bool) {
        match self.properties.iter_mut().find(|p| p.key == key) {
            Some(property) => property.slot = Slot::Data(value),
            None => self.properties.push(Property {
                key,
                slot: Slot::Data(value),
                enumerable,
            }),
        }
    }

    pub fn define_hidden(&mut self, name: &str, value: EngineValue) {
        self.define(Key::Name(name.to_string()), value, false);
    }

    /// Calls `f` on every object reference this object holds.
    pub fn trace(&self, mut f: impl FnMut(ObjRef)) {
        let mut value = |v: &EngineValue| {
            if let EngineValue::Object(obj) = v {
                f(*obj)
            }
        };
        for property in &self.properties {
            if let Slot::Data(v) = &property.slot {
                value(v);
            }
        }
        if let Some(proto) = self.prototype {
            value(&EngineValue::Object(proto));
        }
        match &self.body {
            Body::Array(elements) => elements.iter().for_each(&mut value),
            Body::TypedArray(info) => value(&EngineValue::Object(info.buffer)),
            Body::DataView(info) => value(&EngineValue::Object(info.buffer)),
            Body::Resolver(promise) => value(&EngineValue::Object(*promise)),
            Body::Promise(data) => data.trace(&mut value),
            Body::Plain | Body::Error | Body::Function(_) | Body::ArrayBuffer(_) => {}
        }
    }
}

/// Reads element `index` of a typed array view over `bytes`.
pub fn read_element(kind: TypedArrayKind, bytes: &[u8]) -> EngineValue {
    macro_rules! read {
        ($t:ty) => {{
            let mut raw = [0u8; std::mem::size_of::<$t>()];
            raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
            <$t>::from_ne_bytes(raw)
        }};
    }
    match kind {
        TypedArrayKind::Int8 => EngineValue::Int(read!(i8) as i32),
        TypedArrayKind::Uint8 | TypedArrayKind::Uint8Clamped => EngineValue::Int(read!(u8) as i32),
        TypedArrayKind::Int16 => EngineValue::Int(read!(i16) as i32),
        TypedArrayKind::Uint16 => EngineValue::Int(read!(u16) as i32),
        TypedArrayKind::Int32 => EngineValue::Int(read!(i32)),
        TypedArrayKind::Uint32 => {
            let v = read!(u32);
            i32::try_from(v).map_or(EngineValue::Number(v as f64), EngineValue::Int)
        }
        TypedArrayKind::BigInt64 => EngineValue::BigInt(read!(i64)),
        TypedArrayKind::BigUint64 => EngineValue::BigInt(read!(u64) as i64),
        TypedArrayKind::Float32 => EngineValue::Number(read!(f32) as f64),
        TypedArrayKind::Float64 => EngineValue::Number(read!(f64)),
    }
}

/// Writes `number` into one element, with the usual integer wrapping.
pub fn write_element(kind: TypedArrayKind, bytes: &mut [u8], number: f64) {
    let int = if number.is_finite() { number.trunc() } else { 0.0 };
    let wrapped = (int % 4294967296.0) as i64;
    match kind {
        TypedArrayKind::Int8 => bytes[..1].copy_from_slice(&(wrapped as i8).to_ne_bytes()),
        TypedArrayKind::Uint8 => bytes[..1].copy_from_slice(&(wrapped as u8).to_ne_bytes()),
        TypedArrayKind::Uint8Clamped => {
            let clamped = if number.is_nan() { 0.0 } else { number.clamp(0.0, 255.0).round() };
            bytes[0] = clamped as u8;
        }
        TypedArrayKind::Int16 => bytes[..2].copy_from_slice(&(wrapped as i16).to_ne_bytes()),
        TypedArrayKind::Uint16 => bytes[..2].copy_from_slice(&(wrapped as u16).to_ne_bytes()),
        TypedArrayKind::Int32 => bytes[..4].copy_from_slice(&(wrapped as i32).to_ne_bytes()),
        TypedArrayKind::Uint32 => bytes[..4].copy_from_slice(&(wrapped as u32).to_ne_bytes()),
        TypedArrayKind::BigInt64 | TypedArrayKind::BigUint64 => {
            bytes[..8].copy_from_slice(&(int as i64).to_ne_bytes())
        }
        TypedArrayKind::Float32 => bytes[..4].copy_from_slice(&(number as f32).to_ne_bytes()),
        TypedArrayKind::Float64 => bytes[..8].copy_from_slice(&number.to_ne_bytes()),
    }
}

/// JavaScript `Number::toString` for the values this engine produces.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else {
        format!("{}", n)
    }
}

/// `ToNumber` for primitive values. Objects are NaN.
pub fn to_number(value: &EngineValue) -> f64 {
    match value {
        EngineValue::Undefined => f64::NAN,
        EngineValue::Null => 0.0,
        EngineValue::Boolean(b) => *b as u8 as f64,
        EngineValue::Int(i) => *i as f64,
        EngineValue::Number(n) => *n,
        EngineValue::BigInt(n) => *n as f64,
        EngineValue::String(s) => string_to_number(s),
        EngineValue::Symbol(_) | EngineValue::Object(_) => f64::NAN,
    }
}

fn string_to_number(s: &EngineString) -> f64 {
    let text = s.to_string_lossy();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    trimmed.parse().unwrap_or(f64::NAN)
}
