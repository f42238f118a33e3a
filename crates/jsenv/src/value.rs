//! Tagged values exchanged across the boundary
//!
//! Every argument, return value, property value and global crosses the
//! boundary as a [`TaggedValue`]. Object-bearing variants all carry an
//! [`ObjectHandle`] and differ only in their discriminant.

use crate::engine::{Engine, EngineString, EngineValue, ObjectKind};
use crate::error::ConversionError;
use crate::handle::ObjectHandle;

/// Strings read out of the engine are transcoded to UTF-8. Without this flag
/// they are returned as raw UTF-16 code units.
pub const FLAG_USE_UTF8: u32 = 1;

/// Discriminant codes as they appear on the wire.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null = 0,
    Boolean = 1,
    Int = 2,
    UInt = 3,
    Float = 4,
    Utf8String = 5,
    Utf16String = 6,
    Object = 7,
    Function = 8,
    Array = 9,
    TypedArray = 10,
    ArrayBuffer = 11,
    DataView = 12,
    Promise = 13,
    Resolver = 14,
}

impl ValueType {
    pub fn from_i32(code: i32) -> Option<Self> {
        use ValueType::*;
        Some(match code {
            0 => Null,
            1 => Boolean,
            2 => Int,
            3 => UInt,
            4 => Float,
            5 => Utf8String,
            6 => Utf16String,
            7 => Object,
            8 => Function,
            9 => Array,
            10 => TypedArray,
            11 => ArrayBuffer,
            12 => DataView,
            13 => Promise,
            14 => Resolver,
            _ => return None,
        })
    }

    pub fn is_object(self) -> bool {
        self as i32 >= ValueType::Object as i32
    }
}

/// A boundary value.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum TaggedValue {
    #[default]
    Null,
    Boolean(bool),
    Int(i32),
    UInt(u32),
    Float(f64),
    Utf8(String),
    Utf16(Vec<u16>),
    Object(ObjectHandle),
    Function(ObjectHandle),
    Array(ObjectHandle),
    TypedArray(ObjectHandle),
    ArrayBuffer(ObjectHandle),
    DataView(ObjectHandle),
    Promise(ObjectHandle),
    Resolver(ObjectHandle),
}

impl TaggedValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TaggedValue::Null => ValueType::Null,
            TaggedValue::Boolean(_) => ValueType::Boolean,
            TaggedValue::Int(_) => ValueType::Int,
            TaggedValue::UInt(_) => ValueType::UInt,
            TaggedValue::Float(_) => ValueType::Float,
            TaggedValue::Utf8(_) => ValueType::Utf8String,
            TaggedValue::Utf16(_) => ValueType::Utf16String,
            TaggedValue::Object(_) => ValueType::Object,
            TaggedValue::Function(_) => ValueType::Function,
            TaggedValue::Array(_) => ValueType::Array,
            TaggedValue::TypedArray(_) => ValueType::TypedArray,
            TaggedValue::ArrayBuffer(_) => ValueType::ArrayBuffer,
            TaggedValue::DataView(_) => ValueType::DataView,
            TaggedValue::Promise(_) => ValueType::Promise,
            TaggedValue::Resolver(_) => ValueType::Resolver,
        }
    }

    /// Builds an object-bearing value. Returns `None` for primitive types.
    pub fn from_handle(value_type: ValueType, handle: ObjectHandle) -> Option<Self> {
        Some(match value_type {
            ValueType::Object => TaggedValue::Object(handle),
            ValueType::Function => TaggedValue::Function(handle),
            ValueType::Array => TaggedValue::Array(handle),
            ValueType::TypedArray => TaggedValue::TypedArray(handle),
            ValueType::ArrayBuffer => TaggedValue::ArrayBuffer(handle),
            ValueType::DataView => TaggedValue::DataView(handle),
            ValueType::Promise => TaggedValue::Promise(handle),
            ValueType::Resolver => TaggedValue::Resolver(handle),
            _ => return None,
        })
    }

    /// The handle of any object-bearing variant.
    pub fn object(&self) -> Option<ObjectHandle> {
        match self {
            TaggedValue::Object(h)
            | TaggedValue::Function(h)
            | TaggedValue::Array(h)
            | TaggedValue::TypedArray(h)
            | TaggedValue::ArrayBuffer(h)
            | TaggedValue::DataView(h)
            | TaggedValue::Promise(h)
            | TaggedValue::Resolver(h) => Some(*h),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TaggedValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TaggedValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TaggedValue::Int(i) => Some(*i as f64),
            TaggedValue::UInt(u) => Some(*u as f64),
            TaggedValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            TaggedValue::Int(i) => Some(*i),
            TaggedValue::UInt(u) => i32::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Text of either string variant. UTF-16 payloads are decoded lossily.
    pub fn to_string_lossy(&self) -> Option<String> {
        match self {
            TaggedValue::Utf8(s) => Some(s.clone()),
            TaggedValue::Utf16(units) => Some(String::from_utf16_lossy(units)),
            _ => None,
        }
    }

    /// Converts an engine value. Symbols and BigInts have no boundary
    /// representation and fail.
    pub fn from_engine(
        engine: &dyn Engine,
        value: &EngineValue,
        flags: u32,
    ) -> Result<TaggedValue, ConversionError> {
        Ok(match value {
            EngineValue::Undefined | EngineValue::Null => TaggedValue::Null,
            EngineValue::Boolean(b) => TaggedValue::Boolean(*b),
            EngineValue::Int(i) => TaggedValue::Int(*i),
            EngineValue::Number(n) => number_value(*n),
            EngineValue::String(s) => {
                if flags & FLAG_USE_UTF8 != 0 {
                    TaggedValue::Utf8(s.to_string_lossy())
                } else {
                    TaggedValue::Utf16(s.units().to_vec())
                }
            }
            EngineValue::Symbol(_) => return Err(ConversionError::Unsupported("symbol")),
            EngineValue::BigInt(_) => return Err(ConversionError::Unsupported("bigint")),
            EngineValue::Object(obj) => {
                let kind = engine.object_kind(*obj).ok_or(ConversionError::EmptyHandle)?;
                let handle = ObjectHandle::encode_transient(*obj);
                match kind {
                    ObjectKind::Plain => TaggedValue::Object(handle),
                    ObjectKind::Function => TaggedValue::Function(handle),
                    ObjectKind::Array => TaggedValue::Array(handle),
                    ObjectKind::TypedArray => TaggedValue::TypedArray(handle),
                    ObjectKind::ArrayBuffer => TaggedValue::ArrayBuffer(handle),
                    ObjectKind::DataView => TaggedValue::DataView(handle),
                    ObjectKind::Promise => TaggedValue::Promise(handle),
                    ObjectKind::Resolver => TaggedValue::Resolver(handle),
                }
            }
        })
    }

    pub fn to_engine(&self, engine: &dyn Engine) -> Result<EngineValue, ConversionError> {
        Ok(match self {
            TaggedValue::Null => EngineValue::Null,
            TaggedValue::Boolean(b) => EngineValue::Boolean(*b),
            TaggedValue::Int(i) => EngineValue::Int(*i),
            TaggedValue::UInt(u) => match i32::try_from(*u) {
                Ok(i) => EngineValue::Int(i),
                Err(_) => EngineValue::Number(*u as f64),
            },
            TaggedValue::Float(f) => EngineValue::Number(*f),
            TaggedValue::Utf8(s) => EngineValue::String(EngineString::from(s.as_str())),
            TaggedValue::Utf16(units) => EngineValue::String(EngineString::from_utf16(units)),
            other => {
                let handle = other.object().ok_or(ConversionError::EmptyHandle)?;
                let obj = handle.resolve(engine).ok_or(ConversionError::EmptyHandle)?;
                EngineValue::Object(obj)
            }
        })
    }
}

/// Int when the number is exactly a signed 32-bit integer, Float otherwise.
fn number_value(n: f64) -> TaggedValue {
    let is_negative_zero = n == 0.0 && n.is_sign_negative();
    if n.fract() == 0.0 && n >= i32::MIN as f64 && n <= i32::MAX as f64 && !is_negative_zero {
        TaggedValue::Int(n as i32)
    } else {
        TaggedValue::Float(n)
    }
}

impl From<bool> for TaggedValue {
    fn from(b: bool) -> Self {
        TaggedValue::Boolean(b)
    }
}

impl From<i32> for TaggedValue {
    fn from(i: i32) -> Self {
        TaggedValue::Int(i)
    }
}

impl From<u32> for TaggedValue {
    fn from(u: u32) -> Self {
        TaggedValue::UInt(u)
    }
}

impl From<f64> for TaggedValue {
    fn from(f: f64) -> Self {
        TaggedValue::Float(f)
    }
}

impl From<&str> for TaggedValue {
    fn from(s: &str) -> Self {
        TaggedValue::Utf8(s.to_string())
    }
}

impl From<String> for TaggedValue {
    fn from(s: String) -> Self {
        TaggedValue::Utf8(s)
    }
}

impl From<Vec<u16>> for TaggedValue {
    fn from(units: Vec<u16>) -> Self {
        TaggedValue::Utf16(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_split() {
        assert_eq!(number_value(3.0), TaggedValue::Int(3));
        assert_eq!(number_value(-2147483648.0), TaggedValue::Int(i32::MIN));
        assert_eq!(number_value(2147483648.0), TaggedValue::Float(2147483648.0));
        assert_eq!(number_value(0.5), TaggedValue::Float(0.5));
        assert!(matches!(number_value(-0.0), TaggedValue::Float(f) if f.is_sign_negative()));
        assert!(matches!(number_value(f64::NAN), TaggedValue::Float(f) if f.is_nan()));
        assert_eq!(number_value(f64::INFINITY), TaggedValue::Float(f64::INFINITY));
    }

    #[test]
    fn test_value_type_codes() {
        for code in 0..15 {
            let ty = ValueType::from_i32(code).unwrap();
            assert_eq!(ty as i32, code);
        }
        assert_eq!(ValueType::from_i32(15), None);
        assert!(ValueType::Promise.is_object());
        assert!(!ValueType::Utf16String.is_object());
    }

    #[test]
    fn test_object_variants_share_payload() {
        let handle = ObjectHandle::encode_transient(crate::engine::ObjRef::new(1, 1).unwrap());
        let array = TaggedValue::from_handle(ValueType::Array, handle).unwrap();
        assert_eq!(array.value_type(), ValueType::Array);
        assert_eq!(array.object(), Some(handle));
        assert!(TaggedValue::from_handle(ValueType::Int, handle).is_none());
        assert_eq!(TaggedValue::Int(1).object(), None);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(TaggedValue::UInt(7).as_i32(), Some(7));
        assert_eq!(TaggedValue::UInt(u32::MAX).as_i32(), None);
        assert_eq!(TaggedValue::from("hi").to_string_lossy().as_deref(), Some("hi"));
        let units: Vec<u16> = "hi".encode_utf16().collect();
        assert_eq!(TaggedValue::from(units).to_string_lossy().as_deref(), Some("hi"));
        assert!(TaggedValue::default().is_null());
    }
}
