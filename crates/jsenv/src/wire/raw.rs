//! Fixed-layout value for the C ABI
//!
//! A [`RawValue`] is the C-visible form of a [`TaggedValue`]: a discriminant,
//! an ownership flag, an explicit length and a payload union. String payloads
//! are never read by NUL scanning; `length` counts bytes (UTF-8) or code units
//! (UTF-16). Buffers created by the boundary carry a trailing NUL for C
//! convenience that is not counted in `length`.
//!
//! When `owns_buffer` is set, the string buffer was allocated by the boundary
//! and is freed when the value is dropped or passed to `jsenv_value_release`.
//! Values built by C code must leave `owns_buffer` clear.

use crate::error::ConversionError;
use crate::handle::{ObjectHandle, RawHandle};
use crate::value::{TaggedValue, ValueType};
use std::ffi::c_char;
use std::ptr;

#[repr(C)]
#[derive(Clone, Copy)]
pub union RawPayload {
    pub boolean: u8,
    pub int: i32,
    pub uint: u32,
    pub float: f64,
    pub utf8: *const c_char,
    pub utf16: *const u16,
    pub handle: RawHandle,
}

#[repr(C)]
pub struct RawValue {
    pub value_type: i32,
    pub owns_buffer: u8,
    pub length: usize,
    pub payload: RawPayload,
}

impl RawValue {
    pub fn null() -> Self {
        RawValue {
            value_type: ValueType::Null as i32,
            owns_buffer: 0,
            length: 0,
            payload: RawPayload { handle: 0 },
        }
    }

    fn with(value_type: ValueType, payload: RawPayload) -> Self {
        RawValue {
            value_type: value_type as i32,
            owns_buffer: 0,
            length: 0,
            payload,
        }
    }

    /// Copies `value` into an owning raw value. Handles that have no raw
    /// form become null.
    pub fn from_tagged(value: &TaggedValue) -> Self {
        match value {
            TaggedValue::Null => Self::null(),
            TaggedValue::Boolean(b) => Self::with(ValueType::Boolean, RawPayload { boolean: *b as u8 }),
            TaggedValue::Int(i) => Self::with(ValueType::Int, RawPayload { int: *i }),
            TaggedValue::UInt(u) => Self::with(ValueType::UInt, RawPayload { uint: *u }),
            TaggedValue::Float(f) => Self::with(ValueType::Float, RawPayload { float: *f }),
            TaggedValue::Utf8(s) => {
                let mut bytes = Vec::with_capacity(s.len() + 1);
                bytes.extend_from_slice(s.as_bytes());
                bytes.push(0);
                let buffer = Box::into_raw(bytes.into_boxed_slice()) as *const c_char;
                RawValue {
                    value_type: ValueType::Utf8String as i32,
                    owns_buffer: 1,
                    length: s.len(),
                    payload: RawPayload { utf8: buffer },
                }
            }
            TaggedValue::Utf16(units) => {
                let mut owned = Vec::with_capacity(units.len() + 1);
                owned.extend_from_slice(units);
                owned.push(0);
                let buffer = Box::into_raw(owned.into_boxed_slice()) as *const u16;
                RawValue {
                    value_type: ValueType::Utf16String as i32,
                    owns_buffer: 1,
                    length: units.len(),
                    payload: RawPayload { utf16: buffer },
                }
            }
            other => match other.object().and_then(|h| h.to_raw()) {
                Some(raw) => Self::with(other.value_type(), RawPayload { handle: raw }),
                None => Self::null(),
            },
        }
    }

    /// Reads the value without taking ownership of its buffer.
    ///
    /// # Safety
    /// String payloads must point at `length` readable elements.
    pub unsafe fn to_tagged(&self) -> Result<TaggedValue, ConversionError> {
        let value_type =
            ValueType::from_i32(self.value_type).ok_or(ConversionError::UnknownValueType(self.value_type))?;
        Ok(match value_type {
            ValueType::Null => TaggedValue::Null,
            ValueType::Boolean => TaggedValue::Boolean(self.payload.boolean != 0),
            ValueType::Int => TaggedValue::Int(self.payload.int),
            ValueType::UInt => TaggedValue::UInt(self.payload.uint),
            ValueType::Float => TaggedValue::Float(self.payload.float),
            ValueType::Utf8String => {
                let bytes = raw_slice(self.payload.utf8 as *const u8, self.length);
                let s = std::str::from_utf8(bytes).map_err(|_| ConversionError::InvalidUtf8)?;
                TaggedValue::Utf8(s.to_string())
            }
            ValueType::Utf16String => {
                TaggedValue::Utf16(raw_slice(self.payload.utf16, self.length).to_vec())
            }
            object_type => {
                let handle =
                    ObjectHandle::from_raw(self.payload.handle).ok_or(ConversionError::EmptyHandle)?;
                TaggedValue::from_handle(object_type, handle).ok_or(ConversionError::EmptyHandle)?
            }
        })
    }

    /// Frees an owned buffer and resets to null.
    pub fn release(&mut self) {
        if self.owns_buffer != 0 {
            // SAFETY: owned buffers are only ever created by `from_tagged`,
            // as boxed slices of `length + 1` elements.
            unsafe {
                match ValueType::from_i32(self.value_type) {
                    Some(ValueType::Utf8String) => {
                        let slice = ptr::slice_from_raw_parts_mut(self.payload.utf8 as *mut u8, self.length + 1);
                        drop(Box::from_raw(slice));
                    }
                    Some(ValueType::Utf16String) => {
                        let slice = ptr::slice_from_raw_parts_mut(self.payload.utf16 as *mut u16, self.length + 1);
                        drop(Box::from_raw(slice));
                    }
                    _ => {}
                }
            }
        }
        // Field by field: assigning a whole value would run `Drop` on the old one.
        self.value_type = ValueType::Null as i32;
        self.owns_buffer = 0;
        self.length = 0;
        self.payload = RawPayload { handle: 0 };
    }
}

impl Default for RawValue {
    fn default() -> Self {
        Self::null()
    }
}

impl Drop for RawValue {
    fn drop(&mut self) {
        if self.owns_buffer != 0 {
            self.release();
        }
    }
}

unsafe fn raw_slice<'a, T>(data: *const T, length: usize) -> &'a [T] {
    if data.is_null() || length == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(data, length)
    }
}

/// Frees the buffer of a value handed out by the boundary.
///
/// # Safety
/// `value` must be null or point at a value produced by the boundary.
#[no_mangle]
pub unsafe extern "C" fn jsenv_value_release(value: *mut RawValue) {
    if let Some(value) = value.as_mut() {
        value.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ObjRef, PersistentId};

    #[test]
    fn test_owned_utf8_has_trailing_nul() {
        let raw = RawValue::from_tagged(&TaggedValue::from("abc"));
        assert_eq!(raw.value_type, ValueType::Utf8String as i32);
        assert_eq!(raw.owns_buffer, 1);
        assert_eq!(raw.length, 3);
        let with_nul = unsafe { std::slice::from_raw_parts(raw.payload.utf8 as *const u8, 4) };
        assert_eq!(with_nul, b"abc\0");
        assert_eq!(unsafe { raw.to_tagged() }, Ok(TaggedValue::from("abc")));
    }

    #[test]
    fn test_embedded_nul_survives() {
        let value = TaggedValue::Utf8("a\0b".to_string());
        let raw = RawValue::from_tagged(&value);
        assert_eq!(raw.length, 3);
        assert_eq!(unsafe { raw.to_tagged() }, Ok(value));
    }

    #[test]
    fn test_borrowed_string_is_not_freed() {
        let text = b"hello";
        let mut raw = RawValue {
            value_type: ValueType::Utf8String as i32,
            owns_buffer: 0,
            length: 5,
            payload: RawPayload { utf8: text.as_ptr() as *const c_char },
        };
        assert_eq!(unsafe { raw.to_tagged() }, Ok(TaggedValue::from("hello")));
        raw.release();
        assert_eq!(raw.value_type, ValueType::Null as i32);
    }

    #[test]
    fn test_handles_keep_tag() {
        let persistent = ObjectHandle::Persistent(PersistentId::new(3, 1).unwrap());
        let raw = RawValue::from_tagged(&TaggedValue::Promise(persistent));
        assert_eq!(raw.value_type, ValueType::Promise as i32);
        assert_eq!(unsafe { raw.payload.handle } & 1, 1);
        assert_eq!(unsafe { raw.to_tagged() }, Ok(TaggedValue::Promise(persistent)));

        let transient = ObjectHandle::Transient(ObjRef::new(3, 1).unwrap());
        let raw = RawValue::from_tagged(&TaggedValue::Array(transient));
        assert_eq!(unsafe { raw.to_tagged() }, Ok(TaggedValue::Array(transient)));
    }

    #[test]
    fn test_rejects_unknown_and_empty() {
        let mut raw = RawValue::null();
        raw.value_type = 99;
        assert_eq!(unsafe { raw.to_tagged() }, Err(ConversionError::UnknownValueType(99)));

        let raw = RawValue {
            value_type: ValueType::Object as i32,
            owns_buffer: 0,
            length: 0,
            payload: RawPayload { handle: 1 },
        };
        assert_eq!(unsafe { raw.to_tagged() }, Err(ConversionError::EmptyHandle));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut raw = RawValue::from_tagged(&TaggedValue::Utf16(vec![0x41, 0x42]));
        unsafe { jsenv_value_release(&mut raw) };
        unsafe { jsenv_value_release(&mut raw) };
        assert_eq!(raw.owns_buffer, 0);
    }
}
