//! Weak references with reclaim notification
//!
//! The engine decides when a weak target is unreachable; this module only
//! translates the engine's reclaim view ([`ReclaimInfo`]) into the stable
//! shape native callbacks see ([`WeakCallbackInfo`]). Liveness is not tracked
//! here.

use crate::engine::{Engine, ReclaimInfo, INTERNAL_FIELD_COUNT};
use crate::handle::ObjectHandle;
use std::ffi::c_void;

/// What a weak callback receives: the payload registered with the weak
/// reference and a snapshot of the collected object's private-data slots.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeakCallbackInfo {
    pub user_data: *mut c_void,
    pub internal_fields: [*mut c_void; INTERNAL_FIELD_COUNT],
}

impl WeakCallbackInfo {
    pub fn internal_field(&self, index: usize) -> *mut c_void {
        self.internal_fields
            .get(index)
            .copied()
            .unwrap_or(std::ptr::null_mut())
    }
}

/// Invoked at most once, after the target has been found unreachable.
pub type WeakCallback = Box<dyn FnOnce(WeakCallbackInfo)>;

/// Downgrades a persistent handle to a weak one.
///
/// The handle keeps its identity: it resolves while the target is alive and
/// decodes to nothing once the target has been reclaimed. Transient handles
/// have no slot to downgrade and are rejected.
pub fn make_weak(
    engine: &dyn Engine,
    handle: ObjectHandle,
    callback: Option<WeakCallback>,
    user_data: *mut c_void,
) -> Option<ObjectHandle> {
    let ObjectHandle::Persistent(id) = handle else {
        log::warn!("make_weak called on transient handle; ignoring");
        return None;
    };

    let adapter = callback.map(|callback| -> Box<dyn FnOnce(ReclaimInfo)> {
        Box::new(move |reclaim: ReclaimInfo| {
            callback(WeakCallbackInfo {
                user_data,
                internal_fields: reclaim.internal_fields,
            })
        })
    });

    if engine.set_weak(id, adapter) {
        Some(handle)
    } else {
        log::debug!("make_weak on stale persistent handle {:?}", id);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_field_bounds() {
        let mut marker = 0u8;
        let info = WeakCallbackInfo {
            user_data: std::ptr::null_mut(),
            internal_fields: [&mut marker as *mut u8 as *mut c_void, std::ptr::null_mut()],
        };
        assert!(!info.internal_field(0).is_null());
        assert!(info.internal_field(1).is_null());
        assert!(info.internal_field(2).is_null());
    }
}
