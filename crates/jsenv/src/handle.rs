//! Object handles crossing the boundary
//!
//! A handle is either *transient* (borrowed from the engine's current local
//! scope, never released) or *persistent* (an engine persistent slot owned by
//! whoever holds the handle). In Rust the ownership mode is an enum variant.
//! The pointer-sized raw form used by the C ABI packs the slot reference into
//! the upper bits and keeps the mode in bit 0:
//!
//! ```text
//! raw = (generation << 33) | (index << 1) | persistent
//! ```
//!
//! Generations are non-zero, so a valid raw handle is never `0` or `1`.

use crate::engine::{Engine, ObjRef, PersistentId};
use once_cell::sync::Lazy;

/// Pointer-sized wire form of an [`ObjectHandle`].
pub type RawHandle = usize;

/// Ownership bit of a [`RawHandle`].
pub const PERSISTENT_TAG: RawHandle = 1;

/// An opaque reference to an engine-side object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectHandle {
    /// Valid only within the engine scope it was produced in.
    Transient(ObjRef),
    /// Independently owned. Released exactly once by its holder.
    Persistent(PersistentId),
}

static ENCODING_SOUND: Lazy<bool> = Lazy::new(|| {
    // Slot references pack into 63 bits; the raw form needs all of them.
    let wide_enough = usize::BITS >= 64;
    let top_fits = ObjRef::new(u32::MAX, crate::engine::MAX_GENERATION)
        .map(ObjectHandle::Transient)
        .and_then(|h| h.to_raw())
        .map(|raw| raw & PERSISTENT_TAG == 0)
        .unwrap_or(false);
    if !(wide_enough && top_fits) {
        log::error!("handle encoding requires a 64-bit pointer width");
    }
    wide_enough && top_fits
});

/// Checked once per process before the first environment is created.
pub fn assert_encoding_invariants() -> bool {
    *ENCODING_SOUND
}

impl ObjectHandle {
    pub fn encode_transient(obj: ObjRef) -> Self {
        ObjectHandle::Transient(obj)
    }

    /// Creates a persistent slot for `obj` and wraps it.
    pub fn encode_persistent(engine: &dyn Engine, obj: ObjRef) -> Option<Self> {
        engine.new_persistent(obj).map(ObjectHandle::Persistent)
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, ObjectHandle::Persistent(_))
    }

    /// Resolves to a live object, or `None` for a stale or released handle.
    pub fn decode(&self, engine: &dyn Engine) -> Option<(ObjRef, bool)> {
        match *self {
            ObjectHandle::Transient(obj) => engine.is_alive(obj).then_some((obj, false)),
            ObjectHandle::Persistent(id) => engine.persistent_target(id).map(|obj| (obj, true)),
        }
    }

    pub fn resolve(&self, engine: &dyn Engine) -> Option<ObjRef> {
        self.decode(engine).map(|(obj, _)| obj)
    }

    /// Disposes a persistent handle. Releasing it again is a no-op because the
    /// slot generation no longer matches.
    pub fn release(&self, engine: &dyn Engine) -> bool {
        match *self {
            ObjectHandle::Transient(obj) => {
                log::warn!("release called on transient handle {:?}; ignoring", obj);
                false
            }
            ObjectHandle::Persistent(id) => {
                let released = engine.dispose_persistent(id);
                if !released {
                    log::debug!("persistent handle {:?} already released", id);
                }
                released
            }
        }
    }

    pub fn to_raw(self) -> Option<RawHandle> {
        let (bits, tag) = match self {
            ObjectHandle::Transient(obj) => (obj.to_bits(), 0),
            ObjectHandle::Persistent(id) => (id.to_bits(), PERSISTENT_TAG),
        };
        RawHandle::try_from(bits << 1).ok().map(|raw| raw | tag)
    }

    /// Zero and tag-only values decode to `None`.
    pub fn from_raw(raw: RawHandle) -> Option<Self> {
        let bits = (raw >> 1) as u64;
        if bits == 0 {
            return None;
        }
        if raw & PERSISTENT_TAG != 0 {
            PersistentId::from_bits(bits).map(ObjectHandle::Persistent)
        } else {
            ObjRef::from_bits(bits).map(ObjectHandle::Transient)
        }
    }
}
