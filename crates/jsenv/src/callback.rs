//! Index-addressed native callback tables
//!
//! Native closures never reach the engine. Each registration is appended to a
//! table and the engine stores only a [`CallbackData`] integer naming the
//! table and the slot. Slots are never removed or reused, so a stale
//! `CallbackData` can only ever resolve to the closure it was minted for.

use crate::engine::CallbackData;
use crate::env::Environment;
use crate::handle::ObjectHandle;
use crate::value::TaggedValue;
use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;

/// A native function or method. Receives the environment, the receiver (if
/// it is an object) and the converted arguments. `None` means "no result";
/// the call then evaluates to `undefined` unless the exception slot is set.
pub type NativeFunction =
    Rc<dyn Fn(&Environment, Option<ObjectHandle>, &[TaggedValue]) -> Option<TaggedValue>>;

/// Property read. `None` means "no result".
pub type PropertyGetter = Rc<dyn Fn(&Environment, ObjectHandle) -> Option<TaggedValue>>;

/// Property write. Returns whether the value was accepted.
pub type PropertySetter = Rc<dyn Fn(&Environment, ObjectHandle, &TaggedValue) -> bool>;

/// Runs once per collected class instance with its two private-data slots.
/// Never receives a live object, so it cannot re-enter the engine.
pub type Finalizer = Rc<dyn Fn(*mut c_void, *mut c_void)>;

/// A free function registration.
pub struct FunctionEntry {
    pub function: NativeFunction,
    pub flags: u32,
    /// Owner object passed as the receiver of a domain callback.
    pub owner: Option<ObjectHandle>,
}

/// A class member registration.
pub enum MemberEntry {
    Constructor {
        function: NativeFunction,
        flags: u32,
        finalizer: Option<Finalizer>,
    },
    Method(FunctionEntry),
    Property {
        name: String,
        getter: Option<PropertyGetter>,
        setter: Option<PropertySetter>,
        flags: u32,
    },
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Domain = 1,
    Function = 2,
    Member = 3,
}

impl TableKind {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(TableKind::Domain),
            2 => Some(TableKind::Function),
            3 => Some(TableKind::Member),
            _ => None,
        }
    }
}

pub fn encode(kind: TableKind, index: u32) -> CallbackData {
    CallbackData(((kind as u64) << 32) | index as u64)
}

pub fn decode(data: CallbackData) -> Option<(TableKind, u32)> {
    if data.0 >> 40 != 0 {
        return None;
    }
    TableKind::from_u8((data.0 >> 32) as u8).map(|kind| (kind, data.0 as u32))
}

/// Append-only table of registrations.
pub struct CallbackTable<T> {
    entries: RefCell<Vec<Rc<T>>>,
}

impl<T> Default for CallbackTable<T> {
    fn default() -> Self {
        CallbackTable {
            entries: RefCell::new(Vec::new()),
        }
    }
}

impl<T> CallbackTable<T> {
    pub fn push(&self, entry: T) -> u32 {
        let mut entries = self.entries.borrow_mut();
        let index = entries.len() as u32;
        entries.push(Rc::new(entry));
        index
    }

    /// Clones the entry out so no borrow is held while it runs.
    pub fn get(&self, index: u32) -> Option<Rc<T>> {
        self.entries.borrow().get(index as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A resolved registration.
pub enum Callback {
    Domain(Rc<FunctionEntry>),
    Function(Rc<FunctionEntry>),
    Member(Rc<MemberEntry>),
}

/// The environment's callback tables.
#[derive(Default)]
pub struct CallbackTables {
    pub domain: CallbackTable<FunctionEntry>,
    pub functions: CallbackTable<FunctionEntry>,
    pub members: CallbackTable<MemberEntry>,
}

impl CallbackTables {
    pub fn register_domain(&self, entry: FunctionEntry) -> CallbackData {
        encode(TableKind::Domain, self.domain.push(entry))
    }

    pub fn register_function(&self, entry: FunctionEntry) -> CallbackData {
        encode(TableKind::Function, self.functions.push(entry))
    }

    pub fn register_member(&self, entry: MemberEntry) -> CallbackData {
        encode(TableKind::Member, self.members.push(entry))
    }

    pub fn lookup(&self, data: CallbackData) -> Option<Callback> {
        let (kind, index) = decode(data)?;
        match kind {
            TableKind::Domain => self.domain.get(index).map(Callback::Domain),
            TableKind::Function => self.functions.get(index).map(Callback::Function),
            TableKind::Member => self.members.get(index).map(Callback::Member),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> FunctionEntry {
        FunctionEntry {
            function: Rc::new(|_, _, _| None),
            flags: 0,
            owner: None,
        }
    }

    #[test]
    fn test_encode_decode() {
        let data = encode(TableKind::Member, 41);
        assert_eq!(decode(data), Some((TableKind::Member, 41)));
        assert_eq!(decode(CallbackData(0)), None);
        assert_eq!(decode(CallbackData(u64::MAX)), None);
    }

    #[test]
    fn test_indices_are_never_reused() {
        let tables = CallbackTables::default();
        let a = tables.register_function(entry());
        let b = tables.register_function(entry());
        let c = tables.register_domain(entry());
        assert_ne!(a, b);
        assert_eq!(decode(a), Some((TableKind::Function, 0)));
        assert_eq!(decode(b), Some((TableKind::Function, 1)));
        assert_eq!(decode(c), Some((TableKind::Domain, 0)));
        assert_eq!(tables.functions.len(), 2);
    }

    #[test]
    fn test_lookup_routes_by_kind() {
        let tables = CallbackTables::default();
        let f = tables.register_function(entry());
        assert!(matches!(tables.lookup(f), Some(Callback::Function(_))));
        assert!(tables.lookup(encode(TableKind::Domain, 0)).is_none());
        assert!(tables.lookup(encode(TableKind::Function, 9)).is_none());
    }
}
