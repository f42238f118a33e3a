//! Generational slot arena with local scopes and persistent handles
//!
//! Objects live in slots addressed by `(index, generation)`. Freeing a slot
//! bumps its generation, so a stale [`ObjRef`] never resolves to whatever is
//! allocated there next. A slot whose generations run out is retired.
//!
//! Roots are the global object, every object recorded in an open local
//! scope, strong persistent slots, template functions and prototypes, and
//! queued microtask jobs. Weak persistent slots do not keep their target
//! alive; when it is found unreachable the slot is freed and its reclaim
//! callback is handed back to the caller to run.

use crate::object::{HeapObject, PendingRelease};
use crate::promise::Job;
use jsenv::config::HeapConfig;
use jsenv::engine::{
    CallbackData, EngineValue, ObjRef, PersistentId, ReclaimCallback, ReclaimInfo, TemplateId,
    INTERNAL_FIELD_COUNT,
};
use std::collections::VecDeque;
use std::ffi::c_void;

struct ObjectSlot {
    current: ObjRef,
    object: Option<HeapObject>,
}

struct PersistentSlot {
    current: PersistentId,
    entry: Option<PersistentEntry>,
}

struct PersistentEntry {
    target: ObjRef,
    weak: bool,
    callback: Option<ReclaimCallback>,
}

pub struct Template {
    pub class_name: Option<String>,
    pub constructor: Option<CallbackData>,
    pub parent: Option<TemplateId>,
    pub internal_field_count: usize,
    pub accessors: Vec<(String, Option<CallbackData>, Option<CallbackData>)>,
    pub methods: Vec<(String, CallbackData)>,
    /// Set once the template has been instantiated. Members can no longer
    /// be added after that.
    pub function: Option<ObjRef>,
    pub prototype: Option<ObjRef>,
}

struct TemplateSlot {
    current: TemplateId,
    template: Option<Template>,
}

/// Work left over from a collection, to run with no heap borrow held.
#[derive(Default)]
pub struct Reclaimed {
    pub callbacks: Vec<(ReclaimCallback, ReclaimInfo)>,
    pub releases: Vec<PendingRelease>,
    pub freed: usize,
}

pub struct Heap {
    objects: Vec<ObjectSlot>,
    free_objects: Vec<u32>,
    persistents: Vec<PersistentSlot>,
    free_persistents: Vec<u32>,
    templates: Vec<TemplateSlot>,
    scopes: Vec<Vec<ObjRef>>,
    /// Pushes refused by the depth limit, matched by the next pops.
    overflow_scopes: usize,
    pub microtasks: VecDeque<Job>,
    pub global: Option<ObjRef>,
    allocations: usize,
    config: HeapConfig,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Self {
        Heap {
            objects: Vec::new(),
            free_objects: Vec::new(),
            persistents: Vec::new(),
            free_persistents: Vec::new(),
            templates: Vec::new(),
            scopes: vec![Vec::new()],
            overflow_scopes: 0,
            microtasks: VecDeque::new(),
            global: None,
            allocations: 0,
            config,
        }
    }

    // ---- objects ----

    /// Allocates `object` and roots it in the innermost scope.
    pub fn alloc(&mut self, object: HeapObject) -> ObjRef {
        self.allocations += 1;
        let obj = match self.free_objects.pop() {
            Some(index) => {
                let slot = &mut self.objects[index as usize];
                slot.object = Some(object);
                slot.current
            }
            None => {
                let obj = ObjRef::first(self.objects.len() as u32);
                self.objects.push(ObjectSlot {
                    current: obj,
                    object: Some(object),
                });
                obj
            }
        };
        self.root_local(obj);
        obj
    }

    pub fn root_local(&mut self, obj: ObjRef) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(obj);
        }
    }

    pub fn get(&self, obj: ObjRef) -> Option<&HeapObject> {
        let slot = self.objects.get(obj.index() as usize)?;
        if slot.current != obj {
            return None;
        }
        slot.object.as_ref()
    }

    pub fn get_mut(&mut self, obj: ObjRef) -> Option<&mut HeapObject> {
        let slot = self.objects.get_mut(obj.index() as usize)?;
        if slot.current != obj {
            return None;
        }
        slot.object.as_mut()
    }

    pub fn is_alive(&self, obj: ObjRef) -> bool {
        self.get(obj).is_some()
    }

    pub fn live_objects(&self) -> usize {
        self.objects.iter().filter(|s| s.object.is_some()).count()
    }

    // ---- scopes ----

    pub fn push_scope(&mut self) {
        if self.scopes.len() > self.config.max_scope_depth {
            log::warn!("scope depth limit {} reached", self.config.max_scope_depth);
            self.overflow_scopes += 1;
            return;
        }
        self.scopes.push(Vec::new());
    }

    /// Returns whether an automatic collection is due.
    pub fn pop_scope(&mut self) -> bool {
        if self.overflow_scopes > 0 {
            self.overflow_scopes -= 1;
            return false;
        }
        if self.scopes.len() <= 1 {
            log::debug!("pop_scope on the base scope ignored");
            return false;
        }
        self.scopes.pop();
        self.config.gc_threshold > 0 && self.allocations >= self.config.gc_threshold
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len() - 1
    }

    pub fn max_array_length(&self) -> usize {
        self.config.max_array_length
    }

    // ---- persistents ----

    pub fn new_persistent(&mut self, target: ObjRef) -> Option<PersistentId> {
        if !self.is_alive(target) {
            return None;
        }
        let entry = PersistentEntry {
            target,
            weak: false,
            callback: None,
        };
        let id = match self.free_persistents.pop() {
            Some(index) => {
                let slot = &mut self.persistents[index as usize];
                slot.entry = Some(entry);
                slot.current
            }
            None => {
                let id = PersistentId::first(self.persistents.len() as u32);
                self.persistents.push(PersistentSlot {
                    current: id,
                    entry: Some(entry),
                });
                id
            }
        };
        Some(id)
    }

    fn persistent(&mut self, id: PersistentId) -> Option<&mut PersistentEntry> {
        let slot = self.persistents.get_mut(id.index() as usize)?;
        if slot.current != id {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Resolves `id`, rooting the target in the innermost pushed scope.
    /// The base scope is never popped, so a resolution there roots nothing
    /// and a weak target stays collectable.
    pub fn persistent_target(&mut self, id: PersistentId) -> Option<ObjRef> {
        let target = self.persistent(id)?.target;
        if !self.is_alive(target) {
            return None;
        }
        if self.scopes.len() > 1 {
            self.root_local(target);
        }
        Some(target)
    }

    pub fn set_weak(&mut self, id: PersistentId, callback: Option<ReclaimCallback>) -> bool {
        match self.persistent(id) {
            Some(entry) => {
                entry.weak = true;
                entry.callback = callback;
                true
            }
            None => false,
        }
    }

    /// Frees the slot. A pending reclaim callback is dropped unrun.
    pub fn dispose_persistent(&mut self, id: PersistentId) -> bool {
        let index = id.index();
        let Some(slot) = self.persistents.get_mut(index as usize) else {
            return false;
        };
        if slot.current != id || slot.entry.is_none() {
            return false;
        }
        slot.entry = None;
        if let Some(next) = slot.current.next_generation() {
            slot.current = next;
            self.free_persistents.push(index);
        }
        true
    }

    // ---- templates ----

    pub fn new_template(&mut self, template: Template) -> TemplateId {
        let id = TemplateId::first(self.templates.len() as u32);
        self.templates.push(TemplateSlot {
            current: id,
            template: Some(template),
        });
        id
    }

    pub fn template(&self, id: TemplateId) -> Option<&Template> {
        let slot = self.templates.get(id.index() as usize)?;
        if slot.current != id {
            return None;
        }
        slot.template.as_ref()
    }

    pub fn template_mut(&mut self, id: TemplateId) -> Option<&mut Template> {
        let slot = self.templates.get_mut(id.index() as usize)?;
        if slot.current != id {
            return None;
        }
        slot.template.as_mut()
    }

    pub fn discard_template(&mut self, id: TemplateId) {
        if let Some(slot) = self.templates.get_mut(id.index() as usize) {
            if slot.current == id {
                slot.template = None;
                if let Some(next) = slot.current.next_generation() {
                    slot.current = next;
                }
            }
        }
    }

    // ---- collection ----

    /// Mark and sweep. Callbacks and external releases are returned rather
    /// than run so the caller can drop its borrow first.
    pub fn collect(&mut self) -> Reclaimed {
        let mut marked = vec![false; self.objects.len()];
        let mut stack: Vec<ObjRef> = Vec::new();

        stack.extend(self.global);
        for scope in &self.scopes {
            stack.extend(scope.iter().copied());
        }
        for slot in &self.persistents {
            if let Some(entry) = &slot.entry {
                if !entry.weak {
                    stack.push(entry.target);
                }
            }
        }
        for slot in &self.templates {
            if let Some(template) = &slot.template {
                stack.extend(template.function);
                stack.extend(template.prototype);
            }
        }
        for job in &self.microtasks {
            job.trace(&mut |value: &EngineValue| {
                if let EngineValue::Object(obj) = value {
                    stack.push(*obj);
                }
            });
        }

        while let Some(obj) = stack.pop() {
            let index = obj.index() as usize;
            if marked.get(index).copied().unwrap_or(true) {
                continue;
            }
            let Some(object) = self.get(obj) else {
                continue;
            };
            marked[index] = true;
            object.trace(|child| stack.push(child));
        }

        let mut reclaimed = Reclaimed::default();

        // Weak slots whose target died: snapshot the target's fields, then free.
        for (index, slot) in self.persistents.iter_mut().enumerate() {
            let dead = match &slot.entry {
                Some(entry) if entry.weak => {
                    let target = entry.target.index() as usize;
                    !marked.get(target).copied().unwrap_or(false)
                }
                _ => false,
            };
            if !dead {
                continue;
            }
            let Some(entry) = slot.entry.take() else {
                continue;
            };
            if let Some(next) = slot.current.next_generation() {
                slot.current = next;
                self.free_persistents.push(index as u32);
            }
            if let Some(callback) = entry.callback {
                let fields = self
                    .objects
                    .get(entry.target.index() as usize)
                    .filter(|target| target.current == entry.target)
                    .and_then(|target| target.object.as_ref())
                    .and_then(|object| object.internal_fields)
                    .unwrap_or([std::ptr::null_mut::<c_void>(); INTERNAL_FIELD_COUNT]);
                reclaimed.callbacks.push((callback, ReclaimInfo { internal_fields: fields }));
            }
        }

        for (index, slot) in self.objects.iter_mut().enumerate() {
            if marked[index] || slot.object.is_none() {
                continue;
            }
            if let Some(mut object) = slot.object.take() {
                if let crate::object::Body::ArrayBuffer(backing) = &mut object.body {
                    reclaimed.releases.extend(backing.take_release());
                }
            }
            reclaimed.freed += 1;
            match slot.current.next_generation() {
                Some(next) => {
                    slot.current = next;
                    self.free_objects.push(index as u32);
                }
                None => log::debug!("retiring object slot {}", index),
            }
        }

        self.allocations = 0;
        log::debug!(
            "collected {} objects, {} reclaim callbacks pending",
            reclaimed.freed,
            reclaimed.callbacks.len()
        );
        reclaimed
    }

    /// External releases of every live buffer, for engine shutdown.
    pub fn drain_releases(&mut self) -> Vec<PendingRelease> {
        self.objects
            .iter_mut()
            .filter_map(|slot| slot.object.as_mut())
            .filter_map(|object| match &mut object.body {
                crate::object::Body::ArrayBuffer(backing) => backing.take_release(),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Body;

    fn heap() -> Heap {
        Heap::new(HeapConfig::default())
    }

    #[test]
    fn test_scope_pop_makes_objects_collectable() {
        let mut heap = heap();
        heap.push_scope();
        let obj = heap.alloc(HeapObject::new(Body::Plain));
        heap.pop_scope();
        let reclaimed = heap.collect();
        assert_eq!(reclaimed.freed, 1);
        assert!(!heap.is_alive(obj));

        let reused = heap.alloc(HeapObject::new(Body::Plain));
        assert_eq!(reused.index(), obj.index());
        assert_ne!(reused, obj);
    }

    #[test]
    fn test_weak_persistent_is_freed_with_target() {
        let mut heap = heap();
        heap.push_scope();
        let obj = heap.alloc(HeapObject::new(Body::Plain));
        let id = heap.new_persistent(obj).unwrap();
        heap.pop_scope();

        heap.collect();
        assert!(heap.is_alive(obj), "strong slot keeps target");

        assert!(heap.set_weak(id, Some(Box::new(|_: ReclaimInfo| {}))));
        let reclaimed = heap.collect();
        assert_eq!(reclaimed.callbacks.len(), 1);
        assert!(heap.persistent_target(id).is_none());
        assert!(!heap.dispose_persistent(id));
    }

    #[test]
    fn test_base_scope_resolution_does_not_root() {
        let mut heap = heap();
        heap.push_scope();
        let obj = heap.alloc(HeapObject::new(Body::Plain));
        let id = heap.new_persistent(obj).unwrap();
        heap.set_weak(id, None);
        heap.pop_scope();

        assert_eq!(heap.persistent_target(id), Some(obj));
        assert_eq!(heap.persistent_target(id), Some(obj));
        let reclaimed = heap.collect();
        assert_eq!(reclaimed.freed, 1);
        assert!(heap.persistent_target(id).is_none());
    }

    #[test]
    fn test_scoped_resolution_roots_until_pop() {
        let mut heap = heap();
        heap.push_scope();
        let obj = heap.alloc(HeapObject::new(Body::Plain));
        let id = heap.new_persistent(obj).unwrap();
        heap.set_weak(id, None);
        heap.pop_scope();

        heap.push_scope();
        assert_eq!(heap.persistent_target(id), Some(obj));
        heap.collect();
        assert!(heap.is_alive(obj));
        heap.pop_scope();
        heap.collect();
        assert!(!heap.is_alive(obj));
    }

    #[test]
    fn test_scope_limit_balances() {
        let mut heap = Heap::new(HeapConfig {
            max_scope_depth: 1,
            ..HeapConfig::default()
        });
        heap.push_scope();
        heap.push_scope();
        assert_eq!(heap.scope_depth(), 1);
        heap.pop_scope();
        assert_eq!(heap.scope_depth(), 1);
        heap.pop_scope();
        assert_eq!(heap.scope_depth(), 0);
    }
}
