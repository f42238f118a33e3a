//! [`Engine`] implementation over the slot heap
//!
//! Every method borrows the heap only for as long as it reads or writes it.
//! Native dispatch, reclaim callbacks and external releases all run with no
//! borrow held, since they call straight back into the engine.

use crate::heap::{Heap, Template};
use crate::object::{
    format_number, read_element, to_number, write_element, Backing, Body, FunctionBody, HeapObject,
    Key, Property, Slot,
};
use crate::promise::{Job, PromiseData, Reaction};
use crate::script;
use jsenv::config::HeapConfig;
use jsenv::engine::{
    CallbackData, Completion, DataViewInfo, EmbedderSlot, Engine, EngineString, EngineThrow, EngineValue,
    ExternalRelease, Invocation, InvocationKind, NativeDispatcher, ObjRef, ObjectKind,
    PersistentId, PromiseState, ReclaimCallback, TemplateDesc, TemplateId, TypedArrayInfo,
    TypedArrayKind, INTERNAL_FIELD_COUNT,
};
use serde_json::Value;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Weak;

/// `dispatch_command` code that runs a full collection.
pub const COMMAND_COLLECT_GARBAGE: i32 = 1;

/// Longest prototype chain walked by a property lookup.
const MAX_PROTOTYPE_DEPTH: usize = 64;

/// Deepest array nesting rendered by `display_string`.
const MAX_DISPLAY_DEPTH: usize = 8;

enum Lookup {
    Value(EngineValue),
    Getter(CallbackData),
    Missing,
}

enum Store {
    Setter(CallbackData),
    ReadOnly,
    Define,
}

pub struct HeapEngine {
    heap: RefCell<Heap>,
    global: ObjRef,
    dispatcher: RefCell<Option<Weak<dyn NativeDispatcher>>>,
    slot: EmbedderSlot,
}

impl Default for HeapEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapEngine {
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Self {
        let mut heap = Heap::new(config);
        let global = heap.alloc(HeapObject::new(Body::Plain));
        heap.global = Some(global);
        HeapEngine {
            heap: RefCell::new(heap),
            global,
            dispatcher: RefCell::new(None),
            slot: EmbedderSlot::default(),
        }
    }

    pub fn live_objects(&self) -> usize {
        self.heap.borrow().live_objects()
    }

    pub fn scope_depth(&self) -> usize {
        self.heap.borrow().scope_depth()
    }

    pub fn pending_microtasks(&self) -> usize {
        self.heap.borrow().microtasks.len()
    }

    fn alloc(&self, object: HeapObject) -> ObjRef {
        self.heap.borrow_mut().alloc(object)
    }

    fn with_object<R>(&self, obj: ObjRef, f: impl FnOnce(&HeapObject) -> R) -> Option<R> {
        self.heap.borrow().get(obj).map(f)
    }

    fn with_object_mut<R>(&self, obj: ObjRef, f: impl FnOnce(&mut HeapObject) -> R) -> Option<R> {
        self.heap.borrow_mut().get_mut(obj).map(f)
    }

    // ---- errors ----

    fn make_error(&self, name: &str, message: &str) -> EngineValue {
        let mut object = HeapObject::new(Body::Error);
        object.define_hidden("name", EngineValue::string(name));
        object.define_hidden("message", EngineValue::string(message));
        let stack = if message.is_empty() {
            format!("{}\n    at <native>", name)
        } else {
            format!("{}: {}\n    at <native>", name, message)
        };
        object.define_hidden("stack", EngineValue::string(&stack));
        EngineValue::Object(self.alloc(object))
    }

    fn type_error(&self, message: &str) -> EngineThrow {
        let value = self.make_error("TypeError", message);
        self.throw_value(value)
    }

    fn range_error(&self, message: &str) -> EngineThrow {
        let value = self.make_error("RangeError", message);
        self.throw_value(value)
    }

    fn throw_value(&self, value: EngineValue) -> EngineThrow {
        let text = self.display_string(&value);
        let stack = value.as_object().and_then(|obj| {
            self.with_object(obj, |object| match object.own_data("stack") {
                Some(EngineValue::String(s)) => Some(s.to_string_lossy()),
                _ => None,
            })
            .flatten()
        });
        EngineThrow {
            value,
            text,
            message: None,
            stack,
        }
    }

    // ---- native dispatch ----

    fn dispatch(
        &self,
        data: CallbackData,
        kind: InvocationKind,
        this: EngineValue,
        args: &[EngineValue],
    ) -> Completion {
        let dispatcher = self.dispatcher.borrow().as_ref().and_then(Weak::upgrade);
        let Some(dispatcher) = dispatcher else {
            log::error!("native callback {:?} invoked with no dispatcher", data);
            return Err(self.new_error("no native dispatcher installed"));
        };

        // Temporaries made by the callback die with its scope. The popped
        // scope never triggers a collection while the caller is mid-operation.
        self.heap.borrow_mut().push_scope();
        let completion = dispatcher.dispatch(data, Invocation { kind, this, args });
        let mut heap = self.heap.borrow_mut();
        heap.pop_scope();
        if let Ok(EngineValue::Object(obj)) | Err(EngineValue::Object(obj)) = &completion {
            heap.root_local(*obj);
        }
        completion
    }

    fn function_body(&self, func: ObjRef) -> Result<FunctionBody, EngineThrow> {
        let body = self.with_object(func, |object| match &object.body {
            Body::Function(body) => Some(*body),
            _ => None,
        });
        match body {
            Some(Some(body)) => Ok(body),
            Some(None) => Err(self.type_error("object is not a function")),
            None => Err(self.type_error("function has been collected")),
        }
    }

    fn template_constructor(&self, template: TemplateId) -> Option<CallbackData> {
        self.heap
            .borrow()
            .template(template)
            .and_then(|t| t.constructor)
    }

    // ---- properties ----

    fn key_of(&self, key: &EngineValue) -> Key {
        match key {
            EngineValue::Int(i) if *i >= 0 => Key::Index(*i as u32),
            EngineValue::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n < u32::MAX as f64 => {
                Key::Index(*n as u32)
            }
            EngineValue::String(s) => Key::from_name(&s.to_string_lossy()),
            other => Key::from_name(&self.display_string(other)),
        }
    }

    fn lookup(heap: &Heap, obj: ObjRef, key: &Key) -> Lookup {
        let mut current = Some(obj);
        let mut depth = 0;
        while let Some(next) = current {
            let Some(object) = heap.get(next) else {
                break;
            };
            if let Some(value) = Self::exotic_get(heap, object, key) {
                return Lookup::Value(value);
            }
            if let Some(property) = object.own(key) {
                return match &property.slot {
                    Slot::Data(value) => Lookup::Value(value.clone()),
                    Slot::Accessor {
                        getter: Some(getter),
                        ..
                    } => Lookup::Getter(*getter),
                    Slot::Accessor { getter: None, .. } => Lookup::Value(EngineValue::Undefined),
                };
            }
            depth += 1;
            if depth > MAX_PROTOTYPE_DEPTH {
                break;
            }
            current = object.prototype;
        }
        Lookup::Missing
    }

    /// Element and length reads of arrays, views and buffers.
    fn exotic_get(heap: &Heap, object: &HeapObject, key: &Key) -> Option<EngineValue> {
        match (&object.body, key) {
            (Body::Array(elements), Key::Index(index)) => elements.get(*index as usize).cloned(),
            (Body::Array(elements), key) if key.is("length") => Some(length_value(elements.len())),
            (Body::TypedArray(info), Key::Index(index)) => {
                let index = *index as usize;
                if index >= info.length {
                    return Some(EngineValue::Undefined);
                }
                let size = info.kind.element_size();
                let start = info.byte_offset + index * size;
                match &heap.get(info.buffer)?.body {
                    Body::ArrayBuffer(backing) => {
                        let bytes = backing.bytes().get(start..start + size)?;
                        Some(read_element(info.kind, bytes))
                    }
                    _ => None,
                }
            }
            (Body::TypedArray(info), key) if key.is("length") => Some(length_value(info.length)),
            (Body::ArrayBuffer(backing), key) if key.is("byteLength") => {
                Some(length_value(backing.bytes().len()))
            }
            (Body::DataView(info), key) if key.is("byteLength") => Some(length_value(info.byte_length)),
            (Body::DataView(info), key) if key.is("byteOffset") => Some(length_value(info.byte_offset)),
            _ => None,
        }
    }

    fn store_plan(heap: &Heap, obj: ObjRef, key: &Key) -> Store {
        let mut current = Some(obj);
        let mut depth = 0;
        while let Some(next) = current {
            let Some(object) = heap.get(next) else {
                break;
            };
            match object.own(key).map(|p| &p.slot) {
                Some(Slot::Accessor {
                    setter: Some(setter),
                    ..
                }) => return Store::Setter(*setter),
                Some(Slot::Accessor { setter: None, .. }) => return Store::ReadOnly,
                Some(Slot::Data(_)) => return Store::Define,
                None => {}
            }
            depth += 1;
            if depth > MAX_PROTOTYPE_DEPTH {
                break;
            }
            current = object.prototype;
        }
        Store::Define
    }

    fn define_own(&self, obj: ObjRef, key: Key, value: EngineValue) -> Result<(), EngineThrow> {
        let stored = Self::store_own(&mut self.heap.borrow_mut(), obj, key, value);
        if stored {
            Ok(())
        } else {
            Err(self.range_error("Invalid array length"))
        }
    }

    /// Writes an own property. Returns false when an array would grow past
    /// the configured length limit, or its length is set to a non-length.
    fn store_own(heap: &mut Heap, obj: ObjRef, key: Key, value: EngineValue) -> bool {
        let limit = heap.max_array_length();
        let Some(object) = heap.get_mut(obj) else {
            return true;
        };
        let view = match &mut object.body {
            Body::Array(elements) => match &key {
                Key::Index(index) => {
                    let index = *index as usize;
                    if index >= limit {
                        return false;
                    }
                    if index >= elements.len() {
                        elements.resize(index + 1, EngineValue::Undefined);
                    }
                    elements[index] = value;
                    return true;
                }
                name if name.is("length") => {
                    let length = to_number(&value);
                    if !(length >= 0.0 && length.fract() == 0.0 && length <= limit as f64) {
                        return false;
                    }
                    elements.resize(length as usize, EngineValue::Undefined);
                    return true;
                }
                Key::Name(_) => None,
            },
            Body::TypedArray(info) => match &key {
                Key::Index(index) => Some((*info, *index as usize)),
                Key::Name(_) => None,
            },
            _ => None,
        };

        let Some((info, index)) = view else {
            object.define(key, value, true);
            return true;
        };
        if index >= info.length {
            return true;
        }
        let size = info.kind.element_size();
        let start = info.byte_offset + index * size;
        let number = match &value {
            EngineValue::BigInt(n) => *n as f64,
            other => to_number(other),
        };
        if let Some(Body::ArrayBuffer(backing)) = heap.get_mut(info.buffer).map(|b| &mut b.body) {
            if let Some(bytes) = backing.bytes_mut().get_mut(start..start + size) {
                write_element(info.kind, bytes, number);
            }
        }
        true
    }

    // ---- templates ----

    /// Builds the constructor function and prototype of `template`, and of
    /// its ancestors, on first use.
    fn instantiate(&self, template: TemplateId) -> Option<(ObjRef, ObjRef)> {
        let (parent, existing) = {
            let heap = self.heap.borrow();
            let t = heap.template(template)?;
            (t.parent, t.function.zip(t.prototype))
        };
        if let Some(pair) = existing {
            return Some(pair);
        }
        let parent_prototype = match parent {
            Some(parent) => Some(self.instantiate(parent)?.1),
            None => None,
        };

        let mut heap = self.heap.borrow_mut();
        let t = heap.template(template)?;
        let class_name = t.class_name.clone().unwrap_or_default();
        let accessors = t.accessors.clone();
        let methods = t.methods.clone();

        let mut prototype = HeapObject::new(Body::Plain);
        prototype.prototype = parent_prototype;
        for (name, getter, setter) in accessors {
            prototype.properties.push(Property {
                key: Key::from_name(&name),
                slot: Slot::Accessor { getter, setter },
                enumerable: false,
            });
        }
        for (name, data) in methods {
            let mut method = HeapObject::new(Body::Function(FunctionBody::Native(data)));
            method.define_hidden("name", EngineValue::string(&name));
            let method = heap.alloc(method);
            prototype.define(Key::from_name(&name), EngineValue::Object(method), false);
        }
        let prototype = heap.alloc(prototype);

        let mut function = HeapObject::new(Body::Function(FunctionBody::Template(template)));
        function.define_hidden("name", EngineValue::string(&class_name));
        function.define_hidden("prototype", EngineValue::Object(prototype));
        let function = heap.alloc(function);
        heap.get_mut(prototype)?
            .define_hidden("constructor", EngineValue::Object(function));

        let t = heap.template_mut(template)?;
        t.function = Some(function);
        t.prototype = Some(prototype);
        Some((function, prototype))
    }

    // ---- promises ----

    fn enqueue(&self, jobs: impl IntoIterator<Item = Job>) {
        self.heap.borrow_mut().microtasks.extend(jobs);
    }

    fn settle(&self, promise: ObjRef, state: PromiseState, value: EngineValue) {
        let jobs = self
            .with_object_mut(promise, |object| match &mut object.body {
                Body::Promise(data) => data.settle(state, value),
                _ => None,
            })
            .flatten();
        if state == PromiseState::Rejected {
            log::debug!("promise {:?} rejected", promise);
        }
        if let Some(jobs) = jobs {
            self.enqueue(jobs);
        }
    }

    /// Fulfills `promise`, or makes it follow `value` when that is a promise.
    fn resolve_promise(&self, promise: ObjRef, value: EngineValue) {
        if let EngineValue::Object(inner) = &value {
            if *inner == promise {
                let error = self.make_error("TypeError", "promise resolved with itself");
                self.settle(promise, PromiseState::Rejected, error);
                return;
            }
            let adopted = self
                .with_object_mut(*inner, |object| match &mut object.body {
                    Body::Promise(data) => Some(data.react(
                        Reaction {
                            on_fulfilled: None,
                            on_rejected: None,
                            derived: promise,
                        },
                        true,
                    )),
                    _ => None,
                })
                .flatten();
            if let Some(job) = adopted {
                self.enqueue(job);
                return;
            }
        }
        self.settle(promise, PromiseState::Fulfilled, value);
    }

    /// Locks the resolver's promise for a host-driven settlement.
    fn lock_resolver(&self, resolver: ObjRef) -> Option<ObjRef> {
        let promise = self.resolver_promise(resolver)?;
        let locked = self.with_object_mut(promise, |object| match &mut object.body {
            Body::Promise(data) if !data.locked && data.state == PromiseState::Pending => {
                data.locked = true;
                true
            }
            _ => false,
        })?;
        locked.then_some(promise)
    }

    fn run_job(&self, job: Job) {
        let Job {
            reaction,
            state,
            value,
        } = job;
        match reaction.handler(state) {
            Some(handler) => match self.call(handler, EngineValue::Undefined, &[value]) {
                Ok(result) => self.resolve_promise(reaction.derived, result),
                Err(throw) => self.settle(reaction.derived, PromiseState::Rejected, throw.value),
            },
            None if state == PromiseState::Fulfilled => self.resolve_promise(reaction.derived, value),
            None => self.settle(reaction.derived, state, value),
        }
    }

    // ---- scripts ----

    fn from_json(&self, value: &Value) -> EngineValue {
        match value {
            Value::Null => EngineValue::Null,
            Value::Bool(b) => EngineValue::Boolean(*b),
            Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Some(i) => EngineValue::Int(i),
                None => EngineValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => EngineValue::string(s),
            Value::Array(items) => {
                let elements = items.iter().map(|item| self.from_json(item)).collect();
                EngineValue::Object(self.alloc(HeapObject::new(Body::Array(elements))))
            }
            Value::Object(map) => {
                let mut object = HeapObject::new(Body::Plain);
                for (key, item) in map {
                    object.define(Key::from_name(key), self.from_json(item), true);
                }
                EngineValue::Object(self.alloc(object))
            }
        }
    }

    fn display_object(&self, obj: ObjRef, depth: usize) -> String {
        enum Shape {
            Error(String, String),
            Array(Vec<EngineValue>),
            Function(String),
            Promise,
            Other,
        }
        let shape = self.with_object(obj, |object| match &object.body {
            Body::Error => {
                let field = |name: &str| match object.own_data(name) {
                    Some(EngineValue::String(s)) => s.to_string_lossy(),
                    _ => String::new(),
                };
                Shape::Error(field("name"), field("message"))
            }
            Body::Array(elements) => Shape::Array(elements.clone()),
            Body::Function(_) => Shape::Function(match object.own_data("name") {
                Some(EngineValue::String(s)) => s.to_string_lossy(),
                _ => String::new(),
            }),
            Body::Promise(_) => Shape::Promise,
            _ => Shape::Other,
        });
        match shape {
            Some(Shape::Error(name, message)) if message.is_empty() => name,
            Some(Shape::Error(name, message)) => format!("{}: {}", name, message),
            Some(Shape::Array(elements)) if depth < MAX_DISPLAY_DEPTH => elements
                .iter()
                .map(|element| match element {
                    EngineValue::Undefined | EngineValue::Null => String::new(),
                    EngineValue::Object(inner) => self.display_object(*inner, depth + 1),
                    other => self.display_string(other),
                })
                .collect::<Vec<_>>()
                .join(","),
            Some(Shape::Array(_)) => String::new(),
            Some(Shape::Function(name)) => format!("function {}() {{ [native code] }}", name),
            Some(Shape::Promise) => "[object Promise]".to_string(),
            Some(Shape::Other) | None => "[object Object]".to_string(),
        }
    }
}

fn length_value(length: usize) -> EngineValue {
    i32::try_from(length).map_or(EngineValue::Number(length as f64), EngineValue::Int)
}

impl Engine for HeapEngine {
    fn push_scope(&self) {
        self.heap.borrow_mut().push_scope();
    }

    fn pop_scope(&self) {
        let collect = self.heap.borrow_mut().pop_scope();
        if collect {
            self.collect_garbage();
        }
    }

    fn set_dispatcher(&self, dispatcher: Weak<dyn NativeDispatcher>) {
        *self.dispatcher.borrow_mut() = Some(dispatcher);
    }

    fn embedder_slot(&self) -> &EmbedderSlot {
        &self.slot
    }

    fn global(&self) -> ObjRef {
        self.global
    }

    fn is_alive(&self, obj: ObjRef) -> bool {
        self.heap.borrow().is_alive(obj)
    }

    fn object_kind(&self, obj: ObjRef) -> Option<ObjectKind> {
        self.with_object(obj, |object| match &object.body {
            Body::Plain | Body::Error => ObjectKind::Plain,
            Body::Function(_) => ObjectKind::Function,
            Body::Array(_) => ObjectKind::Array,
            Body::ArrayBuffer(_) => ObjectKind::ArrayBuffer,
            Body::TypedArray(_) => ObjectKind::TypedArray,
            Body::DataView(_) => ObjectKind::DataView,
            Body::Promise(_) => ObjectKind::Promise,
            Body::Resolver(_) => ObjectKind::Resolver,
        })
    }

    fn display_string(&self, value: &EngineValue) -> String {
        match value {
            EngineValue::Undefined => "undefined".to_string(),
            EngineValue::Null => "null".to_string(),
            EngineValue::Boolean(b) => b.to_string(),
            EngineValue::Int(i) => i.to_string(),
            EngineValue::Number(n) => format_number(*n),
            EngineValue::String(s) => s.to_string_lossy(),
            EngineValue::Symbol(_) => "Symbol()".to_string(),
            EngineValue::BigInt(n) => n.to_string(),
            EngineValue::Object(obj) => self.display_object(*obj, 0),
        }
    }

    fn new_persistent(&self, obj: ObjRef) -> Option<PersistentId> {
        self.heap.borrow_mut().new_persistent(obj)
    }

    fn persistent_target(&self, id: PersistentId) -> Option<ObjRef> {
        self.heap.borrow_mut().persistent_target(id)
    }

    fn set_weak(&self, id: PersistentId, callback: Option<ReclaimCallback>) -> bool {
        self.heap.borrow_mut().set_weak(id, callback)
    }

    fn dispose_persistent(&self, id: PersistentId) -> bool {
        self.heap.borrow_mut().dispose_persistent(id)
    }

    fn execute_script(
        &self,
        source: &EngineString,
        resource_name: &str,
        start_line: i32,
    ) -> Result<EngineValue, EngineThrow> {
        let text = source.to_string_lossy();
        match script::parse(&text, resource_name, start_line) {
            Ok(document) => Ok(self.from_json(&document)),
            Err(error) => {
                log::debug!("{}: {}", resource_name, error.text());
                let value = self.make_error("SyntaxError", &error.description);
                Err(EngineThrow {
                    value,
                    text: error.text(),
                    stack: Some(error.stack()),
                    message: Some(error.location),
                })
            }
        }
    }

    fn new_object(&self) -> ObjRef {
        self.alloc(HeapObject::new(Body::Plain))
    }

    fn get(&self, obj: ObjRef, key: &EngineValue) -> Result<EngineValue, EngineThrow> {
        let key = self.key_of(key);
        let found = {
            let heap = self.heap.borrow();
            heap.is_alive(obj).then(|| Self::lookup(&heap, obj, &key))
        };
        match found {
            None => Err(self.type_error("cannot read properties of a collected object")),
            Some(Lookup::Value(value)) => Ok(value),
            Some(Lookup::Missing) => Ok(EngineValue::Undefined),
            Some(Lookup::Getter(data)) => self
                .dispatch(data, InvocationKind::Get, EngineValue::Object(obj), &[])
                .map_err(|thrown| self.throw_value(thrown)),
        }
    }

    fn set(&self, obj: ObjRef, key: &EngineValue, value: EngineValue) -> Result<(), EngineThrow> {
        let key = self.key_of(key);
        let plan = {
            let heap = self.heap.borrow();
            heap.is_alive(obj).then(|| Self::store_plan(&heap, obj, &key))
        };
        match plan {
            None => Err(self.type_error("cannot set properties of a collected object")),
            Some(Store::ReadOnly) => Ok(()),
            Some(Store::Define) => self.define_own(obj, key, value),
            Some(Store::Setter(data)) => self
                .dispatch(data, InvocationKind::Set(value), EngineValue::Object(obj), &[])
                .map(|_| ())
                .map_err(|thrown| self.throw_value(thrown)),
        }
    }

    fn own_property_names(&self, obj: ObjRef) -> Option<Vec<EngineValue>> {
        self.with_object(obj, |object| {
            let elements = match &object.body {
                Body::Array(elements) => elements.len(),
                Body::TypedArray(info) => info.length,
                _ => 0,
            };
            let mut indices: SmallVec<[u32; 8]> = object
                .properties
                .iter()
                .filter(|p| p.enumerable)
                .filter_map(|p| match p.key {
                    Key::Index(index) => Some(index),
                    Key::Name(_) => None,
                })
                .collect();
            indices.sort_unstable();

            let mut names: Vec<EngineValue> = (0..elements)
                .map(|index| EngineValue::string(&index.to_string()))
                .collect();
            names.extend(indices.into_iter().map(|index| Key::Index(index).to_engine()));
            names.extend(
                object
                    .properties
                    .iter()
                    .filter(|p| p.enumerable && matches!(p.key, Key::Name(_)))
                    .map(|p| p.key.to_engine()),
            );
            names
        })
    }

    fn internal_field(&self, obj: ObjRef, index: usize) -> Option<*mut c_void> {
        self.with_object(obj, |object| {
            object
                .internal_fields
                .and_then(|fields| fields.get(index).copied())
        })
        .flatten()
    }

    fn set_internal_field(&self, obj: ObjRef, index: usize, value: *mut c_void) -> bool {
        self.with_object_mut(obj, |object| match &mut object.internal_fields {
            Some(fields) if index < INTERNAL_FIELD_COUNT => {
                fields[index] = value;
                true
            }
            _ => false,
        })
        .unwrap_or(false)
    }

    fn new_error(&self, message: &str) -> EngineValue {
        self.make_error("Error", message)
    }

    fn new_array(&self, length: usize) -> ObjRef {
        let limit = self.heap.borrow().max_array_length();
        if length > limit {
            log::warn!("array length {} clamped to {}", length, limit);
        }
        let length = length.min(limit);
        self.alloc(HeapObject::new(Body::Array(vec![
            EngineValue::Undefined;
            length
        ])))
    }

    fn array_length(&self, obj: ObjRef) -> Option<usize> {
        self.with_object(obj, |object| match &object.body {
            Body::Array(elements) => Some(elements.len()),
            _ => None,
        })
        .flatten()
    }

    fn new_function(&self, data: CallbackData, name: Option<&str>) -> ObjRef {
        let mut function = HeapObject::new(Body::Function(FunctionBody::Native(data)));
        function.define_hidden("name", EngineValue::string(name.unwrap_or_default()));
        self.alloc(function)
    }

    fn call(
        &self,
        func: ObjRef,
        this: EngineValue,
        args: &[EngineValue],
    ) -> Result<EngineValue, EngineThrow> {
        let data = match self.function_body(func)? {
            FunctionBody::Native(data) => data,
            FunctionBody::Template(template) => match self.template_constructor(template) {
                Some(data) => data,
                None => return Err(self.type_error("Illegal invocation")),
            },
        };
        self.dispatch(data, InvocationKind::Call, this, args)
            .map_err(|thrown| self.throw_value(thrown))
    }

    fn construct(&self, func: ObjRef, args: &[EngineValue]) -> Result<ObjRef, EngineThrow> {
        let (data, instance) = match self.function_body(func)? {
            FunctionBody::Native(data) => (data, self.new_object()),
            FunctionBody::Template(template) => {
                let Some(data) = self.template_constructor(template) else {
                    return Err(self.type_error("Illegal constructor"));
                };
                match self.template_new_instance(template) {
                    Some(instance) => (data, instance),
                    None => return Err(self.type_error("class template has been discarded")),
                }
            }
        };
        let result = self
            .dispatch(data, InvocationKind::Construct, EngineValue::Object(instance), args)
            .map_err(|thrown| self.throw_value(thrown))?;
        Ok(result.as_object().unwrap_or(instance))
    }

    fn new_template(&self, desc: TemplateDesc) -> Option<TemplateId> {
        let mut heap = self.heap.borrow_mut();
        if let Some(parent) = desc.parent {
            if heap.template(parent).is_none() {
                log::error!("template parent {:?} does not exist", parent);
                return None;
            }
        }
        Some(heap.new_template(Template {
            class_name: desc.class_name,
            constructor: desc.constructor,
            parent: desc.parent,
            internal_field_count: desc.internal_field_count.min(INTERNAL_FIELD_COUNT),
            accessors: Vec::new(),
            methods: Vec::new(),
            function: None,
            prototype: None,
        }))
    }

    fn template_add_accessor(
        &self,
        template: TemplateId,
        name: &str,
        getter: Option<CallbackData>,
        setter: Option<CallbackData>,
    ) -> bool {
        let mut heap = self.heap.borrow_mut();
        match heap.template_mut(template) {
            Some(t) if t.function.is_none() && !name.is_empty() => {
                t.accessors.push((name.to_string(), getter, setter));
                true
            }
            _ => false,
        }
    }

    fn template_add_method(&self, template: TemplateId, name: &str, data: CallbackData) -> bool {
        let mut heap = self.heap.borrow_mut();
        match heap.template_mut(template) {
            Some(t) if t.function.is_none() && !name.is_empty() => {
                t.methods.push((name.to_string(), data));
                true
            }
            _ => false,
        }
    }

    fn template_is_constructible(&self, template: TemplateId) -> bool {
        self.template_constructor(template).is_some()
    }

    fn template_function(&self, template: TemplateId) -> Option<ObjRef> {
        let (function, _) = self.instantiate(template)?;
        self.heap.borrow_mut().root_local(function);
        Some(function)
    }

    fn template_new_instance(&self, template: TemplateId) -> Option<ObjRef> {
        let (_, prototype) = self.instantiate(template)?;
        let field_count = self.heap.borrow().template(template)?.internal_field_count;
        let mut object = HeapObject::new(Body::Plain);
        object.prototype = Some(prototype);
        if field_count > 0 {
            object.internal_fields = Some([std::ptr::null_mut(); INTERNAL_FIELD_COUNT]);
        }
        Some(self.alloc(object))
    }

    fn discard_template(&self, template: TemplateId) {
        self.heap.borrow_mut().discard_template(template);
    }

    fn new_array_buffer(&self, byte_length: usize) -> Option<ObjRef> {
        let bytes = vec![0u8; byte_length].into_boxed_slice();
        Some(self.alloc(HeapObject::new(Body::ArrayBuffer(Backing::Owned(bytes)))))
    }

    fn new_external_array_buffer(
        &self,
        data: *mut c_void,
        byte_length: usize,
        release: Option<ExternalRelease>,
    ) -> Option<ObjRef> {
        if data.is_null() {
            return None;
        }
        Some(self.alloc(HeapObject::new(Body::ArrayBuffer(Backing::External {
            data,
            length: byte_length,
            release,
        }))))
    }

    fn array_buffer_contents(&self, obj: ObjRef) -> Option<(*mut u8, usize)> {
        self.with_object_mut(obj, |object| match &mut object.body {
            Body::ArrayBuffer(backing) => Some(backing.contents()),
            _ => None,
        })
        .flatten()
    }

    fn new_typed_array(
        &self,
        kind: TypedArrayKind,
        buffer: ObjRef,
        byte_offset: usize,
        length: usize,
    ) -> Option<ObjRef> {
        let buffer_length = self
            .with_object(buffer, |object| match &object.body {
                Body::ArrayBuffer(backing) => Some(backing.bytes().len()),
                _ => None,
            })
            .flatten()?;
        let size = kind.element_size();
        let end = length.checked_mul(size)?.checked_add(byte_offset)?;
        if byte_offset % size != 0 || end > buffer_length {
            log::debug!(
                "typed array of {} x {:?} at {} does not fit a {} byte buffer",
                length,
                kind,
                byte_offset,
                buffer_length
            );
            return None;
        }
        Some(self.alloc(HeapObject::new(Body::TypedArray(TypedArrayInfo {
            kind,
            buffer,
            byte_offset,
            length,
        }))))
    }

    fn typed_array_info(&self, obj: ObjRef) -> Option<TypedArrayInfo> {
        self.with_object(obj, |object| match &object.body {
            Body::TypedArray(info) => Some(*info),
            _ => None,
        })
        .flatten()
    }

    fn new_data_view(&self, buffer: ObjRef, byte_offset: usize, byte_length: usize) -> Option<ObjRef> {
        let buffer_length = self
            .with_object(buffer, |object| match &object.body {
                Body::ArrayBuffer(backing) => Some(backing.bytes().len()),
                _ => None,
            })
            .flatten()?;
        if byte_offset.checked_add(byte_length)? > buffer_length {
            log::debug!(
                "data view of {} bytes at {} does not fit a {} byte buffer",
                byte_length,
                byte_offset,
                buffer_length
            );
            return None;
        }
        Some(self.alloc(HeapObject::new(Body::DataView(DataViewInfo {
            buffer,
            byte_offset,
            byte_length,
        }))))
    }

    fn data_view_info(&self, obj: ObjRef) -> Option<DataViewInfo> {
        self.with_object(obj, |object| match &object.body {
            Body::DataView(info) => Some(*info),
            _ => None,
        })
        .flatten()
    }

    fn new_resolver(&self) -> ObjRef {
        let mut heap = self.heap.borrow_mut();
        let promise = heap.alloc(HeapObject::new(Body::Promise(PromiseData::default())));
        heap.alloc(HeapObject::new(Body::Resolver(promise)))
    }

    fn resolver_promise(&self, resolver: ObjRef) -> Option<ObjRef> {
        let promise = self
            .with_object(resolver, |object| match &object.body {
                Body::Resolver(promise) => Some(*promise),
                _ => None,
            })
            .flatten()?;
        self.heap.borrow_mut().root_local(promise);
        Some(promise)
    }

    fn resolve(&self, resolver: ObjRef, value: EngineValue) -> bool {
        match self.lock_resolver(resolver) {
            Some(promise) => {
                self.resolve_promise(promise, value);
                true
            }
            None => false,
        }
    }

    fn reject(&self, resolver: ObjRef, value: EngineValue) -> bool {
        match self.lock_resolver(resolver) {
            Some(promise) => {
                self.settle(promise, PromiseState::Rejected, value);
                true
            }
            None => false,
        }
    }

    fn promise_then(
        &self,
        promise: ObjRef,
        on_fulfilled: Option<ObjRef>,
        on_rejected: Option<ObjRef>,
    ) -> Option<ObjRef> {
        let is_promise = self
            .with_object(promise, |object| matches!(object.body, Body::Promise(_)))
            .unwrap_or(false);
        if !is_promise {
            return None;
        }
        let derived = self.alloc(HeapObject::new(Body::Promise(PromiseData::default())));
        let reaction = Reaction {
            on_fulfilled,
            on_rejected,
            derived,
        };
        let job = self
            .with_object_mut(promise, |object| match &mut object.body {
                Body::Promise(data) => data.react(reaction, true),
                _ => None,
            })
            .flatten();
        self.enqueue(job);
        Some(derived)
    }

    fn promise_state(&self, promise: ObjRef) -> Option<PromiseState> {
        self.with_object(promise, |object| match &object.body {
            Body::Promise(data) => Some(data.state),
            _ => None,
        })
        .flatten()
    }

    fn promise_result(&self, promise: ObjRef) -> Option<EngineValue> {
        self.with_object(promise, |object| match &object.body {
            Body::Promise(data) if data.state != PromiseState::Pending => Some(data.result.clone()),
            _ => None,
        })
        .flatten()
    }

    fn promise_has_handler(&self, promise: ObjRef) -> bool {
        self.with_object(promise, |object| match &object.body {
            Body::Promise(data) => data.handled,
            _ => false,
        })
        .unwrap_or(false)
    }

    fn run_microtasks(&self) {
        loop {
            let job = {
                let mut heap = self.heap.borrow_mut();
                let job = heap.microtasks.pop_front();
                if let Some(job) = &job {
                    // Off the queue the job is no longer traced.
                    job.trace(&mut |value: &EngineValue| {
                        if let EngineValue::Object(obj) = value {
                            heap.root_local(*obj);
                        }
                    });
                }
                job
            };
            match job {
                Some(job) => self.run_job(job),
                None => break,
            }
        }
    }

    fn dispatch_command(&self, command: i32, _data: *mut c_void) -> *mut c_void {
        match command {
            COMMAND_COLLECT_GARBAGE => self.collect_garbage(),
            other => log::debug!("unknown engine command {}", other),
        }
        std::ptr::null_mut()
    }

    fn collect_garbage(&self) {
        let reclaimed = self.heap.borrow_mut().collect();
        for (callback, info) in reclaimed.callbacks {
            callback(info);
        }
        for release in reclaimed.releases {
            release.run();
        }
    }
}

impl Drop for HeapEngine {
    fn drop(&mut self) {
        for release in self.heap.get_mut().drain_releases() {
            release.run();
        }
    }
}
