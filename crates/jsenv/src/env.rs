//! The environment: one per engine context
//!
//! An [`Environment`] owns the exception slot, the class registry, the
//! callback tables and the host scope stack for a single engine context. It is
//! created lazily the first time a host asks for it, stored in the engine's
//! embedder slot, and handed out as reference-counted [`EnvRef`]s.
//!
//! ## Lifetime
//!
//! The reference count starts at one on behalf of the engine context itself.
//! Every [`EnvRef`] adds one. [`teardown`] drops the context's reference, so
//! the environment is destroyed once the context has gone away *and* every
//! host reference has been released.

use crate::callback::{Callback, CallbackTables, FunctionEntry, MemberEntry};
use crate::class::{self, ClassDefinition, JsClass};
use crate::engine::{
    Completion, Engine, EngineString, EngineThrow, EngineValue, ExternalRelease, Invocation,
    InvocationKind, NativeDispatcher, ObjRef, ObjectKind, PromiseState, TypedArrayKind,
};
use crate::error::ClassError;
use crate::exception::{format_engine_throw, JsException};
use crate::handle::{self, ObjectHandle};
use crate::marshal::{self, marshal_in};
use crate::value::{TaggedValue, ValueType};
use crate::version::JSENV_VERSION;
use crate::weak::{self, WeakCallback};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ops::Deref;
use std::rc::{Rc, Weak};

pub struct Environment {
    engine: Rc<dyn Engine>,
    self_ref: Weak<Environment>,
    exception: RefCell<JsException>,
    classes: RefCell<HashMap<String, JsClass>>,
    anonymous_classes: RefCell<Vec<JsClass>>,
    tables: CallbackTables,
    scope_depth: Cell<usize>,
    ref_count: Cell<usize>,
    torn_down: Cell<bool>,
    destroyed: Cell<bool>,
}

/// A counted reference to an [`Environment`]. Dropping it releases the
/// reference.
pub struct EnvRef(Rc<Environment>);

impl EnvRef {
    pub fn ptr_eq(a: &EnvRef, b: &EnvRef) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }
}

impl Deref for EnvRef {
    type Target = Environment;

    fn deref(&self) -> &Environment {
        &self.0
    }
}

impl Clone for EnvRef {
    fn clone(&self) -> Self {
        self.0.add_reference();
        EnvRef(self.0.clone())
    }
}

impl Drop for EnvRef {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Returns the context's environment, creating it on first use.
pub fn attach(engine: &Rc<dyn Engine>) -> Option<EnvRef> {
    if !handle::assert_encoding_invariants() {
        return None;
    }

    if let Some(existing) = engine.embedder_slot().get() {
        return match existing.downcast::<Environment>() {
            Ok(env) => {
                env.add_reference();
                Some(EnvRef(env))
            }
            Err(_) => {
                log::error!("embedder slot holds data that is not an environment");
                None
            }
        };
    }

    let env = Rc::new_cyclic(|self_ref| Environment {
        engine: engine.clone(),
        self_ref: self_ref.clone(),
        exception: RefCell::new(JsException::default()),
        classes: RefCell::new(HashMap::new()),
        anonymous_classes: RefCell::new(Vec::new()),
        tables: CallbackTables::default(),
        scope_depth: Cell::new(0),
        ref_count: Cell::new(1),
        torn_down: Cell::new(false),
        destroyed: Cell::new(false),
    });
    let dispatcher: Weak<Environment> = Rc::downgrade(&env);
    engine.set_dispatcher(dispatcher);
    engine.embedder_slot().set(env.clone());
    log::debug!("environment created");

    env.add_reference();
    Some(EnvRef(env))
}

/// Signals that the engine context is going away.
pub fn teardown(engine: &dyn Engine) {
    let Some(existing) = engine.embedder_slot().get() else {
        return;
    };
    if let Ok(env) = existing.downcast::<Environment>() {
        env.signal_teardown();
    }
}

impl Environment {
    pub fn engine(&self) -> &dyn Engine {
        &*self.engine
    }

    pub fn version(&self) -> i32 {
        JSENV_VERSION
    }

    /// A new counted reference to this environment.
    pub fn acquire(&self) -> Option<EnvRef> {
        let env = self.self_ref.upgrade()?;
        env.add_reference();
        Some(EnvRef(env))
    }

    pub fn add_reference(&self) {
        self.ref_count.set(self.ref_count.get() + 1);
    }

    pub fn release(&self) {
        let count = self.ref_count.get();
        if count == 0 {
            log::warn!("environment released more times than referenced");
            return;
        }
        self.ref_count.set(count - 1);
        if count == 1 {
            self.destroy();
        }
    }

    pub fn reference_count(&self) -> usize {
        self.ref_count.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    fn signal_teardown(&self) {
        if self.torn_down.replace(true) {
            return;
        }
        self.release();
    }

    fn destroy(&self) {
        self.destroyed.set(true);
        let slot = self.engine.embedder_slot();
        let ours = slot
            .get()
            .and_then(|any| any.downcast::<Environment>().ok())
            .map_or(false, |env| std::ptr::eq(&*env, self));
        if ours {
            drop(slot.take());
        }
        self.classes.borrow_mut().clear();
        self.anonymous_classes.borrow_mut().clear();
        log::debug!("environment destroyed");
    }

    pub fn dispatch_command(&self, command: i32, data: *mut c_void) -> *mut c_void {
        self.engine.dispatch_command(command, data)
    }

    // ---- exceptions ----

    pub fn has_exception(&self) -> bool {
        self.exception.borrow().is_set()
    }

    pub fn exception(&self) -> JsException {
        self.exception.borrow().clone()
    }

    /// Overwrites any unread exception.
    pub fn set_exception(&self, exception: JsException) {
        *self.exception.borrow_mut() = exception;
    }

    pub fn clear_exception(&self) {
        *self.exception.borrow_mut() = JsException::default();
    }

    pub fn take_exception(&self) -> JsException {
        std::mem::take(&mut *self.exception.borrow_mut())
    }

    fn record_throw(&self, throw: &EngineThrow) {
        self.set_exception(JsException::engine(format_engine_throw(throw)));
    }

    // ---- conversions ----

    fn resolve(&self, handle: &ObjectHandle) -> Option<ObjRef> {
        let obj = handle.resolve(&*self.engine);
        if obj.is_none() {
            log::debug!("handle {:?} does not resolve", handle);
        }
        obj
    }

    fn to_engine(&self, value: &TaggedValue) -> Option<EngineValue> {
        match value.to_engine(&*self.engine) {
            Ok(v) => Some(v),
            Err(e) => {
                log::debug!("cannot pass {:?} to the engine: {}", value.value_type(), e);
                None
            }
        }
    }

    fn from_engine(&self, value: &EngineValue, flags: u32) -> Option<TaggedValue> {
        match TaggedValue::from_engine(&*self.engine, value, flags) {
            Ok(v) => Some(v),
            Err(e) => {
                log::debug!("cannot read engine value: {}", e);
                None
            }
        }
    }

    fn wrap(&self, obj: ObjRef) -> ObjectHandle {
        ObjectHandle::encode_transient(obj)
    }

    // ---- scripts and callbacks ----

    /// Runs `code` (either string variant). Failures land in the exception
    /// slot with the engine's location details.
    pub fn execute_script(
        &self,
        code: &TaggedValue,
        file_name: Option<&str>,
        start_line: i32,
        flags: u32,
    ) -> Option<TaggedValue> {
        let source = match code {
            TaggedValue::Utf8(s) => EngineString::from(s.as_str()),
            TaggedValue::Utf16(units) => EngineString::from_utf16(units),
            other => {
                log::error!("execute_script: code must be a string, got {:?}", other.value_type());
                return None;
            }
        };
        match self
            .engine
            .execute_script(&source, file_name.unwrap_or(""), start_line)
        {
            Ok(result) => self.from_engine(&result, flags),
            Err(throw) => {
                self.record_throw(&throw);
                None
            }
        }
    }

    /// Installs `callback` as function `c` on object `a.b` under `owner` (the
    /// global object when absent). Existing intermediate objects are reused.
    /// A transient owner is held weakly, so registering does not keep it
    /// alive; a persistent owner stays with its holder.
    pub fn register_callback_on_object<F>(
        &self,
        owner: Option<&ObjectHandle>,
        domain: &str,
        flags: u32,
        callback: F,
    ) -> bool
    where
        F: Fn(&Environment, Option<ObjectHandle>, &[TaggedValue]) -> Option<TaggedValue> + 'static,
    {
        let segments: Vec<&str> = domain.split('.').collect();
        if domain.is_empty() || segments.iter().any(|s| s.is_empty()) {
            log::error!("invalid callback domain '{}'", domain);
            return false;
        }
        let Some((func_name, path)) = segments.split_last() else {
            return false;
        };

        let root = match owner {
            Some(handle) => match self.resolve(handle) {
                Some(obj) => obj,
                None => return false,
            },
            None => self.engine.global(),
        };

        let owner_handle = match owner {
            Some(ObjectHandle::Transient(obj)) => ObjectHandle::encode_persistent(&*self.engine, *obj)
                .and_then(|strong| weak::make_weak(&*self.engine, strong, None, std::ptr::null_mut())),
            Some(persistent) => Some(*persistent),
            None => None,
        };

        let mut target = root;
        for segment in path {
            let key = EngineValue::string(segment);
            let existing = match self.engine.get(target, &key) {
                Ok(value) => value.as_object(),
                Err(throw) => {
                    self.record_throw(&throw);
                    return false;
                }
            };
            target = match existing {
                Some(obj) => obj,
                None => {
                    let obj = self.engine.new_object();
                    if let Err(throw) = self.engine.set(target, &key, EngineValue::Object(obj)) {
                        self.record_throw(&throw);
                        return false;
                    }
                    obj
                }
            };
        }

        let data = self.tables.register_domain(FunctionEntry {
            function: Rc::new(callback),
            flags,
            owner: owner_handle,
        });
        let function = self.engine.new_function(data, Some(*func_name));
        match self
            .engine
            .set(target, &EngineValue::string(func_name), EngineValue::Object(function))
        {
            Ok(()) => true,
            Err(throw) => {
                self.record_throw(&throw);
                false
            }
        }
    }

    pub fn new_function<F>(&self, flags: u32, callback: F) -> Option<ObjectHandle>
    where
        F: Fn(&Environment, Option<ObjectHandle>, &[TaggedValue]) -> Option<TaggedValue> + 'static,
    {
        let data = self.tables.register_function(FunctionEntry {
            function: Rc::new(callback),
            flags,
            owner: None,
        });
        Some(self.wrap(self.engine.new_function(data, None)))
    }

    // ---- classes ----

    /// Compiles and registers a class. A named class that is already
    /// registered is returned as is.
    pub fn create_class(
        &self,
        definition: ClassDefinition,
        parent: Option<&JsClass>,
    ) -> Result<JsClass, ClassError> {
        if let Some(name) = &definition.name {
            if let Some(existing) = self.classes.borrow().get(name) {
                return Ok(existing.clone());
            }
        }

        let name = definition.name.clone();
        let compiled = class::compile(&*self.engine, &self.tables, definition, parent)
            .map_err(|e| {
                log::error!("create_class failed: {}", e);
                e
            })?;

        match name {
            Some(name) => {
                self.classes.borrow_mut().insert(name, compiled.clone());
            }
            None => self.anonymous_classes.borrow_mut().push(compiled.clone()),
        }
        Ok(compiled)
    }

    pub fn get_class(&self, name: &str) -> Option<JsClass> {
        self.classes.borrow().get(name).cloned()
    }

    /// Instantiates without running the constructor.
    pub fn new_instance(&self, class: &JsClass) -> Option<ObjectHandle> {
        class.new_instance(&*self.engine).map(|obj| self.wrap(obj))
    }

    pub fn new_instance_with_constructor(
        &self,
        class: &JsClass,
        args: &[TaggedValue],
    ) -> Option<ObjectHandle> {
        let function = self.engine.template_function(class.template())?;
        self.construct(function, args)
    }

    pub fn class_constructor(&self, class: &JsClass) -> Option<ObjectHandle> {
        self.engine
            .template_function(class.template())
            .map(|obj| self.wrap(obj))
    }

    // ---- object typing and references ----

    /// `ValueType::Null` for handles that do not resolve.
    pub fn object_type(&self, object: &ObjectHandle) -> ValueType {
        let Some(obj) = self.resolve(object) else {
            return ValueType::Null;
        };
        match self.engine.object_kind(obj) {
            Some(ObjectKind::Plain) => ValueType::Object,
            Some(ObjectKind::Function) => ValueType::Function,
            Some(ObjectKind::Array) => ValueType::Array,
            Some(ObjectKind::TypedArray) => ValueType::TypedArray,
            Some(ObjectKind::ArrayBuffer) => ValueType::ArrayBuffer,
            Some(ObjectKind::DataView) => ValueType::DataView,
            Some(ObjectKind::Promise) => ValueType::Promise,
            Some(ObjectKind::Resolver) => ValueType::Resolver,
            None => ValueType::Null,
        }
    }

    pub fn typed_array_type(&self, object: &ObjectHandle) -> Option<TypedArrayKind> {
        let obj = self.resolve(object)?;
        self.engine.typed_array_info(obj).map(|info| info.kind)
    }

    pub fn new_reference(&self, object: &ObjectHandle) -> Option<ObjectHandle> {
        let obj = self.resolve(object)?;
        ObjectHandle::encode_persistent(&*self.engine, obj)
    }

    /// A new weak reference to `object`. `callback` receives `user_data`
    /// and the object's private-data slots once it is collected.
    pub fn new_weak_reference(
        &self,
        object: &ObjectHandle,
        callback: Option<WeakCallback>,
        user_data: *mut c_void,
    ) -> Option<ObjectHandle> {
        let persistent = self.new_reference(object)?;
        let weak = weak::make_weak(&*self.engine, persistent, callback, user_data);
        if weak.is_none() {
            persistent.release(&*self.engine);
        }
        weak
    }

    /// Downgrades an existing persistent handle.
    pub fn make_weak(
        &self,
        persistent: ObjectHandle,
        callback: Option<WeakCallback>,
        user_data: *mut c_void,
    ) -> Option<ObjectHandle> {
        weak::make_weak(&*self.engine, persistent, callback, user_data)
    }

    pub fn delete_reference(&self, object: &ObjectHandle) {
        object.release(&*self.engine);
    }

    pub fn private_data(&self, object: &ObjectHandle) -> *mut c_void {
        self.internal_field(object, 0)
    }

    pub fn set_private_data(&self, object: &ObjectHandle, data: *mut c_void) -> bool {
        self.set_internal_field(object, 0, data)
    }

    pub fn private_extra_data(&self, object: &ObjectHandle) -> *mut c_void {
        self.internal_field(object, 1)
    }

    pub fn set_private_extra_data(&self, object: &ObjectHandle, data: *mut c_void) -> bool {
        self.set_internal_field(object, 1, data)
    }

    fn internal_field(&self, object: &ObjectHandle, index: usize) -> *mut c_void {
        self.resolve(object)
            .and_then(|obj| self.engine.internal_field(obj, index))
            .unwrap_or(std::ptr::null_mut())
    }

    fn set_internal_field(&self, object: &ObjectHandle, index: usize, data: *mut c_void) -> bool {
        self.resolve(object)
            .map_or(false, |obj| self.engine.set_internal_field(obj, index, data))
    }

    // ---- globals and properties ----

    pub fn global_object(&self) -> ObjectHandle {
        self.wrap(self.engine.global())
    }

    pub fn set_global(&self, key: &TaggedValue, value: &TaggedValue) -> bool {
        self.set_raw(self.engine.global(), key, value)
    }

    pub fn get_global(&self, key: &TaggedValue, flags: u32) -> Option<TaggedValue> {
        self.get_raw(self.engine.global(), key, flags)
    }

    pub fn set_global_value(&self, name: &str, value: &TaggedValue) -> bool {
        self.set_global(&TaggedValue::from(name), value)
    }

    pub fn get_global_value(&self, name: &str, flags: u32) -> Option<TaggedValue> {
        self.get_global(&TaggedValue::from(name), flags)
    }

    pub fn get_property(&self, object: &ObjectHandle, key: &TaggedValue, flags: u32) -> Option<TaggedValue> {
        let obj = self.resolve(object)?;
        self.get_raw(obj, key, flags)
    }

    pub fn set_property(&self, object: &ObjectHandle, key: &TaggedValue, value: &TaggedValue) -> bool {
        self.resolve(object)
            .map_or(false, |obj| self.set_raw(obj, key, value))
    }

    pub fn get_property_value(&self, object: &ObjectHandle, name: &str, flags: u32) -> Option<TaggedValue> {
        self.get_property(object, &TaggedValue::from(name), flags)
    }

    pub fn set_property_value(&self, object: &ObjectHandle, name: &str, value: &TaggedValue) -> bool {
        self.set_property(object, &TaggedValue::from(name), value)
    }

    fn get_raw(&self, obj: ObjRef, key: &TaggedValue, flags: u32) -> Option<TaggedValue> {
        let key = self.to_engine(key)?;
        match self.engine.get(obj, &key) {
            Ok(value) => self.from_engine(&value, flags),
            Err(throw) => {
                self.record_throw(&throw);
                None
            }
        }
    }

    fn set_raw(&self, obj: ObjRef, key: &TaggedValue, value: &TaggedValue) -> bool {
        let (Some(key), Some(value)) = (self.to_engine(key), self.to_engine(value)) else {
            return false;
        };
        match self.engine.set(obj, &key, value) {
            Ok(()) => true,
            Err(throw) => {
                self.record_throw(&throw);
                false
            }
        }
    }

    /// Own enumerable property names as a new array.
    pub fn property_names(&self, object: &ObjectHandle) -> Option<ObjectHandle> {
        let obj = self.resolve(object)?;
        let names = self.engine.own_property_names(obj)?;
        let array = self.engine.new_array(names.len());
        for (index, name) in names.into_iter().enumerate() {
            if let Err(throw) = self.engine.set(array, &EngineValue::Int(index as i32), name) {
                self.record_throw(&throw);
                return None;
            }
        }
        Some(self.wrap(array))
    }

    /// Array length, typed-array element count or buffer byte length; 0 for
    /// anything else.
    pub fn length(&self, object: &ObjectHandle) -> usize {
        let Some(obj) = self.resolve(object) else {
            return 0;
        };
        if let Some(length) = self.engine.array_length(obj) {
            return length;
        }
        if let Some(info) = self.engine.typed_array_info(obj) {
            return info.length;
        }
        self.engine
            .array_buffer_contents(obj)
            .map_or(0, |(_, length)| length)
    }

    pub fn get_index(&self, object: &ObjectHandle, index: u32, flags: u32) -> Option<TaggedValue> {
        let obj = self.resolve(object)?;
        match self.engine.get(obj, &index_key(index)) {
            Ok(value) => self.from_engine(&value, flags),
            Err(throw) => {
                self.record_throw(&throw);
                None
            }
        }
    }

    pub fn set_index(&self, object: &ObjectHandle, index: u32, value: &TaggedValue) -> bool {
        let (Some(obj), Some(value)) = (self.resolve(object), self.to_engine(value)) else {
            return false;
        };
        match self.engine.set(obj, &index_key(index), value) {
            Ok(()) => true,
            Err(throw) => {
                self.record_throw(&throw);
                false
            }
        }
    }

    // ---- calls ----

    /// Calls `function` with `this` (the global object when absent). A
    /// script-level throw lands in the exception slot.
    pub fn call_function(
        &self,
        function: &ObjectHandle,
        this: Option<&ObjectHandle>,
        args: &[TaggedValue],
        flags: u32,
    ) -> Option<TaggedValue> {
        let func = self.resolve(function)?;
        let receiver = match this {
            Some(handle) => EngineValue::Object(self.resolve(handle)?),
            None => EngineValue::Object(self.engine.global()),
        };
        let args = self.marshal_args(args)?;
        match self.engine.call(func, receiver, &args) {
            Ok(result) => self.from_engine(&result, flags),
            Err(throw) => {
                self.record_throw(&throw);
                None
            }
        }
    }

    pub fn call_as_constructor(&self, function: &ObjectHandle, args: &[TaggedValue]) -> Option<ObjectHandle> {
        let func = self.resolve(function)?;
        self.construct(func, args)
    }

    fn construct(&self, func: ObjRef, args: &[TaggedValue]) -> Option<ObjectHandle> {
        let args = self.marshal_args(args)?;
        match self.engine.construct(func, &args) {
            Ok(obj) => Some(self.wrap(obj)),
            Err(throw) => {
                self.record_throw(&throw);
                None
            }
        }
    }

    fn marshal_args(&self, args: &[TaggedValue]) -> Option<marshal::EngineArgs> {
        match marshal_in(&*self.engine, args) {
            Ok(args) => Some(args),
            Err(e) => {
                log::debug!("cannot marshal call arguments: {}", e);
                None
            }
        }
    }

    // ---- creation ----

    pub fn new_object(&self) -> ObjectHandle {
        self.wrap(self.engine.new_object())
    }

    pub fn new_array(&self, length: usize) -> ObjectHandle {
        self.wrap(self.engine.new_array(length))
    }

    pub fn new_array_with_values(&self, values: &[TaggedValue]) -> Option<ObjectHandle> {
        let values = self.marshal_args(values)?;
        let array = self.engine.new_array(values.len());
        for (index, value) in values.into_iter().enumerate() {
            if let Err(throw) = self.engine.set(array, &index_key(index as u32), value) {
                self.record_throw(&throw);
                return None;
            }
        }
        Some(self.wrap(array))
    }

    // ---- typed arrays and array buffers ----

    /// A zero-filled typed array of `count` elements on a fresh buffer.
    pub fn new_typed_array(&self, kind: TypedArrayKind, count: usize) -> Option<ObjectHandle> {
        if count == 0 {
            return None;
        }
        let byte_length = count.checked_mul(kind.element_size())?;
        let buffer = self.engine.new_array_buffer(byte_length)?;
        self.engine
            .new_typed_array(kind, buffer, 0, count)
            .map(|obj| self.wrap(obj))
    }

    pub fn new_typed_array_on_buffer(
        &self,
        kind: TypedArrayKind,
        buffer: &ObjectHandle,
        element_offset: usize,
        count: usize,
    ) -> Option<ObjectHandle> {
        let buffer = self.resolve(buffer)?;
        let byte_offset = element_offset.checked_mul(kind.element_size())?;
        self.engine
            .new_typed_array(kind, buffer, byte_offset, count)
            .map(|obj| self.wrap(obj))
    }

    pub fn typed_array_count(&self, object: &ObjectHandle) -> usize {
        self.resolve(object)
            .and_then(|obj| self.engine.typed_array_info(obj))
            .map_or(0, |info| info.length)
    }

    /// Address of element `element_offset`, or null when out of range.
    pub fn typed_array_pointer(&self, object: &ObjectHandle, element_offset: usize) -> *mut c_void {
        let pointer = self.resolve(object).and_then(|obj| {
            let info = self.engine.typed_array_info(obj)?;
            if element_offset >= info.length {
                return None;
            }
            let (base, _) = self.engine.array_buffer_contents(info.buffer)?;
            if base.is_null() {
                return None;
            }
            let offset = info.byte_offset + element_offset * info.kind.element_size();
            Some(base.wrapping_add(offset) as *mut c_void)
        });
        pointer.unwrap_or(std::ptr::null_mut())
    }

    pub fn typed_array_buffer(&self, object: &ObjectHandle) -> Option<ObjectHandle> {
        let obj = self.resolve(object)?;
        self.engine
            .typed_array_info(obj)
            .map(|info| self.wrap(info.buffer))
    }

    /// A view of `byte_length` bytes of `buffer` starting at `byte_offset`.
    pub fn new_data_view(
        &self,
        buffer: &ObjectHandle,
        byte_offset: usize,
        byte_length: usize,
    ) -> Option<ObjectHandle> {
        let buffer = self.resolve(buffer)?;
        self.engine
            .new_data_view(buffer, byte_offset, byte_length)
            .map(|obj| self.wrap(obj))
    }

    pub fn data_view_length(&self, object: &ObjectHandle) -> usize {
        self.resolve(object)
            .and_then(|obj| self.engine.data_view_info(obj))
            .map_or(0, |info| info.byte_length)
    }

    pub fn data_view_buffer(&self, object: &ObjectHandle) -> Option<ObjectHandle> {
        let obj = self.resolve(object)?;
        self.engine
            .data_view_info(obj)
            .map(|info| self.wrap(info.buffer))
    }

    pub fn new_array_buffer(&self, byte_length: usize) -> Option<ObjectHandle> {
        if byte_length == 0 {
            return None;
        }
        self.engine
            .new_array_buffer(byte_length)
            .map(|obj| self.wrap(obj))
    }

    /// Wraps host memory. `release` runs once when the engine frees the buffer.
    pub fn new_external_array_buffer(
        &self,
        data: *mut c_void,
        byte_length: usize,
        release: Option<ExternalRelease>,
    ) -> Option<ObjectHandle> {
        if data.is_null() {
            return None;
        }
        self.engine
            .new_external_array_buffer(data, byte_length, release)
            .map(|obj| self.wrap(obj))
    }

    pub fn array_buffer_length(&self, object: &ObjectHandle) -> usize {
        self.resolve(object)
            .and_then(|obj| self.engine.array_buffer_contents(obj))
            .map_or(0, |(_, length)| length)
    }

    pub fn array_buffer_pointer(&self, object: &ObjectHandle) -> Option<(*mut u8, usize)> {
        let obj = self.resolve(object)?;
        self.engine.array_buffer_contents(obj)
    }

    // ---- promises ----

    pub fn create_resolver(&self) -> ObjectHandle {
        self.wrap(self.engine.new_resolver())
    }

    pub fn resolver_promise(&self, resolver: &ObjectHandle) -> Option<ObjectHandle> {
        let obj = self.resolve(resolver)?;
        self.engine.resolver_promise(obj).map(|p| self.wrap(p))
    }

    pub fn resolve_promise(&self, resolver: &ObjectHandle, value: &TaggedValue) -> bool {
        let (Some(obj), Some(value)) = (self.resolve(resolver), self.to_engine(value)) else {
            return false;
        };
        self.engine.resolve(obj, value)
    }

    pub fn reject_promise(&self, resolver: &ObjectHandle, value: &TaggedValue) -> bool {
        let (Some(obj), Some(value)) = (self.resolve(resolver), self.to_engine(value)) else {
            return false;
        };
        self.engine.reject(obj, value)
    }

    pub fn promise_then(&self, promise: &ObjectHandle, function: &ObjectHandle) -> bool {
        let (Some(p), Some(f)) = (self.resolve(promise), self.resolve(function)) else {
            return false;
        };
        self.engine.promise_then(p, Some(f), None).is_some()
    }

    pub fn promise_catch(&self, promise: &ObjectHandle, function: &ObjectHandle) -> bool {
        let (Some(p), Some(f)) = (self.resolve(promise), self.resolve(function)) else {
            return false;
        };
        self.engine.promise_then(p, None, Some(f)).is_some()
    }

    pub fn promise_has_handler(&self, promise: &ObjectHandle) -> bool {
        self.resolve(promise)
            .map_or(false, |p| self.engine.promise_has_handler(p))
    }

    /// `None` for anything that is not a promise.
    pub fn promise_state(&self, promise: &ObjectHandle) -> Option<PromiseState> {
        let p = self.resolve(promise)?;
        self.engine.promise_state(p)
    }

    /// `None` while pending.
    pub fn promise_result(&self, promise: &ObjectHandle, flags: u32) -> Option<TaggedValue> {
        let p = self.resolve(promise)?;
        let value = self.engine.promise_result(p)?;
        self.from_engine(&value, flags)
    }

    pub fn run_microtasks(&self) {
        self.engine.run_microtasks();
    }

    // ---- scopes ----

    pub fn push_scope(&self) {
        self.engine.push_scope();
        self.scope_depth.set(self.scope_depth.get() + 1);
    }

    /// Pops the innermost host scope. Popping with no open scope is a no-op.
    pub fn pop_scope(&self) {
        let depth = self.scope_depth.get();
        if depth == 0 {
            log::debug!("pop_scope with no open scope");
            return;
        }
        self.scope_depth.set(depth - 1);
        self.engine.pop_scope();
    }

    pub fn scope_depth(&self) -> usize {
        self.scope_depth.get()
    }

    // ---- dispatch ----

    fn dispatch_member(&self, member: &MemberEntry, invocation: Invocation<'_>) -> Completion {
        let this = invocation.this.as_object().map(ObjectHandle::encode_transient);
        match (member, invocation.kind) {
            (MemberEntry::Constructor { function, flags, finalizer }, kind) => {
                let completion = marshal::invoke_native(self, function, *flags, this, invocation.args);
                if kind != InvocationKind::Construct {
                    return completion;
                }
                completion?;
                let instance = invocation.this.as_object();
                if let (Some(obj), Some(finalizer)) = (instance, finalizer) {
                    class::attach_finalizer(&*self.engine, obj, finalizer.clone());
                }
                Ok(invocation.this)
            }
            (MemberEntry::Method(entry), _) => {
                marshal::invoke_native(self, &entry.function, entry.flags, this, invocation.args)
            }
            (MemberEntry::Property { getter: Some(getter), .. }, InvocationKind::Get) => {
                let Some(receiver) = this else {
                    return marshal::complete(self, None);
                };
                let result = getter(self, receiver);
                marshal::complete(self, result)
            }
            (MemberEntry::Property { name, setter: Some(setter), flags, .. }, InvocationKind::Set(value)) => {
                let value = match TaggedValue::from_engine(&*self.engine, &value, *flags) {
                    Ok(value) => value,
                    Err(e) => {
                        self.set_exception(JsException::native(format!(
                            "cannot assign property '{}': {}",
                            name, e
                        )));
                        return Err(marshal::throw_pending(self));
                    }
                };
                let accepted = this.map_or(false, |receiver| setter(self, receiver, &value));
                if !accepted && !self.has_exception() {
                    self.set_exception(JsException::native(format!(
                        "property '{}' rejected the assigned value",
                        name
                    )));
                }
                marshal::complete(self, None)
            }
            (MemberEntry::Property { name, .. }, _) => {
                log::error!("property '{}' dispatched for an accessor it does not have", name);
                Ok(EngineValue::Undefined)
            }
        }
    }
}

impl NativeDispatcher for Environment {
    fn dispatch(&self, data: crate::engine::CallbackData, invocation: Invocation<'_>) -> Completion {
        let Some(callback) = self.tables.lookup(data) else {
            log::error!("no native callback registered for {:?}", data);
            return Err(self.engine.new_error("native callback not found"));
        };
        match callback {
            Callback::Domain(entry) | Callback::Function(entry) => {
                let this = entry
                    .owner
                    .or_else(|| invocation.this.as_object().map(ObjectHandle::encode_transient));
                marshal::invoke_native(self, &entry.function, entry.flags, this, invocation.args)
            }
            Callback::Member(member) => self.dispatch_member(&member, invocation),
        }
    }
}

fn index_key(index: u32) -> EngineValue {
    match i32::try_from(index) {
        Ok(i) => EngineValue::Int(i),
        Err(_) => EngineValue::Number(index as f64),
    }
}
