//! C ABI surface
//!
//! Engine contexts are registered in a thread-local table and addressed by
//! integer ids. `get_jsenv(context, version)` negotiates an environment for a
//! context and returns an owned `JsEnvHandle` pointer that must be given back
//! to `jsenv_release`. Version-1100-only entry points refuse handles that
//! were negotiated at version 1000.
//!
//! Out-parameters of type `RawValue` are overwritten without being released
//! first; the caller releases them with `jsenv_value_release`.

use crate::class::{ClassDefinition, CompiledClass, JsClass};
use crate::engine::{Engine, PromiseState, TypedArrayKind, NOT_TYPED_ARRAY, PROMISE_NO_STATE};
use crate::env::{self, Environment};
use crate::exception::{ExceptionKind, JsException};
use crate::handle::{ObjectHandle, RawHandle};
use crate::marshal::INLINE_ARGS;
use crate::value::{TaggedValue, ValueType};
use crate::version::{self, NegotiatedEnv, JSENV_VERSION_V1000};
use crate::weak::WeakCallbackInfo;
use crate::wire::RawValue;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::rc::Rc;

/// Id of a registered engine context. `0` is never a valid id.
pub type ContextHandle = u64;

thread_local! {
    /// Maps context ids to engines
    static CONTEXTS: RefCell<HashMap<ContextHandle, Rc<dyn Engine>>> = RefCell::new(HashMap::new());
    /// Counter for generating context ids
    static NEXT_CONTEXT_ID: Cell<ContextHandle> = const { Cell::new(1) };
}

/// Makes `engine` reachable from C through the returned id.
pub fn register_context(engine: Rc<dyn Engine>) -> ContextHandle {
    let id = NEXT_CONTEXT_ID.with(|next| {
        let current = next.get();
        next.set(current + 1);
        current
    });
    CONTEXTS.with(|contexts| {
        contexts.borrow_mut().insert(id, engine);
    });
    id
}

pub fn context_engine(context: ContextHandle) -> Option<Rc<dyn Engine>> {
    CONTEXTS.with(|contexts| contexts.borrow().get(&context).cloned())
}

/// Removes the context and signals teardown to its environment.
pub fn unregister_context(context: ContextHandle) -> bool {
    let engine = CONTEXTS.with(|contexts| contexts.borrow_mut().remove(&context));
    match engine {
        Some(engine) => {
            env::teardown(&*engine);
            true
        }
        None => false,
    }
}

/// An environment handed to C code.
pub struct JsEnvHandle {
    negotiated: NegotiatedEnv,
}

impl JsEnvHandle {
    /// A handle for the duration of a native callback.
    fn borrowed(env: &Environment, version: i32) -> Option<JsEnvHandle> {
        env.acquire().map(|env| JsEnvHandle {
            negotiated: version::narrow(env, version),
        })
    }

    fn version(&self) -> i32 {
        self.negotiated.version()
    }

    fn env(&self) -> &Environment {
        self.negotiated.environment()
    }

    /// The environment when the handle speaks the current version.
    fn current(&self) -> Option<&Environment> {
        if self.version() == JSENV_VERSION_V1000 {
            log::warn!("operation requires jsenv 1100; handle negotiated 1000");
            return None;
        }
        Some(self.env())
    }
}

pub type JsUserFunction = unsafe extern "C" fn(
    env: *mut JsEnvHandle,
    user_data: *mut c_void,
    this: RawHandle,
    argv: *const RawValue,
    argc: i32,
    result: *mut RawValue,
) -> bool;

pub type JsPropertyGetter =
    unsafe extern "C" fn(env: *mut JsEnvHandle, user_data: *mut c_void, this: RawHandle, result: *mut RawValue) -> bool;

pub type JsPropertySetter = unsafe extern "C" fn(
    env: *mut JsEnvHandle,
    user_data: *mut c_void,
    this: RawHandle,
    value: *const RawValue,
) -> bool;

pub type JsFinalizeCallback = unsafe extern "C" fn(private_data: *mut c_void, private_extra_data: *mut c_void);

pub type JsWeakReferenceCallback = unsafe extern "C" fn(info: *const WeakCallbackInfo);

pub type JsArrayBufferRelease = unsafe extern "C" fn(data: *mut c_void, length: usize, user_data: *mut c_void);

/// Property descriptor. An entry with a null `name` ends the array.
#[repr(C)]
pub struct JsPropertyDefinition {
    pub name: *const c_char,
    pub getter: Option<JsPropertyGetter>,
    pub setter: Option<JsPropertySetter>,
    pub user_data: *mut c_void,
    pub flags: u32,
}

/// Method descriptor. An entry with a null `name` ends the array.
#[repr(C)]
pub struct JsFunctionDefinition {
    pub name: *const c_char,
    pub function: Option<JsUserFunction>,
    pub user_data: *mut c_void,
    pub flags: u32,
}

#[repr(C)]
pub struct JsClassDefinition {
    pub class_name: *const c_char,
    pub constructor: Option<JsUserFunction>,
    pub constructor_user_data: *mut c_void,
    pub constructor_flags: u32,
    pub finalizer: Option<JsFinalizeCallback>,
    pub properties: *const JsPropertyDefinition,
    pub functions: *const JsFunctionDefinition,
}

unsafe fn handle_ref<'a>(env: *mut JsEnvHandle) -> Option<&'a JsEnvHandle> {
    env.as_ref()
}

unsafe fn current_env<'a>(env: *mut JsEnvHandle) -> Option<&'a Environment> {
    handle_ref(env).and_then(JsEnvHandle::current)
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

unsafe fn read_value(value: *const RawValue) -> Option<TaggedValue> {
    let value = value.as_ref()?;
    match value.to_tagged() {
        Ok(v) => Some(v),
        Err(e) => {
            log::debug!("rejected raw value: {}", e);
            None
        }
    }
}

unsafe fn read_values(argv: *const RawValue, argc: i32) -> Option<SmallVec<[TaggedValue; INLINE_ARGS]>> {
    if argc <= 0 {
        return Some(SmallVec::new());
    }
    if argv.is_null() {
        return None;
    }
    std::slice::from_raw_parts(argv, argc as usize)
        .iter()
        .map(|raw| read_value(raw))
        .collect()
}

unsafe fn write_value(out: *mut RawValue, value: Option<TaggedValue>) -> bool {
    let Some(value) = value else {
        return false;
    };
    if out.is_null() {
        return true;
    }
    std::ptr::write(out, RawValue::from_tagged(&value));
    true
}

fn raw_handle(handle: Option<ObjectHandle>) -> RawHandle {
    handle.and_then(ObjectHandle::to_raw).unwrap_or(0)
}

fn object(raw: RawHandle) -> Option<ObjectHandle> {
    ObjectHandle::from_raw(raw)
}

type NativeClosure = Box<dyn Fn(&Environment, Option<ObjectHandle>, &[TaggedValue]) -> Option<TaggedValue>>;

/// Adapts a C function to a native closure.
fn wrap_function(callback: JsUserFunction, user_data: *mut c_void, version: i32) -> NativeClosure {
    Box::new(move |env: &Environment, this: Option<ObjectHandle>, args: &[TaggedValue]| {
        let mut handle = JsEnvHandle::borrowed(env, version)?;
        let argv: SmallVec<[RawValue; INLINE_ARGS]> = args.iter().map(RawValue::from_tagged).collect();
        let mut result = RawValue::null();
        let ok = unsafe {
            callback(
                &mut handle,
                user_data,
                raw_handle(this),
                argv.as_ptr(),
                argv.len() as i32,
                &mut result,
            )
        };
        if !ok {
            return None;
        }
        take_result(env, &result)
    })
}

fn take_result(env: &Environment, result: &RawValue) -> Option<TaggedValue> {
    match unsafe { result.to_tagged() } {
        Ok(value) => Some(value),
        Err(e) => {
            env.set_exception(JsException::native(format!("native callback returned {}", e)));
            None
        }
    }
}

/// Negotiates an environment for `context`. Returns null when the version
/// is not served or the context is unknown.
#[no_mangle]
pub extern "C" fn get_jsenv(context: ContextHandle, version: i32) -> *mut JsEnvHandle {
    let Some(engine) = context_engine(context) else {
        log::error!("get_jsenv: unknown context {}", context);
        return std::ptr::null_mut();
    };
    match version::negotiate(&engine, version) {
        Some(negotiated) => Box::into_raw(Box::new(JsEnvHandle { negotiated })),
        None => std::ptr::null_mut(),
    }
}

/// Releases a handle returned by `get_jsenv`.
#[no_mangle]
pub unsafe extern "C" fn jsenv_release(env: *mut JsEnvHandle) {
    if !env.is_null() {
        drop(Box::from_raw(env));
    }
}

/// Signals that a context is being torn down.
#[no_mangle]
pub extern "C" fn jsenv_context_teardown(context: ContextHandle) -> bool {
    unregister_context(context)
}

// ---- version 1000 surface ----

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_version(env: *mut JsEnvHandle) -> i32 {
    handle_ref(env).map_or(0, JsEnvHandle::version)
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_dispatch_command(env: *mut JsEnvHandle, command: i32, data: *mut c_void) -> *mut c_void {
    match handle_ref(env) {
        Some(handle) => handle.negotiated.as_v1000().dispatch_command(command, data),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_has_exception(env: *mut JsEnvHandle) -> bool {
    handle_ref(env).map_or(false, |h| h.env().has_exception())
}

/// Copies the current exception out. `message` receives an owned UTF-8 value.
#[no_mangle]
pub unsafe extern "C" fn jsenv_get_exception(env: *mut JsEnvHandle, kind: *mut i32, message: *mut RawValue) -> bool {
    let Some(handle) = handle_ref(env) else {
        return false;
    };
    let exception = handle.env().exception();
    if let Some(kind) = kind.as_mut() {
        *kind = exception.kind as i32;
    }
    write_value(message, Some(TaggedValue::Utf8(exception.message)))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_set_exception(env: *mut JsEnvHandle, kind: i32, message: *const c_char) {
    let Some(handle) = handle_ref(env) else {
        return;
    };
    let kind = ExceptionKind::from_i32(kind).unwrap_or(ExceptionKind::NativeRuntime);
    let message = c_str(message).unwrap_or_default();
    handle.env().set_exception(JsException::new(kind, message));
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_clear_exception(env: *mut JsEnvHandle) {
    if let Some(handle) = handle_ref(env) {
        handle.env().clear_exception();
    }
}

/// `owner == 0` registers under the global object.
#[no_mangle]
pub unsafe extern "C" fn jsenv_register_callback_on_object(
    env: *mut JsEnvHandle,
    owner: RawHandle,
    domain: *const c_char,
    callback: Option<JsUserFunction>,
    user_data: *mut c_void,
    flags: u32,
) -> bool {
    let (Some(handle), Some(domain), Some(callback)) = (handle_ref(env), c_str(domain), callback) else {
        return false;
    };
    let owner = object(owner);
    let closure = wrap_function(callback, user_data, handle.version());
    handle
        .negotiated
        .as_v1000()
        .register_callback_on_object(owner.as_ref(), domain, flags, closure)
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_execute_script(
    env: *mut JsEnvHandle,
    code: *const RawValue,
    result: *mut RawValue,
    file_name: *const c_char,
    start_line: i32,
    flags: u32,
) -> bool {
    let (Some(handle), Some(code)) = (handle_ref(env), read_value(code)) else {
        return false;
    };
    let value = if handle.version() == JSENV_VERSION_V1000 {
        handle.negotiated.as_v1000().execute_script(&code, c_str(file_name), start_line)
    } else {
        handle.env().execute_script(&code, c_str(file_name), start_line, flags)
    };
    write_value(result, value)
}

// ---- version 1100 surface ----

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_function(
    env: *mut JsEnvHandle,
    callback: Option<JsUserFunction>,
    user_data: *mut c_void,
    flags: u32,
) -> RawHandle {
    let (Some(env), Some(callback)) = (current_env(env), callback) else {
        return 0;
    };
    let closure = wrap_function(callback, user_data, version::JSENV_VERSION);
    raw_handle(env.new_function(flags, closure))
}

unsafe fn class_definition(definition: &JsClassDefinition) -> ClassDefinition {
    let version = version::JSENV_VERSION;
    let mut class = match c_str(definition.class_name) {
        Some(name) => ClassDefinition::new(name),
        None => ClassDefinition::anonymous(),
    };

    if let Some(constructor) = definition.constructor {
        let closure = wrap_function(constructor, definition.constructor_user_data, version);
        class = class.constructor(definition.constructor_flags, closure);
    }
    if let Some(finalizer) = definition.finalizer {
        class = class.finalizer(move |data: *mut c_void, extra: *mut c_void| unsafe { finalizer(data, extra) });
    }

    let mut property = definition.properties;
    while let Some(pd) = property.as_ref() {
        let Some(name) = c_str(pd.name) else { break };
        let user_data = pd.user_data;
        let getter = pd.getter.map(|getter| -> crate::callback::PropertyGetter {
            Rc::new(move |env: &Environment, this: ObjectHandle| {
                let mut handle = JsEnvHandle::borrowed(env, version)?;
                let mut result = RawValue::null();
                if !unsafe { getter(&mut handle, user_data, raw_handle(Some(this)), &mut result) } {
                    return None;
                }
                take_result(env, &result)
            })
        });
        let setter = pd.setter.map(|setter| -> crate::callback::PropertySetter {
            Rc::new(move |env: &Environment, this: ObjectHandle, value: &TaggedValue| {
                let Some(mut handle) = JsEnvHandle::borrowed(env, version) else {
                    return false;
                };
                let raw = RawValue::from_tagged(value);
                unsafe { setter(&mut handle, user_data, raw_handle(Some(this)), &raw) }
            })
        });
        class = class.property(name, getter, setter, pd.flags);
        property = property.add(1);
    }

    let mut function = definition.functions;
    while let Some(fd) = function.as_ref() {
        let Some(name) = c_str(fd.name) else { break };
        if let Some(callback) = fd.function {
            class = class.method(name, fd.flags, wrap_function(callback, fd.user_data, version));
        }
        function = function.add(1);
    }
    class
}

unsafe fn class_from_raw(class: *const CompiledClass) -> Option<JsClass> {
    if class.is_null() {
        return None;
    }
    // The registry holds a strong reference for the environment's lifetime.
    Rc::increment_strong_count(class);
    Some(Rc::from_raw(class))
}

/// Compiles a class. On failure returns null and records a native runtime
/// exception with the reason.
#[no_mangle]
pub unsafe extern "C" fn jsenv_create_class(
    env: *mut JsEnvHandle,
    definition: *const JsClassDefinition,
    parent: *const CompiledClass,
) -> *const CompiledClass {
    let (Some(env), Some(definition)) = (current_env(env), definition.as_ref()) else {
        return std::ptr::null();
    };
    let parent = class_from_raw(parent);
    match env.create_class(class_definition(definition), parent.as_ref()) {
        Ok(class) => Rc::as_ptr(&class),
        Err(e) => {
            env.set_exception(JsException::native(e.to_string()));
            std::ptr::null()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_class(env: *mut JsEnvHandle, name: *const c_char) -> *const CompiledClass {
    let (Some(env), Some(name)) = (current_env(env), c_str(name)) else {
        return std::ptr::null();
    };
    env.get_class(name)
        .map_or(std::ptr::null(), |class| Rc::as_ptr(&class))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_instance(env: *mut JsEnvHandle, class: *const CompiledClass) -> RawHandle {
    let (Some(env), Some(class)) = (current_env(env), class_from_raw(class)) else {
        return 0;
    };
    raw_handle(env.new_instance(&class))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_instance_with_constructor(
    env: *mut JsEnvHandle,
    class: *const CompiledClass,
    argv: *const RawValue,
    argc: i32,
) -> RawHandle {
    let (Some(env), Some(class), Some(args)) = (current_env(env), class_from_raw(class), read_values(argv, argc))
    else {
        return 0;
    };
    raw_handle(env.new_instance_with_constructor(&class, &args))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_class_constructor_function(
    env: *mut JsEnvHandle,
    class: *const CompiledClass,
) -> RawHandle {
    let (Some(env), Some(class)) = (current_env(env), class_from_raw(class)) else {
        return 0;
    };
    raw_handle(env.class_constructor(&class))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_object_type(env: *mut JsEnvHandle, object: RawHandle) -> i32 {
    match (current_env(env), ObjectHandle::from_raw(object)) {
        (Some(env), Some(handle)) => env.object_type(&handle) as i32,
        _ => ValueType::Null as i32,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_typed_array_type(env: *mut JsEnvHandle, object: RawHandle) -> i32 {
    match (current_env(env), ObjectHandle::from_raw(object)) {
        (Some(env), Some(handle)) => env
            .typed_array_type(&handle)
            .map_or(NOT_TYPED_ARRAY, |kind| kind as i32),
        _ => NOT_TYPED_ARRAY,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_object_reference(env: *mut JsEnvHandle, object: RawHandle) -> RawHandle {
    let (Some(env), Some(handle)) = (current_env(env), object_arg(object)) else {
        return 0;
    };
    raw_handle(env.new_reference(&handle))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_object_weak_reference(
    env: *mut JsEnvHandle,
    object: RawHandle,
    callback: Option<JsWeakReferenceCallback>,
    user_data: *mut c_void,
) -> RawHandle {
    let (Some(env), Some(handle)) = (current_env(env), object_arg(object)) else {
        return 0;
    };
    let callback = callback.map(|callback| -> crate::weak::WeakCallback {
        Box::new(move |info: WeakCallbackInfo| unsafe { callback(&info) })
    });
    raw_handle(env.new_weak_reference(&handle, callback, user_data))
}

/// Unpacks the snapshot handed to a weak callback.
#[no_mangle]
pub unsafe extern "C" fn jsenv_get_weak_reference_callback_info(
    info: *const WeakCallbackInfo,
    user_data: *mut *mut c_void,
    internal_fields: *mut *mut c_void,
) {
    let Some(info) = info.as_ref() else {
        return;
    };
    if let Some(user_data) = user_data.as_mut() {
        *user_data = info.user_data;
    }
    if !internal_fields.is_null() {
        *internal_fields = info.internal_field(0);
        *internal_fields.add(1) = info.internal_field(1);
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_delete_object_reference(env: *mut JsEnvHandle, object: RawHandle) {
    if let (Some(env), Some(handle)) = (current_env(env), object_arg(object)) {
        env.delete_reference(&handle);
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_object_private_data(env: *mut JsEnvHandle, object: RawHandle) -> *mut c_void {
    match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.private_data(&handle),
        _ => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_set_object_private_data(env: *mut JsEnvHandle, object: RawHandle, data: *mut c_void) -> bool {
    match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.set_private_data(&handle, data),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_object_private_extra_data(env: *mut JsEnvHandle, object: RawHandle) -> *mut c_void {
    match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.private_extra_data(&handle),
        _ => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_set_object_private_extra_data(
    env: *mut JsEnvHandle,
    object: RawHandle,
    data: *mut c_void,
) -> bool {
    match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.set_private_extra_data(&handle, data),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_global_object(env: *mut JsEnvHandle) -> RawHandle {
    current_env(env).map_or(0, |env| raw_handle(Some(env.global_object())))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_set_global(env: *mut JsEnvHandle, key: *const RawValue, value: *const RawValue) -> bool {
    match (current_env(env), read_value(key), read_value(value)) {
        (Some(env), Some(key), Some(value)) => env.set_global(&key, &value),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_global(
    env: *mut JsEnvHandle,
    key: *const RawValue,
    result: *mut RawValue,
    flags: u32,
) -> bool {
    let (Some(env), Some(key)) = (current_env(env), read_value(key)) else {
        return false;
    };
    write_value(result, env.get_global(&key, flags))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_object_property(
    env: *mut JsEnvHandle,
    object: RawHandle,
    key: *const RawValue,
    result: *mut RawValue,
    flags: u32,
) -> bool {
    let (Some(env), Some(handle), Some(key)) = (current_env(env), object_arg(object), read_value(key)) else {
        return false;
    };
    write_value(result, env.get_property(&handle, &key, flags))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_set_object_property(
    env: *mut JsEnvHandle,
    object: RawHandle,
    key: *const RawValue,
    value: *const RawValue,
) -> bool {
    match (current_env(env), object_arg(object), read_value(key), read_value(value)) {
        (Some(env), Some(handle), Some(key), Some(value)) => env.set_property(&handle, &key, &value),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_object_property_names(env: *mut JsEnvHandle, object: RawHandle) -> RawHandle {
    let (Some(env), Some(handle)) = (current_env(env), object_arg(object)) else {
        return 0;
    };
    raw_handle(env.property_names(&handle))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_object_length(env: *mut JsEnvHandle, object: RawHandle) -> usize {
    match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.length(&handle),
        _ => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_object_at_index(
    env: *mut JsEnvHandle,
    object: RawHandle,
    index: u32,
    result: *mut RawValue,
    flags: u32,
) -> bool {
    let (Some(env), Some(handle)) = (current_env(env), object_arg(object)) else {
        return false;
    };
    write_value(result, env.get_index(&handle, index, flags))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_set_object_at_index(
    env: *mut JsEnvHandle,
    object: RawHandle,
    index: u32,
    value: *const RawValue,
) -> bool {
    match (current_env(env), object_arg(object), read_value(value)) {
        (Some(env), Some(handle), Some(value)) => env.set_index(&handle, index, &value),
        _ => false,
    }
}

/// `this == 0` calls with the global object as receiver.
#[no_mangle]
pub unsafe extern "C" fn jsenv_call_function(
    env: *mut JsEnvHandle,
    function: RawHandle,
    this: RawHandle,
    argv: *const RawValue,
    argc: i32,
    result: *mut RawValue,
    flags: u32,
) -> bool {
    let (Some(env), Some(function), Some(args)) = (current_env(env), object_arg(function), read_values(argv, argc))
    else {
        return false;
    };
    let this = object(this);
    write_value(result, env.call_function(&function, this.as_ref(), &args, flags))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_call_function_as_constructor(
    env: *mut JsEnvHandle,
    function: RawHandle,
    argv: *const RawValue,
    argc: i32,
) -> RawHandle {
    let (Some(env), Some(function), Some(args)) = (current_env(env), object_arg(function), read_values(argv, argc))
    else {
        return 0;
    };
    raw_handle(env.call_as_constructor(&function, &args))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_object(env: *mut JsEnvHandle) -> RawHandle {
    current_env(env).map_or(0, |env| raw_handle(Some(env.new_object())))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_array(env: *mut JsEnvHandle, length: usize) -> RawHandle {
    current_env(env).map_or(0, |env| raw_handle(Some(env.new_array(length))))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_array_with_values(env: *mut JsEnvHandle, argv: *const RawValue, argc: i32) -> RawHandle {
    let (Some(env), Some(values)) = (current_env(env), read_values(argv, argc)) else {
        return 0;
    };
    raw_handle(env.new_array_with_values(&values))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_typed_array(env: *mut JsEnvHandle, kind: i32, count: usize) -> RawHandle {
    let (Some(env), Some(kind)) = (current_env(env), TypedArrayKind::from_i32(kind)) else {
        return 0;
    };
    raw_handle(env.new_typed_array(kind, count))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_typed_array_with_array_buffer(
    env: *mut JsEnvHandle,
    kind: i32,
    buffer: RawHandle,
    element_offset: usize,
    count: usize,
) -> RawHandle {
    let (Some(env), Some(kind), Some(buffer)) = (current_env(env), TypedArrayKind::from_i32(kind), object_arg(buffer))
    else {
        return 0;
    };
    raw_handle(env.new_typed_array_on_buffer(kind, &buffer, element_offset, count))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_typed_array_count(env: *mut JsEnvHandle, object: RawHandle) -> usize {
    match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.typed_array_count(&handle),
        _ => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_typed_array_pointer(
    env: *mut JsEnvHandle,
    object: RawHandle,
    element_offset: usize,
) -> *mut c_void {
    match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.typed_array_pointer(&handle, element_offset),
        _ => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_typed_array_array_buffer(env: *mut JsEnvHandle, object: RawHandle) -> RawHandle {
    let (Some(env), Some(handle)) = (current_env(env), object_arg(object)) else {
        return 0;
    };
    raw_handle(env.typed_array_buffer(&handle))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_data_view(
    env: *mut JsEnvHandle,
    buffer: RawHandle,
    byte_offset: usize,
    byte_length: usize,
) -> RawHandle {
    let (Some(env), Some(buffer)) = (current_env(env), object_arg(buffer)) else {
        return 0;
    };
    raw_handle(env.new_data_view(&buffer, byte_offset, byte_length))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_data_view_length(env: *mut JsEnvHandle, object: RawHandle) -> usize {
    match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.data_view_length(&handle),
        _ => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_new_array_buffer(env: *mut JsEnvHandle, length: usize) -> RawHandle {
    current_env(env).map_or(0, |env| raw_handle(env.new_array_buffer(length)))
}

/// Wraps host memory. `release` runs once when the engine frees the buffer.
#[no_mangle]
pub unsafe extern "C" fn jsenv_new_array_buffer_external(
    env: *mut JsEnvHandle,
    data: *mut c_void,
    length: usize,
    release: Option<JsArrayBufferRelease>,
    user_data: *mut c_void,
) -> RawHandle {
    let Some(env) = current_env(env) else {
        return 0;
    };
    let release = release.map(|release| -> crate::engine::ExternalRelease {
        Box::new(move |data: *mut c_void, length: usize| unsafe { release(data, length, user_data) })
    });
    raw_handle(env.new_external_array_buffer(data, length, release))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_array_buffer_length(env: *mut JsEnvHandle, object: RawHandle) -> usize {
    match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.array_buffer_length(&handle),
        _ => 0,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_array_buffer_pointer(
    env: *mut JsEnvHandle,
    object: RawHandle,
    length: *mut usize,
) -> *mut c_void {
    let contents = match (current_env(env), object_arg(object)) {
        (Some(env), Some(handle)) => env.array_buffer_pointer(&handle),
        _ => None,
    };
    let (data, len) = contents.unwrap_or((std::ptr::null_mut(), 0));
    if let Some(length) = length.as_mut() {
        *length = len;
    }
    data as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_create_resolver(env: *mut JsEnvHandle) -> RawHandle {
    current_env(env).map_or(0, |env| raw_handle(Some(env.create_resolver())))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_promise_from_resolver(env: *mut JsEnvHandle, resolver: RawHandle) -> RawHandle {
    let (Some(env), Some(resolver)) = (current_env(env), object_arg(resolver)) else {
        return 0;
    };
    raw_handle(env.resolver_promise(&resolver))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_resolve(env: *mut JsEnvHandle, resolver: RawHandle, value: *const RawValue) -> bool {
    match (current_env(env), object_arg(resolver), read_value(value)) {
        (Some(env), Some(resolver), Some(value)) => env.resolve_promise(&resolver, &value),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_reject(env: *mut JsEnvHandle, resolver: RawHandle, value: *const RawValue) -> bool {
    match (current_env(env), object_arg(resolver), read_value(value)) {
        (Some(env), Some(resolver), Some(value)) => env.reject_promise(&resolver, &value),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_set_promise_then(env: *mut JsEnvHandle, promise: RawHandle, function: RawHandle) -> bool {
    match (current_env(env), object_arg(promise), object_arg(function)) {
        (Some(env), Some(promise), Some(function)) => env.promise_then(&promise, &function),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_set_promise_catch(env: *mut JsEnvHandle, promise: RawHandle, function: RawHandle) -> bool {
    match (current_env(env), object_arg(promise), object_arg(function)) {
        (Some(env), Some(promise), Some(function)) => env.promise_catch(&promise, &function),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_promise_has_handler(env: *mut JsEnvHandle, promise: RawHandle) -> bool {
    match (current_env(env), object_arg(promise)) {
        (Some(env), Some(promise)) => env.promise_has_handler(&promise),
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_promise_state(env: *mut JsEnvHandle, promise: RawHandle) -> i32 {
    match (current_env(env), object_arg(promise)) {
        (Some(env), Some(promise)) => env
            .promise_state(&promise)
            .map_or(PROMISE_NO_STATE, |state: PromiseState| state as i32),
        _ => PROMISE_NO_STATE,
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_get_promise_result(
    env: *mut JsEnvHandle,
    promise: RawHandle,
    result: *mut RawValue,
    flags: u32,
) -> bool {
    let (Some(env), Some(promise)) = (current_env(env), object_arg(promise)) else {
        return false;
    };
    write_value(result, env.promise_result(&promise, flags))
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_push_scope(env: *mut JsEnvHandle) {
    if let Some(env) = current_env(env) {
        env.push_scope();
    }
}

#[no_mangle]
pub unsafe extern "C" fn jsenv_pop_scope(env: *mut JsEnvHandle) {
    if let Some(env) = current_env(env) {
        env.pop_scope();
    }
}

fn object_arg(raw: RawHandle) -> Option<ObjectHandle> {
    let handle = object(raw);
    if handle.is_none() {
        log::debug!("empty object handle {:#x}", raw);
    }
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_context_yields_null() {
        assert!(get_jsenv(u64::MAX, version::JSENV_VERSION).is_null());
        assert!(!jsenv_context_teardown(u64::MAX));
    }

    #[test]
    fn test_null_env_is_tolerated() {
        unsafe {
            assert_eq!(jsenv_get_version(std::ptr::null_mut()), 0);
            assert!(!jsenv_has_exception(std::ptr::null_mut()));
            assert_eq!(jsenv_new_object(std::ptr::null_mut()), 0);
            jsenv_release(std::ptr::null_mut());
        }
    }
}
