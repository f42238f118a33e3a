mod common;

use jsenv::ffi::*;
use jsenv::wire::jsenv_value_release;
use jsenv::{RawHandle, RawValue, TaggedValue, ValueType, JSENV_VERSION, JSENV_VERSION_V1000};
use jsenv_heap::{jsenv_heap_context_destroy, jsenv_heap_context_new, COMMAND_COLLECT_GARBAGE};
use std::ffi::{c_void, CString};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

static POINTS_FREED: AtomicUsize = AtomicUsize::new(0);

unsafe fn int_arg(argv: *const RawValue, argc: i32, index: usize) -> Option<i32> {
    if argv.is_null() || index >= argc as usize {
        return None;
    }
    (*argv.add(index)).to_tagged().ok()?.as_i32()
}

unsafe extern "C" fn point_new(
    env: *mut JsEnvHandle,
    _user_data: *mut c_void,
    this: RawHandle,
    argv: *const RawValue,
    argc: i32,
    _result: *mut RawValue,
) -> bool {
    let point = [int_arg(argv, argc, 0).unwrap_or(0), int_arg(argv, argc, 1).unwrap_or(0)];
    let point = Box::into_raw(Box::new(point));
    jsenv_set_object_private_data(env, this, point as *mut c_void)
}

unsafe extern "C" fn point_x(
    env: *mut JsEnvHandle,
    _user_data: *mut c_void,
    this: RawHandle,
    result: *mut RawValue,
) -> bool {
    let point = jsenv_get_object_private_data(env, this) as *const [i32; 2];
    match point.as_ref() {
        Some(point) => {
            *result = RawValue::from_tagged(&TaggedValue::Int(point[0]));
            true
        }
        None => false,
    }
}

unsafe extern "C" fn point_free(data: *mut c_void, _extra: *mut c_void) {
    if !data.is_null() {
        drop(Box::from_raw(data as *mut [i32; 2]));
    }
    POINTS_FREED.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn twice(
    _env: *mut JsEnvHandle,
    _user_data: *mut c_void,
    _this: RawHandle,
    argv: *const RawValue,
    argc: i32,
    result: *mut RawValue,
) -> bool {
    match int_arg(argv, argc, 0) {
        Some(value) => {
            *result = RawValue::from_tagged(&TaggedValue::Int(value * 2));
            true
        }
        None => false,
    }
}

unsafe extern "C" fn count_args(
    _env: *mut JsEnvHandle,
    _user_data: *mut c_void,
    _this: RawHandle,
    _argv: *const RawValue,
    argc: i32,
    result: *mut RawValue,
) -> bool {
    *result = RawValue::from_tagged(&TaggedValue::Int(argc));
    true
}

fn end_of_properties() -> JsPropertyDefinition {
    JsPropertyDefinition {
        name: ptr::null(),
        getter: None,
        setter: None,
        user_data: ptr::null_mut(),
        flags: 0,
    }
}

fn end_of_functions() -> JsFunctionDefinition {
    JsFunctionDefinition {
        name: ptr::null(),
        function: None,
        user_data: ptr::null_mut(),
        flags: 0,
    }
}

#[test]
fn test_class_through_c_abi() {
    common::init_logging();
    let context = jsenv_heap_context_new();
    let env = get_jsenv(context, JSENV_VERSION);
    assert!(!env.is_null());

    let name = CString::new("CPoint").unwrap();
    let x = CString::new("x").unwrap();
    let properties = [
        JsPropertyDefinition {
            name: x.as_ptr(),
            getter: Some(point_x),
            setter: None,
            user_data: ptr::null_mut(),
            flags: 0,
        },
        end_of_properties(),
    ];
    let functions = [end_of_functions()];
    let definition = JsClassDefinition {
        class_name: name.as_ptr(),
        constructor: Some(point_new),
        constructor_user_data: ptr::null_mut(),
        constructor_flags: 0,
        finalizer: Some(point_free),
        properties: properties.as_ptr(),
        functions: functions.as_ptr(),
    };

    unsafe {
        assert_eq!(jsenv_get_version(env), JSENV_VERSION);
        let class = jsenv_create_class(env, &definition, ptr::null());
        assert!(!class.is_null());
        assert_eq!(jsenv_get_class(env, name.as_ptr()), class);

        jsenv_push_scope(env);
        let args = [
            RawValue::from_tagged(&TaggedValue::Int(3)),
            RawValue::from_tagged(&TaggedValue::Int(4)),
        ];
        let point = jsenv_new_instance_with_constructor(env, class, args.as_ptr(), 2);
        assert_ne!(point, 0);
        assert_eq!(jsenv_get_object_type(env, point), ValueType::Object as i32);

        let key = RawValue::from_tagged(&TaggedValue::from("x"));
        let mut out = RawValue::null();
        assert!(jsenv_get_object_property(env, point, &key, &mut out, 0));
        assert_eq!(out.to_tagged(), Ok(TaggedValue::Int(3)));
        jsenv_pop_scope(env);

        jsenv_dispatch_command(env, COMMAND_COLLECT_GARBAGE, ptr::null_mut());
        assert_eq!(POINTS_FREED.load(Ordering::SeqCst), 1);

        jsenv_release(env);
    }
    assert!(jsenv_heap_context_destroy(context));
}

#[test]
fn test_failed_class_sets_native_exception() {
    common::init_logging();
    let context = jsenv_heap_context_new();
    let env = get_jsenv(context, JSENV_VERSION);
    let base_name = CString::new("Base").unwrap();
    let derived_name = CString::new("Derived").unwrap();
    let properties = [end_of_properties()];
    let functions = [end_of_functions()];
    let base = JsClassDefinition {
        class_name: base_name.as_ptr(),
        constructor: Some(point_new),
        constructor_user_data: ptr::null_mut(),
        constructor_flags: 0,
        finalizer: None,
        properties: properties.as_ptr(),
        functions: functions.as_ptr(),
    };
    let derived = JsClassDefinition {
        class_name: derived_name.as_ptr(),
        constructor: None,
        ..base
    };

    unsafe {
        let parent = jsenv_create_class(env, &base, ptr::null());
        assert!(!parent.is_null());
        assert!(jsenv_create_class(env, &derived, parent).is_null());
        assert!(jsenv_get_class(env, derived_name.as_ptr()).is_null());

        assert!(jsenv_has_exception(env));
        let mut kind = 0;
        let mut message = RawValue::null();
        assert!(jsenv_get_exception(env, &mut kind, &mut message));
        assert_eq!(kind, jsenv::ExceptionKind::NativeRuntime as i32);
        let text = message.to_tagged().unwrap().to_string_lossy().unwrap();
        assert!(text.contains("Derived"), "{}", text);
        jsenv_value_release(&mut message);
        assert_eq!(message.value_type, ValueType::Null as i32);

        jsenv_clear_exception(env);
        assert!(!jsenv_has_exception(env));
        jsenv_release(env);
    }
    jsenv_heap_context_destroy(context);
}

#[test]
fn test_v1000_handle_serves_only_its_surface() {
    common::init_logging();
    let context = jsenv_heap_context_new();
    let legacy = get_jsenv(context, JSENV_VERSION_V1000);
    let current = get_jsenv(context, JSENV_VERSION);
    let newer = get_jsenv(context, JSENV_VERSION + 1);
    assert!(get_jsenv(context, 1050).is_null());
    assert!(!newer.is_null());

    let domain = CString::new("host.twice").unwrap();
    let file = CString::new("legacy.json").unwrap();
    unsafe {
        assert_eq!(jsenv_get_version(legacy), JSENV_VERSION_V1000);
        assert_eq!(jsenv_get_version(newer), JSENV_VERSION);
        assert_ne!(jsenv_new_object(newer), 0);
        jsenv_release(newer);
        assert_eq!(jsenv_new_object(legacy), 0);
        assert_eq!(jsenv_get_global_object(legacy), 0);

        let code = RawValue::from_tagged(&TaggedValue::from("{\"ok\": true}"));
        let mut result = RawValue::null();
        assert!(jsenv_execute_script(legacy, &code, &mut result, file.as_ptr(), 1, 0));
        assert_eq!(result.value_type, ValueType::Object as i32);

        assert!(jsenv_register_callback_on_object(
            legacy,
            0,
            domain.as_ptr(),
            Some(twice),
            ptr::null_mut(),
            0
        ));

        let host_key = RawValue::from_tagged(&TaggedValue::from("host"));
        let mut host = RawValue::null();
        assert!(jsenv_get_global(current, &host_key, &mut host, 0));
        let host = host.to_tagged().unwrap().object().unwrap().to_raw().unwrap();

        let twice_key = RawValue::from_tagged(&TaggedValue::from("twice"));
        let mut function = RawValue::null();
        assert!(jsenv_get_object_property(current, host, &twice_key, &mut function, 0));
        assert_eq!(function.value_type, ValueType::Function as i32);
        let function = function.to_tagged().unwrap().object().unwrap().to_raw().unwrap();

        let args = [RawValue::from_tagged(&TaggedValue::Int(21))];
        let mut out = RawValue::null();
        assert!(jsenv_call_function(current, function, 0, args.as_ptr(), 1, &mut out, 0));
        assert_eq!(out.to_tagged(), Ok(TaggedValue::Int(42)));

        jsenv_release(legacy);
        jsenv_release(current);
    }
    jsenv_heap_context_destroy(context);
}

#[test]
fn test_long_argument_lists_through_c_abi() {
    common::init_logging();
    let context = jsenv_heap_context_new();
    let env = get_jsenv(context, JSENV_VERSION);
    unsafe {
        let function = jsenv_new_function(env, Some(count_args), ptr::null_mut(), 0);
        assert_ne!(function, 0);
        for count in [0usize, 16, 17, 64] {
            let args: Vec<RawValue> = (0..count)
                .map(|i| RawValue::from_tagged(&TaggedValue::Int(i as i32)))
                .collect();
            let mut out = RawValue::null();
            assert!(jsenv_call_function(
                env,
                function,
                0,
                args.as_ptr(),
                count as i32,
                &mut out,
                0
            ));
            assert_eq!(out.to_tagged(), Ok(TaggedValue::Int(count as i32)));
        }
        jsenv_release(env);
    }
    jsenv_heap_context_destroy(context);
}

#[test]
fn test_teardown_invalidates_context() {
    common::init_logging();
    let context = jsenv_heap_context_new();
    let env = get_jsenv(context, JSENV_VERSION);
    assert!(jsenv_context_teardown(context));
    assert!(get_jsenv(context, JSENV_VERSION).is_null());
    unsafe {
        assert_eq!(jsenv_get_version(env), JSENV_VERSION);
        assert_ne!(jsenv_new_object(env), 0);
        jsenv_release(env);
    }
    assert!(!jsenv_heap_context_destroy(context));
}

#[test]
fn test_data_view_through_c_abi() {
    common::init_logging();
    let context = jsenv_heap_context_new();
    let env = get_jsenv(context, JSENV_VERSION);
    let legacy = get_jsenv(context, JSENV_VERSION_V1000);
    unsafe {
        let buffer = jsenv_new_array_buffer(env, 32);
        assert_ne!(buffer, 0);
        assert_eq!(jsenv_new_data_view(env, buffer, 16, 17), 0);
        assert_eq!(jsenv_new_data_view(legacy, buffer, 0, 4), 0);

        let view = jsenv_new_data_view(env, buffer, 16, 16);
        assert_ne!(view, 0);
        assert_eq!(jsenv_get_object_type(env, view), ValueType::DataView as i32);
        assert_eq!(jsenv_get_data_view_length(env, view), 16);
        assert_eq!(jsenv_get_data_view_length(env, buffer), 0);

        jsenv_release(legacy);
        jsenv_release(env);
    }
    jsenv_heap_context_destroy(context);
}
