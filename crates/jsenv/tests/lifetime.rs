mod common;

use jsenv::engine::PromiseState;
use jsenv::{RawValue, TaggedValue, TypedArrayKind, ValueType, WeakCallbackInfo};
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::rc::Rc;

#[test]
fn test_transient_handles_die_with_their_scope() {
    let (engine, env) = common::setup();
    env.push_scope();
    let dropped = env.new_object();
    let kept = env.new_reference(&env.new_object()).unwrap();
    assert!(kept.is_persistent());
    assert!(!dropped.is_persistent());
    env.pop_scope();
    common::collect(&engine);

    assert_eq!(env.object_type(&dropped), ValueType::Null);
    assert_eq!(env.object_type(&kept), ValueType::Object);
    env.delete_reference(&kept);
    assert_eq!(env.object_type(&kept), ValueType::Null);
    env.delete_reference(&kept);
}

#[test]
fn test_weak_callback_runs_once_with_private_data() {
    let (engine, env) = common::setup();
    let seen: Rc<RefCell<Vec<WeakCallbackInfo>>> = Rc::default();
    let class = env
        .create_class(jsenv::ClassDefinition::new("Blob"), None)
        .unwrap();

    env.push_scope();
    let blob = env.new_instance(&class).unwrap();
    env.set_private_data(&blob, 0x10 as *mut c_void);
    env.set_private_extra_data(&blob, 0x20 as *mut c_void);
    let sink = seen.clone();
    let weak = env
        .new_weak_reference(
            &blob,
            Some(Box::new(move |info: WeakCallbackInfo| sink.borrow_mut().push(info))),
            0x30 as *mut c_void,
        )
        .unwrap();
    assert_eq!(env.object_type(&weak), ValueType::Object);
    env.pop_scope();

    common::collect(&engine);
    common::collect(&engine);
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].user_data, 0x30 as *mut c_void);
    assert_eq!(seen[0].internal_field(0), 0x10 as *mut c_void);
    assert_eq!(seen[0].internal_field(1), 0x20 as *mut c_void);
    assert_eq!(env.object_type(&weak), ValueType::Null);
    env.delete_reference(&weak);
}

#[test]
fn test_weak_reference_read_at_base_scope_still_reclaims() {
    let (engine, env) = common::setup();
    let fired = Rc::new(Cell::new(0));
    env.push_scope();
    let object = env.new_object();
    let count = fired.clone();
    let weak = env
        .new_weak_reference(
            &object,
            Some(Box::new(move |_: WeakCallbackInfo| count.set(count.get() + 1))),
            std::ptr::null_mut(),
        )
        .unwrap();
    env.pop_scope();

    assert_eq!(env.scope_depth(), 0);
    assert_eq!(env.object_type(&weak), ValueType::Object);
    for _ in 0..3 {
        env.push_scope();
        env.pop_scope();
        common::collect(&engine);
    }
    assert_eq!(fired.get(), 1);
    assert_eq!(env.object_type(&weak), ValueType::Null);
    env.delete_reference(&weak);
}

#[test]
fn test_domain_registration_does_not_pin_transient_owner() {
    let (engine, env) = common::setup();
    let reclaimed = Rc::new(Cell::new(0));
    env.push_scope();
    let owner = env.new_object();
    assert!(env.set_property_value(&owner, "tag", &TaggedValue::Int(5)));
    assert!(env.register_callback_on_object(Some(&owner), "api.tag", 0, |env, this, _| {
        env.get_property_value(&this?, "tag", 0)
    }));
    let api = env.get_property_value(&owner, "api", 0).unwrap().object().unwrap();
    let read = env.get_property_value(&api, "tag", 0).unwrap().object().unwrap();
    assert_eq!(env.call_function(&read, None, &[], 0), Some(TaggedValue::Int(5)));

    let count = reclaimed.clone();
    let weak = env
        .new_weak_reference(
            &owner,
            Some(Box::new(move |_: WeakCallbackInfo| count.set(count.get() + 1))),
            std::ptr::null_mut(),
        )
        .unwrap();
    env.pop_scope();
    common::collect(&engine);

    assert_eq!(reclaimed.get(), 1);
    assert_eq!(env.object_type(&weak), ValueType::Null);
    env.delete_reference(&weak);
}

#[test]
fn test_released_weak_reference_never_calls_back() {
    let (engine, env) = common::setup();
    let fired = Rc::new(Cell::new(false));
    env.push_scope();
    let object = env.new_object();
    let flag = fired.clone();
    let weak = env
        .new_weak_reference(&object, Some(Box::new(move |_: WeakCallbackInfo| flag.set(true))), std::ptr::null_mut())
        .unwrap();
    env.delete_reference(&weak);
    env.pop_scope();
    common::collect(&engine);
    assert!(!fired.get());
    assert_eq!(env.object_type(&weak), ValueType::Null);
}

#[test]
fn test_make_weak_requires_persistent_handle() {
    let (_engine, env) = common::setup();
    let object = env.new_object();
    assert!(env.make_weak(object, None, std::ptr::null_mut()).is_none());
    let strong = env.new_reference(&object).unwrap();
    let weak = env.make_weak(strong, None, std::ptr::null_mut()).unwrap();
    assert_eq!(weak, strong);
}

#[test]
fn test_typed_arrays_share_their_buffer() {
    let (_engine, env) = common::setup();
    let floats = env.new_typed_array(TypedArrayKind::Float64, 4).unwrap();
    assert_eq!(env.object_type(&floats), ValueType::TypedArray);
    assert_eq!(env.typed_array_type(&floats), Some(TypedArrayKind::Float64));
    assert_eq!(env.typed_array_count(&floats), 4);
    assert_eq!(env.length(&floats), 4);
    assert!(env.new_typed_array(TypedArrayKind::Int8, 0).is_none());

    let buffer = env.typed_array_buffer(&floats).unwrap();
    assert_eq!(env.object_type(&buffer), ValueType::ArrayBuffer);
    assert_eq!(env.array_buffer_length(&buffer), 32);

    let bytes = env
        .new_typed_array_on_buffer(TypedArrayKind::Uint8, &buffer, 8, 8)
        .unwrap();
    assert!(env.set_index(&floats, 1, &TaggedValue::Float(1.0)));
    let pointer = env.typed_array_pointer(&bytes, 7) as *const u8;
    let float_bits = 1.0f64.to_ne_bytes();
    assert_eq!(unsafe { *pointer }, float_bits[7]);
    assert!(env.typed_array_pointer(&bytes, 8).is_null());

    let (base, length) = env.array_buffer_pointer(&buffer).unwrap();
    assert_eq!(length, 32);
    assert_eq!(env.typed_array_pointer(&floats, 0) as *mut u8, base);
    assert!(env.typed_array_type(&buffer).is_none());
}

#[test]
fn test_data_views_cross_the_wire() {
    let (_engine, env) = common::setup();
    let buffer = env.new_array_buffer(16).unwrap();
    assert!(env.new_data_view(&buffer, 12, 8).is_none());
    let view = env.new_data_view(&buffer, 4, 8).unwrap();
    assert_eq!(env.object_type(&view), ValueType::DataView);
    assert_eq!(env.data_view_length(&view), 8);
    assert_eq!(env.data_view_length(&buffer), 0);
    let backing = env.data_view_buffer(&view).unwrap();
    assert_eq!(env.array_buffer_length(&backing), 16);

    let holder = env.new_array(0);
    assert!(env.set_index(&holder, 0, &TaggedValue::DataView(view)));
    let read = env.get_index(&holder, 0, 0).unwrap();
    assert_eq!(read.value_type(), ValueType::DataView);

    let mut raw = RawValue::from_tagged(&read);
    assert_eq!(raw.value_type, ValueType::DataView as i32);
    let back = unsafe { raw.to_tagged() }.unwrap();
    assert_eq!(back, read);
    assert_eq!(env.object_type(&back.object().unwrap()), ValueType::DataView);
    raw.release();
}

#[test]
fn test_external_buffer_released_once() {
    let (engine, env) = common::setup();
    let mut storage = vec![7u8; 12];
    let released = Rc::new(Cell::new(0));
    let counter = released.clone();

    env.push_scope();
    let buffer = env
        .new_external_array_buffer(
            storage.as_mut_ptr() as *mut c_void,
            storage.len(),
            Some(Box::new(move |_: *mut c_void, length: usize| {
                assert_eq!(length, 12);
                counter.set(counter.get() + 1);
            })),
        )
        .unwrap();
    let view = env
        .new_typed_array_on_buffer(TypedArrayKind::Uint16, &buffer, 1, 5)
        .unwrap();
    assert_eq!(env.get_index(&view, 0, 0), Some(TaggedValue::Int(0x0707)));
    env.pop_scope();

    common::collect(&engine);
    common::collect(&engine);
    assert_eq!(released.get(), 1);
    assert!(env
        .new_external_array_buffer(std::ptr::null_mut(), 4, None)
        .is_none());
}

#[test]
fn test_promise_resolution_runs_handlers() {
    let (_engine, env) = common::setup();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let handler = env
        .new_function(0, move |_, _, args| {
            sink.borrow_mut().extend(args.iter().cloned());
            None
        })
        .unwrap();

    let resolver = env.create_resolver();
    assert_eq!(env.object_type(&resolver), ValueType::Resolver);
    let promise = env.resolver_promise(&resolver).unwrap();
    assert_eq!(env.promise_state(&promise), Some(PromiseState::Pending));
    assert_eq!(env.promise_result(&promise, 0), None);
    assert!(!env.promise_has_handler(&promise));

    assert!(env.promise_then(&promise, &handler));
    assert!(env.promise_has_handler(&promise));
    assert!(env.resolve_promise(&resolver, &TaggedValue::Int(5)));
    assert!(!env.resolve_promise(&resolver, &TaggedValue::Int(6)));
    assert!(seen.borrow().is_empty());

    env.run_microtasks();
    assert_eq!(*seen.borrow(), vec![TaggedValue::Int(5)]);
    assert_eq!(env.promise_state(&promise), Some(PromiseState::Fulfilled));
    assert_eq!(env.promise_result(&promise, 0), Some(TaggedValue::Int(5)));
}

#[test]
fn test_promise_rejection_reaches_catch() {
    let (_engine, env) = common::setup();
    let caught = Rc::new(RefCell::new(None));
    let sink = caught.clone();
    let on_reject = env
        .new_function(jsenv::FLAG_USE_UTF8, move |_, _, args| {
            *sink.borrow_mut() = args.first().cloned();
            None
        })
        .unwrap();
    let resolver = env.create_resolver();
    let promise = env.resolver_promise(&resolver).unwrap();
    assert!(env.reject_promise(&resolver, &TaggedValue::from("nope")));
    assert!(env.promise_catch(&promise, &on_reject));
    env.run_microtasks();
    assert_eq!(*caught.borrow(), Some(TaggedValue::from("nope")));
    assert_eq!(env.promise_state(&promise), Some(PromiseState::Rejected));

    let object = env.new_object();
    assert_eq!(env.promise_state(&object), None);
    assert!(!env.promise_then(&object, &on_reject));
}

#[test]
fn test_scope_pops_are_balanced() {
    let (_engine, env) = common::setup();
    env.pop_scope();
    assert_eq!(env.scope_depth(), 0);
    env.push_scope();
    env.push_scope();
    assert_eq!(env.scope_depth(), 2);
    env.pop_scope();
    env.pop_scope();
    env.pop_scope();
    assert_eq!(env.scope_depth(), 0);
}

#[test]
fn test_collect_command_reclaims_through_environment() {
    let (_engine, env) = common::setup();
    let fired = Rc::new(Cell::new(0));
    env.push_scope();
    let object = env.new_object();
    let counter = fired.clone();
    env.new_weak_reference(
        &object,
        Some(Box::new(move |_: WeakCallbackInfo| counter.set(counter.get() + 1))),
        std::ptr::null_mut(),
    )
    .unwrap();
    env.pop_scope();

    assert!(env.dispatch_command(4242, std::ptr::null_mut()).is_null());
    assert_eq!(fired.get(), 0);
    env.dispatch_command(jsenv_heap::COMMAND_COLLECT_GARBAGE, std::ptr::null_mut());
    assert_eq!(fired.get(), 1);
}
