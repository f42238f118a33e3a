mod common;

use jsenv::{ExceptionKind, JsException, TaggedValue, ValueType, FLAG_USE_UTF8};

#[test]
fn test_native_exception_suppresses_result() {
    let (_engine, env) = common::setup();
    let function = env
        .new_function(0, |env, _, _| {
            env.set_exception(JsException::native("disk on fire"));
            Some(TaggedValue::Int(1))
        })
        .unwrap();
    let result = env.call_function(&function, None, &[], 0);
    assert_eq!(result, None);
    let exception = env.take_exception();
    assert_eq!(exception.kind, ExceptionKind::Engine);
    assert!(exception.message.contains("disk on fire"));
}

#[test]
fn test_argument_lists_past_inline_capacity() {
    let (_engine, env) = common::setup();
    let sum = env
        .new_function(0, |_, _, args| {
            let total: i32 = args.iter().filter_map(TaggedValue::as_i32).sum();
            Some(TaggedValue::Int(total * 1000 + args.len() as i32))
        })
        .unwrap();

    let short: Vec<TaggedValue> = (1..=16).map(TaggedValue::Int).collect();
    let long: Vec<TaggedValue> = (1..=40).map(TaggedValue::Int).collect();
    assert_eq!(
        env.call_function(&sum, None, &short, 0),
        Some(TaggedValue::Int(136 * 1000 + 16))
    );
    assert_eq!(
        env.call_function(&sum, None, &long, 0),
        Some(TaggedValue::Int(820 * 1000 + 40))
    );
}

#[test]
fn test_primitives_pass_through_native_calls() {
    let (_engine, env) = common::setup();
    let echo = env
        .new_function(FLAG_USE_UTF8, |_, _, args| args.first().cloned())
        .unwrap();
    let cases = [
        (TaggedValue::Null, TaggedValue::Null),
        (TaggedValue::Boolean(true), TaggedValue::Boolean(true)),
        (TaggedValue::Int(-7), TaggedValue::Int(-7)),
        (TaggedValue::UInt(5), TaggedValue::Int(5)),
        (TaggedValue::UInt(u32::MAX), TaggedValue::Float(u32::MAX as f64)),
        (TaggedValue::Float(2.5), TaggedValue::Float(2.5)),
        (TaggedValue::Float(8.0), TaggedValue::Int(8)),
        (TaggedValue::from("héllo"), TaggedValue::from("héllo")),
        (
            TaggedValue::Utf16("hi".encode_utf16().collect()),
            TaggedValue::from("hi"),
        ),
    ];
    for (input, expected) in cases {
        let output = env.call_function(&echo, None, &[input.clone()], FLAG_USE_UTF8);
        assert_eq!(output, Some(expected), "input {:?}", input);
    }

    let utf16 = env.call_function(&echo, None, &[TaggedValue::from("x")], 0);
    assert_eq!(utf16, Some(TaggedValue::Utf16(vec!['x' as u16])));
}

#[test]
fn test_receiver_defaults_to_global() {
    let (_engine, env) = common::setup();
    let global = env.global_object();
    let this_type = env
        .new_function(0, |env, this, _| {
            let this = this?;
            Some(TaggedValue::Int(env.object_type(&this) as i32))
        })
        .unwrap();
    assert_eq!(
        env.call_function(&this_type, None, &[], 0),
        Some(TaggedValue::Int(ValueType::Object as i32))
    );
    assert_eq!(env.object_type(&global), ValueType::Object);
}

#[test]
fn test_domain_callbacks_build_intermediate_objects() {
    let (_engine, env) = common::setup();
    assert!(env.register_callback_on_object(None, "app.math.add", 0, |_, _, args| {
        let a = args.first().and_then(TaggedValue::as_i32)?;
        let b = args.get(1).and_then(TaggedValue::as_i32)?;
        Some(TaggedValue::Int(a + b))
    }));
    assert!(env.register_callback_on_object(None, "app.math.neg", 0, |_, _, args| {
        args.first().and_then(TaggedValue::as_i32).map(|a| TaggedValue::Int(-a))
    }));
    assert!(!env.register_callback_on_object(None, "app..bad", 0, |_, _, _| None));
    assert!(!env.register_callback_on_object(None, "", 0, |_, _, _| None));

    let app = env.get_global_value("app", 0).unwrap().object().unwrap();
    let math = env.get_property_value(&app, "math", 0).unwrap().object().unwrap();
    let add = env.get_property_value(&math, "add", 0).unwrap();
    assert_eq!(add.value_type(), ValueType::Function);
    let add = add.object().unwrap();
    assert_eq!(
        env.call_function(&add, None, &[TaggedValue::Int(2), TaggedValue::Int(3)], 0),
        Some(TaggedValue::Int(5))
    );
    assert!(env.get_property_value(&math, "neg", 0).unwrap().object().is_some());
}

#[test]
fn test_domain_callback_receives_owner() {
    let (_engine, env) = common::setup();
    let owner = env.new_reference(&env.new_object()).unwrap();
    assert!(env.set_property_value(&owner, "tag", &TaggedValue::Int(99)));
    assert!(env.register_callback_on_object(Some(&owner), "read", 0, |env, this, _| {
        env.get_property_value(&this?, "tag", 0)
    }));
    let read = env.get_property_value(&owner, "read", 0).unwrap().object().unwrap();
    let stranger = env.new_object();
    assert_eq!(
        env.call_function(&read, Some(&stranger), &[], 0),
        Some(TaggedValue::Int(99))
    );
}

#[test]
fn test_script_results_and_properties() {
    let (_engine, env) = common::setup();
    let doc = env
        .execute_script(
            &TaggedValue::from(r#"{"n": 1.5, "name": "jsenv", "tags": ["a", "b"]}"#),
            Some("doc.json"),
            1,
            FLAG_USE_UTF8,
        )
        .unwrap();
    let doc = doc.object().unwrap();
    assert_eq!(
        env.get_property_value(&doc, "name", FLAG_USE_UTF8),
        Some(TaggedValue::from("jsenv"))
    );
    assert_eq!(env.get_property_value(&doc, "n", 0), Some(TaggedValue::Float(1.5)));
    assert_eq!(env.get_property_value(&doc, "missing", 0), Some(TaggedValue::Null));

    let tags = env.get_property_value(&doc, "tags", 0).unwrap().object().unwrap();
    assert_eq!(env.length(&tags), 2);
    assert_eq!(env.get_index(&tags, 1, FLAG_USE_UTF8), Some(TaggedValue::from("b")));

    let names = env.property_names(&doc).unwrap();
    assert_eq!(env.length(&names), 3);
    assert_eq!(env.get_index(&names, 2, FLAG_USE_UTF8), Some(TaggedValue::from("tags")));
}

#[test]
fn test_syntax_error_format() {
    let (_engine, env) = common::setup();
    let result = env.execute_script(&TaggedValue::from("{\n  \"a\": ]\n}"), Some("bad.json"), 10, 0);
    assert!(result.is_none());
    let exception = env.take_exception();
    assert_eq!(exception.kind, ExceptionKind::Engine);
    let mut lines = exception.message.lines();
    assert_eq!(lines.next(), Some("  \"a\": ]"));
    let location = lines.next().unwrap();
    assert!(location.starts_with("@bad.json:11(from "), "{}", location);
    assert!(location.ends_with(" )"), "{}", location);
    assert!(lines.next().unwrap().starts_with("SyntaxError: "));
}

#[test]
fn test_script_requires_string_source() {
    let (_engine, env) = common::setup();
    assert!(env.execute_script(&TaggedValue::Int(1), None, 0, 0).is_none());
    assert!(!env.has_exception());
}

#[test]
fn test_arrays_and_globals() {
    let (_engine, env) = common::setup();
    let array = env
        .new_array_with_values(&[TaggedValue::Int(1), TaggedValue::from("two")])
        .unwrap();
    assert_eq!(env.length(&array), 2);
    assert!(env.set_index(&array, 4, &TaggedValue::Boolean(false)));
    assert_eq!(env.length(&array), 5);
    assert_eq!(env.get_index(&array, 3, 0), Some(TaggedValue::Null));

    assert!(env.set_global_value("answer", &TaggedValue::Int(42)));
    assert_eq!(env.get_global_value("answer", 0), Some(TaggedValue::Int(42)));
    assert!(env.set_global(&TaggedValue::Int(7), &TaggedValue::Float(0.5)));
    assert_eq!(env.get_global(&TaggedValue::from("7"), 0), Some(TaggedValue::Float(0.5)));
}

#[test]
fn test_far_index_writes_throw_instead_of_growing() {
    let (_engine, env) = common::setup();
    let array = env.new_array(2);
    assert!(!env.set_index(&array, 3_000_000_000, &TaggedValue::Int(1)));
    let exception = env.take_exception();
    assert_eq!(exception.kind, ExceptionKind::Engine);
    assert!(exception.message.contains("RangeError"), "{}", exception.message);
    assert_eq!(env.length(&array), 2);

    assert!(!env.set_property_value(&array, "length", &TaggedValue::Int(-1)));
    assert!(env.take_exception().message.contains("Invalid array length"));
    assert!(env.set_property_value(&array, "length", &TaggedValue::Int(5)));
    assert_eq!(env.length(&array), 5);
}

#[test]
fn test_call_as_constructor() {
    let (_engine, env) = common::setup();
    let make = env
        .new_function(0, |env, this, args| {
            let this = this?;
            env.set_property_value(&this, "value", args.first()?);
            None
        })
        .unwrap();
    let made = env.call_as_constructor(&make, &[TaggedValue::Int(11)]).unwrap();
    assert_eq!(env.get_property_value(&made, "value", 0), Some(TaggedValue::Int(11)));
}
