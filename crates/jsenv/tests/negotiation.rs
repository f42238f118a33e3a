mod common;

use jsenv::engine::Engine;
use jsenv::{negotiate, JsException, TaggedValue, JSENV_VERSION, JSENV_VERSION_V1000};
use jsenv_heap::HeapEngine;
use std::rc::Rc;

fn engine() -> Rc<dyn Engine> {
    common::init_logging();
    Rc::new(HeapEngine::new())
}

#[test]
fn test_current_version() {
    let engine = engine();
    let negotiated = negotiate(&engine, JSENV_VERSION).unwrap();
    assert_eq!(negotiated.version(), JSENV_VERSION);
    assert!(negotiated.current().is_some());
}

#[test]
fn test_v1000_shim_hides_current_surface() {
    let engine = engine();
    let negotiated = negotiate(&engine, JSENV_VERSION_V1000).unwrap();
    assert_eq!(negotiated.version(), JSENV_VERSION_V1000);
    assert!(negotiated.current().is_none());

    let env = negotiated.as_v1000();
    let result = env.execute_script(&TaggedValue::from("[1, 2]"), Some("v1000.json"), 1);
    assert!(matches!(result, Some(TaggedValue::Array(_))));
    env.set_exception(JsException::native("host failure"));
    assert!(env.has_exception());
    env.clear_exception();
    assert!(!env.has_exception());
}

#[test]
fn test_unsupported_versions_are_refused() {
    let engine = engine();
    for version in [0, 999, 1001, 1050, 1099, -1100] {
        assert!(negotiate(&engine, version).is_none(), "version {}", version);
    }
}

#[test]
fn test_newer_versions_get_current_surface() {
    let engine = engine();
    for version in [JSENV_VERSION + 1, JSENV_VERSION + 100, i32::MAX] {
        let negotiated = negotiate(&engine, version).unwrap();
        assert_eq!(negotiated.version(), JSENV_VERSION, "version {}", version);
        let env = negotiated.current().unwrap();
        let value = env.execute_script(&TaggedValue::from("[1]"), None, 1, 0);
        assert!(matches!(value, Some(TaggedValue::Array(_))));
    }
}

#[test]
fn test_both_versions_share_one_environment() {
    let engine = engine();
    let current = negotiate(&engine, JSENV_VERSION).unwrap();
    let legacy = negotiate(&engine, JSENV_VERSION_V1000).unwrap();

    legacy
        .as_v1000()
        .set_exception(JsException::native("seen by both"));
    let env = current.current().unwrap();
    assert_eq!(env.take_exception().message, "seen by both");
    assert!(!legacy.as_v1000().has_exception());

    let refs = env.reference_count();
    drop(legacy);
    assert_eq!(env.reference_count(), refs - 1);
}

#[test]
fn test_environment_outlives_teardown_until_released() {
    let engine = engine();
    let negotiated = negotiate(&engine, JSENV_VERSION).unwrap();
    let env = negotiated.current().unwrap().clone();
    jsenv::teardown(&*engine);
    assert!(!env.is_destroyed());
    jsenv::teardown(&*engine);
    assert!(!env.is_destroyed());

    drop(negotiated);
    assert!(!env.is_destroyed());
    let observer = env.acquire().unwrap();
    drop(env);
    assert!(!observer.is_destroyed());
    assert_eq!(observer.reference_count(), 1);
}
