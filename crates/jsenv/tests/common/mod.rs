#![allow(dead_code)]

use jsenv::engine::Engine;
use jsenv::EnvRef;
use jsenv_heap::HeapEngine;
use std::rc::Rc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A fresh heap engine and its current-version environment.
pub fn setup() -> (Rc<dyn Engine>, EnvRef) {
    init_logging();
    let engine: Rc<dyn Engine> = Rc::new(HeapEngine::new());
    let env = jsenv::env::attach(&engine).expect("environment attaches");
    (engine, env)
}

pub fn collect(engine: &Rc<dyn Engine>) {
    engine.collect_garbage();
}
