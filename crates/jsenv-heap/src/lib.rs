//! Reference engine for the jsenv boundary
//!
//! `jsenv-heap` is a small single-threaded object heap that implements
//! [`jsenv::Engine`]: generational object slots, local scopes, strong and
//! weak persistent handles, class templates, array buffers and typed array
//! views, promises with a microtask queue, and JSON documents as scripts.
//!
//! Built as a `cdylib` it is a loadable environment library. It exports the
//! boundary's `get_jsenv` entry point and every `jsenv_*` function, plus
//! [`jsenv_heap_context_new`] and [`jsenv_heap_context_destroy`] for hosts
//! that need a context to hand to `get_jsenv`.

pub mod engine;
pub mod heap;
pub mod object;
pub mod promise;
pub mod script;

pub use engine::{HeapEngine, COMMAND_COLLECT_GARBAGE};
pub use jsenv::ffi::get_jsenv;

use jsenv::config::JsEnvConfig;
use jsenv::ffi::{register_context, unregister_context, ContextHandle};
use std::rc::Rc;

/// Creates a heap engine context on the calling thread.
///
/// Heap settings come from `jsenv.toml`/`jsenv.json` and the `JSENV_*`
/// environment variables.
#[no_mangle]
pub extern "C" fn jsenv_heap_context_new() -> ContextHandle {
    let config = JsEnvConfig::load_or_default();
    let engine = HeapEngine::with_config(config.heap);
    let context = register_context(Rc::new(engine));
    log::debug!("created heap context {}", context);
    context
}

/// Tears down a context created by [`jsenv_heap_context_new`]. Returns false
/// for an unknown context.
#[no_mangle]
pub extern "C" fn jsenv_heap_context_destroy(context: ContextHandle) -> bool {
    unregister_context(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_lifecycle() {
        let context = jsenv_heap_context_new();
        assert_ne!(context, 0);
        let env = get_jsenv(context, jsenv::JSENV_VERSION);
        assert!(!env.is_null());
        unsafe { jsenv::ffi::jsenv_release(env) };
        assert!(jsenv_heap_context_destroy(context));
        assert!(!jsenv_heap_context_destroy(context));
        assert!(get_jsenv(context, jsenv::JSENV_VERSION).is_null());
    }
}
