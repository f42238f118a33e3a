//! Versioned native boundary for embedded script engines
//!
//! Host code talks to a script engine through an [`Environment`], obtained by
//! negotiating a contract version against an engine context:
//! - Values cross the boundary as [`TaggedValue`]s
//! - Objects are referenced by [`ObjectHandle`]s, transient or persistent
//! - Native functions and classes are registered through index-addressed
//!   callback tables and invoked by the engine through a single dispatcher
//! - Errors travel through the environment's single exception slot
//!
//! The engine itself sits behind the [`Engine`] trait. The C ABI lives in
//! [`ffi`] and the fixed-layout wire value in [`wire`].

pub mod callback;
pub mod class;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod exception;
pub mod ffi;
pub mod handle;
pub mod loader;
pub mod marshal;
pub mod value;
pub mod version;
pub mod weak;
pub mod wire;

pub use class::{ClassDefinition, CompiledClass, JsClass};
pub use config::JsEnvConfig;
pub use engine::{Engine, PromiseState, TypedArrayKind};
pub use env::{teardown, EnvRef, Environment};
pub use error::{ClassError, ConfigError, ConversionError, JsEnvError, LoadError};
pub use exception::{ExceptionKind, JsException};
pub use handle::{ObjectHandle, RawHandle};
pub use loader::EntryPoint;
pub use value::{TaggedValue, ValueType, FLAG_USE_UTF8};
pub use version::{negotiate, JsEnvV1000, NegotiatedEnv, JSENV_VERSION, JSENV_VERSION_V1000};
pub use weak::{WeakCallback, WeakCallbackInfo};

// C entry points re-exported for engine crates that build a cdylib
pub use ffi::{get_jsenv, register_context, unregister_context, ContextHandle, JsEnvHandle};
pub use wire::{jsenv_value_release, RawValue};
