//! ABI version negotiation
//!
//! Hosts ask for a contract version and get either the current environment
//! or a shim frozen to an older, still supported method set. Anything else
//! gets nothing.

use crate::engine::Engine;
use crate::env::{self, EnvRef, Environment};
use crate::exception::JsException;
use crate::handle::ObjectHandle;
use crate::value::TaggedValue;
use std::ffi::c_void;
use std::rc::Rc;

/// Latest contract version.
pub const JSENV_VERSION: i32 = 1100;

/// The first published contract, still served through a shim.
pub const JSENV_VERSION_V1000: i32 = 1000;

/// The version 1000 method set.
pub trait JsEnvV1000 {
    fn version(&self) -> i32;
    fn dispatch_command(&self, command: i32, data: *mut c_void) -> *mut c_void;

    fn has_exception(&self) -> bool;
    fn exception(&self) -> JsException;
    fn set_exception(&self, exception: JsException);
    fn clear_exception(&self);

    fn register_callback_on_object(
        &self,
        owner: Option<&ObjectHandle>,
        domain: &str,
        flags: u32,
        callback: Box<dyn Fn(&Environment, Option<ObjectHandle>, &[TaggedValue]) -> Option<TaggedValue>>,
    ) -> bool;

    fn execute_script(
        &self,
        code: &TaggedValue,
        file_name: Option<&str>,
        start_line: i32,
    ) -> Option<TaggedValue>;
}

impl JsEnvV1000 for Environment {
    fn version(&self) -> i32 {
        Environment::version(self)
    }

    fn dispatch_command(&self, command: i32, data: *mut c_void) -> *mut c_void {
        Environment::dispatch_command(self, command, data)
    }

    fn has_exception(&self) -> bool {
        Environment::has_exception(self)
    }

    fn exception(&self) -> JsException {
        Environment::exception(self)
    }

    fn set_exception(&self, exception: JsException) {
        Environment::set_exception(self, exception)
    }

    fn clear_exception(&self) {
        Environment::clear_exception(self)
    }

    fn register_callback_on_object(
        &self,
        owner: Option<&ObjectHandle>,
        domain: &str,
        flags: u32,
        callback: Box<dyn Fn(&Environment, Option<ObjectHandle>, &[TaggedValue]) -> Option<TaggedValue>>,
    ) -> bool {
        Environment::register_callback_on_object(self, owner, domain, flags, callback)
    }

    fn execute_script(
        &self,
        code: &TaggedValue,
        file_name: Option<&str>,
        start_line: i32,
    ) -> Option<TaggedValue> {
        Environment::execute_script(self, code, file_name, start_line, 0)
    }
}

/// Narrows the current environment to the version 1000 contract.
pub struct EnvV1000 {
    inner: EnvRef,
}

impl JsEnvV1000 for EnvV1000 {
    fn version(&self) -> i32 {
        JSENV_VERSION_V1000
    }

    fn dispatch_command(&self, command: i32, data: *mut c_void) -> *mut c_void {
        self.inner.dispatch_command(command, data)
    }

    fn has_exception(&self) -> bool {
        self.inner.has_exception()
    }

    fn exception(&self) -> JsException {
        self.inner.exception()
    }

    fn set_exception(&self, exception: JsException) {
        self.inner.set_exception(exception)
    }

    fn clear_exception(&self) {
        self.inner.clear_exception()
    }

    fn register_callback_on_object(
        &self,
        owner: Option<&ObjectHandle>,
        domain: &str,
        flags: u32,
        callback: Box<dyn Fn(&Environment, Option<ObjectHandle>, &[TaggedValue]) -> Option<TaggedValue>>,
    ) -> bool {
        self.inner
            .register_callback_on_object(owner, domain, flags, callback)
    }

    fn execute_script(
        &self,
        code: &TaggedValue,
        file_name: Option<&str>,
        start_line: i32,
    ) -> Option<TaggedValue> {
        self.inner.execute_script(code, file_name, start_line, 0)
    }
}

/// The result of a successful negotiation. Holds one environment reference
/// and releases it on drop.
pub enum NegotiatedEnv {
    Current(EnvRef),
    V1000(EnvV1000),
}

impl NegotiatedEnv {
    pub fn version(&self) -> i32 {
        self.as_v1000().version()
    }

    /// The version 1000 view, available at every version.
    pub fn as_v1000(&self) -> &dyn JsEnvV1000 {
        match self {
            NegotiatedEnv::Current(env) => &**env,
            NegotiatedEnv::V1000(shim) => shim,
        }
    }

    /// The full environment, only when the current version was negotiated.
    pub fn current(&self) -> Option<&EnvRef> {
        match self {
            NegotiatedEnv::Current(env) => Some(env),
            NegotiatedEnv::V1000(_) => None,
        }
    }

    /// The underlying environment regardless of the negotiated surface.
    pub(crate) fn environment(&self) -> &Environment {
        match self {
            NegotiatedEnv::Current(env) => &**env,
            NegotiatedEnv::V1000(shim) => &*shim.inner,
        }
    }
}

/// Wraps an existing environment reference in the surface for `version`.
pub(crate) fn narrow(env: EnvRef, version: i32) -> NegotiatedEnv {
    if version == JSENV_VERSION_V1000 {
        NegotiatedEnv::V1000(EnvV1000 { inner: env })
    } else {
        NegotiatedEnv::Current(env)
    }
}

/// Whether `version` can be served. Anything at or above the latest
/// published version gets the current surface.
pub fn is_supported(version: i32) -> bool {
    version >= JSENV_VERSION || version == JSENV_VERSION_V1000
}

/// Resolves `version` against the context's environment, creating the
/// environment on first use. Versions newer than the latest are served the
/// current surface; unsupported versions yield `None`.
pub fn negotiate(engine: &Rc<dyn Engine>, version: i32) -> Option<NegotiatedEnv> {
    if !is_supported(version) {
        log::warn!(
            "unsupported jsenv version {} (latest {}, also serving {})",
            version,
            JSENV_VERSION,
            JSENV_VERSION_V1000
        );
        return None;
    }

    env::attach(engine).map(|env| narrow(env, version))
}
