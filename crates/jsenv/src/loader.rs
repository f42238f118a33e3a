//! Resolving the boundary entry point from a shared library
//!
//! Hosts that do not link an engine statically open it at run time. The
//! library is named by the configuration (`JSENV_SO_NAME` overrides it) and
//! must export `get_jsenv`.

use crate::config::JsEnvConfig;
use crate::error::{self, LoadError};
use crate::ffi::{ContextHandle, JsEnvHandle};
use libloading::{Library, Symbol};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};

/// Signature of the exported negotiation function.
pub type GetJsEnvFn = unsafe extern "C" fn(context: ContextHandle, version: i32) -> *mut JsEnvHandle;

/// Process-wide entry point, resolved on first use
static ENTRY_POINT: OnceCell<EntryPoint> = OnceCell::new();

/// An opened engine library and its negotiation function.
pub struct EntryPoint {
    path: PathBuf,
    get_jsenv: GetJsEnvFn,
    default_version: i32,
    // Must outlive `get_jsenv`.
    library: Library,
}

impl EntryPoint {
    /// Opens the library named by `config` and resolves its entry symbol.
    pub fn load(config: &JsEnvConfig) -> Result<Self, LoadError> {
        let path = PathBuf::from(&config.library.so_name);
        let symbol = config.library.entry_symbol.as_str();

        log::debug!("loading jsenv library {}", path.display());
        // SAFETY: loading a library runs its initializers; the configured
        // library is trusted to be a jsenv engine.
        let library = unsafe { Library::new(&path) }.map_err(|source| {
            log::error!("cannot open {}: {}", path.display(), source);
            LoadError::Open {
                path: path.clone(),
                source,
            }
        })?;

        let get_jsenv = unsafe {
            let entry: Symbol<GetJsEnvFn> =
                library
                    .get(symbol.as_bytes())
                    .map_err(|source| LoadError::Symbol {
                        symbol: symbol.to_string(),
                        source,
                    })?;
            *entry
        };

        Ok(EntryPoint {
            path,
            get_jsenv,
            default_version: config.environment.default_version,
            library,
        })
    }

    /// Validates `config` before loading.
    pub fn load_validated(config: &JsEnvConfig) -> error::Result<Self> {
        config.validate()?;
        Ok(Self::load(config)?)
    }

    /// The entry point for the whole process, loaded with `config` the
    /// first time it is asked for.
    pub fn global(config: &JsEnvConfig) -> Result<&'static EntryPoint, LoadError> {
        ENTRY_POINT.get_or_try_init(|| Self::load(config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Negotiates `version` for `context`. The returned handle must be
    /// given back to the library's `jsenv_release`.
    pub fn get_jsenv(&self, context: ContextHandle, version: i32) -> Result<*mut JsEnvHandle, LoadError> {
        // SAFETY: the symbol was resolved with this signature and the
        // library is kept open by `self`.
        let env = unsafe { (self.get_jsenv)(context, version) };
        if env.is_null() {
            log::warn!("{} refused version {}", self.path.display(), version);
            return Err(LoadError::Negotiation(version));
        }
        Ok(env)
    }

    /// Negotiates the configured default version.
    pub fn get_default(&self, context: ContextHandle) -> Result<*mut JsEnvHandle, LoadError> {
        self.get_jsenv(context, self.default_version)
    }

    /// Resolves another export of the library.
    ///
    /// # Safety
    /// `T` must match the exported symbol's real type.
    pub unsafe fn symbol<T>(&self, name: &str) -> Result<Symbol<'_, T>, LoadError> {
        self.library
            .get(name.as_bytes())
            .map_err(|source| LoadError::Symbol {
                symbol: name.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_reports_path() {
        let mut config = JsEnvConfig::default();
        config.library.so_name = "/nonexistent/libjsenv_missing.so".to_string();
        match EntryPoint::load(&config) {
            Err(LoadError::Open { path, .. }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/libjsenv_missing.so"))
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("loading a missing library succeeded"),
        }
    }

    #[test]
    fn test_invalid_config_is_rejected_before_loading() {
        let mut config = JsEnvConfig::default();
        config.environment.default_version = 1050;
        assert!(matches!(
            EntryPoint::load_validated(&config),
            Err(crate::error::JsEnvError::Config(_))
        ));

        config.environment.default_version = crate::version::JSENV_VERSION;
        config.library.so_name = "/nonexistent/libjsenv_missing.so".to_string();
        assert!(matches!(
            EntryPoint::load_validated(&config),
            Err(crate::error::JsEnvError::Load(LoadError::Open { .. }))
        ));
    }
}
