//! Boundary configuration
//!
//! Loaded from `jsenv.toml` or `jsenv.json` in the working directory, with
//! environment variables taking precedence over the file.

use crate::error::{ConfigError, ConfigResult};
use crate::version::{self, JSENV_VERSION};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

pub const ENV_SO_NAME: &str = "JSENV_SO_NAME";
pub const ENV_VERSION: &str = "JSENV_VERSION";
pub const ENV_UTF8: &str = "JSENV_UTF8";
pub const ENV_GC_THRESHOLD: &str = "JSENV_HEAP_GC_THRESHOLD";

pub const DEFAULT_SO_NAME: &str = "libjsenv_heap.so";
pub const DEFAULT_ENTRY_SYMBOL: &str = "get_jsenv";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JsEnvConfig {
    pub library: LibraryConfig,
    pub environment: EnvironmentConfig,
    pub heap: HeapConfig,
}

/// Where the engine library lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub so_name: String,
    pub entry_symbol: String,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            so_name: DEFAULT_SO_NAME.to_string(),
            entry_symbol: DEFAULT_ENTRY_SYMBOL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Version requested when the host does not name one.
    pub default_version: i32,
    /// Read strings as UTF-8 unless a call says otherwise.
    pub utf8_strings: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            default_version: JSENV_VERSION,
            utf8_strings: true,
        }
    }
}

impl EnvironmentConfig {
    /// Flags for host-initiated reads.
    pub fn read_flags(&self) -> u32 {
        if self.utf8_strings {
            crate::value::FLAG_USE_UTF8
        } else {
            0
        }
    }
}

/// Tuning for the reference heap engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Allocations between automatic collections at scope exit. 0 disables.
    pub gc_threshold: usize,
    pub max_scope_depth: usize,
    /// Longest array a script may grow. Longer writes throw a RangeError.
    pub max_array_length: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 0,
            max_scope_depth: 1024,
            max_array_length: 1 << 24,
        }
    }
}

impl JsEnvConfig {
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Applies `JSENV_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Applies overrides from `lookup`. Unparsable values are logged and
    /// ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(so_name) = lookup(ENV_SO_NAME) {
            if !so_name.is_empty() {
                self.library.so_name = so_name;
            }
        }
        if let Some(val) = lookup(ENV_VERSION) {
            match val.trim().parse() {
                Ok(version) => self.environment.default_version = version,
                Err(_) => log::warn!("ignoring {}={}: not an integer", ENV_VERSION, val),
            }
        }
        if let Some(val) = lookup(ENV_UTF8) {
            match parse_flag(&val) {
                Some(flag) => self.environment.utf8_strings = flag,
                None => log::warn!("ignoring {}={}: not a boolean", ENV_UTF8, val),
            }
        }
        if let Some(val) = lookup(ENV_GC_THRESHOLD) {
            match val.trim().parse() {
                Ok(threshold) => self.heap.gc_threshold = threshold,
                Err(_) => log::warn!("ignoring {}={}: not a count", ENV_GC_THRESHOLD, val),
            }
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !version::is_supported(self.environment.default_version) {
            return Err(ConfigError::Invalid {
                key: "environment.default_version".to_string(),
                reason: format!("version {} is not served", self.environment.default_version),
            });
        }
        if self.library.so_name.is_empty() {
            return Err(ConfigError::Invalid {
                key: "library.so_name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.library.entry_symbol.is_empty() {
            return Err(ConfigError::Invalid {
                key: "library.entry_symbol".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.heap.max_array_length == 0 {
            return Err(ConfigError::Invalid {
                key: "heap.max_array_length".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.heap.max_scope_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "heap.max_scope_depth".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Searches `./jsenv.toml`, then `./jsenv.json`, then falls back to
    /// defaults. Environment overrides are applied last.
    pub fn load_or_default() -> Self {
        let mut config = if let Ok(config) = Self::from_toml_file("jsenv.toml") {
            log::debug!("loaded config from jsenv.toml");
            config
        } else if let Ok(config) = Self::from_json_file("jsenv.json") {
            log::debug!("loaded config from jsenv.json");
            config
        } else {
            log::debug!("using default configuration");
            Self::default()
        };
        config.apply_env_overrides();
        config
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
