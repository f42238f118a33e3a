//! Error types for the boundary's Rust-facing API

use std::path::PathBuf;
use thiserror::Error;

/// Local, non-fatal conversion failure. Never touches the exception slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("engine value of kind {0} has no boundary representation")]
    Unsupported(&'static str),
    #[error("unknown value type code {0}")]
    UnknownValueType(i32),
    #[error("handle does not reference a live object")]
    EmptyHandle,
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Failures of class compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassError {
    #[error("property '{0}' has neither a getter nor a setter")]
    EmptyProperty(String),
    #[error("class '{0}' has a parent but no constructor")]
    ParentWithoutConstructor(String),
    #[error("parent class '{0}' is not constructible")]
    ParentNotConstructible(String),
    #[error("engine refused to create template for '{0}'")]
    TemplateCreation(String),
    #[error("engine refused to install member '{member}' on '{class}'")]
    MemberInstallation { class: String, member: String },
}

/// Failures resolving the boundary entry point from a shared library.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to open shared library {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("symbol '{symbol}' not found: {source}")]
    Symbol {
        symbol: String,
        #[source]
        source: libloading::Error,
    },
    #[error("entry point returned no environment for version {0}")]
    Negotiation(i32),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Failed to serialize TOML config: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level error for the Rust-facing API.
#[derive(Error, Debug)]
pub enum JsEnvError {
    #[error(transparent)]
    Class(#[from] ClassError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

pub type Result<T> = std::result::Result<T, JsEnvError>;
