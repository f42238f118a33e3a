//! Config command - print the effective configuration

use anyhow::{Context, Result};
use clap::Args;
use jsenv::JsEnvConfig;
use std::path::{Path, PathBuf};

use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Read this file instead of searching jsenv.toml / jsenv.json
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Fail if the configuration would be rejected
    #[arg(long)]
    pub validate: bool,
}

fn load(path: &Path) -> Result<JsEnvConfig> {
    let mut config = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => JsEnvConfig::from_json_file(path),
        _ => JsEnvConfig::from_toml_file(path),
    }
    .with_context(|| format!("failed to load {}", path.display()))?;
    config.apply_env_overrides();
    Ok(config)
}

pub fn run(args: ConfigArgs, format: OutputFormat) -> Result<()> {
    let config = match &args.file {
        Some(path) => load(path)?,
        None => JsEnvConfig::load_or_default(),
    };

    if args.validate {
        config.validate().context("configuration rejected")?;
    }

    match format {
        OutputFormat::Text => print!("{}", config.to_toml()?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}
