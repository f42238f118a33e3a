//! Handshake command - open an engine library and negotiate through its entry point

use anyhow::{Context, Result};
use clap::Args;
use console::{style, Emoji};
use jsenv::ffi::{ContextHandle, JsEnvHandle};
use jsenv::{EntryPoint, JsEnvConfig, JSENV_VERSION, JSENV_VERSION_V1000};
use std::path::PathBuf;

use crate::OutputFormat;

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "[FAIL] ");

type ContextNewFn = unsafe extern "C" fn() -> ContextHandle;
type ContextTeardownFn = unsafe extern "C" fn(ContextHandle) -> bool;
type GetVersionFn = unsafe extern "C" fn(*mut JsEnvHandle) -> i32;
type ReleaseFn = unsafe extern "C" fn(*mut JsEnvHandle);

#[derive(Args, Debug)]
pub struct HandshakeArgs {
    /// Engine library to open (defaults to the configured one)
    #[arg(long)]
    pub library: Option<PathBuf>,

    /// Export that creates an engine context
    #[arg(long, default_value = "jsenv_heap_context_new")]
    pub context_symbol: String,

    /// Versions to request (defaults to every published version)
    #[arg(long = "abi", value_delimiter = ',')]
    pub abi: Vec<i32>,
}

struct Attempt {
    requested: i32,
    reported: Option<i32>,
}

pub fn run(args: HandshakeArgs, format: OutputFormat, use_color: bool) -> Result<()> {
    let mut config = JsEnvConfig::load_or_default();
    if let Some(library) = &args.library {
        config.library.so_name = library.display().to_string();
    }

    let entry = EntryPoint::load_validated(&config)
        .with_context(|| format!("failed to load {}", config.library.so_name))?;

    // SAFETY: the signatures match the exports of a jsenv engine library.
    let (context_new, teardown, get_version, release) = unsafe {
        (
            *entry.symbol::<ContextNewFn>(&args.context_symbol)?,
            *entry.symbol::<ContextTeardownFn>("jsenv_context_teardown")?,
            *entry.symbol::<GetVersionFn>("jsenv_get_version")?,
            *entry.symbol::<ReleaseFn>("jsenv_release")?,
        )
    };

    let versions = if args.abi.is_empty() {
        vec![JSENV_VERSION, JSENV_VERSION_V1000]
    } else {
        args.abi.clone()
    };

    let context = unsafe { context_new() };
    let attempts: Vec<Attempt> = versions
        .iter()
        .map(|&requested| {
            let reported = entry.get_jsenv(context, requested).ok().map(|env| unsafe {
                let version = get_version(env);
                release(env);
                version
            });
            Attempt { requested, reported }
        })
        .collect();
    unsafe {
        teardown(context);
    }

    match format {
        OutputFormat::Text => {
            println!("jsenv handshake: {}\n", entry.path().display());
            for attempt in &attempts {
                match attempt.reported {
                    Some(version) if use_color => println!(
                        "  {}version {}: {}",
                        CHECK,
                        attempt.requested,
                        style(format!("served as {}", version)).green()
                    ),
                    Some(version) => println!("  [OK] version {}: served as {}", attempt.requested, version),
                    None if use_color => println!(
                        "  {}version {}: {}",
                        CROSS,
                        attempt.requested,
                        style("refused").red()
                    ),
                    None => println!("  [FAIL] version {}: refused", attempt.requested),
                }
            }
        }
        OutputFormat::Json => {
            let results: Vec<_> = attempts
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "requested": p.requested,
                        "served": p.reported.is_some(),
                        "version": p.reported,
                    })
                })
                .collect();
            let output = serde_json::json!({
                "library": entry.path().display().to_string(),
                "entry_symbol": config.library.entry_symbol,
                "versions": results,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
