//! Run command - execute a script through a negotiated environment

use anyhow::{anyhow, Context, Result};
use clap::Args;
use console::style;
use jsenv::{Engine, Environment, JsEnvConfig, JsException, ObjectHandle, TaggedValue, ValueType};
use jsenv_heap::HeapEngine;
use serde_json::Value;
use std::path::PathBuf;
use std::rc::Rc;

use crate::OutputFormat;

/// Nesting below this depth is summarized instead of expanded.
const MAX_DEPTH: usize = 16;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script to execute
    pub file: PathBuf,

    /// Contract version to negotiate (defaults to the configured one)
    #[arg(long = "abi")]
    pub abi: Option<i32>,

    /// Line number reported for the first line of the script
    #[arg(long, default_value_t = 1)]
    pub start_line: i32,

    /// Pass the source and read strings back as UTF-16
    #[arg(long)]
    pub utf16: bool,
}

pub fn run(args: RunArgs, format: OutputFormat, use_color: bool, quiet: bool) -> Result<()> {
    let config = JsEnvConfig::load_or_default();
    config.validate().context("invalid jsenv configuration")?;
    let version = args.abi.unwrap_or(config.environment.default_version);

    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let code = if args.utf16 {
        TaggedValue::Utf16(source.encode_utf16().collect())
    } else {
        TaggedValue::from(source.as_str())
    };
    let file_name = args.file.display().to_string();
    let flags = if args.utf16 { 0 } else { config.environment.read_flags() };

    let engine: Rc<dyn Engine> = Rc::new(HeapEngine::with_config(config.heap.clone()));
    let negotiated = jsenv::negotiate(&engine, version)
        .ok_or_else(|| anyhow!("engine does not serve jsenv version {}", version))?;
    log::info!("negotiated jsenv version {}", negotiated.version());

    let outcome = match negotiated.current() {
        Some(env) => match env.execute_script(&code, Some(&file_name), args.start_line, flags) {
            Some(value) => {
                env.run_microtasks();
                Ok(describe(env, &value, flags, 0))
            }
            None => Err(env.exception()),
        },
        None => {
            let surface = negotiated.as_v1000();
            match surface.execute_script(&code, Some(&file_name), args.start_line) {
                Some(value) => Ok(describe_primitive(&value)),
                None => Err(surface.exception()),
            }
        }
    };

    drop(negotiated);
    jsenv::teardown(&*engine);

    match format {
        OutputFormat::Text => match &outcome {
            Ok(value) if !quiet => {
                let text = serde_json::to_string_pretty(value)?;
                if use_color {
                    println!("{}", style(text).green());
                } else {
                    println!("{}", text);
                }
            }
            Ok(_) => {}
            Err(exception) => print_exception(exception, use_color),
        },
        OutputFormat::Json => {
            let output = match &outcome {
                Ok(value) => serde_json::json!({
                    "success": true,
                    "version": version,
                    "result": value,
                }),
                Err(exception) => serde_json::json!({
                    "success": false,
                    "version": version,
                    "exception": {
                        "kind": exception.kind as i32,
                        "message": exception.message,
                    },
                }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    match outcome {
        Ok(_) => Ok(()),
        Err(_) => Err(anyhow!("{} failed", file_name)),
    }
}

fn print_exception(exception: &JsException, use_color: bool) {
    if use_color {
        eprintln!("{} {:?}", style("Uncaught").red().bold(), exception.kind);
        eprintln!("{}", style(&exception.message).red());
    } else {
        eprintln!("Uncaught {:?}", exception.kind);
        eprintln!("{}", exception.message);
    }
}

/// Renders primitives; objects are only named, since the version 1000
/// surface cannot look inside them.
fn describe_primitive(value: &TaggedValue) -> Value {
    match value {
        TaggedValue::Null => Value::Null,
        TaggedValue::Boolean(b) => Value::from(*b),
        TaggedValue::Int(i) => Value::from(*i),
        TaggedValue::UInt(u) => Value::from(*u),
        TaggedValue::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
        TaggedValue::Utf8(_) | TaggedValue::Utf16(_) => {
            Value::from(value.to_string_lossy().unwrap_or_default())
        }
        other => Value::from(format!("[{:?}]", other.value_type())),
    }
}

fn describe(env: &Environment, value: &TaggedValue, flags: u32, depth: usize) -> Value {
    match value.object() {
        Some(handle) => describe_object(env, &handle, flags, depth),
        None => describe_primitive(value),
    }
}

fn describe_object(env: &Environment, handle: &ObjectHandle, flags: u32, depth: usize) -> Value {
    let kind = env.object_type(handle);
    if depth >= MAX_DEPTH {
        return Value::from(format!("[{:?}]", kind));
    }
    match kind {
        ValueType::Array => {
            let elements = (0..env.length(handle) as u32)
                .map(|index| match env.get_index(handle, index, flags) {
                    Some(element) => describe(env, &element, flags, depth + 1),
                    None => Value::Null,
                })
                .collect();
            Value::Array(elements)
        }
        ValueType::Object => {
            let mut map = serde_json::Map::new();
            let Some(names) = env.property_names(handle) else {
                return Value::Object(map);
            };
            for index in 0..env.length(&names) as u32 {
                let Some(name) = env.get_index(&names, index, flags) else {
                    continue;
                };
                let key = name.to_string_lossy().unwrap_or_default();
                let property = env
                    .get_property(handle, &name, flags)
                    .map_or(Value::Null, |v| describe(env, &v, flags, depth + 1));
                map.insert(key, property);
            }
            Value::Object(map)
        }
        other => Value::from(format!("[{:?}]", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsenv::{FLAG_USE_UTF8, JSENV_VERSION, JSENV_VERSION_V1000};

    #[test]
    fn test_describe_expands_objects_and_arrays() {
        let engine: Rc<dyn Engine> = Rc::new(HeapEngine::new());
        let negotiated = jsenv::negotiate(&engine, JSENV_VERSION).unwrap();
        let env = negotiated.current().unwrap();
        let code = TaggedValue::from(r#"{"a": [1, 2.5, null], "b": {"c": "x"}}"#);
        let value = env
            .execute_script(&code, Some("doc.json"), 1, FLAG_USE_UTF8)
            .unwrap();
        assert_eq!(
            describe(env, &value, FLAG_USE_UTF8, 0),
            serde_json::json!({"a": [1, 2.5, null], "b": {"c": "x"}})
        );
    }

    #[test]
    fn test_describe_utf16_strings() {
        let engine: Rc<dyn Engine> = Rc::new(HeapEngine::new());
        let negotiated = jsenv::negotiate(&engine, JSENV_VERSION).unwrap();
        let env = negotiated.current().unwrap();
        let code = TaggedValue::Utf16("\"h\u{e9}\"".encode_utf16().collect());
        let value = env.execute_script(&code, None, 1, 0).unwrap();
        assert!(matches!(value, TaggedValue::Utf16(_)));
        assert_eq!(describe(env, &value, 0, 0), Value::from("h\u{e9}"));
    }

    #[test]
    fn test_v1000_results_name_objects() {
        let engine: Rc<dyn Engine> = Rc::new(HeapEngine::new());
        let negotiated = jsenv::negotiate(&engine, JSENV_VERSION_V1000).unwrap();
        let value = negotiated
            .as_v1000()
            .execute_script(&TaggedValue::from("[1, 2]"), None, 1)
            .unwrap();
        assert_eq!(describe_primitive(&value), Value::from("[Array]"));
        assert_eq!(describe_primitive(&TaggedValue::Float(f64::NAN)), Value::Null);
    }
}
