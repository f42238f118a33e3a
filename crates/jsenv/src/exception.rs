//! Exception slot contents and engine-throw formatting

use crate::engine::EngineThrow;
use std::fmt::Write as _;

/// Kind of the exception currently held by an environment.
#[repr(i32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    #[default]
    None = 0,
    /// A script-level throw.
    Engine = 1,
    /// Raised by host code or by the boundary itself.
    NativeRuntime = 2,
}

impl ExceptionKind {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExceptionKind::None),
            1 => Some(ExceptionKind::Engine),
            2 => Some(ExceptionKind::NativeRuntime),
            _ => None,
        }
    }
}

/// Contents of an environment's single exception slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JsException {
    pub kind: ExceptionKind,
    pub message: String,
}

impl JsException {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        JsException {
            kind,
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::Engine, message)
    }

    pub fn native(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::NativeRuntime, message)
    }

    pub fn is_set(&self) -> bool {
        self.kind != ExceptionKind::None
    }
}

/// Renders a script-level throw into exception-slot text.
///
/// With location details the layout is the offending source line (or
/// `No source line`), then `@file:line(from start to end )`, then the stack
/// text when the engine has one. Without location details it is the thrown
/// value's string form.
pub fn format_engine_throw(throw: &EngineThrow) -> String {
    let Some(message) = &throw.message else {
        return throw.text.clone();
    };

    let mut out = String::new();
    match &message.source_line {
        Some(line) => out.push_str(line),
        None => out.push_str("No source line"),
    }
    out.push('\n');
    let _ = writeln!(
        out,
        "@{}:{}(from {} to {} )",
        message.resource_name, message.line, message.start, message.end
    );
    if let Some(stack) = &throw.stack {
        out.push_str(stack);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineValue, ThrowMessage};

    fn throw(message: Option<ThrowMessage>, stack: Option<&str>) -> EngineThrow {
        EngineThrow {
            value: EngineValue::Null,
            text: "Error: boom".to_string(),
            message,
            stack: stack.map(str::to_string),
        }
    }

    #[test]
    fn test_format_without_message() {
        assert_eq!(format_engine_throw(&throw(None, Some("ignored"))), "Error: boom");
    }

    #[test]
    fn test_format_with_location() {
        let message = ThrowMessage {
            resource_name: "app.json".to_string(),
            line: 3,
            start: 10,
            end: 11,
            source_line: Some("  \"a\": ,".to_string()),
        };
        let text = format_engine_throw(&throw(Some(message), Some("Error: boom\n    at app.json:3")));
        assert_eq!(
            text,
            "  \"a\": ,\n@app.json:3(from 10 to 11 )\nError: boom\n    at app.json:3"
        );
    }

    #[test]
    fn test_format_missing_source_line() {
        let message = ThrowMessage {
            resource_name: "x".to_string(),
            line: 0,
            start: 0,
            end: 0,
            source_line: None,
        };
        let text = format_engine_throw(&throw(Some(message), None));
        assert!(text.starts_with("No source line\n@x:0"));
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(ExceptionKind::from_i32(2), Some(ExceptionKind::NativeRuntime));
        assert_eq!(ExceptionKind::from_i32(9), None);
        assert!(!JsException::default().is_set());
        assert!(JsException::native("x").is_set());
    }
}
