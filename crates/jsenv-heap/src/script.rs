//! Script evaluation
//!
//! The heap engine evaluates JSON documents: a script is a single JSON value
//! and its completion value is that value. Parse failures are reported as a
//! `SyntaxError` with the resource name, line, and column span.

use jsenv::engine::ThrowMessage;
use serde_json::Value;

pub struct SyntaxError {
    pub description: String,
    pub location: ThrowMessage,
}

impl SyntaxError {
    pub fn text(&self) -> String {
        format!("SyntaxError: {}", self.description)
    }

    pub fn stack(&self) -> String {
        format!(
            "{}\n    at {}:{}:{}",
            self.text(),
            self.location.resource_name,
            self.location.line,
            self.location.start
        )
    }
}

/// Parses `source`. Line numbers in errors are offset by `start_line`.
pub fn parse(source: &str, resource_name: &str, start_line: i32) -> Result<Value, SyntaxError> {
    serde_json::from_str(source).map_err(|e| {
        // serde_json reports 1-based lines and columns; column 0 means the
        // error sits at end of input.
        let line_index = e.line().saturating_sub(1);
        let column = e.column().saturating_sub(1) as i32;
        let source_line = source.lines().nth(line_index).map(str::to_string);
        let description = strip_location(&e.to_string());
        SyntaxError {
            description,
            location: ThrowMessage {
                resource_name: resource_name.to_string(),
                line: start_line + line_index as i32,
                start: column,
                end: column + 1,
                source_line,
            },
        }
    })
}

/// Drops serde_json's trailing " at line L column C".
fn strip_location(message: &str) -> String {
    match message.rfind(" at line ") {
        Some(at) => message[..at].to_string(),
        None => message.to_string(),
    }
}
