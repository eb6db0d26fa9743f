//! Execution result types.

use std::time::Duration;

use serde_json::Value;

use crate::engine::ErrorRecord;

/// Result of one coordinated execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Result objects produced by the command.
    pub output: Vec<Value>,
    /// Errors reported by the interpreter.
    pub errors: Vec<ErrorRecord>,
    /// Formatted error text (reports and converted runtime failures).
    pub error_messages: String,
    /// Whether any error was reported.
    pub had_errors: bool,
    /// Whether the pipeline was stopped before completing.
    pub aborted: bool,
    /// Execution duration.
    pub duration: Duration,
}

impl ExecutionResult {
    /// Create a result from output objects.
    pub fn new(output: Vec<Value>, duration: Duration) -> Self {
        Self {
            output,
            duration,
            ..Default::default()
        }
    }

    /// Create a result for a stopped pipeline. Partial output is dropped.
    pub fn stopped(duration: Duration) -> Self {
        Self {
            aborted: true,
            duration,
            ..Default::default()
        }
    }

    /// Append formatted error text.
    pub fn push_error_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.error_messages.is_empty() && !self.error_messages.ends_with('\n') {
            self.error_messages.push('\n');
        }
        self.error_messages.push_str(text);
        self.had_errors = true;
    }

    /// Check if the command completed without errors.
    pub fn success(&self) -> bool {
        !self.had_errors && !self.aborted
    }

    /// Render each output object as a line of text.
    pub fn output_lines(&self) -> impl Iterator<Item = String> + '_ {
        self.output.iter().map(render_value)
    }
}

/// Render one output object the way a host would print it.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
