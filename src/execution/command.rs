//! Commands and per-request execution options.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::session::SessionDetails;

/// A command to run in the current interpreter session.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Command or script text.
    pub text: String,
    /// Named parameters.
    pub parameters: BTreeMap<String, Value>,
    /// Treat `text` as a script block instead of a single command.
    pub is_script: bool,
}

impl Command {
    /// Create a command invocation.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: BTreeMap::new(),
            is_script: false,
        }
    }

    /// Create a script invocation.
    pub fn script(text: impl Into<String>) -> Self {
        Self {
            is_script: true,
            ..Self::new(text)
        }
    }

    /// The identity probe run after each request.
    pub fn probe() -> Self {
        Self::script(SessionDetails::PROBE_COMMAND)
    }

    /// Add a named parameter.
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Check if this is the identity probe.
    pub fn is_probe(&self) -> bool {
        self.is_script && self.text == SessionDetails::PROBE_COMMAND
    }
}

/// How a request should be routed and reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Forward result objects to the host.
    pub write_output_to_host: bool,
    /// Forward error reports to the host.
    pub write_errors_to_host: bool,
    /// Echo the command text to the host before running it.
    pub write_input_to_host: bool,
    /// Record the command in the session history.
    pub add_to_history: bool,
    /// Interrupt the foreground read loop to run this request.
    pub interrupt_command_prompt: bool,
    /// The request comes from the interactive read loop itself.
    pub is_read_line: bool,
    /// Merge the error stream into the output stream.
    pub merge_errors_into_output: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            write_output_to_host: false,
            write_errors_to_host: true,
            write_input_to_host: false,
            add_to_history: false,
            interrupt_command_prompt: false,
            is_read_line: false,
            merge_errors_into_output: false,
        }
    }
}

impl ExecutionOptions {
    /// Options for a command typed by the user at the prompt.
    pub fn interactive() -> Self {
        Self {
            write_output_to_host: true,
            write_errors_to_host: true,
            add_to_history: true,
            ..Default::default()
        }
    }

    /// Options for silent background work (completions, analysis).
    pub fn background() -> Self {
        Self {
            write_errors_to_host: false,
            ..Default::default()
        }
    }

    /// Set whether output goes to the host.
    pub fn write_output_to_host(mut self, enabled: bool) -> Self {
        self.write_output_to_host = enabled;
        self
    }

    /// Set whether error reports go to the host.
    pub fn write_errors_to_host(mut self, enabled: bool) -> Self {
        self.write_errors_to_host = enabled;
        self
    }

    /// Set whether the command is echoed first.
    pub fn write_input_to_host(mut self, enabled: bool) -> Self {
        self.write_input_to_host = enabled;
        self
    }

    /// Set whether the command is recorded in history.
    pub fn add_to_history(mut self, enabled: bool) -> Self {
        self.add_to_history = enabled;
        self
    }

    /// Set whether the read loop is interrupted.
    pub fn interrupt_command_prompt(mut self, enabled: bool) -> Self {
        self.interrupt_command_prompt = enabled;
        self
    }

    /// Mark the request as coming from the read loop.
    pub fn read_line(mut self, enabled: bool) -> Self {
        self.is_read_line = enabled;
        self
    }

    /// Set whether errors are merged into output.
    pub fn merge_errors_into_output(mut self, enabled: bool) -> Self {
        self.merge_errors_into_output = enabled;
        self
    }

    /// Whether the request needs the host, an interrupt, or the read loop.
    pub fn demands_foreground(&self) -> bool {
        self.write_output_to_host || self.interrupt_command_prompt || self.is_read_line
    }
}
