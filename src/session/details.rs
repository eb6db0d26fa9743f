//! Identity snapshot of the process hosting the current session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoordinatorError;
use crate::Result;

/// Who is answering commands right now.
///
/// The coordinator compares successive snapshots to notice when a command
/// entered another process or when the debugger stopped inside a different
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetails {
    /// Operating-system process id.
    pub process_id: u32,
    /// Unique id of the interpreter instance inside the process.
    pub instance_id: String,
    /// Name of the machine hosting the process.
    pub machine_name: String,
}

impl SessionDetails {
    /// Script that reports the identity of the answering session as one
    /// JSON object.
    pub const PROBE_COMMAND: &'static str = "[pscustomobject]@{ processId = $PID; \
instanceId = $Host.InstanceId.ToString(); machineName = [Environment]::MachineName } \
| ConvertTo-Json -Compress";

    /// Create a snapshot.
    pub fn new(
        process_id: u32,
        instance_id: impl Into<String>,
        machine_name: impl Into<String>,
    ) -> Self {
        Self {
            process_id,
            instance_id: instance_id.into(),
            machine_name: machine_name.into(),
        }
    }

    /// Parse the output of [`Self::PROBE_COMMAND`].
    ///
    /// Accepts either an object or a string holding the object's JSON, and
    /// uses the last such value in the output.
    pub fn from_probe_output(output: &[Value]) -> Result<Self> {
        let value = output
            .iter()
            .rev()
            .find(|v| v.is_object() || v.is_string())
            .ok_or_else(|| CoordinatorError::Probe("probe produced no output".to_string()))?;

        let parsed = match value {
            Value::String(text) => serde_json::from_str(text),
            other => serde_json::from_value(other.clone()),
        };
        parsed.map_err(|e| CoordinatorError::Probe(e.to_string()))
    }

    /// Check if both snapshots describe the same interpreter instance.
    pub fn matches(&self, other: &SessionDetails) -> bool {
        self.process_id == other.process_id
            && self.instance_id == other.instance_id
            && self.same_machine(other)
    }

    /// Check if both snapshots come from the same machine.
    pub fn same_machine(&self, other: &SessionDetails) -> bool {
        self.machine_name.eq_ignore_ascii_case(&other.machine_name)
    }
}
