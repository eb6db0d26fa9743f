//! Session and frame identifier types.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for session descriptor ids.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of a session descriptor on the session stack.
///
/// Ids come from an atomic counter and are unique within the process.
/// They display as `session-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next session id.
    pub fn next() -> Self {
        Self(SESSION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Create a SessionId from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("session-")
            .and_then(|n| n.parse().ok())
            .map(SessionId)
            .ok_or_else(|| format!("invalid session id: '{s}'"))
    }
}
