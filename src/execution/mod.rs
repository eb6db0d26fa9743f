//! Execution requests, routing, and results.
//!
//! This module provides the pieces the coordinator composes per request:
//! - [`Command`] and [`ExecutionOptions`] describing what to run and how
//! - [`ExecutionDispatcher`], the routing policy
//! - [`InvocationEventQueue`], background work on the idle callback
//! - [`ExecutionResult`] and error report formatting
//!
//! # Example
//!
//! ```
//! use runspace_coordinator::execution::{Command, ExecutionOptions};
//!
//! let cmd = Command::new("Get-ChildItem").parameter("Path", "/tmp");
//! let options = ExecutionOptions::default()
//!     .write_output_to_host(true)
//!     .add_to_history(true);
//! assert!(options.demands_foreground());
//! # let _ = cmd;
//! ```

mod command;
mod dispatcher;
mod idle_queue;
pub mod report;
mod result;

pub use command::{Command, ExecutionOptions};
pub use dispatcher::{DispatchContext, ExecutionDispatcher, ExecutionTarget};
pub use idle_queue::InvocationEventQueue;
pub use result::{render_value, ExecutionResult};
