//! # runspace-coordinator
//!
//! Exclusive, thread-affine access to a single-threaded interpreter session
//! for many concurrent callers.
//!
//! The interpreter can run one pipeline at a time, on the thread that owns
//! it. Callers (protocol handlers, an interactive prompt, background
//! analysis) submit requests to an [`ExecutionCoordinator`], which decides
//! where each request runs and serializes access to the session.
//!
//! ## Features
//!
//! - **Frame stack**: nested prompts and debugger stops each get a frame
//!   with its own request loop on a dedicated thread
//! - **Leases**: at most one holder of a frame's session at a time, released
//!   on every exit path
//! - **Routing**: requests go to the foreground loop's idle callback, a
//!   frame's loop thread, the debugger, or straight to the pipeline
//! - **Session stack**: entering another process or a debugged session is
//!   detected after each request and pushes or pops sessions to match
//! - **Events**: state, debugger and session changes fan out to any number
//!   of subscribers
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use runspace_coordinator::coordinator::{CoordinatorConfig, ExecutionCoordinator};
//! use runspace_coordinator::engine::{HostCallbacks, IdlePump, LoopbackCapabilities, LoopbackEngine, OutputKind};
//! use runspace_coordinator::execution::{Command, ExecutionOptions};
//!
//! struct StdoutHost;
//!
//! impl HostCallbacks for StdoutHost {
//!     fn write_output(&self, text: &str, _: bool, _: OutputKind) {
//!         println!("{text}");
//!     }
//!     fn start_read_loop(&self) {}
//!     fn stop_read_loop(&self) {}
//!     fn read_line(&self, _: &dyn IdlePump) -> Option<String> {
//!         None
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> runspace_coordinator::Result<()> {
//!     runspace_coordinator::logging::try_init().ok();
//!
//!     let coordinator = ExecutionCoordinator::initialize(
//!         Arc::new(LoopbackEngine::new()),
//!         true,
//!         Arc::new(StdoutHost),
//!         Arc::new(LoopbackCapabilities),
//!         CoordinatorConfig::default(),
//!     )
//!     .await?;
//!
//!     coordinator
//!         .execute(Command::new("Get-Date"), ExecutionOptions::interactive())
//!         .await?;
//!
//!     coordinator.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod escape;
pub mod execution;
pub mod frames;
pub mod logging;
pub mod session;

// Re-export commonly used types
pub use coordinator::{
    CoordinatorConfig, CoordinatorEvent, ExecutionCoordinator, ExecutionStatus,
    RunspaceChangeAction,
};
pub use engine::{
    DebuggerStopEvent, EngineCapabilities, EngineVersion, HostCallbacks, ResumeAction, Runspace,
};
pub use error::{CoordinatorError, EngineError, Result};
pub use execution::{Command, ExecutionOptions, ExecutionResult};
pub use frames::{FrameKind, RunspaceHandle};
pub use session::{CoordinatorState, SessionDetails, SessionId, SessionInfo};
