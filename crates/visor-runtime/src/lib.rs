//! Session lifecycle and workflow execution.
//!
//! [`SessionManager`] drives the per-session state machine: load prior
//! storage state, start a browser, attach the recorder, stream, run the
//! workflow, then auto-save storage state and tear down. [`WorkflowRunner`]
//! executes scripted browser actions and can be paused by a live control
//! channel for interactive input.

pub mod session;
pub mod workflow;

pub use session::{
    BrowserLauncher, CdpLauncher, SessionError, SessionManager, SessionOutcome, SessionState,
    VisualSession,
};
pub use workflow::{PauseGate, WorkflowError, WorkflowReport, WorkflowRunner, WorkflowStep};
