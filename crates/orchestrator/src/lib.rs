//! In-process durable-orchestrator: per-session-key single-in-flight turn
//! execution with queued signals, cooperative cancel-in-flight, and a
//! retry policy with exponential backoff.
//!
//! The session key is the workflow-group identity. Each key owns one
//! mailbox and at most one actor task; the actor runs the registered
//! [`TurnWorkflow`] body turn after turn until the mailbox drains. No
//! application-level lock exists anywhere else — single-in-flight is a
//! property of the actor loop.

pub mod cancel;
pub mod mailbox;
pub mod orchestrator;
pub mod retry;

pub use cancel::CancelToken;
pub use mailbox::{SessionMailbox, TurnHandle, TurnPhase};
pub use orchestrator::{
    SessionOrchestrator, SignalOutcome, SupersedeDecision, TurnWorkflow,
};
pub use retry::RetryPolicy;
