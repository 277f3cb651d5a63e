//! Job orchestration and statistics core.
//!
//! Everything between the chat front-end and the extractor lives here:
//! request gating, bounded retries, deadlines, file lifecycle and the
//! statistics aggregator. The front-end only talks to
//! [`orchestrator::Orchestrator`].

/// Classified job failures
pub mod error;
/// Duplicate suppression and mutual exclusion
pub mod gate;
/// File validation, delivery and guaranteed cleanup
pub mod lifecycle;
/// The job pipeline tying the pieces together
pub mod orchestrator;
/// Bounded retry with the authentication fallback
pub mod retry;
/// Snapshot persistence
pub mod snapshot;
/// Event-sourced usage statistics
pub mod stats;
/// Wall-clock deadlines around blocking work
pub mod timeout;
