//! Core of spear: feedback-driven exploitation testing of a flagged code
//! sink.
//!
//! A session repeatedly feeds candidate payloads to a supervised target,
//! observes crash artifacts and coverage feedback, and decides whether to
//! retry, stop, or declare success.
//!
//! # Architecture
//!
//! ```text
//! SessionRunner (orchestrator)
//!     |  generate --> &dyn PayloadGenerator   (external, LLM-backed)
//!     |  decide ----> &dyn StopOracle         (external, LLM-backed)
//!     |
//!     |  execute(payload)
//!     v
//! ExecutionHarness ---one-shot---> target process
//!     |         \--supervised---> ProcessSupervisor --> long-lived target
//!     |
//!     v
//! ExecutionRecord --- bracketed by ---> CrashCorpus snapshots
//!     |
//!     v
//! AttemptRecord -> Session (terminal status, consumed by external reporting)
//! ```
//!
//! Payload generation, stop decisions, report rendering, and CLI/env
//! configuration are external collaborators; this crate only defines the
//! seams they plug into.

pub mod advisor;
pub mod corpus;
pub mod harness;
pub mod orchestrator;
pub mod session;
pub mod supervisor;

// Re-export the primary public API at the crate root.
pub use advisor::{GeneratedPayload, PayloadGenerator, SessionSummary, StopOracle, Verdict};
pub use corpus::{CorpusError, CrashCorpus, CrashInfo};
pub use harness::{ExecutionHarness, ExecutionRecord, HarnessConfig};
pub use orchestrator::{LoopConfig, SessionRunner};
pub use session::{
    AttemptRecord, CodeContext, Session, SessionStatus, VulnerabilityContext,
};
pub use supervisor::{ProcessSupervisor, SupervisorConfig, SupervisorError};
