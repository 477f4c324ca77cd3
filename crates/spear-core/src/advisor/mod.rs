//! Seams to the external analysis collaborators.
//!
//! Payload generation and continue/stop decisions are produced outside
//! this crate, typically by an LLM-backed service. The retry loop talks
//! to them through these object-safe traits so the loop stays testable
//! with plain fakes.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::session::{AttemptRecord, VulnerabilityContext};

/// A candidate payload produced by the external generator.
///
/// When the target function accepts multiple parameters, the generator is
/// expected to join the arguments with `||` into this single line; the
/// loop treats the payload as opaque text.
#[derive(Debug, Clone)]
pub struct GeneratedPayload {
    pub payload: String,
    /// Simulated attack code, when the generation step produced one.
    pub simulated_code: Option<String>,
}

impl GeneratedPayload {
    pub fn bare(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            simulated_code: None,
        }
    }
}

/// Snapshot of session progress handed to the stop oracle after each
/// interactive attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Total attempts so far, including the latest.
    pub attempts: usize,
    pub last_payload: String,
    pub last_success: bool,
    pub last_reason: String,
    /// The latest attempt's coverage, zero when the target reported none.
    pub current_coverage: f64,
    /// Running maximum coverage across the session.
    pub max_coverage: f64,
    /// Corpus input files first observed during the latest attempt.
    pub new_input_files: usize,
    /// Crash artifacts first observed during the latest attempt.
    pub new_crash_files: usize,
}

/// Continue/stop verdict for an interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Stop,
}

/// Produces the next candidate payload for a vulnerability context.
#[async_trait]
pub trait PayloadGenerator: Send + Sync {
    /// Generate a payload given the last failing attempt (if any) and the
    /// last observed coverage percentage.
    async fn generate(
        &self,
        context: &VulnerabilityContext,
        last_failure: Option<&AttemptRecord>,
        last_coverage: Option<f64>,
    ) -> Result<GeneratedPayload>;
}

/// Decides whether an interactive session keeps fuzzing.
#[async_trait]
pub trait StopOracle: Send + Sync {
    async fn decide(&self, summary: &SessionSummary) -> Result<Verdict>;
}

// Compile-time assertion: both traits must stay object-safe so the loop
// can hold them as trait objects.
const _: () = {
    fn _assert_object_safe(_: &dyn PayloadGenerator, _: &dyn StopOracle) {}
};
