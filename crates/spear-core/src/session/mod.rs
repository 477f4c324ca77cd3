//! Session data model: vulnerability context, attempts, terminal statuses.
//!
//! A [`Session`] is the full ordered sequence of attempts against one
//! vulnerability context. Its status is write-once-terminal: once a
//! terminal status is applied, later finalizations are ignored. The
//! finalized session is consumed by external report rendering and
//! persistence, so every type here serializes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a session.
///
/// ```text
/// pending -> running -> success                  (batch)
///                    -> failed_max_retries       (batch)
///                    -> success_confirmed_by_ai  (interactive)
///                    -> stopped_by_ai            (interactive)
///                    -> unknown_reason           (interactive fallback)
///                    -> corpus_unavailable       (fatal, either policy)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    /// Batch policy: an attempt succeeded.
    Success,
    /// Batch policy: the retry budget was exhausted.
    FailedMaxRetries,
    /// Interactive policy: the oracle stopped after a successful attempt.
    SuccessConfirmedByAi,
    /// Interactive policy: the oracle stopped after a failed attempt.
    StoppedByAi,
    /// Interactive policy: the loop ended without a terminal decision.
    UnknownReason,
    /// The corpus directory could not be listed or created.
    CorpusUnavailable,
}

impl SessionStatus {
    /// Whether this status ends a session. Terminal statuses are
    /// write-once: the first one applied wins.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::FailedMaxRetries => "failed_max_retries",
            Self::SuccessConfirmedByAi => "success_confirmed_by_ai",
            Self::StoppedByAi => "stopped_by_ai",
            Self::UnknownReason => "unknown_reason",
            Self::CorpusUnavailable => "corpus_unavailable",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionStatus {
    type Err = SessionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed_max_retries" => Ok(Self::FailedMaxRetries),
            "success_confirmed_by_ai" => Ok(Self::SuccessConfirmedByAi),
            "stopped_by_ai" => Ok(Self::StoppedByAi),
            "unknown_reason" => Ok(Self::UnknownReason),
            "corpus_unavailable" => Ok(Self::CorpusUnavailable),
            other => Err(SessionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SessionStatus`] string.
#[derive(Debug, Clone)]
pub struct SessionStatusParseError(pub String);

impl fmt::Display for SessionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid session status: {:?}", self.0)
    }
}

impl std::error::Error for SessionStatusParseError {}

// ---------------------------------------------------------------------------
// Vulnerability context
// ---------------------------------------------------------------------------

/// Code surrounding the flagged sink, as delivered by the external
/// static-analysis collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeContext {
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub sink_line: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub pseudocode: String,
}

/// The flagged code sink a session is testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityContext {
    pub project: String,
    pub language: String,
    pub file_path: String,
    pub function_name: String,
    pub sink: String,
    pub sink_id: String,
    pub known_weakness: Vec<String>,
    pub code_context: CodeContext,
}

// ---------------------------------------------------------------------------
// Attempts and sessions
// ---------------------------------------------------------------------------

/// One generate-execute-classify cycle. Appended to a session's attempt
/// list, never edited afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub execution_log: String,
    pub analysis_reason: String,
    pub simulated_code: Option<String>,
    pub coverage_percent: Option<f64>,
}

/// The full ordered sequence of attempts for one vulnerability context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: Uuid,
    context: VulnerabilityContext,
    attempts: Vec<AttemptRecord>,
    status: SessionStatus,
    max_coverage_observed: f64,
    successful_payload: Option<String>,
}

impl Session {
    pub fn new(context: VulnerabilityContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            attempts: Vec::new(),
            status: SessionStatus::Pending,
            max_coverage_observed: 0.0,
            successful_payload: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn context(&self) -> &VulnerabilityContext {
        &self.context
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    /// The most recent attempt, when it failed. Feedback for the payload
    /// generator.
    pub fn last_failure(&self) -> Option<&AttemptRecord> {
        self.attempts.last().filter(|a| !a.success)
    }

    /// Running maximum of every per-attempt coverage value observed so
    /// far, including the latest attempt.
    pub fn max_coverage_observed(&self) -> f64 {
        self.max_coverage_observed
    }

    pub fn successful_payload(&self) -> Option<&str> {
        self.successful_payload.as_deref()
    }

    /// Move a pending session into the running state.
    pub fn begin(&mut self) {
        if self.status == SessionStatus::Pending {
            self.status = SessionStatus::Running;
        }
    }

    /// Append an attempt and fold its coverage into the running maximum.
    pub fn record_attempt(&mut self, attempt: AttemptRecord) {
        if let Some(coverage) = attempt.coverage_percent {
            if coverage > self.max_coverage_observed {
                self.max_coverage_observed = coverage;
            }
        }
        self.attempts.push(attempt);
    }

    pub fn set_successful_payload(&mut self, payload: String) {
        self.successful_payload = Some(payload);
    }

    /// Apply a terminal status. The first terminal status wins; calls
    /// after that are ignored. Returns whether the status was applied.
    pub fn finalize(&mut self, status: SessionStatus) -> bool {
        debug_assert!(status.is_terminal(), "finalize requires a terminal status");
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        true
    }
}
