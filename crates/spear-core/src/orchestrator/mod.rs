//! Session orchestrator: turns single executions into a terminating
//! session of generate-execute-classify attempts.
//!
//! Two termination policies share the same per-attempt mechanics:
//! [`SessionRunner::run_batch`] stops on the first success or after a
//! bounded number of retries; [`SessionRunner::run_interactive`] loops
//! until an external stop oracle ends the session.
//!
//! Execution-level failures (timeout, spawn failure, unreadable crash
//! artifacts) are folded into attempt data and never abort the loop.
//! Only corpus-directory failures are fatal: they finalize the session
//! with its distinct [`SessionStatus::CorpusUnavailable`] status.

use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::advisor::{GeneratedPayload, PayloadGenerator, SessionSummary, StopOracle, Verdict};
use crate::corpus::{self, CorpusError, CrashCorpus};
use crate::harness::ExecutionHarness;
use crate::session::{AttemptRecord, Session, SessionStatus, VulnerabilityContext};

/// Configuration for the retry loop. All values are explicit; the loop
/// never reads ambient environment state.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Attempt budget for the batch policy.
    pub max_retries: usize,
    /// Target file reference appended to the execution command.
    pub target_file: Option<PathBuf>,
    /// Optional seed file whose contents prime the first attempt's
    /// payload instead of the generator.
    pub seed_file: Option<PathBuf>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            target_file: None,
            seed_file: None,
        }
    }
}

/// Outcome of one shared per-attempt cycle.
enum AttemptStep {
    /// An attempt was recorded (successful or not).
    Completed {
        new_input_files: usize,
        new_crash_files: usize,
    },
    /// The corpus directory could not be snapshotted. Fatal.
    CorpusUnavailable(CorpusError),
}

/// Drives a session of attempts against one vulnerability context.
pub struct SessionRunner<'a> {
    harness: &'a ExecutionHarness,
    corpus: &'a CrashCorpus,
    generator: &'a dyn PayloadGenerator,
    config: LoopConfig,
}

impl<'a> SessionRunner<'a> {
    pub fn new(
        harness: &'a ExecutionHarness,
        corpus: &'a CrashCorpus,
        generator: &'a dyn PayloadGenerator,
        config: LoopConfig,
    ) -> Self {
        Self {
            harness,
            corpus,
            generator,
            config,
        }
    }

    /// Batch policy: run up to `max_retries` attempts, stopping on the
    /// first success.
    ///
    /// The returned session always carries a terminal status; no
    /// per-attempt failure escapes as an error.
    pub async fn run_batch(&self, context: VulnerabilityContext) -> Session {
        let mut session = Session::new(context);
        session.begin();
        info!(
            session_id = %session.id(),
            max_retries = self.config.max_retries,
            "starting batch session"
        );

        if let Err(e) = self.corpus.clean() {
            error!(error = %e, "corpus unavailable, aborting session");
            session.finalize(SessionStatus::CorpusUnavailable);
            return session;
        }

        for number in 1..=self.config.max_retries {
            match self.run_attempt(&mut session, number, false).await {
                AttemptStep::Completed { .. } => {}
                AttemptStep::CorpusUnavailable(e) => {
                    error!(error = %e, "corpus unavailable, aborting session");
                    session.finalize(SessionStatus::CorpusUnavailable);
                    return session;
                }
            }

            let succeeded = session
                .last_attempt()
                .map(|a| (a.success, a.payload.clone()));
            if let Some((true, payload)) = succeeded {
                info!(session_id = %session.id(), attempt = number, "attack succeeded");
                session.set_successful_payload(payload);
                session.finalize(SessionStatus::Success);
                return session;
            }
        }

        info!(session_id = %session.id(), "retry budget exhausted");
        session.finalize(SessionStatus::FailedMaxRetries);
        session
    }

    /// Interactive policy: run attempts in an unbounded loop, consulting
    /// `oracle` after each one.
    ///
    /// A stop verdict after a successful attempt finalizes
    /// [`SessionStatus::SuccessConfirmedByAi`]; after a failed attempt,
    /// [`SessionStatus::StoppedByAi`]. If the loop ends without a
    /// terminal decision (an oracle failure), the session falls back to
    /// [`SessionStatus::UnknownReason`] instead of masking the failure
    /// as progress.
    pub async fn run_interactive(
        &self,
        context: VulnerabilityContext,
        oracle: &dyn StopOracle,
    ) -> Session {
        let mut session = Session::new(context);
        session.begin();
        info!(session_id = %session.id(), "starting interactive session");

        if let Err(e) = self.corpus.clean() {
            error!(error = %e, "corpus unavailable, aborting session");
            session.finalize(SessionStatus::CorpusUnavailable);
            return session;
        }

        let mut number = 0;
        loop {
            number += 1;
            let (new_input_files, new_crash_files) =
                match self.run_attempt(&mut session, number, true).await {
                    AttemptStep::Completed {
                        new_input_files,
                        new_crash_files,
                    } => (new_input_files, new_crash_files),
                    AttemptStep::CorpusUnavailable(e) => {
                        error!(error = %e, "corpus unavailable, aborting session");
                        session.finalize(SessionStatus::CorpusUnavailable);
                        return session;
                    }
                };

            let Some(last) = session.last_attempt() else {
                break;
            };
            let last_success = last.success;
            let last_payload = last.payload.clone();
            let summary = SessionSummary {
                attempts: session.attempts().len(),
                last_payload: last_payload.clone(),
                last_success,
                last_reason: last.analysis_reason.clone(),
                current_coverage: last.coverage_percent.unwrap_or(0.0),
                max_coverage: session.max_coverage_observed(),
                new_input_files,
                new_crash_files,
            };

            let verdict = match oracle.decide(&summary).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!(error = %e, "stop oracle failed, ending session");
                    break;
                }
            };
            info!(attempt = number, ?verdict, "oracle verdict");

            if verdict == Verdict::Stop {
                if last_success {
                    session.set_successful_payload(last_payload);
                    session.finalize(SessionStatus::SuccessConfirmedByAi);
                } else {
                    session.finalize(SessionStatus::StoppedByAi);
                }
                break;
            }
        }

        // No-op when a terminal status was already applied above.
        session.finalize(SessionStatus::UnknownReason);
        session
    }

    /// Shared per-attempt mechanics: generate a payload, bracket one
    /// execution with corpus snapshots, classify, and append the
    /// [`AttemptRecord`].
    async fn run_attempt(
        &self,
        session: &mut Session,
        number: usize,
        track_inputs: bool,
    ) -> AttemptStep {
        info!(attempt = number, "starting attempt");

        let last_coverage = session.last_attempt().and_then(|a| a.coverage_percent);
        let generated = match self.seed_payload(number) {
            Some(payload) => GeneratedPayload::bare(payload),
            None => {
                match self
                    .generator
                    .generate(session.context(), session.last_failure(), last_coverage)
                    .await
                {
                    Ok(generated) => generated,
                    Err(e) => {
                        // A generation failure is a failed attempt, not an
                        // abort; it counts toward the retry budget.
                        warn!(attempt = number, error = %e, "payload generation failed");
                        session.record_attempt(AttemptRecord {
                            payload: String::new(),
                            timestamp: chrono::Utc::now(),
                            success: false,
                            execution_log: String::new(),
                            analysis_reason: format!("payload generation failed: {e:#}"),
                            simulated_code: None,
                            coverage_percent: None,
                        });
                        return AttemptStep::Completed {
                            new_input_files: 0,
                            new_crash_files: 0,
                        };
                    }
                }
            }
        };

        let crashes_before = match self.corpus.snapshot_crashes() {
            Ok(set) => set,
            Err(e) => return AttemptStep::CorpusUnavailable(e),
        };
        let inputs_before = if track_inputs {
            match self.corpus.snapshot_inputs() {
                Ok(set) => set,
                Err(e) => return AttemptStep::CorpusUnavailable(e),
            }
        } else {
            Default::default()
        };

        let record = self
            .harness
            .execute(&generated.payload, self.config.target_file.as_deref())
            .await;

        let crashes_after = match self.corpus.snapshot_crashes() {
            Ok(set) => set,
            Err(e) => return AttemptStep::CorpusUnavailable(e),
        };
        let inputs_after = if track_inputs {
            match self.corpus.snapshot_inputs() {
                Ok(set) => set,
                Err(e) => return AttemptStep::CorpusUnavailable(e),
            }
        } else {
            Default::default()
        };

        let new_crashes = corpus::new_since(&crashes_before, &crashes_after);
        let new_inputs = corpus::new_since(&inputs_before, &inputs_after);

        let stderr = record.stderr.trim();
        let success = stderr.is_empty() && new_crashes.is_empty();
        let analysis_reason = if !stderr.is_empty() {
            format!("execution failed with stderr: {stderr}")
        } else if !new_crashes.is_empty() {
            self.crash_reason(&new_crashes)
        } else {
            "execution succeeded with no stderr and no new crash artifacts".to_string()
        };

        info!(
            attempt = number,
            success,
            new_crashes = new_crashes.len(),
            coverage = ?record.coverage_percent,
            "attempt classified"
        );

        let execution_log = if record.stdout.is_empty() {
            record.stderr.clone()
        } else {
            record.stdout.clone()
        };
        session.record_attempt(AttemptRecord {
            payload: generated.payload,
            timestamp: record.timestamp,
            success,
            execution_log,
            analysis_reason,
            simulated_code: generated.simulated_code,
            coverage_percent: record.coverage_percent,
        });

        AttemptStep::Completed {
            new_input_files: new_inputs.len(),
            new_crash_files: new_crashes.len(),
        }
    }

    /// Compose the attempt reason from the newest crash artifact,
    /// degrading to a generic phrase when the artifact cannot be read.
    fn crash_reason(&self, new_crashes: &std::collections::BTreeSet<PathBuf>) -> String {
        let Some(path) = corpus::latest_crash(new_crashes) else {
            return "fuzzer reported a crash, but the artifact could not be located".to_string();
        };
        match corpus::read_crash_info(path) {
            Ok(info) => format!(
                "fuzzer reported a crash in function '{}': {}",
                info.func, info.message
            ),
            Err(e) => {
                warn!(error = %e, "crash artifact unreadable");
                format!("fuzzer reported a crash, but the details could not be read: {e}")
            }
        }
    }

    /// The seed payload for the very first attempt, when one is
    /// configured and readable. Any failure falls back to the generator.
    fn seed_payload(&self, attempt_number: usize) -> Option<String> {
        if attempt_number != 1 {
            return None;
        }
        let path = self.config.seed_file.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let seed = raw.trim();
                if seed.is_empty() {
                    None
                } else {
                    info!(path = %path.display(), "priming first attempt from seed file");
                    Some(seed.to_string())
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read seed file");
                None
            }
        }
    }
}
