//! End-to-end tests for the session loop: real subprocess targets, fake
//! advisors.
//!
//! The fakes stand in for the external LLM-backed collaborators so the
//! loop's termination policies can be exercised deterministically.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use spear_core::advisor::{
    GeneratedPayload, PayloadGenerator, SessionSummary, StopOracle, Verdict,
};
use spear_core::corpus::CrashCorpus;
use spear_core::harness::{ExecutionHarness, HarnessConfig};
use spear_core::orchestrator::{LoopConfig, SessionRunner};
use spear_core::session::{AttemptRecord, CodeContext, SessionStatus, VulnerabilityContext};
use spear_core::supervisor::{ProcessSupervisor, SupervisorConfig};

use spear_test_utils::{
    clean_target_body, crashing_target_body, failing_target_body, interactive_target_body,
    write_script,
};

// ===========================================================================
// Fake advisors
// ===========================================================================

/// Hands out a fixed sequence of payloads, repeating the last one.
struct SequenceGenerator {
    payloads: Mutex<VecDeque<String>>,
    fallback: String,
}

impl SequenceGenerator {
    fn new(payloads: &[&str]) -> Self {
        let fallback = payloads.last().unwrap_or(&"payload").to_string();
        Self {
            payloads: Mutex::new(payloads.iter().map(|p| p.to_string()).collect()),
            fallback,
        }
    }
}

#[async_trait]
impl PayloadGenerator for SequenceGenerator {
    async fn generate(
        &self,
        _context: &VulnerabilityContext,
        _last_failure: Option<&AttemptRecord>,
        _last_coverage: Option<f64>,
    ) -> Result<GeneratedPayload> {
        let next = self
            .payloads
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(GeneratedPayload::bare(next))
    }
}

/// Stops once the session reaches `stop_at` attempts, recording every
/// summary it was shown.
struct StopAfterOracle {
    stop_at: usize,
    seen: Mutex<Vec<SessionSummary>>,
}

impl StopAfterOracle {
    fn new(stop_at: usize) -> Self {
        Self {
            stop_at,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn summaries(&self) -> Vec<SessionSummary> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl StopOracle for StopAfterOracle {
    async fn decide(&self, summary: &SessionSummary) -> Result<Verdict> {
        self.seen.lock().unwrap().push(summary.clone());
        if summary.attempts >= self.stop_at {
            Ok(Verdict::Stop)
        } else {
            Ok(Verdict::Continue)
        }
    }
}

/// An oracle whose backend is unreachable.
struct BrokenOracle;

#[async_trait]
impl StopOracle for BrokenOracle {
    async fn decide(&self, _summary: &SessionSummary) -> Result<Verdict> {
        Err(anyhow::anyhow!("decision backend unreachable"))
    }
}

// ===========================================================================
// Helpers
// ===========================================================================

fn context() -> VulnerabilityContext {
    VulnerabilityContext {
        project: "webapp".to_string(),
        language: "javascript".to_string(),
        file_path: "src/routes/search.js".to_string(),
        function_name: "runQuery".to_string(),
        sink: "child_process.exec".to_string(),
        sink_id: "30064771091".to_string(),
        known_weakness: vec!["Command Injection".to_string()],
        code_context: CodeContext::default(),
    }
}

fn harness_for(command: Vec<String>) -> ExecutionHarness {
    ExecutionHarness::new(HarnessConfig {
        command,
        working_dir: None,
        timeout: Duration::from_secs(5),
    })
}

// ===========================================================================
// Interactive policy
// ===========================================================================

#[tokio::test]
async fn interactive_confirms_success_when_stopping_after_a_clean_attempt() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus_dir = tmp.path().join("corpus");
    let target = write_script(tmp.path(), "target.sh", &clean_target_body(42.5, 87.0));

    let harness = harness_for(vec![target.to_str().unwrap().to_string()]);
    let corpus = CrashCorpus::new(&corpus_dir);
    let generator = SequenceGenerator::new(&["$(reboot)"]);
    let oracle = StopAfterOracle::new(1);
    let runner = SessionRunner::new(&harness, &corpus, &generator, LoopConfig::default());

    let session = runner.run_interactive(context(), &oracle).await;

    assert_eq!(session.status(), SessionStatus::SuccessConfirmedByAi);
    assert_eq!(session.attempts().len(), 1);
    assert_eq!(session.successful_payload(), Some("$(reboot)"));

    let summaries = oracle.summaries();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].last_success);
    assert_eq!(summaries[0].current_coverage, 42.5);
}

#[tokio::test]
async fn interactive_stops_without_confirmation_after_a_failed_attempt() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus_dir = tmp.path().join("corpus");
    let target = write_script(
        tmp.path(),
        "target.sh",
        &failing_target_body("input validation rejected payload"),
    );

    let harness = harness_for(vec![target.to_str().unwrap().to_string()]);
    let corpus = CrashCorpus::new(&corpus_dir);
    let generator = SequenceGenerator::new(&["payload"]);
    let oracle = StopAfterOracle::new(1);
    let runner = SessionRunner::new(&harness, &corpus, &generator, LoopConfig::default());

    let session = runner.run_interactive(context(), &oracle).await;

    assert_eq!(session.status(), SessionStatus::StoppedByAi);
    assert!(session.successful_payload().is_none());
    assert!(
        session.attempts()[0]
            .analysis_reason
            .contains("input validation rejected payload")
    );
}

#[tokio::test]
async fn interactive_runs_until_the_oracle_says_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus_dir = tmp.path().join("corpus");
    // Coverage echoes the payload, so each attempt reports a chosen value.
    let target = write_script(
        tmp.path(),
        "target.sh",
        "p=$(cat)\necho \"Current cov: ${p}%\"\necho \"Max coverage: ${p}%\"\n",
    );

    let harness = harness_for(vec![target.to_str().unwrap().to_string()]);
    let corpus = CrashCorpus::new(&corpus_dir);
    let generator = SequenceGenerator::new(&["10", "50", "30"]);
    let oracle = StopAfterOracle::new(3);
    let runner = SessionRunner::new(&harness, &corpus, &generator, LoopConfig::default());

    let session = runner.run_interactive(context(), &oracle).await;

    assert_eq!(session.attempts().len(), 3);
    assert_eq!(session.max_coverage_observed(), 50.0);

    let summaries = oracle.summaries();
    assert_eq!(summaries.len(), 3);
    assert_eq!(summaries[0].current_coverage, 10.0);
    assert_eq!(summaries[1].current_coverage, 50.0);
    assert_eq!(summaries[2].current_coverage, 30.0);
    // The running maximum includes the current attempt.
    assert_eq!(summaries[1].max_coverage, 50.0);
    assert_eq!(summaries[2].max_coverage, 50.0);
}

#[tokio::test]
async fn interactive_reports_new_corpus_files_to_the_oracle() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus_dir = tmp.path().join("corpus");
    std::fs::create_dir_all(&corpus_dir).unwrap();
    // The instrumentation saves each new-path input into the corpus.
    let body = format!(
        "cat > /dev/null\nprintf 'input' > {}/input_$$.js\necho 'Current cov: 5%'\n",
        corpus_dir.display()
    );
    let target = write_script(tmp.path(), "target.sh", &body);

    let harness = harness_for(vec![target.to_str().unwrap().to_string()]);
    let corpus = CrashCorpus::new(&corpus_dir);
    let generator = SequenceGenerator::new(&["payload"]);
    let oracle = StopAfterOracle::new(2);
    let runner = SessionRunner::new(&harness, &corpus, &generator, LoopConfig::default());

    let session = runner.run_interactive(context(), &oracle).await;

    assert_eq!(session.attempts().len(), 2);
    for summary in oracle.summaries() {
        assert_eq!(summary.new_input_files, 1);
        assert_eq!(summary.new_crash_files, 0);
        assert!(summary.last_success, "corpus inputs alone do not fail an attempt");
    }
}

#[tokio::test]
async fn interactive_counts_new_crash_files_in_the_summary() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus_dir = tmp.path().join("corpus");
    std::fs::create_dir_all(&corpus_dir).unwrap();
    let target = write_script(
        tmp.path(),
        "target.sh",
        &crashing_target_body(&corpus_dir, "runQuery", "maximum call stack exceeded"),
    );

    let harness = harness_for(vec![target.to_str().unwrap().to_string()]);
    let corpus = CrashCorpus::new(&corpus_dir);
    let generator = SequenceGenerator::new(&["payload"]);
    let oracle = StopAfterOracle::new(1);
    let runner = SessionRunner::new(&harness, &corpus, &generator, LoopConfig::default());

    let session = runner.run_interactive(context(), &oracle).await;

    assert_eq!(session.status(), SessionStatus::StoppedByAi);
    let summaries = oracle.summaries();
    assert_eq!(summaries[0].new_crash_files, 1);
    assert!(!summaries[0].last_success);
    assert!(
        summaries[0]
            .last_reason
            .contains("crash in function 'runQuery': maximum call stack exceeded")
    );
}

#[tokio::test]
async fn interactive_falls_back_to_unknown_reason_when_the_oracle_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus_dir = tmp.path().join("corpus");
    let target = write_script(tmp.path(), "target.sh", &clean_target_body(10.0, 10.0));

    let harness = harness_for(vec![target.to_str().unwrap().to_string()]);
    let corpus = CrashCorpus::new(&corpus_dir);
    let generator = SequenceGenerator::new(&["payload"]);
    let runner = SessionRunner::new(&harness, &corpus, &generator, LoopConfig::default());

    let session = runner.run_interactive(context(), &BrokenOracle).await;

    assert_eq!(session.status(), SessionStatus::UnknownReason);
    assert_eq!(session.attempts().len(), 1);
    assert!(session.successful_payload().is_none());
}

// ===========================================================================
// Batch policy, end to end
// ===========================================================================

#[tokio::test]
async fn batch_session_serializes_for_the_reporting_collaborator() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus_dir = tmp.path().join("corpus");
    let target = write_script(tmp.path(), "target.sh", &clean_target_body(42.5, 87.0));

    let harness = harness_for(vec![target.to_str().unwrap().to_string()]);
    let corpus = CrashCorpus::new(&corpus_dir);
    let generator = SequenceGenerator::new(&["a||b"]);
    let runner = SessionRunner::new(&harness, &corpus, &generator, LoopConfig::default());

    let session = runner.run_batch(context()).await;
    assert_eq!(session.status(), SessionStatus::Success);

    let json = serde_json::to_value(&session).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["successful_payload"], "a||b");
    assert_eq!(json["attempts"].as_array().unwrap().len(), 1);
    assert_eq!(json["context"]["function_name"], "runQuery");
}

#[tokio::test]
async fn batch_passes_the_target_file_reference_through() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus_dir = tmp.path().join("corpus");
    let target = write_script(tmp.path(), "target.sh", "cat > /dev/null\necho \"args:$*\"\n");

    let harness = harness_for(vec![target.to_str().unwrap().to_string()]);
    let corpus = CrashCorpus::new(&corpus_dir);
    let generator = SequenceGenerator::new(&["payload"]);
    let config = LoopConfig {
        max_retries: 1,
        target_file: Some(tmp.path().join("P_search_30064771091.js")),
        seed_file: None,
    };
    let runner = SessionRunner::new(&harness, &corpus, &generator, config);

    let session = runner.run_batch(context()).await;

    assert!(
        session.attempts()[0]
            .execution_log
            .contains("args:--file"),
        "execution log should show the forwarded --file argument: {:?}",
        session.attempts()[0].execution_log
    );
}

// ===========================================================================
// Supervised target, sequential attempts
// ===========================================================================

#[tokio::test]
async fn one_supervised_target_serves_sequential_attempts() {
    let tmp = tempfile::tempdir().unwrap();
    let target = write_script(
        tmp.path(),
        "interactive.sh",
        &interactive_target_body("$line", "$line"),
    );

    let mut supervisor = ProcessSupervisor::new(SupervisorConfig::default());
    supervisor
        .start(
            &[target.to_str().unwrap().to_string()],
            None,
            &Default::default(),
        )
        .unwrap();

    let harness = harness_for(vec![]);

    let first = harness.execute_supervised(&mut supervisor, "25").await;
    assert!(first.stderr.is_empty(), "stderr: {:?}", first.stderr);
    assert_eq!(first.coverage_percent, Some(25.0));

    let second = harness.execute_supervised(&mut supervisor, "75").await;
    assert!(second.stderr.is_empty(), "stderr: {:?}", second.stderr);
    assert_eq!(second.coverage_percent, Some(75.0));
    assert!(second.stdout.contains("run: 75"));

    assert!(supervisor.is_alive());
    supervisor.terminate(Duration::from_millis(500)).await;
    assert!(!supervisor.is_alive());
}
