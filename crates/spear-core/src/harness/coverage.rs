//! Coverage-signal scanning.
//!
//! The instrumented target self-reports per-run coverage on its output
//! stream as `Current cov: <number>%` and `Max coverage: <number>%`
//! (case-insensitive, whitespace-tolerant). These two patterns are the
//! only recognized coverage signals.

use std::sync::LazyLock;

use regex::Regex;

/// Line fragment the target emits once per run alongside its final
/// coverage figures. Supervised executions use it as the end-of-run
/// sentinel.
pub const RUN_REPORT_MARKER: &str = "Max coverage";

static CURRENT_COV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)current\s+cov\s*:\s*([0-9]+(?:\.[0-9]+)?)\s*%").expect("valid regex literal")
});

static MAX_COV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)max\s+coverage\s*:\s*([0-9]+(?:\.[0-9]+)?)\s*%").expect("valid regex literal")
});

/// Scan `text` for the current and maximum coverage signals.
///
/// Each metric is `None` when its pattern is absent or the captured
/// number does not parse. Malformed input never panics.
pub fn extract_coverage(text: &str) -> (Option<f64>, Option<f64>) {
    (capture(&CURRENT_COV, text), capture(&MAX_COV, text))
}

fn capture(re: &Regex, text: &str) -> Option<f64> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}
