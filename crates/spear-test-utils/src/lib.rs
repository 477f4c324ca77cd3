//! Shared test utilities for spear integration tests.
//!
//! Integration tests drive real subprocesses; these helpers write the
//! small executable shell scripts that stand in for the instrumented
//! target.

use std::path::{Path, PathBuf};

/// Write `body` as an executable `#!/bin/sh` script named `name` under
/// `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make script executable");
    }
    path
}

/// Script body for a target that consumes its payload, reports fixed
/// coverage, and exits cleanly.
pub fn clean_target_body(current: f64, max: f64) -> String {
    format!("cat > /dev/null\necho 'Current cov: {current}%'\necho 'Max coverage: {max}%'\n")
}

/// Script body for a target that rejects every payload on stderr.
pub fn failing_target_body(message: &str) -> String {
    format!("cat > /dev/null\necho '{message}' >&2\n")
}

/// Script body for a target whose instrumentation records a crash
/// artifact in `corpus_dir` on every run.
pub fn crashing_target_body(corpus_dir: &Path, func: &str, message: &str) -> String {
    format!(
        "cat > /dev/null\nprintf '{{\"input\":\"x\",\"crashInfo\":{{\"func\":\"{func}\",\"message\":\"{message}\"}}}}' > {}/crash_$$.json\n",
        corpus_dir.display()
    )
}

/// Script body for a long-lived target that answers each payload line
/// with a coverage report. `$line` expands to the payload, so callers can
/// embed it in the echoed coverage figures.
pub fn interactive_target_body(current_expr: &str, max_expr: &str) -> String {
    format!(
        "while read line; do\n  echo \"run: $line\"\n  echo \"Current cov: {current_expr}%\"\n  echo \"Max coverage: {max_expr}%\"\ndone\n"
    )
}
