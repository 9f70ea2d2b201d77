//! Enforcement: No Sleep, Only Wait on I/O
//!
//! **Policy**: production code in the engine and the CLI must not sleep.
//! **Exception**: the wait between retry attempts in exponential backoff.
//! Test modules are not scanned.

use architectural_enforcement::{code_part, scan};

/// Lines above a sleep that are searched for backoff context
const BACKOFF_WINDOW: usize = 15;

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(|_path, lines, idx| {
        let code = code_part(&lines[idx]);
        let sleeps = code.contains("::sleep(") || code.contains(".sleep(");
        (sleeps && !is_backoff_context(lines, idx)).then_some("sleep outside retry backoff")
    });

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nWait on I/O, a timeout, or a channel instead. Only retry backoff may sleep.");
        panic!("found {} sleep violation(s)", violations.len());
    }
}

/// Backoff: the window mentions a backoff delay and a retry attempt
fn is_backoff_context(lines: &[String], idx: usize) -> bool {
    let start = idx.saturating_sub(BACKOFF_WINDOW);
    let window: Vec<String> = lines[start..=idx].iter().map(|l| l.to_lowercase()).collect();

    let has_backoff = window
        .iter()
        .any(|l| l.contains("backoff") || l.contains("delay_for_attempt"));
    let has_retry = window
        .iter()
        .any(|l| l.contains("retry") || l.contains("attempt"));
    has_backoff && has_retry
}

#[test]
fn test_backoff_detection() {
    let lines: Vec<String> = [
        "let backoff = self.delay_for_attempt(attempt);",
        "tracing::debug!(attempt, \"Transient failure, retrying after backoff\");",
        "tokio::time::sleep(backoff).await;",
    ]
    .iter()
    .map(|l| (*l).to_string())
    .collect();
    assert!(is_backoff_context(&lines, 2));

    let polling: Vec<String> = ["loop {", "    tokio::time::sleep(Duration::from_millis(10)).await;"]
        .iter()
        .map(|l| (*l).to_string())
        .collect();
    assert!(!is_backoff_context(&polling, 1));
}
