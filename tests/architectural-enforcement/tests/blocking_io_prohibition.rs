//! Enforcement: All I/O Must Be Async
//!
//! **Policy**: async functions in the engine and the CLI must not use
//! blocking I/O. Use `tokio::fs`, `tokio::net`, `tokio::process` and the
//! async `reqwest` client.
//! **Acceptable**: synchronous code that runs before the runtime starts,
//! and test modules.

use architectural_enforcement::{code_part, is_in_async_function, scan};

/// Blocking APIs and why each is rejected
const FORBIDDEN: &[(&str, &str)] = &[
    ("std::fs::", "blocking file I/O"),
    ("use std::fs", "blocking file I/O"),
    ("std::net::", "blocking network I/O"),
    ("use std::net", "blocking network I/O"),
    ("std::process::Command", "blocking process I/O"),
    ("reqwest::blocking", "blocking HTTP client"),
    ("std::thread::sleep", "blocking sleep"),
];

fn blocking_call(code: &str) -> Option<&'static str> {
    FORBIDDEN
        .iter()
        .find(|(pattern, _)| code.contains(pattern))
        .map(|(_, reason)| *reason)
}

#[test]
fn test_no_blocking_io_in_async_code() {
    let violations = scan(|_path, lines, idx| {
        let reason = blocking_call(code_part(&lines[idx]))?;
        let at_module_level = reason == "blocking file I/O" || reason == "blocking network I/O";
        let imported = lines[idx].trim_start().starts_with("use ");
        (is_in_async_function(lines, idx) || (imported && at_module_level)).then_some(reason)
    });

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::fs, tokio::net, tokio::process or the async reqwest client.");
        panic!("found {} blocking I/O violation(s)", violations.len());
    }
}

#[test]
fn test_blocking_call_detection() {
    assert_eq!(
        blocking_call("let s = std::fs::read_to_string(path)?;"),
        Some("blocking file I/O")
    );
    assert_eq!(
        blocking_call("let c = reqwest::blocking::Client::new();"),
        Some("blocking HTTP client")
    );
    assert_eq!(blocking_call("let s = tokio::fs::read_to_string(path).await?;"), None);
}
