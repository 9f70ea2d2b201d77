//! Architectural Enforcement
//!
//! Source-scanning helpers shared by the enforcement tests in `tests/`:
//! - No sleeps in production code outside retry backoff
//! - No blocking I/O inside async functions
//!
//! Only production code is scanned. Inline `#[cfg(test)] mod` blocks and
//! test-only helper files are skipped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Files that are compiled only under `cfg(test)`
const TEST_ONLY_FILES: &[&str] = &["test_utils.rs"];

/// Production source roots, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["engine/core/src", "engine/cli/src"];

/// A rule violation at one source line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
    pub reason: &'static str,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.text
        )
    }
}

/// Workspace root (two levels above this crate)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Production `.rs` files under every production root
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            let file = entry.path();
            let is_rust = file.extension().and_then(|s| s.to_str()) == Some("rs");
            let test_only = file
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| TEST_ONLY_FILES.contains(&name));
            if is_rust && !test_only {
                files.push(file.to_path_buf());
            }
        }
    }

    files.sort();
    files
}

/// Read a file's lines, dropping everything from the test module onward
#[must_use]
pub fn production_lines(path: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    strip_test_module(&content)
}

/// Lines before the first `#[cfg(test)]` that introduces an inline module
#[must_use]
pub fn strip_test_module(content: &str) -> Vec<String> {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        if line.trim() == "#[cfg(test)]" {
            let next = lines
                .iter()
                .skip(idx + 1)
                .map(|l| l.trim())
                .find(|l| !l.is_empty());
            if next.is_some_and(|l| l.starts_with("mod ") && l.ends_with('{')) {
                break;
            }
        }
        kept.push((*line).to_string());
    }
    kept
}

/// The part of a line before any `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether the nearest enclosing `fn` above `idx` is async
#[must_use]
pub fn is_in_async_function(lines: &[String], idx: usize) -> bool {
    for line in lines[..idx].iter().rev() {
        let trimmed = line.trim();
        if trimmed.contains("async fn ") {
            return true;
        }
        if trimmed.contains("fn ") {
            return false;
        }
        if trimmed.starts_with("mod ") || (trimmed.starts_with("impl") && trimmed.contains('{')) {
            return false;
        }
    }
    false
}

/// Scan every production file with `check`, collecting violations
pub fn scan<F>(mut check: F) -> Vec<Violation>
where
    F: FnMut(&Path, &[String], usize) -> Option<&'static str>,
{
    let mut violations = Vec::new();
    for path in production_files() {
        let lines = production_lines(&path);
        for idx in 0..lines.len() {
            if let Some(reason) = check(&path, &lines, idx) {
                violations.push(Violation {
                    path: path.clone(),
                    line: idx + 1,
                    text: lines[idx].trim().to_string(),
                    reason,
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| (*l).to_string()).collect()
    }

    #[test]
    fn test_strip_test_module() {
        let content = "use a;\n#[cfg(test)]\npub mod test_utils;\nfn f() {}\n#[cfg(test)]\nmod tests {\n    fn t() {}\n}\n";
        let kept = strip_test_module(content);
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[3], "fn f() {}");
    }

    #[test]
    fn test_async_detection() {
        let lines = owned(&[
            "pub async fn load(path: &Path) {",
            "    let x = 1;",
            "}",
            "fn sync_helper() {",
            "    let y = 2;",
            "}",
        ]);
        assert!(is_in_async_function(&lines, 1));
        assert!(!is_in_async_function(&lines, 4));
    }

    #[test]
    fn test_code_part_drops_comments() {
        assert_eq!(code_part("let a = 1; // std::fs::read"), "let a = 1; ");
    }

    #[test]
    fn test_production_files_found() {
        let files = production_files();
        assert!(files.iter().any(|f| f.ends_with("resilience/retry.rs")));
        assert!(!files.iter().any(|f| f.ends_with("test_utils.rs")));
    }
}
