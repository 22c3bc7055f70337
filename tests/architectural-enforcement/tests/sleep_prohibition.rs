//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in `switchboard/core` MUST NOT sleep.
//! **Exceptions**: retry backoff (`routing/retry.rs`), simulated latency in the
//! mock backend (`backend/mock.rs`), test code. Even there only the async
//! `tokio::time::sleep` is allowed; `std::thread::sleep` is never allowed.

use std::path::Path;

use architectural_enforcement::{core_source_root, production_lines, read_source, rust_files, Violation};

/// Files where awaiting a timer is the point
const ASYNC_SLEEP_ALLOWED: &[&str] = &["routing/retry.rs", "backend/mock.rs"];

#[test]
fn test_no_sleep_in_production_code() {
    let root = core_source_root();
    assert!(root.exists(), "source root missing: {}", root.display());

    let violations: Vec<Violation> = rust_files(&root)
        .iter()
        .flat_map(|path| check_file(&root, path))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE: tokio::time::sleep in retry backoff or the mock backend");
        eprintln!("❌ FORBIDDEN: std::thread::sleep anywhere, polling loops, sleep as synchronization");
        panic!("Found {} sleep violation(s) in production code", violations.len());
    }
}

fn check_file(root: &Path, path: &Path) -> Vec<Violation> {
    let relative = path
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    let async_allowed = ASYNC_SLEEP_ALLOWED.contains(&relative.as_str());

    let content = read_source(path);
    production_lines(&content)
        .into_iter()
        .filter_map(|(idx, code)| {
            let rule = classify_sleep(code, async_allowed)?;
            Some(Violation {
                path: path.to_path_buf(),
                line: idx + 1,
                rule,
                text: code.trim().to_string(),
            })
        })
        .collect()
}

fn classify_sleep(code: &str, async_allowed: bool) -> Option<&'static str> {
    if code.contains("thread::sleep(") {
        return Some("blocking sleep");
    }
    if (code.contains("::sleep(") || code.contains(".sleep(")) && !async_allowed {
        return Some("sleep outside backoff");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_sleep_always_flagged() {
        assert_eq!(
            classify_sleep("    std::thread::sleep(delay);", true),
            Some("blocking sleep")
        );
    }

    #[test]
    fn test_async_sleep_allowlist() {
        let line = "            () = tokio::time::sleep(delay) => {}";
        assert_eq!(classify_sleep(line, true), None);
        assert_eq!(classify_sleep(line, false), Some("sleep outside backoff"));
    }
}
