//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: `async fn` bodies in `switchboard/core` MUST NOT use blocking
//! I/O. Synchronous helpers (e.g. loading configuration before the runtime
//! starts) may.

use std::path::Path;

use architectural_enforcement::{
    core_source_root, enclosing_fn_is_async, production_lines, read_source, rust_files, Violation,
};

const BLOCKING_PATTERNS: &[(&str, &str)] = &[
    ("std::fs::", "blocking file I/O"),
    ("std::net::", "blocking network I/O"),
    ("std::process::Command", "blocking process I/O"),
    ("reqwest::blocking", "blocking HTTP client"),
    ("std::io::stdin()", "blocking stdin"),
    ("std::io::stdout()", "blocking stdout"),
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let root = core_source_root();
    assert!(root.exists(), "source root missing: {}", root.display());

    let violations: Vec<Violation> = rust_files(&root)
        .iter()
        .flat_map(|path| check_file(path))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found in async code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED: tokio::fs, tokio::net, tokio::process inside async fns");
        panic!("Found {} blocking I/O violation(s)", violations.len());
    }
}

fn check_file(path: &Path) -> Vec<Violation> {
    let content = read_source(path);
    let all_lines: Vec<&str> = content.lines().collect();
    check_lines(path, &all_lines, &production_lines(&content))
}

fn check_lines(path: &Path, all_lines: &[&str], production: &[(usize, &str)]) -> Vec<Violation> {
    production
        .iter()
        .filter(|(idx, _)| enclosing_fn_is_async(all_lines, *idx) == Some(true))
        .filter_map(|(idx, code)| {
            let (_, rule) = BLOCKING_PATTERNS.iter().find(|(pattern, _)| code.contains(pattern))?;
            Some(Violation {
                path: path.to_path_buf(),
                line: idx + 1,
                rule: *rule,
                text: code.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_read_in_async_fn_flagged() {
        let lines = vec![
            "pub async fn reload(&self) {",
            "    let text = std::fs::read_to_string(&self.path);",
            "}",
        ];
        let production: Vec<(usize, &str)> = lines.iter().copied().enumerate().collect();
        let violations = check_lines(Path::new("x.rs"), &lines, &production);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "blocking file I/O");
        assert_eq!(violations[0].line, 2);
    }

    #[test]
    fn test_sync_fn_allowed() {
        let lines = vec![
            "    pub fn from_path(path: &Path) -> Result<Self> {",
            "        let content = std::fs::read_to_string(path)?;",
            "    }",
        ];
        let production: Vec<(usize, &str)> = lines.iter().copied().enumerate().collect();
        assert!(check_lines(Path::new("x.rs"), &lines, &production).is_empty());
    }
}
