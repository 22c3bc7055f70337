//! Architectural Enforcement
//!
//! Source scanners backing the policy tests in `tests/`:
//! - No sleeping in production code outside retry backoff and the mock backend
//! - No blocking I/O inside `async fn` bodies
//! - `missing_docs` denied at the crate root, opted out of only by routing
//!
//! Scans are textual. Everything from the first `#[cfg(test)]` line of a file
//! onward is treated as test code and skipped.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// One policy breach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub rule: &'static str,
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.text
        )
    }
}

/// `switchboard/core/src`, resolved from this crate's manifest
pub fn core_source_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../switchboard/core/src")
}

/// Every `.rs` file under `root`, sorted
pub fn rust_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Read a file; unreadable files scan as empty
pub fn read_source(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

/// Production lines as `(0-based index, code without trailing comment)`
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(idx, line)| (idx, line.split("//").next().unwrap_or(line)))
        .collect()
}

/// Whether the trimmed line declares a function, and if so whether it is async
///
/// Handles visibility and qualifier prefixes (`pub`, `pub(crate)`, `const`,
/// `unsafe`, `async`).
pub fn fn_declaration(line: &str) -> Option<bool> {
    let mut rest = line.trim();
    let mut is_async = false;
    loop {
        if let Some(tail) = rest.strip_prefix("fn ") {
            return (!tail.is_empty()).then_some(is_async);
        }
        let next = ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe ", "async "]
            .iter()
            .find_map(|prefix| rest.strip_prefix(prefix).map(|tail| (*prefix, tail)));
        match next {
            Some((prefix, tail)) => {
                is_async |= prefix == "async ";
                rest = tail.trim_start();
            }
            None => return None,
        }
    }
}

/// Whether the function enclosing line `idx` is `async`; `None` at item level
pub fn enclosing_fn_is_async(lines: &[&str], idx: usize) -> Option<bool> {
    lines[..=idx.min(lines.len().saturating_sub(1))]
        .iter()
        .rev()
        .find_map(|line| fn_declaration(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_declaration_prefixes() {
        assert_eq!(fn_declaration("fn main() {"), Some(false));
        assert_eq!(fn_declaration("    pub fn from_path(path: &Path) {"), Some(false));
        assert_eq!(fn_declaration("pub(crate) async fn run(&self) {"), Some(true));
        assert_eq!(fn_declaration("    async fn initialize(&self) -> Result<()>;"), Some(true));
        assert_eq!(fn_declaration("let f = || async move {"), None);
        assert_eq!(fn_declaration("// fn commented"), None);
    }

    #[test]
    fn test_enclosing_fn() {
        let lines = vec![
            "impl Loader {",
            "    pub fn load() {",
            "        std::fs::read_to_string(p);",
            "    }",
            "    pub async fn reload() {",
            "        std::fs::read_to_string(p);",
            "    }",
            "}",
        ];
        assert_eq!(enclosing_fn_is_async(&lines, 2), Some(false));
        assert_eq!(enclosing_fn_is_async(&lines, 5), Some(true));
        assert_eq!(enclosing_fn_is_async(&lines, 0), None);
    }

    #[test]
    fn test_production_lines_stop_at_tests() {
        let content = "fn a() {} // note\n#[cfg(test)]\nmod tests {}\n";
        let lines = production_lines(content);
        assert_eq!(lines, vec![(0, "fn a() {} ")]);
    }
}
