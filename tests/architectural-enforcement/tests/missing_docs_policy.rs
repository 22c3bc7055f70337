//! Integration Test: Documentation Lint
//!
//! **Policy**: `switchboard/core` denies `missing_docs` at the crate root.
//! Only the routing module may opt out.

use architectural_enforcement::{core_source_root, read_source, rust_files};

const DENY: &str = "#![deny(missing_docs)]";
const ALLOW: &str = "#![allow(missing_docs)]";
const ALLOW_PERMITTED: &[&str] = &["routing/mod.rs"];

#[test]
fn test_crate_root_denies_missing_docs() {
    let lib = core_source_root().join("lib.rs");
    let content = read_source(&lib);
    assert!(
        content.lines().any(|line| line.trim() == DENY),
        "{} must carry {DENY}",
        lib.display()
    );
}

#[test]
fn test_missing_docs_opt_outs_are_limited() {
    let root = core_source_root();
    let offenders: Vec<String> = rust_files(&root)
        .iter()
        .filter(|path| read_source(path).lines().any(|line| line.trim() == ALLOW))
        .filter_map(|path| path.strip_prefix(&root).ok())
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        .filter(|rel| !ALLOW_PERMITTED.contains(&rel.as_str()))
        .collect();

    if !offenders.is_empty() {
        eprintln!("\n❌ Unexpected {ALLOW}:\n");
        for offender in &offenders {
            eprintln!("  ❌ {offender}");
        }
        panic!("Found {} missing_docs opt-out(s)", offenders.len());
    }
}
