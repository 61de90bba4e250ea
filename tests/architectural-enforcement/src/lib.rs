//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the dispatch crates:
//! - Every wait in production code is a named pacing or backoff wait
//! - No blocking I/O inside async functions
//!
//! The helpers here are shared by the tests under `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const SOURCE_ROOTS: &[&str] = &["dispatch/core/src"];

/// A Rust source file with its production lines
pub struct SourceFile {
    pub path: PathBuf,
    /// Lines before the first `#[cfg(test)]`
    pub lines: Vec<String>,
}

/// Workspace root, two levels above this crate
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// All `.rs` files under `dir`, with test modules cut off
pub fn rust_sources(dir: &Path) -> Vec<SourceFile> {
    if !dir.exists() {
        return Vec::new();
    }

    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|e| {
            let content = fs::read_to_string(e.path()).ok()?;
            Some(SourceFile {
                path: e.path().to_path_buf(),
                lines: production_lines(&content),
            })
        })
        .collect()
}

/// Lines up to (not including) the first `#[cfg(test)]`
pub fn production_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(str::to_string)
        .collect()
}

/// The part of a line before any `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether the nearest enclosing `fn` above `idx` is async
pub fn is_in_async_function(lines: &[String], idx: usize) -> bool {
    for line in lines[..=idx].iter().rev() {
        let code = code_part(line);
        if code.contains("fn ") {
            return code.contains("async fn");
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let lines = production_lines("fn a() {}\n#[cfg(test)]\nmod tests {}\n");
        assert_eq!(lines, vec!["fn a() {}".to_string()]);
    }

    #[test]
    fn test_async_function_detection() {
        let lines: Vec<String> = ["pub async fn load() {", "    read();", "}", "fn sync() {", "    read();"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(is_in_async_function(&lines, 1));
        assert!(!is_in_async_function(&lines, 4));
    }

    #[test]
    fn test_source_roots_exist() {
        for root in SOURCE_ROOTS {
            assert!(workspace_root().join(root).exists(), "missing {root}");
        }
    }
}
