//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async functions MUST NOT use blocking I/O.
//! **Acceptable**: Synchronous functions (config loading before the runtime
//! starts) and test code.

use architectural_enforcement::{
    code_part, is_in_async_function, rust_sources, workspace_root, SOURCE_ROOTS,
};

const BLOCKING_PATTERNS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::thread::sleep", "Blocking sleep"),
    ("std::process::Command", "Blocking process spawn"),
    ("reqwest::blocking", "Blocking HTTP client"),
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in async code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n✅ REQUIRED in async code:");
        eprintln!("  - tokio::fs, tokio::net, tokio::process, tokio::time::sleep");

        panic!(
            "\nFound {} blocking I/O violation(s) in async code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn find_blocking_io_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for root in SOURCE_ROOTS {
        for file in rust_sources(&workspace_root().join(root)) {
            for (idx, line) in file.lines.iter().enumerate() {
                let code = code_part(line);
                for (pattern, label) in BLOCKING_PATTERNS {
                    if code.contains(pattern) && is_in_async_function(&file.lines, idx) {
                        violations.push(format!(
                            "{}:{} - {}: {}",
                            file.path.display(),
                            idx + 1,
                            label,
                            line.trim()
                        ));
                    }
                }
            }
        }
    }

    violations
}

#[test]
fn test_thread_sleep_never_appears() {
    for root in SOURCE_ROOTS {
        for file in rust_sources(&workspace_root().join(root)) {
            for (idx, line) in file.lines.iter().enumerate() {
                assert!(
                    !code_part(line).contains("std::thread::sleep"),
                    "{}:{} blocks a runtime thread",
                    file.path.display(),
                    idx + 1
                );
            }
        }
    }
}
