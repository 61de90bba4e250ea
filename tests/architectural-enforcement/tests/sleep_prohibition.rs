//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT sleep to wait for events.
//! **Exceptions**: Retry backoff, named admission pacing waits (token refill,
//! reservoir refresh, request spacing), simulated provider latency, test code.

use architectural_enforcement::{code_part, rust_sources, workspace_root, SOURCE_ROOTS};

/// Comments that mark an intentional pacing wait
const PACING_MARKERS: &[&str] = &[
    "// Refill pacing",
    "// Reservoir refresh wait",
    "// Request spacing",
    "// Simulated latency",
];

#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Unexplained sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Backoff between retry attempts");
        eprintln!("  - Admission pacing marked with one of: {}", PACING_MARKERS.join(", "));
        eprintln!("  - Test code");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep as poor man's synchronization");
        eprintln!("  - Sleep to 'wait' for a permit (use the waiter queue)");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn find_sleep_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for root in SOURCE_ROOTS {
        for file in rust_sources(&workspace_root().join(root)) {
            for (idx, line) in file.lines.iter().enumerate() {
                let code = code_part(line);
                if !(code.contains("::sleep(") || code.contains(".sleep(")) {
                    continue;
                }
                if is_pacing_context(&file.lines, idx) || is_backoff_context(&file.lines, idx) {
                    continue;
                }
                violations.push(format!(
                    "{}:{} - {}",
                    file.path.display(),
                    idx + 1,
                    line.trim()
                ));
            }
        }
    }

    violations
}

/// A pacing marker comment within the 20 lines above
fn is_pacing_context(lines: &[String], idx: usize) -> bool {
    lines[idx.saturating_sub(20)..=idx]
        .iter()
        .any(|line| PACING_MARKERS.iter().any(|marker| line.trim() == *marker))
}

/// Retry or backoff wording within the 15 lines above
fn is_backoff_context(lines: &[String], idx: usize) -> bool {
    lines[idx.saturating_sub(15)..=idx].iter().any(|line| {
        let line = line.to_lowercase();
        line.contains("retry") || line.contains("retrying") || line.contains("backing off")
    })
}

#[test]
fn test_backoff_detection() {
    let code: Vec<String> = [
        "let delay = calculate_delay(&classified, attempt, opts);",
        "tracing::debug!(\"Retrying after backoff\");",
        "tokio::time::sleep(delay).await;",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    assert!(is_backoff_context(&code, 2), "Should detect retry backoff");
}

#[test]
fn test_unmarked_sleep_is_flagged() {
    let code: Vec<String> = ["loop {", "    if ready() { break; }", "    tokio::time::sleep(tick).await;", "}"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    assert!(!is_pacing_context(&code, 2));
    assert!(!is_backoff_context(&code, 2));
}
