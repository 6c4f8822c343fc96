//! Test runner output parsing and aggregation.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Counts {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: u32,
}

impl Counts {
    pub fn total(&self) -> u32 {
        self.passed + self.failed + self.skipped + self.errors
    }

    pub fn add(&mut self, other: Counts) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

fn count_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+) (passed|failed|skipped|errors?|xfailed|xpassed)").unwrap()
    })
}

fn coverage_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)^TOTAL\s.*?(\d+(?:\.\d+)?)%\s*$").unwrap())
}

/// Counts from the final pytest summary line (`=== 3 passed, 1 failed in 0.12s ===`).
///
/// Only the last line carrying counts is used, so per-test progress noise is ignored.
pub fn parse_counts(output: &str) -> Counts {
    let Some(summary) = output
        .lines()
        .rev()
        .find(|line| count_pattern().is_match(line) && line.contains(" in "))
    else {
        return Counts::default();
    };

    let mut counts = Counts::default();
    for caps in count_pattern().captures_iter(summary) {
        let n: u32 = caps[1].parse().unwrap_or(0);
        match &caps[2] {
            "passed" | "xpassed" => counts.passed += n,
            "failed" => counts.failed += n,
            "skipped" | "xfailed" => counts.skipped += n,
            _ => counts.errors += n,
        }
    }
    counts
}

/// Total coverage percentage from a coverage.py terminal report.
pub fn parse_coverage(output: &str) -> Option<f64> {
    coverage_pattern()
        .captures_iter(output)
        .last()
        .and_then(|caps| caps[1].parse().ok())
}
