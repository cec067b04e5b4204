use super::{BuildCounts, LogAnalyzer, StepResult};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PASSED: Regex =
        Regex::new(r"^Building (\S+):(\S+) \.\.\. passed$").expect("valid passed regex");
    static ref FAILED: Regex =
        Regex::new(r"^Building (\S+):(\S+) \.\.\. failed$").expect("valid failed regex");
    static ref SKIPPED: Regex =
        Regex::new(r"^Building (\S+):(\S+) \.\.\. failed \(\S+\)").expect("valid skipped regex");
}

/// Counts `Building <arch>:<config> ... passed|failed|failed (reason)` lines
/// of a compile-only build run.
#[derive(Debug, Clone, Default)]
pub struct BuildLogAnalyzer {
    counts: BuildCounts,
}

impl BuildLogAnalyzer {
    pub fn counts(&self) -> &BuildCounts {
        &self.counts
    }
}

impl LogAnalyzer for BuildLogAnalyzer {
    fn observe_line(&mut self, line: &str) {
        if !line.starts_with("Building ") {
            return;
        }
        let counts = &mut self.counts;
        counts.total += 1;
        if PASSED.is_match(line) {
            counts.passed += 1;
        }
        if let Some(captures) = FAILED.captures(line) {
            counts.failed += 1;
            counts
                .failures
                .push((captures[1].to_string(), captures[2].to_string()));
        }
        if SKIPPED.is_match(line) {
            counts.skipped += 1;
        }
    }

    fn result(&self) -> StepResult {
        self.counts.base_result().unwrap_or(StepResult::Success)
    }

    fn summary_text(&self) -> Vec<String> {
        let mut text = Vec::new();
        self.counts.summary_words(&mut text);
        text
    }

    fn detailed_text(&self) -> Vec<String> {
        let mut text = vec!["<br>".to_string()];
        self.counts.summary_words(&mut text);
        if self.counts.failed > 0 {
            text.push("<!-- ".to_string());
            self.counts.failure_words(&mut text);
            text.push("-->".to_string());
        }
        text
    }
}
