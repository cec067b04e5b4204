use super::{BuildCounts, LogAnalyzer, StepResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

lazy_static! {
    static ref CURRENT: Regex =
        Regex::new(r"^Building ([^:\s]+):([^:\s]+):(\S+) \.+ running [\.R]+")
            .expect("valid current regex");
    static ref PASSED: Regex = Regex::new(r"^Building (\S+):(\S+) \.+ running [\.R]+ passed$")
        .expect("valid passed regex");
    static ref FAILED: Regex =
        Regex::new(r"^Building (\S+):(\S+) .*?failed.*$").expect("valid failed regex");
    static ref SKIPPED: Regex =
        Regex::new(r"^Building (\S+):(\S+) \.+ skipped.*$").expect("valid skipped regex");
    static ref KUNIT: Regex = Regex::new(
        r"^(?:\[ *\d+\.\d+\](?:\[ *T\d+\])? +)?# ([^:]+): pass:(\d+) fail:(\d+) skip:(\d+) total:\d+$"
    )
    .expect("valid kunit regex");
}

/// Substrings that show the kernel produced a backtrace or worse.
const TRACEBACK_MARKERS: &[&str] = &[
    "[ cut here ]",
    "Call Trace:",
    "Call trace:",
    "stack backtrace",
    "Kernel panic",
    "show_stack",
    "(try booting with the \"irqpoll\" option)",
];

/// `#` separates entries in the kunit payload, so it may not appear inside one.
fn sanitize(s: &str) -> String {
    s.replace('#', "_")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KunitCounts {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// `[arch, machine, suite]` of failing suites, deduplicated, in log order.
    pub failed_suites: Vec<[String; 3]>,
}

impl KunitCounts {
    fn any(&self) -> bool {
        self.passed > 0 || self.failed > 0 || self.skipped > 0
    }

    fn words(&self, text: &mut Vec<String>) {
        text.push("kunit: ".to_string());
        if self.passed > 0 {
            text.push(format!("pass: {}", self.passed));
        }
        if self.skipped > 0 {
            text.push(format!("skipped: {}", self.skipped));
        }
        if self.failed > 0 {
            text.push(format!("fail: {}", self.failed));
        }
    }
}

/// Analyzer for QEMU boot test runs, including kunit summaries.
#[derive(Debug, Clone, Default)]
pub struct QemuLogAnalyzer {
    counts: BuildCounts,
    kunit: KunitCounts,
    tracebacks: bool,
    /// `(arch, machine)` of the boot currently running.
    current: Option<(String, String)>,
}

impl QemuLogAnalyzer {
    pub fn counts(&self) -> &BuildCounts {
        &self.counts
    }

    pub fn kunit(&self) -> &KunitCounts {
        &self.kunit
    }

    pub fn has_tracebacks(&self) -> bool {
        self.tracebacks
    }

    fn observe_kunit(&mut self, line: &str) {
        let Some(captures) = KUNIT.captures(line) else {
            return;
        };
        let number = |i: usize| match captures[i].parse::<u64>() {
            Ok(n) => n,
            Err(e) => {
                warn!("Ignoring kunit count {:?} in {:?}: {}", &captures[i], line, e);
                0
            }
        };
        let suite = &captures[1];
        if suite == "Totals" {
            self.kunit.passed += number(2);
            self.kunit.failed += number(3);
            self.kunit.skipped += number(4);
        } else if number(3) > 0 {
            if let Some((arch, machine)) = &self.current {
                let entry = [arch.clone(), machine.clone(), sanitize(suite)];
                if !self.kunit.failed_suites.contains(&entry) {
                    self.kunit.failed_suites.push(entry);
                }
            }
        }
    }
}

impl LogAnalyzer for QemuLogAnalyzer {
    fn observe_line(&mut self, line: &str) {
        if let Some(captures) = CURRENT.captures(line) {
            self.current = Some((sanitize(&captures[1]), sanitize(&captures[2])));
        }

        let passed = PASSED.is_match(line);
        let failed = FAILED.captures(line);
        let skipped = SKIPPED.is_match(line);
        if passed || failed.is_some() || skipped {
            self.counts.total += 1;
        }
        if passed {
            self.counts.passed += 1;
        }
        if let Some(captures) = failed {
            self.counts.failed += 1;
            self.counts
                .failures
                .push((captures[1].to_string(), captures[2].to_string()));
        }
        if skipped {
            self.counts.skipped += 1;
        }

        if TRACEBACK_MARKERS.iter().any(|marker| line.contains(marker)) {
            self.tracebacks = true;
        }

        self.observe_kunit(line);
    }

    fn result(&self) -> StepResult {
        if let Some(result) = self.counts.base_result() {
            return result;
        }
        if self.tracebacks {
            return StepResult::Warnings;
        }
        StepResult::Success
    }

    fn summary_text(&self) -> Vec<String> {
        let mut text = Vec::new();
        self.counts.summary_words(&mut text);
        if self.kunit.any() {
            self.kunit.words(&mut text);
        }
        text
    }

    fn detailed_text(&self) -> Vec<String> {
        let mut text = vec!["<br>".to_string()];
        self.counts.summary_words(&mut text);
        if self.counts.failed > 0 {
            text.push("<!-- fail ".to_string());
            self.counts.failure_words(&mut text);
            text.push("fail -->".to_string());
        }
        if self.kunit.any() {
            text.push("<br>".to_string());
            self.kunit.words(&mut text);
            if self.kunit.failed > 0 {
                text.push("<!-- kunit ".to_string());
                let entries: Vec<String> = self
                    .kunit
                    .failed_suites
                    .iter()
                    .map(|entry| entry.join(":"))
                    .collect();
                text.push(entries.join("#"));
                text.push(" kunit -->".to_string());
            }
        }
        text
    }
}
