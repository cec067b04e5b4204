//! Analysis of build tool output: pass/fail/skip counts, a step result, and
//! the short and detailed status texts shown on the build pages.

mod build_log;
mod qemu_log;
mod reference;

pub use build_log::BuildLogAnalyzer;
pub use qemu_log::{KunitCounts, QemuLogAnalyzer};
pub use reference::BuildReference;

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::io::BufRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepResult {
    Success,
    Warnings,
    Failure,
    Skipped,
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepResult::Success => "success",
            StepResult::Warnings => "warnings",
            StepResult::Failure => "failure",
            StepResult::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Build / boot counters shared by both log flavours.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildCounts {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// `(arch, config)` or `(arch, machine)` of every failure, in log order.
    pub failures: Vec<(String, String)>,
}

impl BuildCounts {
    fn summary_words(&self, text: &mut Vec<String>) {
        text.push(format!("total: {}", self.total));
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

    fn failure_words(&self, text: &mut Vec<String>) {
        for (arch, config) in &self.failures {
            text.push(format!("{}:{} ", arch, config));
        }
    }

    /// Failures decide first, then the absence of passes.
    fn base_result(&self) -> Option<StepResult> {
        if self.failed > 0 {
            if self.passed == 0 {
                return Some(StepResult::Failure);
            }
            return Some(StepResult::Warnings);
        }
        if self.passed == 0 {
            return Some(StepResult::Skipped);
        }
        None
    }
}

/// A line-by-line observer of a build step's output.
pub trait LogAnalyzer {
    fn observe_line(&mut self, line: &str);

    fn result(&self) -> StepResult;

    /// Short status words, e.g. `["total: 12", "pass: 11", "fail: 1"]`.
    fn summary_text(&self) -> Vec<String>;

    /// Detailed status words including the HTML comment payloads.
    fn detailed_text(&self) -> Vec<String>;
}

/// Everything a finished step reports.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: String,
    pub result: StepResult,
    pub reference: Option<String>,
    pub summary: String,
    pub detailed: String,
}

/// Feed every line of `reader` to `analyzer` and the reference observer, and
/// render the resulting report.
///
/// Console output may carry stray bytes; invalid UTF-8 is replaced rather
/// than failing the step.
pub fn analyze<R: BufRead, A: LogAnalyzer>(
    step: &str,
    mut reader: R,
    analyzer: &mut A,
) -> Result<StepReport> {
    let mut reference = BuildReference::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .context("Failed to read log line")?;
        if read == 0 {
            break;
        }
        let raw = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        reference.observe_line(&line);
        analyzer.observe_line(&line);
    }

    let mut summary = vec![step.to_string()];
    let mut detailed = Vec::new();
    if let Some(r) = reference.get() {
        summary.push(r.to_string());
        detailed.push(r.to_string());
    }
    summary.extend(analyzer.summary_text());
    detailed.extend(analyzer.detailed_text());

    Ok(StepReport {
        step: step.to_string(),
        result: analyzer.result(),
        reference: reference.get().map(str::to_string),
        summary: summary.join(" "),
        detailed: detailed.join(" "),
    })
}
