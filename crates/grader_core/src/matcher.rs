use std::collections::BTreeSet;

use regex::Regex;

use crate::config::{Color, ColorMode};
use crate::error::{GraderError, TestFailure};
use crate::Control;

const CONTEXT_LINES: usize = 2;
const TAIL_LINES: usize = 5;

/// Line-oriented regex checks over one run's console output.
///
/// Each required pattern is satisfied by the first line it matches, and a line
/// satisfies at most one pattern. Any line matching a forbidden pattern is a
/// violation no matter what else matched.
#[derive(Debug, Clone, Default)]
pub struct OutputMatcher {
    required: Vec<Regex>,
    pending: Vec<usize>,
    forbidden: Vec<Regex>,
    stop_when_satisfied: bool,
    color: ColorMode,
    partial: Vec<u8>,
    lines: Vec<String>,
    good: BTreeSet<usize>,
    bad: BTreeSet<usize>,
}

impl OutputMatcher {
    pub fn new() -> Self {
        Self {
            color: ColorMode::Never,
            ..Self::default()
        }
    }

    pub fn require_all<I, S>(mut self, patterns: I) -> Result<Self, GraderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.pending.push(self.required.len());
            self.required.push(Regex::new(pattern.as_ref())?);
        }
        Ok(self)
    }

    pub fn forbid_any<I, S>(mut self, patterns: I) -> Result<Self, GraderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.forbidden.push(Regex::new(pattern.as_ref())?);
        }
        Ok(self)
    }

    /// Ask the run to stop as soon as every required pattern matched cleanly.
    pub fn stop_when_satisfied(mut self) -> Self {
        self.stop_when_satisfied = true;
        self
    }

    pub fn colored(mut self, color: ColorMode) -> Self {
        self.color = color;
        self
    }

    /// Checks every complete line in `chunk`; a trailing partial line waits for the
    /// next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Control {
        self.partial.extend_from_slice(chunk);
        while let Some(newline) = self.partial.iter().position(|b| *b == b'\n') {
            let rest = self.partial.split_off(newline + 1);
            let line = std::mem::replace(&mut self.partial, rest);
            self.check_line(&line[..newline]);
        }

        if self.stop_when_satisfied && self.is_satisfied() {
            Control::Stop
        } else {
            Control::Continue
        }
    }

    /// Checks whatever is left after the last newline as a final line.
    pub fn finish(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.check_line(&line);
        }
    }

    fn check_line(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches('\r');
        let lineno = self.lines.len();

        if let Some(pos) = self
            .pending
            .iter()
            .position(|&idx| self.required[idx].is_match(line))
        {
            self.pending.remove(pos);
            self.good.insert(lineno);
        }
        if self.forbidden.iter().any(|re| re.is_match(line)) {
            self.bad.insert(lineno);
        }
        self.lines.push(line.to_string());
    }

    /// All required patterns matched and no forbidden line was seen.
    pub fn is_satisfied(&self) -> bool {
        self.pending.is_empty() && self.bad.is_empty()
    }

    pub fn missing(&self) -> Vec<&str> {
        self.pending.iter().map(|&idx| self.required[idx].as_str()).collect()
    }

    pub fn violations(&self) -> Vec<&str> {
        self.bad.iter().map(|&n| self.lines[n].as_str()).collect()
    }

    pub fn verify(&mut self) -> Result<(), TestFailure> {
        self.finish();
        if self.is_satisfied() {
            Ok(())
        } else {
            Err(TestFailure::new(self.diagnostic()))
        }
    }

    /// Windowed view of the output around matched and forbidden lines, followed by
    /// every pattern still missing.
    pub fn diagnostic(&self) -> String {
        let total = self.lines.len();
        let mut show = BTreeSet::new();
        for &lineno in self.good.union(&self.bad) {
            let first = lineno.saturating_sub(CONTEXT_LINES);
            let last = (lineno + CONTEXT_LINES).min(total.saturating_sub(1));
            show.extend(first..=last);
        }
        if !self.pending.is_empty() {
            show.extend(total.saturating_sub(TAIL_LINES)..total);
        }

        let mut out = Vec::new();
        let mut next_expected = 0;
        let mut last_shown = None;
        for lineno in show {
            if lineno >= total {
                continue;
            }
            if lineno != next_expected {
                out.push("...".to_string());
            }
            let marker = if self.bad.contains(&lineno) {
                self.color.paint(Color::Red, "BAD ")
            } else if self.good.contains(&lineno) {
                self.color.paint(Color::Green, "GOOD")
            } else {
                "    ".to_string()
            };
            out.push(format!("{marker} {}", self.lines[lineno]));
            next_expected = lineno + 1;
            last_shown = Some(lineno);
        }
        if total > 0 && last_shown != Some(total - 1) {
            out.push("...".to_string());
        }
        if !self.bad.is_empty() {
            out.push("unexpected lines in output".to_string());
        }
        for pattern in self.missing() {
            out.push(format!("{} '{pattern}'", self.color.paint(Color::Red, "MISSING")));
        }
        out.join("\n")
    }
}

/// Checks complete `text` against required and forbidden patterns.
pub fn assert_lines_match(
    text: &str,
    required: &[&str],
    forbidden: &[&str],
) -> Result<(), GraderError> {
    let mut matcher = OutputMatcher::new()
        .require_all(required)?
        .forbid_any(forbidden)?;
    matcher.feed(text.as_bytes());
    matcher.verify()?;
    Ok(())
}
