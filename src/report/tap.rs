//! Test Anything Protocol, version 13.

use regex::Regex;
use std::sync::OnceLock;

use super::{ParsedReport, ReportFormat, TestFailure};

/// Parser for TAP output.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TapFormat;

impl ReportFormat for TapFormat {
    fn name(&self) -> &'static str {
        "tap"
    }

    fn version(&self) -> u32 {
        13
    }

    fn parse(&self, stdout: &str, _stderr: &str) -> ParsedReport {
        let mut report = ParsedReport::default();
        let lines: Vec<&str> = stdout.lines().collect();

        for (i, line) in lines.iter().enumerate() {
            if let Some(reason) = line.strip_prefix("Bail out!") {
                report.errors = report.errors.saturating_add(1);
                report
                    .failures
                    .push(TestFailure::new("Bail out!", reason.trim()));
                break;
            }

            // Indented test points belong to subtests.
            let Some(caps) = test_point_re().captures(line) else {
                continue;
            };
            let ok = &caps[1] == "ok";
            let number = caps.get(2).map_or("", |m| m.as_str());
            let description = caps.get(3).map_or("", |m| m.as_str().trim());
            let directive = caps.get(4).map(|m| m.as_str().to_ascii_uppercase());

            match (ok, directive.as_deref()) {
                (_, Some(d)) if d.starts_with("SKIP") => {
                    report.passed = report.passed.saturating_add(1);
                }
                (false, Some(d)) if d.starts_with("TODO") => {
                    report.skipped = report.skipped.saturating_add(1);
                }
                (true, _) => report.passed = report.passed.saturating_add(1),
                (false, _) => {
                    report.failed = report.failed.saturating_add(1);
                    let name = if description.is_empty() {
                        format!("test {number}")
                    } else {
                        description.to_string()
                    };
                    let message = diagnostic_message(&lines[i + 1..]);
                    report.failures.push(TestFailure::new(name, message));
                }
            }
        }

        report
    }
}

fn test_point_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(not ok|ok)\b\s*(\d+)?\s*(?:-\s*)?(.*?)\s*(?:#\s*((?i:skip|todo)\S*.*))?$")
            .expect("test point regex")
    })
}

/// Extracts a failure message from the lines following a test point:
/// a YAML `message:` field, else the `#` diagnostics.
fn diagnostic_message(following: &[&str]) -> String {
    let mut diagnostics = Vec::new();
    let mut in_yaml = false;

    for line in following {
        let trimmed = line.trim();
        if in_yaml {
            if trimmed == "..." {
                break;
            }
            if let Some(value) = trimmed.strip_prefix("message:") {
                return unquote(value.trim()).to_string();
            }
            continue;
        }
        if trimmed == "---" && line.starts_with(char::is_whitespace) {
            in_yaml = true;
        } else if let Some(text) = trimmed.strip_prefix('#') {
            diagnostics.push(text.trim());
        } else {
            break;
        }
    }
    diagnostics.join("\n")
}

fn unquote(value: &str) -> &str {
    ['\'', '"']
        .iter()
        .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
        .unwrap_or(value)
}
