//! pytest terminal output, grammar version 1.
//!
//! Recognizes the final summary line, the short test summary
//! (`FAILED`/`ERROR` lines emitted with `-rfE`) and, as a fallback for
//! messages, the `E   ` lines of each failure section.

use regex::Regex;
use std::sync::OnceLock;

use super::{ParsedReport, ReportFormat, TestFailure};

/// Parser for pytest output.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PytestFormat;

impl ReportFormat for PytestFormat {
    fn name(&self) -> &'static str {
        "pytest"
    }

    fn version(&self) -> u32 {
        1
    }

    fn parse(&self, stdout: &str, stderr: &str) -> ParsedReport {
        let mut report = ParsedReport::default();
        let Some(summary) = find_summary(stdout).or_else(|| find_summary(stderr)) else {
            return report;
        };

        for caps in count_re().captures_iter(summary) {
            let n: u32 = caps[1].parse().unwrap_or(0);
            match &caps[2] {
                "passed" | "xpassed" => report.passed = report.passed.saturating_add(n),
                "failed" => report.failed = report.failed.saturating_add(n),
                "error" | "errors" => report.errors = report.errors.saturating_add(n),
                "skipped" | "xfailed" => report.skipped = report.skipped.saturating_add(n),
                _ => {}
            }
        }

        let sections = failure_sections(stdout);
        for caps in short_summary_re().captures_iter(stdout) {
            let name = caps[2].rsplit("::").next().unwrap_or(&caps[2]).to_string();
            let message = caps
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .filter(|m| !m.is_empty())
                .or_else(|| section_message(&sections, &name))
                .unwrap_or_default();
            report.failures.push(TestFailure::new(name, message));
        }

        // Without -r flags only the sections are available.
        if report.failures.is_empty() {
            report.failures = sections
                .into_iter()
                .map(|(name, message)| TestFailure::new(name, message))
                .collect();
        }

        report
    }
}

fn summary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^=*\s*((?:no tests ran|\d+ \w+(?:, \d+ \w+)*) in \d+(?:\.\d+)?s\b.*?)\s*=*$")
            .expect("summary regex")
    })
}

fn count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+) (passed|failed|errors?|skipped|xfailed|xpassed|deselected|warnings?|rerun)\b")
            .expect("count regex")
    })
}

fn short_summary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(FAILED|ERROR) (\S+)(?: - (.*))?$").expect("short summary regex")
    })
}

fn section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^_{3,} (.+?) _{3,}$").expect("section regex"))
}

/// Returns the last summary line, without its `=` border.
fn find_summary(output: &str) -> Option<&str> {
    output
        .lines()
        .rev()
        .find_map(|line| summary_re().captures(line.trim()))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Collects `(test name, first E line)` for each failure section.
fn failure_sections(output: &str) -> Vec<(String, String)> {
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        if let Some(caps) = section_re().captures(line.trim_end()) {
            let title = caps[1].trim();
            let name = title
                .strip_prefix("ERROR at setup of ")
                .or_else(|| title.strip_prefix("ERROR at teardown of "))
                .or_else(|| title.strip_prefix("ERROR collecting "))
                .unwrap_or(title);
            current = Some(name.to_string());
            continue;
        }
        // A new `=` banner closes the failures block.
        if line.starts_with("===") {
            current = None;
            continue;
        }
        let Some(name) = current.as_ref() else {
            continue;
        };
        if let Some(rest) = line.strip_prefix('E') {
            if rest.starts_with(char::is_whitespace) && !sections.iter().any(|(n, _)| n == name) {
                sections.push((name.clone(), rest.trim().to_string()));
            }
        }
    }
    sections
}

fn section_message(sections: &[(String, String)], name: &str) -> Option<String> {
    sections
        .iter()
        .find(|(section, _)| {
            section == name
                || section
                    .rsplit_once('.')
                    .is_some_and(|(_, method)| method == name)
        })
        .map(|(_, message)| message.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSING: &str = "\
============================= test session starts ==============================
platform linux -- Python 3.11.9, pytest-8.3.2, pluggy-1.5.0
rootdir: /workspace
collected 1 item

test_calculator.py .                                                     [100%]

============================== 1 passed in 0.01s ===============================
";

    const FAILING: &str = "\
============================= test session starts ==============================
platform linux -- Python 3.11.9, pytest-8.3.2, pluggy-1.5.0
rootdir: /workspace
collected 1 item

test_calculator.py F                                                     [100%]

=================================== FAILURES ===================================
___________________________________ test_add ___________________________________

    def test_add():
>       assert add(2, 3) == 6
E       assert 5 == 6
E        +  where 5 = add(2, 3)

test_calculator.py:4: AssertionError
=========================== short test summary info ============================
FAILED test_calculator.py::test_add - assert 5 == 6
============================== 1 failed in 0.03s ===============================
";

    fn parse(stdout: &str) -> ParsedReport {
        PytestFormat.parse(stdout, "")
    }

    #[test]
    fn test_passing_run() {
        let report = parse(PASSING);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 0);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn test_failing_run() {
        let report = parse(FAILING);
        assert_eq!(report.passed, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(
            report.failures,
            vec![TestFailure::new("test_add", "assert 5 == 6")]
        );
    }

    #[test]
    fn test_summary_without_borders_any_order() {
        let report = parse("..F.s\n2 passed, 1 failed, 1 skipped, 3 warnings in 0.12s\n");
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn test_errors_counted() {
        let report = parse("=== 1 failed, 2 passed, 1 error in 1.50s ===\n");
        assert_eq!(report.errors, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.passed, 2);
    }

    #[test]
    fn test_last_summary_wins() {
        let report = parse("1 failed in 0.1s\n3 passed in 0.2s\n");
        assert_eq!(report.passed, 3);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_no_tests_ran() {
        let report = parse("============================ no tests ran in 0.01s =============================\n");
        assert_eq!(report, ParsedReport::default());
    }

    #[test]
    fn test_unrecognized_output() {
        let report = parse("python: can't open file 'pytest': No such file or directory\n");
        assert_eq!(report, ParsedReport::default());
    }

    #[test]
    fn test_summary_on_stderr() {
        let report = PytestFormat.parse("", "1 passed in 0.01s\n");
        assert_eq!(report.passed, 1);
    }

    #[test]
    fn test_collection_error_short_summary() {
        let output = "\
==================================== ERRORS ====================================
_____________________ ERROR collecting test_calculator.py ______________________
E   ModuleNotFoundError: No module named 'calculator'
=========================== short test summary info ============================
ERROR test_calculator.py - ModuleNotFoundError: No module named 'calculator'
!!!!!!!!!!!!!!!!!!!! Interrupted: 1 error during collection !!!!!!!!!!!!!!!!!!!!!
=============================== 1 error in 0.05s ===============================
";
        let report = parse(output);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "test_calculator.py");
        assert!(report.failures[0].message.starts_with("ModuleNotFoundError"));
    }

    #[test]
    fn test_message_falls_back_to_section() {
        let output = "\
=================================== FAILURES ===================================
__________________________ TestCalc.test_subtract ___________________________

E       AssertionError: wrong sign

=========================== short test summary info ============================
FAILED tests/test_calc.py::TestCalc::test_subtract
============================== 1 failed in 0.02s ===============================
";
        let report = parse(output);
        assert_eq!(
            report.failures,
            vec![TestFailure::new("test_subtract", "AssertionError: wrong sign")]
        );
    }

    #[test]
    fn test_sections_used_without_short_summary() {
        let output = "\
=================================== FAILURES ===================================
___________________________________ test_add ___________________________________
E       assert 5 == 6
___________________________________ test_mul ___________________________________
E       assert 6 == 7
============================== 2 failed in 0.03s ===============================
";
        let report = parse(output);
        assert_eq!(report.failed, 2);
        assert_eq!(
            report.failures,
            vec![
                TestFailure::new("test_add", "assert 5 == 6"),
                TestFailure::new("test_mul", "assert 6 == 7"),
            ]
        );
    }

    #[test]
    fn test_parametrized_name_kept() {
        let output = "\
FAILED test_calc.py::test_add[2-3-6] - assert 5 == 6
1 failed, 2 passed in 0.04s
";
        let report = parse(output);
        assert_eq!(report.failures[0].name, "test_add[2-3-6]");
    }
}
