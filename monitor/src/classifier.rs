//! Extraction of failing tests from test runner output.
//!
//! The classifier turns the combined output of a test run into an ordered
//! list of [`FailureEntry`] values. It understands the reporting formats of a
//! few common runners and degrades to a single synthetic entry when the
//! output cannot be parsed, so a non-zero exit is never reported as "no
//! failures".
//!
//! Output is parsed line by line after ANSI colour codes are stripped.
//! Entries are deduplicated by test identifier and kept in order of first
//! appearance, which makes classification deterministic for identical input.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};

use crate::types::FailureEntry;

/// Number of trailing output lines kept in the synthetic failure message.
pub const TAIL_LINES: usize = 20;

/// Prefix of the synthetic entry identifier used when output cannot be parsed.
///
/// The full identifier appends a short digest of the output tail.
pub const UNPARSED_IDENTIFIER: &str = "unparsed-output";

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));

static CARGO_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^test (\S+) \.\.\. FAILED\s*$").expect("valid regex"));

static CARGO_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^---- (\S+) stdout ----\s*$").expect("valid regex"));

static PYTEST_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:FAILED|ERROR) (\S+)(?: - (.*))?$").expect("valid regex")
});

static PHPUNIT_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^There (?:was|were) \d+ (\w+?)s?:\s*$").expect("valid regex")
});

static PHPUNIT_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\) (\S+::\S+.*)$").expect("valid regex"));

static TAP_NOT_OK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*not ok (\d+)(?:\s*-)?\s*(.*?)\s*(#\s*(?i:todo|skip).*)?$").expect("valid regex")
});

/// Known runner output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Try every known format and keep the first that recognises failures.
    #[default]
    Auto,
    /// `cargo test` / libtest.
    Cargo,
    /// pytest short test summary.
    Pytest,
    /// PHPUnit failure and error listings.
    PhpUnit,
    /// Test Anything Protocol.
    Tap,
}

impl OutputFormat {
    /// Concrete formats tried by [`OutputFormat::Auto`], in order.
    const CONCRETE: [OutputFormat; 4] = [
        OutputFormat::Cargo,
        OutputFormat::Pytest,
        OutputFormat::PhpUnit,
        OutputFormat::Tap,
    ];
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cargo" | "libtest" => Ok(Self::Cargo),
            "pytest" => Ok(Self::Pytest),
            "phpunit" => Ok(Self::PhpUnit),
            "tap" => Ok(Self::Tap),
            other => Err(format!(
                "expected one of auto, cargo, pytest, phpunit, tap, got '{other}'"
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Cargo => "cargo",
            Self::Pytest => "pytest",
            Self::PhpUnit => "phpunit",
            Self::Tap => "tap",
        };
        f.write_str(name)
    }
}

/// Reasons a runner's output could not be turned into failure entries.
///
/// Never surfaces from [`ResultClassifier::classify`]; it is converted into
/// the synthetic tail entry there.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifierParseError {
    /// The output contains no failure in the expected format.
    #[error("no failing tests recognised in {format} output")]
    NoFailuresRecognised { format: OutputFormat },
}

/// Maps runner output and exit status to failing tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultClassifier {
    format: OutputFormat,
}

impl ResultClassifier {
    #[must_use]
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    #[must_use]
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Extracts the failing tests of a run.
    ///
    /// Returns an empty list for exit code 0, whatever the output says. For
    /// any other exit code the list is never empty.
    #[must_use]
    pub fn classify(&self, raw_output: &str, exit_code: i32) -> Vec<FailureEntry> {
        if exit_code == 0 {
            return Vec::new();
        }

        let cleaned = ANSI_ESCAPE.replace_all(raw_output, "");

        match self.parse(&cleaned) {
            Ok(failures) => {
                debug!(
                    format = %self.format,
                    failures = failures.len(),
                    "Classified test output"
                );
                failures
            }
            Err(e) => {
                debug!(error = %e, exit_code, "Falling back to output tail");
                vec![tail_entry(&cleaned, exit_code)]
            }
        }
    }

    fn parse(&self, output: &str) -> Result<Vec<FailureEntry>, ClassifierParseError> {
        match self.format {
            OutputFormat::Auto => {
                for format in OutputFormat::CONCRETE {
                    if let Ok(failures) = parse_format(format, output) {
                        trace!(format = %format, "Auto-detected output format");
                        return Ok(failures);
                    }
                }
                Err(ClassifierParseError::NoFailuresRecognised {
                    format: OutputFormat::Auto,
                })
            }
            format => parse_format(format, output),
        }
    }
}

fn parse_format(
    format: OutputFormat,
    output: &str,
) -> Result<Vec<FailureEntry>, ClassifierParseError> {
    let mut collected = OrderedFailures::default();
    match format {
        OutputFormat::Cargo => parse_cargo(output, &mut collected),
        OutputFormat::Pytest => parse_pytest(output, &mut collected),
        OutputFormat::PhpUnit => parse_phpunit(output, &mut collected),
        OutputFormat::Tap => parse_tap(output, &mut collected),
        OutputFormat::Auto => {}
    }

    if collected.is_empty() {
        Err(ClassifierParseError::NoFailuresRecognised { format })
    } else {
        Ok(collected.into_entries())
    }
}

/// Failure entries keyed by identifier, in first-seen order.
#[derive(Default)]
struct OrderedFailures {
    order: Vec<String>,
    messages: HashMap<String, String>,
}

impl OrderedFailures {
    fn insert(&mut self, id: &str, message: &str) {
        match self.messages.get_mut(id) {
            Some(existing) => {
                if existing.is_empty() && !message.is_empty() {
                    *existing = message.to_string();
                }
            }
            None => {
                self.order.push(id.to_string());
                self.messages.insert(id.to_string(), message.to_string());
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn into_entries(mut self) -> Vec<FailureEntry> {
        self.order
            .into_iter()
            .map(|id| {
                let message = self.messages.remove(&id).unwrap_or_default();
                FailureEntry::new(id, message)
            })
            .collect()
    }
}

fn parse_cargo(output: &str, collected: &mut OrderedFailures) {
    let lines: Vec<&str> = output.lines().collect();

    for line in &lines {
        if let Some(caps) = CARGO_FAILED.captures(line) {
            collected.insert(&caps[1], "");
        }
    }

    let mut i = 0;
    while i < lines.len() {
        let Some(caps) = CARGO_SECTION.captures(lines[i]) else {
            i += 1;
            continue;
        };
        let id = caps[1].to_string();
        let start = i + 1;
        let mut end = start;
        while end < lines.len()
            && !CARGO_SECTION.is_match(lines[end])
            && lines[end].trim() != "failures:"
        {
            end += 1;
        }
        let message = panic_message(&lines[start..end]);
        collected.insert(&id, &message);
        i = end;
    }
}

/// Picks the panic message out of a libtest stdout section.
fn panic_message(section: &[&str]) -> String {
    for (idx, line) in section.iter().enumerate() {
        if !line.contains("panicked at") {
            continue;
        }
        // Newer toolchains print the location on the panic line and the
        // message on the following lines.
        if line.trim_end().ends_with(':') {
            if let Some(next) = section[idx + 1..].iter().find(|l| !l.trim().is_empty()) {
                return next.trim().to_string();
            }
        }
        return line.trim().to_string();
    }
    section
        .iter()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .unwrap_or_default()
}

fn parse_pytest(output: &str, collected: &mut OrderedFailures) {
    for line in output.lines() {
        if let Some(caps) = PYTEST_SUMMARY.captures(line.trim_end()) {
            let message = caps.get(2).map_or("", |m| m.as_str().trim());
            collected.insert(&caps[1], message);
        }
    }
}

fn parse_phpunit(output: &str, collected: &mut OrderedFailures) {
    let lines: Vec<&str> = output.lines().collect();
    let mut in_failure_section = false;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim_end();
        if let Some(caps) = PHPUNIT_SECTION.captures(line) {
            let kind = caps[1].to_ascii_lowercase();
            in_failure_section = kind == "failure" || kind == "error";
            i += 1;
            continue;
        }
        if in_failure_section {
            if let Some(caps) = PHPUNIT_HEADER.captures(line) {
                let id = caps[1].trim().to_string();
                let message = lines[i + 1..]
                    .iter()
                    .take_while(|l| !PHPUNIT_HEADER.is_match(l.trim_end()))
                    .find(|l| !l.trim().is_empty())
                    .map(|l| l.trim().to_string())
                    .unwrap_or_default();
                collected.insert(&id, &message);
            }
        }
        i += 1;
    }
}

fn parse_tap(output: &str, collected: &mut OrderedFailures) {
    let lines: Vec<&str> = output.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        let Some(caps) = TAP_NOT_OK.captures(line) else {
            continue;
        };
        if caps.get(3).is_some() {
            // TODO and SKIP directives are not failures.
            continue;
        }
        let description = caps[2].trim();
        let id = if description.is_empty() {
            format!("test {}", &caps[1])
        } else {
            description.to_string()
        };
        let message = lines
            .get(idx + 1)
            .map(|l| l.trim())
            .filter(|l| l.starts_with('#'))
            .map(|l| l.trim_start_matches('#').trim().to_string())
            .unwrap_or_default();
        collected.insert(&id, &message);
    }
}

fn tail_entry(output: &str, exit_code: i32) -> FailureEntry {
    let non_empty: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let message = if non_empty.is_empty() {
        format!("test command exited with status {exit_code} and produced no output")
    } else {
        let start = non_empty.len().saturating_sub(TAIL_LINES);
        non_empty[start..].join("\n")
    };
    FailureEntry::new(format!("{UNPARSED_IDENTIFIER}-{}", tail_digest(&message)), message)
}

/// Short digest of an output tail with digit runs folded, so timings and
/// pids do not change it but a different error does.
fn tail_digest(tail: &str) -> String {
    let mut hasher = Sha256::new();
    let mut in_digits = false;
    for c in tail.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                hasher.update(b"#");
            }
            in_digits = true;
        } else {
            in_digits = false;
            let mut buf = [0u8; 4];
            hasher.update(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    hex::encode(&hasher.finalize()[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARGO_OUTPUT: &str = "\
running 3 tests
test parser::tests::parses_empty ... ok
test parser::tests::rejects_tabs ... FAILED
test store::tests::saves ... FAILED

failures:

---- parser::tests::rejects_tabs stdout ----

thread 'parser::tests::rejects_tabs' panicked at src/parser.rs:42:9:
assertion `left == right` failed
  left: 1
 right: 2
note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace

---- store::tests::saves stdout ----
thread 'store::tests::saves' panicked at 'disk full', src/store.rs:10:5

failures:
    parser::tests::rejects_tabs
    store::tests::saves

test result: FAILED. 1 passed; 2 failed; 0 ignored
";

    const PYTEST_OUTPUT: &str = "\
============================= test session starts ==============================
collected 4 items

tests/test_api.py .F.F                                                   [100%]

=========================== short test summary info ============================
FAILED tests/test_api.py::test_create - AssertionError: expected 201
FAILED tests/test_api.py::test_delete
========================= 2 failed, 2 passed in 0.12s =========================
";

    const PHPUNIT_OUTPUT: &str = "\
PHPUnit 9.5.10 by Sebastian Bergmann and contributors.

..F.E                                                               5 / 5 (100%)

There was 1 error:

1) Tests\\Unit\\UserTest::testSave
Error: Call to undefined method save()

/app/tests/Unit/UserTest.php:20

--

There was 1 failure:

1) Tests\\Unit\\UserTest::testName
Failed asserting that two strings are identical.

/app/tests/Unit/UserTest.php:12

FAILURES!
Tests: 5, Assertions: 5, Errors: 1, Failures: 1.
";

    const TAP_OUTPUT: &str = "\
TAP version 13
1..4
ok 1 - adds numbers
not ok 2 - subtracts numbers
# expected 1 got 2
not ok 3 - multiplies # TODO not implemented
not ok 4
";

    fn classify(format: OutputFormat, output: &str) -> Vec<FailureEntry> {
        ResultClassifier::new(format).classify(output, 1)
    }

    #[test]
    fn test_exit_zero_has_no_failures() {
        let classifier = ResultClassifier::default();
        assert!(classifier.classify(CARGO_OUTPUT, 0).is_empty());
        assert!(classifier.classify("", 0).is_empty());
    }

    #[test]
    fn test_cargo_failures_with_messages() {
        let failures = classify(OutputFormat::Cargo, CARGO_OUTPUT);
        assert_eq!(
            failures,
            vec![
                FailureEntry::new(
                    "parser::tests::rejects_tabs",
                    "assertion `left == right` failed"
                ),
                FailureEntry::new(
                    "store::tests::saves",
                    "thread 'store::tests::saves' panicked at 'disk full', src/store.rs:10:5"
                ),
            ]
        );
    }

    #[test]
    fn test_pytest_summary() {
        let failures = classify(OutputFormat::Pytest, PYTEST_OUTPUT);
        assert_eq!(
            failures,
            vec![
                FailureEntry::new(
                    "tests/test_api.py::test_create",
                    "AssertionError: expected 201"
                ),
                FailureEntry::new("tests/test_api.py::test_delete", ""),
            ]
        );
    }

    #[test]
    fn test_phpunit_errors_and_failures() {
        let failures = classify(OutputFormat::PhpUnit, PHPUNIT_OUTPUT);
        assert_eq!(
            failures,
            vec![
                FailureEntry::new(
                    "Tests\\Unit\\UserTest::testSave",
                    "Error: Call to undefined method save()"
                ),
                FailureEntry::new(
                    "Tests\\Unit\\UserTest::testName",
                    "Failed asserting that two strings are identical."
                ),
            ]
        );
    }

    #[test]
    fn test_tap_skips_todo_directives() {
        let failures = classify(OutputFormat::Tap, TAP_OUTPUT);
        assert_eq!(
            failures,
            vec![
                FailureEntry::new("subtracts numbers", "expected 1 got 2"),
                FailureEntry::new("test 4", ""),
            ]
        );
    }

    #[test]
    fn test_auto_detects_each_format() {
        assert_eq!(classify(OutputFormat::Auto, CARGO_OUTPUT).len(), 2);
        assert_eq!(
            classify(OutputFormat::Auto, PYTEST_OUTPUT)[0].test_identifier,
            "tests/test_api.py::test_create"
        );
        assert_eq!(classify(OutputFormat::Auto, PHPUNIT_OUTPUT).len(), 2);
        assert_eq!(classify(OutputFormat::Auto, TAP_OUTPUT).len(), 2);
    }

    #[test]
    fn test_unparseable_output_yields_tail() {
        let output: String = (1..=30).map(|i| format!("line {i}\n")).collect();
        let failures = classify(OutputFormat::Auto, &output);

        assert_eq!(failures.len(), 1);
        assert!(failures[0].test_identifier.starts_with(UNPARSED_IDENTIFIER));
        let lines: Vec<&str> = failures[0].message.lines().collect();
        assert_eq!(lines.len(), TAIL_LINES);
        assert_eq!(lines[0], "line 11");
        assert_eq!(lines[TAIL_LINES - 1], "line 30");
    }

    #[test]
    fn test_empty_output_with_failure_exit() {
        let failures = ResultClassifier::default().classify("", 2);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("status 2"));
    }

    #[test]
    fn test_wrong_explicit_format_degrades() {
        let failures = classify(OutputFormat::Pytest, CARGO_OUTPUT);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].test_identifier.starts_with(UNPARSED_IDENTIFIER));
    }

    #[test]
    fn test_unparsed_identifier_follows_the_error_text() {
        let first = classify(OutputFormat::Auto, "error: expected `;`, found `}` at src/lib.rs:4\n");
        let again = classify(OutputFormat::Auto, "error: expected `;`, found `}` at src/lib.rs:4\n");
        let other = classify(OutputFormat::Auto, "error: cannot find value `x` in this scope\n");
        let retimed = classify(OutputFormat::Auto, "build failed after 1.25s\n");
        let retimed_again = classify(OutputFormat::Auto, "build failed after 13.07s\n");

        assert_eq!(first[0].test_identifier, again[0].test_identifier);
        assert_ne!(first[0].test_identifier, other[0].test_identifier);
        assert_eq!(retimed[0].test_identifier, retimed_again[0].test_identifier);
        assert_eq!(first[0].test_identifier.len(), UNPARSED_IDENTIFIER.len() + 9);
    }

    #[test]
    fn test_duplicates_keep_first_appearance() {
        let output = "\
FAILED tests/a.py::test_x - first
FAILED tests/b.py::test_y - other
FAILED tests/a.py::test_x - second
";
        let failures = classify(OutputFormat::Pytest, output);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].test_identifier, "tests/a.py::test_x");
        assert_eq!(failures[0].message, "first");
        assert_eq!(failures[1].test_identifier, "tests/b.py::test_y");
    }

    #[test]
    fn test_ansi_colours_are_stripped() {
        let output = "test \x1b[1mcolour::test\x1b[0m ... \x1b[31mFAILED\x1b[0m\n";
        let failures = classify(OutputFormat::Cargo, output);
        assert_eq!(failures, vec![FailureEntry::new("colour::test", "")]);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = ResultClassifier::default();
        for output in [CARGO_OUTPUT, PYTEST_OUTPUT, PHPUNIT_OUTPUT, TAP_OUTPUT, "noise"] {
            let first = classifier.classify(output, 1);
            for _ in 0..10 {
                assert_eq!(classifier.classify(output, 1), first);
            }
        }
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("PHPUnit".parse::<OutputFormat>(), Ok(OutputFormat::PhpUnit));
        assert_eq!("libtest".parse::<OutputFormat>(), Ok(OutputFormat::Cargo));
        assert!("junit".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_parse_error_display() {
        let err = ClassifierParseError::NoFailuresRecognised {
            format: OutputFormat::Tap,
        };
        assert_eq!(err.to_string(), "no failing tests recognised in tap output");
    }
}
