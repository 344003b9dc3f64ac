//! Test results.

use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload of a [`TestResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultBody {
    Message {
        message: String,
    },
    Assertions {
        assertions: Vec<Assertion>,
        error_count: usize,
    },
    /// An artifact written into the run's archive folder.
    Figure {
        path: PathBuf,
        description: String,
    },
    Dict {
        data: Map<String, Value>,
        message: String,
    },
    Combined {
        results: Vec<TestResult>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub passed: bool,
    pub message: String,
}

/// Outcome of one test execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub exit_code: i32,
    /// Set by the runner when the result is recorded.
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub body: ResultBody,
}

impl TestResult {
    fn with_body(exit_code: i32, body: ResultBody) -> Self {
        Self {
            exit_code,
            start: None,
            end: None,
            body,
        }
    }

    pub fn message(exit_code: i32, message: impl Into<String>) -> Self {
        Self::with_body(
            exit_code,
            ResultBody::Message {
                message: message.into(),
            },
        )
    }

    pub fn figure(exit_code: i32, path: impl Into<PathBuf>, description: impl Into<String>) -> Self {
        Self::with_body(
            exit_code,
            ResultBody::Figure {
                path: path.into(),
                description: description.into(),
            },
        )
    }

    pub fn dict(exit_code: i32, data: Map<String, Value>, message: impl Into<String>) -> Self {
        Self::with_body(
            exit_code,
            ResultBody::Dict {
                data,
                message: message.into(),
            },
        )
    }

    /// Fails when any nested result fails.
    pub fn combined(results: Vec<TestResult>) -> Self {
        let exit_code = if results.iter().all(TestResult::passing) { 0 } else { 1 };
        Self::with_body(exit_code, ResultBody::Combined { results })
    }

    pub fn passing(&self) -> bool {
        self.exit_code == 0
    }

    /// Wall time in seconds, once the runner stamped the result.
    pub fn execution_time(&self) -> Option<f64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn summary(&self) -> String {
        match &self.body {
            ResultBody::Message { message } | ResultBody::Dict { message, .. } => message.clone(),
            ResultBody::Assertions {
                assertions,
                error_count,
            } => format!("{error_count} of {} assertions failed", assertions.len()),
            ResultBody::Figure { description, .. } => description.clone(),
            ResultBody::Combined { results } => {
                let failed = results.iter().filter(|r| !r.passing()).count();
                format!("{failed} of {} sub-results failed", results.len())
            }
        }
    }
}

fn pci_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r":\s*000f").expect("valid PCI error pattern"))
}

/// Collects assertions; fails as soon as one of them fails.
#[derive(Debug, Clone, Default)]
pub struct AssertionCollector {
    assertions: Vec<Assertion>,
    error_count: usize,
}

impl AssertionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert_equal<T: PartialEq + std::fmt::Debug>(&mut self, expected: T, actual: T) {
        let passed = expected == actual;
        let message = if passed {
            format!("(+) EQUAL {expected:?} == {actual:?}")
        } else {
            format!("(-) NOT EQUAL {expected:?} != {actual:?}")
        };
        self.record(passed, message);
    }

    /// A register read-out reporting `000f` signals a PCI error.
    pub fn assert_pci_read_ok(&mut self, read_out: &str) {
        let passed = !pci_error_pattern().is_match(read_out);
        let line = read_out.trim();
        let message = if passed {
            format!("(+) PCI READ '{line}' IS FINE")
        } else {
            format!("(-) PCI READ '{line}' CONTAINS ERROR")
        };
        self.record(passed, message);
    }

    pub fn record(&mut self, passed: bool, message: impl Into<String>) {
        if !passed {
            self.error_count += 1;
        }
        self.assertions.push(Assertion {
            passed,
            message: message.into(),
        });
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn into_result(self) -> TestResult {
        TestResult::with_body(
            i32::from(self.error_count > 0),
            ResultBody::Assertions {
                assertions: self.assertions,
                error_count: self.error_count,
            },
        )
    }
}
