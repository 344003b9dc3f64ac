//! Run bookkeeping and the test report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::TestResult;
use crate::error::{Result, UfoError};

/// File name of a saved report inside its folder.
pub const REPORT_FILE: &str = "report.json";

/// Where and with what a run happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMetadata {
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    pub version: String,
}

impl TestMetadata {
    pub fn capture() -> Self {
        Self {
            timestamp: Utc::now(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Mutable state of one run: `begin`, any number of `record`s, `finish`.
#[derive(Debug, Clone)]
pub struct TestSession {
    name: String,
    folder_path: PathBuf,
    meta: TestMetadata,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    results: BTreeMap<String, TestResult>,
    order: Vec<String>,
}

impl TestSession {
    pub fn new(folder_path: impl Into<PathBuf>) -> Self {
        Self {
            name: String::new(),
            folder_path: folder_path.into(),
            meta: TestMetadata::capture(),
            start: None,
            end: None,
            results: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Start the run named `name` (a test or suite name).
    pub fn begin(&mut self, name: &str) {
        self.name = name.to_string();
        self.start = Some(Utc::now());
    }

    pub fn record(&mut self, test_name: &str, result: TestResult) {
        if self.results.insert(test_name.to_string(), result).is_none() {
            self.order.push(test_name.to_string());
        }
    }

    pub fn finish(&mut self) {
        self.end = Some(Utc::now());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn folder_path(&self) -> &Path {
        &self.folder_path
    }

    pub fn results(&self) -> &BTreeMap<String, TestResult> {
        &self.results
    }

    /// Test names in the order they were recorded.
    pub fn order(&self) -> &[String] {
        &self.order
    }
}

/// Immutable summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub name: String,
    pub results: BTreeMap<String, TestResult>,
    /// Execution order of `results`.
    #[serde(default)]
    pub order: Vec<String>,
    pub meta: TestMetadata,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: i64,
    pub test_count: usize,
    pub passing_count: usize,
    pub error_count: usize,
    pub success_ratio: f64,
    pub folder_path: PathBuf,
}

impl TestReport {
    /// Report over standalone results; start and end come from the result
    /// time stamps.
    pub fn new(name: &str, results: BTreeMap<String, TestResult>, meta: TestMetadata) -> Result<Self> {
        let start = results
            .values()
            .filter_map(|r| r.start)
            .min()
            .unwrap_or(meta.timestamp);
        let end = results
            .values()
            .filter_map(|r| r.end)
            .max()
            .unwrap_or(start);
        let order = results.keys().cloned().collect();
        Self::build(name, results, order, meta, start, end, PathBuf::new())
    }

    pub fn from_session(session: &TestSession) -> Result<Self> {
        let (Some(start), Some(end)) = (session.start, session.end) else {
            return Err(UfoError::IncompleteBuild(format!(
                "test run '{}' has not finished",
                session.name
            )));
        };
        Self::build(
            &session.name,
            session.results.clone(),
            session.order.clone(),
            session.meta.clone(),
            start,
            end,
            session.folder_path.clone(),
        )
    }

    fn build(
        name: &str,
        results: BTreeMap<String, TestResult>,
        order: Vec<String>,
        meta: TestMetadata,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        folder_path: PathBuf,
    ) -> Result<Self> {
        if results.is_empty() {
            return Err(UfoError::EmptyReport);
        }
        let test_count = results.len();
        let passing_count = results.values().filter(|r| r.passing()).count();
        let ratio = passing_count as f64 / test_count as f64;

        Ok(Self {
            name: name.to_string(),
            results,
            order,
            meta,
            start,
            end,
            duration_secs: (end - start).num_seconds(),
            test_count,
            passing_count,
            error_count: test_count - passing_count,
            success_ratio: (ratio * 100.0).round() / 100.0,
            folder_path,
        })
    }

    /// Write `report.json` into `folder`.
    pub fn save(&self, folder: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(folder)?;
        let path = folder.join(REPORT_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn all_passed(&self) -> bool {
        self.error_count == 0
    }

    /// Results in execution order.
    pub fn ordered_results(&self) -> impl Iterator<Item = (&str, &TestResult)> + '_ {
        self.order
            .iter()
            .filter_map(|name| self.results.get(name).map(|r| (name.as_str(), r)))
    }
}
