//! Sequential test execution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::{execute, TestCatalog, TestContext, TestReport, TestSession};
use crate::error::{Result, UfoError};
use crate::hooks::HookRegistry;
use crate::scripts::ScriptManager;

/// Create `<archive>/<YYYY_MM_DD__HH_MM_SS>`, suffixed when that folder
/// already exists.
pub fn create_run_folder(archive: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(archive)?;
    let stamp = Utc::now().format("%Y_%m_%d__%H_%M_%S").to_string();
    let mut candidate = archive.join(&stamp);
    let mut suffix = 1;
    while candidate.exists() {
        candidate = archive.join(format!("{stamp}_{suffix}"));
        suffix += 1;
    }
    std::fs::create_dir(&candidate)?;
    Ok(candidate)
}

/// Executes tests from a catalog and reports into one run folder.
pub struct TestRunner {
    context: TestContext,
    catalog: TestCatalog,
}

impl TestRunner {
    /// Runner writing into a fresh folder below the configured archive.
    pub fn new(hooks: Arc<HookRegistry>, scripts: Arc<ScriptManager>) -> Result<Self> {
        let folder = create_run_folder(&scripts.config().archive_path())?;
        Self::in_folder(hooks, scripts, folder)
    }

    /// Runner writing into `folder`.
    pub fn in_folder(hooks: Arc<HookRegistry>, scripts: Arc<ScriptManager>, folder: PathBuf) -> Result<Self> {
        let catalog = TestCatalog::discover(scripts.config(), &hooks)?;
        let context = TestContext::new(hooks, scripts, folder)?;
        Ok(Self { context, catalog })
    }

    pub fn with_catalog(mut self, catalog: TestCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn catalog(&self) -> &TestCatalog {
        &self.catalog
    }

    pub fn context(&self) -> &TestContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TestContext {
        &mut self.context
    }

    pub fn folder_path(&self) -> &Path {
        &self.context.folder
    }

    pub async fn run_test(&self, name: &str) -> Result<TestReport> {
        self.check_known(&[name.to_string()])?;
        self.run(name, &[name.to_string()]).await
    }

    /// Run every test of a configured suite in order.
    pub async fn run_suite(&self, suite: &str) -> Result<TestReport> {
        let tests = self
            .context
            .config
            .tests
            .suites
            .get(suite)
            .ok_or_else(|| UfoError::SuiteNotFound(suite.to_string()))?
            .clone();
        self.check_known(&tests)?;
        self.run(suite, &tests).await
    }

    fn check_known(&self, tests: &[String]) -> Result<()> {
        match tests.iter().find(|t| !self.catalog.contains(t)) {
            Some(unknown) => Err(UfoError::TestNotFound(unknown.clone())),
            None => Ok(()),
        }
    }

    async fn run(&self, name: &str, tests: &[String]) -> Result<TestReport> {
        let mut session = TestSession::new(&self.context.folder);
        session.begin(name);
        info!(run = %name, tests = tests.len(), folder = %self.context.folder.display(), "Starting test run");

        if let Err(e) = self.context.devices.set_up_all() {
            warn!(error = %e, "Device set up failed");
        }

        for test_name in tests {
            let Some(test) = self.catalog.create(test_name) else {
                return Err(UfoError::TestNotFound(test_name.clone()));
            };
            let result = execute(test.as_ref(), &self.context).await;
            info!(test = %test_name, exit_code = result.exit_code, "Test finished");
            session.record(test_name, result);
        }

        if let Err(e) = self.context.devices.tear_down_all() {
            warn!(error = %e, "Device tear down failed");
        }
        session.finish();

        let report = TestReport::from_session(&session)?;
        report.save(&self.context.folder)?;
        info!(
            run = %name,
            passing = report.passing_count,
            total = report.test_count,
            success_ratio = report.success_ratio,
            "Test run finished"
        );
        Ok(report)
    }
}
