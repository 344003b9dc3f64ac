//! Test discovery and execution.
//!
//! A test is a [`TestCase`]. The [`TestCatalog`] maps test names to
//! factories so every execution gets a fresh instance; the [`TestRunner`]
//! executes single tests or configured suites and turns the recorded
//! results into a [`TestReport`] saved in the run's archive folder.

mod builtin;
mod catalog;
mod report;
mod result;
mod runner;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::warn;

use crate::camera::{Camera, ScriptCamera, CAMERA_HOOK};
use crate::config::Config;
use crate::devices::{DeviceManager, REGISTER_DEVICES_HOOK};
use crate::error::Result;
use crate::hooks::HookRegistry;
use crate::scripts::ScriptManager;

pub use builtin::{LoadedScriptsTest, MockTest, RepeatedResetTest, SingleFrameTest};
pub use catalog::{ScriptTest, ScriptTestDefinition, TestCatalog, TestFactory, TestSource, TEST_CATALOG_HOOK};
pub use report::{TestMetadata, TestReport, TestSession, REPORT_FILE};
pub use result::{Assertion, AssertionCollector, ResultBody, TestResult};
pub use runner::{create_run_folder, TestRunner};

/// A single test.
#[async_trait]
pub trait TestCase: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<TestResult>;
}

/// Everything a test may touch.
pub struct TestContext {
    pub config: Config,
    pub hooks: Arc<HookRegistry>,
    pub scripts: Arc<ScriptManager>,
    pub camera: Arc<dyn Camera>,
    pub devices: Arc<DeviceManager>,
    /// Archive folder of the current run; tests write artifacts here.
    pub folder: PathBuf,
}

impl TestContext {
    /// Resolve the camera through the `camera` filter and the devices
    /// through the `register_devices` action.
    pub fn new(hooks: Arc<HookRegistry>, scripts: Arc<ScriptManager>, folder: impl Into<PathBuf>) -> Result<Self> {
        let default_camera: Arc<dyn Camera> = Arc::new(ScriptCamera::new(scripts.clone()));
        let camera = hooks.apply_filter(CAMERA_HOOK, default_camera)?;

        let mut devices = DeviceManager::new();
        hooks.do_action(REGISTER_DEVICES_HOOK, &mut devices)?;

        Ok(Self {
            config: scripts.config().clone(),
            hooks,
            scripts,
            camera,
            devices: Arc::new(devices),
            folder: folder.into(),
        })
    }

    /// Path inside the run folder.
    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.folder.join(name)
    }
}

/// Run `test`, stamping start and end. Errors and panics become failing
/// message results.
pub async fn execute(test: &dyn TestCase, ctx: &TestContext) -> TestResult {
    let start = Utc::now();
    let outcome = AssertUnwindSafe(test.run(ctx)).catch_unwind().await;
    let mut result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            warn!(test = %test.name(), error = %e, "Test raised an error");
            TestResult::message(1, format!("test '{}' raised an error: {e:#}", test.name()))
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            warn!(test = %test.name(), %reason, "Test panicked");
            TestResult::message(1, format!("test '{}' panicked: {reason}", test.name()))
        }
    };
    result.start = Some(start);
    result.end = Some(Utc::now());
    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::camera::MockCamera;
    use crate::scripts::ScriptDefinition;

    /// Context with mock scripts and a mock camera inside `dir`.
    pub fn mock_context(dir: &Path, scripts: Vec<ScriptDefinition>) -> TestContext {
        let mut config = Config::default().with_home(dir);
        config.scripts = scripts;
        let hooks = Arc::new(HookRegistry::new());
        let scripts = Arc::new(ScriptManager::new(&config, hooks.clone()).unwrap());
        let mut ctx = TestContext::new(hooks, scripts, dir.join("run")).unwrap();
        ctx.camera = Arc::new(MockCamera::new(4, 4));
        ctx
    }
}
