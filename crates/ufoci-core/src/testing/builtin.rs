//! Tests compiled into ufoci.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{AssertionCollector, TestCase, TestContext, TestResult};

/// Always passes. Useful to check the CI plumbing without hardware.
#[derive(Debug, Default)]
pub struct MockTest;

#[async_trait]
impl TestCase for MockTest {
    fn name(&self) -> &str {
        "mock"
    }

    fn description(&self) -> &str {
        "Does nothing and always passes"
    }

    async fn run(&self, _ctx: &TestContext) -> anyhow::Result<TestResult> {
        Ok(TestResult::message(0, "mock test passed"))
    }
}

/// Lists the active scripts. Every script is expected to come from the
/// hardware repository, so a remaining fallback fails the test.
#[derive(Debug, Default)]
pub struct LoadedScriptsTest;

#[async_trait]
impl TestCase for LoadedScriptsTest {
    fn name(&self) -> &str {
        "loaded_scripts"
    }

    fn description(&self) -> &str {
        "Checks that every active script is provided by the build"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<TestResult> {
        let mut data = Map::new();
        let mut fallbacks = Vec::new();
        for (name, script) in ctx.scripts.scripts() {
            let is_fallback = ctx.scripts.is_fallback(name);
            if is_fallback {
                fallbacks.push(name.clone());
            }
            data.insert(
                name.clone(),
                json!({
                    "is_fallback": is_fallback,
                    "class": script.class,
                    "path": script.path,
                }),
            );
        }

        let message = if fallbacks.is_empty() {
            "all scripts are provided by the build".to_string()
        } else {
            format!("fallback scripts still active: {}", fallbacks.join(", "))
        };
        Ok(TestResult::dict(i32::from(!fallbacks.is_empty()), data, message))
    }
}

/// Acquires one frame from the camera.
#[derive(Debug, Default)]
pub struct SingleFrameTest;

#[async_trait]
impl TestCase for SingleFrameTest {
    fn name(&self) -> &str {
        "single_frame"
    }

    fn description(&self) -> &str {
        "Acquires a single frame from the camera"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<TestResult> {
        let frame = match ctx.camera.get_frame().await {
            Ok(frame) => frame,
            Err(e) => return Ok(TestResult::message(1, format!("frame acquisition failed: {e}"))),
        };

        let mut data = Map::new();
        data.insert("width".into(), Value::from(frame.width));
        data.insert("height".into(), Value::from(frame.height));
        data.insert("mean".into(), Value::from(frame.mean()));

        let raw: Vec<u8> = frame.pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
        let path = ctx.path("single_frame.raw");
        tokio::fs::create_dir_all(&ctx.folder).await?;
        tokio::fs::write(&path, raw).await?;
        data.insert("frame_path".into(), json!(path));

        Ok(TestResult::dict(0, data, "frame acquired"))
    }
}

/// Runs the reset script repeatedly and checks the status registers it
/// prints after each run.
#[derive(Debug, Default)]
pub struct RepeatedResetTest;

/// Status registers printed by the reset script.
const STATUS_REGISTERS: [&str; 3] = ["9010", "9050", "9060"];

impl RepeatedResetTest {
    fn register_lines(stdout: &str) -> impl Iterator<Item = &str> {
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.contains(':') && STATUS_REGISTERS.iter().any(|r| line.contains(r)))
    }
}

#[async_trait]
impl TestCase for RepeatedResetTest {
    fn name(&self) -> &str {
        "repeated_reset"
    }

    fn description(&self) -> &str {
        "Repeats the reset sequence and checks the status registers for PCI errors"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<TestResult> {
        let mut collector = AssertionCollector::new();
        for repetition in 0..ctx.config.tests.reset_repetitions {
            let output = ctx.scripts.invoke("reset", &[], false).await?;
            debug!(repetition, exit_code = output.exit_code, "Reset finished");
            collector.assert_equal(0, output.exit_code);
            for line in Self::register_lines(&output.stdout) {
                collector.assert_pci_read_ok(line);
            }
        }
        Ok(collector.into_result())
    }
}
