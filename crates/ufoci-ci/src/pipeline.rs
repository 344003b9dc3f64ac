//! Whole-build orchestration.

use std::sync::Arc;

use tracing::{error, warn, Instrument};
use ufoci_core::hooks::HookRegistry;
use ufoci_core::{BuildLock, Config, Result, UfoError};

use crate::context::{BuildContext, BuildRequest};
use crate::obs;
use crate::report::BuildReport;
use crate::runner::BuildRunner;

/// File written into the build archive when a build fails.
pub const FAILURE_FILE: &str = "failure.json";

/// Runs builds under the build lock.
#[derive(Clone)]
pub struct BuildPipeline {
    config: Config,
    hooks: Arc<HookRegistry>,
}

impl BuildPipeline {
    pub fn new(config: Config, hooks: Arc<HookRegistry>) -> Self {
        Self { config, hooks }
    }

    pub fn lock(&self) -> BuildLock {
        BuildLock::new(self.config.lock_path())
    }

    /// Run one build.
    ///
    /// The lock is taken first: when another build holds it this returns
    /// `LockHeld` before anything is cloned or created. The working clone is
    /// removed and the lock released on every exit path.
    pub async fn run(&self, request: BuildRequest) -> Result<BuildReport> {
        request.validate().map_err(|e| UfoError::stage("clone", e))?;
        let _guard = self.lock().acquire_guard()?;

        let mut ctx = BuildContext::new(&self.config, request);
        let span = obs::build_span(&ctx.id.to_string(), &ctx.repository_name);
        self.run_locked(&mut ctx).instrument(span).await
    }

    async fn run_locked(&self, ctx: &mut BuildContext) -> Result<BuildReport> {
        let build_id = ctx.id.to_string();
        obs::emit_build_started(&build_id, &ctx.repository_url, &ctx.branch, &ctx.commit);
        ctx.start();
        ctx.create_archive_folder()?;

        let runner = BuildRunner::new(self.config.clone(), self.hooks.clone());
        let outcome = runner.run_stages(ctx).await;
        runner.cleanup(ctx).await;

        match &outcome {
            Ok(report) => obs::emit_build_finished(
                &build_id,
                report.duration_secs,
                Some(report.test_report.success_ratio),
                true,
            ),
            Err(e) => {
                error!(build_id = %build_id, reached = %ctx.stage, error = %e, "Build failed");
                ctx.fail(e.to_string());
                self.record_failure(ctx);
                obs::emit_build_finished(&build_id, ctx.duration_secs().unwrap_or(0), None, false);
            }
        }
        outcome
    }

    /// Keep the context of a failed build next to its artifacts.
    fn record_failure(&self, ctx: &BuildContext) {
        let path = ctx.archive_path.join(FAILURE_FILE);
        let written = serde_json::to_string_pretty(ctx)
            .map_err(std::io::Error::from)
            .and_then(|json| std::fs::write(&path, json));
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "Failed to record build failure");
        }
    }
}
