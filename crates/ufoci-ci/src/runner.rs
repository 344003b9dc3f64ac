//! Pipeline stage execution.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info};
use ufoci_core::hooks::HookRegistry;
use ufoci_core::{Config, Result, ScriptManager, TestRunner, UfoError};

use crate::context::{BuildContext, BuildStage};
use crate::obs;
use crate::report::BuildReport;

/// Output of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub program: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `program args...` in `cwd` to completion.
pub async fn run_command(program: &str, args: &[&str], cwd: Option<&Path>) -> std::io::Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let output = command.spawn()?.wait_with_output().await?;

    Ok(CommandOutput {
        program: program.to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Run git, turning spawn failures and nonzero exits into a stage error.
async fn git(stage: &str, args: &[&str], cwd: Option<&Path>) -> Result<CommandOutput> {
    let output = run_command("git", args, cwd)
        .await
        .map_err(|e| UfoError::stage(stage, format!("failed to run git: {e}")))?;
    if !output.passed() {
        return Err(UfoError::stage(
            stage,
            format!(
                "git {} exited with code {}: {}",
                args.first().copied().unwrap_or_default(),
                output.exit_code,
                output.stderr.trim()
            ),
        ));
    }
    Ok(output)
}

/// Wrap a non-stage error as a failure of `stage`.
fn in_stage(stage: &str, error: UfoError) -> UfoError {
    match error {
        UfoError::BuildStage { .. } => error,
        other => UfoError::stage(stage, other.to_string()),
    }
}

/// Executes the individual stages of one build.
pub struct BuildRunner {
    config: Config,
    hooks: Arc<HookRegistry>,
}

impl BuildRunner {
    pub fn new(config: Config, hooks: Arc<HookRegistry>) -> Self {
        Self { config, hooks }
    }

    /// Clone, flash, test and archive. Cleanup is left to the caller so it
    /// runs whatever happens here.
    pub async fn run_stages(&self, ctx: &mut BuildContext) -> Result<BuildReport> {
        let mut scripts = ScriptManager::new(&self.config, self.hooks.clone())?;

        let start = Instant::now();
        let outcome = self.clone_repository(ctx).await;
        obs::emit_stage_finished(&ctx.id.to_string(), "clone", start.elapsed().as_millis() as u64, outcome.is_ok());
        outcome?;
        ctx.advance(BuildStage::Cloned);

        self.flash(ctx, &scripts).await?;
        ctx.advance(BuildStage::Flashed);

        let start = Instant::now();
        scripts
            .load_build_scripts(&ctx.folder_path)
            .map_err(|e| in_stage("test", e))?;
        let report = self.test(ctx, Arc::new(scripts)).await?;
        obs::emit_stage_finished(&ctx.id.to_string(), "test", start.elapsed().as_millis() as u64, true);
        ctx.test_report = Some(report);
        ctx.completed = true;
        ctx.advance(BuildStage::Tested);

        let report = self.archive(ctx)?;
        ctx.advance(BuildStage::Archived);
        Ok(report)
    }

    /// `git clone --single-branch`, optional checkout of the requested
    /// commit, then record the commit actually checked out.
    pub async fn clone_repository(&self, ctx: &mut BuildContext) -> Result<()> {
        if ctx.folder_path.exists() {
            debug!(path = %ctx.folder_path.display(), "Removing stale clone");
            tokio::fs::remove_dir_all(&ctx.folder_path).await?;
        }
        let folder = ctx.folder_path.to_string_lossy().to_string();
        git(
            "clone",
            &[
                "clone",
                "--single-branch",
                "--branch",
                &ctx.branch,
                "--",
                &ctx.repository_url,
                &folder,
            ],
            None,
        )
        .await?;

        if ctx.pins_commit() {
            git("clone", &["checkout", &ctx.commit, "--"], Some(ctx.folder_path.as_path())).await?;
        }

        let head = git("clone", &["rev-parse", "HEAD"], Some(ctx.folder_path.as_path())).await?;
        ctx.commit = head.stdout.trim().to_string();
        info!(commit = %ctx.commit, branch = %ctx.branch, "Cloned repository");
        Ok(())
    }

    /// Archive the bitfile with its digest, then run the `flash` script on it.
    pub async fn flash(&self, ctx: &mut BuildContext, scripts: &ScriptManager) -> Result<()> {
        let start = Instant::now();
        let outcome = self.flash_inner(ctx, scripts).await;
        obs::emit_stage_finished(&ctx.id.to_string(), "flash", start.elapsed().as_millis() as u64, outcome.is_ok());
        outcome
    }

    async fn flash_inner(&self, ctx: &mut BuildContext, scripts: &ScriptManager) -> Result<()> {
        let source = ctx.checkout_path(&self.config.ci.bitfile_path);
        if !source.is_file() {
            return Err(UfoError::stage(
                "flash",
                format!("bitfile {} not found in repository", self.config.ci.bitfile_path),
            ));
        }

        let file_name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "bitfile.bit".into());
        let archived = ctx.archive_path.join(file_name);
        tokio::fs::copy(&source, &archived).await?;

        let bytes = tokio::fs::read(&archived).await?;
        let digest = hex::encode(Sha256::digest(&bytes));
        ctx.bitfile_path = Some(archived.clone());
        ctx.bitfile_sha256 = Some(digest.clone());
        info!(bitfile = %archived.display(), sha256 = %digest, "Flashing bitfile");

        let result = scripts
            .invoke("flash", &[archived.to_string_lossy().to_string()], false)
            .await
            .map_err(|e| in_stage("flash", e))?;
        if !result.success() {
            return Err(UfoError::stage(
                "flash",
                format!("flash script exited with code {}: {}", result.exit_code, result.stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn test(&self, ctx: &BuildContext, scripts: Arc<ScriptManager>) -> Result<ufoci_core::TestReport> {
        let runner = TestRunner::in_folder(self.hooks.clone(), scripts, ctx.archive_path.clone())
            .map_err(|e| in_stage("test", e))?;
        runner
            .run_suite(&ctx.test_suite)
            .await
            .map_err(|e| in_stage("test", e))
    }

    /// Write `build.json` next to the test report.
    pub fn archive(&self, ctx: &mut BuildContext) -> Result<BuildReport> {
        ctx.finish();
        let report = BuildReport::from_context(ctx)?;
        if let Some(test_report) = &ctx.test_report {
            test_report.save(&ctx.archive_path)?;
        }
        report.save(&ctx.archive_path)?;
        Ok(report)
    }

    /// Remove the working clone.
    pub async fn cleanup(&self, ctx: &mut BuildContext) {
        if ctx.folder_path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&ctx.folder_path).await {
                obs::emit_cleanup_error(&ctx.id.to_string(), &e);
                return;
            }
        }
        ctx.advance(BuildStage::Cleaned);
    }
}
