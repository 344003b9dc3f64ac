//! Build report.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ufoci_core::{Result, TestReport, UfoError};
use uuid::Uuid;

use crate::context::BuildContext;

/// File name of a saved build report inside the build archive.
pub const BUILD_REPORT_FILE: &str = "build.json";

/// Summary of a completed build, written to `build.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub build_id: Uuid,
    pub repository_url: String,
    pub repository_name: String,
    pub branch: String,
    pub commit: String,
    pub test_suite: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: i64,
    pub bitfile_path: Option<PathBuf>,
    pub bitfile_sha256: Option<String>,
    pub archive_path: PathBuf,
    pub test_report: TestReport,
}

impl BuildReport {
    /// Only builds that got through testing can be reported.
    pub fn from_context(ctx: &BuildContext) -> Result<Self> {
        if !ctx.completed {
            return Err(UfoError::IncompleteBuild(format!(
                "build {} stopped at stage '{}'",
                ctx.id, ctx.stage
            )));
        }
        let test_report = ctx
            .test_report
            .clone()
            .ok_or_else(|| UfoError::IncompleteBuild(format!("build {} has no test report", ctx.id)))?;

        let start = ctx.start_time.unwrap_or(ctx.created_at);
        let end = ctx.end_time.unwrap_or_else(Utc::now);
        Ok(Self {
            build_id: ctx.id,
            repository_url: ctx.repository_url.clone(),
            repository_name: ctx.repository_name.clone(),
            branch: ctx.branch.clone(),
            commit: ctx.commit.clone(),
            test_suite: ctx.test_suite.clone(),
            start,
            end,
            duration_secs: (end - start).num_seconds(),
            bitfile_path: ctx.bitfile_path.clone(),
            bitfile_sha256: ctx.bitfile_sha256.clone(),
            archive_path: ctx.archive_path.clone(),
            test_report,
        })
    }

    pub fn save(&self, folder: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(folder)?;
        let path = folder.join(BUILD_REPORT_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}
