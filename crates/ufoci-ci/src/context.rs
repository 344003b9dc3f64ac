//! Build state.

use std::fmt;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ufoci_core::{Config, TestReport};
use uuid::Uuid;

/// Commit placeholder for builds of the current branch tip.
pub const FETCH_HEAD: &str = "FETCH_HEAD";

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub repository_url: String,
    pub branch: String,
    #[serde(default = "default_commit")]
    pub commit: String,
}

fn default_commit() -> String {
    FETCH_HEAD.to_string()
}

impl BuildRequest {
    /// Tip of the configured branch of the configured repository.
    pub fn from_config(config: &Config) -> Self {
        Self {
            repository_url: config.ci.repository_url.clone(),
            branch: config.ci.branch.clone(),
            commit: default_commit(),
        }
    }

    /// Reject values git would parse as options.
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("repository_url", &self.repository_url),
            ("branch", &self.branch),
            ("commit", &self.commit),
        ] {
            if value.starts_with('-') {
                return Err(format!("{field} must not start with '-': {value}"));
            }
        }
        Ok(())
    }
}

/// `https://host/group/ufo-target.git` -> `ufo-target`
pub fn repository_name(url: &str) -> String {
    let last = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(url);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "repository".to_string()
    } else {
        name.to_string()
    }
}

/// Lifecycle position of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStage {
    Created,
    Cloned,
    Flashed,
    Tested,
    Archived,
    Cleaned,
    Failed,
}

impl BuildStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStage::Cleaned | BuildStage::Failed)
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Created => "created",
            BuildStage::Cloned => "cloned",
            BuildStage::Flashed => "flashed",
            BuildStage::Tested => "tested",
            BuildStage::Archived => "archived",
            BuildStage::Cleaned => "cleaned",
            BuildStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One build from clone to cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct BuildContext {
    pub id: Uuid,
    pub repository_url: String,
    pub repository_name: String,
    pub branch: String,
    /// Requested commit; replaced by the checked-out hash after cloning.
    pub commit: String,
    pub test_suite: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Archived copy of the flashed bitfile.
    pub bitfile_path: Option<PathBuf>,
    pub bitfile_sha256: Option<String>,
    pub completed: bool,
    /// Working clone, removed when the build ends.
    pub folder_path: PathBuf,
    /// Permanent per-build archive folder.
    pub archive_path: PathBuf,
    pub stage: BuildStage,
    pub failure: Option<String>,
    #[serde(skip)]
    pub test_report: Option<TestReport>,
}

impl BuildContext {
    pub fn new(config: &Config, request: BuildRequest) -> Self {
        let created_at = Utc::now();
        let repository_name = repository_name(&request.repository_url);
        let folder_path = config.home.join(&repository_name);
        let archive_path = config.builds_path().join(format!(
            "{repository_name}__{}",
            created_at.format("%Y_%m_%d__%H_%M_%S")
        ));

        Self {
            id: Uuid::new_v4(),
            repository_url: request.repository_url,
            repository_name,
            branch: request.branch,
            commit: request.commit,
            test_suite: config.ci.test_suite.clone(),
            created_at,
            start_time: None,
            end_time: None,
            bitfile_path: None,
            bitfile_sha256: None,
            completed: false,
            folder_path,
            archive_path,
            stage: BuildStage::Created,
            failure: None,
            test_report: None,
        }
    }

    pub fn start(&mut self) {
        self.start_time = Some(Utc::now());
    }

    pub fn advance(&mut self, stage: BuildStage) {
        if !self.stage.is_terminal() {
            self.stage = stage;
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
        self.stage = BuildStage::Failed;
        self.end_time.get_or_insert_with(Utc::now);
    }

    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Whether a concrete commit has to be checked out after cloning.
    pub fn pins_commit(&self) -> bool {
        !self.commit.is_empty() && self.commit != FETCH_HEAD
    }

    /// Create the archive folder. A folder left by a build started in the
    /// same second is not reused; `_1`, `_2`, ... is appended instead.
    pub fn create_archive_folder(&mut self) -> io::Result<()> {
        if let Some(parent) = self.archive_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let base = self.archive_path.clone();
        let mut suffix = 0;
        loop {
            match std::fs::create_dir(&self.archive_path) {
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    suffix += 1;
                    let mut name = base.as_os_str().to_owned();
                    name.push(format!("_{suffix}"));
                    self.archive_path = PathBuf::from(name);
                }
                other => return other,
            }
        }
    }

    /// Path inside the working clone.
    pub fn checkout_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.folder_path.join(relative)
    }

    pub fn duration_secs(&self) -> Option<i64> {
        Some((self.end_time? - self.start_time?).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_name() {
        assert_eq!(repository_name("https://github.com/ufo-kit/ufo-target.git"), "ufo-target");
        assert_eq!(repository_name("git@github.com:ufo-kit/ufo-target.git"), "ufo-target");
        assert_eq!(repository_name("/srv/git/camera/"), "camera");
        assert_eq!(repository_name(""), "repository");
    }

    #[test]
    fn test_context_paths() {
        let config = Config::default().with_home("/srv/ufoci");
        let ctx = BuildContext::new(
            &config,
            BuildRequest {
                repository_url: "https://example.com/ufo-target.git".into(),
                branch: "main".into(),
                commit: "abc123".into(),
            },
        );
        assert_eq!(ctx.folder_path, PathBuf::from("/srv/ufoci/ufo-target"));
        assert!(ctx.archive_path.starts_with("/srv/ufoci/builds"));
        assert!(ctx
            .archive_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("ufo-target__"));
        assert_eq!(ctx.stage, BuildStage::Created);
        assert_eq!(ctx.test_suite, "mock");
    }

    #[test]
    fn test_failed_is_terminal() {
        let config = Config::default();
        let mut ctx = BuildContext::new(&config, BuildRequest::from_config(&config));
        ctx.advance(BuildStage::Cloned);
        ctx.fail("flash script exited with 1");
        ctx.advance(BuildStage::Cleaned);
        assert_eq!(ctx.stage, BuildStage::Failed);
        assert!(ctx.end_time.is_some());
    }

    #[test]
    fn test_request_defaults_to_branch_tip() {
        let request: BuildRequest =
            serde_json::from_str(r#"{"repository_url": "u", "branch": "b"}"#).unwrap();
        assert_eq!(request.commit, FETCH_HEAD);
        let ctx = BuildContext::new(&Config::default(), request);
        assert!(!ctx.pins_commit());
    }

    #[test]
    fn test_option_like_request_rejected() {
        let mut request = BuildRequest {
            repository_url: "--upload-pack=touch /tmp/owned".into(),
            branch: "main".into(),
            commit: FETCH_HEAD.into(),
        };
        assert!(request.validate().unwrap_err().contains("repository_url"));

        request.repository_url = "https://example.com/ufo-target.git".into();
        request.commit = "-p".into();
        assert!(request.validate().unwrap_err().contains("commit"));

        request.commit = "abc123".into();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_archive_folders_of_same_second_are_distinct() {
        let home = tempfile::tempdir().unwrap();
        let config = Config::default().with_home(home.path());
        let request = BuildRequest {
            repository_url: "https://example.com/ufo-target.git".into(),
            branch: "main".into(),
            commit: FETCH_HEAD.into(),
        };
        let mut first = BuildContext::new(&config, request.clone());
        let mut second = BuildContext::new(&config, request);
        second.archive_path = first.archive_path.clone();

        first.create_archive_folder().unwrap();
        second.create_archive_folder().unwrap();
        assert_ne!(first.archive_path, second.archive_path);
        assert!(second.archive_path.to_string_lossy().ends_with("_1"));
        assert!(first.archive_path.is_dir() && second.archive_path.is_dir());
    }
}
