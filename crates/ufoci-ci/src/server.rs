//! HTTP trigger service.
//!
//! | route                 | purpose                                         |
//! |-----------------------|-------------------------------------------------|
//! | `POST /push`          | start a build (`423` while one is running)      |
//! | `GET /archive/*path`  | files below the build archive                   |
//! | `GET /`               | plain-text status                               |
//!
//! `/push` accepts either `{"repository_url", "branch", "commit"}` or the
//! body of a GitHub push webhook.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use tracing::{error, info};
use ufoci_core::hooks::HookRegistry;
use ufoci_core::{BuildLock, Config, UfoError};

use crate::context::{BuildRequest, FETCH_HEAD};
use crate::obs;
use crate::pipeline::BuildPipeline;

/// Reasons a push payload is rejected with `400`.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no {0}")]
    Missing(&'static str),

    #[error("invalid payload: {0}")]
    Invalid(String),
}

/// Extract a build request from a push payload.
pub fn parse_push(body: &[u8]) -> Result<BuildRequest, PayloadError> {
    let value: Value = serde_json::from_slice(body)?;
    if value.get("repository_url").is_some() {
        let request: BuildRequest = serde_json::from_value(value)?;
        request.validate().map_err(PayloadError::Invalid)?;
        return Ok(request);
    }

    // GitHub push event
    let repository_url = value
        .pointer("/repository/clone_url")
        .and_then(Value::as_str)
        .ok_or(PayloadError::Missing("repository_url or repository.clone_url"))?;
    let git_ref = value
        .get("ref")
        .and_then(Value::as_str)
        .ok_or(PayloadError::Missing("ref"))?;
    let branch = git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref);
    let commit = value
        .get("after")
        .and_then(Value::as_str)
        .unwrap_or(FETCH_HEAD);

    let request = BuildRequest {
        repository_url: repository_url.to_string(),
        branch: branch.to_string(),
        commit: commit.to_string(),
    };
    request.validate().map_err(PayloadError::Invalid)?;
    Ok(request)
}

struct ServiceState {
    pipeline: BuildPipeline,
    lock: BuildLock,
    archive_root: PathBuf,
}

/// The CI web server.
#[derive(Clone)]
pub struct TriggerService {
    state: Arc<ServiceState>,
}

impl TriggerService {
    pub fn new(config: Config, hooks: Arc<HookRegistry>) -> Self {
        let archive_root = config.builds_path();
        let pipeline = BuildPipeline::new(config, hooks);
        let lock = pipeline.lock();
        Self {
            state: Arc::new(ServiceState {
                pipeline,
                lock,
                archive_root,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(status))
            .route("/push", post(push))
            .route("/archive/*path", get(archive))
            .with_state(self.clone())
    }

    /// Bind `addr` and serve until the process ends.
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(addr = %addr, "Trigger service listening");
        axum::serve(listener, self.router())
            .await
            .context("trigger service error")?;
        Ok(())
    }

    /// Accept or reject a push. Accepted builds run on a spawned task.
    pub fn handle_push(&self, body: &[u8]) -> (StatusCode, String) {
        let request = match parse_push(body) {
            Ok(request) => request,
            Err(e) => {
                obs::emit_build_rejected("", &e);
                return (StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        // fast rejection; the build task takes the lock itself
        if self.state.lock.is_locked() {
            obs::emit_build_rejected(&request.repository_url, &"build in progress");
            return (StatusCode::LOCKED, "build in progress".to_string());
        }

        let pipeline = self.state.pipeline.clone();
        let repository_url = request.repository_url.clone();
        tokio::spawn(async move {
            match pipeline.run(request).await {
                Ok(report) => info!(
                    build_id = %report.build_id,
                    success_ratio = report.test_report.success_ratio,
                    "Triggered build finished"
                ),
                Err(e @ UfoError::LockHeld { .. }) => obs::emit_build_rejected(&repository_url, &e),
                Err(e) => error!(repository_url = %repository_url, error = %e, "Triggered build failed"),
            }
        });
        (StatusCode::OK, "build accepted".to_string())
    }

    /// Resolve a request path below the archive root. `None` when the path
    /// leaves the root or does not name an existing file.
    pub fn resolve_archive_path(&self, relative: &str) -> Option<PathBuf> {
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        let root = self.state.archive_root.canonicalize().ok()?;
        let path = root.join(relative).canonicalize().ok()?;
        (path.starts_with(&root) && path.is_file()).then_some(path)
    }
}

async fn status(State(service): State<TriggerService>) -> impl IntoResponse {
    let state = if service.state.lock.is_locked() {
        "build in progress"
    } else {
        "idle"
    };
    format!(
        "ufoci trigger service\n\nstatus: {state}\n\nPOST /push          - trigger a build\nGET  /archive/<path> - build archive\n"
    )
}

async fn push(State(service): State<TriggerService>, body: Bytes) -> impl IntoResponse {
    service.handle_push(&body)
}

async fn archive(State(service): State<TriggerService>, UrlPath(path): UrlPath<String>) -> Response {
    let Some(file) = service.resolve_archive_path(&path) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    match tokio::fs::read(&file).await {
        Ok(bytes) => {
            let content_type = match file.extension().and_then(|e| e.to_str()) {
                Some("json") => "application/json",
                Some("txt") | Some("log") => "text/plain; charset=utf-8",
                _ => "application/octet-stream",
            };
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(e) => {
            error!(path = %file.display(), error = %e, "Failed to read archive file");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to read file").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(home: &Path) -> TriggerService {
        let config = Config::default().with_home(home);
        TriggerService::new(config, Arc::new(HookRegistry::new()))
    }

    #[test]
    fn test_parse_plain_payload() {
        let request = parse_push(
            br#"{"repository_url": "https://example.com/ufo-target.git", "branch": "main", "commit": "abc"}"#,
        )
        .unwrap();
        assert_eq!(request.branch, "main");
        assert_eq!(request.commit, "abc");
    }

    #[test]
    fn test_parse_github_payload() {
        let request = parse_push(
            br#"{
                "ref": "refs/heads/feature/dma",
                "after": "0123abcd",
                "repository": {"clone_url": "https://github.com/ufo-kit/ufo-target.git"}
            }"#,
        )
        .unwrap();
        assert_eq!(request.repository_url, "https://github.com/ufo-kit/ufo-target.git");
        assert_eq!(request.branch, "feature/dma");
        assert_eq!(request.commit, "0123abcd");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_push(b"not json"), Err(PayloadError::Json(_))));
        assert!(matches!(
            parse_push(br#"{"zen": "Keep it logically awesome."}"#),
            Err(PayloadError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn test_push_while_locked_is_423() {
        let home = tempfile::tempdir().unwrap();
        let service = service(home.path());
        let lock = BuildLock::new(home.path().join("build.locked"));
        lock.acquire().unwrap();

        let (status, body) = service.handle_push(br#"{"repository_url": "u", "branch": "b"}"#);
        assert_eq!(status, StatusCode::LOCKED);
        assert_eq!(body, "build in progress");
        assert!(!home.path().join("builds").exists());
    }

    #[tokio::test]
    async fn test_bad_payload_is_400() {
        let home = tempfile::tempdir().unwrap();
        let (status, _) = service(home.path()).handle_push(b"{}");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_option_like_repository_is_400() {
        let home = tempfile::tempdir().unwrap();
        let service = service(home.path());

        let (status, body) = service.handle_push(
            br#"{"repository_url": "--upload-pack=touch /tmp/owned", "branch": "main"}"#,
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("repository_url"));

        let (status, _) = service.handle_push(
            br#"{"ref": "refs/heads/main", "after": "--orphan", "repository": {"clone_url": "https://example.com/x.git"}}"#,
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!home.path().join("build.locked").exists());
        assert!(!home.path().join("builds").exists());
    }

    #[test]
    fn test_archive_path_cannot_escape() {
        let home = tempfile::tempdir().unwrap();
        let builds = home.path().join("builds/ufo-target__2024_01_01__00_00_00");
        std::fs::create_dir_all(&builds).unwrap();
        std::fs::write(builds.join("build.json"), "{}").unwrap();
        std::fs::write(home.path().join("config.toml"), "").unwrap();

        let service = service(home.path());
        assert!(service
            .resolve_archive_path("ufo-target__2024_01_01__00_00_00/build.json")
            .is_some());
        assert!(service.resolve_archive_path("../config.toml").is_none());
        assert!(service.resolve_archive_path("/etc/passwd").is_none());
        assert!(service.resolve_archive_path("missing.json").is_none());
    }
}
