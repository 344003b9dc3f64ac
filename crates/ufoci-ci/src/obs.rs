//! Structured observability for build lifecycle events.
//!
//! - [`build_span`] creates the build-scoped span every pipeline future is
//!   instrumented with
//! - `emit_*` functions log the key lifecycle events with an `event` field
//!
//! Set `RUST_LOG` to tune verbosity; `ufoci --json` switches to JSON lines.

use tracing::{info, warn};

/// Span tagged with the build id and repository.
///
/// ```ignore
/// pipeline.run(request).instrument(build_span(&id, "ufo-target")).await
/// ```
pub fn build_span(build_id: &str, repository: &str) -> tracing::Span {
    tracing::info_span!("ufoci.build", build_id = %build_id, repository = %repository)
}

/// Emit event: build started.
pub fn emit_build_started(build_id: &str, repository_url: &str, branch: &str, commit: &str) {
    info!(
        event = "build.started",
        build_id = %build_id,
        repository_url = %repository_url,
        branch = %branch,
        commit = %commit,
    );
}

/// Emit event: one pipeline stage finished.
pub fn emit_stage_finished(build_id: &str, stage: &str, duration_ms: u64, success: bool) {
    info!(
        event = "build.stage_finished",
        build_id = %build_id,
        stage = %stage,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: build finished. `success_ratio` is absent when testing was
/// never reached.
pub fn emit_build_finished(build_id: &str, duration_secs: i64, success_ratio: Option<f64>, success: bool) {
    info!(
        event = "build.finished",
        build_id = %build_id,
        duration_secs = duration_secs,
        success_ratio = ?success_ratio,
        success = success,
    );
}

/// Emit event: trigger rejected (warning level).
pub fn emit_build_rejected(repository_url: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "build.rejected", repository_url = %repository_url, reason = %reason);
}

/// Emit event: working clone could not be removed (warning level).
pub fn emit_cleanup_error(build_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "build.cleanup_error", build_id = %build_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_span_create() {
        let span = build_span("build-id", "ufo-target");
        let _entered = span.enter();
        emit_stage_finished("build-id", "clone", 12, true);
    }
}
