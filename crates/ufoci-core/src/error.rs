//! Error taxonomy shared by every ufoci component.

use std::path::PathBuf;

use crate::camera::CameraError;
use crate::hooks::HookError;

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

/// ufoci domain errors.
#[derive(Debug, thiserror::Error)]
pub enum UfoError {
    #[error("build lock is held ({path}): another build is in progress")]
    LockHeld { path: PathBuf },

    #[error("build lock is not held ({path})")]
    LockNotHeld { path: PathBuf },

    #[error("incomplete build: {0}")]
    IncompleteBuild(String),

    #[error("cannot build a test report without any test results")]
    EmptyReport,

    #[error("script not found: {name} ({tier} scripts)")]
    ScriptNotFound { name: String, tier: &'static str },

    #[error("failed to load plugin {plugin}: {reason}")]
    PluginLoad { plugin: String, reason: String },

    #[error("hardware communication error: {0}")]
    Hardware(#[from] CameraError),

    #[error("build stage {stage} failed: {message}")]
    BuildStage { stage: String, message: String },

    #[error("unknown test: {0}")]
    TestNotFound(String),

    #[error("unknown test suite: {0}")]
    SuiteNotFound(String),

    #[error("no registered device exposes function {0}")]
    DeviceNotRegistered(String),

    #[error("device function {function} failed: {message}")]
    Device { function: String, message: String },

    #[error("hook error: {0}")]
    Hook(#[from] HookError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UfoError {
    /// Process exit code used by the CLI for this error class.
    pub fn exit_code(&self) -> i32 {
        match self {
            UfoError::LockHeld { .. } => 3,
            UfoError::IncompleteBuild(_) | UfoError::EmptyReport => 4,
            UfoError::ScriptNotFound { .. } => 5,
            UfoError::PluginLoad { .. } => 6,
            UfoError::Hardware(_) => 7,
            UfoError::BuildStage { .. } => 8,
            _ => 1,
        }
    }

    pub fn stage(stage: &str, message: impl Into<String>) -> Self {
        UfoError::BuildStage {
            stage: stage.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for ufoci operations.
pub type Result<T> = std::result::Result<T, UfoError>;
