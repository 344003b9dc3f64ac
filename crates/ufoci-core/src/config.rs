//! Configuration file handling.
//!
//! All state lives below one home folder: `$UFOCI_PATH` when set, otherwise
//! `$HOME/.ufoci`. The config file is `<home>/config.toml`; every section is
//! optional and falls back to defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::scripts::ScriptDefinition;

/// Environment variable overriding the home folder.
pub const HOME_ENV: &str = "UFOCI_PATH";

/// Name of the config file inside the home folder.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Name of the lock marker inside the home folder.
pub const LOCK_FILE_NAME: &str = "build.locked";

/// Resolve the home folder from the environment.
pub fn home_path() -> PathBuf {
    if let Some(path) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(path);
    }
    let user_home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    user_home.join(".ufoci")
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Home folder. Not part of the file; set by whoever loads it.
    #[serde(skip, default = "home_path")]
    pub home: PathBuf,

    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub tests: TestsConfig,

    #[serde(default)]
    pub ci: CiConfig,

    /// Additional fallback scripts on top of the bundled set.
    #[serde(default)]
    pub scripts: Vec<ScriptDefinition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: home_path(),
            general: GeneralConfig::default(),
            camera: CameraConfig::default(),
            tests: TestsConfig::default(),
            ci: CiConfig::default(),
            scripts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Folder scanned for plugins (default `<home>/plugins`).
    #[serde(default)]
    pub plugin_folder: Option<PathBuf>,

    /// Folder holding the bundled fallback scripts (default `<home>/scripts`).
    #[serde(default)]
    pub scripts_folder: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_sensor_width")]
    pub sensor_width: u32,

    #[serde(default = "default_sensor_height")]
    pub sensor_height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            sensor_width: default_sensor_width(),
            sensor_height: default_sensor_height(),
        }
    }
}

fn default_sensor_width() -> u32 {
    2048
}

fn default_sensor_height() -> u32 {
    1088
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsConfig {
    /// User test folder (default `<home>/tests`).
    #[serde(default)]
    pub folder: Option<PathBuf>,

    /// Test run archive (default `<home>/archive`).
    #[serde(default)]
    pub archive: Option<PathBuf>,

    /// Suite name to ordered test names.
    #[serde(default = "default_suites")]
    pub suites: BTreeMap<String, Vec<String>>,

    /// How often `repeated_reset` runs the reset script.
    #[serde(default = "default_reset_repetitions")]
    pub reset_repetitions: u32,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            folder: None,
            archive: None,
            suites: default_suites(),
            reset_repetitions: default_reset_repetitions(),
        }
    }
}

fn default_suites() -> BTreeMap<String, Vec<String>> {
    let mut suites = BTreeMap::new();
    suites.insert("mock".to_string(), vec!["mock".to_string()]);
    suites.insert(
        "full".to_string(),
        vec![
            "loaded_scripts".to_string(),
            "repeated_reset".to_string(),
            "single_frame".to_string(),
        ],
    );
    suites
}

fn default_reset_repetitions() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiConfig {
    /// Repository used for manually triggered builds.
    #[serde(default)]
    pub repository_url: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Suite executed by every build.
    #[serde(default = "default_test_suite")]
    pub test_suite: String,

    /// Bitfile location relative to the repository root.
    #[serde(default = "default_bitfile_path")]
    pub bitfile_path: String,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Scripts shipped with the hardware repository, overriding fallbacks.
    #[serde(default)]
    pub build_scripts: Vec<ScriptDefinition>,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            repository_url: String::new(),
            branch: default_branch(),
            test_suite: default_test_suite(),
            bitfile_path: default_bitfile_path(),
            hostname: default_hostname(),
            port: default_port(),
            build_scripts: Vec::new(),
        }
    }
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_test_suite() -> String {
    "mock".to_string()
}

fn default_bitfile_path() -> String {
    "bitfile/ufo.bit".to_string()
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2424
}

impl Config {
    /// Load `<home>/config.toml`, or defaults when the file does not exist.
    pub fn load(home: impl Into<PathBuf>) -> Result<Self> {
        let home = home.into();
        let path = home.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.home = home;
        Ok(config)
    }

    /// Parse a config file. The home folder is taken from the environment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self).map_err(ConfigError::Serialize)?)
    }

    /// Replace the home folder.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.camera.sensor_width == 0 || self.camera.sensor_height == 0 {
            return Err(ConfigError::Validation("sensor dimensions must be non-zero".into()).into());
        }
        for (suite, tests) in &self.tests.suites {
            if tests.is_empty() {
                return Err(
                    ConfigError::Validation(format!("test suite '{suite}' is empty")).into(),
                );
            }
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home.join(LOCK_FILE_NAME)
    }

    pub fn builds_path(&self) -> PathBuf {
        self.home.join("builds")
    }

    pub fn archive_path(&self) -> PathBuf {
        self.tests
            .archive
            .clone()
            .unwrap_or_else(|| self.home.join("archive"))
    }

    pub fn scripts_path(&self) -> PathBuf {
        self.general
            .scripts_folder
            .clone()
            .unwrap_or_else(|| self.home.join("scripts"))
    }

    pub fn plugin_path(&self) -> PathBuf {
        self.general
            .plugin_folder
            .clone()
            .unwrap_or_else(|| self.home.join("plugins"))
    }

    pub fn test_folder(&self) -> PathBuf {
        self.tests
            .folder
            .clone()
            .unwrap_or_else(|| self.home.join("tests"))
    }

    /// Create the home layout and write a default config file if missing.
    pub fn init_home(&self) -> Result<()> {
        for dir in [
            self.home.clone(),
            self.builds_path(),
            self.archive_path(),
            self.scripts_path(),
            self.plugin_path(),
            self.test_folder(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        let path = self.home.join(CONFIG_FILE_NAME);
        if !path.exists() {
            std::fs::write(&path, self.to_toml()?)?;
            tracing::info!(path = %path.display(), "Wrote default config");
        }
        Ok(())
    }
}
