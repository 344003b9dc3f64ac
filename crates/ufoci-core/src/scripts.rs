//! Script resolution.
//!
//! Every hardware action (reset, power up, frame capture, flashing) is an
//! external script. Scripts live in two tiers:
//!
//! - **fallback**: the bundled defaults from `<home>/scripts` plus the
//!   `[[scripts]]` entries of the config file,
//! - **active**: what [`ScriptManager::invoke`] uses by default. Fallbacks
//!   are active until a build registers a script of the same name from the
//!   freshly cloned hardware repository.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ConfigError, Result, UfoError};
use crate::hooks::HookRegistry;

/// Action run with `&mut Config` before the manager reads the config.
pub const PRE_CONSTRUCT_HOOK: &str = "script_manager_pre_construct";

/// Filter over the fallback definitions (`Vec<ScriptDefinition>`).
pub const FALLBACK_DEFINITIONS_HOOK: &str = "fallback_script_definitions";

/// Filter over the build script definitions (`Vec<ScriptDefinition>`).
pub const BUILD_DEFINITIONS_HOOK: &str = "build_script_definitions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptClass {
    /// `bash <path> <args...>`
    #[default]
    Bash,
    /// Canned output, nothing is spawned.
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Fallback,
    Build,
}

/// Script entry as written in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub name: String,

    /// Absolute path, used by fallback scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Path relative to the repository root, used by build scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,

    #[serde(default)]
    pub author: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub class: ScriptClass,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ScriptDefinition {
    pub fn bash(name: &str, path: impl Into<PathBuf>, description: &str) -> Self {
        Self {
            name: name.to_string(),
            path: Some(path.into()),
            relative_path: None,
            author: String::new(),
            description: description.to_string(),
            class: ScriptClass::Bash,
            stdout: None,
            exit_code: None,
        }
    }

    pub fn mock(name: &str, stdout: &str, exit_code: i32) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            relative_path: None,
            author: String::new(),
            description: format!("mock {name}"),
            class: ScriptClass::Mock,
            stdout: Some(stdout.to_string()),
            exit_code: Some(exit_code),
        }
    }
}

/// A resolved, invocable script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub relative_path: Option<String>,
    pub author: String,
    pub description: String,
    pub origin: Origin,
    pub class: ScriptClass,
    pub mock_stdout: String,
    pub mock_exit_code: i32,
}

impl ScriptDescriptor {
    /// Resolve a fallback definition; bash scripts need an absolute `path`.
    pub fn fallback(def: &ScriptDefinition) -> Result<Self> {
        let path = match (&def.path, def.class) {
            (Some(path), _) => path.clone(),
            (None, ScriptClass::Mock) => PathBuf::new(),
            (None, ScriptClass::Bash) => {
                return Err(ConfigError::Validation(format!(
                    "fallback script '{}' has no path",
                    def.name
                ))
                .into())
            }
        };
        Ok(Self::from_definition(def, path, Origin::Fallback))
    }

    /// Resolve a build definition against the repository root.
    pub fn build(def: &ScriptDefinition, root: &Path) -> Result<Self> {
        let path = match (&def.relative_path, &def.path) {
            (Some(relative), _) => root.join(relative),
            (None, Some(path)) => path.clone(),
            (None, None) if def.class == ScriptClass::Mock => PathBuf::new(),
            (None, None) => {
                return Err(ConfigError::Validation(format!(
                    "build script '{}' has no relative_path",
                    def.name
                ))
                .into())
            }
        };
        Ok(Self::from_definition(def, path, Origin::Build))
    }

    fn from_definition(def: &ScriptDefinition, path: PathBuf, origin: Origin) -> Self {
        Self {
            name: def.name.clone(),
            path,
            relative_path: def.relative_path.clone(),
            author: def.author.clone(),
            description: def.description.clone(),
            origin,
            class: def.class,
            mock_stdout: def.stdout.clone().unwrap_or_default(),
            mock_exit_code: def.exit_code.unwrap_or(0),
        }
    }
}

/// Output of one script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The bundled fallback scripts, expected in `scripts_dir`.
pub fn default_definitions(scripts_dir: &Path) -> Vec<ScriptDefinition> {
    [
        ("reset", "Reset_all.sh", "Reset the camera parameters to the default state"),
        ("reset_tp", "Reset_all_TP.sh", "Reset the camera parameters and activate the test pattern"),
        ("status", "status.sh", "Read out the status registers of the camera"),
        ("power_up", "PWUp.sh", "Enable the internal power supply of the sensor"),
        ("power_down", "PWDown.sh", "Disable the internal power supply of the sensor"),
        ("pcie_init", "pcie_init.sh", "Identify the FPGA and initialise the PCIe driver"),
        ("reset_fpga", "reset_fpga.sh", "Reset the FPGA"),
        ("reset_dma", "dma.sh", "Reset the DMA engine of the FPGA"),
        ("capture_frame", "capture_frame.sh", "Capture one raw frame into the given path"),
        ("flash", "flash.sh", "Flash the given bitfile onto the FPGA"),
    ]
    .into_iter()
    .map(|(name, file, description)| ScriptDefinition::bash(name, scripts_dir.join(file), description))
    .collect()
}

/// Two-tier script registry.
#[derive(Debug)]
pub struct ScriptManager {
    config: Config,
    hooks: Arc<HookRegistry>,
    fallback_scripts: BTreeMap<String, Arc<ScriptDescriptor>>,
    scripts: BTreeMap<String, Arc<ScriptDescriptor>>,
}

impl ScriptManager {
    pub fn new(config: &Config, hooks: Arc<HookRegistry>) -> Result<Self> {
        let mut config = config.clone();
        hooks.do_action(PRE_CONSTRUCT_HOOK, &mut config)?;

        let mut definitions = default_definitions(&config.scripts_path());
        definitions.extend(config.scripts.iter().cloned());
        let definitions = hooks.apply_filter(FALLBACK_DEFINITIONS_HOOK, definitions)?;

        let mut manager = Self {
            config,
            hooks,
            fallback_scripts: BTreeMap::new(),
            scripts: BTreeMap::new(),
        };
        for def in &definitions {
            manager.register_fallback_script(ScriptDescriptor::fallback(def)?);
        }
        debug!(count = manager.fallback_scripts.len(), "Registered fallback scripts");
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a fallback. It also becomes active unless a build script of
    /// the same name is active.
    pub fn register_fallback_script(&mut self, descriptor: ScriptDescriptor) {
        let descriptor = Arc::new(descriptor);
        if !self.scripts.contains_key(&descriptor.name) || self.is_fallback(&descriptor.name) {
            self.scripts.insert(descriptor.name.clone(), descriptor.clone());
        }
        self.fallback_scripts.insert(descriptor.name.clone(), descriptor);
    }

    pub fn register_script(&mut self, descriptor: ScriptDescriptor) {
        if !self.fallback_scripts.contains_key(&descriptor.name) {
            warn!(
                script = %descriptor.name,
                "Script has no fallback version, it will be unavailable once the build is gone"
            );
        }
        self.scripts
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    /// Register the build scripts of a freshly cloned repository.
    pub fn load_build_scripts(&mut self, build_root: &Path) -> Result<usize> {
        let definitions = self
            .hooks
            .apply_filter(BUILD_DEFINITIONS_HOOK, self.config.ci.build_scripts.clone())?;

        let mut registered = 0;
        for def in &definitions {
            let descriptor = ScriptDescriptor::build(def, build_root)?;
            if descriptor.class == ScriptClass::Bash && !descriptor.path.is_file() {
                warn!(
                    script = %descriptor.name,
                    path = %descriptor.path.display(),
                    "Build script missing from repository, keeping fallback"
                );
                continue;
            }
            self.register_script(descriptor);
            registered += 1;
        }
        info!(registered, root = %build_root.display(), "Loaded build scripts");
        Ok(registered)
    }

    /// Run a script to completion. A nonzero exit code is reported in the
    /// result, not as an error.
    pub async fn invoke(&self, name: &str, args: &[String], use_fallback: bool) -> Result<ExecutionResult> {
        let descriptor = if use_fallback {
            self.get_fallback(name)
        } else {
            self.get(name)
        }
        .ok_or_else(|| UfoError::ScriptNotFound {
            name: name.to_string(),
            tier: if use_fallback { "fallback" } else { "active" },
        })?;

        match descriptor.class {
            ScriptClass::Mock => Ok(ExecutionResult {
                stdout: descriptor.mock_stdout.clone(),
                stderr: String::new(),
                exit_code: descriptor.mock_exit_code,
            }),
            ScriptClass::Bash => {
                debug!(script = %name, path = %descriptor.path.display(), ?args, "Invoking script");
                let output = Command::new("bash")
                    .arg(&descriptor.path)
                    .args(args)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()?
                    .wait_with_output()
                    .await?;

                let result = ExecutionResult {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                };
                if !result.success() {
                    warn!(script = %name, exit_code = result.exit_code, "Script exited with nonzero status");
                }
                Ok(result)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ScriptDescriptor>> {
        self.scripts.get(name).cloned()
    }

    pub fn get_fallback(&self, name: &str) -> Option<Arc<ScriptDescriptor>> {
        self.fallback_scripts.get(name).cloned()
    }

    /// Active scripts by name.
    pub fn scripts(&self) -> &BTreeMap<String, Arc<ScriptDescriptor>> {
        &self.scripts
    }

    /// Whether the active script `name` is still the fallback version.
    pub fn is_fallback(&self, name: &str) -> bool {
        self.scripts
            .get(name)
            .is_some_and(|s| s.origin == Origin::Fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DEFAULT_PRIORITY;

    fn manager(config: &Config) -> ScriptManager {
        ScriptManager::new(config, Arc::new(HookRegistry::new())).unwrap()
    }

    #[test]
    fn test_defaults_are_active_fallbacks() {
        let config = Config::default().with_home("/srv/ufoci");
        let scripts = manager(&config);

        assert_eq!(scripts.scripts().len(), 10);
        assert!(scripts.is_fallback("reset"));
        assert_eq!(
            scripts.get("flash").unwrap().path,
            PathBuf::from("/srv/ufoci/scripts/flash.sh")
        );
        assert_eq!(scripts.get("reset"), scripts.get_fallback("reset"));
    }

    #[test]
    fn test_build_script_shadows_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/reset.sh"), "echo build\n").unwrap();

        let mut config = Config::default().with_home(dir.path());
        config.ci.build_scripts = vec![ScriptDefinition {
            relative_path: Some("scripts/reset.sh".into()),
            path: None,
            ..ScriptDefinition::bash("reset", "", "build reset")
        }];

        let mut scripts = manager(&config);
        assert_eq!(scripts.load_build_scripts(dir.path()).unwrap(), 1);

        let active = scripts.get("reset").unwrap();
        assert_eq!(active.origin, Origin::Build);
        assert_eq!(active.path, dir.path().join("scripts/reset.sh"));
        assert_eq!(scripts.get_fallback("reset").unwrap().origin, Origin::Fallback);
        assert!(!scripts.is_fallback("reset"));
        assert!(scripts.is_fallback("status"));
    }

    #[test]
    fn test_missing_build_script_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default().with_home(dir.path());
        config.ci.build_scripts = vec![ScriptDefinition {
            relative_path: Some("nope.sh".into()),
            path: None,
            ..ScriptDefinition::bash("reset", "", "")
        }];

        let mut scripts = manager(&config);
        assert_eq!(scripts.load_build_scripts(dir.path()).unwrap(), 0);
        assert!(scripts.is_fallback("reset"));
    }

    #[tokio::test]
    async fn test_script_without_fallback_still_usable() {
        let mut scripts = manager(&Config::default());
        let def = ScriptDefinition::mock("exotic", "ok", 0);
        scripts.register_script(ScriptDescriptor::build(&def, Path::new("/")).unwrap());
        assert!(scripts.get("exotic").is_some());
        assert!(scripts.get_fallback("exotic").is_none());

        let result = scripts.invoke("exotic", &[], false).await.unwrap();
        assert_eq!(result.stdout, "ok");
        assert!(result.success());

        let err = scripts.invoke("exotic", &[], true).await.unwrap_err();
        assert!(matches!(err, UfoError::ScriptNotFound { tier: "fallback", .. }));
    }

    #[test]
    fn test_fallback_hooks_are_applied() {
        let mut hooks = HookRegistry::new();
        hooks.register_action(PRE_CONSTRUCT_HOOK, DEFAULT_PRIORITY, |config: &mut Config| {
            config.general.scripts_folder = Some(PathBuf::from("/opt/camera-scripts"));
            Ok(())
        });
        hooks.register_filter(
            FALLBACK_DEFINITIONS_HOOK,
            DEFAULT_PRIORITY,
            |mut defs: Vec<ScriptDefinition>| {
                defs.push(ScriptDefinition::mock("blink", "", 0));
                Ok(defs)
            },
        );

        let scripts = ScriptManager::new(&Config::default(), Arc::new(hooks)).unwrap();
        assert!(scripts.get("blink").is_some());
        assert_eq!(
            scripts.get("status").unwrap().path,
            PathBuf::from("/opt/camera-scripts/status.sh")
        );
    }

    #[tokio::test]
    async fn test_invoke_unknown_script() {
        let scripts = manager(&Config::default());
        let err = scripts.invoke("self_destruct", &[], false).await.unwrap_err();
        assert!(matches!(err, UfoError::ScriptNotFound { ref name, tier: "active" } if name == "self_destruct"));
    }

    #[tokio::test]
    async fn test_invoke_mock_script() {
        let mut config = Config::default();
        config.scripts.push(ScriptDefinition::mock("status", "0x9000: 0001", 3));
        let scripts = manager(&config);

        let result = scripts.invoke("status", &[], false).await.unwrap();
        assert_eq!(result.stdout, "0x9000: 0001");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_invoke_bash_script_with_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sh");
        std::fs::write(&path, "echo \"got $1\"\nexit 2\n").unwrap();

        let mut config = Config::default().with_home(dir.path());
        config.scripts.push(ScriptDefinition::bash("echo", &path, "echo"));
        let scripts = manager(&config);

        let result = scripts
            .invoke("echo", &["frame.raw".to_string()], true)
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "got frame.raw");
        assert_eq!(result.exit_code, 2);
    }

    #[test]
    fn test_definition_toml_format() {
        let def: ScriptDefinition = toml::from_str(
            "name = \"reset\"\nrelative_path = \"scripts/reset.sh\"\nauthor = \"lab\"\ndescription = \"x\"\nclass = \"bash\"\n",
        )
        .unwrap();
        assert_eq!(def.relative_path.as_deref(), Some("scripts/reset.sh"));
        assert_eq!(def.class, ScriptClass::Bash);
    }
}
