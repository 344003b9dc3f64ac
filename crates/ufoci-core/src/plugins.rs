//! Plugin discovery.
//!
//! A plugin is a folder in the plugin directory containing a `plugin.toml`
//! manifest. The manifest names an `entry` symbol which is looked up in a
//! [`PluginCatalog`], a registry of entry functions compiled into the binary.
//! The entry function receives the [`HookRegistry`] and registers whatever
//! actions and filters the plugin provides; the manifest's `[settings]`
//! table carries per-installation parameters.
//!
//! ```toml
//! entry = "relay_board"
//! description = "Ashata USB relay board powering the camera"
//!
//! [settings]
//! relay_count = 4
//! base_name = "QAAMZ"
//! camera_index = 1
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::devices::{Device, DeviceManager, ExposedFunction, REGISTER_DEVICES_HOOK};
use crate::hooks::{HookRegistry, DEFAULT_PRIORITY};

/// Entry-point manifest every plugin folder must contain.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Plugin folders starting with this character are ignored.
pub const IGNORE_MARKER: char = '_';

/// Registration function of a plugin.
pub type PluginEntry = fn(&mut HookRegistry, &PluginManifest) -> anyhow::Result<()>;

/// Parsed `plugin.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    /// Folder name, which is also the plugin name.
    #[serde(skip)]
    pub name: String,

    #[serde(skip)]
    pub path: PathBuf,

    pub entry: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub settings: toml::Table,
}

impl PluginManifest {
    pub fn parse(name: &str, path: &Path, content: &str) -> Result<Self, String> {
        let mut manifest: PluginManifest =
            toml::from_str(content).map_err(|e| format!("invalid {MANIFEST_FILE}: {e}"))?;
        manifest.name = name.to_string();
        manifest.path = path.to_path_buf();
        Ok(manifest)
    }

    /// Deserialize the `[settings]` table into a typed struct.
    pub fn settings<T: for<'de> Deserialize<'de>>(&self) -> anyhow::Result<T> {
        Ok(toml::Value::Table(self.settings.clone()).try_into()?)
    }
}

/// A plugin that was loaded into a registry.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
}

/// Entry symbols resolvable by `plugin.toml` manifests.
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    entries: BTreeMap<String, PluginEntry>,
}

impl PluginCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog with the plugins shipped in this crate.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register("relay_board", relay_board_entry);
        catalog
    }

    pub fn register(&mut self, symbol: &str, entry: PluginEntry) {
        self.entries.insert(symbol.to_string(), entry);
    }

    pub fn get(&self, symbol: &str) -> Option<PluginEntry> {
        self.entries.get(symbol).copied()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RelayBoardSettings {
    #[serde(default = "default_relay_count")]
    relay_count: u8,
    #[serde(default = "default_relay_base_name")]
    base_name: String,
    #[serde(default = "default_camera_index")]
    camera_index: u8,
}

fn default_relay_count() -> u8 {
    4
}

fn default_relay_base_name() -> String {
    "QAAMZ".to_string()
}

fn default_camera_index() -> u8 {
    1
}

/// USB relay board switched through the `usbrelay` command line tool.
///
/// The exposed functions block: they wait for `usbrelay` and
/// `hard_reset_camera` sleeps one second between switching off and on.
/// Async callers that must not stall a runtime worker should call them via
/// `tokio::task::spawn_blocking`.
#[derive(Debug, Clone)]
struct RelayBoard {
    settings: RelayBoardSettings,
}

impl RelayBoard {
    fn switch(settings: &RelayBoardSettings, index: u8, on: bool) -> anyhow::Result<Value> {
        if index == 0 || index > settings.relay_count {
            anyhow::bail!(
                "relay index {index} is invalid, the board has relays 1..={}",
                settings.relay_count
            );
        }
        let target = format!("{}_{}={}", settings.base_name, index, u8::from(on));
        let status = Command::new("usbrelay").arg(&target).status()?;
        Ok(json!({ "relay": index, "on": on, "exit_code": status.code().unwrap_or(-1) }))
    }

    fn parse_index(args: &[String]) -> anyhow::Result<u8> {
        let raw = args
            .first()
            .ok_or_else(|| anyhow::anyhow!("missing relay index argument"))?;
        Ok(raw.parse()?)
    }
}

impl Device for RelayBoard {
    fn name(&self) -> &str {
        "ashata_relay_board"
    }

    fn description(&self) -> &str {
        "USB controlled relay board used to power-cycle the camera"
    }

    fn exposed_functions(&self) -> Vec<ExposedFunction> {
        let on = self.settings.clone();
        let off = self.settings.clone();
        let reset = self.settings.clone();
        vec![
            ExposedFunction::new(
                "activate_relay",
                "Close the relay with the given index so that it conducts",
                move |args| RelayBoard::switch(&on, RelayBoard::parse_index(args)?, true),
            ),
            ExposedFunction::new(
                "deactivate_relay",
                "Open the relay with the given index",
                move |args| RelayBoard::switch(&off, RelayBoard::parse_index(args)?, false),
            ),
            ExposedFunction::new(
                "hard_reset_camera",
                "Power-cycle the camera through its relay",
                move |_| {
                    RelayBoard::switch(&reset, reset.camera_index, false)?;
                    std::thread::sleep(Duration::from_secs(1));
                    RelayBoard::switch(&reset, reset.camera_index, true)
                },
            )
            .with_alias("power_cycle_camera"),
        ]
    }
}

fn relay_board_entry(hooks: &mut HookRegistry, manifest: &PluginManifest) -> anyhow::Result<()> {
    let settings: RelayBoardSettings = manifest.settings()?;
    hooks.register_action(
        REGISTER_DEVICES_HOOK,
        DEFAULT_PRIORITY,
        move |devices: &mut DeviceManager| {
            devices.register_device(Arc::new(RelayBoard {
                settings: settings.clone(),
            }));
            Ok(())
        },
    );
    Ok(())
}
