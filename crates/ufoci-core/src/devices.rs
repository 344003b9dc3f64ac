//! Auxiliary lab devices (relay boards, power switches, ...).
//!
//! Plugins add devices through the `register_devices` action. Each device
//! exposes named functions which tests call through the [`DeviceManager`]
//! without depending on the plugin that provided them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, UfoError};

/// Action hook through which plugins register their devices.
pub const REGISTER_DEVICES_HOOK: &str = "register_devices";

/// Callable behind an exposed device function.
pub type DeviceFn = Arc<dyn Fn(&[String]) -> anyhow::Result<Value> + Send + Sync>;

/// A function a device makes available under one or more names.
#[derive(Clone)]
pub struct ExposedFunction {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub handler: DeviceFn,
}

impl ExposedFunction {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl Fn(&[String]) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            description: description.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }
}

impl fmt::Debug for ExposedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExposedFunction")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("description", &self.description)
            .finish()
    }
}

/// A piece of lab hardware next to the camera.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn set_up(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn tear_down(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn exposed_functions(&self) -> Vec<ExposedFunction>;
}

struct RegisteredFunction {
    device: String,
    description: String,
    handler: DeviceFn,
}

/// Registry of devices and the functions they expose.
#[derive(Default)]
pub struct DeviceManager {
    devices: BTreeMap<String, Arc<dyn Device>>,
    functions: BTreeMap<String, RegisteredFunction>,
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and every name of every function it exposes.
    /// A later device exposing an already known name takes it over.
    pub fn register_device(&mut self, device: Arc<dyn Device>) {
        let device_name = device.name().to_string();
        for function in device.exposed_functions() {
            for name in std::iter::once(&function.name).chain(function.aliases.iter()) {
                if let Some(previous) = self.functions.get(name) {
                    warn!(function = %name, previous = %previous.device, device = %device_name, "Device function overridden");
                }
                self.functions.insert(
                    name.clone(),
                    RegisteredFunction {
                        device: device_name.clone(),
                        description: function.description.clone(),
                        handler: function.handler.clone(),
                    },
                );
            }
        }
        debug!(device = %device_name, "Registered device");
        self.devices.insert(device_name, device);
    }

    pub fn supports(&self, function: &str) -> bool {
        self.functions.contains_key(function)
    }

    /// Call an exposed function. Handlers run synchronously on the calling
    /// thread and may block on external tools.
    pub fn invoke(&self, function: &str, args: &[String]) -> Result<Value> {
        let registered = self
            .functions
            .get(function)
            .ok_or_else(|| UfoError::DeviceNotRegistered(function.to_string()))?;
        (registered.handler)(args).map_err(|e| UfoError::Device {
            function: format!("{}::{function}", registered.device),
            message: format!("{e:#}"),
        })
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// `(name, description)` of every exposed function, sorted by name.
    pub fn functions(&self) -> Vec<(String, String)> {
        self.functions
            .iter()
            .map(|(name, f)| (name.clone(), f.description.clone()))
            .collect()
    }

    pub fn set_up_all(&self) -> anyhow::Result<()> {
        for device in self.devices.values() {
            device.set_up()?;
        }
        Ok(())
    }

    pub fn tear_down_all(&self) -> anyhow::Result<()> {
        for device in self.devices.values() {
            device.tear_down()?;
        }
        Ok(())
    }
}
