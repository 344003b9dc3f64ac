//! ufoci core library
//!
//! Hooks and plugins, script resolution, the build lock and the test engine
//! used by the CI pipeline and the `ufoci` command line tool.

pub mod camera;
pub mod config;
pub mod devices;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod plugins;
pub mod scripts;
pub mod telemetry;
pub mod testing;

pub use camera::{Camera, CameraError, Frame, MockCamera, ScriptCamera};
pub use config::{home_path, Config};
pub use devices::{Device, DeviceManager, ExposedFunction};
pub use error::{ConfigError, Result, UfoError};
pub use hooks::{HookError, HookRegistry, DEFAULT_PRIORITY};
pub use lock::{BuildLock, BuildLockGuard};
pub use plugins::{LoadedPlugin, PluginCatalog, PluginEntry, PluginManifest};
pub use scripts::{ExecutionResult, Origin, ScriptClass, ScriptDefinition, ScriptDescriptor, ScriptManager};
pub use testing::{
    TestCase, TestCatalog, TestContext, TestMetadata, TestReport, TestResult, TestRunner, TestSession,
};
