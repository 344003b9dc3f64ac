//! Test discovery.
//!
//! Sources, later ones overriding earlier ones on equal names:
//!
//! 1. the built-in tests,
//! 2. `*.toml` modules in the user test folder, each declaring one or more
//!    script-driven tests,
//! 3. the `test_catalog` filter hook.
//!
//! A test module looks like this:
//!
//! ```toml
//! [[test]]
//! name = "status_registers"
//! description = "Status registers report no PCI error"
//! script = "status"
//! check_pci = true
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::builtin::{LoadedScriptsTest, MockTest, RepeatedResetTest, SingleFrameTest};
use super::{AssertionCollector, TestCase, TestContext, TestResult};
use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::hooks::HookRegistry;

/// Filter hook over the discovered [`TestCatalog`].
pub const TEST_CATALOG_HOOK: &str = "test_catalog";

/// Creates a fresh test instance.
pub type TestFactory = Arc<dyn Fn() -> Box<dyn TestCase> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestSource {
    Builtin,
    Folder(PathBuf),
    Plugin,
}

#[derive(Clone)]
struct CatalogEntry {
    description: String,
    source: TestSource,
    factory: TestFactory,
}

/// Test name to factory.
#[derive(Clone, Default)]
pub struct TestCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl fmt::Debug for TestCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(name, e)| (name, &e.source)))
            .finish()
    }
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register_default::<MockTest>();
        catalog.register_default::<LoadedScriptsTest>();
        catalog.register_default::<SingleFrameTest>();
        catalog.register_default::<RepeatedResetTest>();
        catalog
    }

    /// Built-in tests, the user test folder, then the `test_catalog` filter.
    pub fn discover(config: &Config, hooks: &HookRegistry) -> Result<Self> {
        let mut catalog = Self::builtin();
        let loaded = catalog.load_folder(&config.test_folder())?;
        if loaded > 0 {
            info!(loaded, folder = %config.test_folder().display(), "Loaded script tests");
        }
        Ok(hooks.apply_filter(TEST_CATALOG_HOOK, catalog)?)
    }

    pub fn register<F>(&mut self, name: &str, description: &str, source: TestSource, factory: F)
    where
        F: Fn() -> Box<dyn TestCase> + Send + Sync + 'static,
    {
        if self.entries.contains_key(name) {
            debug!(test = %name, ?source, "Test overridden");
        }
        self.entries.insert(
            name.to_string(),
            CatalogEntry {
                description: description.to_string(),
                source,
                factory: Arc::new(factory),
            },
        );
    }

    fn register_default<T: TestCase + Default + 'static>(&mut self) {
        let sample = T::default();
        self.register(
            sample.name(),
            sample.description(),
            TestSource::Builtin,
            || Box::new(T::default()) as Box<dyn TestCase>,
        );
    }

    /// Register every test declared by `*.toml` modules directly in `folder`.
    /// A missing folder contributes nothing.
    pub fn load_folder(&mut self, folder: &Path) -> Result<usize> {
        if !folder.is_dir() {
            return Ok(0);
        }
        let mut modules: Vec<PathBuf> = std::fs::read_dir(folder)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        modules.sort();

        let mut loaded = 0;
        for module in modules {
            let content = std::fs::read_to_string(&module)?;
            let parsed: TestModule = toml::from_str(&content).map_err(|e| {
                ConfigError::Validation(format!("test module {}: {e}", module.display()))
            })?;
            for def in parsed.test {
                let name = def.name.clone();
                let description = def.description.clone();
                let def = Arc::new(def);
                self.register(&name, &description, TestSource::Folder(module.clone()), move || {
                    Box::new(ScriptTest::new(def.as_ref().clone())) as Box<dyn TestCase>
                });
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn TestCase>> {
        self.entries.get(name).map(|e| (e.factory)())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn description(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|e| e.description.as_str())
    }

    pub fn source(&self, name: &str) -> Option<&TestSource> {
        self.entries.get(name).map(|e| &e.source)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct TestModule {
    #[serde(default)]
    test: Vec<ScriptTestDefinition>,
}

/// One `[[test]]` entry of a test module.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptTestDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub expect_exit_code: i32,
    /// Check every register line of the output for PCI errors.
    #[serde(default)]
    pub check_pci: bool,
    #[serde(default)]
    pub use_fallback: bool,
}

/// Runs a script and asserts on its exit code and output.
#[derive(Debug, Clone)]
pub struct ScriptTest {
    def: ScriptTestDefinition,
}

impl ScriptTest {
    pub fn new(def: ScriptTestDefinition) -> Self {
        Self { def }
    }
}

#[async_trait]
impl TestCase for ScriptTest {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn description(&self) -> &str {
        &self.def.description
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<TestResult> {
        let output = ctx
            .scripts
            .invoke(&self.def.script, &self.def.args, self.def.use_fallback)
            .await?;

        let mut collector = AssertionCollector::new();
        collector.assert_equal(self.def.expect_exit_code, output.exit_code);
        if self.def.check_pci {
            for line in output.stdout.lines().filter(|l| l.contains(':')) {
                collector.assert_pci_read_ok(line);
            }
        }
        Ok(collector.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DEFAULT_PRIORITY;
    use crate::scripts::ScriptDefinition;
    use crate::testing::test_support::mock_context;

    const MODULE: &str = r#"
[[test]]
name = "status_registers"
description = "Status registers are clean"
script = "status"
check_pci = true

[[test]]
name = "mock"
description = "Overrides the built-in mock test"
script = "status"
expect_exit_code = 1
"#;

    #[test]
    fn test_builtin_catalog() {
        let catalog = TestCatalog::builtin();
        assert_eq!(
            catalog.names(),
            vec!["loaded_scripts", "mock", "repeated_reset", "single_frame"]
        );
        assert_eq!(catalog.create("mock").unwrap().name(), "mock");
        assert!(catalog.create("nope").is_none());
    }

    #[test]
    fn test_folder_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("status.toml"), MODULE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut catalog = TestCatalog::builtin();
        assert_eq!(catalog.load_folder(dir.path()).unwrap(), 2);
        assert!(catalog.contains("status_registers"));
        assert_eq!(
            catalog.source("mock"),
            Some(&TestSource::Folder(dir.path().join("status.toml")))
        );
    }

    #[test]
    fn test_invalid_module_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "[[test]]\nname = 3\n").unwrap();
        let err = TestCatalog::new().load_folder(dir.path()).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_catalog_filter_hook() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().with_home(dir.path());
        let mut hooks = HookRegistry::new();
        hooks.register_filter(TEST_CATALOG_HOOK, DEFAULT_PRIORITY, |mut catalog: TestCatalog| {
            catalog.register("plugin_test", "from a plugin", TestSource::Plugin, || {
                Box::new(MockTest) as Box<dyn TestCase>
            });
            Ok(catalog)
        });

        let catalog = TestCatalog::discover(&config, &hooks).unwrap();
        assert_eq!(catalog.source("plugin_test"), Some(&TestSource::Plugin));
        assert_eq!(catalog.len(), 5);
    }

    #[tokio::test]
    async fn test_script_test_assertions() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = mock_context(
            dir.path(),
            vec![ScriptDefinition::mock("status", "9050:  000f\n", 0)],
        );
        let def: TestModule = toml::from_str(MODULE).unwrap();

        let status = ScriptTest::new(def.test[0].clone()).run(&ctx).await.unwrap();
        assert!(!status.passing());

        let exit_code = ScriptTest::new(def.test[1].clone()).run(&ctx).await.unwrap();
        assert!(!exit_code.passing());
    }
}
