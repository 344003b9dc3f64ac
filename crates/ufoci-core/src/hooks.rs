//! Action and filter hooks.
//!
//! A hook is a named extension point. Plugins register callbacks against a
//! hook name; the core invokes the hook without knowing who listens.
//!
//! - **Actions** run side effects. Every callback receives the same `&mut`
//!   argument, highest priority first.
//! - **Filters** transform a value. The first callback receives the original
//!   value and every later callback receives its predecessor's output, so
//!   two stacked squaring filters yield the fourth power.
//!
//! Callbacks of equal priority run in registration order. Values are typed:
//! the registry stores callbacks type-erased and checks the type again on
//! every invocation, so a plugin registering against the wrong value type is
//! reported as [`HookError::TypeMismatch`] instead of silently skipped.
//!
//! ```
//! use ufoci_core::hooks::{HookRegistry, DEFAULT_PRIORITY};
//!
//! let mut hooks = HookRegistry::new();
//! hooks.register_filter("frame_count", DEFAULT_PRIORITY, |n: u32| Ok(n * 2));
//! assert_eq!(hooks.apply_filter("frame_count", 5u32).unwrap(), 10);
//! assert_eq!(hooks.apply_filter("unknown", 5u32).unwrap(), 5);
//! ```

use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, UfoError};
use crate::plugins::{LoadedPlugin, PluginCatalog, PluginManifest, IGNORE_MARKER, MANIFEST_FILE};

/// Priority used when a caller has no ordering preference.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Errors raised while dispatching a hook.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook '{hook}' was invoked with a value that is not {expected}")]
    TypeMismatch { hook: String, expected: &'static str },

    #[error("hook '{hook}' callback failed: {error:#}")]
    Callback { hook: String, error: anyhow::Error },
}

type ErasedFilter = dyn Fn(Box<dyn Any>, &dyn Any) -> std::result::Result<Box<dyn Any>, HookError>
    + Send
    + Sync;

type ErasedAction = dyn Fn(&mut dyn Any) -> std::result::Result<(), HookError> + Send + Sync;

/// One registered callback.
struct HookEntry<F: ?Sized> {
    priority: i32,
    callback: Arc<F>,
}

/// Insert keeping descending priority; equal priorities keep arrival order.
fn insert_entry<F: ?Sized>(entries: &mut Vec<HookEntry<F>>, entry: HookEntry<F>) {
    let pos = entries.partition_point(|s| s.priority >= entry.priority);
    entries.insert(pos, entry);
}

/// Registry of hooks and loaded plugins.
///
/// Built mutably during start-up (plugin loading), then shared read-only,
/// usually as `Arc<HookRegistry>`.
pub struct HookRegistry {
    filters: BTreeMap<String, Vec<HookEntry<ErasedFilter>>>,
    actions: BTreeMap<String, Vec<HookEntry<ErasedAction>>>,
    catalog: PluginCatalog,
    plugins: BTreeMap<String, LoadedPlugin>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HookRegistry {
    /// Empty registry resolving plugins against the built-in catalog.
    pub fn new() -> Self {
        Self::with_catalog(PluginCatalog::builtin())
    }

    pub fn with_catalog(catalog: PluginCatalog) -> Self {
        Self {
            filters: BTreeMap::new(),
            actions: BTreeMap::new(),
            catalog,
            plugins: BTreeMap::new(),
        }
    }

    /// Register a filter callback for values of type `T`.
    pub fn register_filter<T, F>(&mut self, hook: &str, priority: i32, callback: F)
    where
        T: 'static,
        F: Fn(T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.register_filter_with(hook, priority, move |value: T, _extra: &()| callback(value));
    }

    /// Register a filter callback that also reads the extra arguments passed
    /// to [`HookRegistry::apply_filter_with`].
    ///
    /// Callbacks registered with `X = ()` accept any extra argument.
    pub fn register_filter_with<T, X, F>(&mut self, hook: &str, priority: i32, callback: F)
    where
        T: 'static,
        X: 'static,
        F: Fn(T, &X) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let hook_name = hook.to_string();
        let erased = move |value: Box<dyn Any>, extra: &dyn Any| {
            let value = value.downcast::<T>().map_err(|_| HookError::TypeMismatch {
                hook: hook_name.clone(),
                expected: type_name::<T>(),
            })?;
            let unit = ();
            let extra: &X = match extra.downcast_ref::<X>() {
                Some(extra) => extra,
                None => match (&unit as &dyn Any).downcast_ref::<X>() {
                    Some(unit) => unit,
                    None => {
                        return Err(HookError::TypeMismatch {
                            hook: hook_name.clone(),
                            expected: type_name::<X>(),
                        })
                    }
                },
            };
            callback(*value, extra)
                .map(|v| Box::new(v) as Box<dyn Any>)
                .map_err(|error| HookError::Callback {
                    hook: hook_name.clone(),
                    error,
                })
        };

        insert_entry(
            self.filters.entry(hook.to_string()).or_default(),
            HookEntry {
                priority,
                callback: Arc::new(erased),
            },
        );
        debug!(hook = %hook, priority, "Registered filter");
    }

    /// Register an action callback taking `&mut A`.
    pub fn register_action<A, F>(&mut self, hook: &str, priority: i32, callback: F)
    where
        A: 'static,
        F: Fn(&mut A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hook_name = hook.to_string();
        let erased = move |args: &mut dyn Any| {
            let args = args
                .downcast_mut::<A>()
                .ok_or_else(|| HookError::TypeMismatch {
                    hook: hook_name.clone(),
                    expected: type_name::<A>(),
                })?;
            callback(args).map_err(|error| HookError::Callback {
                hook: hook_name.clone(),
                error,
            })
        };

        insert_entry(
            self.actions.entry(hook.to_string()).or_default(),
            HookEntry {
                priority,
                callback: Arc::new(erased),
            },
        );
        debug!(hook = %hook, priority, "Registered action");
    }

    /// Fold `value` through every filter registered for `hook`.
    pub fn apply_filter<T: 'static>(&self, hook: &str, value: T) -> std::result::Result<T, HookError> {
        self.apply_filter_with(hook, value, &())
    }

    /// Like [`HookRegistry::apply_filter`], handing `extra` to every callback.
    pub fn apply_filter_with<T: 'static, X: 'static>(
        &self,
        hook: &str,
        value: T,
        extra: &X,
    ) -> std::result::Result<T, HookError> {
        let Some(entries) = self.filters.get(hook) else {
            return Ok(value);
        };

        let mut current: Box<dyn Any> = Box::new(value);
        for entry in entries {
            current = (entry.callback)(current, extra)?;
        }

        current
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| HookError::TypeMismatch {
                hook: hook.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Run every action registered for `hook`. The first failing callback
    /// aborts the remaining ones.
    pub fn do_action<A: 'static>(&self, hook: &str, args: &mut A) -> std::result::Result<(), HookError> {
        let Some(entries) = self.actions.get(hook) else {
            return Ok(());
        };
        for entry in entries {
            (entry.callback)(args as &mut dyn Any)?;
        }
        Ok(())
    }

    pub fn has_filter(&self, hook: &str) -> bool {
        self.filters.contains_key(hook)
    }

    pub fn has_action(&self, hook: &str) -> bool {
        self.actions.contains_key(hook)
    }

    /// Number of callbacks registered for `hook` (filters and actions).
    pub fn callback_count(&self, hook: &str) -> usize {
        self.filters.get(hook).map_or(0, Vec::len) + self.actions.get(hook).map_or(0, Vec::len)
    }

    /// Load every plugin below `root`.
    ///
    /// Each immediate subdirectory is one plugin named after the directory.
    /// Directories starting with `_` are skipped, which also disables a
    /// plugin without deleting it. A missing `root` loads nothing.
    pub fn load_plugins(&mut self, root: &Path) -> Result<usize> {
        if !root.is_dir() {
            debug!(path = %root.display(), "Plugin folder does not exist");
            return Ok(0);
        }

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(IGNORE_MARKER) {
                debug!(plugin = %name, "Skipping ignored plugin folder");
                continue;
            }
            dirs.push((name, entry.path()));
        }
        dirs.sort();

        let mut loaded = 0;
        for (name, path) in dirs {
            self.load_plugin(&name, &path)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    fn load_plugin(&mut self, name: &str, path: &Path) -> Result<()> {
        let plugin_error = |reason: String| UfoError::PluginLoad {
            plugin: name.to_string(),
            reason,
        };

        let manifest_path = path.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(plugin_error(format!(
                "folder does not contain the entry point {MANIFEST_FILE}"
            )));
        }
        let content = std::fs::read_to_string(&manifest_path)
            .map_err(|e| plugin_error(format!("cannot read {MANIFEST_FILE}: {e}")))?;
        let manifest = PluginManifest::parse(name, path, &content).map_err(plugin_error)?;

        let entry = self
            .catalog
            .get(&manifest.entry)
            .ok_or_else(|| plugin_error(format!("unknown entry symbol '{}'", manifest.entry)))?;

        entry(self, &manifest).map_err(|e| plugin_error(format!("{e:#}")))?;

        info!(plugin = %name, entry = %manifest.entry, "Loaded plugin");
        self.plugins.insert(name.to_string(), LoadedPlugin { manifest });
        Ok(())
    }

    /// Loaded plugins keyed by folder name.
    pub fn plugins(&self) -> &BTreeMap<String, LoadedPlugin> {
        &self.plugins
    }

    /// Drop every hook callback and loaded plugin.
    pub fn reset(&mut self) {
        self.filters.clear();
        self.actions.clear();
        self.plugins.clear();
    }
}
