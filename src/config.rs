//! Named, typed configuration variables with change notification.
//!
//! Runtime tunables (default fiber stack size, connect timeout, the reactor's longest
//! kernel wait) live in a process-wide registry keyed by dotted lowercase names. Values
//! can be overridden programmatically with [`ConfigVar::set_value`] or in bulk from a
//! TOML document with [`Config::load_from_toml`]; every change is broadcast to the
//! listeners registered on the variable.
//!
//! # Example
//!
//! ```ignore
//! use fiberio::config::Config;
//!
//! let timeout = Config::lookup("tcp.connect.timeout", 5000i64, "tcp connect timeout")?;
//! timeout.add_listener(|old, new| println!("timeout {old} -> {new}"));
//!
//! Config::load_from_toml("[tcp.connect]\ntimeout = 250\n")?;
//! assert_eq!(timeout.value(), 250);
//! ```

use crate::error::{Error, Result};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Name of the default fiber stack size tunable, in bytes.
pub const FIBER_STACK_SIZE: &str = "fiber.stack_size";
/// Name of the default connect timeout tunable, in milliseconds.
pub const TCP_CONNECT_TIMEOUT: &str = "tcp.connect.timeout";
/// Name of the reactor's upper bound on a single kernel wait, in milliseconds.
pub const REACTOR_MAX_WAIT: &str = "reactor.max_wait_ms";

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A typed configuration value with change listeners.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: RwLock<BTreeMap<u64, Listener<T>>>,
    next_listener: AtomicU64,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Debug + Send + Sync + 'static,
{
    /// Creates a variable that is not registered in the global registry.
    pub fn new(name: &str, default: T, description: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: RwLock::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns a copy of the current value.
    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Replaces the value and notifies listeners with `(old, new)`.
    ///
    /// Setting the value it already holds is a no-op and notifies nobody.
    pub fn set_value(&self, value: T) {
        let old = {
            let mut current = self.value.write();
            if *current == value {
                return;
            }
            std::mem::replace(&mut *current, value.clone())
        };

        log::debug!("config {} changed from {:?} to {:?}", self.name, old, value);

        for listener in self.listeners.read().values() {
            listener(&old, &value);
        }
    }

    /// Registers a change listener and returns its key for [`Self::remove_listener`].
    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let key = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(key, Box::new(listener));
        key
    }

    pub fn remove_listener(&self, key: u64) -> bool {
        self.listeners.write().remove(&key).is_some()
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
    }
}

/// Type-erased view of a registered variable.
pub trait ConfigVarBase: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn type_name(&self) -> &'static str;
    /// Parses `value` into the variable's type and stores it.
    fn set_from_toml(&self, value: toml::Value) -> Result<()>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> ConfigVarBase for ConfigVar<T>
where
    T: Clone + PartialEq + Debug + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn set_from_toml(&self, value: toml::Value) -> Result<()> {
        let parsed: T = value.try_into().map_err(|e: toml::de::Error| Error::ConfigType {
            name: self.name.clone(),
            expected: std::any::type_name::<T>(),
            message: e.to_string(),
        })?;
        self.set_value(parsed);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Process-wide registry of configuration variables.
pub struct Config;

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn ConfigVarBase>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn ConfigVarBase>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

impl Config {
    /// Returns the variable registered under `name`, registering it with `default`
    /// when it does not exist yet.
    ///
    /// # Errors
    /// [`Error::ConfigType`] when `name` is already registered with another type.
    pub fn lookup<T>(name: &str, default: T, description: &str) -> Result<Arc<ConfigVar<T>>>
    where
        T: Clone + PartialEq + Debug + DeserializeOwned + Send + Sync + 'static,
    {
        let key = name.to_ascii_lowercase();

        if let Some(existing) = registry().read().get(&key) {
            return Self::downcast(&key, existing.clone());
        }

        let mut vars = registry().write();
        if let Some(existing) = vars.get(&key) {
            return Self::downcast(&key, existing.clone());
        }

        let var = Arc::new(ConfigVar::new(&key, default, description));
        vars.insert(key, var.clone());
        Ok(var)
    }

    /// Returns a registered variable without creating it.
    pub fn get(name: &str) -> Option<Arc<dyn ConfigVarBase>> {
        registry().read().get(&name.to_ascii_lowercase()).cloned()
    }

    /// Applies every value of a TOML document whose dotted key names a registered
    /// variable. Unknown keys are ignored.
    pub fn load_from_toml(source: &str) -> Result<()> {
        let table: toml::Table = source.parse()?;
        let mut entries = Vec::new();
        flatten("", &toml::Value::Table(table), &mut entries);

        for (key, value) in entries {
            if let Some(var) = Self::get(&key) {
                var.set_from_toml(value)?;
            }
        }

        Ok(())
    }

    /// Calls `visit` for every registered variable.
    pub fn visit(mut visit: impl FnMut(&dyn ConfigVarBase)) {
        for var in registry().read().values() {
            visit(var.as_ref());
        }
    }

    fn downcast<T>(name: &str, var: Arc<dyn ConfigVarBase>) -> Result<Arc<ConfigVar<T>>>
    where
        T: Clone + PartialEq + Debug + DeserializeOwned + Send + Sync + 'static,
    {
        let found = var.type_name();
        var.as_any()
            .downcast::<ConfigVar<T>>()
            .map_err(|_| {
                log::error!(
                    "config {name} exists with type {found}, requested {}",
                    std::any::type_name::<T>()
                );
                Error::ConfigType {
                    name: name.to_string(),
                    expected: std::any::type_name::<T>(),
                    message: format!("registered as {found}"),
                }
            })
    }
}

// Collects `(dotted.key, value)` for every node, tables included.
fn flatten(prefix: &str, value: &toml::Value, out: &mut Vec<(String, toml::Value)>) {
    if !prefix.is_empty() {
        out.push((prefix.to_ascii_lowercase(), value.clone()));
    }

    if let toml::Value::Table(table) = value {
        for (key, child) in table {
            let name = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            flatten(&name, child, out);
        }
    }
}

// Registered tunable, or a detached copy when the name is taken by another type.
fn tunable<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
where
    T: Clone + PartialEq + Debug + DeserializeOwned + Send + Sync + 'static,
{
    Config::lookup(name, default.clone(), description)
        .unwrap_or_else(|_| Arc::new(ConfigVar::new(name, default, description)))
}

/// Default stack size for fibers created without an explicit size.
pub fn fiber_stack_size() -> Arc<ConfigVar<u32>> {
    static VAR: OnceLock<Arc<ConfigVar<u32>>> = OnceLock::new();
    VAR.get_or_init(|| tunable(FIBER_STACK_SIZE, 128 * 1024, "fiber stack size"))
        .clone()
}

/// Default timeout applied by the intercepted `connect`.
pub fn tcp_connect_timeout() -> Arc<ConfigVar<i64>> {
    static VAR: OnceLock<Arc<ConfigVar<i64>>> = OnceLock::new();
    VAR.get_or_init(|| tunable(TCP_CONNECT_TIMEOUT, 5000, "tcp connect timeout"))
        .clone()
}

/// Longest single kernel wait performed by an idle reactor worker.
pub fn reactor_max_wait() -> Arc<ConfigVar<u64>> {
    static VAR: OnceLock<Arc<ConfigVar<u64>>> = OnceLock::new();
    VAR.get_or_init(|| tunable(REACTOR_MAX_WAIT, 3000, "reactor max epoll wait"))
        .clone()
}
