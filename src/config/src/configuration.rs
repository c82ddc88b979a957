use crate::specification::{ConfigValues, Specification};
use crate::value::Value;
use crate::ConfigError;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Callback fired when a parameter's value changes on commit.
pub type OnSet = Box<dyn Fn(&Value) + Send + Sync>;

/// An object's materialised configuration: its name, the specification it
/// was validated against and the current typed values. Values are committed
/// atomically; per-value callbacks fire only when the value changed.
pub struct Configuration {
    name: String,
    spec: Arc<Specification>,
    values: RwLock<Arc<ConfigValues>>,
    on_set: BTreeMap<String, OnSet>,
}

impl Configuration {
    pub fn new(name: &str, spec: Arc<Specification>, values: ConfigValues) -> Self {
        Self {
            name: name.to_string(),
            spec,
            values: RwLock::new(Arc::new(values)),
            on_set: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn specification(&self) -> &Specification {
        &self.spec
    }

    /// Register a callback invoked whenever `param` changes.
    pub fn on_set(&mut self, param: &str, callback: impl Fn(&Value) + Send + Sync + 'static) {
        self.on_set.insert(param.to_string(), Box::new(callback));
    }

    /// A snapshot of the current values. Readers hold the `Arc` for the
    /// scope of one operation; a concurrent commit publishes a new record
    /// without disturbing them.
    pub fn values(&self) -> Arc<ConfigValues> {
        self.values.read().unwrap().clone()
    }

    /// Validate and commit a full raw parameter bag.
    pub fn configure(
        &self,
        raw: &BTreeMap<String, String>,
    ) -> Result<(), Vec<ConfigError>> {
        let new_values = self.spec.validate(raw)?;
        self.commit(new_values);
        Ok(())
    }

    /// Validate and commit a runtime delta. Startup-only parameters are
    /// refused before any value is touched.
    pub fn reconfigure(
        &self,
        raw: &BTreeMap<String, String>,
    ) -> Result<(), Vec<ConfigError>> {
        let current = self.values();
        let new_values = self.spec.validate_runtime(&current, raw)?;
        self.commit(new_values);
        Ok(())
    }

    fn commit(&self, new_values: ConfigValues) {
        let old = {
            let mut guard = self.values.write().unwrap();
            std::mem::replace(&mut *guard, Arc::new(new_values))
        };
        let new = self.values();
        for (name, callback) in &self.on_set {
            if let Some(value) = new.get(name) {
                if old.get(name) != Some(value) {
                    callback(value);
                }
            }
        }
    }

    /// Serialize the current values as `key=value` lines, the persisted
    /// runtime-change format.
    pub fn to_config_lines(&self) -> String {
        let values = self.values();
        let mut out = String::new();
        for (key, value) in values.iter() {
            out.push_str(key);
            out.push('=');
            out.push_str(&value.to_config_string());
            out.push('\n');
        }
        out
    }
}

/// Copy-on-publish cell for heavily-read shared state: writers build a new
/// record and publish it, readers clone the `Arc` at scope entry and read
/// without further synchronisation. Routing workers additionally keep their
/// own copy refreshed by broadcast so the request path never touches the
/// lock.
pub struct Published<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> Published<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.inner.read().unwrap().clone()
    }

    pub fn store(&self, value: T) {
        *self.inner.write().unwrap() = Arc::new(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{Param, ParamKind};
    use crate::specification::ModuleKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec() -> Arc<Specification> {
        let mut spec = Specification::new("testmod", ModuleKind::Service);
        spec.add_param(
            Param::new("log_level", "log verbosity", ParamKind::String)
                .with_default(Value::String("info".to_string()))
                .at_runtime(),
        );
        spec.add_param(
            Param::new("threads", "worker threads", ParamKind::Int { min: 1, max: 128 })
                .with_default(Value::Int(4)),
        );
        Arc::new(spec)
    }

    fn raw(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn on_set_fires_only_on_change() {
        let spec = spec();
        let values = spec.validate(&raw(&[])).unwrap();
        let mut config = Configuration::new("svc", spec, values);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        config.on_set("log_level", move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        config
            .reconfigure(&raw(&[("log_level", "debug")]))
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Same value again: the callback must not fire.
        config
            .reconfigure(&raw(&[("log_level", "debug")]))
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn runtime_change_of_startup_param_is_refused() {
        let spec = spec();
        let values = spec.validate(&raw(&[])).unwrap();
        let config = Configuration::new("svc", spec, values);
        let errors = config.reconfigure(&raw(&[("threads", "8")])).unwrap_err();
        assert!(errors[0].to_string().contains("threads"));
        assert_eq!(config.values().int_value("threads"), 4);
    }

    #[test]
    fn published_snapshot_is_stable() {
        let cell = Published::new(1);
        let snapshot = cell.load();
        cell.store(2);
        assert_eq!(*snapshot, 1);
        assert_eq!(*cell.load(), 2);
    }
}
