use crate::param::{Modifiability, Param};
use crate::value::Value;
use crate::{ConfigError, Result};
use std::collections::BTreeMap;
use std::fmt;

/// The object kinds a specification can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Global,
    Service,
    Server,
    Monitor,
    Filter,
    Listener,
    Router,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleKind::Global => "global",
            ModuleKind::Service => "service",
            ModuleKind::Server => "server",
            ModuleKind::Monitor => "monitor",
            ModuleKind::Filter => "filter",
            ModuleKind::Listener => "listener",
            ModuleKind::Router => "router",
        };
        write!(f, "{name}")
    }
}

/// The validated, typed state of one object: parameter name -> value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigValues {
    values: BTreeMap<String, Value>,
}

impl ConfigValues {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn bool_value(&self, name: &str) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn int_value(&self, name: &str) -> i64 {
        self.get(name).and_then(Value::as_int).unwrap_or(0)
    }

    pub fn string_value(&self, name: &str) -> String {
        self.get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn duration_value(&self, name: &str) -> std::time::Duration {
        self.get(name)
            .and_then(Value::as_duration)
            .unwrap_or_default()
    }

    pub fn list_value(&self, name: &str) -> Vec<String> {
        self.get(name)
            .and_then(Value::as_str_list)
            .map(<[String]>::to_vec)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Names of the objects these values reference, i.e. the owning
    /// object's dependencies.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .values
            .values()
            .flat_map(Value::dependencies)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Cross-parameter rule run after all per-parameter validation passed.
pub type PostValidator = Box<dyn Fn(&ConfigValues) -> Result<()> + Send + Sync>;

/// The declarative schema of one module kind: an ordered collection of
/// parameter descriptors plus post-validation hooks.
pub struct Specification {
    module: String,
    kind: ModuleKind,
    params: Vec<Param>,
    post_validators: Vec<PostValidator>,
}

impl fmt::Debug for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Specification")
            .field("module", &self.module)
            .field("kind", &self.kind)
            .field("params", &self.params.len())
            .finish()
    }
}

impl Specification {
    pub fn new(module: &str, kind: ModuleKind) -> Self {
        Self {
            module: module.to_string(),
            kind,
            params: Vec::new(),
            post_validators: Vec::new(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn add_param(&mut self, param: Param) -> &mut Self {
        debug_assert!(
            self.find_param(&param.name).is_none(),
            "duplicate param {}",
            param.name
        );
        self.params.push(param);
        self
    }

    pub fn add_post_validator(
        &mut self,
        validator: impl Fn(&ConfigValues) -> Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.post_validators.push(Box::new(validator));
        self
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn find_param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Validate a raw parameter bag in two passes: per-parameter syntax
    /// (collecting unknown keys), then the cross-parameter hooks. Errors
    /// are consolidated rather than first-wins.
    pub fn validate(&self, raw: &BTreeMap<String, String>) -> std::result::Result<ConfigValues, Vec<ConfigError>> {
        let mut errors = Vec::new();
        let mut values = ConfigValues::default();

        for (key, raw_value) in raw {
            match self.find_param(key) {
                Some(param) => match param.parse(raw_value) {
                    Ok(value) => values.set(key, value),
                    Err(e) => errors.push(ConfigError::invalid(format!("'{key}': {e}"))),
                },
                None => errors.push(ConfigError::UnknownParameter(key.clone())),
            }
        }

        for param in &self.params {
            if values.get(&param.name).is_some() {
                continue;
            }
            if let Some(default) = &param.default {
                values.set(&param.name, default.clone());
            } else if param.mandatory {
                errors.push(ConfigError::MissingMandatory(param.name.clone()));
            }
        }

        if errors.is_empty() {
            for validator in &self.post_validators {
                if let Err(e) = validator(&values) {
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            Ok(values)
        } else {
            Err(errors)
        }
    }

    /// Like `validate`, but additionally refuses any parameter whose
    /// modifiability is startup-only. Used for runtime reconfiguration.
    pub fn validate_runtime(
        &self,
        current: &ConfigValues,
        raw: &BTreeMap<String, String>,
    ) -> std::result::Result<ConfigValues, Vec<ConfigError>> {
        let mut errors = Vec::new();
        for key in raw.keys() {
            if let Some(param) = self.find_param(key) {
                if param.modifiability == Modifiability::Startup {
                    errors.push(ConfigError::NotModifiableAtRuntime { name: key.clone() });
                }
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        // Merge over the current values so unmentioned parameters persist.
        let mut merged: BTreeMap<String, String> = current
            .iter()
            .map(|(k, v)| (k.clone(), v.to_config_string()))
            .collect();
        merged.extend(raw.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.validate(&merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{Param, ParamKind};

    fn spec() -> Specification {
        let mut spec = Specification::new("testmod", ModuleKind::Filter);
        spec.add_param(Param::new("user", "backend user", ParamKind::String).mandatory());
        spec.add_param(
            Param::new("retries", "connection retries", ParamKind::Int { min: 0, max: 10 })
                .with_default(Value::Int(3))
                .at_runtime(),
        );
        spec.add_param(
            Param::new("writeq_high_water", "high water", ParamKind::Size)
                .with_default(Value::Size(65536))
                .at_runtime(),
        );
        spec.add_param(
            Param::new("writeq_low_water", "low water", ParamKind::Size)
                .with_default(Value::Size(1024))
                .at_runtime(),
        );
        spec.add_post_validator(|values| {
            if values.int_value("writeq_high_water") <= values.int_value("writeq_low_water") {
                return Err(ConfigError::invalid(
                    "'writeq_high_water' must be greater than 'writeq_low_water'",
                ));
            }
            Ok(())
        });
        spec
    }

    fn raw(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn mandatory_is_enforced() {
        let errors = spec().validate(&raw(&[])).unwrap_err();
        assert!(errors.iter().any(|e| e.to_string().contains("user")));
    }

    #[test]
    fn unknown_parameters_are_collected() {
        let errors = spec()
            .validate(&raw(&[("user", "u"), ("bogus", "1"), ("extra", "2")]))
            .unwrap_err();
        let unknown = errors
            .iter()
            .filter(|e| matches!(e, ConfigError::UnknownParameter(_)))
            .count();
        assert_eq!(unknown, 2);
    }

    #[test]
    fn defaults_are_applied() {
        let values = spec().validate(&raw(&[("user", "u")])).unwrap();
        assert_eq!(values.int_value("retries"), 3);
    }

    #[test]
    fn post_validator_runs_after_syntax() {
        let errors = spec()
            .validate(&raw(&[
                ("user", "u"),
                ("writeq_high_water", "1K"),
                ("writeq_low_water", "2K"),
            ]))
            .unwrap_err();
        assert!(errors[0].to_string().contains("writeq_high_water"));
    }

    #[test]
    fn runtime_refuses_startup_only() {
        let current = spec().validate(&raw(&[("user", "u")])).unwrap();
        let errors = spec()
            .validate_runtime(&current, &raw(&[("user", "other")]))
            .unwrap_err();
        assert!(matches!(
            errors[0],
            ConfigError::NotModifiableAtRuntime { .. }
        ));
    }

    #[test]
    fn runtime_accepts_runtime_params() {
        let current = spec().validate(&raw(&[("user", "u")])).unwrap();
        let values = spec()
            .validate_runtime(&current, &raw(&[("retries", "5")]))
            .unwrap();
        assert_eq!(values.int_value("retries"), 5);
        assert_eq!(values.string_value("user"), "u");
    }
}
