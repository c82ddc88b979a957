use crate::loader::{ObjectType, PendingObject, SourceKind};
use crate::{ConfigError, Result};
use hashbrown::HashMap;
use serde_json::json;

/// One created object as the registry sees it: its identity, raw parameter
/// bag and the names of the objects it needs.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub name: String,
    pub object_type: ObjectType,
    pub params: std::collections::BTreeMap<String, String>,
    pub source_file: String,
    pub source_kind: SourceKind,
    pub dependencies: Vec<String>,
}

/// Named, typed objects with a dependency graph. Names are unique across
/// all object types; an object is destroyable only when nothing depends on
/// it. Mutated only on the admin thread.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: HashMap<String, ObjectEntry>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from a loaded configuration. The loader has already
    /// verified order, so insertion cannot fail on missing dependencies.
    pub fn from_loaded(objects: &[PendingObject]) -> Result<Self> {
        let mut registry = Self::new();
        for object in objects {
            registry.insert(object.clone())?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, pending: PendingObject) -> Result<()> {
        if self.objects.contains_key(&pending.name) {
            return Err(ConfigError::invalid(format!(
                "an object named '{}' exists already",
                pending.name
            )));
        }
        let dependencies = pending.dependencies();
        for dep in &dependencies {
            if !self.objects.contains_key(dep) {
                return Err(ConfigError::invalid(format!(
                    "'{}' depends on '{dep}', which does not exist",
                    pending.name
                )));
            }
        }
        self.objects.insert(
            pending.name.clone(),
            ObjectEntry {
                name: pending.name,
                object_type: pending.object_type,
                params: pending.params,
                source_file: pending.source_file,
                source_kind: pending.source_kind,
                dependencies,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ObjectEntry> {
        self.objects.get(name)
    }

    pub fn get_typed(&self, name: &str, object_type: ObjectType) -> Result<&ObjectEntry> {
        match self.objects.get(name) {
            Some(entry) if entry.object_type == object_type => Ok(entry),
            Some(entry) => Err(ConfigError::invalid(format!(
                "'{name}' is a {}, not a {}",
                entry.object_type.as_str(),
                object_type.as_str()
            ))),
            None => Err(ConfigError::invalid(format!("no such object: '{name}'"))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectEntry> {
        self.objects.values()
    }

    /// Objects that list `name` among their dependencies.
    pub fn dependents_of(&self, name: &str) -> Vec<&ObjectEntry> {
        self.objects
            .values()
            .filter(|o| o.dependencies.iter().any(|d| d == name))
            .collect()
    }

    /// Remove an object. Refused while anything still depends on it, unless
    /// forced.
    pub fn remove(&mut self, name: &str, force: bool) -> Result<ObjectEntry> {
        if !self.objects.contains_key(name) {
            return Err(ConfigError::invalid(format!("no such object: '{name}'")));
        }
        let dependents: Vec<String> = self
            .dependents_of(name)
            .iter()
            .map(|o| o.name.clone())
            .collect();
        if !dependents.is_empty() && !force {
            return Err(ConfigError::invalid(format!(
                "cannot destroy '{name}': still in use by {}",
                dependents.join(", ")
            )));
        }
        Ok(self.objects.remove(name).expect("checked above"))
    }

    /// Replace an object's parameter bag, e.g. after a runtime rewire. The
    /// dependency set is re-derived from the new parameters.
    pub fn update_params(
        &mut self,
        name: &str,
        params: std::collections::BTreeMap<String, String>,
    ) -> Result<()> {
        let entry = self
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::invalid(format!("no such object: '{name}'")))?;
        let pending = PendingObject {
            name: entry.name.clone(),
            object_type: entry.object_type,
            params,
            source_file: entry.source_file.clone(),
            source_kind: SourceKind::Runtime,
        };
        let dependencies = pending.dependencies();
        for dep in &dependencies {
            if !self.objects.contains_key(dep) {
                return Err(ConfigError::invalid(format!(
                    "'{name}' depends on '{dep}', which does not exist"
                )));
            }
        }
        let entry = self.objects.get_mut(name).expect("checked above");
        entry.params = pending.params;
        entry.dependencies = dependencies;
        entry.source_kind = SourceKind::Runtime;
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut list: Vec<serde_json::Value> = self
            .objects
            .values()
            .map(|o| {
                json!({
                    "name": o.name,
                    "type": o.object_type.as_str(),
                    "source": {
                        "file": o.source_file,
                        "kind": o.source_kind.as_str(),
                    },
                    "dependencies": o.dependencies,
                })
            })
            .collect();
        list.sort_by_key(|v| v["name"].as_str().map(str::to_string));
        serde_json::Value::Array(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pending(name: &str, object_type: ObjectType, params: &[(&str, &str)]) -> PendingObject {
        PendingObject {
            name: name.to_string(),
            object_type,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            source_file: "test.cnf".to_string(),
            source_kind: SourceKind::Main,
        }
    }

    fn registry() -> ObjectRegistry {
        let mut registry = ObjectRegistry::new();
        registry
            .insert(pending(
                "s1",
                ObjectType::Server,
                &[("type", "server"), ("address", "10.0.0.1"), ("port", "3306")],
            ))
            .unwrap();
        registry
            .insert(pending(
                "svc",
                ObjectType::Service,
                &[("type", "service"), ("router", "readconnroute"), ("servers", "s1")],
            ))
            .unwrap();
        registry
    }

    #[test]
    fn names_are_unique_across_types() {
        let mut registry = registry();
        let err = registry
            .insert(pending("s1", ObjectType::Filter, &[("module", "capture")]))
            .unwrap_err();
        assert!(err.to_string().contains("exists already"));
    }

    #[test]
    fn destroy_refused_while_dependents_exist() {
        let mut registry = registry();
        let err = registry.remove("s1", false).unwrap_err();
        assert!(err.to_string().contains("svc"));
        // The force flag overrides.
        registry.remove("s1", true).unwrap();
    }

    #[test]
    fn destroy_in_dependency_order() {
        let mut registry = registry();
        registry.remove("svc", false).unwrap();
        registry.remove("s1", false).unwrap();
        assert!(registry.get("s1").is_none());
    }

    #[test]
    fn update_params_rederives_dependencies() {
        let mut registry = registry();
        registry
            .insert(pending(
                "s2",
                ObjectType::Server,
                &[("type", "server"), ("address", "10.0.0.2"), ("port", "3306")],
            ))
            .unwrap();
        let mut params: BTreeMap<String, String> = registry.get("svc").unwrap().params.clone();
        params.insert("servers".to_string(), "s2".to_string());
        registry.update_params("svc", params).unwrap();
        assert_eq!(registry.get("svc").unwrap().dependencies, vec!["s2"]);
        assert!(registry.dependents_of("s1").is_empty());
        registry.remove("s1", false).unwrap();
    }
}
