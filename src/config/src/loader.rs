use crate::ini::{self, IniFile, Section};
use crate::{ConfigError, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Where an object's definition came from, with ascending precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceKind {
    Main,
    Additional,
    Runtime,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Main => "main",
            SourceKind::Additional => "additional",
            SourceKind::Runtime => "runtime",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Service,
    Server,
    Monitor,
    Filter,
    Listener,
}

impl ObjectType {
    pub fn parse(s: &str) -> Option<ObjectType> {
        match s {
            "service" => Some(ObjectType::Service),
            "server" => Some(ObjectType::Server),
            "monitor" => Some(ObjectType::Monitor),
            "filter" => Some(ObjectType::Filter),
            "listener" => Some(ObjectType::Listener),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Service => "service",
            ObjectType::Server => "server",
            ObjectType::Monitor => "monitor",
            ObjectType::Filter => "filter",
            ObjectType::Listener => "listener",
        }
    }
}

/// A section that has passed structural checks and is waiting to become a
/// live object.
#[derive(Debug, Clone)]
pub struct PendingObject {
    pub name: String,
    pub object_type: ObjectType,
    pub params: BTreeMap<String, String>,
    pub source_file: String,
    pub source_kind: SourceKind,
}

impl PendingObject {
    /// Names of objects this one needs, derived from the well-known
    /// reference parameters.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = Vec::new();
        for key in ["servers", "targets", "filters"] {
            if let Some(value) = self.params.get(key) {
                deps.extend(
                    value
                        .split(['|', ','])
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
        }
        for key in ["cluster", "service", "main"] {
            if let Some(value) = self.params.get(key) {
                let value = value.trim();
                if !value.is_empty() {
                    deps.push(value.to_string());
                }
            }
        }
        deps.sort();
        deps.dedup();
        deps
    }
}

/// The result of a successful load: global parameters plus the objects in
/// creation order (servers first, then dependency order).
#[derive(Debug, Default)]
pub struct LoadedConfig {
    pub globals: BTreeMap<String, String>,
    pub objects: Vec<PendingObject>,
}

impl LoadedConfig {
    pub fn object(&self, name: &str) -> Option<&PendingObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    /// Introspection payload naming the file an object came from.
    pub fn object_source_to_json(&self, name: &str) -> Option<serde_json::Value> {
        self.object(name).map(|o| {
            json!({
                "file": o.source_file,
                "source": o.source_kind.as_str(),
            })
        })
    }

    /// Serialize back to a single configuration file. Re-parsing the output
    /// yields the same object graph.
    pub fn to_config_string(&self) -> String {
        let mut out = String::new();
        out.push_str("[maxscale]\n");
        for (key, value) in &self.globals {
            out.push_str(&format!("{key}={value}\n"));
        }
        for object in &self.objects {
            out.push_str(&format!("\n[{}]\n", object.name));
            for (key, value) in &object.params {
                out.push_str(&format!("{key}={value}\n"));
            }
        }
        out
    }
}

/// Loads the main file, `<main>.d/*.cnf` and the runtime directory, merges
/// them with the documented precedence and resolves the dependency order.
pub struct ConfigLoader {
    main_path: PathBuf,
    runtime_dir: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(main_path: impl Into<PathBuf>) -> Self {
        Self {
            main_path: main_path.into(),
            runtime_dir: None,
        }
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    pub fn load(&self) -> Result<LoadedConfig> {
        let mut files = Vec::new();
        files.push((self.read_file(&self.main_path)?, SourceKind::Main));

        let additional_dir = {
            let mut dir = self.main_path.as_os_str().to_owned();
            dir.push(".d");
            PathBuf::from(dir)
        };
        for path in scan_config_dir(&additional_dir)? {
            files.push((self.read_file(&path)?, SourceKind::Additional));
        }
        if let Some(runtime_dir) = &self.runtime_dir {
            for path in scan_config_dir(runtime_dir)? {
                files.push((self.read_file(&path)?, SourceKind::Runtime));
            }
        }

        let substitute = files
            .iter()
            .find_map(|(f, _)| f.section("maxscale"))
            .and_then(|s| s.params.get("substitute_variables"))
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "on" | "1"))
            .unwrap_or(false);
        if substitute {
            for (file, _) in &mut files {
                ini::substitute_variables(file)?;
            }
        }

        let mut sections: Vec<(Section, String, SourceKind)> = Vec::new();
        for (file, kind) in files {
            for section in file.sections {
                sections.push((section, file.path.clone(), kind));
            }
        }

        // Includes are resolved across all sources before the merge.
        // resolve_includes preserves order and only removes include-typed
        // sections, so source metadata can be re-attached positionally.
        let mut flat: Vec<Section> = sections.iter().map(|(s, _, _)| s.clone()).collect();
        ini::resolve_includes(&mut flat)?;
        let metadata: Vec<(String, SourceKind)> = sections
            .iter()
            .filter(|(s, _, _)| s.params.get("type").map(String::as_str) != Some("include"))
            .map(|(_, path, kind)| (path.clone(), *kind))
            .collect();
        let merged: Vec<(Section, String, SourceKind)> = flat
            .into_iter()
            .zip(metadata)
            .map(|(section, (path, kind))| (section, path, kind))
            .collect();

        self.build(merged)
    }

    /// Build directly from pre-parsed sections; the path tests and the
    /// runtime API use this entry point.
    pub fn build(
        &self,
        sections: Vec<(Section, String, SourceKind)>,
    ) -> Result<LoadedConfig> {
        let mut globals = BTreeMap::new();
        let mut objects: BTreeMap<String, PendingObject> = BTreeMap::new();

        for (section, path, kind) in sections {
            if section.name == "maxscale" {
                globals.extend(section.params);
                continue;
            }
            if let Some(existing) = objects.get(&section.name) {
                if kind == SourceKind::Runtime && existing.source_kind != SourceKind::Runtime {
                    warn!(
                        "Runtime definition of '{}' in {} overrides the static definition in {}",
                        section.name, path, existing.source_file
                    );
                } else {
                    return Err(ConfigError::DuplicateSection {
                        section: section.name,
                        first: existing.source_file.clone(),
                        second: path,
                    });
                }
            }

            let type_str = section.params.get("type").cloned().ok_or_else(|| {
                ConfigError::invalid(format!("{path}: section '{}' has no 'type'", section.name))
            })?;
            let object_type = ObjectType::parse(&type_str).ok_or_else(|| {
                ConfigError::invalid(format!(
                    "{path}: section '{}' has invalid type '{type_str}'",
                    section.name
                ))
            })?;
            match object_type {
                ObjectType::Service if !section.params.contains_key("router") => {
                    return Err(ConfigError::invalid(format!(
                        "{path}: service '{}' has no 'router'",
                        section.name
                    )));
                }
                ObjectType::Monitor | ObjectType::Filter
                    if !section.params.contains_key("module") =>
                {
                    return Err(ConfigError::invalid(format!(
                        "{path}: {} '{}' has no 'module'",
                        object_type.as_str(),
                        section.name
                    )));
                }
                _ => {}
            }
            if section.name.starts_with("@@") && kind != SourceKind::Runtime {
                return Err(ConfigError::invalid(format!(
                    "{path}: names starting with '@@' are reserved: '{}'",
                    section.name
                )));
            }

            objects.insert(
                section.name.clone(),
                PendingObject {
                    name: section.name,
                    object_type,
                    params: section.params,
                    source_file: path,
                    source_kind: kind,
                },
            );
        }

        let ordered = resolve_order(objects)?;
        Ok(LoadedConfig {
            globals,
            objects: ordered,
        })
    }

    fn read_file(&self, path: &Path) -> Result<IniFile> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        ini::parse_str(&text, &path.display().to_string())
    }
}

/// Regular files (and symlinks to regular files) named `*.cnf`, sorted.
/// Symlinks to directories are warned about and skipped.
fn scan_config_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
        Err(source) => {
            return Err(ConfigError::Io {
                path: dir.display().to_string(),
                source,
            })
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if path.extension().map(|e| e != "cnf").unwrap_or(true) {
            continue;
        }
        // std::fs::metadata follows symlinks, so a link to a regular file
        // passes and a link to a directory is rejected here.
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => paths.push(path),
            Ok(_) => warn!("Skipping directory {}", path.display()),
            Err(e) => warn!("Skipping unreadable {}: {e}", path.display()),
        }
    }
    paths.sort();
    Ok(paths)
}

/// Tarjan's strongly-connected-components over the "X needs Y" graph. Any
/// component of size > 1 is a circular dependency; single nodes come out in
/// an order where dependencies precede dependents. Servers are created
/// first regardless.
fn resolve_order(objects: BTreeMap<String, PendingObject>) -> Result<Vec<PendingObject>> {
    for object in objects.values() {
        for dep in object.dependencies() {
            if !objects.contains_key(&dep) {
                return Err(ConfigError::invalid(format!(
                    "'{}' depends on '{dep}', which is not defined",
                    object.name
                )));
            }
        }
    }

    let names: Vec<&String> = objects.keys().collect();
    let index_of: BTreeMap<&String, usize> =
        names.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let edges: Vec<Vec<usize>> = names
        .iter()
        .map(|name| {
            objects[*name]
                .dependencies()
                .iter()
                .map(|dep| index_of[dep])
                .collect()
        })
        .collect();

    let mut tarjan = Tarjan::new(names.len(), &edges);
    for v in 0..names.len() {
        if tarjan.index[v].is_none() {
            tarjan.strong_connect(v);
        }
    }

    let mut ordered_names: Vec<String> = Vec::with_capacity(names.len());
    for component in &tarjan.components {
        if component.len() > 1 {
            let members: Vec<&str> = component.iter().map(|&v| names[v].as_str()).collect();
            return Err(ConfigError::CircularDependency(members.join(" -> ")));
        }
        let v = component[0];
        if edges[v].contains(&v) {
            return Err(ConfigError::CircularDependency(names[v].clone()));
        }
        ordered_names.push(names[v].clone());
    }

    let mut objects = objects;
    let mut ordered = Vec::with_capacity(ordered_names.len());
    for name in ordered_names
        .iter()
        .filter(|n| objects[*n].object_type == ObjectType::Server)
        .cloned()
        .collect::<Vec<_>>()
    {
        ordered.push(objects.remove(&name).expect("server present"));
    }
    for name in ordered_names {
        if let Some(object) = objects.remove(&name) {
            ordered.push(object);
        }
    }
    Ok(ordered)
}

/// Textbook Tarjan with the component list in emission order: every
/// component is emitted after the components it depends on.
struct Tarjan<'a> {
    edges: &'a [Vec<usize>],
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next_index: usize,
    components: Vec<Vec<usize>>,
}

impl<'a> Tarjan<'a> {
    fn new(n: usize, edges: &'a [Vec<usize>]) -> Self {
        Self {
            edges,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next_index: 0,
            components: Vec::new(),
        }
    }

    fn strong_connect(&mut self, v: usize) {
        self.index[v] = Some(self.next_index);
        self.lowlink[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for i in 0..self.edges[v].len() {
            let w = self.edges[v][i];
            if self.index[w].is_none() {
                self.strong_connect(w);
                self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
            } else if self.on_stack[w] {
                self.lowlink[v] = self.lowlink[v].min(self.index[w].unwrap());
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            loop {
                let w = self.stack.pop().expect("stack not empty");
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
