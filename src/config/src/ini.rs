use crate::{ConfigError, Result};
use std::collections::BTreeMap;
use tracing::warn;

/// One `[section]` of an ini file: its key/value pairs plus the line the
/// header appeared on, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub header_line: usize,
}

/// A parsed configuration file: section order is preserved.
#[derive(Debug, Clone, Default)]
pub struct IniFile {
    pub path: String,
    pub sections: Vec<Section>,
}

impl IniFile {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Characters permitted in an object name. Names that are not URL-safe are
/// accepted with a warning so that old configurations keep loading.
pub fn is_url_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '@'))
}

/// Parse ini text. `[maxscale]` is normalised case-insensitively; a second
/// `[maxscale]` header in the same file is an error.
pub fn parse_str(text: &str, path: &str) -> Result<IniFile> {
    let mut file = IniFile {
        path: path.to_string(),
        sections: Vec::new(),
    };
    let mut current: Option<Section> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let name = header.strip_suffix(']').ok_or_else(|| {
                ConfigError::invalid(format!("{path}:{line_no}: unterminated section header"))
            })?;
            let name = name.trim();
            let name = if name.eq_ignore_ascii_case("maxscale") {
                "maxscale".to_string()
            } else {
                name.to_string()
            };
            if !is_url_safe(&name) {
                warn!("{path}:{line_no}: section name '{name}' is not URL-safe");
            }
            if name == "maxscale" && file.section("maxscale").is_some() {
                return Err(ConfigError::invalid(format!(
                    "{path}:{line_no}: duplicate [maxscale] section"
                )));
            }
            if let Some(section) = current.take() {
                file.sections.push(section);
            }
            current = Some(Section {
                name,
                params: BTreeMap::new(),
                header_line: line_no,
            });
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| {
            ConfigError::invalid(format!("{path}:{line_no}: expected 'key=value', got '{line}'"))
        })?;
        let section = current.as_mut().ok_or_else(|| {
            ConfigError::invalid(format!("{path}:{line_no}: parameter outside of any section"))
        })?;
        section
            .params
            .insert(key.trim().to_string(), value.trim().to_string());
    }

    if let Some(section) = current.take() {
        file.sections.push(section);
    }
    Ok(file)
}

fn strip_comment(line: &str) -> &str {
    match line.find(['#', ';']) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Expand `${VAR}` references from the process environment. Unset
/// variables are an error naming the variable.
pub fn substitute_variables(file: &mut IniFile) -> Result<()> {
    for section in &mut file.sections {
        for value in section.params.values_mut() {
            *value = expand(value, &file.path)?;
        }
    }
    Ok(())
}

fn expand(value: &str, path: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            ConfigError::invalid(format!("{path}: unterminated variable reference in '{value}'"))
        })?;
        let var = &after[..end];
        let expanded = std::env::var(var).map_err(|_| {
            ConfigError::invalid(format!("{path}: environment variable '{var}' is not set"))
        })?;
        out.push_str(&expanded);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Merge `@include`-referenced sections into the sections naming them.
/// An include section's keys never override keys the target already has.
/// Cycles among include sections are rejected.
pub fn resolve_includes(sections: &mut Vec<Section>) -> Result<()> {
    let includes: BTreeMap<String, BTreeMap<String, String>> = sections
        .iter()
        .filter(|s| s.params.get("type").map(String::as_str) == Some("include"))
        .map(|s| (s.name.clone(), s.params.clone()))
        .collect();

    // An include may itself reference other includes; detect cycles first.
    for name in includes.keys() {
        let mut seen = vec![name.clone()];
        let mut frontier = include_refs(&includes[name]);
        while let Some(next) = frontier.pop() {
            if seen.contains(&next) {
                return Err(ConfigError::CircularDependency(format!(
                    "include sections: {}",
                    seen.join(" -> ")
                )));
            }
            if let Some(params) = includes.get(&next) {
                seen.push(next);
                frontier.extend(include_refs(params));
            }
        }
    }

    for section in sections.iter_mut() {
        if section.params.get("type").map(String::as_str) == Some("include") {
            continue;
        }
        let Some(refs) = section.params.get("@include").cloned() else {
            continue;
        };
        section.params.remove("@include");
        for referenced in refs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let include = includes.get(referenced).ok_or_else(|| {
                ConfigError::invalid(format!(
                    "section '{}' includes unknown section '{referenced}'",
                    section.name
                ))
            })?;
            for (key, value) in include {
                if key == "type" || key == "@include" {
                    continue;
                }
                section
                    .params
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
    }

    sections.retain(|s| s.params.get("type").map(String::as_str) != Some("include"));
    Ok(())
}

fn include_refs(params: &BTreeMap<String, String>) -> Vec<String> {
    params
        .get("@include")
        .map(|refs| {
            refs.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
