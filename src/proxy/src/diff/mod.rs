pub mod commands;
pub mod exporter;
pub mod router;
pub mod session;

use config::{ModuleKind, Param, ParamKind, Specification};
use strum_macros::{AsRefStr, EnumString};

pub const DIFF_MODULE: &str = "diff";

/// When to emit a per-statement report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ReportAction {
    Always,
    OnConflict,
}

/// What to do when a non-main backend fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorAction {
    Ignore,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ExporterType {
    File,
    Log,
    Kafka,
}

/// Whether the comparison may see writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ComparisonKind {
    ReadOnly,
    ReadWrite,
}

/// The typed settings the router actually runs with, materialised from a
/// validated parameter bag.
#[derive(Debug, Clone)]
pub struct DiffSettings {
    pub exporter: ExporterType,
    pub main: String,
    pub file: String,
    pub on_error: ErrorAction,
    pub report: ReportAction,
    /// A non-main duration deviating from main's by more than this many
    /// percent counts as a conflict.
    pub max_slowdown_percent: u8,
    pub comparison_kind: ComparisonKind,
}

impl Default for DiffSettings {
    fn default() -> Self {
        Self {
            exporter: ExporterType::Log,
            main: String::new(),
            file: String::new(),
            on_error: ErrorAction::Ignore,
            report: ReportAction::Always,
            max_slowdown_percent: 10,
            comparison_kind: ComparisonKind::ReadOnly,
        }
    }
}

/// The router's parameter schema.
pub fn specification() -> Specification {
    let mut spec = Specification::new(DIFF_MODULE, ModuleKind::Router);
    spec.add_param(
        Param::new(
            "exporter",
            "Exporter to use",
            ParamKind::Enum {
                aliases: vec!["file", "kafka", "log"],
            },
        )
        .mandatory()
        .at_runtime(),
    );
    spec.add_param(
        Param::new("main", "Server from which responses are returned", ParamKind::Target)
            .mandatory()
            .at_runtime(),
    );
    spec.add_param(
        Param::new("file", "File where data is exported", ParamKind::String)
            .with_default(config::Value::String(String::new()))
            .at_runtime(),
    );
    spec.add_param(
        Param::new(
            "on_error",
            "What to do when a non-main connection fails",
            ParamKind::Enum {
                aliases: vec!["ignore", "close"],
            },
        )
        .with_default(config::Value::Enum("ignore".to_string()))
        .at_runtime(),
    );
    spec.add_param(
        Param::new(
            "report",
            "When to generate the report for an SQL command",
            ParamKind::Enum {
                aliases: vec!["always", "on_conflict"],
            },
        )
        .with_default(config::Value::Enum("always".to_string()))
        .at_runtime(),
    );
    spec.add_param(
        Param::new(
            "max_slowdown",
            "Duration deviation from main that counts as a conflict",
            ParamKind::Percent,
        )
        .with_default(config::Value::Percent(10))
        .at_runtime(),
    );
    spec.add_param(
        Param::new(
            "comparison_kind",
            "Whether the comparison may see writes",
            ParamKind::Enum {
                aliases: vec!["read_only", "read_write"],
            },
        )
        .with_default(config::Value::Enum("read_only".to_string())),
    );
    spec.add_post_validator(|values| {
        match values.string_value("exporter").as_str() {
            "file" if values.string_value("file").is_empty() => Err(config::ConfigError::invalid(
                "'file' must be defined when exporter=file is used",
            )),
            "kafka" => Err(config::ConfigError::invalid(
                "the kafka exporter is not built into this proxy; use 'file' or 'log'",
            )),
            _ => Ok(()),
        }
    });
    spec
}

impl DiffSettings {
    /// Materialise from a validated bag. Only called with values the
    /// specification accepted, hence the parse never fails.
    pub fn from_values(values: &config::ConfigValues) -> DiffSettings {
        let defaults = DiffSettings::default();
        DiffSettings {
            exporter: values
                .string_value("exporter")
                .parse()
                .unwrap_or(defaults.exporter),
            main: values.string_value("main"),
            file: values.string_value("file"),
            on_error: values
                .string_value("on_error")
                .parse()
                .unwrap_or(defaults.on_error),
            report: values
                .string_value("report")
                .parse()
                .unwrap_or(defaults.report),
            max_slowdown_percent: values.int_value("max_slowdown") as u8,
            comparison_kind: values
                .string_value("comparison_kind")
                .parse()
                .unwrap_or(defaults.comparison_kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn raw(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn main_is_mandatory() {
        let errors = specification()
            .validate(&raw(&[("exporter", "log")]))
            .unwrap_err();
        assert!(errors.iter().any(|e| e.to_string().contains("main")));
    }

    #[test]
    fn file_exporter_requires_file() {
        let errors = specification()
            .validate(&raw(&[("exporter", "file"), ("main", "server1")]))
            .unwrap_err();
        assert!(errors[0].to_string().contains("file"));
    }

    #[test]
    fn kafka_exporter_is_refused() {
        let errors = specification()
            .validate(&raw(&[("exporter", "kafka"), ("main", "server1")]))
            .unwrap_err();
        assert!(errors[0].to_string().contains("kafka"));
    }

    #[test]
    fn settings_materialise() {
        let values = specification()
            .validate(&raw(&[
                ("exporter", "log"),
                ("main", "server1"),
                ("report", "on_conflict"),
                ("max_slowdown", "25%"),
            ]))
            .unwrap();
        let settings = DiffSettings::from_values(&values);
        assert_eq!(settings.report, ReportAction::OnConflict);
        assert_eq!(settings.on_error, ErrorAction::Ignore);
        assert_eq!(settings.main, "server1");
        assert_eq!(settings.max_slowdown_percent, 25);
        // The main reference is recorded as a dependency.
        assert_eq!(values.dependencies(), vec!["server1"]);
    }
}
