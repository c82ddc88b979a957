use crate::filter::{CaptureFilter, CaptureStartMethod};
use crate::recorder::{CaptureLimits, Recorder};
use crate::storage::archive::{AccessMode, CaptureStorage};
use config::{ModuleKind, Param, ParamKind, PathOptions, Specification, Value};
use dashmap::DashMap;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const CAPTURE_MODULE: &str = "capture";

/// The capture filter's parameter schema.
pub fn specification() -> Specification {
    let mut spec = Specification::new(CAPTURE_MODULE, ModuleKind::Filter);
    spec.add_param(
        Param::new(
            "capture_dir",
            "Directory where capture files are stored",
            ParamKind::Path {
                options: PathOptions::C | PathOptions::R | PathOptions::W | PathOptions::X,
            },
        )
        .with_default(Value::Path(PathBuf::from("/var/lib/gantry/wcar"))),
    );
    spec.add_param(
        Param::new(
            "start_capture",
            "Start capture when the proxy starts",
            ParamKind::Bool,
        )
        .with_default(Value::Bool(false)),
    );
    spec.add_param(
        Param::new(
            "capture_start_method",
            "How capture deals with active transactions",
            ParamKind::Enum {
                aliases: vec!["abort_transactions", "ignore_transactions"],
            },
        )
        .with_default(Value::Enum("abort_transactions".to_string())),
    );
    spec.add_param(
        Param::new(
            "capture_duration",
            "Limit capture to this duration",
            ParamKind::Duration,
        )
        .with_default(Value::Duration(config::DurationValue::new(
            0,
            config::DurationUnit::Seconds,
        ))),
    );
    spec.add_param(
        Param::new(
            "capture_size",
            "Limit capture to approximately this many bytes in the file system",
            ParamKind::Size,
        )
        .with_default(Value::Size(0)),
    );
    spec
}

/// One filter's capture settings, materialised from a validated bag.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub capture_dir: PathBuf,
    pub start_capture: bool,
    pub capture_start_method: CaptureStartMethod,
    pub capture_duration: Duration,
    pub capture_size: u64,
}

impl CaptureSettings {
    pub fn from_values(values: &config::ConfigValues) -> CaptureSettings {
        let capture_dir = match values.get("capture_dir") {
            Some(Value::Path(path)) => path.clone(),
            _ => PathBuf::from("/var/lib/gantry/wcar"),
        };
        let capture_start_method = values
            .get("capture_start_method")
            .and_then(|v| v.as_str())
            .and_then(CaptureStartMethod::parse)
            .unwrap_or_default();
        CaptureSettings {
            capture_dir,
            start_capture: values.bool_value("start_capture"),
            capture_start_method,
            capture_duration: values.duration_value("capture_duration"),
            capture_size: values.int_value("capture_size") as u64,
        }
    }
}

#[derive(Debug)]
pub struct CaptureCommandError(pub String);

pub type CaptureResult = std::result::Result<serde_json::Value, CaptureCommandError>;

/// The capture module-command vocabulary: `start <filter> [prefix] [size]
/// [duration]` and `stop <filter>`.
pub struct CaptureCommands {
    filters: DashMap<String, (Arc<CaptureFilter>, CaptureSettings)>,
}

impl Default for CaptureCommands {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureCommands {
    pub fn new() -> Self {
        Self {
            filters: DashMap::new(),
        }
    }

    pub fn register(&self, filter: Arc<CaptureFilter>, settings: CaptureSettings) {
        self.filters
            .insert(filter.name().to_string(), (filter, settings));
    }

    fn lookup(
        &self,
        name: &str,
    ) -> std::result::Result<(Arc<CaptureFilter>, CaptureSettings), CaptureCommandError> {
        self.filters
            .get(name)
            .map(|entry| (Arc::clone(&entry.0), entry.1.clone()))
            .ok_or_else(|| CaptureCommandError(format!("no such capture filter: '{name}'")))
    }

    /// Begin recording. `prefix`, `size` and `duration` override the
    /// configured base name and limits.
    pub fn start(
        &self,
        filter_name: &str,
        prefix: Option<&str>,
        size: Option<u64>,
        duration: Option<Duration>,
    ) -> CaptureResult {
        let (filter, settings) = self.lookup(filter_name)?;
        if filter.core().recorder().is_some() {
            return Err(CaptureCommandError(format!(
                "capture filter '{filter_name}' is already capturing"
            )));
        }

        let base_name = format!(
            "{}_{}",
            prefix.unwrap_or("capture"),
            chrono::Local::now().format("%Y-%m-%d_%H%M%S")
        );
        std::fs::create_dir_all(&settings.capture_dir)
            .map_err(|e| CaptureCommandError(format!("cannot create capture dir: {e}")))?;
        let base_path = settings.capture_dir.join(&base_name);
        let storage = CaptureStorage::open(&base_path, AccessMode::WriteOnly)
            .map_err(|e| CaptureCommandError(e.to_string()))?;

        let limits = CaptureLimits {
            max_duration: duration.unwrap_or(settings.capture_duration),
            max_bytes: size.unwrap_or(settings.capture_size),
        };
        let shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let recorder = Recorder::start(Box::new(storage), shards, limits);
        filter.core().set_start_method(settings.capture_start_method);
        filter.core().set_recorder(Some(recorder));
        info!("capture '{filter_name}' started into {}", base_path.display());
        Ok(json!({ "status": "started", "capture": base_path.display().to_string() }))
    }

    pub fn stop(&self, filter_name: &str) -> CaptureResult {
        let (filter, _) = self.lookup(filter_name)?;
        let Some(recorder) = filter.core().recorder() else {
            return Err(CaptureCommandError(format!(
                "capture filter '{filter_name}' is not capturing"
            )));
        };
        filter.core().set_recorder(None);
        let stats = recorder.stop();
        info!(
            "capture '{filter_name}' stopped: {} events, {} dropped",
            stats.events, stats.dropped
        );
        Ok(json!({
            "status": "stopped",
            "events": stats.events,
            "dropped": stats.dropped,
            "bytes": stats.bytes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_stop_produce_a_capture_set() {
        let dir = tempfile::tempdir().unwrap();
        let commands = CaptureCommands::new();
        let filter = CaptureFilter::new("cap");
        let settings = CaptureSettings {
            capture_dir: dir.path().to_path_buf(),
            start_capture: false,
            capture_start_method: CaptureStartMethod::default(),
            capture_duration: Duration::ZERO,
            capture_size: 0,
        };
        commands.register(Arc::clone(&filter), settings);

        let out = commands.start("cap", Some("test"), None, None).unwrap();
        assert_eq!(out["status"], "started");
        assert!(filter.core().recorder().is_some());
        // Double start is refused.
        assert!(commands.start("cap", None, None, None).is_err());

        let out = commands.stop("cap").unwrap();
        assert_eq!(out["status"], "stopped");
        assert!(filter.core().recorder().is_none());
        assert!(commands.stop("cap").is_err());

        let cx_files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "cx").unwrap_or(false))
            .collect();
        assert_eq!(cx_files.len(), 1);
        assert!(cx_files[0]
            .file_name()
            .to_string_lossy()
            .starts_with("test_"));
    }

    #[test]
    fn settings_materialise_from_the_specification() {
        let dir = tempfile::tempdir().unwrap();
        let raw: std::collections::BTreeMap<String, String> = [
            ("capture_dir", dir.path().to_str().unwrap()),
            ("capture_duration", "5min"),
            ("capture_size", "1Gi"),
            ("start_capture", "yes"),
            ("capture_start_method", "ignore_transactions"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let values = specification().validate(&raw).unwrap();
        let settings = CaptureSettings::from_values(&values);
        assert!(settings.start_capture);
        assert_eq!(settings.capture_duration, Duration::from_secs(300));
        assert_eq!(settings.capture_size, 1 << 30);
        assert_eq!(settings.capture_dir, dir.path());
        assert_eq!(
            settings.capture_start_method,
            CaptureStartMethod::IgnoreTransactions
        );
    }

    #[test]
    fn start_method_defaults_to_abort() {
        let dir = tempfile::tempdir().unwrap();
        let raw: std::collections::BTreeMap<String, String> =
            [("capture_dir", dir.path().to_str().unwrap())]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        let values = specification().validate(&raw).unwrap();
        let settings = CaptureSettings::from_values(&values);
        assert_eq!(
            settings.capture_start_method,
            CaptureStartMethod::AbortTransactions
        );
        // An unknown alias never reaches from_values.
        assert!(specification()
            .validate(
                &[
                    ("capture_dir", dir.path().to_str().unwrap()),
                    ("capture_start_method", "sideways"),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
            )
            .is_err());
    }
}
