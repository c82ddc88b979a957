use crate::diff::{DiffSettings, ExporterType};
use crate::{ProxyError, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;
use tracing::info;

/// Destination for divergence reports. Shared behind a read/write lock by
/// the router: the hot path ships under a shared lock, a reconfiguration
/// swaps the exporter under a unique lock.
pub trait Exporter: Send + Sync {
    fn ship(&self, report: &serde_json::Value);
}

/// Reports go to the proxy log at info level.
pub struct LogExporter;

impl Exporter for LogExporter {
    fn ship(&self, report: &serde_json::Value) {
        info!(target: "diff_report", "{report}");
    }
}

/// Reports are appended to a file, one JSON document per line.
pub struct FileExporter {
    file: Mutex<std::fs::File>,
}

impl FileExporter {
    pub fn new(path: &str) -> Result<FileExporter> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| ProxyError::Config(format!("cannot open report file '{path}': {e}")))?;
        Ok(FileExporter {
            file: Mutex::new(file),
        })
    }
}

impl Exporter for FileExporter {
    fn ship(&self, report: &serde_json::Value) {
        let mut file = self.file.lock().unwrap();
        let _ = writeln!(file, "{report}");
    }
}

pub fn build_exporter(settings: &DiffSettings) -> Result<std::sync::Arc<dyn Exporter>> {
    match settings.exporter {
        ExporterType::Log => Ok(std::sync::Arc::new(LogExporter)),
        ExporterType::File => Ok(std::sync::Arc::new(FileExporter::new(&settings.file)?)),
        // Refused already at validation; kept here so a hand-built
        // settings value fails loudly too.
        ExporterType::Kafka => Err(ProxyError::Config(
            "the kafka exporter is not built into this proxy".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_exporter_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports.jsonl");
        let exporter = FileExporter::new(path.to_str().unwrap()).unwrap();
        exporter.ship(&serde_json::json!({"query": "SELECT 1"}));
        exporter.ship(&serde_json::json!({"query": "SELECT 2"}));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["query"], "SELECT 1");
    }
}
