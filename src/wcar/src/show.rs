use crate::storage::archive::{AccessMode, CaptureStorage};
use crate::storage::Storage;
use crate::Result;
use serde_json::json;
use std::path::Path;

/// Statistics of a capture file set, as shown by the replay tool.
pub fn capture_summary(base_path: &Path) -> Result<serde_json::Value> {
    let mut storage = CaptureStorage::open(base_path, AccessMode::ReadOnly)?;

    let mut events = 0u64;
    let mut sessions = hashbrown::HashSet::new();
    let mut first_start = i64::MAX;
    let mut last_end = i64::MIN;
    while let Some(event) = storage.next_event()? {
        events += 1;
        sessions.insert(event.session_id);
        first_start = first_start.min(event.start_time);
        last_end = last_end.max(event.end_time);
    }
    let duration_ms = if events > 0 {
        (last_end - first_start) / 1_000_000
    } else {
        0
    };

    let mut summary = json!({
        "capture": base_path.display().to_string(),
        "events": events,
        "sessions": sessions.len(),
        "canonicals": storage.canonical_count(),
        "duration_ms": duration_ms,
    });

    if let Ok(transactions) = storage.load_transactions() {
        summary["transactions"] = json!(transactions.len());
    }
    if let Ok(rep_events) = storage.read_rep_events() {
        let errors = rep_events.iter().filter(|e| e.error != 0).count();
        let rows: u64 = rep_events.iter().map(|e| e.num_rows).sum();
        let total_ns: i64 = rep_events
            .iter()
            .map(|e| (e.end_time - e.start_time).max(0))
            .sum();
        summary["replay"] = json!({
            "events": rep_events.len(),
            "errors": errors,
            "rows": rows,
            "total_exec_ms": total_ns / 1_000_000,
        });
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;
    use crate::event::QueryEvent;
    use std::sync::Arc;

    #[test]
    fn summary_counts_the_capture() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        {
            let mut storage = CaptureStorage::open(&base, AccessMode::WriteOnly).unwrap();
            for (i, (session, sql)) in [
                (1u64, "SELECT 1"),
                (1, "SELECT 2"),
                (2, "INSERT INTO t VALUES (3)"),
            ]
            .iter()
            .enumerate()
            {
                let (canonical, args) = canonicalize(sql);
                storage
                    .add_query_event(QueryEvent {
                        canonical: Arc::new(canonical),
                        args,
                        session_id: *session,
                        event_id: i as i64 + 1,
                        start_time: (i as i64 + 1) * 1_000_000,
                        end_time: (i as i64 + 1) * 1_000_000 + 500_000,
                        ..QueryEvent::default()
                    })
                    .unwrap();
            }
            storage.sync().unwrap();
        }

        let summary = capture_summary(&base).unwrap();
        assert_eq!(summary["events"], 3);
        assert_eq!(summary["sessions"], 2);
        assert_eq!(summary["canonicals"], 2);
        assert_eq!(summary["duration_ms"], 2);
    }
}
