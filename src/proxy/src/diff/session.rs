use crate::diff::{ErrorAction, ReportAction};
use crate::protocol::mysql::packet::Packet;
use crate::session::backend::{Backend, BackendReply, ResponseMode};
use crate::session::reply::Reply;
use crate::session::router::{ErrorHandling, ReplyAction, RouterSession};
use crate::{ErrorType, Result};

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info};

use super::router::DiffShared;
use std::sync::Arc;

/// One backend's result slot within a round.
struct RoundSlot {
    target: String,
    checksum: crc32fast::Hasher,
    start: Instant,
    duration_ms: u64,
    reply: Option<Reply>,
}

impl RoundSlot {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            checksum: crc32fast::Hasher::new(),
            start: Instant::now(),
            duration_ms: 0,
            reply: None,
        }
    }

    fn closed(&self) -> bool {
        self.reply.is_some()
    }

    fn close(&mut self, reply: Reply) {
        self.duration_ms = self.start.elapsed().as_millis() as u64;
        self.reply = Some(reply);
    }

    fn checksum_hex(&self) -> String {
        format!("{:08x}", self.checksum.clone().finalize())
    }
}

/// One client statement's full set of concurrent backend executions.
struct Round {
    query: String,
    command: String,
    slots: Vec<RoundSlot>,
}

impl Round {
    fn is_ready(&self) -> bool {
        self.slots.iter().all(RoundSlot::closed)
    }

    fn slot_mut(&mut self, target: &str) -> Option<&mut RoundSlot> {
        self.slots.iter_mut().find(|s| s.target == target)
    }

    fn drop_slot(&mut self, target: &str) {
        self.slots.retain(|s| s.target != target);
    }
}

/// Mirrors every client packet to the main backend and the others,
/// returning only the main's reply while comparing the rest against it.
/// Exactly one round is in flight at a time; statements arriving while
/// responses are outstanding queue up.
pub struct DiffRouterSession {
    session_id: u64,
    shared: Arc<DiffShared>,
    backends: Vec<Backend>,
    main: String,
    responses: usize,
    queue: VecDeque<Packet>,
    round: Option<Round>,
    /// The main's final chunk, held back until every backend reported.
    last_chunk: Option<Packet>,
    num_queries: u64,
}

impl DiffRouterSession {
    pub fn new(session_id: u64, shared: Arc<DiffShared>, backends: Vec<Backend>) -> Self {
        let main = shared.settings().main.clone();
        Self {
            session_id,
            shared,
            backends,
            main,
            responses: 0,
            queue: VecDeque::new(),
            round: None,
            last_chunk: None,
            num_queries: 0,
        }
    }

    fn backend_mut(&mut self, target: &str) -> Option<&mut Backend> {
        self.backends.iter_mut().find(|b| b.target() == target)
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<bool> {
        let command = packet
            .com_code()
            .map(|c| c.as_ref().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let expecting = packet
            .com_code()
            .map(|c| c.will_respond())
            .unwrap_or(true);
        let query = packet.sql_text().unwrap_or_default();

        let main = self.main.clone();
        let mut round = Round {
            query,
            command,
            slots: Vec::new(),
        };
        let mut main_ok = false;

        for backend in &mut self.backends {
            if !backend.in_use() {
                continue;
            }
            let is_main = backend.target() == main;
            let mode = if !expecting {
                ResponseMode::NoResponse
            } else if is_main {
                ResponseMode::ExpectResponse
            } else {
                ResponseMode::IgnoreResponse
            };
            if backend.write(&packet, mode).await {
                // Routing succeeds as long as the main connection accepts
                // the write.
                if is_main {
                    main_ok = true;
                }
                if expecting {
                    round.slots.push(RoundSlot::new(backend.target()));
                    self.responses += 1;
                }
            }
        }

        if expecting && main_ok {
            self.round = Some(round);
        }
        Ok(main_ok)
    }

    async fn route_queued_queries(&mut self) -> Result<()> {
        while self.responses == 0 {
            let Some(packet) = self.queue.pop_front() else {
                break;
            };
            debug!("routing a queued statement");
            if !self.dispatch(packet).await? {
                break;
            }
        }
        Ok(())
    }

    /// Every backend reported; emit the report, update the summary and
    /// release the main's final chunk.
    async fn finalize_round(&mut self) -> Result<ReplyAction> {
        if let Some(round) = self.round.take() {
            self.num_queries += 1;
            let report = self.build_report(&round);
            let conflict = self.is_conflict(&round);
            self.shared.note_round(&round.slots_summary(), conflict);
            let should_report = match self.shared.settings().report {
                ReportAction::Always => true,
                ReportAction::OnConflict => conflict,
            };
            if should_report {
                self.shared.ship(&report);
            }
        }
        self.route_queued_queries().await?;
        match self.last_chunk.take() {
            Some(packet) => Ok(ReplyAction::Forward(packet)),
            None => Ok(ReplyAction::Consumed),
        }
    }

    fn is_conflict(&self, round: &Round) -> bool {
        let Some(main_slot) = round.slots.iter().find(|s| s.target == self.main) else {
            return true;
        };
        let main_checksum = main_slot.checksum_hex();
        let max_slowdown = self.shared.settings().max_slowdown_percent as u64;
        for slot in &round.slots {
            if slot.target == self.main {
                continue;
            }
            if slot.checksum_hex() != main_checksum {
                return true;
            }
            let main_ms = main_slot.duration_ms;
            let deviation = slot.duration_ms.abs_diff(main_ms);
            if main_ms > 0 && deviation * 100 / main_ms > max_slowdown {
                return true;
            }
        }
        false
    }

    fn build_report(&self, round: &Round) -> serde_json::Value {
        let results: Vec<serde_json::Value> = round
            .slots
            .iter()
            .map(|slot| {
                let reply = slot.reply.clone().unwrap_or_default();
                json!({
                    "target": slot.target,
                    "checksum": slot.checksum_hex(),
                    "rows": reply.rows_read,
                    "warnings": reply.num_warnings,
                    "duration": slot.duration_ms,
                    "type": reply.kind.as_str(),
                })
            })
            .collect();
        json!({
            "time": chrono::Utc::now().to_rfc3339(),
            "query": round.query,
            "command": round.command,
            "session": self.session_id,
            "query_id": self.num_queries,
            "results": results,
        })
    }
}

impl Round {
    fn slots_summary(&self) -> Vec<(String, u64, bool, u64)> {
        self.slots
            .iter()
            .map(|s| {
                let reply = s.reply.clone().unwrap_or_default();
                (s.target.clone(), s.duration_ms, reply.error(), reply.rows_read)
            })
            .collect()
    }
}

#[async_trait]
impl RouterSession for DiffRouterSession {
    async fn route_query(&mut self, packet: Packet) -> Result<bool> {
        if self.responses > 0 {
            self.queue.push_back(packet);
            return Ok(true);
        }
        self.dispatch(packet).await
    }

    async fn client_reply(&mut self, from: &BackendReply) -> Result<ReplyAction> {
        let is_main = from.target == self.main;
        if let Some(round) = &mut self.round {
            if let Some(slot) = round.slot_mut(&from.target) {
                slot.checksum.update(&from.packet);
                if from.reply.is_complete() {
                    slot.close(from.reply.clone());
                }
            }
        }

        if from.reply.is_complete() {
            if let Some(backend) = self.backend_mut(&from.target) {
                backend.ack_write();
            }
            self.responses = self.responses.saturating_sub(1);
            debug!(
                "reply from '{}' complete{}",
                from.target,
                if is_main {
                    ", delaying the last chunk until all replies have arrived"
                } else {
                    ""
                }
            );
            if is_main {
                self.last_chunk = Some(from.packet.clone());
            }
            if self.responses == 0 {
                return self.finalize_round().await;
            }
            return Ok(ReplyAction::Consumed);
        }

        // Intermediate fragments of the main's reply stream straight to
        // the client; the others are consumed.
        if is_main {
            Ok(ReplyAction::Forward(from.packet.clone()))
        } else {
            Ok(ReplyAction::Consumed)
        }
    }

    async fn handle_error(
        &mut self,
        error_type: ErrorType,
        message: &str,
        target: &str,
        _reply: &Reply,
    ) -> ErrorHandling {
        info!("backend '{target}' failed ({error_type:?}): {message}");
        let was_waiting = self
            .backend_mut(target)
            .map(|b| b.is_waiting_result())
            .unwrap_or(false);
        if let Some(backend) = self.backend_mut(target) {
            backend.close();
        }
        if let Some(round) = &mut self.round {
            round.drop_slot(target);
        }

        let is_main = target == self.main;
        if was_waiting {
            self.responses = self.responses.saturating_sub(1);
        }

        let tolerate = !is_main
            && error_type != ErrorType::Fatal
            && self.shared.settings().on_error == ErrorAction::Ignore;
        if !tolerate {
            return ErrorHandling::Close;
        }
        if self.responses == 0 && self.round.as_ref().map(Round::is_ready).unwrap_or(false) {
            if let Ok(ReplyAction::Forward(packet)) = self.finalize_round().await {
                return ErrorHandling::TolerateForward(packet);
            }
        }
        ErrorHandling::Tolerate
    }

    fn expecting_replies(&self) -> bool {
        self.responses > 0
    }

    fn close(&mut self) {
        for backend in &mut self.backends {
            backend.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::router::DiffShared;
    use crate::diff::DiffSettings;
    use crate::protocol::mysql::constants::CommandCode;
    use crate::session::reply::{ReplyKind, ReplyTracker};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct CaptureExporter(Mutex<Vec<serde_json::Value>>);

    impl crate::diff::exporter::Exporter for CaptureExporter {
        fn ship(&self, report: &serde_json::Value) {
            self.0.lock().unwrap().push(report.clone());
        }
    }

    fn shared_with(report: ReportAction) -> (Arc<DiffShared>, Arc<CaptureExporter>) {
        let exporter = Arc::new(CaptureExporter(Mutex::new(Vec::new())));
        let settings = DiffSettings {
            main: "main".to_string(),
            report,
            ..DiffSettings::default()
        };
        let shared = DiffShared::for_tests(settings, exporter.clone());
        (shared, exporter)
    }

    fn test_backend(target: &str) -> Backend {
        let (client_side, _server_side) = tokio::io::duplex(1 << 16);
        let (read_half, write_half) = tokio::io::split(client_side);
        let (tx, _rx) = mpsc::unbounded_channel();
        // The server side is dropped; writes park in the duplex buffer.
        std::mem::forget(_server_side);
        Backend::from_parts(target, Box::new(read_half), Box::new(write_half), tx)
    }

    fn query_packet(sql: &str) -> Packet {
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend(sql.as_bytes());
        Packet::from_vec(payload)
    }

    /// Feed a canned result set through a ReplyTracker, invoking the
    /// session for every fragment exactly like the session loop would.
    async fn feed_resultset(
        session: &mut DiffRouterSession,
        target: &str,
        rows: &[&str],
    ) -> Vec<ReplyAction> {
        let mut tracker = ReplyTracker::new();
        let mut actions = Vec::new();
        let mut packets = vec![Packet::from_vec(vec![0x01]), Packet::from_vec(vec![3, b'c', b'o', b'l'])];
        packets.push(Packet::from_vec(vec![0xfe, 0, 0, 0, 0]));
        for row in rows {
            let mut p = vec![row.len() as u8];
            p.extend(row.as_bytes());
            packets.push(Packet::from_vec(p));
        }
        packets.push(Packet::from_vec(vec![0xfe, 0, 0, 0, 0]));
        for packet in packets {
            let reply = tracker.track(&packet);
            let br = BackendReply {
                target: target.to_string(),
                packet,
                reply,
                is_hangup: false,
            };
            actions.push(session.client_reply(&br).await.unwrap());
        }
        actions
    }

    async fn run_statements(
        report: ReportAction,
        rows_main: Vec<Vec<&str>>,
        rows_other: Vec<Vec<&str>>,
    ) -> Vec<serde_json::Value> {
        let (shared, exporter) = shared_with(report);
        let local = tokio::task::LocalSet::new();
        let reports = local
            .run_until(async move {
                let backends = vec![test_backend("main"), test_backend("other")];
                let mut session = DiffRouterSession::new(1, shared, backends);
                for (k, (main_rows, other_rows)) in
                    rows_main.iter().zip(rows_other.iter()).enumerate()
                {
                    assert!(session
                        .route_query(query_packet(&format!("SELECT {k}")))
                        .await
                        .unwrap());
                    feed_resultset(&mut session, "other", other_rows).await;
                    let actions = feed_resultset(&mut session, "main", main_rows).await;
                    // The final action forwards the main's held-back chunk.
                    assert!(matches!(actions.last(), Some(ReplyAction::Forward(_))));
                }
                exporter.0.lock().unwrap().clone()
            })
            .await;
        reports
    }

    #[tokio::test]
    async fn always_reports_k_statements_in_order() {
        let rows: Vec<Vec<&str>> = vec![vec!["a"], vec!["b"], vec!["c"]];
        let reports = run_statements(ReportAction::Always, rows.clone(), rows).await;
        assert_eq!(reports.len(), 3);
        for (k, report) in reports.iter().enumerate() {
            assert_eq!(report["query"], format!("SELECT {k}"));
            assert_eq!(report["query_id"], (k + 1) as u64);
        }
    }

    #[tokio::test]
    async fn identical_backends_emit_no_conflict_reports() {
        let rows: Vec<Vec<&str>> = vec![vec!["a"], vec!["b"]];
        let reports = run_statements(ReportAction::OnConflict, rows.clone(), rows).await;
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn divergent_rowcount_is_reported() {
        let reports = run_statements(
            ReportAction::OnConflict,
            vec![vec!["a", "b", "c"]],
            vec![vec!["a", "b", "c", "d"]],
        )
        .await;
        assert_eq!(reports.len(), 1);
        let results = reports[0]["results"].as_array().unwrap();
        let main = results.iter().find(|r| r["target"] == "main").unwrap();
        let other = results.iter().find(|r| r["target"] == "other").unwrap();
        assert_eq!(main["rows"], 3);
        assert_eq!(other["rows"], 4);
        assert_ne!(main["checksum"], other["checksum"]);
        assert_eq!(main["type"], "resultset");
    }

    #[tokio::test]
    async fn statements_queue_while_responses_outstanding() {
        let (shared, exporter) = shared_with(ReportAction::Always);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let backends = vec![test_backend("main"), test_backend("other")];
                let mut session = DiffRouterSession::new(1, shared, backends);
                assert!(session.route_query(query_packet("SELECT 1")).await.unwrap());
                // Second statement queues instead of dispatching.
                assert!(session.route_query(query_packet("SELECT 2")).await.unwrap());
                assert_eq!(session.queue.len(), 1);
                assert!(session.expecting_replies());

                feed_resultset(&mut session, "other", &["x"]).await;
                feed_resultset(&mut session, "main", &["x"]).await;
                // Finalizing the first round dispatched the queued one.
                assert!(session.queue.is_empty());
                assert!(session.expecting_replies());

                feed_resultset(&mut session, "other", &["x"]).await;
                feed_resultset(&mut session, "main", &["x"]).await;
                assert_eq!(exporter.0.lock().unwrap().len(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn other_failure_is_tolerated_main_failure_is_not() {
        let (shared, _exporter) = shared_with(ReportAction::Always);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let backends = vec![test_backend("main"), test_backend("other")];
                let mut session = DiffRouterSession::new(1, shared, backends);
                assert!(session.route_query(query_packet("SELECT 1")).await.unwrap());

                let handling = session
                    .handle_error(
                        ErrorType::Transient,
                        "connection lost",
                        "other",
                        &Reply::hangup(),
                    )
                    .await;
                assert!(!matches!(handling, ErrorHandling::Close));

                let handling = session
                    .handle_error(
                        ErrorType::Transient,
                        "connection lost",
                        "main",
                        &Reply::hangup(),
                    )
                    .await;
                assert!(matches!(handling, ErrorHandling::Close));
            })
            .await;
    }

    #[test]
    fn reply_kind_names_match_report_vocabulary() {
        assert_eq!(ReplyKind::Ok.as_str(), "ok");
        assert_eq!(ReplyKind::ResultSet.as_str(), "resultset");
        assert_eq!(ReplyKind::Error.as_str(), "error");
    }
}
