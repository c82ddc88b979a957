use crate::canonical::canonicalize;
use crate::classify::classify;
use crate::event::{CanonicalArg, EventFlags, QueryEvent};
use crate::recorder::Recorder;
use common::gtid::Gtid;
use common::now_ns;
use proxy::protocol::mysql::constants::CommandCode;
use proxy::protocol::mysql::packet::Packet;
use proxy::session::filter::{Filter, FilterSession};
use proxy::session::reply::Reply;
use proxy::session::SessionInfo;
use proxy::ProxyError;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// How a starting capture deals with sessions that have a transaction
/// open: abort them so the capture begins at a clean boundary, or let the
/// transaction complete uncaptured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureStartMethod {
    #[default]
    AbortTransactions,
    IgnoreTransactions,
}

impl CaptureStartMethod {
    pub fn parse(alias: &str) -> Option<CaptureStartMethod> {
        match alias {
            "abort_transactions" => Some(CaptureStartMethod::AbortTransactions),
            "ignore_transactions" => Some(CaptureStartMethod::IgnoreTransactions),
            _ => None,
        }
    }
}

/// State shared by the filter object, its sessions and the command layer.
pub struct CaptureCore {
    recorder: RwLock<Option<Arc<Recorder>>>,
    start_method: RwLock<CaptureStartMethod>,
    /// Bumped on every capture start/stop so sessions notice the change
    /// on their next statement.
    generation: AtomicU64,
    next_event_id: AtomicI64,
}

impl CaptureCore {
    pub fn new() -> Arc<CaptureCore> {
        Arc::new(CaptureCore {
            recorder: RwLock::new(None),
            start_method: RwLock::new(CaptureStartMethod::default()),
            generation: AtomicU64::new(0),
            next_event_id: AtomicI64::new(1),
        })
    }

    pub fn next_event_id(&self) -> i64 {
        self.next_event_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn recorder(&self) -> Option<Arc<Recorder>> {
        self.recorder.read().unwrap().clone()
    }

    pub fn start_method(&self) -> CaptureStartMethod {
        *self.start_method.read().unwrap()
    }

    pub fn set_start_method(&self, method: CaptureStartMethod) {
        *self.start_method.write().unwrap() = method;
    }

    pub fn set_recorder(&self, recorder: Option<Arc<Recorder>>) {
        *self.recorder.write().unwrap() = recorder;
        self.generation.fetch_add(1, Ordering::Release);
    }
}

/// The workload-capture filter: serialises canonicalised query events to
/// the active recorder. One instance per filter object in the
/// configuration.
pub struct CaptureFilter {
    name: String,
    core: Arc<CaptureCore>,
}

impl CaptureFilter {
    pub fn new(name: &str) -> Arc<CaptureFilter> {
        Arc::new(CaptureFilter {
            name: name.to_string(),
            core: CaptureCore::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core(&self) -> &Arc<CaptureCore> {
        &self.core
    }
}

impl Filter for CaptureFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_session(&self, info: &SessionInfo) -> Box<dyn FilterSession> {
        Box::new(CaptureFilterSession {
            core: Arc::clone(&self.core),
            session_id: info.id,
            state: CapState::Disabled,
            seen_generation: self.core.generation(),
            recorder: self.core.recorder(),
            pending: None,
            pending_prepare: None,
            prepared: hashbrown::HashMap::new(),
            in_trx: false,
            enable_after_trx: false,
            abort_pending: false,
        })
    }

    fn diagnostics(&self) -> serde_json::Value {
        match self.core.recorder() {
            Some(recorder) => {
                let stats = recorder.stats();
                serde_json::json!({
                    "capturing": true,
                    "events": stats.events,
                    "dropped": stats.dropped,
                    "bytes": stats.bytes,
                })
            }
            None => serde_json::json!({ "capturing": false }),
        }
    }
}

/// Session capture state: capture is enabled lazily so the first recorded
/// statement can be preceded by the synthetic session-environment events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapState {
    Disabled,
    PendingEnable,
    Enabled,
}

enum CapSignal {
    Start,
    Stop,
    Qevent,
    CloseSession,
}

pub struct CaptureFilterSession {
    core: Arc<CaptureCore>,
    session_id: u64,
    state: CapState,
    seen_generation: u64,
    recorder: Option<Arc<Recorder>>,
    /// The statement currently in flight, stamped when its reply
    /// completes.
    pending: Option<QueryEvent>,
    /// Canonical of a COM_STMT_PREPARE awaiting the server's statement id.
    pending_prepare: Option<(String, Vec<CanonicalArg>)>,
    prepared: hashbrown::HashMap<u32, Arc<String>>,
    /// Whether the session has an explicit transaction open; tracked even
    /// while capture is disabled so a starting capture knows what it joins.
    in_trx: bool,
    /// capture_start_method=ignore_transactions: the open transaction runs
    /// to completion uncaptured, then capture enables.
    enable_after_trx: bool,
    /// capture_start_method=abort_transactions: the session is torn down
    /// at its next statement while the transaction is still open.
    abort_pending: bool,
}

impl CaptureFilterSession {
    fn refresh_capture_state(&mut self) {
        let generation = self.core.generation();
        if generation == self.seen_generation {
            return;
        }
        self.seen_generation = generation;
        match self.core.recorder() {
            Some(recorder) => {
                self.recorder = Some(recorder);
                if self.in_trx {
                    match self.core.start_method() {
                        CaptureStartMethod::AbortTransactions => self.abort_pending = true,
                        CaptureStartMethod::IgnoreTransactions => self.enable_after_trx = true,
                    }
                } else {
                    self.handle_signal(CapSignal::Start, None);
                }
            }
            None => {
                self.enable_after_trx = false;
                self.abort_pending = false;
                self.handle_signal(CapSignal::Stop, None);
                self.recorder = None;
            }
        }
    }

    /// Follow explicit transaction bracketing regardless of capture state.
    /// Single-statement autocommit writes never leave a transaction open,
    /// so they do not matter here.
    fn track_transaction_state(&mut self, packet: &Packet) {
        if packet.com_code() != Some(CommandCode::ComQuery) {
            return;
        }
        let Some(sql) = packet.sql_text() else {
            return;
        };
        let flags = classify(&sql);
        if flags.intersects(EventFlags::BEGIN_TRX | EventFlags::DISABLE_AUTOCOMMIT) {
            self.in_trx = true;
        }
        if flags.intersects(
            EventFlags::COMMIT | EventFlags::ROLLBACK | EventFlags::ENABLE_AUTOCOMMIT,
        ) {
            self.in_trx = false;
        }
    }

    fn handle_signal(&mut self, signal: CapSignal, info: Option<&SessionInfo>) {
        match self.state {
            CapState::Disabled => match signal {
                CapSignal::Start => self.state = CapState::PendingEnable,
                _ => {}
            },
            CapState::PendingEnable => match signal {
                CapSignal::Qevent => {
                    if let Some(event) = self.pending.take() {
                        if let Some(info) = info {
                            for opening in self.make_opening_events(event.start_time, info) {
                                self.send_event(opening);
                            }
                        }
                        self.send_event(event);
                        self.state = CapState::Enabled;
                    }
                }
                CapSignal::CloseSession | CapSignal::Stop => self.state = CapState::Disabled,
                CapSignal::Start => {}
            },
            CapState::Enabled => match signal {
                CapSignal::Qevent => {
                    if let Some(event) = self.pending.take() {
                        self.send_event(event);
                    }
                }
                CapSignal::CloseSession | CapSignal::Stop => {
                    let closing = self.make_closing_event();
                    self.send_event(closing);
                    self.state = CapState::Disabled;
                }
                CapSignal::Start => {}
            },
        }
    }

    fn send_event(&self, mut event: QueryEvent) {
        if let Some(recorder) = &self.recorder {
            event.event_id = self.core.next_event_id();
            recorder.send(event);
        }
    }

    /// Synthetic events reproducing the session environment the capture
    /// joined mid-flight: the current schema and the connection charset.
    /// Stamped just before the triggering event so sorting keeps them
    /// first.
    fn make_opening_events(&self, start_time: i64, info: &SessionInfo) -> Vec<QueryEvent> {
        let mut events = Vec::new();
        let mut template = QueryEvent {
            session_id: info.id,
            flags: EventFlags::ARTIFICIAL,
            start_time: start_time - 1,
            end_time: start_time,
            ..QueryEvent::default()
        };
        if !info.current_db.is_empty() {
            template.canonical = Arc::new(format!("use {}", info.current_db));
            events.push(template.clone());
        }
        template.canonical = Arc::new(format!(
            "set names '{}' collate '{}'",
            info.charset, info.collation
        ));
        events.push(template);
        events
    }

    fn make_closing_event(&self) -> QueryEvent {
        let stamp = now_ns() + 1;
        QueryEvent {
            // Non-empty canonical so downstream checks stay trivial.
            canonical: Arc::new("Close session".to_string()),
            flags: EventFlags::SESSION_CLOSE,
            session_id: self.session_id,
            start_time: stamp,
            end_time: stamp,
            ..QueryEvent::default()
        }
    }

    /// Decide recordability and build the pending event for a client
    /// packet. Multi-packet continuations and non-replayable commands are
    /// not recorded.
    fn observe_query(&mut self, packet: &Packet, info: &SessionInfo) {
        self.pending = None;
        let Some(com) = packet.com_code() else {
            return;
        };
        if com.ignored_by_capture() {
            debug!("capture ignores {}", com.as_ref());
            return;
        }

        let (canonical, args, flags) = match com {
            CommandCode::ComQuery => {
                let Some(sql) = packet.sql_text() else {
                    return;
                };
                // Classification must see the raw text: canonicalization
                // would replace the autocommit value with a placeholder.
                let flags = classify(&sql);
                let (canonical, args) = canonicalize(&sql);
                (canonical, args, flags)
            }
            CommandCode::ComInitDB => match packet.com_argument() {
                Some(db) => (format!("use {db}"), Vec::new(), EventFlags::empty()),
                None => return,
            },
            CommandCode::ComCreateDB => match packet.com_argument() {
                Some(db) => (format!("create database {db}"), Vec::new(), EventFlags::WRITE),
                None => return,
            },
            CommandCode::ComDropDB => match packet.com_argument() {
                Some(db) => (format!("drop database {db}"), Vec::new(), EventFlags::WRITE),
                None => return,
            },
            CommandCode::ComStmtPrepare => {
                if let Some(sql) = packet.sql_text() {
                    self.pending_prepare = Some(canonicalize(&sql));
                }
                return;
            }
            CommandCode::ComStmtExecute => {
                let Some(stmt_id) = stmt_id_of(packet) else {
                    return;
                };
                let Some(canonical) = self.prepared.get(&stmt_id) else {
                    debug!("execute of unknown prepared statement {stmt_id}");
                    return;
                };
                // Binary parameter values cannot be rebound as text, so
                // the execution is kept in the timeline as a tagged
                // command.
                let flags = classify(canonical) | EventFlags::TAGGED_COMMAND;
                self.pending = Some(QueryEvent {
                    canonical: Arc::clone(canonical),
                    session_id: info.id,
                    flags,
                    command: com as u8,
                    start_time: now_ns(),
                    ..QueryEvent::default()
                });
                return;
            }
            // Captured with a command tag; replay refuses these, but their
            // place in the timeline is preserved.
            CommandCode::ComQuit
            | CommandCode::ComResetConnection
            | CommandCode::ComSetOption
            | CommandCode::ComStatistics => (
                com.as_ref().to_string(),
                Vec::new(),
                EventFlags::TAGGED_COMMAND,
            ),
            _ => {
                debug!("capture ignores {}", com.as_ref());
                return;
            }
        };

        self.pending = Some(QueryEvent {
            canonical: Arc::new(canonical),
            args,
            session_id: info.id,
            flags,
            command: com as u8,
            start_time: now_ns(),
            ..QueryEvent::default()
        });
    }
}

fn stmt_id_of(packet: &Packet) -> Option<u32> {
    if packet.len() >= 5 {
        Some(u32::from_le_bytes([
            packet[1], packet[2], packet[3], packet[4],
        ]))
    } else {
        None
    }
}

impl FilterSession for CaptureFilterSession {
    fn route_query(
        &mut self,
        packet: Packet,
        info: &SessionInfo,
    ) -> proxy::Result<Packet> {
        self.refresh_capture_state();

        if self.abort_pending {
            warn!(
                "session {}: aborted, capture started while its transaction was open",
                self.session_id
            );
            return Err(ProxyError::Admin(
                "session aborted: capture started while a transaction was active".to_string(),
            ));
        }

        if self.state != CapState::Disabled {
            self.observe_query(&packet, info);
        }
        self.track_transaction_state(&packet);

        // ignore_transactions: the bracketing statement itself stays
        // uncaptured; capture enables for whatever follows it.
        if self.enable_after_trx && !self.in_trx {
            self.enable_after_trx = false;
            self.handle_signal(CapSignal::Start, None);
        }
        Ok(packet)
    }

    fn client_reply(&mut self, packet: Packet, reply: &Reply, info: &SessionInfo) -> Packet {
        // A LOAD DATA LOCAL INFILE response cancels the capture of the
        // statement that provoked it.
        if reply.is_local_infile {
            self.pending = None;
            self.pending_prepare = None;
            return packet;
        }

        if let Some((canonical, _args)) = self.pending_prepare.take() {
            if !reply.error() {
                if let Some(stmt_id) = stmt_id_of(&packet) {
                    self.prepared.insert(stmt_id, Arc::new(canonical));
                }
            }
            if !reply.is_complete() {
                // Keep waiting for the id in a later fragment.
            }
            return packet;
        }

        if self.pending.is_some() && reply.is_complete() {
            if let Some(event) = self.pending.as_mut() {
                event.end_time = now_ns();
                event.gtid = reply
                    .last_gtid
                    .as_deref()
                    .map(Gtid::parse_lossy)
                    .unwrap_or_default();
            }
            self.handle_signal(CapSignal::Qevent, Some(info));
        }
        packet
    }

    fn close(&mut self, info: &SessionInfo) {
        let _ = info;
        self.handle_signal(CapSignal::CloseSession, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{CaptureLimits, Recorder};
    use crate::storage::archive::{AccessMode, CaptureStorage};
    use crate::storage::Storage;
    use proxy::session::reply::ReplyTracker;

    fn info() -> SessionInfo {
        SessionInfo {
            id: 7,
            service: "svc".to_string(),
            user: "u".to_string(),
            current_db: "orders".to_string(),
            charset: "utf8mb4".to_string(),
            collation: "utf8mb4_general_ci".to_string(),
        }
    }

    fn query_packet(sql: &str) -> Packet {
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend(sql.as_bytes());
        Packet::from_vec(payload)
    }

    fn ok_reply() -> Reply {
        let mut tracker = ReplyTracker::new();
        tracker.track(&Packet::from_vec(vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]))
    }

    fn run_capture(statements: &[&str]) -> (Vec<QueryEvent>, usize) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let storage = CaptureStorage::open(&base, AccessMode::WriteOnly).unwrap();
        let recorder = Recorder::start(Box::new(storage), 1, CaptureLimits::default());

        let filter = CaptureFilter::new("capture");
        let info = info();
        let mut session = filter.new_session(&info);
        filter.core().set_recorder(Some(recorder.clone()));

        for sql in statements {
            let pkt = session.route_query(query_packet(sql), &info).unwrap();
            session.client_reply(pkt, &ok_reply(), &info);
        }
        session.close(&info);
        recorder.stop();

        let mut storage = CaptureStorage::open(&base, AccessMode::ReadOnly).unwrap();
        let canonical_count = storage.canonical_count();
        let mut events = Vec::new();
        while let Some(event) = storage.next_event().unwrap() {
            events.push(event);
        }
        (events, canonical_count)
    }

    #[test]
    fn canonical_dedup_across_statements() {
        let (events, canonical_count) = run_capture(&[
            "SELECT * FROM t WHERE id=1",
            "SELECT * FROM t WHERE id=42",
        ]);
        // two opening events, two queries, one close
        let real: Vec<&QueryEvent> = events.iter().filter(|e| e.is_real()).collect();
        assert_eq!(real.len(), 2);
        assert_eq!(&*real[0].canonical, "SELECT * FROM t WHERE id=?");
        assert_eq!(real[0].canonical_id, real[1].canonical_id);
        assert_eq!(real[0].args[0].value, "1");
        assert_eq!(real[1].args[0].value, "42");
        // the canonical text appears exactly once, next to the openers
        let opener_canonicals = 2;
        assert_eq!(canonical_count, opener_canonicals + 1 + 1); // + close marker
    }

    #[test]
    fn event_ids_are_strictly_increasing() {
        let (events, _) = run_capture(&["SELECT 1", "SELECT 2", "SELECT 3"]);
        for pair in events.windows(2) {
            assert!(pair[0].event_id < pair[1].event_id);
        }
    }

    #[test]
    fn opening_events_precede_the_first_statement() {
        let (events, _) = run_capture(&["SELECT 1"]);
        assert!(events.len() >= 3);
        assert!(events[0].is_artificial());
        assert_eq!(&*events[0].canonical, "use orders");
        assert!(events[1].is_artificial());
        assert!(events[1].canonical.starts_with("set names 'utf8mb4'"));
        assert!(events[0].start_time < events[2].start_time);
        assert!(events.last().unwrap().is_session_close());
    }

    #[test]
    fn ignored_commands_are_not_captured() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let storage = CaptureStorage::open(&base, AccessMode::WriteOnly).unwrap();
        let recorder = Recorder::start(Box::new(storage), 1, CaptureLimits::default());
        let filter = CaptureFilter::new("capture");
        let info = info();
        let mut session = filter.new_session(&info);
        filter.core().set_recorder(Some(recorder.clone()));

        let ping = Packet::from_vec(vec![CommandCode::ComPing as u8]);
        let pkt = session.route_query(ping, &info).unwrap();
        session.client_reply(pkt, &ok_reply(), &info);
        recorder.stop();

        let mut storage = CaptureStorage::open(&base, AccessMode::ReadOnly).unwrap();
        assert!(storage.next_event().unwrap().is_none());
    }

    #[test]
    fn write_statements_are_flagged() {
        let (events, _) = run_capture(&["BEGIN", "UPDATE t SET x=1", "COMMIT"]);
        let real: Vec<&QueryEvent> = events.iter().filter(|e| e.is_real()).collect();
        assert!(real[0].flags.contains(EventFlags::BEGIN_TRX));
        assert!(real[1].flags.contains(EventFlags::WRITE));
        assert!(real[2].flags.contains(EventFlags::COMMIT));
    }

    /// Statements issued before the capture starts, then the rest after.
    fn run_capture_mid_transaction(
        method: CaptureStartMethod,
        before: &[&str],
        after: &[&str],
    ) -> Vec<QueryEvent> {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let storage = CaptureStorage::open(&base, AccessMode::WriteOnly).unwrap();
        let recorder = Recorder::start(Box::new(storage), 1, CaptureLimits::default());

        let filter = CaptureFilter::new("capture");
        let info = info();
        let mut session = filter.new_session(&info);
        for sql in before {
            let pkt = session.route_query(query_packet(sql), &info).unwrap();
            session.client_reply(pkt, &ok_reply(), &info);
        }

        filter.core().set_start_method(method);
        filter.core().set_recorder(Some(recorder.clone()));
        for sql in after {
            let pkt = session.route_query(query_packet(sql), &info).unwrap();
            session.client_reply(pkt, &ok_reply(), &info);
        }
        session.close(&info);
        recorder.stop();

        let mut storage = CaptureStorage::open(&base, AccessMode::ReadOnly).unwrap();
        let mut events = Vec::new();
        while let Some(event) = storage.next_event().unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn ignore_transactions_lets_the_open_one_complete_uncaptured() {
        let events = run_capture_mid_transaction(
            CaptureStartMethod::IgnoreTransactions,
            &["BEGIN", "UPDATE t SET x=1"],
            &["UPDATE t SET x=2", "COMMIT", "SELECT 1"],
        );
        let real: Vec<&QueryEvent> = events.iter().filter(|e| e.is_real()).collect();
        // Everything up to and including the COMMIT ran uncaptured.
        assert_eq!(real.len(), 1);
        assert_eq!(&*real[0].canonical, "SELECT ?");
        assert!(events.last().unwrap().is_session_close());
    }

    #[test]
    fn abort_transactions_tears_the_session_down() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let storage = CaptureStorage::open(&base, AccessMode::WriteOnly).unwrap();
        let recorder = Recorder::start(Box::new(storage), 1, CaptureLimits::default());

        let filter = CaptureFilter::new("capture");
        let info = info();
        let mut session = filter.new_session(&info);
        let pkt = session.route_query(query_packet("BEGIN"), &info).unwrap();
        session.client_reply(pkt, &ok_reply(), &info);

        filter.core().set_start_method(CaptureStartMethod::AbortTransactions);
        filter.core().set_recorder(Some(recorder.clone()));
        let err = session
            .route_query(query_packet("UPDATE t SET x=1"), &info)
            .unwrap_err();
        assert!(err.to_string().contains("transaction"));
        recorder.stop();
    }

    #[test]
    fn abort_method_is_harmless_outside_a_transaction() {
        let events = run_capture_mid_transaction(
            CaptureStartMethod::AbortTransactions,
            &["SELECT 1"],
            &["SELECT 2"],
        );
        let real: Vec<&QueryEvent> = events.iter().filter(|e| e.is_real()).collect();
        assert_eq!(real.len(), 1);
        assert_eq!(real[0].args[0].value, "2");
    }
}
