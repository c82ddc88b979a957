use crate::event::{EventFlags, QueryEvent, Transaction};
use crate::sort::{QuerySort, SortReport};
use crate::storage::archive::{AccessMode, CaptureStorage};
use crate::storage::Storage;
use crate::Result;
use hashbrown::HashMap;
use std::path::Path;
use tracing::{info, warn};

// Expected transaction behavior: begin and autocommit disable both start a
// transaction; commit, rollback and autocommit enable end one; a write
// with autocommit on is a single-statement transaction; a session closing
// with an open transaction closes it. Read-only transactions are not
// recorded.

/// Tracks one session's timeline and produces Transaction records as the
/// sorted events stream past.
struct SessionState {
    session_id: u64,
    start_event_id: i64,
    in_trx: bool,
    // initially it is assumed autocommit is on
    autocommit: bool,
}

impl SessionState {
    fn new(session_id: u64) -> Self {
        Self {
            session_id,
            start_event_id: -1,
            in_trx: false,
            autocommit: true,
        }
    }

    fn update(&mut self, event: &QueryEvent) -> Option<Transaction> {
        if event.is_session_close() {
            if self.in_trx {
                self.in_trx = false;
                return Some(self.fill(event));
            }
            return None;
        }
        if self.autocommit && event.flags.contains(EventFlags::ENABLE_AUTOCOMMIT) {
            // do not treat extra enables as single-statement transactions
            warn!("extra autocommit enable at event {}", event.event_id);
            return None;
        }

        if event.flags.contains(EventFlags::ENABLE_AUTOCOMMIT) {
            self.autocommit = true;
        }
        if event.flags.contains(EventFlags::DISABLE_AUTOCOMMIT) {
            self.autocommit = false;
        }

        let mut produced = None;
        if self.is_trx_start(event) {
            self.start_event_id = event.event_id;
            // single-statement autocommit transactions end on the same event
            self.in_trx = !self.is_trx_end(event);
        }
        if self.is_trx_end(event) {
            self.in_trx = false;
            produced = Some(self.fill(event));
        }
        produced
    }

    fn is_trx_start(&self, event: &QueryEvent) -> bool {
        !self.in_trx
            && (event
                .flags
                .intersects(EventFlags::BEGIN_TRX | EventFlags::DISABLE_AUTOCOMMIT)
                || (self.autocommit && event.flags.is_write()))
    }

    fn is_trx_end(&self, event: &QueryEvent) -> bool {
        (self.in_trx
            && event.flags.intersects(
                EventFlags::COMMIT | EventFlags::ROLLBACK | EventFlags::ENABLE_AUTOCOMMIT,
            ))
            || (!self.in_trx && self.autocommit && event.flags.is_write())
    }

    fn fill(&self, event: &QueryEvent) -> Transaction {
        Transaction {
            session_id: self.session_id,
            start_event_id: self.start_event_id,
            end_event_id: event.event_id,
            end_time: event.end_time,
            gtid: event.gtid,
        }
    }
}

/// The offline pass before replay: sorts the event file, derives the
/// transaction set, writes `.gx` and builds the start/end indexes the
/// player consults.
pub struct Transform {
    transactions: Vec<Transaction>,
    by_start: HashMap<i64, usize>,
    by_end: HashMap<i64, usize>,
    max_parallel_sessions: usize,
    sort_report: SortReport,
}

impl Transform {
    pub fn run(base_path: &Path) -> Result<Transform> {
        let event_path = base_path.with_extension("ex");
        info!("transforming {} for replay", base_path.display());
        let sort_report = QuerySort::default().sort_file(&event_path)?;

        let mut storage = CaptureStorage::open(base_path, AccessMode::ReadOnly)?;
        let mut sessions: HashMap<u64, SessionState> = HashMap::new();
        let mut transactions = Vec::new();
        let mut active_sessions = 0usize;
        let mut max_parallel_sessions = 0usize;

        while let Some(event) = storage.next_event()? {
            if !sessions.contains_key(&event.session_id) {
                active_sessions += 1;
                max_parallel_sessions = max_parallel_sessions.max(active_sessions);
            }
            let state = sessions
                .entry(event.session_id)
                .or_insert_with(|| SessionState::new(event.session_id));
            if let Some(trx) = state.update(&event) {
                transactions.push(trx);
            }
            if event.is_session_close() {
                sessions.remove(&event.session_id);
                active_sessions -= 1;
            }
        }

        // Sort by gtid where both sides share a domain; end_time otherwise.
        // The transaction set is small relative to the events and fits in
        // memory.
        transactions.sort_by(|a, b| {
            if a.gtid.is_valid() && b.gtid.is_valid() && a.gtid.domain_id == b.gtid.domain_id {
                a.gtid.sequence_nr.cmp(&b.gtid.sequence_nr)
            } else {
                a.end_time.cmp(&b.end_time)
            }
        });

        storage.save_transactions(&transactions)?;

        let mut by_start = HashMap::with_capacity(transactions.len());
        let mut by_end = HashMap::with_capacity(transactions.len());
        for (idx, trx) in transactions.iter().enumerate() {
            by_start.insert(trx.start_event_id, idx);
            by_end.insert(trx.end_event_id, idx);
        }

        info!(
            "transform: {} events, {} transactions, {} parallel sessions",
            sort_report.events,
            transactions.len(),
            max_parallel_sessions
        );
        Ok(Transform {
            transactions,
            by_start,
            by_end,
            max_parallel_sessions,
            sort_report,
        })
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn trx_starting_at(&self, event_id: i64) -> Option<usize> {
        self.by_start.get(&event_id).copied()
    }

    pub fn trx_ending_at(&self, event_id: i64) -> Option<usize> {
        self.by_end.get(&event_id).copied()
    }

    pub fn max_parallel_sessions(&self) -> usize {
        self.max_parallel_sessions
    }

    pub fn sort_report(&self) -> &SortReport {
        &self.sort_report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;
    use crate::classify::classify;
    use crate::storage::archive::{AccessMode, CaptureStorage};
    use common::gtid::Gtid;
    use std::sync::Arc;

    struct CaptureBuilder {
        storage: CaptureStorage,
        next_event_id: i64,
        now: i64,
    }

    impl CaptureBuilder {
        fn new(base: &Path) -> Self {
            Self {
                storage: CaptureStorage::open(base, AccessMode::WriteOnly).unwrap(),
                next_event_id: 1,
                now: 1_000,
            }
        }

        fn stmt(&mut self, session_id: u64, sql: &str) -> i64 {
            let flags = classify(sql);
            let (canonical, args) = canonicalize(sql);
            self.push(session_id, canonical, args, flags)
        }

        fn close(&mut self, session_id: u64) -> i64 {
            self.push(
                session_id,
                "Close session".to_string(),
                Vec::new(),
                EventFlags::SESSION_CLOSE,
            )
        }

        fn push(
            &mut self,
            session_id: u64,
            canonical: String,
            args: Vec<crate::event::CanonicalArg>,
            flags: EventFlags,
        ) -> i64 {
            let event_id = self.next_event_id;
            self.next_event_id += 1;
            self.now += 100;
            self.storage
                .add_query_event(QueryEvent {
                    canonical: Arc::new(canonical),
                    args,
                    session_id,
                    flags,
                    start_time: self.now,
                    end_time: self.now + 50,
                    event_id,
                    gtid: Gtid::default(),
                    ..QueryEvent::default()
                })
                .unwrap();
            event_id
        }

        fn finish(mut self) {
            self.storage.sync().unwrap();
        }
    }

    #[test]
    fn explicit_and_single_statement_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let mut builder = CaptureBuilder::new(&base);
        let begin = builder.stmt(1, "BEGIN");
        let _update = builder.stmt(1, "UPDATE t SET x=1");
        let commit = builder.stmt(1, "COMMIT");
        let _select = builder.stmt(1, "SELECT 1");
        let insert = builder.stmt(1, "INSERT INTO t VALUES (2)");
        builder.close(1);
        builder.finish();

        let transform = Transform::run(&base).unwrap();
        let transactions = transform.transactions();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].start_event_id, begin);
        assert_eq!(transactions[0].end_event_id, commit);
        assert_eq!(transactions[1].start_event_id, insert);
        assert_eq!(transactions[1].end_event_id, insert);
        // The gx file round-trips the same set.
        let storage = CaptureStorage::open(&base, AccessMode::ReadOnly).unwrap();
        assert_eq!(storage.load_transactions().unwrap(), transactions);
    }

    #[test]
    fn read_only_transactions_are_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let mut builder = CaptureBuilder::new(&base);
        builder.stmt(1, "SELECT 1");
        builder.stmt(1, "SELECT 2");
        builder.close(1);
        builder.finish();

        let transform = Transform::run(&base).unwrap();
        assert!(transform.transactions().is_empty());
    }

    #[test]
    fn autocommit_bracketing() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let mut builder = CaptureBuilder::new(&base);
        let disable = builder.stmt(1, "SET autocommit=0");
        builder.stmt(1, "UPDATE t SET x=1");
        let enable = builder.stmt(1, "SET autocommit=1");
        builder.close(1);
        builder.finish();

        let transform = Transform::run(&base).unwrap();
        let transactions = transform.transactions();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].start_event_id, disable);
        assert_eq!(transactions[0].end_event_id, enable);
    }

    #[test]
    fn session_close_ends_an_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let mut builder = CaptureBuilder::new(&base);
        let begin = builder.stmt(1, "BEGIN");
        builder.stmt(1, "UPDATE t SET x=1");
        let close = builder.close(1);
        builder.finish();

        let transform = Transform::run(&base).unwrap();
        let transactions = transform.transactions();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].start_event_id, begin);
        assert_eq!(transactions[0].end_event_id, close);
    }

    #[test]
    fn indexes_find_transactions_by_both_ends() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let mut builder = CaptureBuilder::new(&base);
        let begin = builder.stmt(1, "BEGIN");
        builder.stmt(1, "UPDATE t SET x=1");
        let commit = builder.stmt(1, "COMMIT");
        builder.close(1);
        builder.finish();

        let transform = Transform::run(&base).unwrap();
        assert_eq!(transform.trx_starting_at(begin), Some(0));
        assert_eq!(transform.trx_ending_at(commit), Some(0));
        assert_eq!(transform.trx_starting_at(commit), None);
    }

    #[test]
    fn interleaved_sessions_count_parallelism() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cap");
        let mut builder = CaptureBuilder::new(&base);
        builder.stmt(1, "SELECT 1");
        builder.stmt(2, "SELECT 1");
        builder.stmt(3, "SELECT 1");
        builder.close(2);
        builder.stmt(1, "SELECT 2");
        builder.close(1);
        builder.close(3);
        builder.finish();

        let transform = Transform::run(&base).unwrap();
        assert_eq!(transform.max_parallel_sessions(), 3);
    }
}
