use crate::canonical::canonical_args_to_sql;
use crate::event::{EventFlags, QueryEvent, RepEvent};
use common::now_ns;
use mysql::prelude::Queryable;
use proxy::protocol::mysql::constants::CommandCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use tracing::{debug, warn};

/// Completion callbacks from a session thread back to the player.
pub trait SessionNotifier: Send + Sync {
    fn trxn_finished(&self, commit_event_id: i64);
    fn session_finished(&self, session_id: u64);
    fn session_died(&self, session_id: u64);
}

/// What executing one statement produced.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub start_time: i64,
    pub end_time: i64,
    pub rows: u64,
    /// Backend error code, 0 on success.
    pub error: u32,
    /// The connection is gone; subsequent statements cannot run.
    pub connection_lost: bool,
}

/// Executes statements against the replay target. One per session thread;
/// the default implementation wraps a MariaDB connection, tests use stubs.
pub trait StatementExecutor {
    fn execute(&mut self, sql: &str) -> ExecOutcome;
}

pub struct MySqlExecutor {
    conn: Option<mysql::Conn>,
    session_id: u64,
}

impl MySqlExecutor {
    pub fn connect(host: &str, port: u16, user: &str, password: &str, session_id: u64) -> Self {
        let opts = mysql::OptsBuilder::new()
            .ip_or_hostname(Some(host))
            .tcp_port(port)
            .user(Some(user))
            .pass(Some(password));
        let conn = match mysql::Conn::new(opts) {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!("replay session {session_id}: cannot connect to target: {e}");
                None
            }
        };
        Self { conn, session_id }
    }
}

impl StatementExecutor for MySqlExecutor {
    fn execute(&mut self, sql: &str) -> ExecOutcome {
        let mut outcome = ExecOutcome {
            start_time: now_ns(),
            ..ExecOutcome::default()
        };
        let Some(conn) = self.conn.as_mut() else {
            outcome.connection_lost = true;
            outcome.end_time = outcome.start_time;
            return outcome;
        };
        match conn.query::<mysql::Row, _>(sql) {
            Ok(rows) => {
                outcome.rows = rows.len() as u64;
            }
            Err(mysql::Error::MySqlError(e)) => {
                debug!(
                    "replay session {}: error {} for {}",
                    self.session_id,
                    e.code,
                    &sql[..sql.len().min(80)]
                );
                outcome.error = e.code as u32;
            }
            Err(e) => {
                warn!("replay session {}: connection lost: {e}", self.session_id);
                outcome.error = 2013;
                outcome.connection_lost = true;
                self.conn = None;
            }
        }
        outcome.end_time = now_ns();
        outcome
    }
}

/// The player's handle to one replay session: a worker thread draining a
/// queue of events into its executor, plus the pending queue of events
/// whose preconditions are not yet met.
pub struct PlayerSession {
    sender: Option<Sender<QueryEvent>>,
    commit_event_id: Arc<AtomicI64>,
    pending: VecDeque<QueryEvent>,
    thread: Option<std::thread::JoinHandle<u64>>,
}

impl PlayerSession {
    pub fn spawn(
        session_id: u64,
        executor: Box<dyn StatementExecutor + Send>,
        notifier: Arc<dyn SessionNotifier>,
        rep_tx: Sender<RepEvent>,
    ) -> PlayerSession {
        let (tx, rx) = channel::<QueryEvent>();
        let commit_event_id = Arc::new(AtomicI64::new(-1));
        let commit_for_thread = Arc::clone(&commit_event_id);
        let thread = std::thread::Builder::new()
            .name(format!("rep-{session_id}"))
            .spawn(move || {
                run_session(session_id, executor, notifier, rep_tx, rx, commit_for_thread)
            })
            .expect("spawning a replay session cannot fail");
        PlayerSession {
            sender: Some(tx),
            commit_event_id,
            pending: VecDeque::new(),
            thread: Some(thread),
        }
    }

    pub fn in_trxn(&self) -> bool {
        self.commit_event_id.load(Ordering::Acquire) != -1
    }

    pub fn commit_event_id(&self) -> i64 {
        self.commit_event_id.load(Ordering::Acquire)
    }

    pub fn reset_commit_event_id(&mut self) {
        self.commit_event_id.store(-1, Ordering::Release);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn front_pending(&self) -> Option<&QueryEvent> {
        self.pending.front()
    }

    pub fn push_pending(&mut self, event: QueryEvent) {
        self.pending.push_back(event);
    }

    /// Dispatch one event to the worker. A transaction-starting event
    /// carries the id of the event that will commit it.
    pub fn queue(&mut self, event: QueryEvent, commit_event_id: Option<i64>) {
        if let Some(commit) = commit_event_id {
            debug_assert_eq!(self.commit_event_id.load(Ordering::Acquire), -1);
            self.commit_event_id.store(commit, Ordering::Release);
        }
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    pub fn queue_front_pending(&mut self, commit_event_id: Option<i64>) {
        if let Some(event) = self.pending.pop_front() {
            self.queue(event, commit_event_id);
        }
    }

    /// Close the queue and join the thread; returns its error count.
    pub fn join(mut self) -> u64 {
        self.sender = None;
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or(0),
            None => 0,
        }
    }
}

fn run_session(
    session_id: u64,
    mut executor: Box<dyn StatementExecutor + Send>,
    notifier: Arc<dyn SessionNotifier>,
    rep_tx: Sender<RepEvent>,
    rx: std::sync::mpsc::Receiver<QueryEvent>,
    commit_event_id: Arc<AtomicI64>,
) -> u64 {
    let mut errors = 0u64;
    let mut dead = false;
    let mut refused_warned = false;

    while let Ok(event) = rx.recv() {
        if event.is_session_close() {
            break;
        }

        let commit = commit_event_id.load(Ordering::Acquire);
        let is_commit_event = event.event_id == commit;

        if should_refuse(&event) {
            if !refused_warned {
                warn!(
                    "replay session {session_id}: refusing to replay non-SQL command \
                     '{}' (and any further ones, silently)",
                    event.canonical
                );
                refused_warned = true;
            }
        } else if dead {
            warn!(
                "replay session {session_id}: skipping event {} on a lost connection",
                event.event_id
            );
        } else {
            let sql = canonical_args_to_sql(&event.canonical, &event.args);
            let outcome = executor.execute(&sql);
            if outcome.error != 0 {
                errors += 1;
            }
            if outcome.connection_lost {
                dead = true;
                notifier.session_died(session_id);
            }
            let _ = rep_tx.send(crate::player::exec_outcome_to_rep_event(&event, &outcome));
        }

        if is_commit_event {
            notifier.trxn_finished(commit);
        }
    }

    notifier.session_finished(session_id);
    errors
}

/// The session-level side effects of these commands cannot be reproduced
/// safely; they are documented as refused rather than guessed at.
fn should_refuse(event: &QueryEvent) -> bool {
    if event.flags.contains(EventFlags::TAGGED_COMMAND) {
        return true;
    }
    CommandCode::from_byte(event.command)
        .map(|c| c.refused_by_replay())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingNotifier {
        finished_trxns: Mutex<Vec<i64>>,
        finished_sessions: Mutex<Vec<u64>>,
    }

    impl SessionNotifier for RecordingNotifier {
        fn trxn_finished(&self, commit_event_id: i64) {
            self.finished_trxns.lock().unwrap().push(commit_event_id);
        }

        fn session_finished(&self, session_id: u64) {
            self.finished_sessions.lock().unwrap().push(session_id);
        }

        fn session_died(&self, _session_id: u64) {}
    }

    struct StubExecutor {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl StatementExecutor for StubExecutor {
        fn execute(&mut self, sql: &str) -> ExecOutcome {
            self.log.lock().unwrap().push(sql.to_string());
            ExecOutcome {
                start_time: now_ns(),
                end_time: now_ns(),
                rows: 1,
                ..ExecOutcome::default()
            }
        }
    }

    fn event(event_id: i64, sql: &str) -> QueryEvent {
        let (canonical, args) = crate::canonical::canonicalize(sql);
        QueryEvent {
            canonical: Arc::new(canonical),
            args,
            event_id,
            session_id: 1,
            ..QueryEvent::default()
        }
    }

    #[test]
    fn executes_in_queue_order_and_notifies_commit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let notifier = Arc::new(RecordingNotifier {
            finished_trxns: Mutex::new(Vec::new()),
            finished_sessions: Mutex::new(Vec::new()),
        });
        let (rep_tx, rep_rx) = channel();
        let mut session = PlayerSession::spawn(
            1,
            Box::new(StubExecutor { log: Arc::clone(&log) }),
            Arc::clone(&notifier) as Arc<dyn SessionNotifier>,
            rep_tx,
        );

        session.queue(event(1, "BEGIN"), Some(3));
        assert!(session.in_trxn());
        session.queue(event(2, "UPDATE t SET x=1"), None);
        session.queue(event(3, "COMMIT"), None);
        let mut close = event(4, "Close session");
        close.flags = EventFlags::SESSION_CLOSE;
        session.queue(close, None);

        assert_eq!(session.join(), 0);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["BEGIN", "UPDATE t SET x=1", "COMMIT"]
        );
        assert_eq!(notifier.finished_trxns.lock().unwrap().as_slice(), &[3]);
        assert_eq!(notifier.finished_sessions.lock().unwrap().as_slice(), &[1]);
        // One rep event per executed statement.
        assert_eq!(rep_rx.try_iter().count(), 3);
    }

    #[test]
    fn refused_commands_are_skipped_but_keep_their_place() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let notifier = Arc::new(RecordingNotifier {
            finished_trxns: Mutex::new(Vec::new()),
            finished_sessions: Mutex::new(Vec::new()),
        });
        let (rep_tx, rep_rx) = channel();
        let mut session = PlayerSession::spawn(
            1,
            Box::new(StubExecutor { log: Arc::clone(&log) }),
            Arc::clone(&notifier) as Arc<dyn SessionNotifier>,
            rep_tx,
        );

        let mut tagged = event(1, "ComStatistics");
        tagged.flags = EventFlags::TAGGED_COMMAND;
        session.queue(tagged, None);
        session.queue(event(2, "SELECT 1"), None);

        session.join();
        assert_eq!(log.lock().unwrap().as_slice(), &["SELECT 1"]);
        assert_eq!(rep_rx.try_iter().count(), 1);
    }
}
