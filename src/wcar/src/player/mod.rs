pub mod deadlock;
pub mod session;

use crate::event::{QueryEvent, RepEvent};
use crate::player::session::{ExecOutcome, PlayerSession, SessionNotifier, StatementExecutor};
use crate::storage::archive::{encode_rep_event, ArchiveWriter, CaptureStorage};
use crate::storage::Storage;
use crate::transform::Transform;
use crate::{Result, WcarError};
use common::simtime::SimTime;
use hashbrown::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// How long the player waits on a stalled front transaction before it is
/// forcibly marked complete (its session usually died).
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RepConfig {
    pub capture: PathBuf,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Clock multiplier; 0 replays as fast as possible.
    pub sim_speed: f64,
    pub enable_deadlock_monitor: bool,
}

impl Default for RepConfig {
    fn default() -> Self {
        Self {
            capture: PathBuf::new(),
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            sim_speed: 1.0,
            enable_deadlock_monitor: false,
        }
    }
}

/// Player-side completion signals shared with the session threads.
pub struct PlayerShared {
    finished_trxns: Mutex<HashSet<i64>>,
    trxn_cv: Condvar,
    finished_sessions: Mutex<HashSet<u64>>,
    session_cv: Condvar,
    dead_sessions: Mutex<HashSet<u64>>,
}

impl PlayerShared {
    fn new() -> Arc<PlayerShared> {
        Arc::new(PlayerShared {
            finished_trxns: Mutex::new(HashSet::new()),
            trxn_cv: Condvar::new(),
            finished_sessions: Mutex::new(HashSet::new()),
            session_cv: Condvar::new(),
            dead_sessions: Mutex::new(HashSet::new()),
        })
    }
}

impl SessionNotifier for PlayerShared {
    fn trxn_finished(&self, commit_event_id: i64) {
        self.finished_trxns.lock().unwrap().insert(commit_event_id);
        self.trxn_cv.notify_one();
        // The final wait loop also reacts to transaction completions:
        // they can make pending events of other sessions runnable.
        self.session_cv.notify_one();
    }

    fn session_finished(&self, session_id: u64) {
        self.finished_sessions.lock().unwrap().insert(session_id);
        self.session_cv.notify_one();
    }

    fn session_died(&self, session_id: u64) {
        self.dead_sessions.lock().unwrap().insert(session_id);
        self.trxn_cv.notify_one();
        self.session_cv.notify_one();
    }
}

/// Creates one statement executor per replay session. The default factory
/// opens a MariaDB connection; tests substitute stubs.
pub type ExecutorFactory =
    Box<dyn Fn(u64) -> Box<dyn StatementExecutor + Send> + Send + Sync>;

#[derive(Debug, Default, Clone)]
pub struct ReplayReport {
    pub events: u64,
    pub errors: u64,
    pub transactions: u64,
    pub forced_advances: u64,
}

/// Replays a transformed capture against a target, preserving relative
/// timing and the cross-session transaction schedule.
pub struct Player {
    config: RepConfig,
    transform: Transform,
    shared: Arc<PlayerShared>,
    sessions: HashMap<u64, PlayerSession>,
    completed: Vec<bool>,
    front: usize,
    rep_tx: Option<Sender<RepEvent>>,
    rep_thread: Option<std::thread::JoinHandle<Result<()>>>,
    executor_factory: ExecutorFactory,
    report: ReplayReport,
}

impl Player {
    pub fn new(config: RepConfig) -> Result<Player> {
        let transform = Transform::run(&config.capture)?;
        let factory = mysql_executor_factory(&config);
        Ok(Self::with_executor_factory(config, transform, factory))
    }

    pub fn with_executor_factory(
        config: RepConfig,
        transform: Transform,
        executor_factory: ExecutorFactory,
    ) -> Player {
        let transaction_count = transform.transactions().len();
        Player {
            config,
            transform,
            shared: PlayerShared::new(),
            sessions: HashMap::new(),
            completed: vec![false; transaction_count],
            front: 0,
            rep_tx: None,
            rep_thread: None,
            executor_factory,
            report: ReplayReport::default(),
        }
    }

    pub fn replay(mut self) -> Result<ReplayReport> {
        let mut storage =
            CaptureStorage::open(&self.config.capture, crate::storage::archive::AccessMode::ReadOnly)?;
        self.start_rep_recorder()?;

        let _deadlock = if self.config.enable_deadlock_monitor {
            Some(deadlock::DeadlockMonitor::start(
                &self.config.host,
                self.config.port,
                &self.config.user,
                &self.config.password,
            ))
        } else {
            None
        };

        let mut sim: Option<SimTime> = None;
        while let Some(event) = storage.next_event()? {
            let sim = sim.get_or_insert_with(|| {
                SimTime::new(event.start_time, self.config.sim_speed)
            });
            self.wait_until(sim, event.start_time);
            self.report.events += 1;
            self.timeline_add(event);
        }

        self.wait_for_sessions_to_finish();
        self.finish()?;
        info!(
            "replay finished: {} events, {} transactions, {} forced advances",
            self.report.events, self.report.transactions, self.report.forced_advances
        );
        Ok(self.report)
    }

    fn start_rep_recorder(&mut self) -> Result<()> {
        let path = self.config.capture.with_extension("rx");
        let mut writer = ArchiveWriter::create(&path)?;
        let (tx, rx) = channel::<RepEvent>();
        self.rep_tx = Some(tx);
        self.rep_thread = Some(
            std::thread::Builder::new()
                .name("wcar-rep-recorder".to_string())
                .spawn(move || {
                    while let Ok(event) = rx.recv() {
                        writer.append(&encode_rep_event(&event))?;
                    }
                    writer.sync()
                })
                .map_err(|e| WcarError::Replay(format!("cannot start rep recorder: {e}")))?,
        );
        Ok(())
    }

    /// Pace against the simulated clock, scheduling newly-runnable pending
    /// events whenever a transaction completes while waiting.
    fn wait_until(&mut self, sim: &SimTime, start_time: i64) {
        sim.tick();
        if self.config.sim_speed <= 0.0 {
            self.drain_completions();
            return;
        }
        while sim.tick().now() < start_time {
            let wait = Duration::from_millis(1).max(Duration::from_nanos(
                ((start_time - sim.now()).max(0) as u64).min(5_000_000),
            ));
            let guard = self.shared.finished_trxns.lock().unwrap();
            let (_guard, _timeout) = self
                .shared
                .trxn_cv
                .wait_timeout_while(guard, wait, |set| set.is_empty())
                .unwrap();
            drop(_guard);
            self.drain_completions();
        }
        self.drain_completions();
    }

    fn timeline_add(&mut self, event: QueryEvent) {
        let session_id = event.session_id;
        if !self.sessions.contains_key(&session_id) {
            let executor = (self.executor_factory)(session_id);
            let session = PlayerSession::spawn(
                session_id,
                executor,
                Arc::clone(&self.shared) as Arc<dyn SessionNotifier>,
                self.rep_tx.clone().expect("rep recorder started"),
            );
            self.sessions.insert(session_id, session);
        }
        self.schedule_event(session_id, event);
    }

    /// The scheduling rule: inside a transaction a session may run up to
    /// its commit event; a transaction start must not overtake the front
    /// transaction; everything else runs freely.
    fn can_execute(&self, session: &PlayerSession, event: &QueryEvent) -> (bool, Option<usize>) {
        let transactions = self.transform.transactions();
        let trx_start = self.transform.trx_starting_at(event.event_id);
        if self.front >= transactions.len() {
            return (true, trx_start);
        }
        if session.in_trxn() {
            return (event.event_id <= session.commit_event_id(), None);
        }
        if trx_start.is_some() {
            let front = &transactions[self.front];
            (event.start_time < front.end_time, trx_start)
        } else {
            (true, None)
        }
    }

    fn schedule_event(&mut self, session_id: u64, event: QueryEvent) {
        let has_pending = self
            .sessions
            .get(&session_id)
            .map(PlayerSession::has_pending)
            .unwrap_or(false);
        if has_pending {
            self.sessions
                .get_mut(&session_id)
                .expect("session spawned")
                .push_pending(event);
            return;
        }
        let session = self.sessions.get(&session_id).expect("session spawned");
        let (can_execute, trx_start) = self.can_execute(session, &event);
        let commit_event_id =
            trx_start.map(|idx| self.transform.transactions()[idx].end_event_id);
        let session = self.sessions.get_mut(&session_id).expect("session spawned");
        if can_execute {
            session.queue(event, commit_event_id);
        } else {
            session.push_pending(event);
        }
    }

    /// Mark freshly-finished transactions complete, advance the front past
    /// the completed prefix and dispatch newly-runnable pending events.
    fn drain_completions(&mut self) {
        let finished: Vec<i64> = {
            let mut set = self.shared.finished_trxns.lock().unwrap();
            set.drain().collect()
        };
        for commit_event_id in finished {
            if let Some(idx) = self.transform.trx_ending_at(commit_event_id) {
                if !self.completed[idx] {
                    self.completed[idx] = true;
                    self.report.transactions += 1;
                }
                let session_id = self.transform.transactions()[idx].session_id;
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.reset_commit_event_id();
                }
            }
        }
        while self.front < self.completed.len() && self.completed[self.front] {
            self.front += 1;
        }
        self.schedule_pending();
    }

    /// Greedy dispatch of pending queues; not necessarily fair.
    fn schedule_pending(&mut self) {
        let session_ids: Vec<u64> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            loop {
                let Some(session) = self.sessions.get(&session_id) else {
                    break;
                };
                let Some(front_event) = session.front_pending() else {
                    break;
                };
                let (can_execute, trx_start) = self.can_execute(session, front_event);
                if !can_execute {
                    break;
                }
                let commit_event_id =
                    trx_start.map(|idx| self.transform.transactions()[idx].end_event_id);
                self.sessions
                    .get_mut(&session_id)
                    .expect("session present")
                    .queue_front_pending(commit_event_id);
            }
        }
    }

    fn wait_for_sessions_to_finish(&mut self) {
        loop {
            self.drain_completions();
            self.remove_finished_sessions();
            if self.sessions.is_empty() {
                break;
            }

            let shared = Arc::clone(&self.shared);
            let guard = self.shared.finished_sessions.lock().unwrap();
            let (guard, timeout) = self
                .shared
                .session_cv
                .wait_timeout_while(guard, STALL_TIMEOUT, |sessions| {
                    sessions.is_empty() && shared.finished_trxns.lock().unwrap().is_empty()
                })
                .unwrap();
            let stalled = timeout.timed_out() && guard.is_empty();
            drop(guard);

            if stalled {
                let drained = self.front >= self.completed.len()
                    && self.sessions.values().all(|s| !s.has_pending());
                if drained {
                    // Nothing left to run; sessions whose capture carried
                    // no close marker are wound down here.
                    for (_, session) in self.sessions.drain() {
                        self.report.errors += session.join();
                    }
                } else {
                    self.force_advance();
                }
            }
        }
        // Every transaction is accounted for once the sessions are gone.
        while self.front < self.completed.len() {
            if !self.completed[self.front] {
                self.completed[self.front] = true;
                self.report.forced_advances += 1;
            }
            self.front += 1;
        }
    }

    /// A transaction whose session died would block the front forever; a
    /// bounded wait and then the front moves on.
    fn force_advance(&mut self) {
        if self.front >= self.completed.len() {
            return;
        }
        let transactions = self.transform.transactions();
        let front = &transactions[self.front];
        let dead = self
            .shared
            .dead_sessions
            .lock()
            .unwrap()
            .contains(&front.session_id);
        if !self.completed[self.front] {
            warn!(
                "front transaction (session {}, commit event {}) stalled{}; forcing past it",
                front.session_id,
                front.end_event_id,
                if dead { " on a dead session" } else { "" }
            );
            self.completed[self.front] = true;
            self.report.forced_advances += 1;
        }
        self.front += 1;
        self.schedule_pending();
    }

    fn remove_finished_sessions(&mut self) {
        let finished: Vec<u64> = {
            let mut set = self.shared.finished_sessions.lock().unwrap();
            set.drain().collect()
        };
        for session_id in finished {
            if let Some(session) = self.sessions.remove(&session_id) {
                self.report.errors += session.join();
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        for (_, session) in self.sessions.drain() {
            self.report.errors += session.join();
        }
        self.rep_tx = None; // closes the rep recorder channel
        if let Some(thread) = self.rep_thread.take() {
            thread
                .join()
                .map_err(|_| WcarError::Replay("rep recorder panicked".to_string()))??;
        }
        Ok(())
    }
}

fn mysql_executor_factory(config: &RepConfig) -> ExecutorFactory {
    let host = config.host.clone();
    let port = config.port;
    let user = config.user.clone();
    let password = config.password.clone();
    Box::new(move |session_id| {
        Box::new(session::MySqlExecutor::connect(
            &host, port, &user, &password, session_id,
        ))
    })
}

/// Used by tests and the summary tool: replay outcomes keyed by event.
pub fn exec_outcome_to_rep_event(event: &QueryEvent, outcome: &ExecOutcome) -> RepEvent {
    RepEvent {
        event_id: event.event_id,
        start_time: outcome.start_time,
        end_time: outcome.end_time,
        canonical_id: event.canonical_id,
        num_rows: outcome.rows,
        rows_read: outcome.rows,
        error: outcome.error,
    }
}
