use crate::diff::exporter::{build_exporter, Exporter};
use crate::diff::session::DiffRouterSession;
use crate::diff::{ComparisonKind, DiffSettings, DIFF_MODULE};
use crate::monitor::parse_gtid_position_list;
use crate::server::Server;
use crate::service::{Service, Target};
use crate::session::backend::Backend;
use crate::session::router::{Router, RouterCaps, RouterSession};
use crate::session::SessionInfo;
use crate::worker::WorkerPool;
use crate::{ProxyError, Result};

use async_trait::async_trait;
use hashbrown::HashMap;
use mysql::prelude::Queryable;
use serde_json::json;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use strum_macros::AsRefStr;
use tracing::{error, info, warn};

/// The comparator's top-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DiffState {
    Prepared,
    Synchronizing,
    Capturing,
}

/// Sub-states of the synchronizing phase; each is re-entrant under the
/// periodic tick until its precondition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SyncState {
    Idle,
    Suspending,
    Rewiring,
    StoppingReplication,
    RestartingAndResuming,
}

/// Aggregated per-round statistics for `summary`.
#[derive(Debug, Default, Clone)]
pub struct DiffStats {
    pub rounds: u64,
    pub conflicts: u64,
    pub per_target: HashMap<String, TargetStats>,
}

#[derive(Debug, Default, Clone)]
pub struct TargetStats {
    pub responses: u64,
    pub total_duration_ms: u64,
    pub errors: u64,
    pub rows: u64,
}

/// State shared between the router and its sessions: the settings
/// snapshot, the exporter and the summary statistics. The exporter swap
/// takes the unique lock; the hot path ships under the shared lock.
pub struct DiffShared {
    settings: RwLock<DiffSettings>,
    exporter: RwLock<Arc<dyn Exporter>>,
    stats: Mutex<DiffStats>,
}

impl DiffShared {
    pub fn new(settings: DiffSettings) -> Result<Arc<DiffShared>> {
        let exporter = build_exporter(&settings)?;
        Ok(Arc::new(DiffShared {
            settings: RwLock::new(settings),
            exporter: RwLock::new(exporter),
            stats: Mutex::new(DiffStats::default()),
        }))
    }

    pub fn for_tests(settings: DiffSettings, exporter: Arc<dyn Exporter>) -> Arc<DiffShared> {
        Arc::new(DiffShared {
            settings: RwLock::new(settings),
            exporter: RwLock::new(exporter),
            stats: Mutex::new(DiffStats::default()),
        })
    }

    pub fn settings(&self) -> DiffSettings {
        self.settings.read().unwrap().clone()
    }

    /// Swap settings at runtime; the exporter is rebuilt when its
    /// configuration changed.
    pub fn reconfigure(&self, settings: DiffSettings) -> Result<()> {
        let rebuild = {
            let current = self.settings.read().unwrap();
            current.exporter != settings.exporter || current.file != settings.file
        };
        if rebuild {
            let exporter = build_exporter(&settings)?;
            *self.exporter.write().unwrap() = exporter;
        }
        *self.settings.write().unwrap() = settings;
        Ok(())
    }

    pub fn ship(&self, report: &serde_json::Value) {
        self.exporter.read().unwrap().ship(report);
    }

    pub fn note_round(&self, slots: &[(String, u64, bool, u64)], conflict: bool) {
        let mut stats = self.stats.lock().unwrap();
        stats.rounds += 1;
        if conflict {
            stats.conflicts += 1;
        }
        for (target, duration_ms, is_error, rows) in slots {
            let entry = stats.per_target.entry(target.clone()).or_default();
            entry.responses += 1;
            entry.total_duration_ms += duration_ms;
            entry.rows += rows;
            if *is_error {
                entry.errors += 1;
            }
        }
    }

    pub fn stats(&self) -> DiffStats {
        self.stats.lock().unwrap().clone()
    }
}

struct MachineState {
    state: DiffState,
    sync: SyncState,
    pending_stop: bool,
    /// Set once the service graph points at the comparator.
    rewired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplOutcome {
    CaughtUpAndStopped,
    Behind,
    Failed(String),
}

/// The comparator router: binds a service to a main server and one other
/// server, forwards every client packet to all of them and reports
/// divergences. Admin state transitions are serialised on the admin
/// thread; worker interaction goes through the pool's broadcast
/// primitives.
pub struct DiffRouter {
    shared: Arc<DiffShared>,
    pool: Arc<WorkerPool>,
    /// The original service whose traffic is being compared.
    service: Arc<Service>,
    main: Arc<Server>,
    other: Arc<Server>,
    /// The sibling service wrapping {main, other} under this router.
    comparator: RwLock<Option<Arc<Service>>>,
    machine: Mutex<MachineState>,
    saved_targets: Mutex<Option<Vec<Target>>>,
    repl_probe: Mutex<Option<Arc<OnceLock<ReplOutcome>>>>,
    ticker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DiffRouter {
    pub fn new(
        settings: DiffSettings,
        pool: Arc<WorkerPool>,
        service: Arc<Service>,
        main: Arc<Server>,
        other: Arc<Server>,
    ) -> Result<Arc<DiffRouter>> {
        let shared = DiffShared::new(settings)?;
        Ok(Arc::new(DiffRouter {
            shared,
            pool,
            service,
            main,
            other,
            comparator: RwLock::new(None),
            machine: Mutex::new(MachineState {
                state: DiffState::Prepared,
                sync: SyncState::Idle,
                pending_stop: false,
                rewired: false,
            }),
            saved_targets: Mutex::new(None),
            repl_probe: Mutex::new(None),
            ticker: Mutex::new(None),
        }))
    }

    /// Called once by `prepare` after the comparator service wrapping this
    /// router has been created.
    pub fn attach_comparator(&self, comparator: Arc<Service>) {
        *self.comparator.write().unwrap() = Some(comparator);
    }

    pub fn shared(&self) -> &Arc<DiffShared> {
        &self.shared
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    pub fn state(&self) -> DiffState {
        self.machine.lock().unwrap().state
    }

    /// `start`: prepared -> synchronizing -> capturing. The synchronizing
    /// phase runs under a one-second tick until every sub-state's
    /// precondition holds.
    pub fn start(self: Arc<Self>) -> Result<serde_json::Value> {
        {
            let mut machine = self.machine.lock().unwrap();
            if machine.state != DiffState::Prepared {
                return Err(ProxyError::Admin(format!(
                    "state of '{}' is '{}'; it can be started only when '{}'",
                    self.service.name(),
                    machine.state.as_ref(),
                    DiffState::Prepared.as_ref()
                )));
            }
            machine.state = DiffState::Synchronizing;
            machine.sync = SyncState::Suspending;
            machine.pending_stop = false;
        }

        let router = Arc::clone(&self);
        let ticker = std::thread::Builder::new()
            .name("diff-sync".to_string())
            .spawn(move || {
                while router.synchronize() {
                    std::thread::sleep(Duration::from_millis(1000));
                }
            })
            .map_err(|e| ProxyError::Admin(format!("cannot start sync ticker: {e}")))?;
        *self.ticker.lock().unwrap() = Some(ticker);

        Ok(self.status())
    }

    pub fn status(&self) -> serde_json::Value {
        let machine = self.machine.lock().unwrap();
        let sr = self.pool.suspended_sessions(self.service.name());
        let mut out = json!({
            "state": machine.state.as_ref(),
            "sessions": { "total": sr.total, "suspended": sr.affected },
        });
        if machine.state == DiffState::Synchronizing {
            out["sync_state"] = json!(machine.sync.as_ref());
        }
        out
    }

    /// `stop` while synchronizing flags the machine and the next tick
    /// unwinds; while capturing it unwinds synchronously.
    pub fn stop(&self) -> Result<serde_json::Value> {
        let state = {
            let machine = self.machine.lock().unwrap();
            machine.state
        };
        match state {
            DiffState::Prepared => Err(ProxyError::Admin(format!(
                "the state of '{}' is '{}' and hence it cannot be stopped",
                self.service.name(),
                state.as_ref()
            ))),
            DiffState::Synchronizing => {
                self.machine.lock().unwrap().pending_stop = true;
                Ok(self.status())
            }
            DiffState::Capturing => {
                self.unwind();
                Ok(self.status())
            }
        }
    }

    pub fn summary(&self) -> serde_json::Value {
        let stats = self.shared.stats();
        let per_target: serde_json::Map<String, serde_json::Value> = stats
            .per_target
            .iter()
            .map(|(target, t)| {
                (
                    target.clone(),
                    json!({
                        "responses": t.responses,
                        "errors": t.errors,
                        "rows": t.rows,
                        "avg_duration_ms": if t.responses > 0 {
                            t.total_duration_ms / t.responses
                        } else {
                            0
                        },
                    }),
                )
            })
            .collect();
        json!({
            "service": self.service.name(),
            "rounds": stats.rounds,
            "conflicts": stats.conflicts,
            "targets": per_target,
        })
    }

    /// One synchronization tick. Returns whether the ticker should fire
    /// again.
    fn synchronize(&self) -> bool {
        if self.machine.lock().unwrap().pending_stop {
            info!("'{}': stop requested during synchronization", self.service.name());
            self.unwind();
            return false;
        }

        let sync = {
            let machine = self.machine.lock().unwrap();
            if machine.state != DiffState::Synchronizing {
                return false;
            }
            machine.sync
        };

        match sync {
            SyncState::Idle => false,
            SyncState::Suspending => {
                self.sync_suspend();
                true
            }
            SyncState::Rewiring => {
                self.sync_rewire();
                true
            }
            SyncState::StoppingReplication => {
                self.sync_stop_replication();
                true
            }
            SyncState::RestartingAndResuming => {
                self.sync_restart_and_resume();
                // Terminal: capturing reached or unwound.
                false
            }
        }
    }

    fn sync_suspend(&self) {
        let sr = self.pool.suspend_sessions(self.service.name());
        if sr.all_affected() {
            let mut machine = self.machine.lock().unwrap();
            machine.sync = SyncState::Rewiring;
        }
    }

    fn sync_rewire(&self) {
        let comparator = self.comparator.read().unwrap().clone();
        let Some(comparator) = comparator else {
            error!("'{}': no comparator service attached", self.service.name());
            self.fail_back_to_prepared();
            return;
        };
        let saved = self.service.targets();
        self.service.set_targets(vec![Target::Service(comparator)]);
        *self.saved_targets.lock().unwrap() = Some(saved);
        let mut machine = self.machine.lock().unwrap();
        machine.rewired = true;
        machine.sync = SyncState::StoppingReplication;
    }

    /// Verify the other server has caught up to the main's gtid positions,
    /// then break replication on it. The SQL runs on its own thread; the
    /// tick polls the outcome.
    fn sync_stop_replication(&self) {
        let mut probe_guard = self.repl_probe.lock().unwrap();
        if let Some(probe) = probe_guard.as_ref() {
            match probe.get() {
                None => {} // still running
                Some(ReplOutcome::CaughtUpAndStopped) => {
                    *probe_guard = None;
                    drop(probe_guard);
                    let mut machine = self.machine.lock().unwrap();
                    machine.sync = SyncState::RestartingAndResuming;
                }
                Some(ReplOutcome::Behind) => {
                    info!(
                        "'{}' is behind '{}', not breaking replication yet",
                        self.other.name(),
                        self.main.name()
                    );
                    *probe_guard = None;
                }
                Some(ReplOutcome::Failed(message)) => {
                    error!("stopping replication failed: {message}");
                    *probe_guard = None;
                    drop(probe_guard);
                    self.fail_back_to_prepared();
                }
            }
            return;
        }

        let probe = Arc::new(OnceLock::new());
        *probe_guard = Some(Arc::clone(&probe));
        drop(probe_guard);

        let main_addr = (self.main.address().to_string(), self.main.port());
        let other_addr = (self.other.address().to_string(), self.other.port());
        let user = self.service.user.clone();
        let password = self.service.password.clone();
        std::thread::spawn(move || {
            let outcome = probe_replication(&main_addr, &other_addr, &user, &password);
            let _ = probe.set(outcome);
        });
    }

    fn sync_restart_and_resume(&self) {
        let sr = self.pool.restart_sessions(self.service.name());
        if !sr.all_affected() {
            warn!(
                "could only restart {} out of {} sessions of service '{}'",
                sr.affected,
                sr.total,
                self.service.name()
            );
        }
        let sr = self.pool.resume_sessions(self.service.name());
        if !sr.all_affected() {
            warn!(
                "{} sessions of a total of {} of service '{}' were not suspended when resumed",
                sr.total - sr.affected,
                sr.total,
                self.service.name()
            );
        }
        let mut machine = self.machine.lock().unwrap();
        machine.sync = SyncState::Idle;
        machine.state = DiffState::Capturing;
        info!("'{}': capturing", self.service.name());
    }

    fn fail_back_to_prepared(&self) {
        self.unwind();
    }

    /// Return to `prepared`: restore the original target graph if it was
    /// rewired, then restart and resume every suspended session. Leaves no
    /// orphan wiring behind.
    fn unwind(&self) {
        let rewired = {
            let machine = self.machine.lock().unwrap();
            machine.rewired
        };
        if rewired {
            if let Some(saved) = self.saved_targets.lock().unwrap().take() {
                self.service.set_targets(saved);
            }
            self.pool.restart_sessions(self.service.name());
        }
        self.pool.resume_sessions(self.service.name());
        let mut machine = self.machine.lock().unwrap();
        machine.state = DiffState::Prepared;
        machine.sync = SyncState::Idle;
        machine.pending_stop = false;
        machine.rewired = false;
    }
}

#[async_trait]
impl Router for DiffRouter {
    fn module(&self) -> &str {
        DIFF_MODULE
    }

    async fn new_session(
        &self,
        info: &SessionInfo,
        backends: Vec<Backend>,
    ) -> Result<Box<dyn RouterSession>> {
        let main = self.shared.settings().main;
        if !backends.iter().any(|b| b.target() == main) {
            return Err(ProxyError::Config(format!(
                "main target '{main}' is not among the connected backends"
            )));
        }
        Ok(Box::new(DiffRouterSession::new(
            info.id,
            Arc::clone(&self.shared),
            backends,
        )))
    }

    fn capabilities(&self) -> RouterCaps {
        // Suspension bookkeeping assumes a stable worker set.
        RouterCaps::NO_THREAD_CHANGE
    }

    fn diagnostics(&self) -> serde_json::Value {
        self.summary()
    }
}

/// Comparison kinds put different status requirements on the pair: a
/// read-only comparison needs a live replica, a read-write one a primary
/// main.
pub fn check_comparison_requirements(
    kind: ComparisonKind,
    main: &Server,
    other: &Server,
) -> Result<()> {
    match kind {
        ComparisonKind::ReadOnly => {
            if !other.is_slave() {
                return Err(ProxyError::Admin(format!(
                    "'{}' must be a replica for a read_only comparison",
                    other.name()
                )));
            }
        }
        ComparisonKind::ReadWrite => {
            if !main.is_master() {
                return Err(ProxyError::Admin(format!(
                    "'{}' must be the primary for a read_write comparison",
                    main.name()
                )));
            }
        }
    }
    Ok(())
}

fn probe_replication(
    main_addr: &(String, u16),
    other_addr: &(String, u16),
    user: &str,
    password: &str,
) -> ReplOutcome {
    let connect = |(host, port): &(String, u16)| {
        let opts = mysql::OptsBuilder::new()
            .ip_or_hostname(Some(host.clone()))
            .tcp_port(*port)
            .user(Some(user))
            .pass(Some(password));
        mysql::Conn::new(opts)
    };

    let gtid_of = |conn: &mut mysql::Conn| -> std::result::Result<HashMap<u32, u64>, mysql::Error> {
        let pos: Option<String> = conn.query_first("SELECT @@gtid_current_pos")?;
        Ok(parse_gtid_position_list(&pos.unwrap_or_default()))
    };

    let mut main_conn = match connect(main_addr) {
        Ok(conn) => conn,
        Err(e) => return ReplOutcome::Failed(format!("cannot reach main: {e}")),
    };
    let mut other_conn = match connect(other_addr) {
        Ok(conn) => conn,
        Err(e) => return ReplOutcome::Failed(format!("cannot reach other: {e}")),
    };

    let from = match gtid_of(&mut main_conn) {
        Ok(positions) => positions,
        Err(e) => return ReplOutcome::Failed(format!("gtid query on main failed: {e}")),
    };
    let to = match gtid_of(&mut other_conn) {
        Ok(positions) => positions,
        Err(e) => return ReplOutcome::Failed(format!("gtid query on other failed: {e}")),
    };

    for (domain, position) in &from {
        match to.get(domain) {
            Some(p) if p >= position => {}
            _ => return ReplOutcome::Behind,
        }
    }

    match other_conn.query_drop("STOP ALL SLAVES") {
        Ok(()) => ReplOutcome::CaughtUpAndStopped,
        Err(e) => ReplOutcome::Failed(format!("STOP ALL SLAVES failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerStatus;

    fn router_fixture() -> (Arc<DiffRouter>, Arc<Service>, Arc<Server>, Arc<Server>) {
        let pool = WorkerPool::new(2);
        let main = Arc::new(Server::new("main", "127.0.0.1", 33061));
        let other = Arc::new(Server::new("other", "127.0.0.1", 33062));
        let settings = DiffSettings {
            main: "main".to_string(),
            ..DiffSettings::default()
        };
        // A placeholder router is enough: the original service never
        // routes during these tests.
        let service = Service::new(
            "svc",
            Arc::new(PlaceholderRouter),
            Vec::new(),
            vec![Target::Server(Arc::clone(&main))],
            "u",
            "p",
        );
        let router =
            DiffRouter::new(settings, pool, Arc::clone(&service), Arc::clone(&main), Arc::clone(&other))
                .unwrap();
        let comparator = Service::new(
            "Comparatorsvc",
            Arc::new(PlaceholderRouter),
            Vec::new(),
            vec![Target::Server(Arc::clone(&main)), Target::Server(Arc::clone(&other))],
            "u",
            "p",
        );
        router.attach_comparator(comparator);
        (router, service, main, other)
    }

    struct PlaceholderRouter;

    #[async_trait]
    impl Router for PlaceholderRouter {
        fn module(&self) -> &str {
            "placeholder"
        }

        async fn new_session(
            &self,
            _info: &SessionInfo,
            _backends: Vec<Backend>,
        ) -> Result<Box<dyn RouterSession>> {
            Err(ProxyError::Config("no sessions in tests".into()))
        }
    }

    #[test]
    fn start_requires_prepared() {
        let (router, _service, _main, _other) = router_fixture();
        assert_eq!(router.state(), DiffState::Prepared);
        // Drive the machine by hand instead of through the ticker thread.
        router.machine.lock().unwrap().state = DiffState::Capturing;
        assert!(Arc::clone(&router).start().is_err());
    }

    #[test]
    fn suspend_rewire_then_stop_unwinds_cleanly() {
        let (router, service, _main, _other) = router_fixture();
        router.machine.lock().unwrap().state = DiffState::Synchronizing;
        router.machine.lock().unwrap().sync = SyncState::Suspending;

        // No sessions exist, so suspension trivially completes.
        assert!(router.synchronize());
        assert_eq!(router.machine.lock().unwrap().sync, SyncState::Rewiring);
        assert!(router.synchronize());
        assert_eq!(
            router.machine.lock().unwrap().sync,
            SyncState::StoppingReplication
        );
        // The service now routes through the comparator.
        assert_eq!(service.routing_service().name(), "Comparatorsvc");

        // A stop request during synchronization unwinds at the next tick
        // and restores the original wiring.
        router.machine.lock().unwrap().pending_stop = true;
        assert!(!router.synchronize());
        assert_eq!(router.state(), DiffState::Prepared);
        assert_eq!(service.routing_service().name(), "svc");
        assert!(router.saved_targets.lock().unwrap().is_none());
    }

    #[test]
    fn status_reports_sync_state() {
        let (router, _service, _main, _other) = router_fixture();
        {
            let mut machine = router.machine.lock().unwrap();
            machine.state = DiffState::Synchronizing;
            machine.sync = SyncState::Suspending;
        }
        let status = router.status();
        assert_eq!(status["state"], "synchronizing");
        assert_eq!(status["sync_state"], "suspending");
        assert_eq!(status["sessions"]["total"], 0);
    }

    #[test]
    fn comparison_requirements() {
        let main = Server::new("main", "10.0.0.1", 3306);
        let other = Server::new("other", "10.0.0.2", 3306);
        main.monitor_set_status(ServerStatus::RUNNING | ServerStatus::MASTER);
        other.monitor_set_status(ServerStatus::RUNNING);

        assert!(check_comparison_requirements(ComparisonKind::ReadOnly, &main, &other).is_err());
        other.monitor_set_status(ServerStatus::RUNNING | ServerStatus::SLAVE);
        assert!(check_comparison_requirements(ComparisonKind::ReadOnly, &main, &other).is_ok());
        assert!(check_comparison_requirements(ComparisonKind::ReadWrite, &main, &other).is_ok());
    }
}
