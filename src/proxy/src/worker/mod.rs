use crate::service::Service;
use crate::session::{Session, SessionControl, SessionHandle, SessionInfo, SessionOutcome};
use dashmap::DashMap;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of a pool-wide session operation: how many sessions the target
/// service has in total and how many the operation affected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionResult {
    pub total: u64,
    pub affected: u64,
}

impl SessionResult {
    pub fn all_affected(&self) -> bool {
        self.total == self.affected
    }
}

/// Work delivered to a routing worker's event loop.
pub enum WorkerMessage {
    /// Run a closure against the worker's state.
    Task(Box<dyn FnOnce(&mut WorkerState) + Send>),
    /// Accept a fresh client connection: create and run a session.
    NewConnection {
        stream: std::net::TcpStream,
        service: Arc<Service>,
        info: SessionInfo,
    },
    /// Adopt a session migrating in from another worker.
    AdoptSession(Box<Session>),
    /// Start a recurring timer; the closure cancels itself by returning
    /// false.
    StartTimer {
        period: Duration,
        tick: Box<dyn FnMut(&mut WorkerState) -> bool + Send>,
    },
    Shutdown,
}

/// The state a routing worker owns: its sessions. Only ever touched from
/// the worker's own thread.
pub struct WorkerState {
    pub index: usize,
    pub sessions: HashMap<u64, SessionHandle>,
    shared: Arc<PoolShared>,
}

impl WorkerState {
    /// Sessions belonging to one service.
    pub fn sessions_of<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a SessionHandle> + 'a {
        self.sessions.values().filter(move |s| s.service == service)
    }
}

struct WorkerHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
    thread: Option<std::thread::JoinHandle<()>>,
}

struct PoolShared {
    /// session id -> owning worker index.
    session_index: DashMap<u64, usize>,
    next_session_id: AtomicU64,
    /// live sessions per worker, for placement and rebalancing.
    loads: RwLock<Vec<Arc<AtomicI64>>>,
    /// Mirror of the worker senders so a session finishing with a
    /// migration outcome can hand itself to its target worker.
    senders: RwLock<Vec<mpsc::UnboundedSender<WorkerMessage>>>,
    /// > 0 while some service forbids thread-count changes.
    thread_change_vetoes: AtomicI64,
}

impl PoolShared {
    fn send_to(&self, index: usize, message: WorkerMessage) -> bool {
        let senders = self.senders.read().unwrap();
        match senders.get(index) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
}

/// N identical event-loop workers. Every session is pinned to exactly one
/// worker for its lifetime; backend sockets opened on behalf of a session
/// belong to the same worker. Blocking work must go through
/// `spawn_blocking`, never into a worker closure.
pub struct WorkerPool {
    workers: RwLock<Vec<WorkerHandle>>,
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Arc<WorkerPool> {
        let shared = Arc::new(PoolShared {
            session_index: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            loads: RwLock::new(Vec::new()),
            senders: RwLock::new(Vec::new()),
            thread_change_vetoes: AtomicI64::new(0),
        });
        let pool = Arc::new(WorkerPool {
            workers: RwLock::new(Vec::new()),
            shared,
        });
        for _ in 0..threads.max(1) {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&self) {
        let mut workers = self.workers.write().unwrap();
        let index = workers.len();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let load = Arc::new(AtomicI64::new(0));
        shared.loads.write().unwrap().push(Arc::clone(&load));
        shared.senders.write().unwrap().push(tx.clone());
        let thread = std::thread::Builder::new()
            .name(format!("routing-worker-{index}"))
            .spawn(move || worker_main(index, rx, shared, load))
            .expect("spawning a routing worker cannot fail");
        workers.push(WorkerHandle {
            sender: tx,
            thread: Some(thread),
        });
        info!("routing worker {index} started");
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().unwrap().len()
    }

    pub fn next_session_id(&self) -> u64 {
        self.shared.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Services whose router advertises NO_THREAD_CHANGE hold a veto for
    /// their lifetime.
    pub fn add_thread_change_veto(&self) {
        self.shared.thread_change_vetoes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_thread_change_veto(&self) {
        self.shared.thread_change_vetoes.fetch_sub(1, Ordering::SeqCst);
    }

    /// Place a new client connection on the least-loaded worker.
    pub fn assign_connection(
        &self,
        stream: std::net::TcpStream,
        service: Arc<Service>,
        info: SessionInfo,
    ) -> bool {
        let index = self.least_loaded_worker();
        self.shared.session_index.insert(info.id, index);
        self.send_to(
            index,
            WorkerMessage::NewConnection {
                stream,
                service,
                info,
            },
        )
    }

    fn least_loaded_worker(&self) -> usize {
        let loads = self.shared.loads.read().unwrap();
        let workers = self.workers.read().unwrap();
        (0..workers.len())
            .min_by_key(|&i| loads[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn send_to(&self, index: usize, message: WorkerMessage) -> bool {
        let workers = self.workers.read().unwrap();
        match workers.get(index) {
            Some(worker) => worker.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Enqueue a closure on every worker; optionally wait for all of them
    /// to finish running it.
    pub fn broadcast<F>(&self, f: F, wait: bool)
    where
        F: Fn(&mut WorkerState) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        let count = {
            let workers = self.workers.read().unwrap();
            for worker in workers.iter() {
                let f = Arc::clone(&f);
                let ack = ack_tx.clone();
                let _ = worker.sender.send(WorkerMessage::Task(Box::new(move |state| {
                    f(state);
                    let _ = ack.send(());
                })));
            }
            workers.len()
        };
        if wait {
            for _ in 0..count {
                let _ = ack_rx.recv_timeout(Duration::from_secs(10));
            }
        }
    }

    /// Find the worker owning session `id` and run `f` against its handle.
    /// Returns whether the session existed.
    pub fn execute_for_session<F>(&self, id: u64, f: F) -> bool
    where
        F: FnOnce(&mut SessionHandle) + Send + 'static,
    {
        let Some(index) = self.shared.session_index.get(&id).map(|e| *e) else {
            return false;
        };
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        let sent = self.send_to(
            index,
            WorkerMessage::Task(Box::new(move |state| {
                let found = match state.sessions.get_mut(&id) {
                    Some(handle) => {
                        f(handle);
                        true
                    }
                    None => false,
                };
                let _ = ack_tx.send(found);
            })),
        );
        if !sent {
            return false;
        }
        ack_rx
            .recv_timeout(Duration::from_secs(10))
            .unwrap_or(false)
    }

    fn session_op(
        &self,
        service: &str,
        op: impl Fn(&SessionHandle) -> bool + Send + Sync + 'static,
    ) -> SessionResult {
        let service = service.to_string();
        let result = Arc::new(Mutex::new(SessionResult::default()));
        let result_clone = Arc::clone(&result);
        self.broadcast(
            move |state| {
                let mut local = SessionResult::default();
                for handle in state.sessions_of(&service) {
                    local.total += 1;
                    if op(handle) {
                        local.affected += 1;
                    }
                }
                let mut acc = result_clone.lock().unwrap();
                acc.total += local.total;
                acc.affected += local.affected;
            },
            true,
        );
        let r = *result.lock().unwrap();
        r
    }

    /// Ask every session of `service` to pause reading client input.
    /// `affected` counts the sessions that have actually parked; the caller
    /// re-invokes under its tick until all are suspended.
    pub fn suspend_sessions(&self, service: &str) -> SessionResult {
        self.session_op(service, |handle| {
            let _ = handle.control_tx.send(SessionControl::Suspend);
            handle.suspended.load(Ordering::Relaxed)
        })
    }

    pub fn resume_sessions(&self, service: &str) -> SessionResult {
        self.session_op(service, |handle| {
            let was = handle.suspended.load(Ordering::Relaxed);
            let _ = handle.control_tx.send(SessionControl::Resume);
            was
        })
    }

    /// Rebuild each session's backend set and router session, picking up a
    /// rewired service graph.
    pub fn restart_sessions(&self, service: &str) -> SessionResult {
        self.session_op(service, |handle| {
            handle.control_tx.send(SessionControl::Restart).is_ok()
        })
    }

    pub fn suspended_sessions(&self, service: &str) -> SessionResult {
        self.session_op(service, |handle| handle.suspended.load(Ordering::Relaxed))
    }

    /// Grow or shrink the pool. Shrinking is refused while any service
    /// vetoes thread changes or the victim workers still own sessions.
    pub fn adjust_threads(&self, target: usize) -> Result<(), String> {
        if target == 0 {
            return Err("thread count must be at least 1".to_string());
        }
        let current = self.worker_count();
        if target == current {
            return Ok(());
        }
        if target > current {
            for _ in current..target {
                self.spawn_worker();
            }
            return Ok(());
        }
        if self.shared.thread_change_vetoes.load(Ordering::SeqCst) > 0 {
            return Err("a service with active sessions forbids thread-count changes".to_string());
        }
        {
            let loads = self.shared.loads.read().unwrap();
            for index in target..current {
                if loads[index].load(Ordering::Relaxed) > 0 {
                    return Err(format!(
                        "worker {index} still owns sessions; drain before shrinking"
                    ));
                }
            }
        }
        let mut workers = self.workers.write().unwrap();
        self.shared.senders.write().unwrap().truncate(target);
        for mut worker in workers.drain(target..) {
            let _ = worker.sender.send(WorkerMessage::Shutdown);
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        self.shared.loads.write().unwrap().truncate(target);
        Ok(())
    }

    /// One load-based migration pass: move sessions from the busiest to
    /// the idlest worker when the imbalance exceeds `threshold` sessions.
    /// Migration happens cooperatively at each session's next statement
    /// boundary.
    pub fn rebalance_once(&self, threshold: i64) -> u64 {
        let (busiest, idlest, diff) = {
            let loads = self.shared.loads.read().unwrap();
            if loads.len() < 2 {
                return 0;
            }
            let mut max = (0, i64::MIN);
            let mut min = (0, i64::MAX);
            for (i, load) in loads.iter().enumerate() {
                let l = load.load(Ordering::Relaxed);
                if l > max.1 {
                    max = (i, l);
                }
                if l < min.1 {
                    min = (i, l);
                }
            }
            (max.0, min.0, max.1 - min.1)
        };
        if diff <= threshold {
            return 0;
        }
        let to_move = (diff / 2).max(1) as usize;
        let moved = Arc::new(AtomicU64::new(0));
        let moved_clone = Arc::clone(&moved);
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        let sent = self.send_to(
            busiest,
            WorkerMessage::Task(Box::new(move |state| {
                for handle in state.sessions.values().take(to_move) {
                    if handle
                        .control_tx
                        .send(SessionControl::Migrate(idlest))
                        .is_ok()
                    {
                        moved_clone.fetch_add(1, Ordering::Relaxed);
                    }
                }
                let _ = ack_tx.send(());
            })),
        );
        if sent {
            let _ = ack_rx.recv_timeout(Duration::from_secs(10));
        }
        let n = moved.load(Ordering::Relaxed);
        if n > 0 {
            debug!("rebalance: asked {n} sessions to move from worker {busiest} to {idlest}");
        }
        n
    }

    /// Periodic load-based migration driven by `rebalance_period` and
    /// `rebalance_threshold`. The thread holds only a weak reference, so
    /// dropping the pool also retires the rebalancer.
    pub fn start_rebalance(self: Arc<Self>, period: Duration, threshold: i64) {
        let weak = Arc::downgrade(&self);
        drop(self);
        std::thread::Builder::new()
            .name("pool-rebalance".to_string())
            .spawn(move || loop {
                std::thread::sleep(period);
                match weak.upgrade() {
                    Some(pool) => {
                        pool.rebalance_once(threshold);
                    }
                    None => break,
                }
            })
            .expect("spawning the rebalance thread cannot fail");
    }

    /// Start a recurring timer on one worker. The closure cancels the
    /// timer by returning false.
    pub fn start_timer<F>(&self, worker: usize, period: Duration, tick: F) -> bool
    where
        F: FnMut(&mut WorkerState) -> bool + Send + 'static,
    {
        self.send_to(
            worker,
            WorkerMessage::StartTimer {
                period,
                tick: Box::new(tick),
            },
        )
    }

    pub fn shutdown(&self) {
        let mut workers = self.workers.write().unwrap();
        self.shared.senders.write().unwrap().clear();
        for worker in workers.iter() {
            let _ = worker.sender.send(WorkerMessage::Shutdown);
        }
        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        workers.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    shared: Arc<PoolShared>,
    load: Arc<AtomicI64>,
) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building the worker runtime cannot fail");
    let local = tokio::task::LocalSet::new();
    let state = Rc::new(RefCell::new(WorkerState {
        index,
        sessions: HashMap::new(),
        shared: Arc::clone(&shared),
    }));

    local.block_on(&runtime, async move {
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Task(f) => {
                    f(&mut state.borrow_mut());
                }
                WorkerMessage::NewConnection {
                    stream,
                    service,
                    info,
                } => {
                    let state = Rc::clone(&state);
                    let load = Arc::clone(&load);
                    let shared = Arc::clone(&shared);
                    tokio::task::spawn_local(async move {
                        let id = info.id;
                        let stream = match into_tokio_stream(stream) {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!("worker {index}: cannot adopt client socket: {e}");
                                shared.session_index.remove(&id);
                                service.release_session();
                                return;
                            }
                        };
                        let (read_half, write_half) = stream.into_split();
                        match Session::create(
                            info,
                            Arc::clone(&service),
                            Box::new(read_half),
                            Box::new(write_half),
                        )
                        .await
                        {
                            Ok((session, handle)) => {
                                state.borrow_mut().sessions.insert(id, handle);
                                load.fetch_add(1, Ordering::Relaxed);
                                drive_session(session, state, shared, load, index).await;
                            }
                            Err(e) => {
                                warn!("worker {index}: session setup failed: {e}");
                                shared.session_index.remove(&id);
                                service.release_session();
                            }
                        }
                    });
                }
                WorkerMessage::AdoptSession(session) => {
                    let state = Rc::clone(&state);
                    let load = Arc::clone(&load);
                    let shared = Arc::clone(&shared);
                    tokio::task::spawn_local(async move {
                        let id = session.info.id;
                        let handle = session.handle();
                        state.borrow_mut().sessions.insert(id, handle);
                        shared.session_index.insert(id, index);
                        load.fetch_add(1, Ordering::Relaxed);
                        drive_session(*session, state, shared, load, index).await;
                    });
                }
                WorkerMessage::StartTimer { period, mut tick } => {
                    let state = Rc::clone(&state);
                    tokio::task::spawn_local(async move {
                        let mut interval = tokio::time::interval(period);
                        interval.set_missed_tick_behavior(
                            tokio::time::MissedTickBehavior::Delay,
                        );
                        loop {
                            interval.tick().await;
                            if !tick(&mut state.borrow_mut()) {
                                break;
                            }
                        }
                    });
                }
                WorkerMessage::Shutdown => break,
            }
        }
        debug!("routing worker {index} stopped");
    });
}

async fn drive_session(
    session: Session,
    state: Rc<RefCell<WorkerState>>,
    shared: Arc<PoolShared>,
    load: Arc<AtomicI64>,
    index: usize,
) {
    let id = session.info.id;
    let outcome = session.run().await;
    state.borrow_mut().sessions.remove(&id);
    load.fetch_sub(1, Ordering::Relaxed);
    match outcome {
        SessionOutcome::Closed => {
            shared.session_index.remove(&id);
        }
        SessionOutcome::Migrate(session, target) => {
            debug!("session {id} migrating from worker {index} to {target}");
            shared.session_index.remove(&id);
            if !shared.send_to(target, WorkerMessage::AdoptSession(session)) {
                warn!("session {id}: migration target {target} is gone, session dropped");
            }
        }
    }
}

fn into_tokio_stream(stream: std::net::TcpStream) -> std::io::Result<tokio::net::TcpStream> {
    stream.set_nonblocking(true)?;
    tokio::net::TcpStream::from_std(stream)
}
