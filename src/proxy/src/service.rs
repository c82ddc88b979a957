use crate::server::Server;
use crate::session::backend::{Backend, BackendReply};
use crate::session::filter::{Filter, FilterSession};
use crate::session::router::Router;
use crate::session::SessionInfo;
use crate::{ProxyError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::warn;

/// Anything a service may route to: a server or another service.
#[derive(Clone)]
pub enum Target {
    Server(Arc<Server>),
    Service(Arc<Service>),
}

impl Target {
    pub fn name(&self) -> String {
        match self {
            Target::Server(s) => s.name().to_string(),
            Target::Service(s) => s.name().to_string(),
        }
    }
}

/// A named binding of a router, a filter chain and a set of targets.
/// Exclusively owns its router instance and filter definitions; listeners
/// and sessions reference it by `Arc`.
pub struct Service {
    name: String,
    router: Arc<dyn Router>,
    filters: Vec<Arc<dyn Filter>>,
    targets: RwLock<Vec<Target>>,
    pub user: String,
    pub password: String,
    max_connections: AtomicU64,
    /// Idle sessions are closed after this many milliseconds; 0 disables.
    conn_idle_timeout_ms: AtomicU64,
    active_sessions: AtomicU64,
}

impl Service {
    pub fn new(
        name: &str,
        router: Arc<dyn Router>,
        filters: Vec<Arc<dyn Filter>>,
        targets: Vec<Target>,
        user: &str,
        password: &str,
    ) -> Arc<Service> {
        Arc::new(Service {
            name: name.to_string(),
            router,
            filters,
            targets: RwLock::new(targets),
            user: user.to_string(),
            password: password.to_string(),
            max_connections: AtomicU64::new(0),
            conn_idle_timeout_ms: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
        })
    }

    /// A limit of 0 is unlimited. Runtime-modifiable.
    pub fn set_max_connections(&self, max_connections: u64) {
        self.max_connections.store(max_connections, Ordering::Relaxed);
    }

    pub fn set_conn_idle_timeout(&self, timeout: std::time::Duration) {
        self.conn_idle_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn conn_idle_timeout(&self) -> Option<std::time::Duration> {
        match self.conn_idle_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(std::time::Duration::from_millis(ms)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> Arc<dyn Router> {
        Arc::clone(&self.router)
    }

    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    pub fn targets(&self) -> Vec<Target> {
        self.targets.read().unwrap().clone()
    }

    /// Swap the downstream binding; restarted sessions pick the new graph
    /// up on their next rebuild.
    pub fn set_targets(&self, targets: Vec<Target>) {
        *self.targets.write().unwrap() = targets;
    }

    /// Server targets reachable through this service, following nested
    /// services.
    pub fn reachable_servers(&self) -> Vec<Arc<Server>> {
        let mut servers = Vec::new();
        for target in self.targets() {
            match target {
                Target::Server(server) => servers.push(server),
                Target::Service(service) => servers.extend(service.reachable_servers()),
            }
        }
        servers
    }

    /// The service whose router actually handles statements: follows a
    /// single service-target chain (the comparator rewiring pattern).
    pub fn routing_service(self: &Arc<Self>) -> Arc<Service> {
        let targets = self.targets();
        if targets.len() == 1 {
            if let Target::Service(inner) = &targets[0] {
                return inner.routing_service();
            }
        }
        Arc::clone(self)
    }

    pub fn new_filter_sessions(&self, info: &SessionInfo) -> Vec<Box<dyn FilterSession>> {
        self.filters.iter().map(|f| f.new_session(info)).collect()
    }

    /// Open one backend connection per reachable server of the routing
    /// service. Unreachable servers are skipped with a warning; no
    /// connectable server at all is an error.
    pub async fn connect_backends(
        self: &Arc<Self>,
        reply_tx: mpsc::UnboundedSender<BackendReply>,
    ) -> Result<Vec<Backend>> {
        let routing = self.routing_service();
        let mut backends = Vec::new();
        for server in routing.reachable_servers() {
            if !server.is_running() {
                warn!(
                    "service '{}': server '{}' is not running, skipping",
                    self.name,
                    server.name()
                );
                continue;
            }
            match Backend::connect(server.name(), &server.addr(), reply_tx.clone()).await {
                Ok(backend) => backends.push(backend),
                Err(e) => warn!(
                    "service '{}': cannot connect to '{}' at {}: {e}",
                    self.name,
                    server.name(),
                    server.addr()
                ),
            }
        }
        if backends.is_empty() {
            return Err(ProxyError::Config(format!(
                "service '{}' has no connectable backend",
                self.name
            )));
        }
        Ok(backends)
    }

    /// Admission check on client accept; max_connections of 0 is
    /// unlimited.
    pub fn try_admit_session(&self) -> Result<()> {
        let limit = self.max_connections.load(Ordering::Relaxed);
        let active = self.active_sessions.fetch_add(1, Ordering::SeqCst);
        if limit > 0 && active >= limit {
            self.active_sessions.fetch_sub(1, Ordering::SeqCst);
            return Err(ProxyError::Admin(format!(
                "service '{}' has reached max_connections ({limit})",
                self.name
            )));
        }
        Ok(())
    }

    pub fn release_session(&self) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::backend::Backend;
    use crate::session::router::{Router, RouterSession};
    use async_trait::async_trait;

    struct NullRouter;

    #[async_trait]
    impl Router for NullRouter {
        fn module(&self) -> &str {
            "null"
        }

        async fn new_session(
            &self,
            _info: &SessionInfo,
            _backends: Vec<Backend>,
        ) -> Result<Box<dyn RouterSession>> {
            Err(ProxyError::Config("null router has no sessions".into()))
        }
    }

    fn service_with(name: &str, targets: Vec<Target>) -> Arc<Service> {
        Service::new(name, Arc::new(NullRouter), Vec::new(), targets, "u", "p")
    }

    #[test]
    fn routing_service_follows_service_chain() {
        let s1 = Arc::new(Server::new("s1", "10.0.0.1", 3306));
        let inner = service_with("comparator", vec![Target::Server(Arc::clone(&s1))]);
        let outer = service_with("svc", vec![Target::Service(Arc::clone(&inner))]);

        assert_eq!(outer.routing_service().name(), "comparator");
        assert_eq!(outer.reachable_servers()[0].name(), "s1");

        // Rewire back to the server directly.
        outer.set_targets(vec![Target::Server(s1)]);
        assert_eq!(outer.routing_service().name(), "svc");
    }

    #[test]
    fn max_connections_admission() {
        let service = service_with("svc", Vec::new());
        service.set_max_connections(2);
        service.try_admit_session().unwrap();
        service.try_admit_session().unwrap();
        assert!(service.try_admit_session().is_err());
        service.release_session();
        service.try_admit_session().unwrap();
    }
}
