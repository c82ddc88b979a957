use crate::diff::router::{check_comparison_requirements, DiffRouter, DiffState};
use crate::diff::{specification, ComparisonKind, DiffSettings};
use crate::server::Server;
use crate::service::{Service, Target};
use crate::worker::WorkerPool;

use dashmap::DashMap;
use itertools::Itertools;
use mysql::prelude::Queryable;
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;

/// A failed module command: an HTTP-style code plus the structured
/// `errors` array the admin layer returns verbatim.
#[derive(Debug)]
pub struct CommandError {
    pub code: u16,
    pub errors: Vec<String>,
}

impl CommandError {
    pub fn new(code: u16, detail: impl Into<String>) -> Self {
        Self {
            code,
            errors: vec![detail.into()],
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "errors": self.errors.iter().map(|e| json!({"detail": e})).collect::<Vec<_>>()
        })
    }
}

pub type CommandResult = std::result::Result<serde_json::Value, CommandError>;

fn bad_request(detail: impl Into<String>) -> CommandError {
    CommandError::new(400, detail)
}

fn not_found(detail: impl Into<String>) -> CommandError {
    CommandError::new(404, detail)
}

/// The comparator's module-command vocabulary: `prepare`, `start`,
/// `status`, `stop`, `summary`, `unprepare`. One instance serves the whole
/// process; commands are serialised on the admin thread.
pub struct DiffCommands {
    pool: Arc<WorkerPool>,
    servers: DashMap<String, Arc<Server>>,
    services: DashMap<String, Arc<Service>>,
    routers: DashMap<String, Arc<DiffRouter>>,
    /// Tests run without live backends and skip the replication probe.
    verify_replication: bool,
}

impl DiffCommands {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            servers: DashMap::new(),
            services: DashMap::new(),
            routers: DashMap::new(),
            verify_replication: true,
        }
    }

    pub fn without_replication_check(mut self) -> Self {
        self.verify_replication = false;
        self
    }

    pub fn register_server(&self, server: Arc<Server>) {
        self.servers.insert(server.name().to_string(), server);
    }

    pub fn register_service(&self, service: Arc<Service>) {
        self.services.insert(service.name().to_string(), service);
    }

    fn service(&self, name: &str) -> std::result::Result<Arc<Service>, CommandError> {
        self.services
            .get(name)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| not_found(format!("no such service: '{name}'")))
    }

    fn server(&self, name: &str) -> std::result::Result<Arc<Server>, CommandError> {
        self.servers
            .get(name)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| not_found(format!("no such server: '{name}'")))
    }

    fn router(&self, service: &str) -> std::result::Result<Arc<DiffRouter>, CommandError> {
        self.routers
            .get(service)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| {
                not_found(format!("service '{service}' has no prepared comparator"))
            })
    }

    /// `prepare <service> <main> <other> <read_only|read_write>`
    pub fn prepare(
        &self,
        service_name: &str,
        main_name: &str,
        other_name: &str,
        comparison_kind: &str,
    ) -> CommandResult {
        let service = self.service(service_name)?;
        let main = self.server(main_name)?;
        let other = self.server(other_name)?;

        let kind = ComparisonKind::from_str(comparison_kind).map_err(|_| {
            bad_request(format!(
                "'{comparison_kind}' is not a valid value. Valid values are: {}",
                ["read_only", "read_write"].iter().join(", ")
            ))
        })?;

        if !service
            .reachable_servers()
            .iter()
            .any(|s| s.name() == main.name())
        {
            return Err(bad_request(format!(
                "main server '{}' is not a target of service '{}'",
                main.name(),
                service_name
            )));
        }

        check_comparison_requirements(kind, &main, &other)
            .map_err(|e| bad_request(e.to_string()))?;

        if self.verify_replication {
            check_prepare_prerequisites(&service, &main, &other).map_err(bad_request)?;
        }

        let comparator_name = format!("Comparator{service_name}");
        if self.services.contains_key(&comparator_name) {
            return Err(bad_request(format!(
                "cannot create a comparator service for '{service_name}': \
                 an object named '{comparator_name}' exists already"
            )));
        }
        if self.routers.contains_key(service_name) {
            return Err(bad_request(format!(
                "service '{service_name}' already has a prepared comparator"
            )));
        }

        // Validate the router parameters through the regular kernel so the
        // comparator service is a first-class object.
        let mut raw = BTreeMap::new();
        raw.insert("exporter".to_string(), "log".to_string());
        raw.insert("main".to_string(), main.name().to_string());
        raw.insert("comparison_kind".to_string(), comparison_kind.to_string());
        let values = specification().validate(&raw).map_err(|errors| CommandError {
            code: 400,
            errors: errors.iter().map(|e| e.to_string()).collect(),
        })?;
        let settings = DiffSettings::from_values(&values);

        let router = DiffRouter::new(
            settings,
            Arc::clone(&self.pool),
            Arc::clone(&service),
            Arc::clone(&main),
            Arc::clone(&other),
        )
        .map_err(|e| bad_request(e.to_string()))?;

        let comparator = Service::new(
            &comparator_name,
            Arc::clone(&router) as Arc<dyn crate::session::router::Router>,
            Vec::new(),
            vec![Target::Server(main), Target::Server(other)],
            &service.user,
            &service.password,
        );
        router.attach_comparator(Arc::clone(&comparator));
        if crate::session::router::Router::capabilities(&*router)
            .contains(crate::session::router::RouterCaps::NO_THREAD_CHANGE)
        {
            self.pool.add_thread_change_veto();
        }
        self.services.insert(comparator_name.clone(), comparator);
        self.routers.insert(service_name.to_string(), router);

        Ok(json!({ "status": "prepared", "comparator": comparator_name }))
    }

    /// `start <service>`
    pub fn start(&self, service_name: &str) -> CommandResult {
        let router = self.router(service_name)?;
        router.start().map_err(|e| bad_request(e.to_string()))
    }

    /// `status <service>`
    pub fn status(&self, service_name: &str) -> CommandResult {
        let router = self.router(service_name)?;
        Ok(router.status())
    }

    /// `stop <service>`
    pub fn stop(&self, service_name: &str) -> CommandResult {
        let router = self.router(service_name)?;
        router.stop().map_err(|e| bad_request(e.to_string()))
    }

    /// `summary <service> [return|save|both]`
    pub fn summary(&self, service_name: &str, disposition: &str) -> CommandResult {
        let router = self.router(service_name)?;
        let summary = router.summary();
        let save = matches!(disposition, "save" | "both");
        let ret = matches!(disposition, "return" | "both" | "");
        if !save && !ret {
            return Err(bad_request(format!(
                "'{disposition}' is not a valid value. Valid values are: {}",
                ["return", "save", "both"].iter().join(", ")
            )));
        }
        if save {
            let path = format!("diff_{service_name}_summary.json");
            if let Err(e) = std::fs::write(&path, summary.to_string()) {
                error!("cannot save summary to {path}: {e}");
                return Err(CommandError::new(500, format!("cannot save summary: {e}")));
            }
        }
        Ok(if ret { summary } else { json!({"status": "saved"}) })
    }

    /// `unprepare <service>`: unlink the comparator service and destroy
    /// it. Only valid while prepared.
    pub fn unprepare(&self, service_name: &str) -> CommandResult {
        let router = self.router(service_name)?;
        if router.state() != DiffState::Prepared {
            return Err(bad_request(format!(
                "'{service_name}' must be stopped before unprepare"
            )));
        }
        let comparator_name = format!("Comparator{service_name}");
        if let Some((_, comparator)) = self.services.remove(&comparator_name) {
            comparator.set_targets(Vec::new());
        }
        if let Some((_, router)) = self.routers.remove(service_name) {
            if crate::session::router::Router::capabilities(&*router)
                .contains(crate::session::router::RouterCaps::NO_THREAD_CHANGE)
            {
                self.pool.release_thread_change_veto();
            }
        }
        Ok(json!({ "status": "unprepared" }))
    }
}

/// The other server must be a live replica of main: its SHOW SLAVE STATUS
/// names main as master and the IO thread is running.
fn check_prepare_prerequisites(
    service: &Service,
    main: &Server,
    other: &Server,
) -> std::result::Result<(), String> {
    let opts = mysql::OptsBuilder::new()
        .ip_or_hostname(Some(other.address()))
        .tcp_port(other.port())
        .user(Some(service.user.clone()))
        .pass(Some(service.password.clone()));
    let mut conn = mysql::Conn::new(opts).map_err(|e| {
        format!(
            "could not connect to server at {}:{}: {e}",
            other.address(),
            other.port()
        )
    })?;

    let row = conn
        .query_first::<mysql::Row, _>("SHOW SLAVE STATUS")
        .map_err(|e| format!("SHOW SLAVE STATUS on '{}' failed: {e}", other.name()))?
        .ok_or_else(|| format!("server '{}' does not replicate from any server", other.name()))?;

    let master_host: String = row.get("Master_Host").unwrap_or_default();
    let master_port: u16 = row.get("Master_Port").unwrap_or_default();
    if master_host != main.address() || master_port != main.port() {
        return Err(format!(
            "server '{}' replicates from {master_host}:{master_port} and not from '{}' ({}:{})",
            other.name(),
            main.name(),
            main.address(),
            main.port()
        ));
    }
    let io_state: String = row.get("Slave_IO_State").unwrap_or_default();
    if io_state.is_empty() {
        return Err(format!(
            "server '{}' is configured to replicate from {master_host}:{master_port}, \
             but is currently not replicating",
            other.name()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerStatus;
    use crate::session::backend::Backend;
    use crate::session::router::{Router, RouterSession};
    use crate::session::SessionInfo;
    use crate::{ProxyError, Result};
    use async_trait::async_trait;

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

    fn fixture() -> DiffCommands {
        let pool = WorkerPool::new(1);
        let commands = DiffCommands::new(pool).without_replication_check();

        let main = Arc::new(Server::new("server1", "127.0.0.1", 3306));
        main.monitor_set_status(ServerStatus::RUNNING | ServerStatus::MASTER);
        let other = Arc::new(Server::new("server2", "127.0.0.2", 3306));
        other.monitor_set_status(ServerStatus::RUNNING | ServerStatus::SLAVE);

        let service = Service::new(
            "svc",
            Arc::new(PlaceholderRouter),
            Vec::new(),
            vec![Target::Server(Arc::clone(&main))],
            "u",
            "p",
        );
        commands.register_server(main);
        commands.register_server(other);
        commands.register_service(service);
        commands
    }

    #[test]
    fn prepare_creates_the_comparator_service() {
        let commands = fixture();
        let out = commands
            .prepare("svc", "server1", "server2", "read_only")
            .unwrap();
        assert_eq!(out["comparator"], "Comparatorsvc");
        assert!(commands.services.contains_key("Comparatorsvc"));

        let status = commands.status("svc").unwrap();
        assert_eq!(status["state"], "prepared");
    }

    #[test]
    fn prepare_validates_objects_and_kind() {
        let commands = fixture();
        let err = commands
            .prepare("nosuch", "server1", "server2", "read_only")
            .unwrap_err();
        assert_eq!(err.code, 404);

        let err = commands
            .prepare("svc", "server1", "server2", "sideways")
            .unwrap_err();
        assert_eq!(err.code, 400);
        assert!(err.errors[0].contains("read_only, read_write"));
        let body = err.to_json();
        assert!(body["errors"][0]["detail"].is_string());

        // main must be a target of the service
        let err = commands
            .prepare("svc", "server2", "server1", "read_write")
            .unwrap_err();
        assert!(err.errors[0].contains("not a target"));
    }

    #[test]
    fn prepare_twice_is_refused() {
        let commands = fixture();
        commands
            .prepare("svc", "server1", "server2", "read_only")
            .unwrap();
        let err = commands
            .prepare("svc", "server1", "server2", "read_only")
            .unwrap_err();
        assert!(err.errors[0].contains("already"));
    }

    #[test]
    fn unprepare_removes_the_comparator() {
        let commands = fixture();
        commands
            .prepare("svc", "server1", "server2", "read_only")
            .unwrap();
        commands.unprepare("svc").unwrap();
        assert!(!commands.services.contains_key("Comparatorsvc"));
        assert!(commands.status("svc").is_err());
        // A fresh prepare works again.
        commands
            .prepare("svc", "server1", "server2", "read_only")
            .unwrap();
    }

    #[test]
    fn summary_dispositions() {
        let commands = fixture();
        commands
            .prepare("svc", "server1", "server2", "read_only")
            .unwrap();
        let summary = commands.summary("svc", "return").unwrap();
        assert_eq!(summary["rounds"], 0);
        assert!(commands.summary("svc", "sometimes").is_err());
    }
}
