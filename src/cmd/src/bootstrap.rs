use anyhow::{bail, Context};
use config::loader::{LoadedConfig, ObjectType, PendingObject};
use proxy::diff::commands::DiffCommands;
use proxy::listener::Listener;
use proxy::monitor::Monitor;
use proxy::readconn::ReadConnRouter;
use proxy::server::Server;
use proxy::service::{Service, Target};
use proxy::session::filter::Filter;
use proxy::worker::WorkerPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use wcar::commands::{CaptureCommands, CaptureSettings};
use wcar::filter::CaptureFilter;

/// The assembled runtime object graph of one configuration load.
pub struct ObjectGraph {
    pub servers: BTreeMap<String, Arc<Server>>,
    pub services: BTreeMap<String, Arc<Service>>,
    pub listeners: Vec<Listener>,
    pub monitors: Vec<Arc<Monitor>>,
    pub capture_commands: CaptureCommands,
    pub autostart_captures: Vec<String>,
}

impl ObjectGraph {
    /// Materialise a loaded configuration: servers first, then filters,
    /// services, listeners and monitors, exactly in the loader's
    /// dependency order.
    pub fn build(config: &LoadedConfig) -> anyhow::Result<ObjectGraph> {
        let mut graph = ObjectGraph {
            servers: BTreeMap::new(),
            services: BTreeMap::new(),
            listeners: Vec::new(),
            monitors: Vec::new(),
            capture_commands: CaptureCommands::new(),
            autostart_captures: Vec::new(),
        };
        let mut filters: BTreeMap<String, Arc<dyn Filter>> = BTreeMap::new();

        for object in &config.objects {
            match object.object_type {
                ObjectType::Server => graph.build_server(object)?,
                ObjectType::Filter => graph.build_filter(object, &mut filters)?,
                ObjectType::Service => graph.build_service(object, &filters)?,
                ObjectType::Listener => graph.build_listener(object)?,
                ObjectType::Monitor => graph.build_monitor(object)?,
            }
        }
        Ok(graph)
    }

    fn build_server(&mut self, object: &PendingObject) -> anyhow::Result<()> {
        let address = object
            .params
            .get("address")
            .with_context(|| format!("server '{}' has no address", object.name))?;
        let port: u16 = object
            .params
            .get("port")
            .map(|p| p.parse())
            .transpose()
            .with_context(|| format!("server '{}' has an invalid port", object.name))?
            .unwrap_or(3306);
        self.servers
            .insert(object.name.clone(), Arc::new(Server::new(&object.name, address, port)));
        Ok(())
    }

    fn build_filter(
        &mut self,
        object: &PendingObject,
        filters: &mut BTreeMap<String, Arc<dyn Filter>>,
    ) -> anyhow::Result<()> {
        let module = object.params.get("module").map(String::as_str).unwrap_or("");
        if module != wcar::commands::CAPTURE_MODULE && module != "wcar" {
            bail!("filter '{}': unknown module '{module}'", object.name);
        }
        let mut raw = object.params.clone();
        raw.remove("type");
        raw.remove("module");
        let values = wcar::commands::specification()
            .validate(&raw)
            .map_err(|errors| {
                anyhow::anyhow!(
                    "filter '{}': {}",
                    object.name,
                    errors
                        .iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("; ")
                )
            })?;
        let settings = CaptureSettings::from_values(&values);
        let filter = CaptureFilter::new(&object.name);
        if settings.start_capture {
            self.autostart_captures.push(object.name.clone());
        }
        self.capture_commands
            .register(Arc::clone(&filter), settings);
        filters.insert(object.name.clone(), filter);
        Ok(())
    }

    fn build_service(
        &mut self,
        object: &PendingObject,
        filters: &BTreeMap<String, Arc<dyn Filter>>,
    ) -> anyhow::Result<()> {
        let router_name = object.params.get("router").map(String::as_str).unwrap_or("");
        if router_name != proxy::readconn::READCONN_MODULE {
            warn!(
                "service '{}': router '{router_name}' is not built in, using {}",
                object.name,
                proxy::readconn::READCONN_MODULE
            );
        }
        let mut targets = Vec::new();
        for dep in object.dependencies() {
            if let Some(server) = self.servers.get(&dep) {
                targets.push(Target::Server(Arc::clone(server)));
            } else if let Some(service) = self.services.get(&dep) {
                targets.push(Target::Service(Arc::clone(service)));
            }
        }
        let chain: Vec<Arc<dyn Filter>> = object
            .params
            .get("filters")
            .map(|list| {
                list.split(['|', ','])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .filter_map(|name| filters.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default();

        let service = Service::new(
            &object.name,
            ReadConnRouter::new(),
            chain,
            targets,
            object.params.get("user").map(String::as_str).unwrap_or(""),
            object.params.get("password").map(String::as_str).unwrap_or(""),
        );
        if let Some(max) = object.params.get("max_connections") {
            service.set_max_connections(max.parse().unwrap_or(0));
        }
        for key in ["conn_idle_timeout", "connection_keepalive"] {
            let Some(raw) = object.params.get(key) else { continue };
            let param = config::Param::new(key, "session idle timeout", config::ParamKind::Duration);
            match param.parse(raw) {
                Ok(value) => {
                    if let Some(timeout) = value.as_duration() {
                        service.set_conn_idle_timeout(timeout);
                    }
                }
                Err(e) => bail!("service '{}': {e}", object.name),
            }
        }
        self.services.insert(object.name.clone(), service);
        Ok(())
    }

    fn build_listener(&mut self, object: &PendingObject) -> anyhow::Result<()> {
        let service_name = object
            .params
            .get("service")
            .with_context(|| format!("listener '{}' has no service", object.name))?;
        let service = self
            .services
            .get(service_name)
            .with_context(|| format!("listener '{}': no such service '{service_name}'", object.name))?;
        let address = object
            .params
            .get("address")
            .map(String::as_str)
            .unwrap_or("0.0.0.0");
        let port: u16 = object
            .params
            .get("port")
            .with_context(|| format!("listener '{}' has no port", object.name))?
            .parse()
            .with_context(|| format!("listener '{}' has an invalid port", object.name))?;
        self.listeners
            .push(Listener::new(&object.name, Arc::clone(service), address, port));
        Ok(())
    }

    fn build_monitor(&mut self, object: &PendingObject) -> anyhow::Result<()> {
        let servers: Vec<Arc<Server>> = object
            .dependencies()
            .iter()
            .filter_map(|name| self.servers.get(name).cloned())
            .collect();
        let interval = object
            .params
            .get("monitor_interval")
            .and_then(|v| v.trim_end_matches("ms").parse::<u64>().ok())
            .unwrap_or(2000);
        let monitor = Arc::new(Monitor::new(
            &object.name,
            servers,
            object.params.get("user").map(String::as_str).unwrap_or(""),
            object.params.get("password").map(String::as_str).unwrap_or(""),
            Duration::from_millis(interval),
        ));
        self.monitors.push(monitor);
        Ok(())
    }

    /// Register every server and service with the comparator command
    /// surface.
    pub fn register_diff_objects(&self, commands: &DiffCommands) {
        for server in self.servers.values() {
            commands.register_server(Arc::clone(server));
        }
        for service in self.services.values() {
            commands.register_service(Arc::clone(service));
        }
    }

    pub fn summary(&self) {
        info!(
            "object graph: {} servers, {} services, {} listeners, {} monitors",
            self.servers.len(),
            self.services.len(),
            self.listeners.len(),
            self.monitors.len()
        );
    }
}

/// The worker pool sized from the `[maxscale]` globals with a CLI
/// override.
pub fn build_pool(config: &LoadedConfig, override_threads: Option<usize>) -> Arc<WorkerPool> {
    let threads = override_threads
        .or_else(|| config.globals.get("threads").and_then(|t| t.parse().ok()))
        .unwrap_or(4);
    WorkerPool::new(threads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::ini::parse_str;
    use config::loader::{ConfigLoader, SourceKind};

    fn load(text: &str) -> LoadedConfig {
        let file = parse_str(text, "test.cnf").unwrap();
        let sections = file
            .sections
            .into_iter()
            .map(|s| (s, "test.cnf".to_string(), SourceKind::Main))
            .collect();
        ConfigLoader::new("test.cnf").build(sections).unwrap()
    }

    #[test]
    fn builds_the_s1_graph() {
        let config = load(
            "\
[maxscale]
threads=4

[svc]
type=service
router=readconnroute
user=u
password=p
servers=s1

[s1]
type=server
address=10.0.0.1
port=3306
",
        );
        let graph = ObjectGraph::build(&config).unwrap();
        assert_eq!(graph.servers.len(), 1);
        assert_eq!(graph.services.len(), 1);
        let svc = &graph.services["svc"];
        assert_eq!(svc.reachable_servers()[0].name(), "s1");
        assert_eq!(config.globals["threads"], "4");
    }

    #[test]
    fn capture_filter_chain_is_wired() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&format!(
            "\
[cap]
type=filter
module=capture
capture_dir={}

[svc]
type=service
router=readconnroute
servers=s1
filters=cap

[s1]
type=server
address=10.0.0.1
port=3306
",
            dir.path().display()
        ));
        let graph = ObjectGraph::build(&config).unwrap();
        let svc = &graph.services["svc"];
        assert_eq!(svc.filters().len(), 1);
        assert_eq!(svc.filters()[0].name(), "cap");
    }

    #[test]
    fn listener_requires_a_known_service() {
        let config = load(
            "\
[lst]
type=listener
service=svc
port=4006

[svc]
type=service
router=readconnroute
servers=s1

[s1]
type=server
address=10.0.0.1
port=3306
",
        );
        let graph = ObjectGraph::build(&config).unwrap();
        assert_eq!(graph.listeners.len(), 1);
        assert_eq!(graph.listeners[0].service().name(), "svc");
    }
}
