use crate::server::{Server, ServerStatus};
use common::ShutdownMessage;
use hashbrown::HashMap;
use mysql::prelude::Queryable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// A background component polling replication state for one set of
/// servers, marking each running/primary/replica. The SQL round-trips are
/// blocking and therefore run on the auxiliary pool, never on a routing
/// worker.
pub struct Monitor {
    name: String,
    servers: Vec<Arc<Server>>,
    user: String,
    password: String,
    interval: Duration,
}

/// What one poll of one server observed.
#[derive(Debug, Default, Clone)]
pub struct ServerPoll {
    pub running: bool,
    pub is_replica: bool,
    pub gtid_positions: HashMap<u32, u64>,
}

impl Monitor {
    pub fn new(
        name: &str,
        servers: Vec<Arc<Server>>,
        user: &str,
        password: &str,
        interval: Duration,
    ) -> Self {
        for server in &servers {
            server.set_monitored(true);
        }
        Self {
            name: name.to_string(),
            servers,
            user: user.to_string(),
            password: password.to_string(),
            interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<ShutdownMessage>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err()
                        || matches!(*shutdown_rx.borrow_and_update(), ShutdownMessage::Cancel(_))
                    {
                        for server in &self.servers {
                            server.set_monitored(false);
                        }
                        return;
                    }
                }
                _ = ticker.tick() => self.poll_all().await,
            }
        }
    }

    async fn poll_all(&self) {
        for server in &self.servers {
            let addr = server.address().to_string();
            let port = server.port();
            let user = self.user.clone();
            let password = self.password.clone();
            let poll = tokio::task::spawn_blocking(move || poll_server(&addr, port, &user, &password))
                .await
                .unwrap_or_else(|e| {
                    warn!("monitor poll task failed: {e}");
                    ServerPoll::default()
                });
            apply_poll(server, &poll);
            debug!(
                "monitor '{}': server '{}' status {:?}",
                self.name,
                server.name(),
                server.status()
            );
        }
    }
}

fn poll_server(address: &str, port: u16, user: &str, password: &str) -> ServerPoll {
    let opts = mysql::OptsBuilder::new()
        .ip_or_hostname(Some(address))
        .tcp_port(port)
        .user(Some(user))
        .pass(Some(password));
    let mut poll = ServerPoll::default();
    let mut conn = match mysql::Conn::new(opts) {
        Ok(conn) => conn,
        Err(e) => {
            debug!("monitor cannot reach {address}:{port}: {e}");
            return poll;
        }
    };
    poll.running = true;

    match conn.query_first::<String, _>("SELECT @@gtid_current_pos") {
        Ok(Some(gtid_pos)) => poll.gtid_positions = parse_gtid_position_list(&gtid_pos),
        Ok(None) => {}
        Err(e) => debug!("gtid query on {address}:{port} failed: {e}"),
    }

    match conn.query_first::<mysql::Row, _>("SHOW SLAVE STATUS") {
        Ok(Some(row)) => {
            let io_state: Option<String> = row.get("Slave_IO_State");
            poll.is_replica = io_state.map(|s| !s.is_empty()).unwrap_or(false);
        }
        Ok(None) => {}
        Err(e) => debug!("slave status query on {address}:{port} failed: {e}"),
    }
    poll
}

/// Translate one poll into status bits. Unreached servers lose RUNNING but
/// keep their role bits so a brief monitor glitch does not re-trigger
/// role-change logic downstream.
pub fn apply_poll(server: &Arc<Server>, poll: &ServerPoll) {
    let mut status = server.status();
    if poll.running {
        status |= ServerStatus::RUNNING;
        if poll.is_replica {
            status |= ServerStatus::SLAVE;
            status &= !ServerStatus::MASTER;
        } else {
            status |= ServerStatus::MASTER;
            status &= !ServerStatus::SLAVE;
        }
        server.update_gtid_positions(poll.gtid_positions.clone().into_iter().collect());
    } else {
        status &= !ServerStatus::RUNNING;
    }
    server.monitor_set_status(status);
}

/// Parse a `@@gtid_current_pos` list, e.g. `0-3000-142,1-3001-9`, into
/// domain -> sequence.
pub fn parse_gtid_position_list(list: &str) -> HashMap<u32, u64> {
    let mut positions = HashMap::new();
    for entry in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match entry.parse::<common::gtid::Gtid>() {
            Ok(gtid) => {
                positions.insert(gtid.domain_id, gtid.sequence_nr);
            }
            Err(_) => warn!("ignoring malformed gtid '{entry}'"),
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gtid_position_list_parsing() {
        let positions = parse_gtid_position_list("0-3000-142, 1-3001-9");
        assert_eq!(positions.get(&0), Some(&142));
        assert_eq!(positions.get(&1), Some(&9));
        assert!(parse_gtid_position_list("").is_empty());
        assert!(parse_gtid_position_list("bogus").is_empty());
    }

    #[test]
    fn poll_translates_to_status_bits() {
        let server = Arc::new(Server::new("s1", "10.0.0.1", 3306));
        apply_poll(
            &server,
            &ServerPoll {
                running: true,
                is_replica: true,
                gtid_positions: HashMap::from_iter([(0, 7)]),
            },
        );
        assert!(server.is_running());
        assert!(server.is_slave());
        assert_eq!(server.gtid_positions().get(&0), Some(&7));

        apply_poll(&server, &ServerPoll::default());
        assert!(!server.is_running());
        assert!(server.is_slave(), "role bits survive a glitch");
    }
}
