use crate::{ProxyError, Result};
use bitflags::bitflags;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

bitflags! {
    /// A server's status word. Bits are set by the owning monitor, or
    /// directly through the admin surface if the server is unmonitored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServerStatus: u32 {
        const RUNNING  = 0b0000_0001;
        const MASTER   = 0b0000_0010;
        const SLAVE    = 0b0000_0100;
        const MAINT    = 0b0000_1000;
        const DRAINING = 0b0001_0000;
    }
}

/// One backend database server in the object graph. Sessions hold
/// per-connection [`Backend`](crate::session::backend::Backend) handles to
/// it; this object models identity and monitored state.
#[derive(Debug)]
pub struct Server {
    name: String,
    address: String,
    port: u16,
    status: AtomicU32,
    monitored: AtomicBool,
    /// Last observed gtid position per replication domain.
    gtid_positions: Mutex<HashMap<u32, u64>>,
}

impl Server {
    pub fn new(name: &str, address: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            port,
            status: AtomicU32::new(ServerStatus::RUNNING.bits()),
            monitored: AtomicBool::new(false),
            gtid_positions: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_bits_truncate(self.status.load(Ordering::Relaxed))
    }

    pub fn is_running(&self) -> bool {
        self.status().contains(ServerStatus::RUNNING)
    }

    pub fn is_master(&self) -> bool {
        self.status().contains(ServerStatus::MASTER)
    }

    pub fn is_slave(&self) -> bool {
        self.status().contains(ServerStatus::SLAVE)
    }

    pub fn set_monitored(&self, monitored: bool) {
        self.monitored.store(monitored, Ordering::Relaxed);
    }

    pub fn is_monitored(&self) -> bool {
        self.monitored.load(Ordering::Relaxed)
    }

    /// Status updates from the owning monitor.
    pub fn monitor_set_status(&self, status: ServerStatus) {
        self.status.store(status.bits(), Ordering::Relaxed);
    }

    /// Direct admin update; refused while a monitor owns this server.
    pub fn admin_set_status(&self, status: ServerStatus) -> Result<()> {
        if self.is_monitored() {
            return Err(ProxyError::Admin(format!(
                "server '{}' is monitored; its status cannot be set manually",
                self.name
            )));
        }
        self.status.store(status.bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn update_gtid_positions(&self, positions: HashMap<u32, u64>) {
        *self.gtid_positions.lock().unwrap() = positions;
    }

    pub fn gtid_positions(&self) -> HashMap<u32, u64> {
        self.gtid_positions.lock().unwrap().clone()
    }

    /// True when `self` has caught up to every domain position `other`
    /// reports. Missing domains count as behind.
    pub fn has_caught_up_to(&self, other: &Server) -> bool {
        let own = self.gtid_positions();
        for (domain, position) in other.gtid_positions() {
            match own.get(&domain) {
                Some(p) if *p >= position => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_status_refused_when_monitored() {
        let server = Server::new("s1", "10.0.0.1", 3306);
        server
            .admin_set_status(ServerStatus::RUNNING | ServerStatus::MASTER)
            .unwrap();
        assert!(server.is_master());

        server.set_monitored(true);
        assert!(server.admin_set_status(ServerStatus::MAINT).is_err());
        server.monitor_set_status(ServerStatus::RUNNING | ServerStatus::SLAVE);
        assert!(server.is_slave());
    }

    #[test]
    fn gtid_catch_up_comparison() {
        let main = Server::new("main", "10.0.0.1", 3306);
        let replica = Server::new("replica", "10.0.0.2", 3306);
        main.update_gtid_positions(HashMap::from_iter([(0, 100), (1, 50)]));

        replica.update_gtid_positions(HashMap::from_iter([(0, 100)]));
        assert!(!replica.has_caught_up_to(&main), "missing domain is behind");

        replica.update_gtid_positions(HashMap::from_iter([(0, 99), (1, 50)]));
        assert!(!replica.has_caught_up_to(&main));

        replica.update_gtid_positions(HashMap::from_iter([(0, 100), (1, 51)]));
        assert!(replica.has_caught_up_to(&main));
    }
}
