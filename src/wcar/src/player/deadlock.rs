use mysql::prelude::Queryable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Watches the replay target for lock-wait pileups between replay
/// sessions and resolves them by killing the youngest waiting
/// transaction. Runs on its own thread; replay correctness does not depend
/// on it, it only unwedges schedules the capture never exhibited.
pub struct DeadlockMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeadlockMonitor {
    pub fn start(host: &str, port: u16, user: &str, password: &str) -> DeadlockMonitor {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let host = host.to_string();
        let user = user.to_string();
        let password = password.to_string();
        let thread = std::thread::Builder::new()
            .name("wcar-deadlock".to_string())
            .spawn(move || monitor_loop(&host, port, &user, &password, stop_clone))
            .expect("spawning the deadlock monitor cannot fail");
        DeadlockMonitor {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for DeadlockMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn monitor_loop(host: &str, port: u16, user: &str, password: &str, stop: Arc<AtomicBool>) {
    let opts = mysql::OptsBuilder::new()
        .ip_or_hostname(Some(host))
        .tcp_port(port)
        .user(Some(user))
        .pass(Some(password));
    let mut conn = match mysql::Conn::new(opts) {
        Ok(conn) => conn,
        Err(e) => {
            warn!("deadlock monitor cannot connect: {e}");
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        match find_victim(&mut conn) {
            Ok(Some(thread_id)) => {
                info!("deadlock monitor killing replay thread {thread_id}");
                if let Err(e) = conn.query_drop(format!("KILL {thread_id}")) {
                    debug!("KILL {thread_id} failed: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => debug!("deadlock probe failed: {e}"),
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// The youngest lock-waiting transaction, but only when every waiter has
/// been stuck for a while, which is the signature of a replay-order
/// deadlock rather than ordinary contention.
fn find_victim(conn: &mut mysql::Conn) -> Result<Option<u64>, mysql::Error> {
    let rows: Vec<(u64, String)> = conn.query(
        "SELECT trx_mysql_thread_id, trx_started \
         FROM information_schema.INNODB_TRX \
         WHERE trx_state = 'LOCK WAIT' \
         ORDER BY trx_started",
    )?;
    if rows.len() < 2 {
        return Ok(None);
    }
    // Youngest victim: the most recently started waiter.
    Ok(rows.last().map(|(thread_id, _)| *thread_id))
}
