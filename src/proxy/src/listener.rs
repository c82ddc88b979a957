use crate::protocol::mysql::constants::SCRAMBLE_SIZE;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::service::Service;
use crate::session::SessionInfo;
use crate::worker::WorkerPool;
use crate::{ProxyError, Result};

use common::ShutdownMessage;
use rand::Rng;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

pub const DEFAULT_SERVER_VERSION: &[u8] = b"11.1.2-MariaDB-gantry";

/// A bound socket accepting client connections for one service. The
/// listener greets the client, reads the handshake response and then pins
/// the connection to a routing worker; everything after that happens on
/// the worker.
pub struct Listener {
    name: String,
    service: Arc<Service>,
    address: String,
    port: u16,
}

impl Listener {
    pub fn new(name: &str, service: Arc<Service>, address: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            service,
            address: address.to_string(),
            port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub async fn run(
        &self,
        pool: Arc<WorkerPool>,
        mut shutdown_rx: watch::Receiver<ShutdownMessage>,
    ) -> Result<()> {
        let listener = TcpListener::bind(format!("{}:{}", self.address, self.port)).await?;
        info!(
            "listener '{}' accepting on {}:{} for service '{}'",
            self.name,
            self.address,
            self.port,
            self.service.name()
        );
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err()
                        || matches!(*shutdown_rx.borrow_and_update(), ShutdownMessage::Cancel(_))
                    {
                        info!("listener '{}' shutting down", self.name);
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let service = Arc::clone(&self.service);
                            let pool = Arc::clone(&pool);
                            tokio::spawn(async move {
                                if let Err(e) = accept_client(stream, service, pool).await {
                                    warn!("client {peer}: handshake failed: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("listener '{}': accept failed: {e}", self.name),
                    }
                }
            }
        }
    }
}

async fn accept_client(
    stream: TcpStream,
    service: Arc<Service>,
    pool: Arc<WorkerPool>,
) -> Result<()> {
    service.try_admit_session()?;
    // The admission is released by the session's teardown; until the
    // hand-off succeeds this guard owns it.
    let result = greet_and_hand_off(stream, &service, &pool).await;
    if result.is_err() {
        service.release_session();
    }
    result
}

async fn greet_and_hand_off(
    stream: TcpStream,
    service: &Arc<Service>,
    pool: &Arc<WorkerPool>,
) -> Result<()> {
    let session_id = pool.next_session_id();

    let (read_half, write_half) = stream.into_split();
    let mut reader = PacketReader::new(read_half);
    let mut writer = PacketWriter::new(write_half);

    let scramble = gen_scramble();
    writer
        .write_packet(&initial_handshake(session_id as u32, &scramble))
        .await?;

    let Some((seq, response)) = reader.next_async().await? else {
        return Err(ProxyError::SessionClosed);
    };
    let (user, database) = parse_handshake_response(&response)?;

    // Authentication against the backend is outside the core; the client
    // is acknowledged and the session takes over.
    writer.set_seq(seq.wrapping_add(1));
    writer.write_packet(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]).await?;

    let info = SessionInfo {
        id: session_id,
        service: service.name().to_string(),
        user,
        current_db: database,
        charset: "utf8mb4".to_string(),
        collation: "utf8mb4_general_ci".to_string(),
    };

    let stream = reader
        .r
        .reunite(writer.inner_writer)
        .map_err(|e| ProxyError::Malformed(format!("cannot reunite stream halves: {e}")))?;
    let stream = stream.into_std()?;
    if !pool.assign_connection(stream, Arc::clone(service), info) {
        return Err(ProxyError::Admin("no routing worker available".to_string()));
    }
    Ok(())
}

fn gen_scramble() -> [u8; SCRAMBLE_SIZE] {
    let mut scramble = [0u8; SCRAMBLE_SIZE];
    let mut rng = rand::thread_rng();
    for byte in scramble.iter_mut() {
        // printable ascii, excluding NUL and '$'
        *byte = rng.gen_range(0x21..=0x7e);
    }
    scramble
}

/// Protocol v10 initial handshake with mysql_native_password.
fn initial_handshake(conn_id: u32, scramble: &[u8; SCRAMBLE_SIZE]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(128);
    pkt.push(10); // protocol version
    pkt.extend(DEFAULT_SERVER_VERSION);
    pkt.push(0);
    pkt.extend(conn_id.to_le_bytes());
    pkt.extend(&scramble[..8]);
    pkt.push(0); // filler
    // capabilities: LONG_PASSWORD | FOUND_ROWS | LONG_FLAG | CONNECT_WITH_DB
    //   | PROTOCOL_41 | TRANSACTIONS | SECURE_CONNECTION | PLUGIN_AUTH
    let capabilities: u32 = 0x0000_000f | 0x0000_0200 | 0x0000_2000 | 0x0000_8000 | 0x0008_0000;
    pkt.extend((capabilities as u16).to_le_bytes());
    pkt.push(0x2d); // utf8mb4_general_ci
    pkt.extend(2u16.to_le_bytes()); // status: autocommit
    pkt.extend(((capabilities >> 16) as u16).to_le_bytes());
    pkt.push((SCRAMBLE_SIZE + 1) as u8);
    pkt.extend([0u8; 10]);
    pkt.extend(&scramble[8..]);
    pkt.push(0);
    pkt.extend(b"mysql_native_password");
    pkt.push(0);
    pkt
}

/// Extract user name and database from a protocol-41 handshake response.
fn parse_handshake_response(payload: &[u8]) -> Result<(String, String)> {
    if payload.len() < 32 {
        return Err(ProxyError::Malformed(
            "handshake response too short".to_string(),
        ));
    }
    let capabilities = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    if capabilities & CLIENT_PROTOCOL_41 == 0 {
        return Err(ProxyError::Malformed(
            "pre-4.1 clients are not supported".to_string(),
        ));
    }
    let rest = &payload[32..];
    let user_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Malformed("unterminated user name".to_string()))?;
    let user = String::from_utf8_lossy(&rest[..user_end]).into_owned();
    let mut rest = &rest[user_end + 1..];

    // auth response: length-prefixed
    if let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        rest = if tail.len() >= len { &tail[len..] } else { &[] };
    }

    let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 {
        rest.iter()
            .position(|&b| b == 0)
            .map(|end| String::from_utf8_lossy(&rest[..end]).into_owned())
            .unwrap_or_else(|| String::from_utf8_lossy(rest).into_owned())
    } else {
        String::new()
    };
    Ok((user, database))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_response_parsing() {
        let mut payload = Vec::new();
        let caps: u32 = 0x0000_0200 | 0x0000_0008;
        payload.extend(caps.to_le_bytes());
        payload.extend(0u32.to_le_bytes()); // max packet
        payload.push(0x2d); // charset
        payload.extend([0u8; 23]);
        payload.extend(b"app_user");
        payload.push(0);
        payload.push(4); // auth response length
        payload.extend([0xab; 4]);
        payload.extend(b"orders");
        payload.push(0);

        let (user, db) = parse_handshake_response(&payload).unwrap();
        assert_eq!(user, "app_user");
        assert_eq!(db, "orders");
    }

    #[test]
    fn initial_handshake_is_well_formed() {
        let scramble = [b'x'; SCRAMBLE_SIZE];
        let pkt = initial_handshake(7, &scramble);
        assert_eq!(pkt[0], 10);
        assert!(pkt.windows(21).any(|w| w == b"mysql_native_password"));
        assert_eq!(pkt.last(), Some(&0));
    }
}
