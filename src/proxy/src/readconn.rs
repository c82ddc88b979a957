use crate::protocol::mysql::packet::Packet;
use crate::session::backend::{Backend, BackendReply, ResponseMode};
use crate::session::reply::Reply;
use crate::session::router::{ErrorHandling, ReplyAction, Router, RouterSession};
use crate::session::SessionInfo;
use crate::{ErrorType, ProxyError, Result};
use async_trait::async_trait;
use tracing::{debug, info};

pub const READCONN_MODULE: &str = "readconnroute";

/// The baseline connection router: every statement of a session goes to
/// one backend, chosen at session start; on failure the session moves to
/// the next connectable backend.
pub struct ReadConnRouter;

impl ReadConnRouter {
    pub fn new() -> std::sync::Arc<ReadConnRouter> {
        std::sync::Arc::new(ReadConnRouter)
    }
}

#[async_trait]
impl Router for ReadConnRouter {
    fn module(&self) -> &str {
        READCONN_MODULE
    }

    async fn new_session(
        &self,
        info: &SessionInfo,
        backends: Vec<Backend>,
    ) -> Result<Box<dyn RouterSession>> {
        if backends.is_empty() {
            return Err(ProxyError::Config(format!(
                "session {}: no backend to route to",
                info.id
            )));
        }
        let active = backends
            .iter()
            .position(Backend::in_use)
            .ok_or_else(|| ProxyError::Config("no usable backend".to_string()))?;
        Ok(Box::new(ReadConnRouterSession { backends, active }))
    }
}

pub struct ReadConnRouterSession {
    backends: Vec<Backend>,
    active: usize,
}

#[async_trait]
impl RouterSession for ReadConnRouterSession {
    async fn route_query(&mut self, packet: Packet) -> Result<bool> {
        let expecting = packet
            .com_code()
            .map(|c| c.will_respond())
            .unwrap_or(true);
        let mode = if expecting {
            ResponseMode::ExpectResponse
        } else {
            ResponseMode::NoResponse
        };
        let backend = &mut self.backends[self.active];
        Ok(backend.write(&packet, mode).await)
    }

    async fn client_reply(&mut self, from: &BackendReply) -> Result<ReplyAction> {
        if from.reply.is_complete() {
            if let Some(backend) = self
                .backends
                .iter_mut()
                .find(|b| b.target() == from.target)
            {
                backend.ack_write();
            }
        }
        Ok(ReplyAction::Forward(from.packet.clone()))
    }

    async fn handle_error(
        &mut self,
        error_type: ErrorType,
        message: &str,
        target: &str,
        _reply: &Reply,
    ) -> ErrorHandling {
        info!("backend '{target}' failed ({error_type:?}): {message}");
        if let Some(backend) = self
            .backends
            .iter_mut()
            .find(|b| b.target() == target)
        {
            backend.close();
        }
        if error_type == ErrorType::Fatal {
            return ErrorHandling::Close;
        }
        // Fail over to the next usable backend, if any.
        match self.backends.iter().position(Backend::in_use) {
            Some(next) => {
                debug!("failing over to backend '{}'", self.backends[next].target());
                self.active = next;
                ErrorHandling::Tolerate
            }
            None => ErrorHandling::Close,
        }
    }

    fn expecting_replies(&self) -> bool {
        self.backends.iter().any(Backend::is_waiting_result)
    }

    fn close(&mut self) {
        for backend in &mut self.backends {
            backend.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::constants::CommandCode;
    use crate::protocol::mysql::packet::packet_reader::PacketReader;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;

    type ServerSide = (PacketReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>);

    /// A backend over an in-memory duplex; the returned server side lets a
    /// test observe which backend a statement actually reached.
    fn fake_backend(target: &str) -> (Backend, ServerSide) {
        let (client_side, server_side) = tokio::io::duplex(1 << 16);
        let (read_half, write_half) = tokio::io::split(client_side);
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = Backend::from_parts(target, Box::new(read_half), Box::new(write_half), tx);
        let (server_read, server_write) = tokio::io::split(server_side);
        (backend, (PacketReader::new(server_read), server_write))
    }

    fn query_packet(sql: &str) -> Packet {
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend(sql.as_bytes());
        Packet::from_vec(payload)
    }

    fn session_info() -> SessionInfo {
        SessionInfo {
            id: 1,
            service: "svc".to_string(),
            user: "u".to_string(),
            current_db: String::new(),
            charset: "utf8mb4".to_string(),
            collation: "utf8mb4_general_ci".to_string(),
        }
    }

    async fn expect_statement(server: &mut ServerSide, sql: &str) {
        let (_seq, pkt) = server
            .0
            .next_async()
            .await
            .unwrap()
            .expect("backend should have received a packet");
        assert_eq!(pkt.com_code(), Some(CommandCode::ComQuery));
        assert_eq!(pkt.sql_text().as_deref(), Some(sql));
    }

    #[tokio::test]
    async fn new_session_skips_unusable_backends() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let router = ReadConnRouter::new();
                assert!(router.new_session(&session_info(), Vec::new()).await.is_err());

                let (mut b1, _s1) = fake_backend("s1");
                b1.close();
                let (b2, mut s2) = fake_backend("s2");
                let mut session = router
                    .new_session(&session_info(), vec![b1, b2])
                    .await
                    .unwrap();
                // The closed first backend was skipped at selection time.
                assert!(session.route_query(query_packet("SELECT 1")).await.unwrap());
                expect_statement(&mut s2, "SELECT 1").await;
            })
            .await;
    }

    #[tokio::test]
    async fn all_backends_closed_is_an_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let router = ReadConnRouter::new();
                let (mut b1, _s1) = fake_backend("s1");
                b1.close();
                assert!(router.new_session(&session_info(), vec![b1]).await.is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn statements_reach_the_active_backend() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let router = ReadConnRouter::new();
                let (b1, mut s1) = fake_backend("s1");
                let (b2, _s2) = fake_backend("s2");
                let mut session = router
                    .new_session(&session_info(), vec![b1, b2])
                    .await
                    .unwrap();

                assert!(session.route_query(query_packet("SELECT 1")).await.unwrap());
                assert!(session.expecting_replies());
                expect_statement(&mut s1, "SELECT 1").await;
            })
            .await;
    }

    #[tokio::test]
    async fn non_fatal_error_fails_over_to_the_next_backend() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let router = ReadConnRouter::new();
                let (b1, _s1) = fake_backend("s1");
                let (b2, mut s2) = fake_backend("s2");
                let mut session = router
                    .new_session(&session_info(), vec![b1, b2])
                    .await
                    .unwrap();

                let handling = session
                    .handle_error(
                        ErrorType::Transient,
                        "connection lost",
                        "s1",
                        &Reply::hangup(),
                    )
                    .await;
                assert!(matches!(handling, ErrorHandling::Tolerate));

                assert!(session.route_query(query_packet("SELECT 2")).await.unwrap());
                expect_statement(&mut s2, "SELECT 2").await;
            })
            .await;
    }

    #[tokio::test]
    async fn fatal_error_closes_even_with_backends_left() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let router = ReadConnRouter::new();
                let (b1, _s1) = fake_backend("s1");
                let (b2, _s2) = fake_backend("s2");
                let mut session = router
                    .new_session(&session_info(), vec![b1, b2])
                    .await
                    .unwrap();

                let handling = session
                    .handle_error(ErrorType::Fatal, "broken", "s1", &Reply::hangup())
                    .await;
                assert!(matches!(handling, ErrorHandling::Close));
            })
            .await;
    }

    #[tokio::test]
    async fn exhausting_every_backend_closes_the_session() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let router = ReadConnRouter::new();
                let (b1, _s1) = fake_backend("s1");
                let mut session = router
                    .new_session(&session_info(), vec![b1])
                    .await
                    .unwrap();

                let handling = session
                    .handle_error(
                        ErrorType::Transient,
                        "connection lost",
                        "s1",
                        &Reply::hangup(),
                    )
                    .await;
                assert!(matches!(handling, ErrorHandling::Close));
                // Nothing is left to write to.
                assert!(!session.route_query(query_packet("SELECT 3")).await.unwrap());
            })
            .await;
    }
}
