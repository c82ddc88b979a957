pub mod backend;
pub mod filter;
pub mod reply;
pub mod router;

use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use crate::service::Service;
use crate::session::backend::BackendReply;
use crate::session::filter::FilterSession;
use crate::session::router::{ReplyAction, RouterSession};
use crate::{ErrorType, ProxyError, Result};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection-scoped facts filters and routers may consult. The session
/// keeps `current_db` up to date as COM_INIT_DB packets pass through.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub service: String,
    pub user: String,
    pub current_db: String,
    pub charset: String,
    pub collation: String,
}

/// Cooperative control verbs delivered to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Suspend,
    Resume,
    /// Rebuild the backend set and router session in place, keeping the
    /// client connection.
    Restart,
    /// Move to another routing worker at the next statement boundary.
    Migrate(usize),
    Close,
}

/// How a session's run loop ended.
pub enum SessionOutcome {
    Closed,
    /// The session wants to continue on another worker.
    Migrate(Box<Session>, usize),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live client connection: the filter chain, the router session and
/// the backend reply stream. Owned by exactly one routing worker for its
/// lifetime (migration hands the whole object across).
pub struct Session {
    pub info: SessionInfo,
    service: Arc<Service>,
    filters: Vec<Box<dyn FilterSession>>,
    router_session: Box<dyn RouterSession>,
    client_reader: PacketReader<BoxedReader>,
    client_writer: PacketWriter<BoxedWriter>,
    reply_tx: mpsc::UnboundedSender<BackendReply>,
    reply_rx: mpsc::UnboundedReceiver<BackendReply>,
    control_tx: mpsc::UnboundedSender<SessionControl>,
    control_rx: mpsc::UnboundedReceiver<SessionControl>,
    suspended: Arc<AtomicBool>,
    restart_pending: bool,
}

/// The handle a routing worker keeps for each of its sessions.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub service: String,
    pub control_tx: mpsc::UnboundedSender<SessionControl>,
    pub suspended: Arc<AtomicBool>,
}

impl Session {
    /// Assemble a session: filter sessions and the router session are
    /// created fresh from the service, backends get connected. Must run on
    /// the owning worker (backend readers are `spawn_local`).
    pub async fn create(
        info: SessionInfo,
        service: Arc<Service>,
        client_reader: BoxedReader,
        client_writer: BoxedWriter,
    ) -> Result<(Session, SessionHandle)> {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let filters = service.new_filter_sessions(&info);
        let backends = service.connect_backends(reply_tx.clone()).await?;
        let router_session = service.router().new_session(&info, backends).await?;

        let suspended = Arc::new(AtomicBool::new(false));
        let handle = SessionHandle {
            id: info.id,
            service: info.service.clone(),
            control_tx: control_tx.clone(),
            suspended: Arc::clone(&suspended),
        };
        let session = Session {
            info,
            service,
            filters,
            router_session,
            client_reader: PacketReader::new(client_reader),
            client_writer: PacketWriter::new(client_writer),
            reply_tx,
            reply_rx,
            control_tx,
            control_rx,
            suspended,
            restart_pending: false,
        };
        Ok((session, handle))
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// A fresh handle for the worker adopting this session.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.info.id,
            service: self.info.service.clone(),
            control_tx: self.control_tx.clone(),
            suspended: Arc::clone(&self.suspended),
        }
    }

    /// Re-created backends and router session after a restart or a
    /// migration; the old backend readers die with their channels.
    async fn rebuild(&mut self) -> Result<()> {
        self.router_session.close();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        self.reply_tx = reply_tx;
        self.reply_rx = reply_rx;
        let backends = self.service.connect_backends(self.reply_tx.clone()).await?;
        self.router_session = self
            .service
            .router()
            .new_session(&self.info, backends)
            .await?;
        self.restart_pending = false;
        Ok(())
    }

    /// The session event loop. Suspension points are exactly the awaits in
    /// here; every statement is dispatched in client order and reply
    /// fragments are delivered in backend order.
    pub async fn run(mut self) -> SessionOutcome {
        enum Event {
            Control(Option<SessionControl>),
            Reply(Option<BackendReply>),
            Client(std::io::Result<Option<(u8, Packet)>>),
            IdleTimeout,
        }

        loop {
            let suspended = self.suspended.load(Ordering::Relaxed);
            // Recreated every iteration, so any activity resets it.
            let idle_timeout = self.service.conn_idle_timeout();
            let event = {
                let Session {
                    control_rx,
                    reply_rx,
                    client_reader,
                    ..
                } = &mut self;
                tokio::select! {
                    ctrl = control_rx.recv() => Event::Control(ctrl),
                    reply = reply_rx.recv() => Event::Reply(reply),
                    pkt = client_reader.next_async(), if !suspended => Event::Client(pkt),
                    _ = tokio::time::sleep(idle_timeout.unwrap_or_default()),
                        if idle_timeout.is_some() && !suspended => Event::IdleTimeout,
                }
            };

            match event {
                Event::IdleTimeout => {
                    info!(
                        "session {}: closed after {:?} idle",
                        self.info.id,
                        self.service.conn_idle_timeout().unwrap_or_default()
                    );
                    return self.teardown().await;
                }
                Event::Control(Some(SessionControl::Suspend)) => {
                    self.suspended.store(true, Ordering::Relaxed);
                }
                Event::Control(Some(SessionControl::Resume)) => {
                    self.suspended.store(false, Ordering::Relaxed);
                }
                Event::Control(Some(SessionControl::Restart)) => {
                    self.restart_pending = true;
                    if !self.router_session.expecting_replies() {
                        if let Err(e) = self.rebuild().await {
                            warn!("session {}: restart failed: {e}", self.info.id);
                            return self.teardown().await;
                        }
                    }
                }
                Event::Control(Some(SessionControl::Migrate(target))) => {
                    // Mid-statement the migration is simply skipped and the
                    // rebalancer will pick another candidate.
                    if !self.router_session.expecting_replies() {
                        self.router_session.close();
                        self.restart_pending = true;
                        return SessionOutcome::Migrate(Box::new(self), target);
                    }
                }
                Event::Control(Some(SessionControl::Close)) | Event::Control(None) => {
                    return self.teardown().await;
                }
                Event::Reply(None) => {}
                Event::Reply(Some(reply)) => match self.handle_backend_reply(reply).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => return self.teardown().await,
                },
                Event::Client(Ok(Some((_seq, packet)))) => {
                    match self.handle_client_packet(packet).await {
                        Ok(true) => {}
                        Ok(false) => return self.teardown().await,
                        Err(e) => {
                            debug!("session {}: {e}", self.info.id);
                            return self.teardown().await;
                        }
                    }
                }
                Event::Client(Ok(None)) => {
                    info!("session {}: client disconnected", self.info.id);
                    return self.teardown().await;
                }
                Event::Client(Err(e)) => {
                    warn!("session {}: client read error: {e}", self.info.id);
                    return self.teardown().await;
                }
            }
        }
    }

    /// Downstream: head filter -> ... -> tail filter -> router session.
    async fn handle_client_packet(&mut self, packet: Packet) -> Result<bool> {
        if self.restart_pending && !self.router_session.expecting_replies() {
            self.rebuild().await?;
        }

        match packet.com_code() {
            Some(CommandCode::ComQuit) => {
                let _ = self.router_session.route_query(packet).await;
                return Ok(false);
            }
            Some(CommandCode::ComInitDB) => {
                if let Some(db) = packet.com_argument() {
                    self.info.current_db = db;
                }
            }
            _ => {}
        }

        let mut packet = packet;
        for filter in &mut self.filters {
            packet = filter.route_query(packet, &self.info)?;
        }

        // Replies to this statement start at sequence 1.
        self.client_writer.set_seq(1);
        self.router_session.route_query(packet).await
    }

    /// Upstream: router session -> tail filter -> ... -> head filter ->
    /// client socket.
    async fn handle_backend_reply(&mut self, backend_reply: BackendReply) -> Result<bool> {
        if backend_reply.is_hangup {
            let handling = self
                .router_session
                .handle_error(
                    ErrorType::Transient,
                    "backend connection lost",
                    &backend_reply.target,
                    &backend_reply.reply,
                )
                .await;
            for filter in self.filters.iter_mut().rev() {
                filter.handle_error(ErrorType::Transient, "backend connection lost");
            }
            match handling {
                router::ErrorHandling::Close => {
                    self.send_client_error(2013, "Lost connection to backend server")
                        .await?;
                    return Ok(false);
                }
                router::ErrorHandling::Tolerate => return Ok(true),
                router::ErrorHandling::TolerateForward(mut packet) => {
                    for filter in self.filters.iter_mut().rev() {
                        packet =
                            filter.client_reply(packet, &backend_reply.reply, &self.info);
                    }
                    self.client_writer.write_packet(&packet).await?;
                    return Ok(true);
                }
            }
        }

        let action = self.router_session.client_reply(&backend_reply).await?;
        if let ReplyAction::Forward(mut packet) = action {
            for filter in self.filters.iter_mut().rev() {
                packet = filter.client_reply(packet, &backend_reply.reply, &self.info);
            }
            self.client_writer.write_packet(&packet).await?;
        }
        Ok(true)
    }

    async fn send_client_error(&mut self, code: u16, message: &str) -> Result<()> {
        let packet = make_err_packet(code, message);
        self.client_writer
            .write_packet(&packet)
            .await
            .map_err(ProxyError::Io)
    }

    async fn teardown(mut self) -> SessionOutcome {
        for filter in &mut self.filters {
            filter.close(&self.info);
        }
        self.router_session.close();
        self.service.release_session();
        SessionOutcome::Closed
    }
}

/// A protocol-appropriate ERR packet with the generic HY000 state.
pub fn make_err_packet(code: u16, message: &str) -> Packet {
    let mut payload = vec![0xff];
    payload.extend(code.to_le_bytes());
    payload.push(b'#');
    payload.extend(b"HY000");
    payload.extend(message.as_bytes());
    Packet::from_vec(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_packet_shape() {
        let pkt = make_err_packet(1064, "syntax error");
        assert!(pkt.is_err_packet());
        assert_eq!(pkt.error_code(), Some(1064));
        assert!(pkt.ends_with(b"syntax error"));
    }
}
