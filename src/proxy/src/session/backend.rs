use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use crate::session::reply::{Reply, ReplyTracker};

use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// How a write's response is to be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// The command produces no response at all.
    NoResponse,
    /// The response is routed to the client.
    ExpectResponse,
    /// The response is consumed internally for side effects only.
    IgnoreResponse,
}

/// One reply fragment from one backend, tagged with the backend's target
/// name so the router session can attribute it.
#[derive(Debug)]
pub struct BackendReply {
    pub target: String,
    pub packet: Packet,
    pub reply: Reply,
    /// Set when the connection died; `packet` is empty and `reply` is the
    /// synthetic hang-up fragment.
    pub is_hangup: bool,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The per-session handle to one backend connection: buffers writes,
/// tracks whether responses are expected and how many are in flight.
pub struct Backend {
    target: String,
    writer: PacketWriter<BoxedWriter>,
    pending: VecDeque<ResponseMode>,
    in_use: bool,
}

impl Backend {
    /// Connect to `addr` and wire the read half into `reply_tx`. The reader
    /// task must run on the session's worker, so this uses `spawn_local`.
    pub async fn connect(
        target: &str,
        addr: &str,
        reply_tx: mpsc::UnboundedSender<BackendReply>,
    ) -> io::Result<Backend> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_parts(
            target,
            Box::new(read_half),
            Box::new(write_half),
            reply_tx,
        ))
    }

    /// Assemble a backend from pre-connected halves; tests use an in-memory
    /// duplex here.
    pub fn from_parts(
        target: &str,
        reader: BoxedReader,
        writer: BoxedWriter,
        reply_tx: mpsc::UnboundedSender<BackendReply>,
    ) -> Backend {
        let target_name = target.to_string();
        tokio::task::spawn_local(read_replies(target_name.clone(), reader, reply_tx));
        Backend {
            target: target_name,
            writer: PacketWriter::new(writer),
            pending: VecDeque::new(),
            in_use: true,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// Enqueue one command packet. Returns false if the backend has been
    /// closed.
    pub async fn write(&mut self, packet: &Packet, mode: ResponseMode) -> bool {
        if !self.in_use {
            return false;
        }
        self.writer.reset_seq();
        if let Err(e) = self.writer.write_packet(packet).await {
            debug!("backend '{}' write failed: {e}", self.target);
            self.close();
            return false;
        }
        if mode != ResponseMode::NoResponse {
            self.pending.push_back(mode);
        }
        true
    }

    /// The response mode of the oldest outstanding write.
    pub fn response_mode(&self) -> Option<ResponseMode> {
        self.pending.front().copied()
    }

    /// A complete reply arrived; retire the oldest outstanding write.
    pub fn ack_write(&mut self) -> Option<ResponseMode> {
        self.pending.pop_front()
    }

    pub fn is_waiting_result(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn close(&mut self) {
        self.in_use = false;
        self.pending.clear();
    }
}

/// Reads one backend connection, classifies the stream into reply
/// fragments and forwards them to the owning session. A connection that
/// dies produces one final hang-up fragment.
async fn read_replies(
    target: String,
    reader: BoxedReader,
    reply_tx: mpsc::UnboundedSender<BackendReply>,
) {
    let mut reader = PacketReader::new(reader);
    let mut tracker = ReplyTracker::new();
    loop {
        match reader.next_async().await {
            Ok(Some((_seq, packet))) => {
                let reply = tracker.track(&packet);
                if reply_tx
                    .send(BackendReply {
                        target: target.clone(),
                        packet,
                        reply,
                        is_hangup: false,
                    })
                    .is_err()
                {
                    // session is gone
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("backend '{target}' read failed: {e}");
                break;
            }
        }
    }
    let _ = reply_tx.send(BackendReply {
        target,
        packet: Packet::default(),
        reply: Reply::hangup(),
        is_hangup: true,
    });
}
