use crate::protocol::mysql::packet::Packet;
use crate::session::reply::Reply;
use crate::session::SessionInfo;
use crate::{ErrorType, Result};

/// A pluggable pipeline stage between the client and the router. The
/// filter object is shared by every session of its service; per-session
/// state lives in the [`FilterSession`] it creates.
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn new_session(&self, info: &SessionInfo) -> Box<dyn FilterSession>;

    fn diagnostics(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Per-session filter state. `route_query` flows downstream (client to
/// router) and may transform the packet; `client_reply` flows upstream and
/// observes every reply fragment.
pub trait FilterSession: Send {
    fn route_query(&mut self, packet: Packet, info: &SessionInfo) -> Result<Packet> {
        let _ = info;
        Ok(packet)
    }

    fn client_reply(&mut self, packet: Packet, reply: &Reply, info: &SessionInfo) -> Packet {
        let _ = (reply, info);
        packet
    }

    fn handle_error(&mut self, error_type: ErrorType, message: &str) {
        let _ = (error_type, message);
    }

    /// Called exactly once when the client disconnects and all pending
    /// replies have drained.
    fn close(&mut self, info: &SessionInfo) {
        let _ = info;
    }
}
