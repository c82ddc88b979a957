use crate::protocol::mysql::packet::Packet;
use crate::session::backend::{Backend, BackendReply};
use crate::session::reply::Reply;
use crate::session::SessionInfo;
use crate::{ErrorType, Result};
use async_trait::async_trait;
use bitflags::bitflags;

bitflags! {
    /// Capabilities a router advertises to the core.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RouterCaps: u32 {
        /// The worker pool must not change its thread count while a
        /// service of this router has sessions.
        const NO_THREAD_CHANGE = 0b0001;
    }
}

/// The pluggable component deciding which backend(s) a statement goes to.
/// One router instance per service; per-session state lives in the
/// [`RouterSession`].
#[async_trait]
pub trait Router: Send + Sync {
    fn module(&self) -> &str;

    async fn new_session(
        &self,
        info: &SessionInfo,
        backends: Vec<Backend>,
    ) -> Result<Box<dyn RouterSession>>;

    fn capabilities(&self) -> RouterCaps {
        RouterCaps::empty()
    }

    fn diagnostics(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// What the session should do with a reply fragment the router has seen.
#[derive(Debug)]
pub enum ReplyAction {
    /// Deliver this packet to the client (through the filter chain).
    Forward(Packet),
    /// The fragment was consumed internally.
    Consumed,
}

/// The router's verdict on a backend failure.
#[derive(Debug)]
pub enum ErrorHandling {
    /// Tear the session down.
    Close,
    /// The failure is tolerated; the session continues.
    Tolerate,
    /// Tolerated, and a held-back reply chunk becomes deliverable.
    TolerateForward(Packet),
}

#[async_trait]
pub trait RouterSession: Send {
    /// Route one client packet. Returning `false` means routing failed and
    /// the session must close.
    async fn route_query(&mut self, packet: Packet) -> Result<bool>;

    /// One reply fragment from one backend.
    async fn client_reply(&mut self, from: &BackendReply) -> Result<ReplyAction>;

    /// A backend failed. Fatal errors are never tolerated regardless of
    /// the verdict.
    async fn handle_error(
        &mut self,
        error_type: ErrorType,
        message: &str,
        target: &str,
        reply: &Reply,
    ) -> ErrorHandling;

    /// True while any backend owes us a reply.
    fn expecting_replies(&self) -> bool;

    /// Close all backend connections.
    fn close(&mut self);
}
