use bitflags::bitflags;
use common::gtid::Gtid;
use common::TimeNs;
use std::sync::Arc;

bitflags! {
    /// Statement classification in the lower half of the flag word; the
    /// upper half carries capture bookkeeping bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u64 {
        const READ               = 1 << 0;
        const WRITE              = 1 << 1;
        const BEGIN_TRX          = 1 << 2;
        const COMMIT             = 1 << 3;
        const ROLLBACK           = 1 << 4;
        const ENABLE_AUTOCOMMIT  = 1 << 5;
        const DISABLE_AUTOCOMMIT = 1 << 6;
        /// Captured with a command tag instead of replayable SQL.
        const TAGGED_COMMAND     = 1 << 7;
        /// Synthetic end-of-session marker.
        const SESSION_CLOSE      = 1 << 32;
        /// Synthesised by the capture filter, not sent by the client.
        const ARTIFICIAL         = 1 << 33;
    }
}

impl EventFlags {
    pub fn is_write(&self) -> bool {
        self.contains(EventFlags::WRITE)
    }
}

/// One extracted statement argument: the byte position of its placeholder
/// in the canonical text and the literal value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalArg {
    pub pos: u32,
    pub value: String,
}

/// One captured (or replayed) statement, carrying enough information to
/// reproduce its execution. The canonical text is shared: every event with
/// the same statement shape points at one string.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub canonical: Arc<String>,
    /// Assigned by the storage when the canonical is interned.
    pub canonical_id: i64,
    pub args: Vec<CanonicalArg>,
    pub session_id: u64,
    pub flags: EventFlags,
    /// The wire command this event was captured from.
    pub command: u8,
    pub start_time: TimeNs,
    pub end_time: TimeNs,
    pub event_id: i64,
    pub gtid: Gtid,
}

impl Default for QueryEvent {
    fn default() -> Self {
        Self {
            canonical: Arc::new(String::new()),
            canonical_id: -1,
            args: Vec::new(),
            session_id: 0,
            flags: EventFlags::empty(),
            command: 0x03, // COM_QUERY
            start_time: 0,
            end_time: 0,
            event_id: -1,
            gtid: Gtid::default(),
        }
    }
}

impl QueryEvent {
    pub fn is_session_close(&self) -> bool {
        self.flags.contains(EventFlags::SESSION_CLOSE)
    }

    pub fn is_artificial(&self) -> bool {
        self.flags.contains(EventFlags::ARTIFICIAL)
    }

    /// A real event carries a client statement; synthetic markers do not.
    pub fn is_real(&self) -> bool {
        !self
            .flags
            .intersects(EventFlags::SESSION_CLOSE | EventFlags::ARTIFICIAL)
    }
}

/// The outcome of replaying one event, persisted to the reply file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepEvent {
    pub event_id: i64,
    pub start_time: TimeNs,
    pub end_time: TimeNs,
    pub canonical_id: i64,
    pub num_rows: u64,
    pub rows_read: u64,
    /// Backend error code, 0 for success.
    pub error: u32,
}

/// A contiguous span of events within one session bracketed by
/// transaction semantics; ordered globally by gtid when available.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    pub session_id: u64,
    pub start_event_id: i64,
    pub end_event_id: i64,
    pub end_time: TimeNs,
    pub gtid: Gtid,
}

impl Transaction {
    pub fn is_valid(&self) -> bool {
        self.end_event_id > 0 || self.start_event_id > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_event_classification() {
        let mut event = QueryEvent::default();
        assert!(event.is_real());
        event.flags = EventFlags::SESSION_CLOSE;
        assert!(!event.is_real());
        event.flags = EventFlags::ARTIFICIAL;
        assert!(!event.is_real());
        assert!(event.is_artificial());
    }

    #[test]
    fn flags_fit_both_halves() {
        let flags = EventFlags::WRITE | EventFlags::SESSION_CLOSE;
        assert!(flags.bits() > u32::MAX as u64);
        assert!(flags.is_write());
    }
}
