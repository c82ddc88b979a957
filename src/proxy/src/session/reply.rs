use crate::protocol::mysql::packet::Packet;
use mysql_common::constants::StatusFlags;

/// What a completed reply turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyKind {
    #[default]
    None,
    Ok,
    ResultSet,
    Error,
}

impl ReplyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyKind::None => "none",
            ReplyKind::Ok => "ok",
            ReplyKind::ResultSet => "resultset",
            ReplyKind::Error => "error",
        }
    }
}

/// Per-fragment reply metadata. A reply streams in multiple fragments;
/// `is_complete` marks the last one. End-of-statement decisions may only be
/// taken on completion.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub kind: ReplyKind,
    complete: bool,
    pub rows_read: u64,
    pub num_warnings: u16,
    pub error_code: Option<u16>,
    /// gtid from the OK packet's session-state tracker, when present.
    pub last_gtid: Option<String>,
    pub is_local_infile: bool,
}

impl Reply {
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn error(&self) -> bool {
        self.kind == ReplyKind::Error
    }

    /// The synthetic fragment a dying backend produces so downstream
    /// observers see a consistent end of stream.
    pub fn hangup() -> Reply {
        Reply {
            kind: ReplyKind::Error,
            complete: true,
            error_code: Some(2013), // ER_SERVER_LOST
            ..Reply::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    /// Waiting for the response header of the current command.
    Command,
    Columns { remaining: u64 },
    /// Column definitions done; the next packet is either the classic EOF
    /// or already the first row (CLIENT_DEPRECATE_EOF).
    AfterColumns,
    Rows,
}

/// Classifies the packet stream coming back from one backend connection
/// into reply fragments. One tracker per connection; it resets itself when
/// a reply completes.
#[derive(Debug)]
pub struct ReplyTracker {
    state: TrackState,
    rows_read: u64,
}

impl Default for ReplyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self {
            state: TrackState::Command,
            rows_read: 0,
        }
    }

    /// Feed one backend packet; the returned metadata describes the stream
    /// up to and including this fragment.
    pub fn track(&mut self, packet: &Packet) -> Reply {
        let mut reply = Reply {
            rows_read: self.rows_read,
            ..Reply::default()
        };

        match self.state {
            TrackState::Command => {
                if packet.is_ok_packet() {
                    reply.kind = ReplyKind::Ok;
                    let ok = parse_ok(packet);
                    reply.num_warnings = ok.warnings;
                    reply.last_gtid = ok.gtid;
                    if ok.status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
                        // next result follows, stay in Command
                    } else {
                        self.finish(&mut reply);
                    }
                } else if packet.is_err_packet() {
                    reply.kind = ReplyKind::Error;
                    reply.error_code = packet.error_code();
                    self.finish(&mut reply);
                } else if packet.is_local_in_file_packet() {
                    reply.is_local_infile = true;
                    // server now waits for the file; reply continues after
                } else {
                    let columns = lenenc_int(packet).unwrap_or(0);
                    reply.kind = ReplyKind::ResultSet;
                    self.state = TrackState::Columns { remaining: columns };
                }
            }
            TrackState::Columns { remaining } => {
                reply.kind = ReplyKind::ResultSet;
                let remaining = remaining.saturating_sub(1);
                self.state = if remaining == 0 {
                    TrackState::AfterColumns
                } else {
                    TrackState::Columns { remaining }
                };
            }
            TrackState::AfterColumns => {
                reply.kind = ReplyKind::ResultSet;
                if packet.is_eof_packet() {
                    self.state = TrackState::Rows;
                } else {
                    // CLIENT_DEPRECATE_EOF: this is already the first row.
                    self.state = TrackState::Rows;
                    self.rows_read += 1;
                    reply.rows_read = self.rows_read;
                }
            }
            TrackState::Rows => {
                reply.kind = ReplyKind::ResultSet;
                if packet.is_eof_packet() {
                    let (warnings, status) = parse_eof(packet);
                    reply.num_warnings = warnings;
                    if status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
                        self.state = TrackState::Command;
                    } else {
                        self.finish(&mut reply);
                    }
                } else if packet.is_result_set_eof_packet() {
                    let ok = parse_ok_body(&packet[1..]);
                    reply.num_warnings = ok.warnings;
                    reply.last_gtid = ok.gtid;
                    if ok.status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
                        self.state = TrackState::Command;
                    } else {
                        self.finish(&mut reply);
                    }
                } else if packet.is_err_packet() {
                    reply.kind = ReplyKind::Error;
                    reply.error_code = packet.error_code();
                    self.finish(&mut reply);
                } else {
                    self.rows_read += 1;
                    reply.rows_read = self.rows_read;
                }
            }
        }

        reply
    }

    fn finish(&mut self, reply: &mut Reply) {
        reply.complete = true;
        reply.rows_read = self.rows_read;
        self.state = TrackState::Command;
        self.rows_read = 0;
    }
}

struct OkInfo {
    warnings: u16,
    status: StatusFlags,
    gtid: Option<String>,
}

fn parse_ok(packet: &Packet) -> OkInfo {
    parse_ok_body(&packet[1..])
}

/// OK packet body after the 0x00 header: affected lenenc, insert-id lenenc,
/// status u16, warnings u16, then optionally info string + session state.
fn parse_ok_body(mut body: &[u8]) -> OkInfo {
    let mut info = OkInfo {
        warnings: 0,
        status: StatusFlags::empty(),
        gtid: None,
    };
    let Some((_, rest)) = take_lenenc_int(body) else {
        return info;
    };
    body = rest;
    let Some((_, rest)) = take_lenenc_int(body) else {
        return info;
    };
    body = rest;
    if body.len() < 4 {
        return info;
    }
    let status = u16::from_le_bytes([body[0], body[1]]);
    info.status = StatusFlags::from_bits_truncate(status);
    info.warnings = u16::from_le_bytes([body[2], body[3]]);
    body = &body[4..];

    if info
        .status
        .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED)
    {
        // info string, then the session-state blob
        if let Some((_, rest)) = take_lenenc_bytes(body) {
            if let Some((mut state, _)) = take_lenenc_bytes(rest) {
                while !state.is_empty() {
                    let kind = state[0];
                    state = &state[1..];
                    let Some((payload, rest)) = take_lenenc_bytes(state) else {
                        break;
                    };
                    state = rest;
                    // SESSION_TRACK_GTIDS
                    if kind == 3 {
                        let gtid_bytes = take_lenenc_bytes(payload)
                            .map(|(b, _)| b)
                            .unwrap_or(payload);
                        info.gtid = Some(String::from_utf8_lossy(gtid_bytes).into_owned());
                    }
                }
            }
        }
    }
    info
}

fn parse_eof(packet: &Packet) -> (u16, StatusFlags) {
    if packet.len() >= 5 {
        let warnings = u16::from_le_bytes([packet[1], packet[2]]);
        let status = u16::from_le_bytes([packet[3], packet[4]]);
        (warnings, StatusFlags::from_bits_truncate(status))
    } else {
        (0, StatusFlags::empty())
    }
}

fn lenenc_int(packet: &Packet) -> Option<u64> {
    take_lenenc_int(packet).map(|(v, _)| v)
}

fn take_lenenc_int(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let (&first, rest) = bytes.split_first()?;
    match first {
        0..=0xfa => Some((first as u64, rest)),
        0xfc => {
            if rest.len() < 2 {
                return None;
            }
            Some((u16::from_le_bytes([rest[0], rest[1]]) as u64, &rest[2..]))
        }
        0xfd => {
            if rest.len() < 3 {
                return None;
            }
            Some((
                u32::from_le_bytes([rest[0], rest[1], rest[2], 0]) as u64,
                &rest[3..],
            ))
        }
        0xfe => {
            if rest.len() < 8 {
                return None;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&rest[..8]);
            Some((u64::from_le_bytes(buf), &rest[8..]))
        }
        _ => None,
    }
}

fn take_lenenc_bytes(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = take_lenenc_int(bytes)?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    Some((&rest[..len], &rest[len..]))
}
