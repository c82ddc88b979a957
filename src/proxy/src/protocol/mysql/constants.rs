use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use strum_macros::AsRefStr;

// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html
// max packet payload length.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// The length of the random number used for password scrambling.
pub const SCRAMBLE_SIZE: usize = 20;

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
    LocalInFileHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, FromPrimitive, ToPrimitive, AsRefStr)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

impl CommandCode {
    pub fn from_byte(byte: u8) -> Option<CommandCode> {
        CommandCode::from_u8(byte)
    }

    /// Whether the server sends anything back for this command.
    pub fn will_respond(&self) -> bool {
        !matches!(
            self,
            CommandCode::ComQuit | CommandCode::ComStmtSendLongData | CommandCode::ComStmtClose
        )
    }

    /// Commands the capture filter never records: they carry no replayable
    /// statement.
    pub fn ignored_by_capture(&self) -> bool {
        matches!(
            self,
            CommandCode::ComFieldList
                | CommandCode::ComDebug
                | CommandCode::ComPing
                | CommandCode::ComProcessInfo
                | CommandCode::ComProcessKill
                | CommandCode::ComShutdown
        )
    }

    /// Commands that are captured with a command tag but refused at replay
    /// time; their session-level side effects cannot be reproduced safely.
    pub fn refused_by_replay(&self) -> bool {
        matches!(
            self,
            CommandCode::ComQuit
                | CommandCode::ComResetConnection
                | CommandCode::ComSetOption
                | CommandCode::ComStatistics
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_packet_size() {
        assert_eq!(16_777_215, MAX_PAYLOAD_LEN);
    }

    #[test]
    fn command_from_byte() {
        assert_eq!(CommandCode::from_byte(3), Some(CommandCode::ComQuery));
        assert_eq!(CommandCode::from_byte(200), None);
        assert_eq!(CommandCode::ComQuery.as_ref(), "ComQuery");
    }

    #[test]
    fn quit_has_no_response() {
        assert!(!CommandCode::ComQuit.will_respond());
        assert!(CommandCode::ComQuery.will_respond());
    }
}
