pub mod packet_reader;
pub mod packet_writer;

use crate::protocol::mysql::constants::{self, CommandCode, HeaderInfo};
use std::ops::Deref;

/// The payload of one logical MySQL packet. Payloads larger than 16M - 1
/// arrive split into wire packets and are reassembled by [`packet`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet(vec)
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.0.extend(bytes);
    }

    pub fn com_code(&self) -> Option<CommandCode> {
        self.0.first().and_then(|b| CommandCode::from_byte(*b))
    }

    /// The statement text of a COM_QUERY / COM_STMT_PREPARE payload.
    pub fn sql_text(&self) -> Option<String> {
        match self.com_code() {
            Some(CommandCode::ComQuery) | Some(CommandCode::ComStmtPrepare) => {
                Some(String::from_utf8_lossy(&self.0[1..]).into_owned())
            }
            _ => None,
        }
    }

    /// The argument of a one-string command such as COM_INIT_DB.
    pub fn com_argument(&self) -> Option<String> {
        if self.0.len() > 1 {
            Some(String::from_utf8_lossy(&self.0[1..]).into_owned())
        } else {
            None
        }
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() <= 5
    }

    /// OK packet after a result set when CLIENT_DEPRECATE_EOF is enabled;
    /// header is 0xfe but the length rules it out as a plain EOF.
    pub fn is_result_set_eof_packet(&self) -> bool {
        !self.0.is_empty()
            && self.0[0] == (HeaderInfo::EOFHeader as u8)
            && (7..0xFFFFFF).contains(&self.0.len())
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::ErrHeader as u8)
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::LocalInFileHeader as u8)
    }

    /// The error code of an ERR packet.
    pub fn error_code(&self) -> Option<u16> {
        if self.is_err_packet() && self.0.len() >= 3 {
            Some(u16::from_le_bytes([self.0[1], self.0[2]]))
        } else {
            None
        }
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

#[inline]
fn full_packet(i: &[u8]) -> nom::IResult<&[u8], (u8, &[u8])> {
    let (i, _) = nom::bytes::complete::tag(&[0xff, 0xff, 0xff][..])(i)?;
    let (i, seq) = nom::bytes::complete::take(1u8)(i)?;
    let (i, bytes) = nom::bytes::complete::take(constants::MAX_PAYLOAD_LEN)(i)?;
    Ok((i, (seq[0], bytes)))
}

#[inline]
fn one_packet(i: &[u8]) -> nom::IResult<&[u8], (u8, &[u8])> {
    let (i, length) = nom::number::complete::le_u24(i)?;
    let (i, seq) = nom::bytes::complete::take(1u8)(i)?;
    let (i, bytes) = nom::bytes::complete::take(length)(i)?;
    Ok((i, (seq[0], bytes)))
}

/// Parse one logical packet, reassembling a 16M-split payload into a single
/// [`Packet`]. Returns the sequence number of the last wire packet.
pub fn packet(i: &[u8]) -> nom::IResult<&[u8], (u8, Packet)> {
    nom::combinator::map(
        nom::sequence::pair(
            nom::multi::fold_many0(
                full_packet,
                || (0, None),
                |(seq, pkt): (_, Option<Packet>), (nseq, p)| {
                    let pkt = if let Some(mut pkt) = pkt {
                        debug_assert_eq!(nseq, seq + 1);
                        pkt.extend(p);
                        Some(pkt)
                    } else {
                        Some(Packet(Vec::from(p)))
                    };
                    (nseq, pkt)
                },
            ),
            one_packet,
        ),
        move |(full, last)| {
            let seq = last.0;
            let pkt = if let Some(mut pkt) = full.1 {
                debug_assert_eq!(last.0, full.0 + 1);
                pkt.extend(last.1);
                pkt
            } else {
                Packet(Vec::from(last.1))
            };
            (seq, pkt)
        },
    )(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_ping() {
        let (rest, (seq, pkt)) = packet(&[0x01, 0, 0, 0, 0x10]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x10][..]);
        assert_eq!(pkt.com_code(), Some(CommandCode::ComPing));
    }

    #[test]
    fn exact_16m_payload_spans_two_wire_packets() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0u8; constants::MAX_PAYLOAD_LEN][..]);
        data.extend(&[0x00, 0x00, 0x00, 1]);

        let (rest, (seq, pkt)) = packet(&data).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), constants::MAX_PAYLOAD_LEN);
    }

    #[test]
    fn split_payload_is_reassembled() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0u8; constants::MAX_PAYLOAD_LEN][..]);
        data.extend(&[0x01, 0x00, 0x00, 1, 0x10]);

        let (rest, (seq, pkt)) = packet(&data).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), constants::MAX_PAYLOAD_LEN + 1);
        assert_eq!(&pkt[constants::MAX_PAYLOAD_LEN..], &[0x10]);
    }

    #[test]
    fn sql_text_extraction() {
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend(b"SELECT 1");
        let pkt = Packet::from_vec(payload);
        assert_eq!(pkt.sql_text().as_deref(), Some("SELECT 1"));

        let pkt = Packet::from_vec(vec![CommandCode::ComPing as u8]);
        assert_eq!(pkt.sql_text(), None);
    }

    #[test]
    fn err_packet_code() {
        // 0xff, code 1064 LE, then the message.
        let pkt = Packet::from_vec(vec![0xff, 0x28, 0x04, b'#']);
        assert!(pkt.is_err_packet());
        assert_eq!(pkt.error_code(), Some(1064));
    }
}
