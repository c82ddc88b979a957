use crate::protocol::mysql::packet::{packet, Packet};

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const PACKET_BUFFER_SIZE: usize = 4096;
const PACKET_LARGE_BUFFER_SIZE: usize = 1048576;

/// Reads bytes off a stream and frames them into MySQL [`Packet`]s.
pub struct PacketReader<R> {
    bytes: Vec<u8>,
    remaining: usize,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            bytes: Vec::new(),
            remaining: 0,
            r,
        }
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// The next logical packet, or `None` on a clean EOF between packets.
    /// Bytes left over after an EOF are an error.
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        let mut buffer_size = PACKET_BUFFER_SIZE;
        loop {
            if self.remaining != 0 {
                let start = self.bytes.len() - self.remaining;
                match packet(&self.bytes[start..]) {
                    Ok((rest, p)) => {
                        self.remaining = rest.len();
                        if self.remaining > 0 {
                            self.bytes = rest.to_vec();
                        } else {
                            self.bytes.clear();
                        }
                        return Ok(Some(p));
                    }
                    Err(nom::Err::Incomplete(_)) | Err(nom::Err::Error(_)) => {
                        // Partial packet; compact and read more below.
                        self.bytes.drain(..start);
                    }
                    Err(nom::Err::Failure(ctx)) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("{ctx:?}"),
                        ));
                    }
                }
            }

            let end = self.remaining;
            if self.bytes.len() - end < buffer_size {
                let new_len = std::cmp::max(end + buffer_size, end * 2);
                self.bytes.resize(new_len, 0);
            }
            let read = self.r.read(&mut self.bytes[end..]).await?;
            self.remaining = end + read;
            self.bytes.truncate(self.remaining);
            // switch to a larger buffer so big result sets resize less.
            buffer_size = PACKET_LARGE_BUFFER_SIZE;

            if read == 0 {
                if self.bytes.is_empty() {
                    return Ok(None);
                } else {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.bytes.len()),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_two_packets_from_one_read() {
        let bytes: Vec<u8> = vec![
            0x01, 0, 0, 0, 0x0e, // COM_PING
            0x02, 0, 0, 0, 0x03, b'x', // COM_QUERY "x"
        ];
        let mut reader = PacketReader::new(std::io::Cursor::new(bytes));
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x0e][..]);
        let (_, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(&*pkt, &[0x03, b'x'][..]);
        assert!(reader.next_async().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn trailing_garbage_is_an_error() {
        let bytes: Vec<u8> = vec![0x05, 0, 0, 0, 0x03]; // length says 5, only 1 byte follows
        let mut reader = PacketReader::new(std::io::Cursor::new(bytes));
        let err = reader.next_async().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
