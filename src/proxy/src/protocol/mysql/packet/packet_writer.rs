use crate::protocol::mysql::constants;
use byteorder::{ByteOrder, LittleEndian};

use std::io;
use std::io::IoSlice;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffers one logical packet and writes it out as wire packets with
/// headers, splitting at the 16M - 1 payload boundary.
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    pub inner_writer: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner_writer: write,
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Append payload bytes to the pending packet.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Convenience: buffer a whole payload and write it out.
    pub async fn write_packet(&mut self, payload: &[u8]) -> io::Result<()> {
        self.push(payload);
        self.end_packet().await?;
        self.flush_all().await
    }

    pub async fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0; constants::PACKET_HEADER_LEN];
        if !self.is_empty() {
            let raw_packet = self.take_buffer();
            // split the raw buffer at the boundary of size MAX_PAYLOAD_LEN
            for chunk in raw_packet.chunks(constants::MAX_PAYLOAD_LEN) {
                LittleEndian::write_u24(&mut header, chunk.len() as u32);
                header[3] = self.seq();
                self.increase_seq();
                // depending on the AsyncWrite provided, this may or may not
                // reach the socket in one call; fall back to write_all for
                // whatever the vectored write did not drain.
                let written = self
                    .inner_writer
                    .write_vectored(&[IoSlice::new(&header), IoSlice::new(chunk)])
                    .await?;
                if written != constants::PACKET_HEADER_LEN + chunk.len() {
                    let remaining: Vec<u8> = header
                        .iter()
                        .chain(chunk.iter())
                        .skip(written)
                        .cloned()
                        .collect();
                    self.inner_writer.write_all(&remaining).await?;
                }
            }
            Ok(())
        } else {
            // Packet with an empty payload; only the header goes out.
            LittleEndian::write_u24(&mut header, 0);
            header[3] = self.seq();
            self.increase_seq();
            self.inner_writer.write_all(&header).await
        }
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner_writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::packet;

    #[tokio::test]
    async fn writes_header_and_payload() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.write_packet(&[0x03, b'S']).await.unwrap();
        let (rest, (seq, pkt)) = packet(&writer.inner_writer).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x03, b'S'][..]);
    }

    #[tokio::test]
    async fn splits_large_payloads() {
        let payload = vec![0u8; constants::MAX_PAYLOAD_LEN + 10];
        let mut writer = PacketWriter::new(Vec::new());
        writer.write_packet(&payload).await.unwrap();
        let (rest, (seq, pkt)) = packet(&writer.inner_writer).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), payload.len());
    }

    #[tokio::test]
    async fn sequence_wraps() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(255);
        writer.write_packet(&[0x0e]).await.unwrap();
        assert_eq!(writer.seq(), 0);
    }
}
