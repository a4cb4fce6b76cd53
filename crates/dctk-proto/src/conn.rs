//! Connection framing: `|`-terminated lines, raw binary mode and
//! toggleable streaming zlib on both directions.
//!
//! A connection is owned by one reader task and one writer task; none of
//! these types are shareable. [`split`] wraps a byte stream into the
//! [`DcReader`]/[`DcWriter`] pair.

use crate::{adc::AdcMessage, nmdc::NmdcMessage, Message, ProtoError, ProtoResult, MAX_LINE_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;

/// Message terminator for both dialects.
pub const DELIMITER: u8 = b'|';

const IO_CHUNK: usize = 16 * 1024;

/// Which dialect a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoKind {
    Nmdc,
    Adc,
}

/// One unit read from a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A parsed protocol message.
    Message(Message),
    /// A chunk of transfer content, at most the declared remaining length.
    Binary(Bytes),
    /// An empty line.
    KeepAlive,
}

/// Split a byte stream into a framed reader/writer pair.
pub fn split<T>(io: T, kind: ProtoKind) -> (DcReader<ReadHalf<T>>, DcWriter<WriteHalf<T>>)
where
    T: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(io);
    (DcReader::new(r, kind), DcWriter::new(w))
}

/// Framed read half of a connection.
pub struct DcReader<R> {
    io: R,
    kind: ProtoKind,
    /// Raw bytes from the socket; compressed while zlib is active.
    rbuf: BytesMut,
    /// Decoded plain bytes, framed into lines or binary chunks.
    dbuf: BytesMut,
    zlib: Option<Box<Decompress>>,
    binary_remaining: Option<u64>,
    total: u64,
    pulled: u64,
}

impl<R: AsyncRead + Unpin> DcReader<R> {
    pub fn new(io: R, kind: ProtoKind) -> Self {
        Self {
            io,
            kind,
            rbuf: BytesMut::new(),
            dbuf: BytesMut::new(),
            zlib: None,
            binary_remaining: None,
            total: 0,
            pulled: 0,
        }
    }

    pub fn kind(&self) -> ProtoKind {
        self.kind
    }

    /// Switch to raw binary framing for the next `remaining` content bytes.
    ///
    /// The framer never consumes past the declared length: bytes beyond it
    /// stay buffered for line framing.
    pub fn set_read_binary(&mut self, remaining: u64) {
        self.binary_remaining = Some(remaining);
    }

    /// Switch back to line framing.
    pub fn set_read_line(&mut self) {
        self.binary_remaining = None;
    }

    /// Start inflating the read stream from the current position.
    ///
    /// Decompression ends by itself when the remote finishes its zlib
    /// stream; any bytes past the stream end continue as plain input.
    pub fn enable_zlib(&mut self) {
        debug_assert!(self.zlib.is_none(), "zlib already enabled on reader");
        if !self.dbuf.is_empty() {
            // Bytes already moved to the decoded buffer are in fact
            // compressed input; put them back in front.
            let mut merged = BytesMut::with_capacity(self.dbuf.len() + self.rbuf.len());
            merged.extend_from_slice(&self.dbuf);
            merged.extend_from_slice(&self.rbuf);
            self.rbuf = merged;
            self.dbuf.clear();
        }
        self.zlib = Some(Box::new(Decompress::new(true)));
    }

    /// Total bytes read from the socket.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes read from the socket since the last call.
    pub fn take_counter(&mut self) -> u64 {
        let delta = self.total - self.pulled;
        self.pulled = self.total;
        delta
    }

    /// Read the next frame.
    pub async fn read_frame(&mut self) -> ProtoResult<Frame> {
        loop {
            if let Some(rem) = self.binary_remaining {
                if rem == 0 {
                    return Err(ProtoError::BinaryOverrun);
                }
                if !self.dbuf.is_empty() {
                    let take = (self.dbuf.len() as u64).min(rem) as usize;
                    let chunk = self.dbuf.split_to(take).freeze();
                    self.binary_remaining = Some(rem - take as u64);
                    return Ok(Frame::Binary(chunk));
                }
            } else if let Some(pos) = self.dbuf.iter().position(|&b| b == DELIMITER) {
                let line = self.dbuf.split_to(pos).freeze();
                self.dbuf.advance(1);
                if line.is_empty() {
                    return Ok(Frame::KeepAlive);
                }
                trace!(line = %String::from_utf8_lossy(&line), "read line");
                let msg = match self.kind {
                    ProtoKind::Nmdc => Message::Nmdc(NmdcMessage::decode(&line)?),
                    ProtoKind::Adc => Message::Adc(AdcMessage::decode(&line)?),
                };
                return Ok(Frame::Message(msg));
            } else if self.dbuf.len() > MAX_LINE_SIZE {
                return Err(ProtoError::LineTooLong(self.dbuf.len()));
            }

            if self.decode_pending()? {
                continue;
            }

            let mut buf = [0u8; IO_CHUNK];
            let n = self.io.read(&mut buf).await?;
            if n == 0 {
                return Err(ProtoError::ConnectionClosed);
            }
            self.total += n as u64;
            self.rbuf.extend_from_slice(&buf[..n]);
        }
    }

    /// Move raw input into the decoded buffer; true if progress was made.
    fn decode_pending(&mut self) -> ProtoResult<bool> {
        if self.rbuf.is_empty() {
            return Ok(false);
        }
        let z = match &mut self.zlib {
            None => {
                self.dbuf.extend_from_slice(&self.rbuf);
                self.rbuf.clear();
                return Ok(true);
            }
            Some(z) => z,
        };

        let mut out = [0u8; IO_CHUNK];
        let before_in = z.total_in();
        let before_out = z.total_out();
        let status = z
            .decompress(&self.rbuf, &mut out, FlushDecompress::None)
            .map_err(|e| ProtoError::Compression(e.to_string()))?;
        let consumed = (z.total_in() - before_in) as usize;
        let produced = (z.total_out() - before_out) as usize;
        self.rbuf.advance(consumed);
        self.dbuf.extend_from_slice(&out[..produced]);

        if matches!(status, Status::StreamEnd) {
            trace!("read zlib stream finished");
            self.zlib = None;
            return Ok(true);
        }
        Ok(produced > 0)
    }
}

/// Framed write half of a connection.
pub struct DcWriter<W> {
    io: W,
    zlib: Option<Box<Compress>>,
    sync_mode: bool,
    total: u64,
    pulled: u64,
}

impl<W: AsyncWrite + Unpin> DcWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            zlib: None,
            sync_mode: false,
            total: 0,
            pulled: 0,
        }
    }

    /// Enter or leave synchronous write mode; binary content may only be
    /// written while it is on.
    pub fn set_sync_mode(&mut self, on: bool) {
        self.sync_mode = on;
    }

    /// Start deflating binary writes from the current position.
    pub fn enable_zlib(&mut self) {
        debug_assert!(self.zlib.is_none(), "zlib already enabled on writer");
        self.zlib = Some(Box::new(Compress::new(Compression::default(), true)));
    }

    /// Finish the compressed stream and return to plain writes.
    pub async fn finish_zlib(&mut self) -> ProtoResult<()> {
        if self.zlib.is_none() {
            return Ok(());
        }
        let tail = self.compress_chunk(&[], true)?;
        self.zlib = None;
        self.write_raw(&tail).await
    }

    /// Total bytes written to the socket.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes written to the socket since the last call.
    pub fn take_counter(&mut self) -> u64 {
        let delta = self.total - self.pulled;
        self.pulled = self.total;
        delta
    }

    /// Emit one message line.
    pub async fn write_message(&mut self, msg: &Message) -> ProtoResult<()> {
        let mut line = match msg {
            Message::Nmdc(m) => m.encode(),
            Message::Adc(m) => m.encode(),
        };
        trace!(line = %String::from_utf8_lossy(&line), "write line");
        line.push(DELIMITER);
        self.write_raw(&line).await
    }

    /// Emit an empty keep-alive line.
    pub async fn write_keepalive(&mut self) -> ProtoResult<()> {
        self.write_raw(&[DELIMITER]).await
    }

    /// Write transfer content, through zlib when enabled.
    pub async fn write_binary(&mut self, data: &[u8]) -> ProtoResult<()> {
        debug_assert!(self.sync_mode, "binary writes require sync mode");
        if self.zlib.is_some() {
            let out = self.compress_chunk(data, false)?;
            self.write_raw(&out).await
        } else {
            self.write_raw(data).await
        }
    }

    /// Close the write direction.
    pub async fn shutdown(&mut self) -> ProtoResult<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    async fn write_raw(&mut self, data: &[u8]) -> ProtoResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.io.write_all(data).await?;
        self.io.flush().await?;
        self.total += data.len() as u64;
        Ok(())
    }

    fn compress_chunk(&mut self, data: &[u8], finish: bool) -> ProtoResult<Vec<u8>> {
        let z = self.zlib.as_mut().expect("zlib not enabled");
        let mut out = Vec::new();
        let mut buf = [0u8; IO_CHUNK];
        let mut input = data;
        let flush = if finish {
            FlushCompress::Finish
        } else {
            FlushCompress::None
        };
        loop {
            let before_in = z.total_in();
            let before_out = z.total_out();
            let status = z
                .compress(input, &mut buf, flush)
                .map_err(|e| ProtoError::Compression(e.to_string()))?;
            let consumed = (z.total_in() - before_in) as usize;
            let produced = (z.total_out() - before_out) as usize;
            out.extend_from_slice(&buf[..produced]);
            input = &input[consumed..];

            if finish {
                if matches!(status, Status::StreamEnd) {
                    break;
                }
            } else if input.is_empty() && produced < buf.len() {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmdc::NmdcMessage;

    fn nmdc(msg: NmdcMessage) -> Message {
        Message::Nmdc(msg)
    }

    #[tokio::test]
    async fn test_line_framing_across_fragments() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = DcReader::new(server, ProtoKind::Nmdc);

        let mut writer = client;
        tokio::spawn(async move {
            // Two messages split at awkward boundaries.
            writer.write_all(b"$MyNick al").await.unwrap();
            writer.write_all(b"ice|$Maxed").await.unwrap();
            writer.write_all(b"Out|").await.unwrap();
        });

        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Message(nmdc(NmdcMessage::MyNick {
                nick: "alice".into()
            }))
        );
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Message(nmdc(NmdcMessage::MaxedOut))
        );
    }

    #[tokio::test]
    async fn test_keepalive_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = DcReader::new(server, ProtoKind::Nmdc);

        client.write_all(b"|$Hello bob|").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), Frame::KeepAlive);
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Message(nmdc(NmdcMessage::Hello { nick: "bob".into() }))
        );
    }

    #[tokio::test]
    async fn test_binary_mode_respects_declared_length() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = DcReader::new(server, ProtoKind::Nmdc);

        // 10 content bytes immediately followed by a protocol message.
        client.write_all(b"0123456789$MaxedOut|").await.unwrap();

        reader.set_read_binary(10);
        let mut content = Vec::new();
        while content.len() < 10 {
            match reader.read_frame().await.unwrap() {
                Frame::Binary(chunk) => content.extend_from_slice(&chunk),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(content, b"0123456789");

        reader.set_read_line();
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Message(nmdc(NmdcMessage::MaxedOut))
        );
    }

    #[tokio::test]
    async fn test_binary_overrun_is_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = DcReader::new(server, ProtoKind::Nmdc);
        client.write_all(b"xy").await.unwrap();

        reader.set_read_binary(1);
        assert!(matches!(
            reader.read_frame().await.unwrap(),
            Frame::Binary(_)
        ));
        assert!(matches!(
            reader.read_frame().await,
            Err(ProtoError::BinaryOverrun)
        ));
    }

    #[tokio::test]
    async fn test_zlib_roundtrip_then_plain() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 7) as u8).collect();
        let (stream_a, stream_b) = tokio::io::duplex(1024);
        let (_, mut writer) = split(stream_a, ProtoKind::Nmdc);
        let (mut reader, _) = split(stream_b, ProtoKind::Nmdc);

        let send = payload.clone();
        let writer_task = tokio::spawn(async move {
            writer.set_sync_mode(true);
            writer.enable_zlib();
            for chunk in send.chunks(4096) {
                writer.write_binary(chunk).await.unwrap();
            }
            writer.finish_zlib().await.unwrap();
            writer.set_sync_mode(false);
            writer
                .write_message(&Message::Nmdc(NmdcMessage::MaxedOut))
                .await
                .unwrap();
            writer
        });

        reader.set_read_binary(payload.len() as u64);
        reader.enable_zlib();
        let mut content = Vec::new();
        while content.len() < payload.len() {
            match reader.read_frame().await.unwrap() {
                Frame::Binary(chunk) => content.extend_from_slice(&chunk),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(content, payload);

        // The compressed stream has ended; plain framing resumes.
        reader.set_read_line();
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Message(nmdc(NmdcMessage::MaxedOut))
        );

        // Compressible content costs fewer socket bytes than it delivers.
        let writer = writer_task.await.unwrap();
        assert!(writer.total() < payload.len() as u64);
        assert!(reader.total() < payload.len() as u64);
    }

    #[tokio::test]
    async fn test_counters_pull_deltas() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = DcReader::new(server, ProtoKind::Nmdc);

        client.write_all(b"$Hello bob|").await.unwrap();
        reader.read_frame().await.unwrap();

        let first = reader.take_counter();
        assert_eq!(first, 11);
        assert_eq!(reader.take_counter(), 0);
    }
}
