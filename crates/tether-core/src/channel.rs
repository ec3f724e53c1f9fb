//! Framing on top of a [`Stream`].
//!
//! ```text
//! [u32 BE: len][u8: flag][len bytes payload]['\n']
//! ```
//!
//! `flag == 1` means the payload is zlib-compressed. The trailing newline
//! keeps line-buffered intermediaries from stalling a frame.
//!
//! A channel does not serialize concurrent senders or receivers; the
//! connection holds its own send and receive locks around these calls.

use crate::config::{ChannelConfig, Config};
use crate::error::{Result, TetherError};
use crate::stream::Stream;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::trace;

/// A framed, optionally compressed message pipe.
pub struct Channel {
    stream: Box<dyn Stream>,
    compression_level: u32,
    compression_threshold: usize,
    max_frame_size: usize,
}

impl Channel {
    pub fn new(stream: Box<dyn Stream>) -> Self {
        Self {
            stream,
            compression_level: ChannelConfig::DEFAULT_COMPRESSION_LEVEL,
            compression_threshold: ChannelConfig::DEFAULT_COMPRESSION_THRESHOLD,
            max_frame_size: ChannelConfig::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// A channel using the frame limits and compression policy from `config`.
    pub fn with_config(stream: Box<dyn Stream>, config: &Config) -> Self {
        Self {
            stream,
            compression_level: config.compression_level,
            compression_threshold: config.compression_threshold,
            max_frame_size: config.max_frame_size,
        }
    }

    /// Set the zlib level; 0 disables compression.
    pub fn set_compression_level(&mut self, level: u32) {
        self.compression_level = level.min(9);
    }

    pub fn stream(&self) -> &dyn Stream {
        &*self.stream
    }

    pub fn close(&self) {
        self.stream.close();
    }

    pub fn closed(&self) -> bool {
        self.stream.closed()
    }

    pub fn fileno(&self) -> Option<i32> {
        self.stream.fileno()
    }

    pub fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        self.stream.poll(timeout)
    }

    /// Send one frame.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let (flag, payload) =
            if self.compression_level > 0 && data.len() > self.compression_threshold {
                (ChannelConfig::FLAG_COMPRESSED, self.compress(data)?)
            } else {
                (ChannelConfig::FLAG_PLAIN, data.to_vec())
            };
        self.send_frame(flag, &payload)
    }

    /// Write an already-encoded payload with an explicit flag.
    pub fn send_frame(&self, flag: u8, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            TetherError::Protocol(format!("frame of {} bytes is too large", payload.len()))
        })?;
        let mut header = [0u8; ChannelConfig::HEADER_LEN];
        header[..4].copy_from_slice(&len.to_be_bytes());
        header[4] = flag;

        let chunk = self.stream.io_chunk_size();
        let total = ChannelConfig::HEADER_LEN + payload.len() + 1;
        trace!(len, flag, "Sending frame");
        if total <= chunk {
            let mut frame = Vec::with_capacity(total);
            frame.extend_from_slice(&header);
            frame.extend_from_slice(payload);
            frame.push(ChannelConfig::TERMINATOR);
            self.stream.write_all(&frame)
        } else {
            let head_len = (chunk.saturating_sub(ChannelConfig::HEADER_LEN)).min(payload.len());
            let (head, tail) = payload.split_at(head_len);
            let mut first = Vec::with_capacity(ChannelConfig::HEADER_LEN + head.len());
            first.extend_from_slice(&header);
            first.extend_from_slice(head);
            self.stream.write_all(&first)?;
            self.stream.write_all(tail)?;
            self.stream.write_all(&[ChannelConfig::TERMINATOR])
        }
    }

    /// Receive one frame, decompressing as needed.
    pub fn recv(&self) -> Result<Vec<u8>> {
        let (flag, payload) = self.recv_frame()?;
        match flag {
            ChannelConfig::FLAG_PLAIN => Ok(payload),
            _ => self.decompress(&payload),
        }
    }

    /// Receive one frame without decompressing it.
    pub fn recv_frame(&self) -> Result<(u8, Vec<u8>)> {
        let header = self.stream.read_exact(ChannelConfig::HEADER_LEN)?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let flag = header[4];
        if len > self.max_frame_size {
            return Err(TetherError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, self.max_frame_size
            )));
        }
        let mut body = self.stream.read_exact(len + 1)?;
        if body.pop() != Some(ChannelConfig::TERMINATOR) {
            return Err(TetherError::Protocol("invalid frame terminator".to_string()));
        }
        trace!(len, flag, "Received frame");
        Ok((flag, body))
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2),
            Compression::new(self.compression_level),
        );
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        // Bound the inflated size so a small frame cannot expand without limit
        let limit = self.max_frame_size as u64 + 1;
        ZlibDecoder::new(data)
            .take(limit)
            .read_to_end(&mut out)
            .map_err(|e| TetherError::Protocol(format!("corrupt compressed frame: {}", e)))?;
        if out.len() > self.max_frame_size {
            return Err(TetherError::Protocol(format!(
                "decompressed frame exceeds the {} byte limit",
                self.max_frame_size
            )));
        }
        Ok(out)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::stream::SocketStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Stream wrapper counting write calls.
    struct CountingStream {
        inner: SocketStream,
        writes: Arc<AtomicUsize>,
    }

    impl Stream for CountingStream {
        fn read_exact(&self, count: usize) -> Result<Vec<u8>> {
            self.inner.read_exact(count)
        }
        fn write_all(&self, data: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.write_all(data)
        }
        fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
            self.inner.poll(timeout)
        }
        fn close(&self) {
            self.inner.close()
        }
        fn closed(&self) -> bool {
            self.inner.closed()
        }
        fn io_chunk_size(&self) -> usize {
            self.inner.io_chunk_size()
        }
    }

    fn pair() -> (Channel, Channel) {
        let (a, b) = SocketStream::pair().unwrap();
        (Channel::new(Box::new(a)), Channel::new(Box::new(b)))
    }

    #[test]
    fn test_small_frame_roundtrip_and_layout() {
        let (a, b) = pair();
        a.send(b"hello").unwrap();
        let raw = b.stream().read_exact(5 + 5 + 1).unwrap();
        assert_eq!(&raw[..4], &5u32.to_be_bytes());
        assert_eq!(raw[4], ChannelConfig::FLAG_PLAIN);
        assert_eq!(&raw[5..10], b"hello");
        assert_eq!(raw[10], b'\n');
    }

    #[test]
    fn test_compressed_frame_roundtrip() {
        let (a, b) = pair();
        let payload = vec![b'z'; 10_000];
        a.send(&payload).unwrap();
        let (flag, compressed) = b.recv_frame().unwrap();
        assert_eq!(flag, ChannelConfig::FLAG_COMPRESSED);
        assert!(compressed.len() < payload.len());

        a.send(&payload).unwrap();
        assert_eq!(b.recv().unwrap(), payload);
    }

    #[test]
    fn test_compression_disabled() {
        let (mut a, b) = pair();
        a.set_compression_level(0);
        let payload = vec![b'q'; 5_000];
        a.send(&payload).unwrap();
        let (flag, body) = b.recv_frame().unwrap();
        assert_eq!(flag, ChannelConfig::FLAG_PLAIN);
        assert_eq!(body, payload);
    }

    #[test]
    fn test_single_write_when_frame_fits_chunk() {
        let (a, b) = SocketStream::pair().unwrap();
        let writes = Arc::new(AtomicUsize::new(0));
        let mut sender = Channel::new(Box::new(CountingStream {
            inner: a,
            writes: writes.clone(),
        }));
        sender.set_compression_level(0);
        let receiver = Channel::new(Box::new(b));

        sender.send(&[1u8; 100]).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(receiver.recv().unwrap(), vec![1u8; 100]);

        let big: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        let expected = big.clone();
        let handle = std::thread::spawn(move || {
            sender.send(&big).unwrap();
            sender
        });
        assert_eq!(receiver.recv().unwrap(), expected);
        handle.join().unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_bad_terminator_is_protocol_error() {
        let (a, b) = SocketStream::pair().unwrap();
        let mut raw = 3u32.to_be_bytes().to_vec();
        raw.push(0);
        raw.extend_from_slice(b"abcX");
        a.write_all(&raw).unwrap();
        let channel = Channel::new(Box::new(b));
        assert!(matches!(channel.recv(), Err(TetherError::Protocol(_))));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let (a, b) = SocketStream::pair().unwrap();
        let config = Config {
            max_frame_size: 16,
            ..Config::default()
        };
        let channel = Channel::with_config(Box::new(b), &config);
        let mut raw = 1000u32.to_be_bytes().to_vec();
        raw.push(0);
        a.write_all(&raw).unwrap();
        assert!(matches!(channel.recv(), Err(TetherError::Protocol(_))));
    }

    #[test]
    fn test_recv_after_peer_close_is_eof() {
        let (a, b) = pair();
        a.close();
        assert!(b.recv().unwrap_err().is_eof());
    }
}
