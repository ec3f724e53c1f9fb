//! Blocking duplex byte streams.
//!
//! A [`Stream`] reads exact counts, writes everything, and can be polled for
//! readability. Every transport error closes the stream and surfaces as
//! [`TetherError::Eof`]; transient errors (`EINTR`, `EAGAIN`, socket
//! timeouts) are retried internally.
//!
//! # Thread Safety
//!
//! All methods take `&self`. One reader and one writer may run concurrently;
//! the connection serializes readers and writers with its own locks.

use crate::config::TransportConfig;
use crate::error::{Result, TetherError};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

#[cfg(unix)]
use crate::locks::lock;
#[cfg(unix)]
use std::fs::File;
#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;
#[cfg(unix)]
use std::sync::Mutex;

/// Duplex byte transport used by a [`crate::channel::Channel`].
pub trait Stream: Send + Sync {
    /// Read exactly `count` bytes.
    fn read_exact(&self, count: usize) -> Result<Vec<u8>>;

    /// Write every byte of `data`.
    fn write_all(&self, data: &[u8]) -> Result<()>;

    /// True iff at least one byte (or EOF) is readable within `timeout`.
    /// `None` blocks until readable.
    fn poll(&self, timeout: Option<Duration>) -> Result<bool>;

    fn close(&self);

    fn closed(&self) -> bool;

    /// OS descriptor for select-style multiplexing, when there is one.
    fn fileno(&self) -> Option<i32> {
        None
    }

    /// Largest fragment handed to a single read or write call.
    fn io_chunk_size(&self) -> usize;

    /// Human-readable description of the local and remote ends.
    fn endpoints(&self) -> Option<(String, String)> {
        None
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

/// Shared read loop: fill `count` bytes in chunk-sized reads.
fn read_chunked(
    mut read: impl FnMut(&mut [u8]) -> std::io::Result<usize>,
    count: usize,
    chunk: usize,
) -> std::result::Result<Vec<u8>, String> {
    let mut buf = vec![0u8; count];
    let mut filled = 0;
    while filled < count {
        let end = (filled + chunk).min(count);
        match read(&mut buf[filled..end]) {
            Ok(0) => return Err("connection closed by peer".to_string()),
            Ok(n) => filled += n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(buf)
}

/// Shared write loop: push all of `data` in chunk-sized writes.
fn write_chunked(
    mut write: impl FnMut(&[u8]) -> std::io::Result<usize>,
    data: &[u8],
    chunk: usize,
) -> std::result::Result<(), String> {
    let mut sent = 0;
    while sent < data.len() {
        let end = (sent + chunk).min(data.len());
        match write(&data[sent..end]) {
            Ok(0) => return Err("write returned zero bytes".to_string()),
            Ok(n) => sent += n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> std::io::Result<bool> {
    let deadline = timeout.map(|t| std::time::Instant::now() + t);
    loop {
        let timeout_ms: libc::c_int = match deadline {
            None => -1,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                // Round up so a sub-millisecond remainder still waits
                remaining
                    .as_micros()
                    .div_ceil(1000)
                    .min(libc::c_int::MAX as u128) as libc::c_int
            }
        };
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pfd` is an initialized pollfd owned by this frame and nfds
        // is 1, so poll() reads and writes only within it.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0 && pfd.revents != 0);
    }
}

enum SocketKind {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// A connected TCP or unix-domain socket.
pub struct SocketStream {
    socket: SocketKind,
    closed: AtomicBool,
}

impl SocketStream {
    pub fn from_tcp(stream: TcpStream) -> Self {
        // Request/reply traffic is latency bound
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Self {
            socket: SocketKind::Tcp(stream),
            closed: AtomicBool::new(false),
        }
    }

    #[cfg(unix)]
    pub fn from_unix(stream: UnixStream) -> Self {
        Self {
            socket: SocketKind::Unix(stream),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect over TCP, trying every resolved address in turn.
    pub fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            let attempt = match timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    debug!("Connected to {}", addr);
                    return Ok(Self::from_tcp(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => TetherError::Io {
                message: format!("no addresses resolved for {}:{}", host, port),
                source: None,
            },
        })
    }

    #[cfg(unix)]
    pub fn connect_unix(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_unix(UnixStream::connect(path)?))
    }

    /// A connected pair of unix-domain sockets.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_unix(a), Self::from_unix(b)))
    }

    fn fail(&self, reason: String) -> TetherError {
        trace!("Socket failure: {}", reason);
        self.close();
        TetherError::Eof(reason)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() {
            return Err(TetherError::Eof("stream has been closed".to_string()));
        }
        Ok(())
    }
}

impl Stream for SocketStream {
    fn read_exact(&self, count: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let chunk = self.io_chunk_size();
        let result = match &self.socket {
            SocketKind::Tcp(s) => read_chunked(|buf| (&*s).read(buf), count, chunk),
            #[cfg(unix)]
            SocketKind::Unix(s) => read_chunked(|buf| (&*s).read(buf), count, chunk),
        };
        result.map_err(|reason| self.fail(reason))
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let chunk = self.io_chunk_size();
        let result = match &self.socket {
            SocketKind::Tcp(s) => write_chunked(|buf| (&*s).write(buf), data, chunk),
            #[cfg(unix)]
            SocketKind::Unix(s) => write_chunked(|buf| (&*s).write(buf), data, chunk),
        };
        result.map_err(|reason| self.fail(reason))
    }

    #[cfg(unix)]
    fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        self.ensure_open()?;
        let fd = match &self.socket {
            SocketKind::Tcp(s) => s.as_raw_fd(),
            SocketKind::Unix(s) => s.as_raw_fd(),
        };
        poll_readable(fd, timeout).map_err(|e| self.fail(e.to_string()))
    }

    #[cfg(not(unix))]
    fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        self.ensure_open()?;
        let SocketKind::Tcp(s) = &self.socket;
        // A zero read timeout means "block" to std, so clamp to 1ms.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        s.set_read_timeout(timeout)?;
        let mut probe = [0u8; 1];
        let result = match s.peek(&mut probe) {
            Ok(_) => Ok(true),
            Err(e) if is_transient(&e) => Ok(false),
            Err(e) => Err(self.fail(e.to_string())),
        };
        s.set_read_timeout(None)?;
        result
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = match &self.socket {
            SocketKind::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            SocketKind::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(unix)]
    fn fileno(&self) -> Option<i32> {
        Some(match &self.socket {
            SocketKind::Tcp(s) => s.as_raw_fd(),
            SocketKind::Unix(s) => s.as_raw_fd(),
        })
    }

    fn io_chunk_size(&self) -> usize {
        TransportConfig::IO_CHUNK_SIZE_SOCKET
    }

    fn endpoints(&self) -> Option<(String, String)> {
        match &self.socket {
            SocketKind::Tcp(s) => Some((
                s.local_addr().ok()?.to_string(),
                s.peer_addr().ok()?.to_string(),
            )),
            #[cfg(unix)]
            SocketKind::Unix(s) => {
                let describe = |addr: std::os::unix::net::SocketAddr| {
                    addr.as_pathname()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<unnamed>".to_string())
                };
                Some((describe(s.local_addr().ok()?), describe(s.peer_addr().ok()?)))
            }
        }
    }
}

/// Two simplex pipes joined into one duplex stream (stdio bridging).
#[cfg(unix)]
pub struct PipeStream {
    reader: File,
    writer: Mutex<Option<File>>,
    closed: AtomicBool,
}

#[cfg(unix)]
impl PipeStream {
    pub fn new(reader: impl Into<OwnedFd>, writer: impl Into<OwnedFd>) -> Self {
        Self {
            reader: File::from(reader.into()),
            writer: Mutex::new(Some(File::from(writer.into()))),
            closed: AtomicBool::new(false),
        }
    }

    /// Two connected pipe streams, each reading what the other writes.
    pub fn pair() -> Result<(Self, Self)> {
        let (left_rx, right_tx) = std::io::pipe()?;
        let (right_rx, left_tx) = std::io::pipe()?;
        Ok((Self::new(left_rx, left_tx), Self::new(right_rx, right_tx)))
    }

    /// Bridge over this process's stdin and stdout.
    pub fn from_stdio() -> Result<Self> {
        use std::os::fd::AsFd;
        let stdin = std::io::stdin().as_fd().try_clone_to_owned()?;
        let stdout = std::io::stdout().as_fd().try_clone_to_owned()?;
        Ok(Self::new(stdin, stdout))
    }

    /// Bridge over a spawned child's stdout (read) and stdin (write).
    pub fn from_child(child: &mut std::process::Child) -> Result<Self> {
        let missing = |what: &str| TetherError::Io {
            message: format!("child process has no piped {}", what),
            source: None,
        };
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        Ok(Self::new(stdout, stdin))
    }

    fn fail(&self, reason: String) -> TetherError {
        trace!("Pipe failure: {}", reason);
        self.close();
        TetherError::Eof(reason)
    }
}

#[cfg(unix)]
impl Stream for PipeStream {
    fn read_exact(&self, count: usize) -> Result<Vec<u8>> {
        if self.closed() {
            return Err(TetherError::Eof("stream has been closed".to_string()));
        }
        read_chunked(|buf| (&self.reader).read(buf), count, self.io_chunk_size())
            .map_err(|reason| self.fail(reason))
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let guard = lock(&self.writer);
        let Some(writer) = guard.as_ref() else {
            return Err(TetherError::Eof("stream has been closed".to_string()));
        };
        let result = write_chunked(|buf| (&*writer).write(buf), data, self.io_chunk_size());
        drop(guard);
        result.map_err(|reason| self.fail(reason))
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.closed() {
            return Err(TetherError::Eof("stream has been closed".to_string()));
        }
        poll_readable(self.reader.as_raw_fd(), timeout).map_err(|e| self.fail(e.to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the write end is what the peer observes as EOF.
        lock(&self.writer).take();
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn fileno(&self) -> Option<i32> {
        Some(self.reader.as_raw_fd())
    }

    fn io_chunk_size(&self) -> usize {
        TransportConfig::IO_CHUNK_SIZE_PIPE
    }
}
