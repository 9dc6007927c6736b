//! One accepted backend connection and its read loop.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::MockConfig;
use crate::error::{MockError, Result};
use crate::registry::Registry;

/// A live connection from the proxy to the mock backend.
pub struct Session {
    id: u64,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    owner: Weak<Registry>,
    closed: AtomicBool,
}

/// Outcome of waiting for a socket to become readable.
pub(crate) enum PollEvent {
    /// Data or end-of-stream is ready to be read.
    Readable,
    /// The socket reported an error condition.
    ErrorCondition,
    /// Timed out (or interrupted) with nothing to do.
    Idle,
    /// poll(2) itself failed.
    Failed(io::Error),
}

/// Outcome of one bounded read.
enum ReadEvent {
    Data(usize),
    PeerClosed,
    Retry,
    Failed(io::Error),
}

impl Session {
    pub(crate) fn new(id: u64, stream: TcpStream, owner: Weak<Registry>) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            id,
            stream,
            peer,
            owner,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flip to closed. Returns true only for the caller that did the flip.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Write `bytes` to the proxy over this backend connection.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut stream = &self.stream;
        stream
            .write_all(bytes)
            .and_then(|()| stream.flush())
            .map_err(|source| MockError::SessionIo {
                session: self.id,
                source,
            })?;
        trace!(session = self.id, bytes = bytes.len(), "session:send");
        Ok(())
    }

    /// Close the connection and drop it from the registry. Idempotent and
    /// safe to race with the session's own loop.
    pub fn close(self: &Arc<Self>) -> bool {
        let closed_now = match self.owner.upgrade() {
            Some(owner) => owner.remove_with(self, || self.mark_closed()),
            None => self.mark_closed(),
        };
        if !closed_now {
            return false;
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            debug!(session = self.id, error = %e, "session:shutdown failed");
        }
        debug!(session = self.id, peer = ?self.peer, "session:closed");
        true
    }

    /// Read until the peer closes, the socket fails, the session is closed
    /// from outside, or the iteration budget runs out.
    pub(crate) fn run(self: &Arc<Self>, config: &MockConfig) {
        debug!(session = self.id, peer = ?self.peer, "session:start");
        let mut buf = vec![0u8; config.recv_len.max(1)];
        let mut iterations: u32 = 0;

        while !self.is_closed() {
            if iterations >= config.iteration_budget {
                warn!(
                    session = self.id,
                    iterations, "session ran too long, shutting down"
                );
                break;
            }
            iterations += 1;
            trace!(session = self.id, iterations, "session:poll");

            match poll_readable(&self.stream, config.poll_timeout) {
                PollEvent::Idle => continue,
                PollEvent::ErrorCondition => {
                    debug!(session = self.id, "session:socket error condition");
                    break;
                }
                PollEvent::Failed(source) => {
                    let err = MockError::SessionIo {
                        session: self.id,
                        source,
                    };
                    debug!(error = %err, "session:poll failed");
                    break;
                }
                PollEvent::Readable => match self.read_chunk(&mut buf) {
                    ReadEvent::Data(n) => {
                        debug!(session = self.id, bytes = n, "session:recv");
                        if let Some(owner) = self.owner.upgrade() {
                            owner.record_chunk(self, buf[..n].to_vec());
                        }
                    }
                    ReadEvent::PeerClosed => {
                        debug!(session = self.id, "session:peer closed");
                        break;
                    }
                    ReadEvent::Retry => continue,
                    ReadEvent::Failed(source) => {
                        let err = MockError::SessionIo {
                            session: self.id,
                            source,
                        };
                        debug!(error = %err, "session:read failed");
                        break;
                    }
                },
            }
        }

        self.close();
    }

    fn read_chunk(&self, buf: &mut [u8]) -> ReadEvent {
        let mut stream = &self.stream;
        match stream.read(buf) {
            Ok(0) => ReadEvent::PeerClosed,
            Ok(n) => ReadEvent::Data(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                ReadEvent::Retry
            }
            Err(e) => ReadEvent::Failed(e),
        }
    }
}

/// Wait up to `timeout` for `socket` to become readable (or to fail).
pub(crate) fn poll_readable(socket: &impl AsRawFd, timeout: Duration) -> PollEvent {
    let mut pollfd = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return PollEvent::Idle;
        }
        return PollEvent::Failed(err);
    }
    if ret == 0 {
        return PollEvent::Idle;
    }
    if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        return PollEvent::ErrorCondition;
    }
    // Hangup reads as end-of-stream.
    if pollfd.revents & (libc::POLLIN | libc::POLLHUP) != 0 {
        return PollEvent::Readable;
    }
    PollEvent::Idle
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
