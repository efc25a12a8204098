use std::{collections::VecDeque, io, net::SocketAddr};

use mio::{Interest, Registry, Token};
use tracing::debug;

/// Response type for all external calls.
///
/// `Alive` means the connection is still usable. `Disconnected` means the
/// peer is gone (or the socket errored) and the caller must tear the
/// connection down.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

const RX_BUF_SIZE: usize = 32 * 1024;

struct PendingWrite<T> {
    data: Vec<u8>,
    offset: usize,
    completion: Option<T>,
}

/// Single mio-backed TCP connection, carrying raw bytes with no framing of
/// its own. The wire protocol lives one layer up, fed from
/// [`TcpStream::read_available`]'s chunks.
///
/// Outbound data is written eagerly; anything that would block is queued in
/// a backlog and flushed on the next writable event. A write may carry an
/// opaque completion token `T`, surfaced once every byte of that write has
/// left the backlog (not merely handed to the kernel) — callers use this to
/// know when it is safe to notify an operation waiting on the send.
pub struct TcpStream<T> {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,

    rx_buf: Vec<u8>,
    backlog: VecDeque<PendingWrite<T>>,

    /// Invariant: `writable_armed == !backlog.is_empty()`.
    writable_armed: bool,
}

impl<T> TcpStream<T> {
    pub(crate) fn from_stream(stream: mio::net::TcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer_addr,
            rx_buf: vec![0; RX_BUF_SIZE],
            backlog: VecDeque::with_capacity(8),
            writable_armed: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reads everything the kernel currently has buffered, calling
    /// `on_bytes` once per `read()` syscall. Returns `Disconnected` on EOF or
    /// a fatal read error; `on_bytes` may have already been called for bytes
    /// read before the error.
    pub(crate) fn read_available(&mut self, mut on_bytes: impl FnMut(&[u8])) -> ConnState {
        use std::io::Read;
        loop {
            match self.stream.read(&mut self.rx_buf) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => on_bytes(&self.rx_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(?err, "tcp: read error");
                    return ConnState::Disconnected;
                }
            }
        }
    }

    /// Queues `data` for writing, firing `completion` (if any) once it has
    /// fully left the backlog. Attempts to flush immediately.
    pub(crate) fn write_or_enqueue(
        &mut self,
        registry: &Registry,
        token: Token,
        data: Vec<u8>,
        completion: Option<T>,
        fired: &mut Vec<T>,
    ) -> ConnState {
        self.backlog.push_back(PendingWrite { data, offset: 0, completion });
        self.flush(registry, token, fired)
    }

    /// Writes `header` followed by `body` as one `write_vectored` call when
    /// the backlog is empty, so the caller's body slice is never copied on
    /// the common (non-blocked) path. Falls back to an owned, concatenated
    /// backlog entry — same as the rest of this module's backlog — the
    /// moment the kernel can't take the whole thing in one shot.
    pub(crate) fn write_segments(
        &mut self,
        registry: &Registry,
        token: Token,
        header: Vec<u8>,
        body: &[u8],
        completion: Option<T>,
        fired: &mut Vec<T>,
    ) -> ConnState {
        use std::io::{IoSlice, Write};

        if self.backlog.is_empty() {
            loop {
                match self.stream.write_vectored(&[IoSlice::new(&header), IoSlice::new(body)]) {
                    Ok(0) => return ConnState::Disconnected,
                    Ok(n) if n == header.len() + body.len() => {
                        if let Some(c) = completion {
                            fired.push(c);
                        }
                        return ConnState::Alive;
                    }
                    Ok(n) => {
                        self.backlog.push_back(PendingWrite {
                            data: concat_remaining(&header, body, n),
                            offset: 0,
                            completion,
                        });
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.backlog.push_back(PendingWrite {
                            data: concat_remaining(&header, body, 0),
                            offset: 0,
                            completion,
                        });
                        break;
                    }
                    Err(err) => {
                        debug!(?err, "tcp: write error");
                        return ConnState::Disconnected;
                    }
                }
            }
        } else {
            self.backlog.push_back(PendingWrite { data: concat_remaining(&header, body, 0), offset: 0, completion });
        }
        self.update_writable_interest(registry, token)
    }

    /// Flushes as much of the backlog as the kernel will currently accept.
    pub(crate) fn flush(&mut self, registry: &Registry, token: Token, fired: &mut Vec<T>) -> ConnState {
        use std::io::Write;
        while let Some(front) = self.backlog.front_mut() {
            match self.stream.write(&front.data[front.offset..]) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    front.offset += n;
                    if front.offset == front.data.len() {
                        let done = self.backlog.pop_front().expect("front_mut just matched Some");
                        if let Some(c) = done.completion {
                            fired.push(c);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(?err, "tcp: write error");
                    return ConnState::Disconnected;
                }
            }
        }
        self.update_writable_interest(registry, token)
    }

    fn update_writable_interest(&mut self, registry: &Registry, token: Token) -> ConnState {
        let want_writable = !self.backlog.is_empty();
        if want_writable != self.writable_armed {
            let interest =
                if want_writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
            if let Err(err) = registry.reregister(&mut self.stream, token, interest) {
                debug!(?err, "tcp: reregister failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = want_writable;
        }
        ConnState::Alive
    }

    pub(crate) fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Concatenates whatever of `header`/`body` remains unwritten after `sent`
/// bytes of the combined `header ++ body` were already accepted by the
/// kernel, into a single owned buffer for the backlog.
fn concat_remaining(header: &[u8], body: &[u8], sent: usize) -> Vec<u8> {
    let mut remaining = Vec::with_capacity(header.len() + body.len() - sent);
    if sent < header.len() {
        remaining.extend_from_slice(&header[sent..]);
        remaining.extend_from_slice(body);
    } else {
        remaining.extend_from_slice(&body[sent - header.len()..]);
    }
    remaining
}

/// Sets kernel SO_SNDBUF and SO_RCVBUF. Used by tests to force backpressure
/// deterministically on loopback.
pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            (&raw const size).cast(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&raw const size).cast(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
