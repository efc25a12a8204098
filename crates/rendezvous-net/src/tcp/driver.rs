use std::{net::SocketAddr, time::Duration};

use flux_utils::safe_panic;
use mio::{Events, Interest, Poll, Token, event::Event, net::TcpListener};
use tracing::{debug, error, warn};

use crate::tcp::{ConnState, TcpStream, repeater::Repeater, stream::set_socket_buf_size};

/// Where a connection came from and, for outbound ones, how to rebuild it.
enum ConnectionVariant<T> {
    /// We dialled this peer; retried on disconnect.
    Outbound(TcpStream<T>),
    /// A peer dialled us, via one of our listeners; not retried.
    Inbound(TcpStream<T>),
    Listener(TcpListener),
}

impl<T> ConnectionVariant<T> {
    fn as_stream_mut(&mut self) -> Option<&mut TcpStream<T>> {
        match self {
            ConnectionVariant::Outbound(s) | ConnectionVariant::Inbound(s) => Some(s),
            ConnectionVariant::Listener(_) => None,
        }
    }
}

/// Event emitted by [`TcpDriver::poll_with`] for each notable IO occurrence.
pub enum PollEvent<'a, T> {
    /// A new connection was accepted from a listener (or an outbound dial
    /// completed — `listener == stream` in that case).
    Accept { listener: Token, stream: Token, peer_addr: SocketAddr },
    /// A connection closed, by the remote or an IO error. Outbound
    /// connections are scheduled for reconnection; this still fires so the
    /// caller can tear down whatever state it keyed on the token.
    Disconnect { token: Token },
    /// Bytes read from `token`'s socket. Handed to the caller's wire decoder;
    /// valid only for the duration of the callback.
    Bytes { token: Token, data: &'a [u8] },
    /// A queued write for `token` has fully left the process — i.e. the
    /// completion token passed to [`TcpDriver::write`] can now be honoured.
    WriteComplete { token: Token, completion: T },
}

struct ConnectionManager<T> {
    poll: Poll,
    conns: Vec<(Token, ConnectionVariant<T>)>,
    reconnector: Repeater,
    socket_buf_size: Option<usize>,
    to_be_reconnected: Vec<(Token, SocketAddr)>,
    newly_connected: Vec<(Token, SocketAddr)>,
    /// Write completions not yet handed to the caller. Populated both from
    /// [`TcpDriver::write`] (immediate writes) and from writable-event driven
    /// flushes; always drained through `poll_with` so there is one delivery
    /// path regardless of how a write actually completed.
    pending_completions: Vec<(Token, T)>,
    next_token: usize,
}

impl<T> ConnectionManager<T> {
    fn new() -> Self {
        Self {
            poll: Poll::new().expect("couldn't set up a poll for the tcp driver"),
            conns: Vec::with_capacity(8),
            reconnector: Repeater::every(Duration::from_secs(1)),
            socket_buf_size: None,
            to_be_reconnected: Vec::with_capacity(4),
            newly_connected: Vec::with_capacity(4),
            pending_completions: Vec::new(),
            next_token: 0,
        }
    }

    fn disconnect_at_index(&mut self, index: usize) {
        let (token, variant) = self.conns.swap_remove(index);
        match variant {
            ConnectionVariant::Outbound(mut stream) => {
                let addr = stream.peer_addr();
                stream.close(self.poll.registry());
                self.to_be_reconnected.push((token, addr));
            }
            ConnectionVariant::Inbound(mut stream) => stream.close(self.poll.registry()),
            ConnectionVariant::Listener(mut listener) => {
                let _ = self.poll.registry().deregister(&mut listener);
            }
        }
    }

    fn disconnect_token(&mut self, token: Token) {
        if let Some(i) = self.conns.iter().position(|(t, _)| *t == token) {
            self.disconnect_at_index(i);
        }
    }

    fn write(&mut self, token: Token, data: Vec<u8>, completion: Option<T>) {
        let Some(i) = self.conns.iter().position(|(t, _)| *t == token) else {
            error!(?token, "tcp: write to unknown token");
            return;
        };
        let mut fired = Vec::new();
        let state = match self.conns[i].1.as_stream_mut() {
            Some(s) => s.write_or_enqueue(self.poll.registry(), token, data, completion, &mut fired),
            None => {
                error!(?token, "tcp: cannot write to a listener token");
                return;
            }
        };
        self.pending_completions.extend(fired.into_iter().map(|c| (token, c)));
        if state == ConnState::Disconnected {
            self.disconnect_at_index(i);
        }
    }

    fn write_segments(&mut self, token: Token, header: Vec<u8>, body: &[u8], completion: Option<T>) {
        let Some(i) = self.conns.iter().position(|(t, _)| *t == token) else {
            error!(?token, "tcp: write to unknown token");
            return;
        };
        let mut fired = Vec::new();
        let state = match self.conns[i].1.as_stream_mut() {
            Some(s) => s.write_segments(self.poll.registry(), token, header, body, completion, &mut fired),
            None => {
                error!(?token, "tcp: cannot write to a listener token");
                return;
            }
        };
        self.pending_completions.extend(fired.into_iter().map(|c| (token, c)));
        if state == ConnState::Disconnected {
            self.disconnect_at_index(i);
        }
    }

    fn connect(&mut self, addr: SocketAddr) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.to_be_reconnected.push((token, addr));
        self.reconnector.force_fire();
        self.maybe_reconnect();
        token
    }

    fn listen_at(&mut self, addr: SocketAddr) -> Option<Token> {
        let mut listener =
            TcpListener::bind(addr).inspect_err(|e| warn!("couldn't listen at {addr}: {e}")).ok()?;
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut listener, token, Interest::READABLE)
            .inspect_err(|e| warn!("couldn't register listener at {addr}: {e}"))
            .ok()?;
        self.conns.push((token, ConnectionVariant::Listener(listener)));
        Some(token)
    }

    fn maybe_reconnect(&mut self) {
        if !self.reconnector.fired() {
            return;
        }
        let mut i = self.to_be_reconnected.len();
        while i != 0 {
            i -= 1;
            let (token, addr) = self.to_be_reconnected[i];
            let Ok(mut raw) = mio::net::TcpStream::connect(addr)
                .inspect_err(|e| debug!("couldn't connect to {addr}: {e}"))
            else {
                continue;
            };
            if let Some(size) = self.socket_buf_size {
                set_socket_buf_size(&raw, size);
            }
            if let Err(e) = self.poll.registry().register(&mut raw, token, Interest::READABLE) {
                error!("couldn't register outbound stream to {addr}: {e}");
                continue;
            }
            let Ok(stream) =
                TcpStream::from_stream(raw, addr).inspect_err(|e| error!("couldn't build stream for {addr}: {e}"))
            else {
                continue;
            };
            self.newly_connected.push((token, addr));
            self.conns.push((token, ConnectionVariant::Outbound(stream)));
            debug!(?addr, "connected");
            self.to_be_reconnected.swap_remove(i);
        }
    }

    fn force_reconnect(&mut self) {
        self.reconnector.force_fire();
        self.maybe_reconnect();
    }

    fn handle_event<F>(&mut self, e: &Event, handler: &mut F)
    where
        F: for<'a> FnMut(PollEvent<'a, T>),
    {
        let event_token = e.token();
        let Some(i) = self.conns.iter().position(|(t, _)| *t == event_token) else {
            safe_panic!("tcp: event for unknown token {event_token:?}");
            return;
        };

        match &mut self.conns[i].1 {
            ConnectionVariant::Listener(listener) => {
                while let Ok((mut raw, addr)) = listener.accept() {
                    if let Some(size) = self.socket_buf_size {
                        set_socket_buf_size(&raw, size);
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(&mut raw, token, Interest::READABLE) {
                        error!("couldn't register accepted stream: {e}");
                        let _ = raw.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    let Ok(conn) = TcpStream::from_stream(raw, addr).inspect_err(|e| error!("accept: {e}"))
                    else {
                        continue;
                    };
                    handler(PollEvent::Accept { listener: event_token, stream: token, peer_addr: addr });
                    self.conns.push((token, ConnectionVariant::Inbound(conn)));
                }
                return;
            }
            ConnectionVariant::Outbound(_) | ConnectionVariant::Inbound(_) => {}
        }

        if e.is_readable() {
            let stream = self.conns[i].1.as_stream_mut().expect("checked above");
            let state = stream.read_available(|data| {
                handler(PollEvent::Bytes { token: event_token, data });
            });
            if state == ConnState::Disconnected {
                handler(PollEvent::Disconnect { token: event_token });
                self.disconnect_at_index(i);
                return;
            }
        }

        if e.is_writable() {
            let mut fired = Vec::new();
            let stream = self.conns[i].1.as_stream_mut().expect("checked above");
            let state = stream.flush(self.poll.registry(), event_token, &mut fired);
            self.pending_completions.extend(fired.into_iter().map(|c| (event_token, c)));
            if state == ConnState::Disconnected {
                handler(PollEvent::Disconnect { token: event_token });
                self.disconnect_at_index(i);
            }
        }
    }
}

/// Non-blocking TCP driver built on `mio`.
///
/// Drive all IO by calling [`poll_with`](Self::poll_with) from a single
/// dedicated thread. [`connect`](Self::connect) is retried automatically
/// (once a second) until it succeeds or the driver is dropped; listeners and
/// accepted inbound connections are never retried.
///
/// Raw bytes are handed to the caller via [`PollEvent::Bytes`] — this crate
/// knows nothing about the rendezvous wire format, framing is the caller's
/// job. Writes may be tagged with an opaque completion token `T`, surfaced
/// via [`PollEvent::WriteComplete`] once the bytes have actually left the
/// process.
pub struct TcpDriver<T> {
    events: Events,
    mgr: ConnectionManager<T>,
}

impl<T> Default for TcpDriver<T> {
    fn default() -> Self {
        Self { events: Events::with_capacity(64), mgr: ConnectionManager::new() }
    }
}

impl<T> TcpDriver<T> {
    /// Sets kernel SO_SNDBUF/SO_RCVBUF on every socket this driver creates
    /// from this point on (outbound and accepted).
    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.mgr.socket_buf_size = Some(size);
        self
    }

    /// Polls once (non-blocking) and dispatches events via `handler`.
    /// Returns whether any IO was processed, so callers can busy-loop a
    /// drain before sleeping.
    pub fn poll_with<F>(&mut self, mut handler: F) -> bool
    where
        F: for<'a> FnMut(PollEvent<'a, T>),
    {
        self.mgr.maybe_reconnect();
        for (token, peer_addr) in self.mgr.newly_connected.drain(..) {
            handler(PollEvent::Accept { listener: token, stream: token, peer_addr });
        }
        for (token, completion) in self.mgr.pending_completions.drain(..) {
            handler(PollEvent::WriteComplete { token, completion });
        }

        if let Err(e) = self.mgr.poll.poll(&mut self.events, Some(std::time::Duration::ZERO)) {
            safe_panic!("tcp: poll failed: {e}");
            return false;
        }

        let mut any = false;
        for event in self.events.iter() {
            any = true;
            self.mgr.handle_event(event, &mut handler);
        }
        for (token, completion) in self.mgr.pending_completions.drain(..) {
            handler(PollEvent::WriteComplete { token, completion });
        }
        any
    }

    /// Queues `data` for sending to `token`, optionally tagged with a
    /// completion token surfaced later through [`PollEvent::WriteComplete`].
    pub fn write(&mut self, token: Token, data: Vec<u8>, completion: Option<T>) {
        self.mgr.write(token, data, completion);
    }

    /// Writes `header` immediately followed by `body` as a single
    /// `write_vectored` call, so `body` is never copied on the common,
    /// non-backpressured path.
    pub fn write_segments(&mut self, token: Token, header: Vec<u8>, body: &[u8], completion: Option<T>) {
        self.mgr.write_segments(token, header, body, completion);
    }

    /// Begins dialing `addr`. Returns the token the new connection will carry
    /// once it succeeds (surfaced via [`PollEvent::Accept`] with
    /// `listener == stream`); useful for callers that want to distinguish
    /// this particular dial attempt from a later one to a different address.
    pub fn connect(&mut self, addr: SocketAddr) -> Token {
        self.mgr.connect(addr)
    }

    pub fn listen_at(&mut self, addr: SocketAddr) -> Option<Token> {
        self.mgr.listen_at(addr)
    }

    pub fn disconnect(&mut self, token: Token) {
        self.mgr.disconnect_token(token);
    }

    pub fn force_reconnect(&mut self) {
        self.mgr.force_reconnect();
    }
}
