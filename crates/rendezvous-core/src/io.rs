//! The single-threaded event loop body: owns the transport driver, the
//! per-role connection state (chief registry, or a worker's one upstream
//! connection), and turns wire frames into operation-arena mutations.
//!
//! Everything here runs under the context mutex (see `context.rs`) — driving
//! IO and mutating operation state happen together, per the invariant that
//! only the IO thread ever touches an operation's fields once it has left
//! the submit path.

use std::net::SocketAddr;

use mio::Token;
use rendezvous_net::tcp::{PollEvent, TcpDriver};
use rendezvous_wire::{Decoder, Frame, encode};
use tracing::{debug, error, warn};

use crate::{
    error::OpenError,
    op::{
        AllgatherRole, BroadcastRole, ChiefAllgather, ChiefGather, GatherRole, Kind, KindTag, OpArena, OpToken,
        Operation, WorkerAllgather, WorkerBroadcast, get_op_for_recv, record_allgather_contribution,
        record_broadcast_recv, record_gather_contribution,
    },
    registry::{ChiefRegistry, PromoteError},
};

pub(crate) struct ChiefIo {
    pub(crate) registry: ChiefRegistry,
    listen_addr: SocketAddr,
    listener: Option<Token>,
}

impl ChiefIo {
    pub(crate) fn new(size: u32, listen_addr: SocketAddr) -> Self {
        Self { registry: ChiefRegistry::new(size), listen_addr, listener: None }
    }
}

pub(crate) struct WorkerIo {
    pub(crate) rank: u32,
    /// First address `getaddrinfo` returned for the chief. The transport
    /// driver already retries a dropped outbound connection against the
    /// same address (same [`Token`]) every second on its own; cycling
    /// through every resolved alternative would need the driver to surface
    /// per-attempt failures it doesn't currently distinguish from "still
    /// trying," so this keeps to the one address rather than risk two
    /// competing reconnect loops. See `DESIGN.md`.
    addr: SocketAddr,
    pub(crate) conn_token: Option<Token>,
    just_connected: bool,
    pub(crate) connected: bool,
    decoder: Decoder,
}

impl WorkerIo {
    pub(crate) fn new(rank: u32, addr: SocketAddr) -> Self {
        Self { rank, addr, conn_token: None, just_connected: false, connected: false, decoder: Decoder::new() }
    }
}

pub(crate) enum Role {
    Chief(ChiefIo),
    Worker(WorkerIo),
}

/// Everything the IO thread owns outright: the transport driver plus
/// whichever role-specific connection state applies.
pub(crate) struct IoState {
    pub(crate) driver: TcpDriver<OpToken>,
    pub(crate) role: Role,
    pub(crate) size: u32,
    started: bool,
}

impl IoState {
    pub(crate) fn new(role: Role, size: u32) -> Self {
        Self { driver: TcpDriver::default(), role, size, started: false }
    }

    /// First-run init: bind (chief) or kick off the dial (worker). Idempotent
    /// after the first call — later calls are a no-op `Ok(())`.
    pub(crate) fn start(&mut self) -> Result<(), OpenError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        match &mut self.role {
            Role::Chief(chief) => match self.driver.listen_at(chief.listen_addr) {
                Some(token) => {
                    chief.listener = Some(token);
                    Ok(())
                }
                None => {
                    error!(addr = %chief.listen_addr, "chief couldn't bind a listener");
                    Err(OpenError::ListenFailed)
                }
            },
            Role::Worker(worker) => {
                worker.conn_token = Some(self.driver.connect(worker.addr));
                Ok(())
            }
        }
    }

    /// Runs one tick: drains whatever the transport driver has queued,
    /// dispatching each event against the operation arena. Returns whether
    /// anything observable happened, so the caller knows whether to notify
    /// waiters.
    pub(crate) fn poll(&mut self, arena: &mut OpArena) -> bool {
        let mut changed = false;
        loop {
            let IoState { driver, role, size, .. } = self;
            let size = *size;
            let processed = driver.poll_with(|event| {
                changed |= handle_event(event, role, size, arena);
            });
            if let Role::Worker(worker) = role {
                if worker.just_connected {
                    worker.just_connected = false;
                    if let Some(conn) = worker.conn_token {
                        driver.write(conn, encode::encode_init(worker.rank).to_vec(), None);
                    }
                }
            }
            if !processed {
                break;
            }
        }
        changed
    }

    /// Gives every inflight operation a chance to issue its pending sends.
    pub(crate) fn advance_all(&mut self, arena: &mut OpArena) {
        let tokens: Vec<OpToken> = arena.iter_inflight_mut().map(|(t, _)| t).collect();
        for token in tokens {
            advance_one(token, arena, &mut self.driver, &self.role);
        }
    }

    pub(crate) fn ready(&self) -> bool {
        match &self.role {
            Role::Chief(chief) => chief.registry.ready(),
            Role::Worker(worker) => worker.connected,
        }
    }

    /// Tears every socket down: listener, preinit connections, promoted
    /// peers, and (on a worker) the upstream connection. Safe to call more
    /// than once.
    pub(crate) fn close_everything(&mut self) {
        match &mut self.role {
            Role::Chief(chief) => {
                if let Some(token) = chief.listener.take() {
                    self.driver.disconnect(token);
                }
                let peers: Vec<Token> = chief.registry.all_peer_tokens().collect();
                for token in peers {
                    self.driver.disconnect(token);
                }
                chief.registry = ChiefRegistry::new(chief.registry.size());
            }
            Role::Worker(worker) => {
                if let Some(token) = worker.conn_token.take() {
                    self.driver.disconnect(token);
                }
                worker.connected = false;
            }
        }
    }
}

/// Dispatches one transport event. Returns whether it changed anything a
/// waiter might care about (a completed operation, a fatal failure).
fn handle_event(event: PollEvent<'_, OpToken>, role: &mut Role, size: u32, arena: &mut OpArena) -> bool {
    match event {
        PollEvent::Accept { listener, stream, peer_addr } => match role {
            Role::Chief(chief) => {
                if Some(listener) == chief.listener {
                    debug!(%peer_addr, "chief: accepted preinit connection");
                    chief.registry.insert_preinit(stream);
                }
                false
            }
            Role::Worker(worker) => {
                if Some(listener) == worker.conn_token {
                    debug!(%peer_addr, "worker: connected to chief");
                    worker.connected = true;
                    worker.just_connected = true;
                }
                false
            }
        },
        PollEvent::Disconnect { token } => match role {
            Role::Chief(chief) => {
                let was_promoted = chief.registry.rank_of(token).is_some();
                let existed = chief.registry.decoder_mut(token).is_some();
                if !existed {
                    return false;
                }
                chief.registry.remove(token);
                if was_promoted {
                    warn!(?token, "chief: a promoted peer dropped its connection");
                    arena.fail_all_inflight();
                    true
                } else {
                    debug!(?token, "chief: a preinit connection dropped");
                    false
                }
            }
            Role::Worker(worker) => {
                if Some(token) != worker.conn_token {
                    return false;
                }
                if worker.connected {
                    error!(?token, "worker: connection to the chief dropped");
                    worker.connected = false;
                    arena.fail_all_inflight();
                    true
                } else {
                    debug!(?token, "worker: connect attempt failed, the transport will retry");
                    false
                }
            }
        },
        PollEvent::Bytes { token, data } => handle_bytes(token, data, role, size, arena),
        PollEvent::WriteComplete { completion, .. } => {
            on_write_complete(completion, arena);
            true
        }
    }
}

fn handle_bytes(token: Token, data: &[u8], role: &mut Role, size: u32, arena: &mut OpArena) -> bool {
    let mut changed = false;
    let mut fatal = false;
    match role {
        Role::Chief(chief) => {
            let already_ranked = chief.registry.rank_of(token);
            let Some(decoder) = chief.registry.decoder_mut(token) else {
                return false;
            };
            let mut frames = Vec::new();
            if decoder.push(data, |f| frames.push(f)).is_err() {
                error!(?token, "chief: unknown wire tag, closing the connection");
                fatal = true;
            }
            for frame in frames {
                match (already_ranked, frame) {
                    (None, Frame::Init { rank }) => match chief.registry.promote(token, rank) {
                        Ok(()) => {
                            debug!(?token, rank, "chief: promoted peer");
                            changed = true;
                        }
                        Err(PromoteError::RankOutOfRange) => {
                            error!(rank, size, "chief: INIT rank out of range");
                            fatal = true;
                        }
                        Err(PromoteError::DuplicateRank) => {
                            error!(rank, "chief: duplicate INIT rank");
                            fatal = true;
                        }
                    },
                    (None, _) => {
                        error!(?token, "chief: non-INIT message on a preinit connection");
                        fatal = true;
                    }
                    (Some(_), Frame::Init { .. }) => {
                        error!(?token, "chief: duplicate INIT on an already-promoted connection");
                        fatal = true;
                    }
                    (Some(rank), Frame::Gather { series, body }) => {
                        let tok = get_op_for_recv(arena, KindTag::Gather, &series, rank, || {
                            Kind::Gather(GatherRole::Chief(ChiefGather::new(size)))
                        });
                        if let Some(op) = arena.get_mut(tok) {
                            record_gather_contribution(op, rank, body);
                            changed = true;
                        }
                    }
                    (Some(_), Frame::Allgather { series, rank, body }) => {
                        let tok = get_op_for_recv(arena, KindTag::Allgather, &series, rank, || {
                            Kind::Allgather(AllgatherRole::Chief(ChiefAllgather::new(size)))
                        });
                        if let Some(op) = arena.get_mut(tok) {
                            record_allgather_contribution(op, rank, body);
                            changed = true;
                        }
                    }
                    (Some(_), Frame::Broadcast { .. }) => {
                        error!(?token, "chief: received a BROADCAST, which only the chief may send");
                        fatal = true;
                    }
                }
                if fatal {
                    break;
                }
            }
        }
        Role::Worker(worker) => {
            let mut frames = Vec::new();
            if worker.decoder.push(data, |f| frames.push(f)).is_err() {
                error!(?token, "worker: unknown wire tag from the chief");
                fatal = true;
            }
            for frame in frames {
                match frame {
                    Frame::Broadcast { series, body } => {
                        let tok = get_op_for_recv(arena, KindTag::Broadcast, &series, 0, || {
                            Kind::Broadcast(BroadcastRole::Worker(WorkerBroadcast { called: false, recvd: None }))
                        });
                        if let Some(op) = arena.get_mut(tok) {
                            record_broadcast_recv(op, body);
                            changed = true;
                        }
                    }
                    Frame::Allgather { series, rank, body } => {
                        let tok = get_op_for_recv(arena, KindTag::Allgather, &series, rank, || {
                            Kind::Allgather(AllgatherRole::Worker(WorkerAllgather::new(size)))
                        });
                        if let Some(op) = arena.get_mut(tok) {
                            record_allgather_contribution(op, rank, body);
                            changed = true;
                        }
                    }
                    Frame::Gather { .. } => {
                        error!("worker: received a GATHER, which only the chief may receive");
                        fatal = true;
                    }
                    Frame::Init { .. } => {
                        error!("worker: received an INIT, which only the chief may receive");
                        fatal = true;
                    }
                }
                if fatal {
                    break;
                }
            }
        }
    }
    if fatal {
        arena.fail_all_inflight();
        changed = true;
    }
    changed
}

fn on_write_complete(token: OpToken, arena: &mut OpArena) {
    let Some(op) = arena.get_mut(token) else {
        return;
    };
    match &mut op.kind {
        Kind::Gather(GatherRole::Worker(_)) => op.ready = true,
        Kind::Broadcast(BroadcastRole::Chief(c)) => {
            c.nsent += 1;
            if c.nsent >= c.target {
                op.ready = true;
            }
        }
        Kind::Allgather(AllgatherRole::Chief(c)) => {
            c.nsent += 1;
            if c.nsent >= c.target {
                op.ready = true;
            }
        }
        // Sending one's own contribution doesn't complete a worker's
        // allgather by itself; that only happens on the receive side,
        // once every slot (including this worker's own, echoed back by
        // the chief) has arrived — see `record_allgather_contribution`.
        Kind::Allgather(AllgatherRole::Worker(_))
        | Kind::Gather(GatherRole::Chief(_))
        | Kind::Broadcast(BroadcastRole::Worker(_)) => {}
    }
}

/// Gives a single inflight operation the chance to issue its pending sends.
/// Safe to call on an already-ready operation (no-op) or repeatedly on one
/// that has already sent everything it needs to (checked via its own
/// `write_started`/`sent` flags).
fn advance_one(token: OpToken, arena: &mut OpArena, driver: &mut TcpDriver<OpToken>, role: &Role) {
    let Some(op) = arena.get_mut(token) else {
        return;
    };
    if op.ready {
        return;
    }
    match &mut op.kind {
        Kind::Gather(GatherRole::Worker(w)) => {
            if w.sent {
                return;
            }
            let Role::Worker(worker) = role else { return };
            let Some(conn) = worker.conn_token else { return };
            if !worker.connected {
                return;
            }
            let body = w.payload.as_slice();
            let mut header = Vec::new();
            if encode::encode_gather_header(&mut header, &op.series, body.len()).is_err() {
                safe_fail_send(op);
                return;
            }
            w.sent = true;
            driver.write_segments(conn, header, body, Some(token));
        }
        Kind::Broadcast(BroadcastRole::Chief(c)) => {
            if c.write_started {
                return;
            }
            let Role::Chief(chief) = role else { return };
            let peers: Vec<Token> = chief.registry.all_peer_tokens().collect();
            c.write_started = true;
            c.target = peers.len();
            if peers.is_empty() {
                op.ready = true;
                return;
            }
            for peer in peers {
                let mut header = Vec::new();
                if encode::encode_broadcast_header(&mut header, &op.series, c.data.len()).is_err() {
                    safe_fail_send(op);
                    return;
                }
                driver.write_segments(peer, header, &c.data, Some(token));
            }
        }
        Kind::Allgather(AllgatherRole::Chief(c)) => {
            if c.write_started || c.nrecvd < c.recvd.len() {
                return;
            }
            let Role::Chief(chief) = role else { return };
            let peers: Vec<Token> = chief.registry.all_peer_tokens().collect();
            c.write_started = true;
            c.target = c.recvd.len() * peers.len();
            if c.target == 0 {
                op.ready = true;
                return;
            }
            for (rank, slot) in c.recvd.iter().enumerate() {
                let Some(data) = slot else {
                    safe_fail_send(op);
                    return;
                };
                for &peer in &peers {
                    let mut header = Vec::new();
                    if encode::encode_allgather_header(&mut header, &op.series, rank as u32, data.len()).is_err() {
                        safe_fail_send(op);
                        return;
                    }
                    driver.write_segments(peer, header, data, Some(token));
                }
            }
        }
        Kind::Allgather(AllgatherRole::Worker(w)) => {
            if w.sent {
                return;
            }
            let Some(payload) = &w.payload else { return };
            let Role::Worker(worker) = role else { return };
            let Some(conn) = worker.conn_token else { return };
            if !worker.connected {
                return;
            }
            let body = payload.as_slice();
            let mut header = Vec::new();
            if encode::encode_allgather_header(&mut header, &op.series, worker.rank, body.len()).is_err() {
                safe_fail_send(op);
                return;
            }
            w.sent = true;
            driver.write_segments(conn, header, body, Some(token));
        }
        // Nothing to send: the chief's gather slot is filled at submit time
        // and on receive; a worker's broadcast op is pure receive.
        Kind::Gather(GatherRole::Chief(_)) | Kind::Broadcast(BroadcastRole::Worker(_)) => {}
    }
}

/// `slen`/body-length overflow at send time is a caller bug — the public API
/// rejects both before an operation is ever created, so this only fires if
/// that invariant is somehow violated. Fails just this operation rather than
/// the whole context.
fn safe_fail_send(op: &mut Operation) {
    flux_utils::safe_panic!("rendezvous-core: encode failed on an operation past submit-time validation");
    op.ok = false;
    op.ready = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// A GATHER is the chief's business only; a worker receiving one is a
    /// protocol violation that must fail every inflight operation.
    #[test]
    fn worker_receiving_gather_is_fatal() {
        let mut role = Role::Worker(WorkerIo::new(1, listen_addr()));
        let mut arena = OpArena::new();
        let token = get_op_for_recv(&mut arena, KindTag::Broadcast, b"x", 0, || {
            Kind::Broadcast(BroadcastRole::Worker(WorkerBroadcast { called: true, recvd: None }))
        });

        let mut buf = Vec::new();
        encode::encode_gather_header(&mut buf, b"x", 3).unwrap();
        buf.extend_from_slice(b"abc");
        let changed = handle_bytes(Token(0), &buf, &mut role, 2, &mut arena);

        assert!(changed);
        let op = arena.get(token).unwrap();
        assert!(op.ready);
        assert!(!op.ok);
    }

    /// A BROADCAST may only be sent by the chief; the chief receiving one
    /// (from a promoted peer) is a protocol violation.
    #[test]
    fn chief_receiving_broadcast_is_fatal() {
        let mut chief = ChiefIo::new(2, listen_addr());
        let token = Token(0);
        chief.registry.insert_preinit(token);
        chief.registry.promote(token, 1).unwrap();
        let mut role = Role::Chief(chief);
        let mut arena = OpArena::new();

        let mut buf = Vec::new();
        encode::encode_broadcast_header(&mut buf, b"x", 1).unwrap();
        buf.push(b'z');
        let changed = handle_bytes(token, &buf, &mut role, 2, &mut arena);

        assert!(changed);
    }

    /// INIT with a rank outside the group must fail the whole context, not
    /// just that connection.
    #[test]
    fn chief_rejects_init_with_rank_out_of_range() {
        let mut role = Role::Chief(ChiefIo::new(2, listen_addr()));
        let token = Token(0);
        if let Role::Chief(chief) = &mut role {
            chief.registry.insert_preinit(token);
        }
        let mut arena = OpArena::new();

        let buf = encode::encode_init(5).to_vec();
        let changed = handle_bytes(token, &buf, &mut role, 2, &mut arena);

        assert!(changed, "an out-of-range INIT rank must be treated as fatal");
    }

    /// Anything other than INIT arriving on a still-unpromoted connection is
    /// fatal — the chief has no way to attribute it to a rank.
    #[test]
    fn chief_rejects_non_init_on_a_preinit_connection() {
        let mut role = Role::Chief(ChiefIo::new(2, listen_addr()));
        let token = Token(0);
        if let Role::Chief(chief) = &mut role {
            chief.registry.insert_preinit(token);
        }
        let mut arena = OpArena::new();

        let mut buf = Vec::new();
        encode::encode_gather_header(&mut buf, b"x", 0).unwrap();
        let changed = handle_bytes(token, &buf, &mut role, 2, &mut arena);

        assert!(changed, "a non-INIT message on a preinit connection must be fatal");
    }
}
