//! The operation arena: matching, slot bookkeeping and per-kind state.
//!
//! Operations are addressed by a generation-checked [`OpToken`] into a slab
//! rather than linked through an intrusive list — the natural Rust shape for
//! what the original runtime expressed as a doubly-linked `link_t` threaded
//! through a fixed-size pool.

use crate::result::OpResult;

/// Handle to an in-flight or completed operation. Stable across `Vec`
/// reallocation; the generation guards against a freed-and-reused slot being
/// mistaken for the operation that used to live there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpToken {
    index: u32,
    generation: u32,
}

enum Slot {
    Empty { generation: u32, next_free: Option<u32> },
    Occupied { generation: u32, op: Operation },
}

/// A raw pointer/length pair, written once by the `_nofree` submit variants.
///
/// # Safety
/// The pointee must stay valid and unaliased-for-writes until the write
/// completion for the owning operation fires.
pub(crate) enum Payload {
    Owned(Vec<u8>),
    Borrowed { ptr: *const u8, len: usize },
}

// Safety contract lives with the caller of the `_nofree` submit functions,
// who is required to keep the buffer alive and not mutate it concurrently —
// same single-writer borrow discipline the original C API documented.
unsafe impl Send for Payload {}

impl Payload {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Owned(v) => v,
            // SAFETY: upheld by whoever constructed this Borrowed payload.
            Payload::Borrowed { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
        }
    }

    /// Copies (or, for the owned variant, moves) this payload into a boxed
    /// slice. Used for the chief's own contribution to a gather/allgather,
    /// which is read synchronously at submit time — no write completion to
    /// wait for, so even a borrowed payload's raw pointer is only ever
    /// dereferenced while the caller's borrow is known to still be valid.
    pub(crate) fn into_box(self) -> Box<[u8]> {
        match self {
            Payload::Owned(v) => v.into_boxed_slice(),
            Payload::Borrowed { ptr, len } => {
                // SAFETY: same contract as `as_slice`, upheld synchronously here.
                unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec().into_boxed_slice()
            }
        }
    }
}

pub(crate) struct ChiefGather {
    pub(crate) recvd: Vec<Option<Box<[u8]>>>,
    pub(crate) nrecvd: usize,
}

impl ChiefGather {
    pub(crate) fn new(size: u32) -> Self {
        Self { recvd: vec![None; size as usize], nrecvd: 0 }
    }
}

pub(crate) struct WorkerGather {
    pub(crate) payload: Payload,
    pub(crate) sent: bool,
}

pub(crate) struct ChiefBroadcast {
    pub(crate) data: Box<[u8]>,
    pub(crate) write_started: bool,
    pub(crate) nsent: usize,
    /// Number of completions that mean "done"; fixed at `write_started` time
    /// (the peer table never changes mid-flight — a dropped peer is fatal to
    /// the whole context, see `close_everything`).
    pub(crate) target: usize,
}

impl ChiefBroadcast {
    pub(crate) fn new(data: Box<[u8]>) -> Self {
        Self { data, write_started: false, nsent: 0, target: 0 }
    }
}

pub(crate) struct WorkerBroadcast {
    pub(crate) called: bool,
    pub(crate) recvd: Option<Box<[u8]>>,
}

pub(crate) struct ChiefAllgather {
    pub(crate) recvd: Vec<Option<Box<[u8]>>>,
    pub(crate) nrecvd: usize,
    pub(crate) write_started: bool,
    pub(crate) nsent: usize,
    pub(crate) target: usize,
}

impl ChiefAllgather {
    pub(crate) fn new(size: u32) -> Self {
        Self { recvd: vec![None; size as usize], nrecvd: 0, write_started: false, nsent: 0, target: 0 }
    }
}

pub(crate) struct WorkerAllgather {
    pub(crate) payload: Option<Payload>,
    pub(crate) sent: bool,
    pub(crate) recvd: Vec<Option<Box<[u8]>>>,
    pub(crate) nrecvd: usize,
}

impl WorkerAllgather {
    pub(crate) fn new(size: u32) -> Self {
        Self { payload: None, sent: false, recvd: vec![None; size as usize], nrecvd: 0 }
    }
}

pub(crate) enum GatherRole {
    Chief(ChiefGather),
    Worker(WorkerGather),
}

pub(crate) enum BroadcastRole {
    Chief(ChiefBroadcast),
    Worker(WorkerBroadcast),
}

pub(crate) enum AllgatherRole {
    Chief(ChiefAllgather),
    Worker(WorkerAllgather),
}

pub(crate) enum Kind {
    Gather(GatherRole),
    Broadcast(BroadcastRole),
    Allgather(AllgatherRole),
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum KindTag {
    Gather,
    Broadcast,
    Allgather,
}

impl Kind {
    pub(crate) fn tag(&self) -> KindTag {
        match self {
            Kind::Gather(_) => KindTag::Gather,
            Kind::Broadcast(_) => KindTag::Broadcast,
            Kind::Allgather(_) => KindTag::Allgather,
        }
    }
}

pub(crate) struct Operation {
    pub(crate) series: Box<[u8]>,
    pub(crate) ready: bool,
    pub(crate) ok: bool,
    pub(crate) kind: Kind,
}

impl Operation {
    fn new(series: &[u8], kind: Kind) -> Self {
        Self { series: series.into(), ready: false, ok: true, kind }
    }

    fn matches(&self, tag: KindTag, series: &[u8]) -> bool {
        self.kind.tag() == tag && &*self.series == series
    }

    /// Consumes a finished operation (failed or completed) into the
    /// [`OpResult`] handed back from `await`. Called once, right after the
    /// operation is unlinked from the arena.
    pub(crate) fn into_result(self) -> OpResult {
        if !self.ok {
            return OpResult::not_ok();
        }
        match self.kind {
            Kind::Gather(GatherRole::Chief(c)) => OpResult::ok_with(
                c.recvd.into_iter().map(|slot| slot.expect("ready gather has every slot filled")).collect(),
            ),
            Kind::Gather(GatherRole::Worker(_)) => OpResult::ok_empty(),
            Kind::Broadcast(BroadcastRole::Chief(c)) => OpResult::ok_with(vec![c.data]),
            Kind::Broadcast(BroadcastRole::Worker(w)) => {
                OpResult::ok_with(vec![w.recvd.expect("ready worker broadcast has received its payload")])
            }
            Kind::Allgather(AllgatherRole::Chief(c)) => OpResult::ok_with(
                c.recvd.into_iter().map(|slot| slot.expect("ready allgather has every slot filled")).collect(),
            ),
            Kind::Allgather(AllgatherRole::Worker(w)) => OpResult::ok_with(
                w.recvd.into_iter().map(|slot| slot.expect("ready allgather has every slot filled")).collect(),
            ),
        }
    }
}

/// Whether an already-inflight operation matching `(kind, series)` is reused
/// by a *call*-path submission, and how to pick it.
pub(crate) enum CallReuse {
    /// Always start a fresh operation (chief broadcast; worker/chief
    /// allgather — see module docs on the ordering assumption this relies
    /// on for allgather).
    Never,
    /// Reuse an inflight operation whose receive slot at this index is still
    /// empty (chief gather: slot 0).
    IfRecvSlotEmpty(u32),
    /// Reuse the first inflight operation with a matching series, whichever
    /// it is (worker broadcast — ambiguous with concurrent series by
    /// design, see `SPEC_FULL.md`).
    AnyMatching,
}

/// Slab of operations, addressed by generation-checked [`OpToken`].
pub(crate) struct OpArena {
    slots: Vec<Slot>,
    free_head: Option<u32>,
}

impl OpArena {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new(), free_head: None }
    }

    pub(crate) fn get(&self, token: OpToken) -> Option<&Operation> {
        match self.slots.get(token.index as usize)? {
            Slot::Occupied { generation, op } if *generation == token.generation => Some(op),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, token: OpToken) -> Option<&mut Operation> {
        match self.slots.get_mut(token.index as usize)? {
            Slot::Occupied { generation, op } if *generation == token.generation => Some(op),
            _ => None,
        }
    }

    pub(crate) fn insert(&mut self, series: &[u8], kind: Kind) -> OpToken {
        let op = Operation::new(series, kind);
        match self.free_head {
            Some(idx) => {
                let i = idx as usize;
                let Slot::Empty { generation, next_free } = self.slots[i] else {
                    unreachable!("free list points at an occupied slot");
                };
                self.free_head = next_free;
                self.slots[i] = Slot::Occupied { generation, op };
                OpToken { index: idx, generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot::Occupied { generation: 0, op });
                OpToken { index, generation: 0 }
            }
        }
    }

    /// Removes a completed operation from the arena, returning it so the
    /// caller can build an [`crate::result::OpResult`] out of its data.
    pub(crate) fn remove(&mut self, token: OpToken) -> Option<Operation> {
        match self.slots.get(token.index as usize)? {
            Slot::Occupied { generation, .. } if *generation == token.generation => {}
            _ => return None,
        }
        let old = std::mem::replace(
            &mut self.slots[token.index as usize],
            Slot::Empty { generation: token.generation.wrapping_add(1), next_free: self.free_head },
        );
        self.free_head = Some(token.index);
        match old {
            Slot::Occupied { op, .. } => Some(op),
            Slot::Empty { .. } => None,
        }
    }

    pub(crate) fn iter_inflight_mut(&mut self) -> impl Iterator<Item = (OpToken, &mut Operation)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied { generation, op } if !op.ready => {
                Some((OpToken { index: i as u32, generation: *generation }, op))
            }
            _ => None,
        })
    }

    pub(crate) fn mark_ok(&mut self, token: OpToken) {
        if let Some(op) = self.get_mut(token) {
            op.ready = true;
        }
    }

    /// Terminates every inflight operation as not-ok — used on close and on
    /// a fatal protocol/connection error, which the whole context treats as
    /// unrecoverable.
    pub(crate) fn fail_all_inflight(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Occupied { op, .. } = slot {
                if !op.ready {
                    op.ready = true;
                    op.ok = false;
                }
            }
        }
    }
}

pub(crate) fn get_op_for_recv(
    arena: &mut OpArena,
    tag: KindTag,
    series: &[u8],
    sender_rank: u32,
    make_new: impl FnOnce() -> Kind,
) -> OpToken {
    for (token, op) in arena.iter_inflight_mut() {
        if op.matches(tag, series) && recv_slot_is_empty(&op.kind, sender_rank) {
            return token;
        }
    }
    arena.insert(series, make_new())
}

pub(crate) fn get_op_for_call(
    arena: &mut OpArena,
    tag: KindTag,
    series: &[u8],
    reuse: CallReuse,
    make_new: impl FnOnce() -> Kind,
) -> OpToken {
    match reuse {
        CallReuse::Never => {}
        CallReuse::IfRecvSlotEmpty(rank) => {
            for (token, op) in arena.iter_inflight_mut() {
                if op.matches(tag, series) && recv_slot_is_empty(&op.kind, rank) {
                    return token;
                }
            }
        }
        CallReuse::AnyMatching => {
            for (token, op) in arena.iter_inflight_mut() {
                if op.matches(tag, series) {
                    return token;
                }
            }
        }
    }
    arena.insert(series, make_new())
}

/// Records a gather contribution from `rank` (0 is the chief's own, filled
/// synchronously at submit time; others arrive over the wire) and flips
/// `ready` once every slot is full. Slot monotonicity (empty -> filled,
/// never back) is upheld by the matching rule in [`get_op_for_recv`]/
/// [`get_op_for_call`], which only ever hands back an operation whose slot
/// for this rank is still empty.
pub(crate) fn record_gather_contribution(op: &mut Operation, rank: u32, data: Box<[u8]>) {
    let Kind::Gather(GatherRole::Chief(c)) = &mut op.kind else {
        return;
    };
    let slot = &mut c.recvd[rank as usize];
    if slot.is_none() {
        *slot = Some(data);
        c.nrecvd += 1;
    }
    if c.nrecvd == c.recvd.len() {
        op.ready = true;
    }
}

/// Records one contributor's slot in an allgather, on either role. Unlike
/// gather, reaching `nrecvd == size` on the chief doesn't complete the
/// operation by itself — it only unblocks the fanout send, which
/// `advance` picks up on the next tick.
pub(crate) fn record_allgather_contribution(op: &mut Operation, rank: u32, data: Box<[u8]>) {
    match &mut op.kind {
        Kind::Allgather(AllgatherRole::Chief(c)) => {
            let slot = &mut c.recvd[rank as usize];
            if slot.is_none() {
                *slot = Some(data);
                c.nrecvd += 1;
            }
        }
        Kind::Allgather(AllgatherRole::Worker(w)) => {
            let slot = &mut w.recvd[rank as usize];
            if slot.is_none() {
                *slot = Some(data);
                w.nrecvd += 1;
            }
            if w.nrecvd == w.recvd.len() {
                op.ready = true;
            }
        }
        _ => {}
    }
}

/// Records a broadcast arrival on a worker and completes the operation once
/// both the local call and the receive have happened, in either order.
pub(crate) fn record_broadcast_recv(op: &mut Operation, data: Box<[u8]>) {
    let Kind::Broadcast(BroadcastRole::Worker(w)) = &mut op.kind else {
        return;
    };
    if w.recvd.is_none() {
        w.recvd = Some(data);
    }
    if w.called && w.recvd.is_some() {
        op.ready = true;
    }
}

/// Records a worker's own broadcast call and completes the operation once
/// both the local call and the receive have happened, in either order.
pub(crate) fn record_broadcast_call(op: &mut Operation) {
    let Kind::Broadcast(BroadcastRole::Worker(w)) = &mut op.kind else {
        return;
    };
    w.called = true;
    if w.recvd.is_some() {
        op.ready = true;
    }
}

fn recv_slot_is_empty(kind: &Kind, rank: u32) -> bool {
    match kind {
        Kind::Gather(GatherRole::Chief(c)) => c.recvd[rank as usize].is_none(),
        Kind::Allgather(AllgatherRole::Chief(c)) => c.recvd[rank as usize].is_none(),
        Kind::Allgather(AllgatherRole::Worker(w)) => w.recvd[rank as usize].is_none(),
        Kind::Broadcast(BroadcastRole::Worker(w)) => w.recvd.is_none(),
        // Chief never receives BROADCAST, workers never receive GATHER —
        // callers reject those before ever consulting the arena.
        Kind::Gather(GatherRole::Worker(_)) | Kind::Broadcast(BroadcastRole::Chief(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chief_gather(size: u32) -> Kind {
        Kind::Gather(GatherRole::Chief(ChiefGather::new(size)))
    }

    #[test]
    fn fresh_operation_created_when_nothing_matches() {
        let mut arena = OpArena::new();
        let token = get_op_for_recv(&mut arena, KindTag::Gather, b"a", 1, || chief_gather(4));
        assert!(arena.get(token).is_some());
    }

    #[test]
    fn recv_reuses_inflight_operation_with_same_series_and_empty_slot() {
        let mut arena = OpArena::new();
        let t1 = get_op_for_recv(&mut arena, KindTag::Gather, b"a", 1, || chief_gather(4));
        if let Kind::Gather(GatherRole::Chief(c)) = &mut arena.get_mut(t1).unwrap().kind {
            c.recvd[1] = Some(Box::from(&b"x"[..]));
            c.nrecvd += 1;
        }
        let t2 = get_op_for_recv(&mut arena, KindTag::Gather, b"a", 2, || chief_gather(4));
        assert_eq!(t1, t2, "same series should land in the same operation");
    }

    #[test]
    fn distinct_series_never_share_an_operation() {
        let mut arena = OpArena::new();
        let t1 = get_op_for_recv(&mut arena, KindTag::Gather, b"a", 1, || chief_gather(4));
        let t2 = get_op_for_recv(&mut arena, KindTag::Gather, b"b", 1, || chief_gather(4));
        assert_ne!(t1, t2);
    }

    #[test]
    fn recv_skips_an_inflight_operation_whose_slot_is_already_filled() {
        let mut arena = OpArena::new();
        let t1 = get_op_for_recv(&mut arena, KindTag::Gather, b"a", 1, || chief_gather(4));
        if let Kind::Gather(GatherRole::Chief(c)) = &mut arena.get_mut(t1).unwrap().kind {
            c.recvd[1] = Some(Box::from(&b"x"[..]));
        }
        // A second message claiming to also be from rank 1 on the same
        // series must open a *new* operation, not collide with the first.
        let t2 = get_op_for_recv(&mut arena, KindTag::Gather, b"a", 1, || chief_gather(4));
        assert_ne!(t1, t2);
    }

    #[test]
    fn chief_gather_call_reuses_op_with_empty_slot_zero() {
        let mut arena = OpArena::new();
        let recv_token = get_op_for_recv(&mut arena, KindTag::Gather, b"a", 1, || chief_gather(4));
        let call_token = get_op_for_call(
            &mut arena,
            KindTag::Gather,
            b"a",
            CallReuse::IfRecvSlotEmpty(0),
            || chief_gather(4),
        );
        assert_eq!(recv_token, call_token);
    }

    #[test]
    fn chief_broadcast_call_never_reuses() {
        let mut arena = OpArena::new();
        let make = || Kind::Broadcast(BroadcastRole::Chief(ChiefBroadcast::new(Box::from(&b"x"[..]))));
        let t1 = get_op_for_call(&mut arena, KindTag::Broadcast, b"a", CallReuse::Never, make);
        let t2 = get_op_for_call(&mut arena, KindTag::Broadcast, b"a", CallReuse::Never, make);
        assert_ne!(t1, t2);
    }

    #[test]
    fn generation_guards_against_stale_tokens() {
        let mut arena = OpArena::new();
        let t1 = get_op_for_recv(&mut arena, KindTag::Gather, b"a", 1, || chief_gather(4));
        arena.remove(t1);
        let t2 = get_op_for_recv(&mut arena, KindTag::Gather, b"b", 1, || chief_gather(4));
        assert!(arena.get(t1).is_none(), "stale token must not resolve after reuse");
        assert!(arena.get(t2).is_some());
    }

    #[test]
    fn fail_all_inflight_marks_ready_and_not_ok() {
        let mut arena = OpArena::new();
        let t1 = get_op_for_recv(&mut arena, KindTag::Gather, b"a", 1, || chief_gather(4));
        arena.fail_all_inflight();
        let op = arena.get(t1).unwrap();
        assert!(op.ready);
        assert!(!op.ok);
    }
}
