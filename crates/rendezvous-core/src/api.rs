//! Public submit entry points: `gather`/`broadcast`/`allgather`, each in up
//! to three ownership variants, and the [`Op`] handle they return.
//!
//! Every submit validates series/body length against the wire limits before
//! touching the arena; a violation is rejected on the spot (`ok() == false`
//! on await) without ever involving the IO thread.

use std::sync::Arc;

use rendezvous_wire::MAX_SERIES_LEN;

use crate::{
    context::{Context, Shared},
    op::{
        AllgatherRole, BroadcastRole, CallReuse, ChiefAllgather, ChiefBroadcast, ChiefGather, GatherRole, Kind,
        KindTag, OpToken, Payload, WorkerAllgather, WorkerBroadcast, WorkerGather, get_op_for_call,
        record_allgather_contribution, record_broadcast_call, record_gather_contribution,
    },
    result::OpResult,
};

/// A handle to a submitted operation. Await it exactly once: `wait`
/// consumes the handle, unlinking the operation from the arena and moving
/// its data into the returned [`OpResult`].
pub struct Op(OpInner);

enum OpInner {
    Pending { shared: Arc<Shared>, token: OpToken },
    /// Rejected before ever reaching the arena — an oversized series/body,
    /// or a chief broadcast call with no payload.
    Rejected,
}

impl Op {
    fn pending(shared: Arc<Shared>, token: OpToken) -> Self {
        Self(OpInner::Pending { shared, token })
    }

    fn rejected() -> Self {
        Self(OpInner::Rejected)
    }

    /// Blocks until the operation completes or the context closes out from
    /// under it. Always returns a Result; `ok() == false` on rejection,
    /// context closure, or a fatal protocol/connection error.
    pub fn wait(self) -> OpResult {
        match self.0 {
            OpInner::Rejected => OpResult::not_ok(),
            OpInner::Pending { shared, token } => {
                let mut state = shared.wait_until(|s| s.arena.get(token).is_none_or(|op| op.ready));
                match state.arena.remove(token) {
                    Some(op) => op.into_result(),
                    None => OpResult::not_ok(),
                }
            }
        }
    }
}

fn valid_submission(series: &[u8], body_len: usize) -> bool {
    series.len() <= MAX_SERIES_LEN && u32::try_from(body_len).is_ok()
}

/// Submits `body`, transferring ownership — no copy.
pub fn gather(ctx: &Context, series: &[u8], body: Vec<u8>) -> Op {
    submit_gather(ctx, series, Payload::Owned(body))
}

/// Submits a copy of `body`; the caller's buffer is free to reuse
/// immediately.
pub fn gather_copy(ctx: &Context, series: &[u8], body: &[u8]) -> Op {
    submit_gather(ctx, series, Payload::Owned(body.to_vec()))
}

/// Submits `body` by reference.
///
/// # Safety
/// `body` must remain valid, and must not be mutated, until the returned
/// [`Op`] is awaited. On a chief this is read synchronously before the call
/// returns; on a worker the actual network write happens later, on the IO
/// thread, at some unspecified point before the op becomes ready.
pub unsafe fn gather_borrowed(ctx: &Context, series: &[u8], body: &[u8]) -> Op {
    submit_gather(ctx, series, Payload::Borrowed { ptr: body.as_ptr(), len: body.len() })
}

fn submit_gather(ctx: &Context, series: &[u8], payload: Payload) -> Op {
    if !valid_submission(series, payload.as_slice().len()) {
        return Op::rejected();
    }
    let mut state = ctx.shared.lock();
    let token = if ctx.rank == 0 {
        let size = ctx.size;
        let token = get_op_for_call(&mut state.arena, KindTag::Gather, series, CallReuse::IfRecvSlotEmpty(0), || {
            Kind::Gather(GatherRole::Chief(ChiefGather::new(size)))
        });
        if let Some(op) = state.arena.get_mut(token) {
            record_gather_contribution(op, 0, payload.into_box());
        }
        token
    } else {
        state.arena.insert(series, Kind::Gather(GatherRole::Worker(WorkerGather { payload, sent: false })))
    };
    ctx.shared.condvar.notify_all();
    drop(state);
    Op::pending(Arc::clone(&ctx.shared), token)
}

/// Chief's payload is required; workers pass `None` (they only ever
/// receive a broadcast, never originate one).
pub fn broadcast(ctx: &Context, series: &[u8], body: Option<&[u8]>) -> Op {
    if !valid_submission(series, body.map_or(0, <[u8]>::len)) {
        return Op::rejected();
    }
    let mut state = ctx.shared.lock();
    let token = if ctx.rank == 0 {
        let Some(body) = body else {
            return Op::rejected();
        };
        let data: Box<[u8]> = body.to_vec().into_boxed_slice();
        get_op_for_call(&mut state.arena, KindTag::Broadcast, series, CallReuse::Never, || {
            Kind::Broadcast(BroadcastRole::Chief(ChiefBroadcast::new(data)))
        })
    } else {
        let token = get_op_for_call(&mut state.arena, KindTag::Broadcast, series, CallReuse::AnyMatching, || {
            Kind::Broadcast(BroadcastRole::Worker(WorkerBroadcast { called: false, recvd: None }))
        });
        if let Some(op) = state.arena.get_mut(token) {
            record_broadcast_call(op);
        }
        token
    };
    ctx.shared.condvar.notify_all();
    drop(state);
    Op::pending(Arc::clone(&ctx.shared), token)
}

pub fn allgather(ctx: &Context, series: &[u8], body: Vec<u8>) -> Op {
    submit_allgather(ctx, series, Payload::Owned(body))
}

pub fn allgather_copy(ctx: &Context, series: &[u8], body: &[u8]) -> Op {
    submit_allgather(ctx, series, Payload::Owned(body.to_vec()))
}

/// # Safety
/// Same contract as [`gather_borrowed`].
pub unsafe fn allgather_borrowed(ctx: &Context, series: &[u8], body: &[u8]) -> Op {
    submit_allgather(ctx, series, Payload::Borrowed { ptr: body.as_ptr(), len: body.len() })
}

fn submit_allgather(ctx: &Context, series: &[u8], payload: Payload) -> Op {
    if !valid_submission(series, payload.as_slice().len()) {
        return Op::rejected();
    }
    let mut state = ctx.shared.lock();
    let size = ctx.size;
    let token = if ctx.rank == 0 {
        // Same reuse rule as chief gather: a worker's ALLGATHER may already
        // have created this op (holding slots 1..size) before the chief's
        // own call runs — reuse it rather than spawning a second op that
        // can never reach `nrecvd == size` on either side.
        let token =
            get_op_for_call(&mut state.arena, KindTag::Allgather, series, CallReuse::IfRecvSlotEmpty(0), || {
                Kind::Allgather(AllgatherRole::Chief(ChiefAllgather::new(size)))
            });
        if let Some(op) = state.arena.get_mut(token) {
            record_allgather_contribution(op, 0, payload.into_box());
        }
        token
    } else {
        let token = get_op_for_call(&mut state.arena, KindTag::Allgather, series, CallReuse::Never, || {
            Kind::Allgather(AllgatherRole::Worker(WorkerAllgather::new(size)))
        });
        if let Some(op) = state.arena.get_mut(token) {
            if let Kind::Allgather(AllgatherRole::Worker(w)) = &mut op.kind {
                w.payload = Some(payload);
            }
        }
        token
    };
    ctx.shared.condvar.notify_all();
    drop(state);
    Op::pending(Arc::clone(&ctx.shared), token)
}
