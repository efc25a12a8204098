//! Lifecycle and cross-thread handoff: the IO thread owns the transport and
//! the operation arena; application threads submit and await through a
//! shared `Mutex<State>` + `Condvar`, the same handoff primitives the
//! reference stack reaches for over a dedicated channel crate (see
//! `DESIGN.md`).

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::JoinHandle,
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    error::OpenError,
    io::{ChiefIo, IoState, Role, WorkerIo},
    op::OpArena,
    resolve::resolve,
};

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Prestart,
    Running,
    Stopping,
    Done,
}

pub(crate) struct State {
    pub(crate) arena: OpArena,
    pub(crate) status: Status,
    close_requested: bool,
}

pub(crate) struct Shared {
    pub(crate) mutex: Mutex<State>,
    pub(crate) condvar: Condvar,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks until `ready` or the context has stopped accepting work.
    pub(crate) fn wait_until(&self, ready: impl Fn(&State) -> bool) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        while !ready(&state) && state.status != Status::Stopping && state.status != Status::Done {
            state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state
    }
}

/// A handle to one participant (chief or worker) in a collective group. One
/// IO thread per `Context`, spawned by [`Context::open`] and joined by
/// [`Context::close`].
pub struct Context {
    pub(crate) shared: Arc<Shared>,
    pub(crate) rank: u32,
    pub(crate) size: u32,
    local_rank: u32,
    local_size: u32,
    cross_rank: u32,
    cross_size: u32,
    thread: Option<JoinHandle<()>>,
}

/// How long the IO thread naps between ticks when nothing changed — this is
/// a cooperative, non-blocking event loop (`mio` polls with a zero timeout),
/// not a blocking one, so it needs some pacing or it would spin.
const IDLE_TICK: Duration = Duration::from_millis(1);

impl Context {
    /// Brings a chief (`rank == 0`) or worker up. Blocks until the IO thread
    /// has started (bound a listener, or kicked off its dial) — not until
    /// the whole group has assembled; a context can be opened, submitted to
    /// and closed with peers never connecting, see `tests/` for that case.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        rank: u32,
        size: u32,
        local_rank: u32,
        local_size: u32,
        cross_rank: u32,
        cross_size: u32,
        chief_host: &str,
        chief_svc: &str,
    ) -> Result<Self, OpenError> {
        if rank >= size {
            return Err(OpenError::InvalidConfig { rank, size });
        }

        let addrs = resolve(chief_host, chief_svc)?;
        let role = if rank == 0 {
            let listen_addr = *addrs.first().ok_or(OpenError::ListenFailed)?;
            Role::Chief(ChiefIo::new(size, listen_addr))
        } else {
            // Workers try each resolved address in order; see `io::WorkerIo`
            // for why this core keeps to the first one rather than cycling.
            let addr = *addrs.first().ok_or(OpenError::ResolveFailed)?;
            Role::Worker(WorkerIo::new(rank, addr))
        };

        let mut io = IoState::new(role, size);
        io.start().map_err(|e| {
            warn!("couldn't bring up the transport: {e}");
            e
        })?;

        let shared = Arc::new(Shared {
            mutex: Mutex::new(State { arena: OpArena::new(), status: Status::Prestart, close_requested: false }),
            condvar: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("rendezvous-io".into())
            .spawn(move || io_thread(thread_shared, io))
            .map_err(|_| OpenError::ThreadSpawn)?;

        // Wait for the IO thread's first tick, not for the group to finish
        // assembling — a context with peers that never connect is valid
        // (they just never complete) and must not make `open` hang.
        drop(shared.wait_until(|s| s.status != Status::Prestart));

        debug!(rank, size, "context open");
        Ok(Self { shared, rank, size, local_rank, local_size, cross_rank, cross_size, thread: Some(thread) })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn local_rank(&self) -> u32 {
        self.local_rank
    }

    pub fn local_size(&self) -> u32 {
        self.local_size
    }

    pub fn cross_rank(&self) -> u32 {
        self.cross_rank
    }

    pub fn cross_size(&self) -> u32 {
        self.cross_size
    }

    /// Terminates all outstanding operations as not-ok and tears the
    /// transport down. Idempotent: closing an already-closed context is a
    /// no-op.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.lock();
            if state.close_requested {
                return;
            }
            state.close_requested = true;
            self.shared.condvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_thread(shared: Arc<Shared>, mut io: IoState) {
    let mut group_ready_logged = false;
    loop {
        let mut state = shared.lock();
        if state.close_requested {
            state.status = Status::Stopping;
            io.close_everything();
            state.arena.fail_all_inflight();
            state.status = Status::Done;
            shared.condvar.notify_all();
            return;
        }

        let _ = io.start();
        let mut changed = io.poll(&mut state.arena);

        // §4.6: readiness is checked *before* operations are ever advanced —
        // a chief with no peers yet must not be allowed to "complete" a
        // broadcast/allgather fanout against an empty peer set.
        let ready = io.ready();
        if ready {
            io.advance_all(&mut state.arena);
        }

        if state.status == Status::Prestart {
            state.status = Status::Running;
            changed = true;
        }
        if !group_ready_logged && ready {
            group_ready_logged = true;
            debug!("every peer has connected");
        }

        if changed {
            shared.condvar.notify_all();
        }
        drop(state);
        std::thread::sleep(IDLE_TICK);
    }
}
