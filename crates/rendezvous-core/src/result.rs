//! The outcome of an awaited operation: a flat list of buffers, taken at
//! most once each. Dropping the result frees anything still unretrieved —
//! there's no explicit `free`, `Vec`/`Box` drop glue already does the job.

/// Result of an awaited collective operation.
///
/// `ok()` is `false` for an operation that never completed (the context was
/// closed, or a fatal protocol/connection error tore it down) — in that
/// case `count()` is always zero. On success, `count()` reflects the kind:
/// zero for a worker's gather contribution, one for a broadcast, and `size`
/// for a chief gather or any allgather.
pub struct OpResult {
    ok: bool,
    buffers: Vec<Option<Box<[u8]>>>,
}

impl OpResult {
    pub(crate) fn not_ok() -> Self {
        Self { ok: false, buffers: Vec::new() }
    }

    pub(crate) fn ok_empty() -> Self {
        Self { ok: true, buffers: Vec::new() }
    }

    pub(crate) fn ok_with(buffers: Vec<Box<[u8]>>) -> Self {
        Self { ok: true, buffers: buffers.into_iter().map(Some).collect() }
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    /// Length of buffer `i`, or `None` if `i` is out of range or already
    /// taken.
    pub fn len(&self, i: usize) -> Option<usize> {
        self.buffers.get(i)?.as_ref().map(|b| b.len())
    }

    pub fn is_empty(&self, i: usize) -> Option<bool> {
        self.len(i).map(|n| n == 0)
    }

    /// Borrows buffer `i` without taking ownership.
    pub fn peek(&self, i: usize) -> Option<&[u8]> {
        self.buffers.get(i)?.as_deref()
    }

    /// Takes buffer `i`, leaving `None` in its place. Each slot can be taken
    /// only once.
    pub fn take(&mut self, i: usize) -> Option<Box<[u8]>> {
        self.buffers.get_mut(i)?.take()
    }
}
