use std::{net::TcpListener, thread, time::Duration};

use rendezvous_core::{Context, api};

fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = l.local_addr().unwrap().port();
    drop(l);
    port
}

fn open(rank: u32, size: u32, port: u16) -> Context {
    Context::open(rank, size, rank, size, 0, 1, "127.0.0.1", &port.to_string())
        .unwrap_or_else(|e| panic!("rank {rank} failed to open: {e}"))
}

/// Two series submitted out of order by every rank must resolve into two
/// distinct operations, matched by series rather than submission order.
#[test]
fn interleaved_gathers_resolve_by_series() {
    let size = 3;
    let port = free_port();

    let chief = thread::spawn(move || {
        let ctx = open(0, size, port);
        let a = api::gather(&ctx, b"a", b"chief".to_vec());
        let b = api::gather(&ctx, b"b", b"CHIEF".to_vec());
        (a.wait(), b.wait())
    });

    for (rank, lower, upper) in [(1u32, "worker1", "WORKER1"), (2, "worker 2", "WORKER 2")] {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let ctx = open(rank, size, port);
            let a = api::gather(&ctx, b"a", lower.as_bytes().to_vec());
            let b = api::gather(&ctx, b"b", upper.as_bytes().to_vec());
            let ra = a.wait();
            let rb = b.wait();
            assert!(ra.ok() && rb.ok());
            // a worker's own gather result carries nothing back
            assert_eq!(ra.count(), 0);
            assert_eq!(rb.count(), 0);
        });
    }

    let (mut ra, mut rb) = chief.join().unwrap();
    assert!(ra.ok());
    assert_eq!(ra.take(0).as_deref(), Some(&b"chief"[..]));
    assert_eq!(ra.take(1).as_deref(), Some(&b"worker1"[..]));
    assert_eq!(ra.take(2).as_deref(), Some(&b"worker 2"[..]));

    assert!(rb.ok());
    assert_eq!(rb.take(0).as_deref(), Some(&b"CHIEF"[..]));
    assert_eq!(rb.take(1).as_deref(), Some(&b"WORKER1"[..]));
    assert_eq!(rb.take(2).as_deref(), Some(&b"WORKER 2"[..]));
}

#[test]
fn broadcast_fans_the_chiefs_payload_out_to_every_worker() {
    let size = 3;
    let port = free_port();

    let chief = thread::spawn(move || {
        let ctx = open(0, size, port);
        api::broadcast(&ctx, b"x", Some(b"bchief")).wait()
    });

    let workers: Vec<_> = (1..size)
        .map(|rank| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let ctx = open(rank, size, port);
                api::broadcast(&ctx, b"x", None).wait()
            })
        })
        .collect();

    let mut chief_result = chief.join().unwrap();
    assert!(chief_result.ok());
    assert_eq!(chief_result.take(0).as_deref(), Some(&b"bchief"[..]));

    for handle in workers {
        let mut result = handle.join().unwrap();
        assert!(result.ok());
        assert_eq!(result.take(0).as_deref(), Some(&b"bchief"[..]));
    }
}

/// The chief submits its own broadcast call well after every worker has
/// already called in (and is blocked waiting to receive) — covers the
/// ordering the readiness gate in `io_thread` depends on: sends must wait
/// for the whole group to connect regardless of how early the chief's own
/// call landed in the inflight set, and a worker call that arrives long
/// before the payload must still be matched against the same operation
/// once it does.
#[test]
fn broadcast_completes_when_workers_call_in_before_the_chief_submits() {
    let size = 3;
    let port = free_port();

    let chief = thread::spawn(move || {
        let ctx = open(0, size, port);
        thread::sleep(Duration::from_millis(150));
        api::broadcast(&ctx, b"x", Some(b"bchief")).wait()
    });

    let workers: Vec<_> = (1..size)
        .map(|rank| {
            thread::spawn(move || {
                let ctx = open(rank, size, port);
                api::broadcast(&ctx, b"x", None).wait()
            })
        })
        .collect();

    let mut chief_result = chief.join().unwrap();
    assert!(chief_result.ok());
    assert_eq!(chief_result.take(0).as_deref(), Some(&b"bchief"[..]));

    for handle in workers {
        let mut result = handle.join().unwrap();
        assert!(result.ok());
        assert_eq!(result.take(0).as_deref(), Some(&b"bchief"[..]));
    }
}

#[test]
fn allgather_assembles_every_ranks_contribution_in_rank_order() {
    let size = 3;
    let port = free_port();
    let payloads = ["ag0", "ag1", "ag2"];

    let chief = thread::spawn(move || {
        let ctx = open(0, size, port);
        api::allgather(&ctx, b"x", payloads[0].as_bytes().to_vec()).wait()
    });

    let workers: Vec<_> = (1..size)
        .map(|rank| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let ctx = open(rank, size, port);
                api::allgather(&ctx, b"x", payloads[rank as usize].as_bytes().to_vec()).wait()
            })
        })
        .collect();

    let mut chief_result = chief.join().unwrap();
    assert!(chief_result.ok());
    for (rank, expected) in payloads.iter().enumerate() {
        assert_eq!(chief_result.take(rank).as_deref(), Some(expected.as_bytes()));
    }

    for handle in workers {
        let mut result = handle.join().unwrap();
        assert!(result.ok());
        for (rank, expected) in payloads.iter().enumerate() {
            assert_eq!(result.take(rank).as_deref(), Some(expected.as_bytes()));
        }
    }
}

/// A worker's contribution can reach the chief before the chief ever calls
/// in — `get_op_for_recv` creates the chief-side op off that first ALLGATHER,
/// holding every worker slot but slot 0 empty. The chief's later call must
/// reuse that same op (`CallReuse::IfRecvSlotEmpty(0)`, mirroring chief
/// gather) rather than spawning a second one that can never fill both halves.
#[test]
fn allgather_reuses_the_op_a_workers_contribution_already_started() {
    let size = 3;
    let port = free_port();
    let payloads = ["ag0", "ag1", "ag2"];

    let chief = thread::spawn(move || {
        let ctx = open(0, size, port);
        thread::sleep(Duration::from_millis(150));
        api::allgather(&ctx, b"x", payloads[0].as_bytes().to_vec()).wait()
    });

    let workers: Vec<_> = (1..size)
        .map(|rank| {
            thread::spawn(move || {
                let ctx = open(rank, size, port);
                api::allgather(&ctx, b"x", payloads[rank as usize].as_bytes().to_vec()).wait()
            })
        })
        .collect();

    let mut chief_result = chief.join().unwrap();
    assert!(chief_result.ok());
    for (rank, expected) in payloads.iter().enumerate() {
        assert_eq!(chief_result.take(rank).as_deref(), Some(expected.as_bytes()));
    }

    for handle in workers {
        let mut result = handle.join().unwrap();
        assert!(result.ok());
        for (rank, expected) in payloads.iter().enumerate() {
            assert_eq!(result.take(rank).as_deref(), Some(expected.as_bytes()));
        }
    }
}

/// A chief whose only peer never shows up must still open promptly; closing
/// it out from under a pending call resolves the call as failed rather than
/// hanging forever.
#[test]
fn close_races_a_pending_submission() {
    let port = free_port();
    let mut ctx = open(0, 2, port);
    let op = api::gather(&ctx, b"x", b"payload".to_vec());
    ctx.close();
    let result = op.wait();
    assert!(!result.ok());
}

/// Opening a chief with no workers connected must return immediately, not
/// block until the group is full.
#[test]
fn open_does_not_wait_for_the_whole_group() {
    let port = free_port();
    let started = std::time::Instant::now();
    let mut ctx = open(0, 4, port);
    assert!(started.elapsed() < Duration::from_secs(1), "open() blocked waiting for peers");
    ctx.close();
}
