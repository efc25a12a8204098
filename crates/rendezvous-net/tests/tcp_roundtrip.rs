use std::{
    net::{Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use rendezvous_net::tcp::{PollEvent, TcpDriver};

fn pump<T>(driver: &mut TcpDriver<T>, for_how_long: Duration, mut on_event: impl FnMut(PollEvent<'_, T>)) {
    let deadline = std::time::Instant::now() + for_how_long;
    while std::time::Instant::now() < deadline {
        while driver.poll_with(&mut on_event) {}
        thread::sleep(Duration::from_millis(1));
    }
}

/// Server listens, client connects and sends a message, server echoes it
/// back, client observes the echo.
#[test]
fn echo_roundtrip() {
    let probe = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let server = thread::spawn(move || {
        let mut driver: TcpDriver<()> = TcpDriver::default();
        driver.listen_at(addr).expect("failed to listen");

        let mut peer = None;
        let mut received = Vec::new();
        pump(&mut driver, Duration::from_secs(5), |event| match event {
            PollEvent::Accept { stream, .. } => peer = Some(stream),
            PollEvent::Bytes { data, .. } => received.extend_from_slice(data),
            _ => {}
        });
        let peer = peer.expect("never accepted a connection");
        driver.write(peer, received.clone(), None);
        pump(&mut driver, Duration::from_millis(200), |_| {});
        received
    });

    thread::sleep(Duration::from_millis(50));

    let mut client: TcpDriver<()> = TcpDriver::default();
    client.connect(addr);

    let mut connected_token = None;
    pump(&mut client, Duration::from_secs(5), |event| {
        if let PollEvent::Accept { stream, .. } = event {
            connected_token = Some(stream);
        }
    });
    let token = connected_token.expect("client never connected");
    client.write(token, b"hello rendezvous".to_vec(), None);

    let mut echoed = Vec::new();
    pump(&mut client, Duration::from_secs(5), |event| {
        if let PollEvent::Bytes { data, .. } = event {
            echoed.extend_from_slice(data);
        }
    });

    assert_eq!(echoed, b"hello rendezvous");
    let server_saw = server.join().expect("server thread panicked");
    assert_eq!(server_saw, b"hello rendezvous");
}

/// Completion tokens surface exactly once, after the bytes actually left the
/// backlog, even on a connection that forces backpressure first.
#[test]
fn write_completion_fires_after_backlog_drains() {
    let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = listener.local_addr().unwrap();

    let collector = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        // Let the backlog build before reading anything.
        thread::sleep(Duration::from_millis(200));
        let mut buf = Vec::new();
        use std::io::Read;
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let _ = stream.read_to_end(&mut buf);
        buf
    });

    let mut sender: TcpDriver<u32> = TcpDriver::default().with_socket_buf_size(4096);
    sender.connect(addr);

    let mut token = None;
    pump(&mut sender, Duration::from_secs(5), |event| {
        if let PollEvent::Accept { stream, .. } = event {
            token = Some(stream);
        }
    });
    let token = token.expect("sender never connected");

    let payload = vec![7_u8; 1024 * 1024];
    sender.write(token, payload, Some(42));

    let mut fired = false;
    pump(&mut sender, Duration::from_secs(5), |event| {
        if let PollEvent::WriteComplete { completion, .. } = event {
            assert_eq!(completion, 42);
            fired = true;
        }
    });

    assert!(fired, "write completion never fired");
    let received = collector.join().expect("collector thread panicked");
    assert_eq!(received.len(), 1024 * 1024);
    assert!(received.iter().all(|&b| b == 7));
}

/// `write_segments` must deliver `header ++ body` as a single logical
/// message on the wire, indistinguishable from a single `write` of the
/// concatenation, whether or not the vectored call happens to complete in
/// one syscall.
#[test]
fn write_segments_delivers_header_then_body_unsplit() {
    let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = listener.local_addr().unwrap();

    let collector = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = Vec::new();
        use std::io::Read;
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let _ = stream.read_to_end(&mut buf);
        buf
    });

    let mut sender: TcpDriver<u32> = TcpDriver::default();
    sender.connect(addr);

    let mut token = None;
    pump(&mut sender, Duration::from_secs(5), |event| {
        if let PollEvent::Accept { stream, .. } = event {
            token = Some(stream);
        }
    });
    let token = token.expect("sender never connected");

    let header = b"HDR:".to_vec();
    let body = b"the rest of the frame";
    sender.write_segments(token, header, body, Some(1));

    let mut fired = false;
    pump(&mut sender, Duration::from_secs(5), |event| {
        if let PollEvent::WriteComplete { completion, .. } = event {
            assert_eq!(completion, 1);
            fired = true;
        }
    });
    assert!(fired, "write_segments completion never fired");
    drop(sender);

    let received = collector.join().expect("collector thread panicked");
    assert_eq!(received, b"HDR:the rest of the frame");
}

