use proactor::net::connection::{Connection, ConnectionState};
use proactor::net::consumer::Consumer;
use proactor::net::listener::Listener;
use proactor::{AddressV4, Error, Reactor, ReactorBuilder};
use std::io::Read;
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn peer_close_ends_the_connection() {
    init_logs();
    let probe = Arc::new(Capture::default());
    let reactor = Arc::new(ReactorBuilder::new().build().expect("build reactor"));
    let listener = Listener::new(
        &reactor,
        AddressV4::loopback(),
        0,
        Arc::clone(&probe) as Arc<dyn Consumer>,
    )
    .expect("bind listener");
    listener.async_accept(&reactor);
    let workers = reactor.start_workers(1);

    let client = StdTcpStream::connect(("127.0.0.1", listener.port())).expect("connect");
    assert!(
        wait_for(|| probe.connected.load(Ordering::SeqCst) == 1),
        "accept should reach the consumer"
    );

    drop(client);
    assert!(
        wait_for(|| probe.closed.load(Ordering::SeqCst) == 1),
        "peer close should reach the consumer"
    );
    assert!(
        wait_for(|| reactor.handle_count() == 1),
        "connection should retire, leaving only the listener"
    );

    reactor.stop();
    for worker in workers {
        let _ = worker.join();
    }
}

#[test]
fn local_shutdown_is_idempotent() {
    init_logs();
    let probe = Arc::new(Capture::default());
    let reactor = Arc::new(ReactorBuilder::new().build().expect("build reactor"));
    let listener = Listener::new(
        &reactor,
        AddressV4::loopback(),
        0,
        Arc::clone(&probe) as Arc<dyn Consumer>,
    )
    .expect("bind listener");
    listener.async_accept(&reactor);
    let workers = reactor.start_workers(2);

    let mut client = StdTcpStream::connect(("127.0.0.1", listener.port())).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set timeout");
    let connection = captured_connection(&probe);

    connection.shutdown(&reactor);
    connection.shutdown(&reactor);

    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).expect("read eof");
    assert_eq!(n, 0, "local shutdown should reach the peer as EOF");

    assert!(
        wait_for(|| connection.state() == ConnectionState::Closed),
        "outstanding operations should drain to the closed state"
    );
    assert!(
        wait_for(|| reactor.handle_count() == 1),
        "connection should retire, leaving only the listener"
    );
    assert_eq!(
        probe.closed.load(Ordering::SeqCst),
        1,
        "close callback should fire exactly once"
    );

    reactor.stop();
    for worker in workers {
        let _ = worker.join();
    }
}

#[test]
fn listener_shutdown_stops_accepting() {
    init_logs();
    let probe = Arc::new(Capture::default());
    let reactor = Arc::new(ReactorBuilder::new().build().expect("build reactor"));
    let listener = Listener::new(
        &reactor,
        AddressV4::loopback(),
        0,
        Arc::clone(&probe) as Arc<dyn Consumer>,
    )
    .expect("bind listener");
    listener.async_accept(&reactor);
    let port = listener.port();
    let workers = reactor.start_workers(1);

    listener.shutdown(&reactor);
    listener.shutdown(&reactor);
    assert!(!listener.is_open());
    assert!(
        wait_for(|| reactor.handle_count() == 0),
        "cancelled accept should drain and retire the listener"
    );
    assert_eq!(probe.connected.load(Ordering::SeqCst), 0);

    // The socket closes with the last reference; connects are then refused.
    drop(listener);
    assert!(StdTcpStream::connect(("127.0.0.1", port)).is_err());

    reactor.stop();
    for worker in workers {
        let _ = worker.join();
    }
}

#[test]
fn shutdown_racing_accept_arming_drains() {
    init_logs();
    let reactor = Arc::new(ReactorBuilder::new().build().expect("build reactor"));
    let workers = reactor.start_workers(2);

    // Arm from one thread while shutting down from another; whichever
    // side wins, the listener must retire and nothing may stay armed.
    for _ in 0..64 {
        let capture = Arc::new(Capture::default());
        let listener = Listener::new(
            &reactor,
            AddressV4::loopback(),
            0,
            Arc::clone(&capture) as Arc<dyn Consumer>,
        )
        .expect("bind listener");

        let armer = {
            let listener = Arc::clone(&listener);
            let reactor = Arc::clone(&reactor);
            std::thread::spawn(move || listener.async_accept(&reactor))
        };
        listener.shutdown(&reactor);
        armer.join().unwrap();

        assert!(
            wait_for(|| reactor.handle_count() == 0),
            "listener should retire no matter which side won"
        );
        assert_eq!(capture.connected.load(Ordering::SeqCst), 0);
    }

    reactor.stop();
    for worker in workers {
        let _ = worker.join();
    }
}

#[test]
fn overlapping_transfers_are_rejected() {
    init_logs();
    let probe = Arc::new(Capture::default());
    let reactor = Arc::new(ReactorBuilder::new().build().expect("build reactor"));

    let server = std::net::TcpListener::bind("127.0.0.1:0").expect("bind server");
    let port = server.local_addr().expect("local addr").port();

    // No workers yet: nothing clears the in-flight flags, so the
    // single-outstanding checks below cannot race a completion.
    let connection = Connection::connect(
        &reactor,
        AddressV4::loopback(),
        port,
        Arc::clone(&probe) as Arc<dyn Consumer>,
    )
    .expect("connect");
    let (_peer, _addr) = server.accept().expect("accept");

    connection.async_read(&reactor);
    connection.async_read(&reactor);
    assert!(connection.read_in_flight());
    assert_eq!(connection.rejected_reads(), 1);

    connection.queue_send(b"overlap probe");
    connection.async_send(&reactor);
    connection.async_send(&reactor);
    assert!(connection.send_in_flight());
    assert_eq!(connection.rejected_sends(), 1);

    // One connect, one read, one send; the rejected calls submitted nothing.
    assert_eq!(connection.submitted_ops(), 3);

    // Dispatch the backlog and wind down.
    let workers = reactor.start_workers(1);
    connection.shutdown(&reactor);
    assert!(
        wait_for(|| connection.state() == ConnectionState::Closed),
        "outstanding operations should drain after shutdown"
    );
    assert!(wait_for(|| reactor.handle_count() == 0));

    reactor.stop();
    for worker in workers {
        let _ = worker.join();
    }
}

#[test]
fn shutdown_drains_wedged_transfers() {
    init_logs();
    let probe = Arc::new(Capture::default());
    let reactor = Arc::new(ReactorBuilder::new().build().expect("build reactor"));
    let listener = Listener::new(
        &reactor,
        AddressV4::loopback(),
        0,
        Arc::clone(&probe) as Arc<dyn Consumer>,
    )
    .expect("bind listener");
    listener.async_accept(&reactor);
    let workers = reactor.start_workers(2);

    let client = StdTcpStream::connect(("127.0.0.1", listener.port())).expect("connect");
    let connection = captured_connection(&probe);

    // A payload far beyond the combined socket buffers, against a peer
    // that never reads: the first send completes short and the re-armed
    // remainder wedges.
    let big = vec![0xA5u8; 32 * 1024 * 1024];
    connection.queue_send(&big);
    connection.async_send(&reactor);
    assert!(
        wait_for(|| !connection.send_in_flight()),
        "first send should complete short"
    );
    assert!(connection.send_pending() > 0);
    connection.async_send(&reactor);

    // Shutdown forces the wedged operations to land and drain.
    connection.shutdown(&reactor);
    assert!(
        wait_for(|| connection.state() == ConnectionState::Closed),
        "wedged operations should drain after shutdown"
    );
    assert!(connection.send_pending() > 0, "the peer never read the tail");
    listener.shutdown(&reactor);
    assert!(wait_for(|| reactor.handle_count() == 0));

    drop(client);
    reactor.stop();
    for worker in workers {
        let _ = worker.join();
    }
}

#[derive(Default)]
struct Capture {
    connection: Mutex<Option<Arc<Connection>>>,
    connected: AtomicUsize,
    closed: AtomicUsize,
}

impl Consumer for Capture {
    fn on_connected(&self, _reactor: &Reactor, connection: &Arc<Connection>) {
        *self.connection.lock().unwrap() = Some(Arc::clone(connection));
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_data(&self, _reactor: &Reactor, _connection: &Arc<Connection>, _data: &[u8]) {}

    fn on_close(&self, _reactor: &Reactor, _connection: &Arc<Connection>, _reason: &Error) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn captured_connection(probe: &Capture) -> Arc<Connection> {
    assert!(
        wait_for(|| probe.connection.lock().unwrap().is_some()),
        "accept should reach the consumer"
    );
    let held = probe.connection.lock().unwrap();
    held.clone().expect("captured connection")
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
