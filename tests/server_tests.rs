//! Server Tests
//!
//! End-to-end tests for accept, echo, shutdown and hard close.

mod common;

use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use common::{read_raw_frame, recv_event, write_raw_frame, Echo, Event, Recorder, WAIT};
use crossbeam::channel::{self, Sender};
use netloop::event_loop::EventLoopThread;
use netloop::network::{LoopHandler, NoopHandler};
use netloop::sync::CountDownLatch;
use netloop::{
    Client, ClientConfig, Connection, Handler, LengthPrefixedCodec, NetError, Server, ServerConfig,
};

fn local_server() -> Server {
    Server::new(ServerConfig::builder().listen_addr("127.0.0.1:0").build())
}

fn spawn_serve(server: &Server, handler: Arc<dyn Handler>) -> thread::JoinHandle<netloop::Result<()>> {
    let server = server.clone();
    thread::spawn(move || server.serve(handler, Arc::new(LengthPrefixedCodec)))
}

/// Client side of the echo round trip: greets on connect, reports everything
struct Greeter {
    events: Sender<Event>,
}

impl Handler for Greeter {
    fn connect(&self, conn: &Arc<Connection>, connected: bool) {
        if connected {
            conn.send("hello").unwrap();
            let _ = self.events.send(Event::Connected(conn.id()));
        } else {
            let _ = self.events.send(Event::Disconnected(conn.id()));
        }
    }

    fn receive(&self, conn: &Arc<Connection>, frame: Bytes) {
        let _ = self.events.send(Event::Received(conn.id(), frame));
    }
}

// =============================================================================
// Echo Round Trip
// =============================================================================

#[test]
fn test_echo_then_server_shutdown() {
    let server = local_server();
    let addr = server.listen().unwrap();

    let (server_tx, server_events) = channel::unbounded();
    let echo = Arc::new(Echo {
        shutdown_after_reply: true,
        events: server_tx,
    });
    let serving = spawn_serve(&server, echo);

    let client = Client::new(ClientConfig::builder().addr(addr.to_string()).build());
    let (client_tx, client_events) = channel::unbounded();
    let greeter = Arc::new(Greeter { events: client_tx });

    client
        .dial_and_serve(greeter, Arc::new(LengthPrefixedCodec))
        .unwrap();

    let Event::Connected(id) = recv_event(&client_events) else {
        panic!("expected connect first");
    };
    assert_eq!(
        recv_event(&client_events),
        Event::Received(id, Bytes::from_static(b"hello"))
    );
    assert_eq!(recv_event(&client_events), Event::Disconnected(id));

    let Event::Connected(server_id) = recv_event(&server_events) else {
        panic!("expected connect first");
    };
    assert_eq!(
        recv_event(&server_events),
        Event::Received(server_id, Bytes::from_static(b"hello"))
    );
    assert_eq!(recv_event(&server_events), Event::Disconnected(server_id));

    server.close();
    serving.join().unwrap().unwrap();
}

#[test]
fn test_many_frames_echo_in_order() {
    let server = local_server();
    let addr = server.listen().unwrap();
    let (tx, _events) = channel::unbounded();
    let serving = spawn_serve(
        &server,
        Arc::new(Echo {
            shutdown_after_reply: false,
            events: tx,
        }),
    );

    let mut stream = TcpStream::connect(addr).unwrap();
    for i in 0..200u32 {
        write_raw_frame(&mut stream, format!("frame-{i}").as_bytes());
    }
    for i in 0..200u32 {
        assert_eq!(read_raw_frame(&mut stream), format!("frame-{i}").into_bytes());
    }

    server.close();
    serving.join().unwrap().unwrap();
}

#[test]
fn test_loop_handler_runs_callbacks_on_loop_thread() {
    struct ThreadProbe(Sender<Option<String>>);

    impl Handler for ThreadProbe {
        fn receive(&self, conn: &Arc<Connection>, frame: Bytes) {
            let _ = self.0.send(thread::current().name().map(str::to_string));
            conn.send(frame).unwrap();
        }
    }

    let loop_thread = EventLoopThread::spawn("handler-loop").unwrap();
    let (tx, rx) = channel::unbounded();
    let handler = LoopHandler::new(loop_thread.event_loop().clone(), ThreadProbe(tx));

    let server = local_server();
    let addr = server.listen().unwrap();
    let serving = spawn_serve(&server, Arc::new(handler));

    let mut stream = TcpStream::connect(addr).unwrap();
    write_raw_frame(&mut stream, b"where");
    assert_eq!(read_raw_frame(&mut stream), b"where");
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap().as_deref(),
        Some("handler-loop")
    );

    server.close();
    serving.join().unwrap().unwrap();
    loop_thread.close();
}

// =============================================================================
// Close
// =============================================================================

#[test]
fn test_close_with_active_connections() {
    let server = local_server();
    let addr = server.listen().unwrap();
    let (recorder, events) = Recorder::new();
    let serving = spawn_serve(&server, recorder);

    let peers: Vec<_> = (0..5).map(|_| TcpStream::connect(addr).unwrap()).collect();

    let mut connected = Vec::new();
    for _ in 0..5 {
        match recv_event(&events) {
            Event::Connected(id) => connected.push(id),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(server.connection_count(), 5);
    assert_eq!(server.connections().len(), 5);

    server.close();

    // Every connection thread has finished before close returns
    let mut disconnected: Vec<_> = events
        .try_iter()
        .filter_map(|event| match event {
            Event::Disconnected(id) => Some(id),
            _ => None,
        })
        .collect();
    disconnected.sort();
    connected.sort();
    assert_eq!(disconnected, connected);
    assert_eq!(server.connection_count(), 0);

    serving.join().unwrap().unwrap();
    drop(peers);
}

#[test]
fn test_close_is_idempotent_and_final() {
    let server = local_server();
    server.listen().unwrap();
    let serving = spawn_serve(&server, Arc::new(NoopHandler));

    thread::sleep(Duration::from_millis(50));
    server.close();
    server.close();
    assert!(server.is_closed());
    serving.join().unwrap().unwrap();

    assert!(matches!(server.listen(), Err(NetError::Closed(_))));
    assert!(matches!(
        server.serve(Arc::new(NoopHandler), Arc::new(LengthPrefixedCodec)),
        Err(NetError::Closed(_))
    ));
}

#[test]
fn test_concurrent_close_waits_for_connection_threads() {
    struct Stall {
        gate: Arc<CountDownLatch>,
        connected: Sender<()>,
    }

    impl Handler for Stall {
        fn connect(&self, _conn: &Arc<Connection>, connected: bool) {
            if connected {
                let _ = self.connected.send(());
                self.gate.wait();
            }
        }
    }

    let server = local_server();
    let addr = server.listen().unwrap();
    let gate = Arc::new(CountDownLatch::new(1));
    let (connected_tx, connected_rx) = channel::bounded(1);
    let serving = spawn_serve(
        &server,
        Arc::new(Stall {
            gate: Arc::clone(&gate),
            connected: connected_tx,
        }),
    );

    let _peer = TcpStream::connect(addr).unwrap();
    connected_rx.recv_timeout(WAIT).unwrap();

    let (done_tx, done_rx) = channel::unbounded();
    let closers: Vec<_> = (0..2)
        .map(|_| {
            let server = server.clone();
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                server.close();
                done_tx.send(()).unwrap();
            })
        })
        .collect();

    // The connection thread is stuck in its handler, so neither close returns
    assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());

    gate.count_down();
    done_rx.recv_timeout(WAIT).unwrap();
    done_rx.recv_timeout(WAIT).unwrap();
    for closer in closers {
        closer.join().unwrap();
    }
    serving.join().unwrap().unwrap();
}

#[test]
fn test_close_from_connection_handler() {
    struct Closer {
        server: Server,
        done: Sender<()>,
    }

    impl Handler for Closer {
        fn receive(&self, _conn: &Arc<Connection>, _frame: Bytes) {
            self.server.close();
            let _ = self.done.send(());
        }
    }

    let server = local_server();
    let addr = server.listen().unwrap();
    let (done_tx, done_rx) = channel::bounded(1);
    let serving = spawn_serve(
        &server,
        Arc::new(Closer {
            server: server.clone(),
            done: done_tx,
        }),
    );

    let mut stream = TcpStream::connect(addr).unwrap();
    write_raw_frame(&mut stream, b"stop");

    done_rx.recv_timeout(WAIT).unwrap();
    serving.join().unwrap().unwrap();
    assert!(server.is_closed());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_serve_requires_listen() {
    let server = local_server();
    assert!(server.local_addr().is_none());
    assert!(matches!(
        server.serve(Arc::new(NoopHandler), Arc::new(LengthPrefixedCodec)),
        Err(NetError::NotListening)
    ));
}

#[test]
fn test_listen_is_repeatable() {
    let server = local_server();
    let first = server.listen().unwrap();
    let second = server.listen().unwrap();
    assert_eq!(first, second);
    assert_ne!(first.port(), 0);
    assert_eq!(server.local_addr(), Some(first));
    server.close();
}

#[test]
fn test_second_serve_rejected() {
    let server = local_server();
    server.listen().unwrap();
    let serving = spawn_serve(&server, Arc::new(NoopHandler));

    // Give the first serve time to claim the listener
    thread::sleep(Duration::from_millis(100));
    assert!(matches!(
        server.serve(Arc::new(NoopHandler), Arc::new(LengthPrefixedCodec)),
        Err(NetError::AlreadyRunning(_))
    ));

    server.close();
    serving.join().unwrap().unwrap();
}

#[test]
fn test_finished_connections_are_untracked() {
    let server = local_server();
    let addr = server.listen().unwrap();
    let (recorder, events) = Recorder::new();
    let serving = spawn_serve(&server, recorder);

    let stream = TcpStream::connect(addr).unwrap();
    let Event::Connected(id) = recv_event(&events) else {
        panic!("expected connect");
    };
    drop(stream);
    assert_eq!(recv_event(&events), Event::Disconnected(id));

    let deadline = std::time::Instant::now() + WAIT;
    while server.connection_count() > 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.connection_count(), 0);

    server.close();
    serving.join().unwrap().unwrap();
}
