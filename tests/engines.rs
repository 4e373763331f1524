//! End-to-end tests: every engine behind the real driver on loopback.

use echo_harness::client::{self, LoadConfig};
use echo_harness::config::Config;
use echo_harness::runtime::{EngineKind, OverflowPolicy};
use echo_harness::server::{create_listener, serve_on, ServeError, ServeSummary};
use echo_harness::shutdown::ShutdownToken;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

const ENGINES: [EngineKind; 3] = [EngineKind::Thread, EngineKind::Select, EngineKind::Epoll];

struct Running {
    addr: SocketAddr,
    token: ShutdownToken,
    done: crossbeam_channel::Receiver<Result<ServeSummary, ServeError>>,
}

impl Running {
    fn start(config: Config) -> Self {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();
        let token = ShutdownToken::new();
        let (tx, done) = crossbeam_channel::bounded(1);
        {
            let token = token.clone();
            thread::spawn(move || {
                let _ = tx.send(serve_on(listener, &config, token));
            });
        }
        Self { addr, token, done }
    }

    fn stop(self) -> ServeSummary {
        self.token.request_shutdown();
        self.done
            .recv_timeout(Duration::from_secs(5))
            .expect("server did not stop in time")
            .expect("server failed")
    }
}

fn config(kind: EngineKind) -> Config {
    Config {
        engine: kind,
        workers: 4,
        max_message_len: 1024 * 1024,
        poll_interval: Duration::from_millis(20),
        ..Config::default()
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn send(stream: &mut TcpStream, payload: &[u8]) {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(payload).unwrap();
}

fn recv(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// True once the server has closed its end.
fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => true,
        _ => false,
    }
}

#[test]
fn hello_then_zero_closes() {
    for kind in ENGINES {
        let server = Running::start(config(kind));

        let mut stream = connect(server.addr);
        send(&mut stream, b"hello");
        assert_eq!(recv(&mut stream, 5), b"hello", "{kind:?}");

        stream.write_all(&0u32.to_be_bytes()).unwrap();
        assert!(closed_by_server(&mut stream), "{kind:?}");

        let summary = server.stop();
        assert_eq!(summary.accepted, 1);
    }
}

#[test]
fn prefix_split_across_writes() {
    for kind in ENGINES {
        let server = Running::start(config(kind));

        let mut stream = connect(server.addr);
        for byte in 3u32.to_be_bytes() {
            stream.write_all(&[byte]).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        stream.write_all(b"a").unwrap();
        thread::sleep(Duration::from_millis(5));
        stream.write_all(b"bc").unwrap();

        assert_eq!(recv(&mut stream, 3), b"abc", "{kind:?}");

        // Several messages in a single write.
        let mut batch = Vec::new();
        for word in [&b"one"[..], b"three", b"x"] {
            batch.extend_from_slice(&(word.len() as u32).to_be_bytes());
            batch.extend_from_slice(word);
        }
        stream.write_all(&batch).unwrap();
        assert_eq!(recv(&mut stream, 9), b"onethreex", "{kind:?}");

        server.stop();
    }
}

#[test]
fn concurrent_clients_get_their_own_echoes() {
    for kind in ENGINES {
        let server = Running::start(config(kind));

        let clients: Vec<_> = (0..16)
            .map(|i| {
                let addr = server.addr;
                thread::spawn(move || {
                    let mut stream = connect(addr);
                    for seq in 0..20 {
                        let payload = client::payload(i, seq, 128 + i);
                        send(&mut stream, &payload);
                        assert_eq!(recv(&mut stream, payload.len()), payload);
                    }
                    stream.write_all(&0u32.to_be_bytes()).unwrap();
                })
            })
            .collect();

        for handle in clients {
            handle.join().unwrap();
        }

        let summary = server.stop();
        assert_eq!(summary.accepted, 16, "{kind:?}");
    }
}

#[test]
fn oversized_prefix_closes_connection() {
    for kind in ENGINES {
        let server = Running::start(Config {
            max_message_len: 16,
            ..config(kind)
        });

        let mut bad = connect(server.addr);
        bad.write_all(&17u32.to_be_bytes()).unwrap();
        assert!(closed_by_server(&mut bad), "{kind:?}");

        // The server keeps serving others.
        let mut good = connect(server.addr);
        send(&mut good, b"sixteen bytes ok");
        assert_eq!(recv(&mut good, 16), b"sixteen bytes ok", "{kind:?}");

        server.stop();
    }
}

#[test]
fn peer_disconnect_mid_message_is_contained() {
    for kind in ENGINES {
        let server = Running::start(config(kind));

        let mut partial = connect(server.addr);
        partial.write_all(&100u32.to_be_bytes()).unwrap();
        partial.write_all(b"only part").unwrap();
        drop(partial);

        let mut stream = connect(server.addr);
        send(&mut stream, b"still up");
        assert_eq!(recv(&mut stream, 8), b"still up", "{kind:?}");

        server.stop();
    }
}

#[test]
fn shutdown_with_idle_connections() {
    for kind in ENGINES {
        let server = Running::start(config(kind));

        let mut idle: Vec<_> = (0..3).map(|_| connect(server.addr)).collect();
        for stream in idle.iter_mut() {
            send(stream, b"ping");
            assert_eq!(recv(stream, 4), b"ping");
        }

        let summary = server.stop();
        assert!(summary.signalled);
        assert_eq!(summary.accepted, 3, "{kind:?}");

        for stream in idle.iter_mut() {
            assert!(closed_by_server(stream), "{kind:?}");
        }
    }
}

#[test]
fn shutdown_while_client_keeps_exchanging() {
    for kind in ENGINES {
        let server = Running::start(config(kind));

        let mut stream = connect(server.addr);
        let chatter = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut echoes = 0u64;
            let mut buf = [0u8; 4];
            while Instant::now() < deadline {
                if stream.write_all(&[0, 0, 0, 4, b'p', b'i', b'n', b'g']).is_err()
                    || stream.read_exact(&mut buf).is_err()
                {
                    break;
                }
                echoes += 1;
            }
            echoes
        });

        thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        server.stop();
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "{kind:?} took {:?} to stop",
            started.elapsed()
        );

        assert!(chatter.join().unwrap() > 0, "{kind:?}");
    }
}

#[test]
fn epoll_many_clients_many_messages() {
    let server = Running::start(config(EngineKind::Epoll));

    let clients: Vec<_> = (0..50)
        .map(|i| {
            let addr = server.addr;
            thread::spawn(move || {
                let mut stream = connect(addr);
                for seq in 0..100 {
                    let payload = client::payload(i, seq, 4096);
                    send(&mut stream, &payload);
                    assert_eq!(recv(&mut stream, payload.len()), payload);
                }
                stream.write_all(&0u32.to_be_bytes()).unwrap();
            })
        })
        .collect();
    for handle in clients {
        handle.join().unwrap();
    }

    let summary = server.stop();
    assert_eq!(summary.accepted, 50);
}

#[test]
fn thread_pool_grows_beyond_prespawned() {
    let server = Running::start(Config {
        workers: 1,
        ..config(EngineKind::Thread)
    });

    // Hold three sessions open at once on a pool that started with one worker.
    let mut streams: Vec<_> = (0..3).map(|_| connect(server.addr)).collect();
    for (i, stream) in streams.iter_mut().enumerate() {
        let payload = client::payload(i, 0, 32);
        send(stream, &payload);
        assert_eq!(recv(stream, 32), payload);
    }

    server.stop();
}

#[test]
fn thread_pool_reject_at_cap() {
    let server = Running::start(Config {
        workers: 1,
        max_workers: 1,
        overflow: OverflowPolicy::Reject,
        ..config(EngineKind::Thread)
    });

    let mut held = connect(server.addr);
    send(&mut held, b"held");
    assert_eq!(recv(&mut held, 4), b"held");

    let mut extra = connect(server.addr);
    assert!(closed_by_server(&mut extra));

    // The held session is unaffected.
    send(&mut held, b"again");
    assert_eq!(recv(&mut held, 5), b"again");

    server.stop();
}

#[test]
fn thread_pool_queue_at_cap() {
    let server = Running::start(Config {
        workers: 1,
        max_workers: 1,
        overflow: OverflowPolicy::Queue,
        ..config(EngineKind::Thread)
    });

    let mut first = connect(server.addr);
    send(&mut first, b"first");
    assert_eq!(recv(&mut first, 5), b"first");

    // Queued behind the only worker until `first` ends its session.
    let mut queued = connect(server.addr);
    send(&mut queued, b"queued");
    thread::sleep(Duration::from_millis(50));

    first.write_all(&0u32.to_be_bytes()).unwrap();
    assert_eq!(recv(&mut queued, 6), b"queued");

    server.stop();
}

#[test]
fn load_generator_against_each_engine() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    for kind in ENGINES {
        let server = Running::start(config(kind));

        let report = runtime.block_on(client::run_load(LoadConfig {
            addr: server.addr,
            clients: 8,
            requests: 25,
            size: 512,
        }));

        assert_eq!(report.succeeded, 8, "{kind:?}");
        assert_eq!(report.failed, 0, "{kind:?}");
        assert_eq!(report.requests, 200);
        assert_eq!(report.bytes_received, 200 * 512);
        assert!(report.mean_latency().is_some());

        server.stop();
    }
}
