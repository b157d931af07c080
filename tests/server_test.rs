/*!
 * Pipeline Tests
 * One in-process child: acceptor + workers over a real registry, driven
 * by a real TCP client
 */

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use icapd::config::{ListenerConfig, ServerConfig};
use icapd::core::types::{Protocol, Terminate};
use icapd::ipc::{ProcMutexScheme, SharedMemScheme};
use icapd::server::acceptor::run_acceptor;
use icapd::server::child::ChildContext;
use icapd::server::commands::CommandRegistry;
use icapd::server::registry::{BlobRegistry, ChildsRegistry};
use icapd::server::worker::{run_worker, OptionsHandler};
use icapd::server::{Listener, StatIds};
use icapd::stats::{HistogramRegistry, StatRegistry};
use serial_test::serial;

struct Harness {
    ctx: Arc<ChildContext>,
    threads: Vec<thread::JoinHandle<()>>,
    registry: Arc<ChildsRegistry>,
    stat_ids: StatIds,
}

fn spawn_child_harness(workers: usize) -> Harness {
    let config = ServerConfig {
        threads_per_child: workers,
        max_servers: 2,
        proc_mutex_scheme: ProcMutexScheme::PosixSem,
        shared_mem_scheme: SharedMemScheme::Mmap,
        listeners: vec![ListenerConfig {
            address: Some("127.0.0.1".parse().unwrap()),
            port: 0,
            proto: Protocol::Icap,
            tls: false,
        }],
        ..Default::default()
    };

    let stats = Arc::new(StatRegistry::new());
    let stat_ids = StatIds::register(&stats).unwrap();
    let registry = Arc::new(
        ChildsRegistry::create(
            &config,
            Arc::clone(&stats),
            Arc::new(HistogramRegistry::new()),
            &BlobRegistry::new(),
        )
        .unwrap(),
    );

    let listeners = Arc::new(vec![Listener::bind(config.listeners[0].clone()).unwrap()]);
    let pid = std::process::id() as i32;
    let slot = registry
        .register_child(pid, workers as i32, -1)
        .unwrap();
    let memblock = registry.stats_block(slot).unwrap();

    let ctx = ChildContext::build(
        Arc::new(config),
        Arc::clone(&registry),
        slot,
        listeners,
        Arc::new(CommandRegistry::new()),
        memblock,
        stat_ids,
    );

    let mut threads = Vec::new();
    for _ in 0..workers {
        let ctx = Arc::clone(&ctx);
        threads.push(thread::spawn(move || {
            run_worker(ctx, Arc::new(OptionsHandler))
        }));
    }
    {
        let ctx = Arc::clone(&ctx);
        threads.push(thread::spawn(move || run_acceptor(ctx)));
    }
    ctx.open_start_gate();

    Harness {
        ctx,
        threads,
        registry,
        stat_ids,
    }
}

impl Harness {
    fn addr(&self) -> std::net::SocketAddr {
        self.ctx.listeners[0].local_addr()
    }

    fn wait_for<F: Fn() -> bool>(&self, what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn shutdown(self) {
        self.ctx.request_terminate(Terminate::Immediately);
        self.ctx.queue.shutdown();
        for t in self.threads {
            t.join().unwrap();
        }
        let pid = std::process::id() as i32;
        self.registry.remove_child(pid, false).unwrap();
        self.registry.teardown().unwrap();
    }
}

fn send_options(addr: std::net::SocketAddr, close: bool) -> String {
    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let connection = if close { "Connection: close\r\n" } else { "" };
    write!(
        client,
        "OPTIONS icap://localhost/service ICAP/1.0\r\nHost: localhost\r\n{}\r\n",
        connection
    )
    .unwrap();

    let mut response = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                response.extend_from_slice(&chunk[..n]);
                if response.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&response).into_owned()
}

#[test]
#[serial]
fn options_round_trip_counts_one_request() {
    let harness = spawn_child_harness(2);
    let response = send_options(harness.addr(), true);
    assert!(
        response.starts_with("ICAP/1.0 200 OK"),
        "unexpected response: {:?}",
        response
    );

    let slot = harness.ctx.slot();
    harness.wait_for("request accounting", || slot.requests() == 1);
    assert_eq!(slot.connections(), 1);
    harness.wait_for("workers to go free", || slot.free_servers() == 2);
    assert_eq!(
        harness.ctx.memblock.get(harness.stat_ids.requests),
        1
    );
    harness.shutdown();
}

#[test]
#[serial]
fn keepalive_serves_pipelined_requests_on_one_connection() {
    let harness = spawn_child_harness(2);
    let mut client = TcpStream::connect(harness.addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for round in 1..=2 {
        write!(
            client,
            "OPTIONS icap://localhost/service ICAP/1.0\r\nHost: localhost\r\n\r\n"
        )
        .unwrap();
        let mut response = Vec::new();
        let mut chunk = [0u8; 512];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed early in round {}", round);
            response.extend_from_slice(&chunk[..n]);
        }
        assert!(String::from_utf8_lossy(&response).starts_with("ICAP/1.0 200 OK"));
    }

    let slot = harness.ctx.slot();
    harness.wait_for("both requests accounted", || slot.requests() == 2);
    // Two requests, one accepted connection: keep-alive did its job.
    assert_eq!(slot.connections(), 1);
    drop(client);
    harness.shutdown();
}

#[test]
#[serial]
fn several_clients_spread_over_the_worker_pool() {
    let harness = spawn_child_harness(4);
    let addr = harness.addr();

    let clients: Vec<_> = (0..6)
        .map(|_| thread::spawn(move || send_options(addr, true)))
        .collect();
    for c in clients {
        assert!(c.join().unwrap().starts_with("ICAP/1.0 200 OK"));
    }

    let slot = harness.ctx.slot();
    harness.wait_for("all six requests", || slot.requests() == 6);
    harness.wait_for("pool drains", || slot.free_servers() == 4);
    harness.shutdown();
}
