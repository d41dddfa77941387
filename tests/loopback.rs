// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end runs against a loopback stub target.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pelt::config::{Config, Scheme};
use pelt::coordinator::{self, Shared};
use pelt::net::{tls, Sock, Status, Target, TlsTarget};

/// Minimal HTTP/1.1 echo target. Answers every received request with a tiny
/// 200; in `close_per_response` mode it adds `Connection: close` and drops
/// the socket after one response.
fn spawn_stub(close_per_response: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let addr = listener.local_addr().expect("stub listener address");

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            thread::spawn(move || serve(stream, close_per_response));
        }
    });

    addr
}

fn serve(mut stream: TcpStream, close_per_response: bool) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(end) = find_double_crlf(&pending) {
            pending.drain(..end);
            let response: &[u8] = if close_per_response {
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
            } else {
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
            };
            if stream.write_all(response).is_err() {
                return;
            }
            if close_per_response {
                return;
            }
        }
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn config(addr: SocketAddr, duration_s: u64, rate: u64) -> Config {
    Config {
        url: format!("http://{}/", addr),
        scheme: Scheme::Http,
        host: addr.ip().to_string(),
        port: addr.port(),
        path: "/".into(),
        connections: 1,
        threads: 1,
        duration_s,
        timeout_ms: 2000,
        rate,
        headers: Vec::new(),
        record_all: true,
        latency: false,
        u_latency: false,
        warmup: false,
        warmup_timeout_ms: None,
        bind_addrs: Vec::new(),
    }
}

#[test]
fn deadline_ends_the_run_and_completions_track_the_rate() {
    let addr = spawn_stub(false);
    let cfg = Arc::new(config(addr, 2, 1000));
    let shared = Shared::new(cfg.threads);

    let started = Instant::now();
    let summary = coordinator::run(cfg, addr, shared).expect("run completes");
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_secs(6),
        "run took {:?}, well past the 2s deadline",
        elapsed
    );
    // Paced at 1000 req/s for 2s against an immediate echo. Leave slack for
    // loaded machines; the pacer caps the upper side.
    assert!(
        summary.complete >= 200 && summary.complete <= 2600,
        "completed {} requests",
        summary.complete
    );
    assert!(summary.bytes > 0);
    assert_eq!(0, summary.errors.status);
    assert!(summary.hist.len() > 0);
    assert!(summary.u_hist.len() > 0);
}

#[test]
fn https_target_builds_its_tls_session_and_starts_the_handshake() {
    // A bare TCP listener is enough: the client must construct its TLS
    // session from the bundled provider, flush its hello, and end up
    // waiting on the server. Session construction must not panic.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
    let addr = listener.local_addr().expect("stub listener address");

    let target = Target {
        addr,
        bind: None,
        tls: Some(TlsTarget {
            config: tls::client_config(),
            name: tls::server_name("localhost").expect("valid server name"),
        }),
    };

    let mut sock = Sock::open(&target).expect("open tls socket");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match sock.connect() {
            // Hello flushed; the engine demands read readiness.
            Status::Retry { want_read: true, .. } => break,
            // TCP connect still in flight.
            Status::Retry { .. } => {}
            Status::Ok(()) => panic!("handshake cannot complete against a silent target"),
            Status::Error => panic!("TLS session setup failed"),
        }
        assert!(
            Instant::now() < deadline,
            "handshake never reached the server wait"
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn connection_close_reconnects_the_slot_and_requests_continue() {
    let addr = spawn_stub(true);
    let cfg = Arc::new(config(addr, 1, 50));
    let shared = Shared::new(cfg.threads);

    let summary = coordinator::run(cfg, addr, shared).expect("run completes");

    assert!(
        summary.errors.reconnect >= 1,
        "expected at least one reconnect, saw {}",
        summary.errors.reconnect
    );
    // The slot keeps issuing requests after every reconnect.
    assert!(
        summary.complete >= 2,
        "completed {} requests",
        summary.complete
    );
}
