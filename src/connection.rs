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

//! Per-connection request/response state machine
//!
//! A connection cycles between writing one pipelined batch of requests and
//! parsing the responses. Writes are gated by the pacer; a delayed batch
//! drops its write registration and a timer restores it. Any socket error or
//! `Connection: close` tears the socket down and connects again in the same
//! slot, preserving the pacing timeline.

use std::sync::Arc;

use log::error;
use mio::{Interest, Registry, Token};

use crate::net::{self, Sock, Target};
use crate::pacer::Pacer;
use crate::parser::{ResponseParser, ResponseSink};
use crate::phase::Phase;
use crate::reactor::{TimerKind, TimerQueue};
use crate::script::Script;
use crate::stats::WorkerStats;
use crate::time;

/// Fixed receive buffer size.
pub const RX_BUF_SIZE: usize = 8192;

/// Header-buffer cursor state: what the parser delivered last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HdrState {
    Field,
    Value,
}

/// What a socket event amounted to, for the worker's phase accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventOutcome {
    /// Nothing the worker needs to track.
    None,
    /// The handshake completed; during warmup the worker counts these
    /// towards the ready barrier.
    Established,
}

/// Worker state a connection needs while handling an event.
pub(crate) struct Dispatch<'a> {
    pub registry: &'a Registry,
    pub timers: &'a mut TimerQueue,
    pub stats: &'a mut WorkerStats,
    pub script: &'a mut dyn Script,
    pub phase: Phase,
    pub record_all: bool,
    pub dynamic: bool,
    pub pipeline: usize,
    pub stop_at: u64,
    /// Set to request a reactor stop at the end of the turn.
    pub stop: &'a mut bool,
}

/// One persistent HTTP/1.1 connection slot.
#[derive(Debug)]
pub struct Connection {
    token: usize,
    target: Arc<Target>,
    sock: Option<Sock>,
    parser: ResponseParser,
    hdr_state: HdrState,
    /// Current batch bytes; shared with the worker when the request is
    /// static.
    request: Arc<[u8]>,
    written: usize,
    pending: usize,
    has_pending: bool,
    headers_buf: Vec<u8>,
    body_buf: Vec<u8>,
    rx_buf: Box<[u8; RX_BUF_SIZE]>,
    is_connected: bool,
    registered: bool,
    interest_read: bool,
    interest_write: bool,
    pacer: Pacer,
    /// Pacer completions when the current batch first hit the wire; the
    /// expected-start timeline is computed from it for every response of
    /// the batch.
    complete_at_last_batch_start: u64,
    actual_latency_start: u64,
    latest_should_send_time: u64,
    latest_expected_start: u64,
    latest_connect: u64,
    latest_write: u64,
}

impl Connection {
    /// Creates an unconnected slot.
    pub(crate) fn new(
        token: usize,
        target: Arc<Target>,
        request: Arc<[u8]>,
        throughput: f64,
    ) -> Connection {
        Connection {
            token,
            target,
            sock: None,
            parser: ResponseParser::new(),
            hdr_state: HdrState::Field,
            request,
            written: 0,
            pending: 0,
            has_pending: false,
            headers_buf: Vec::new(),
            body_buf: Vec::new(),
            rx_buf: Box::new([0; RX_BUF_SIZE]),
            is_connected: false,
            registered: false,
            interest_read: false,
            interest_write: false,
            pacer: Pacer::new(throughput),
            complete_at_last_batch_start: 0,
            actual_latency_start: 0,
            latest_should_send_time: 0,
            latest_expected_start: 0,
            latest_connect: 0,
            latest_write: 0,
        }
    }

    /// Whether the handshake has completed.
    pub(crate) fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Starts a non-blocking connect in this slot. A synchronous failure is
    /// counted and retried on a short timer; the reactor keeps running.
    pub(crate) fn connect(&mut self, d: &mut Dispatch<'_>) {
        self.written = 0;
        self.pending = 0;
        self.has_pending = false;
        self.is_connected = false;
        self.parser.reset();

        match Sock::open(&self.target) {
            Ok(sock) => {
                self.sock = Some(sock);
                self.set_interest(false, true, d.registry);
            }
            Err(_) => {
                d.stats.errors.connect += 1;
                d.timers.arm(1, TimerKind::Reconnect(self.token));
            }
        }
    }

    /// Tears the socket down and connects again in place. The pacing
    /// timeline (`thread_start`, completions) survives.
    pub(crate) fn reconnect(&mut self, d: &mut Dispatch<'_>) {
        d.stats.errors.reconnect += 1;
        self.close(d.registry);
        self.connect(d);
    }

    /// Deregisters and closes the socket.
    pub(crate) fn close(&mut self, registry: &Registry) {
        if self.registered {
            if let Some(sock) = self.sock.as_mut() {
                let _ = registry.deregister(sock.stream());
            }
        }
        self.registered = false;
        self.interest_read = false;
        self.interest_write = false;
        self.is_connected = false;
        if let Some(sock) = self.sock.take() {
            sock.close();
        }
    }

    /// Handles a readiness event on this slot.
    pub(crate) fn on_event(
        &mut self,
        readable: bool,
        writable: bool,
        d: &mut Dispatch<'_>,
    ) -> EventOutcome {
        if !self.is_connected {
            return self.drive_connect(d);
        }
        if readable || self.sock.as_ref().is_some_and(Sock::readable) {
            self.on_readable(d);
        }
        if *d.stop {
            return EventOutcome::None;
        }
        if writable && self.is_connected && self.interest_write {
            self.on_writable(d);
        }
        EventOutcome::None
    }

    /// Restores the write registration after a pace delay.
    pub(crate) fn resume_write(&mut self, d: &mut Dispatch<'_>) {
        if self.is_connected {
            self.set_interest(true, true, d.registry);
        }
    }

    /// Installs read+write events on an established connection; used when a
    /// worker leaves warmup.
    pub(crate) fn install_events(&mut self, registry: &Registry) {
        if self.is_connected {
            self.set_interest(true, true, registry);
        }
    }

    fn drive_connect(&mut self, d: &mut Dispatch<'_>) -> EventOutcome {
        let status = match self.sock.as_mut() {
            Some(sock) => sock.connect(),
            None => return EventOutcome::None,
        };

        match status {
            net::Status::Ok(()) => {
                let now = time::now_us();
                self.is_connected = true;
                self.latest_connect = now;
                if self.pacer.thread_start == 0 {
                    self.pacer.thread_start = now;
                }
                d.stats.errors.established += 1;
                self.parser.reset();
                match d.phase {
                    // No file events during warmup; they are installed on
                    // the transition to NORMAL.
                    Phase::Warmup => self.set_interest(false, false, d.registry),
                    Phase::Normal => self.set_interest(true, true, d.registry),
                }
                EventOutcome::Established
            }
            net::Status::Retry {
                want_read,
                want_write,
            } => {
                self.set_interest(want_read, want_write, d.registry);
                EventOutcome::None
            }
            net::Status::Error => {
                d.stats.errors.connect += 1;
                self.reconnect(d);
                EventOutcome::None
            }
        }
    }

    fn on_writable(&mut self, d: &mut Dispatch<'_>) {
        if self.written == 0 {
            let now = time::now_us();
            let delay = self.pacer.usec_to_next_send(now);
            self.latest_should_send_time = now + delay;
            if delay > 0 {
                self.set_interest(true, false, d.registry);
                d.timers
                    .arm(delay / 1000 + 1, TimerKind::Pace(self.token));
                return;
            }

            self.latest_write = now;
            if d.dynamic {
                self.request = d.script.request();
            }
            if !self.has_pending {
                self.actual_latency_start = now;
                self.complete_at_last_batch_start = self.pacer.complete;
                self.has_pending = true;
            }
            self.pending = d.pipeline;
        }

        while self.written < self.request.len() {
            let status = match self.sock.as_mut() {
                Some(sock) => sock.write(&self.request[self.written..]),
                None => return,
            };
            match status {
                net::Status::Ok(n) => self.written += n,
                net::Status::Retry { .. } => {
                    // Partial batch: keep the write registration and resume
                    // on the next readiness event.
                    self.set_interest(true, true, d.registry);
                    return;
                }
                net::Status::Error => {
                    d.stats.errors.write += 1;
                    self.reconnect(d);
                    return;
                }
            }
        }

        self.written = 0;
        self.set_interest(true, false, d.registry);
    }

    fn on_readable(&mut self, d: &mut Dispatch<'_>) {
        loop {
            let status = match self.sock.as_mut() {
                Some(sock) => sock.read(&mut self.rx_buf[..]),
                None => return,
            };

            let n = match status {
                net::Status::Ok(0) => {
                    let finished = {
                        let mut sink = HookSink::new(
                            &mut self.headers_buf,
                            &mut self.body_buf,
                            &mut self.hdr_state,
                            d.script.want_response(),
                        );
                        self.parser.on_eof(&mut sink).then(|| sink.take_complete())
                    };
                    match finished.flatten() {
                        Some((status, keep_alive)) => {
                            // The close itself delimited the body; the
                            // completion handler reconnects.
                            self.finish_response(status, keep_alive, d);
                        }
                        None => {
                            d.stats.errors.read += 1;
                            self.reconnect(d);
                        }
                    }
                    return;
                }
                net::Status::Ok(n) => n,
                net::Status::Retry {
                    want_read,
                    want_write,
                } => {
                    self.set_interest(
                        want_read || self.interest_read,
                        want_write || self.interest_write,
                        d.registry,
                    );
                    return;
                }
                net::Status::Error => {
                    d.stats.errors.read += 1;
                    self.reconnect(d);
                    return;
                }
            };

            d.stats.bytes += n as u64;

            let mut off = 0;
            while off < n {
                let outcome = {
                    let mut sink = HookSink::new(
                        &mut self.headers_buf,
                        &mut self.body_buf,
                        &mut self.hdr_state,
                        d.script.want_response(),
                    );
                    self.parser
                        .execute(&self.rx_buf[off..n], &mut sink)
                        .map(|consumed| (consumed, sink.take_complete()))
                };
                match outcome {
                    Err(_) => {
                        d.stats.errors.read += 1;
                        self.reconnect(d);
                        return;
                    }
                    Ok((consumed, Some((status, keep_alive)))) => {
                        off += consumed;
                        if self.finish_response(status, keep_alive, d) {
                            return;
                        }
                    }
                    Ok((consumed, None)) => {
                        if consumed == 0 {
                            // The parser refused input without finishing a
                            // message: consumption mismatch.
                            d.stats.errors.read += 1;
                            self.reconnect(d);
                            return;
                        }
                        off += consumed;
                    }
                }
            }

            if *d.stop {
                return;
            }
        }
    }

    /// Steps 1-9 of response completion. Returns true when the slot
    /// reconnected and must not be touched further this event.
    fn finish_response(&mut self, status: u16, keep_alive: bool, d: &mut Dispatch<'_>) -> bool {
        let now = time::now_us();

        d.stats.complete += 1;
        d.stats.requests += 1;
        if status > 399 {
            d.stats.errors.status += 1;
        }

        if d.script.want_response() {
            d.script
                .response(status, &self.headers_buf, &self.body_buf);
            // Cursor reset between responses; the buffer keeps its
            // capacity and the next header field overwrites it.
            self.headers_buf.clear();
            self.hdr_state = HdrState::Field;
        }

        if now >= d.stop_at {
            *d.stop = true;
        }

        self.pacer.complete += 1;

        let expected = self.pacer.expected_start(self.complete_at_last_batch_start);
        self.latest_expected_start = expected;

        if self.pending > 0 {
            self.pending -= 1;
        }
        let batch_done = self.pending == 0;
        if batch_done {
            self.has_pending = false;
        }

        if d.record_all || batch_done {
            if now >= expected {
                d.stats.hist.saturating_record(now - expected);
            } else {
                self.dump_pacing(now, expected);
            }
            d.stats
                .u_hist
                .saturating_record(now.saturating_sub(self.actual_latency_start));
        }

        if batch_done {
            // Next batch.
            self.set_interest(true, true, d.registry);
        }

        if !keep_alive {
            self.reconnect(d);
            return true;
        }

        self.parser.reset();
        false
    }

    /// Corrected latency would be negative: a pacing-math bug, not a target
    /// problem. Dump every input and keep running.
    fn dump_pacing(&self, now: u64, expected: u64) {
        error!(
            "negative corrected latency on connection {}: now={} expected_start={} \
             thread_start={} complete={} complete_at_batch_start={} throughput={} \
             caught_up={} catch_up_start_time={} complete_at_catch_up_start={} \
             catch_up_throughput={} latest_should_send_time={} latest_connect={} \
             latest_write={}",
            self.token,
            now,
            expected,
            self.pacer.thread_start,
            self.pacer.complete,
            self.complete_at_last_batch_start,
            self.pacer.throughput,
            self.pacer.caught_up,
            self.pacer.catch_up_start_time,
            self.pacer.complete_at_catch_up_start,
            self.pacer.catch_up_throughput,
            self.latest_should_send_time,
            self.latest_connect,
            self.latest_write,
        );
    }

    /// Moves the registration to exactly the given directions, registering
    /// or deregistering as needed.
    fn set_interest(&mut self, read: bool, write: bool, registry: &Registry) {
        let Some(sock) = self.sock.as_mut() else {
            return;
        };

        let result = if !read && !write {
            if self.registered {
                self.registered = false;
                registry.deregister(sock.stream())
            } else {
                Ok(())
            }
        } else {
            let interest = if read && write {
                Interest::READABLE | Interest::WRITABLE
            } else if read {
                Interest::READABLE
            } else {
                Interest::WRITABLE
            };
            if self.registered {
                registry.reregister(sock.stream(), Token(self.token), interest)
            } else {
                self.registered = true;
                registry.register(sock.stream(), Token(self.token), interest)
            }
        };

        self.interest_read = read;
        self.interest_write = write;

        if let Err(err) = result {
            error!(
                "event registration failed on connection {}: {}",
                self.token, err
            );
        }
    }
}

/// Sink that fills the connection's header and body buffers for the script
/// response hook and captures message completion.
struct HookSink<'a> {
    headers: &'a mut Vec<u8>,
    body: &'a mut Vec<u8>,
    state: &'a mut HdrState,
    capture: bool,
    complete: Option<(u16, bool)>,
}

impl<'a> HookSink<'a> {
    fn new(
        headers: &'a mut Vec<u8>,
        body: &'a mut Vec<u8>,
        state: &'a mut HdrState,
        capture: bool,
    ) -> Self {
        HookSink {
            headers,
            body,
            state,
            capture,
            complete: None,
        }
    }

    fn take_complete(&mut self) -> Option<(u16, bool)> {
        self.complete.take()
    }
}

impl ResponseSink for HookSink<'_> {
    fn on_header_field(&mut self, name: &[u8]) {
        if !self.capture {
            return;
        }
        if self.headers.is_empty() {
            // First header of a new message; drop the previous body.
            self.body.clear();
        } else if *self.state == HdrState::Value {
            self.headers.extend_from_slice(b"\r\n");
        }
        self.headers.extend_from_slice(name);
        *self.state = HdrState::Field;
    }

    fn on_header_value(&mut self, value: &[u8]) {
        if !self.capture {
            return;
        }
        if *self.state == HdrState::Field {
            self.headers.extend_from_slice(b": ");
        }
        self.headers.extend_from_slice(value);
        *self.state = HdrState::Value;
    }

    fn on_body(&mut self, chunk: &[u8]) {
        if self.capture {
            self.body.extend_from_slice(chunk);
        }
    }

    fn on_message_complete(&mut self, status: u16, keep_alive: bool) {
        self.complete = Some((status, keep_alive));
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use mio::Poll;

    use crate::config::{Config, Scheme};
    use crate::net::Target;
    use crate::phase::Phase;
    use crate::reactor::TimerQueue;
    use crate::script::StaticScript;
    use crate::stats::WorkerStats;

    use super::{Connection, Dispatch};

    fn test_config() -> Config {
        Config {
            url: "http://127.0.0.1:8080/".into(),
            scheme: Scheme::Http,
            host: "127.0.0.1".into(),
            port: 8080,
            path: "/".into(),
            connections: 1,
            threads: 1,
            duration_s: 10,
            timeout_ms: 2000,
            rate: 1000,
            headers: Vec::new(),
            record_all: true,
            latency: false,
            u_latency: false,
            warmup: false,
            warmup_timeout_ms: None,
            bind_addrs: Vec::new(),
        }
    }

    fn test_connection() -> Connection {
        let target = Arc::new(Target {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            bind: None,
            tls: None,
        });
        let request: Arc<[u8]> = b"GET / HTTP/1.1\r\n\r\n".to_vec().into();
        Connection::new(0, target, request, 0.001)
    }

    /// Drives `finish_response` directly; the slot has no socket, so
    /// registration calls are no-ops.
    fn finish_batch(record_all: bool, pipeline: usize) -> (WorkerStats, Vec<u64>) {
        let poll = Poll::new().expect("create poll");
        let mut timers = TimerQueue::new();
        let mut stats = WorkerStats::new();
        let mut script = StaticScript::new(&test_config());
        let mut stop = false;

        let mut conn = test_connection();
        conn.pacer.thread_start = 1;
        conn.has_pending = true;
        conn.pending = pipeline;
        conn.complete_at_last_batch_start = 0;
        conn.actual_latency_start = crate::time::now_us();

        let mut expected_starts = Vec::new();
        for _ in 0..pipeline {
            let mut d = Dispatch {
                registry: poll.registry(),
                timers: &mut timers,
                stats: &mut stats,
                script: &mut script,
                phase: Phase::Normal,
                record_all,
                dynamic: false,
                pipeline,
                stop_at: u64::MAX,
                stop: &mut stop,
            };
            let reconnected = conn.finish_response(200, true, &mut d);
            assert!(!reconnected);
            expected_starts.push(conn.latest_expected_start);
        }

        (stats, expected_starts)
    }

    #[test]
    fn record_all_records_every_response_of_a_batch() {
        let (stats, expected) = finish_batch(true, 4);
        assert_eq!(4, stats.complete);
        assert_eq!(4, stats.hist.len());
        assert_eq!(4, stats.u_hist.len());
        // Every response of the batch shares the batch-start expected time.
        assert!(expected.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn batch_latency_records_only_the_final_response() {
        let (stats, _) = finish_batch(false, 4);
        assert_eq!(4, stats.complete);
        assert_eq!(1, stats.hist.len());
        assert_eq!(1, stats.u_hist.len());
    }

    #[test]
    fn pending_reaches_zero_and_clears_has_pending() {
        let poll = Poll::new().expect("create poll");
        let mut timers = TimerQueue::new();
        let mut stats = WorkerStats::new();
        let mut script = StaticScript::new(&test_config());
        let mut stop = false;

        let mut conn = test_connection();
        conn.pacer.thread_start = 1;
        conn.has_pending = true;
        conn.pending = 2;

        let mut d = Dispatch {
            registry: poll.registry(),
            timers: &mut timers,
            stats: &mut stats,
            script: &mut script,
            phase: Phase::Normal,
            record_all: true,
            dynamic: false,
            pipeline: 2,
            stop_at: u64::MAX,
            stop: &mut stop,
        };

        conn.finish_response(200, true, &mut d);
        assert_eq!(1, conn.pending);
        assert!(conn.has_pending);

        conn.finish_response(200, true, &mut d);
        assert_eq!(0, conn.pending);
        assert!(!conn.has_pending);
        assert_eq!(2, conn.pacer.complete);
    }

    #[test]
    fn status_above_399_counts_as_status_error() {
        let poll = Poll::new().expect("create poll");
        let mut timers = TimerQueue::new();
        let mut stats = WorkerStats::new();
        let mut script = StaticScript::new(&test_config());
        let mut stop = false;

        let mut conn = test_connection();
        conn.pacer.thread_start = 1;
        conn.has_pending = true;
        conn.pending = 1;

        let mut d = Dispatch {
            registry: poll.registry(),
            timers: &mut timers,
            stats: &mut stats,
            script: &mut script,
            phase: Phase::Normal,
            record_all: true,
            dynamic: false,
            pipeline: 1,
            stop_at: u64::MAX,
            stop: &mut stop,
        };

        conn.finish_response(503, true, &mut d);
        assert_eq!(1, d.stats.errors.status);

        conn.has_pending = true;
        conn.pending = 1;
        conn.finish_response(399, true, &mut d);
        assert_eq!(1, d.stats.errors.status);
    }

    #[test]
    fn reaching_the_deadline_requests_a_reactor_stop() {
        let poll = Poll::new().expect("create poll");
        let mut timers = TimerQueue::new();
        let mut stats = WorkerStats::new();
        let mut script = StaticScript::new(&test_config());
        let mut stop = false;

        let mut conn = test_connection();
        conn.pacer.thread_start = 1;
        conn.has_pending = true;
        conn.pending = 1;

        let mut d = Dispatch {
            registry: poll.registry(),
            timers: &mut timers,
            stats: &mut stats,
            script: &mut script,
            phase: Phase::Normal,
            record_all: true,
            dynamic: false,
            pipeline: 1,
            stop_at: 0,
            stop: &mut stop,
        };

        conn.finish_response(200, true, &mut d);
        assert!(stop);
    }
}
