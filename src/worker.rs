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

//! Worker thread: one reactor driving a slab of paced connections
//!
//! All connection state is confined to the owning thread; the only shared
//! state a worker touches is the stop flag, the warmup barrier and the
//! sampled-rate histogram. Readiness events and due timers are dispatched
//! inline from the run loop by slab token and timer kind.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::Events;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use slab::Slab;

use crate::config::Config;
use crate::connection::{Connection, Dispatch, EventOutcome};
use crate::coordinator::Shared;
use crate::net::Target;
use crate::phase::{self, Phase, CALIBRATE_DELAY_MS, THREAD_SYNC_INTERVAL_MS};
use crate::reactor::{Reactor, TimerKind};
use crate::script::{self, Script};
use crate::stats::WorkerStats;
use crate::time;

/// How often a worker checks the stop flag and the deadline.
pub const STOP_CHECK_INTERVAL_MS: u64 = 2000;

/// One load-generating thread.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    cfg: Arc<Config>,
    shared: Arc<Shared>,
    target: Arc<Target>,
    reactor: Reactor,
    connections: Slab<Connection>,
    stats: WorkerStats,
    phase: Phase,
    phase_normal_start: u64,
    stop_at: u64,
    warmup_deadline_ms: u64,
    sample_interval_ms: u64,
    script: Box<dyn Script>,
    pipeline: usize,
    dynamic: bool,
    request: Arc<[u8]>,
    conn_count: usize,
    /// Per-connection nominal rate, requests per microsecond.
    throughput: f64,
    published: bool,
}

impl Worker {
    /// Builds a worker. `target` carries this worker's bind address;
    /// `stop_at` is the absolute deadline in µs.
    pub fn new(
        id: usize,
        cfg: Arc<Config>,
        shared: Arc<Shared>,
        target: Arc<Target>,
        stop_at: u64,
    ) -> io::Result<Worker> {
        let mut script = script::for_config(&cfg);
        // The script context owns whatever randomness it needs; it is
        // seeded here, on the thread that will run it.
        let mut rng = SmallRng::from_entropy();
        script.init(&mut rng, &[]);

        let pipeline = script.verify_request().max(1);
        let dynamic = !script.is_static();
        let request = script.request();

        let conn_count = cfg.connections_per_thread().max(1);
        let throughput = cfg.rate_per_thread() as f64 / conn_count as f64 / 1_000_000.0;
        let phase = if cfg.warmup {
            Phase::Warmup
        } else {
            Phase::Normal
        };

        Ok(Worker {
            id,
            cfg,
            shared,
            target,
            reactor: Reactor::new()?,
            connections: Slab::with_capacity(conn_count),
            stats: WorkerStats::new(),
            phase,
            phase_normal_start: 0,
            stop_at,
            warmup_deadline_ms: 0,
            sample_interval_ms: 0,
            script,
            pipeline,
            dynamic,
            request,
            conn_count,
            throughput,
            published: false,
        })
    }

    /// Worker index, used for log context.
    pub fn id(&self) -> usize {
        self.id
    }

    /// When this worker entered the NORMAL phase, 0 if it started there.
    pub fn phase_normal_start(&self) -> u64 {
        self.phase_normal_start
    }

    /// Consumes the worker after its run, yielding its counters.
    pub fn into_stats(self) -> WorkerStats {
        self.stats
    }

    /// Runs the reactor until the stop flag, the deadline, or a poll
    /// failure.
    pub fn run(&mut self) {
        self.stats.start = time::now_us();

        for _ in 0..self.conn_count {
            let entry = self.connections.vacant_entry();
            let token = entry.key();
            entry.insert(Connection::new(
                token,
                self.target.clone(),
                self.request.clone(),
                self.throughput,
            ));
        }
        for token in 0..self.conn_count {
            self.with_conn(token, |conn, d| conn.connect(d));
        }

        self.reactor.arm(STOP_CHECK_INTERVAL_MS, TimerKind::StopCheck);
        if self.phase == Phase::Warmup {
            let timeout = self
                .cfg
                .warmup_timeout_ms
                .unwrap_or_else(|| phase::warmup_timeout_ms(self.cfg.connections));
            self.warmup_deadline_ms = time::now_ms() + timeout;
            self.reactor
                .arm(THREAD_SYNC_INTERVAL_MS, TimerKind::ThreadSync);
        } else {
            self.reactor.arm(CALIBRATE_DELAY_MS, TimerKind::Calibrate);
        }

        let mut events = Events::with_capacity(10 + 3 * self.conn_count);
        let mut due: Vec<TimerKind> = Vec::new();

        while !self.reactor.is_stopped() {
            if let Err(err) = self.reactor.poll(&mut events) {
                log::error!("worker {}: poll failed: {}", self.id, err);
                break;
            }

            for event in events.iter() {
                let token = event.token().0;
                let outcome = self.with_conn(token, |conn, d| {
                    conn.on_event(event.is_readable(), event.is_writable(), d)
                });
                if outcome == Some(EventOutcome::Established) && self.phase == Phase::Warmup {
                    self.note_established();
                }
                if self.reactor.is_stopped() {
                    break;
                }
            }

            due.clear();
            self.reactor.take_due(&mut due);
            for i in 0..due.len() {
                self.on_timer(due[i]);
                if self.reactor.is_stopped() {
                    break;
                }
            }
        }

        self.shutdown();
    }

    /// Runs `f` against one connection with the worker context split out.
    /// Applies a requested reactor stop afterwards.
    fn with_conn<R>(
        &mut self,
        token: usize,
        f: impl FnOnce(&mut Connection, &mut Dispatch<'_>) -> R,
    ) -> Option<R> {
        let mut stop = false;
        let result = {
            let parts = self.reactor.parts();
            let conn = self.connections.get_mut(token)?;
            let mut d = Dispatch {
                registry: parts.registry,
                timers: parts.timers,
                stats: &mut self.stats,
                script: self.script.as_mut(),
                phase: self.phase,
                record_all: self.cfg.record_all,
                dynamic: self.dynamic,
                pipeline: self.pipeline,
                stop_at: self.stop_at,
                stop: &mut stop,
            };
            f(conn, &mut d)
        };
        if stop {
            self.reactor.stop();
        }
        Some(result)
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Pace(token) => {
                self.with_conn(token, |conn, d| conn.resume_write(d));
            }
            TimerKind::Reconnect(token) => {
                self.with_conn(token, |conn, d| {
                    if !conn.is_connected() {
                        conn.connect(d);
                    }
                });
            }
            TimerKind::ThreadSync => self.thread_sync(),
            TimerKind::Calibrate => self.calibrate(),
            TimerKind::SampleRate => self.sample_rate(),
            TimerKind::StopCheck => self.stop_check(),
        }
    }

    /// During warmup, publishes readiness once every slot is established.
    fn note_established(&mut self) {
        if self.published {
            return;
        }
        if self.connections.iter().all(|(_, c)| c.is_connected()) {
            self.shared.barrier.publish();
            self.published = true;
        }
    }

    /// Warmup sync tick: move to NORMAL when every worker is ready, or when
    /// this worker's warmup timeout expires.
    fn thread_sync(&mut self) {
        if self.phase != Phase::Warmup {
            return;
        }
        if self.shared.barrier.is_ready() || time::now_ms() >= self.warmup_deadline_ms {
            self.enter_normal();
        } else {
            self.reactor
                .arm(THREAD_SYNC_INTERVAL_MS, TimerKind::ThreadSync);
        }
    }

    /// WARMUP → NORMAL, exactly once: install events everywhere, start the
    /// calibration clock.
    fn enter_normal(&mut self) {
        if self.phase == Phase::Normal {
            return;
        }
        self.phase = Phase::Normal;
        let now = time::now_us();
        self.phase_normal_start = now;
        self.stats.start = now;

        let registry = self.reactor.registry();
        for (_, conn) in self.connections.iter_mut() {
            conn.install_events(registry);
        }
        self.reactor.arm(CALIBRATE_DELAY_MS, TimerKind::Calibrate);
    }

    /// Ten seconds into NORMAL: derive the sampling interval from warmed-in
    /// latency, then discard the warm-in data. An idle target re-arms
    /// forever and never begins sampling.
    fn calibrate(&mut self) {
        if self.stats.hist.mean() <= 0.0 {
            self.reactor.arm(CALIBRATE_DELAY_MS, TimerKind::Calibrate);
            return;
        }

        let p90_ms = self.stats.hist.value_at_quantile(0.9) / 1000;
        self.sample_interval_ms = (2 * p90_ms).max(10);

        self.stats.hist.reset();
        self.stats.u_hist.reset();
        self.stats.start = time::now_us();
        self.stats.requests = 0;

        self.reactor
            .arm(self.sample_interval_ms, TimerKind::SampleRate);
    }

    /// Records one requests-per-second sample into the shared histogram.
    fn sample_rate(&mut self) {
        let now = time::now_us();
        let elapsed_ms = (now - self.stats.start) / 1000;
        if elapsed_ms > 0 {
            let rps = self.stats.requests * 1000 / elapsed_ms;
            self.shared
                .samples
                .lock()
                .expect("rate sample mutex poisoned")
                .saturating_record(rps);
        }
        self.stats.requests = 0;
        self.stats.start = now;
        self.reactor
            .arm(self.sample_interval_ms, TimerKind::SampleRate);
    }

    fn stop_check(&mut self) {
        if self.shared.stop.load(Ordering::Relaxed) || time::now_us() >= self.stop_at {
            self.shutdown();
        } else {
            self.reactor.arm(STOP_CHECK_INTERVAL_MS, TimerKind::StopCheck);
        }
    }

    /// Closes every connection and stops the reactor.
    fn shutdown(&mut self) {
        let registry = self.reactor.registry();
        for (_, conn) in self.connections.iter_mut() {
            conn.close(registry);
        }
        self.reactor.stop();
    }
}
