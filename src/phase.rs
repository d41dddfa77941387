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

//! Warmup phase and the cross-thread handshake barrier
//!
//! With warmup enabled, every worker opens all of its connections (TLS
//! handshakes included) before anything is sent. A worker whose connections
//! are all established publishes readiness here; once every worker has, the
//! shared flag flips and each worker observes it on its sync timer and
//! enters the NORMAL phase. Workers never block on the barrier; they poll.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// How often a warming-up worker polls the shared ready flag.
pub const THREAD_SYNC_INTERVAL_MS: u64 = 1000;

/// Delay from NORMAL entry to the histogram-reset calibration event.
pub const CALIBRATE_DELAY_MS: u64 = 10_000;

/// Measurement phase of a worker. Transitions are monotonic: a worker moves
/// WARMUP → NORMAL once and a worker that starts NORMAL stays there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Connections are being established; nothing is sent or recorded.
    Warmup,
    /// Requests flow and latencies are recorded.
    Normal,
}

/// One-shot readiness barrier across workers.
#[derive(Debug)]
pub struct ReadyBarrier {
    workers: usize,
    published: AtomicUsize,
    ready: AtomicBool,
}

impl ReadyBarrier {
    /// A barrier released once `workers` publications arrive.
    pub fn new(workers: usize) -> Self {
        ReadyBarrier {
            workers,
            published: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
        }
    }

    /// Reports this worker's connections all established. Call at most once
    /// per worker.
    pub fn publish(&self) {
        if self.published.fetch_add(1, Ordering::AcqRel) + 1 >= self.workers {
            self.ready.store(true, Ordering::Release);
        }
    }

    /// Whether every worker has published.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Default warmup timeout: scaled to the handshake volume, floored at one
/// second. A worker that reaches it enters NORMAL unilaterally.
pub fn warmup_timeout_ms(connections: usize) -> u64 {
    (connections as u64 * 600_000 / 350_000).max(1000)
}

#[cfg(test)]
mod test {
    use super::{warmup_timeout_ms, ReadyBarrier};

    #[test]
    fn barrier_releases_only_after_every_worker_publishes() {
        let barrier = ReadyBarrier::new(3);
        assert!(!barrier.is_ready());
        barrier.publish();
        barrier.publish();
        assert!(!barrier.is_ready());
        barrier.publish();
        assert!(barrier.is_ready());
    }

    #[test]
    fn single_worker_barrier_releases_immediately() {
        let barrier = ReadyBarrier::new(1);
        barrier.publish();
        assert!(barrier.is_ready());
    }

    #[test]
    fn warmup_timeout_scales_with_connections_and_has_a_floor() {
        assert_eq!(1000, warmup_timeout_ms(1));
        assert_eq!(1000, warmup_timeout_ms(583));
        // 700 connections: 700 * 600000 / 350000 = 1200ms.
        assert_eq!(1200, warmup_timeout_ms(700));
    }
}
