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

//! Single-threaded readiness reactor with millisecond timers
//!
//! One reactor per worker thread. Socket readiness comes from mio; timed
//! work is a binary heap of deadlines drained once per loop turn. Timers are
//! identified by a small enum rather than callbacks, and the worker
//! dispatches on it inline, the same shape its poll loop uses for socket
//! tokens. A timer armed while due timers are being dispatched lands in the
//! heap only, so it cannot fire before the next turn.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry};

use crate::time;

/// Timed work a worker can schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    /// Re-enable the write event of a pace-delayed connection slot.
    Pace(usize),
    /// Retry a failed connect on a connection slot.
    Reconnect(usize),
    /// Poll the cross-thread ready flag during warmup.
    ThreadSync,
    /// Derive the sampling interval from warmed-in latency data.
    Calibrate,
    /// Record a requests-per-second sample.
    SampleRate,
    /// Check the stop flag and the test deadline.
    StopCheck,
}

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline_ms: u64,
    seq: u64,
    kind: TimerKind,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline_ms
            .cmp(&other.deadline_ms)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending timers ordered by deadline.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

impl TimerQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        TimerQueue::default()
    }

    /// Schedules `kind` to fire `delay_ms` from now. Periodic behavior is
    /// re-arming from the dispatch site.
    pub fn arm(&mut self, delay_ms: u64, kind: TimerKind) {
        self.arm_at(time::now_ms() + delay_ms, kind);
    }

    fn arm_at(&mut self, deadline_ms: u64, kind: TimerKind) {
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline_ms,
            seq: self.seq,
            kind,
        }));
    }

    /// Milliseconds until the earliest deadline, if any timer is armed.
    pub fn next_timeout(&self, now_ms: u64) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(e)| Duration::from_millis(e.deadline_ms.saturating_sub(now_ms)))
    }

    /// Moves every timer due at `now_ms` into `due`, preserving deadline
    /// order. Timers armed after this call are not included.
    pub fn take_due(&mut self, now_ms: u64, due: &mut Vec<TimerKind>) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline_ms > now_ms {
                break;
            }
            due.push(self.heap.pop().expect("peeked entry exists").0.kind);
        }
    }

    /// Whether any timer is armed.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Split borrows of a reactor handed to connection code.
#[derive(Debug)]
pub struct ReactorParts<'a> {
    /// Registration handle for socket events.
    pub registry: &'a Registry,
    /// Timer queue for pace and reconnect timers.
    pub timers: &'a mut TimerQueue,
}

/// Readiness loop state for one worker thread.
#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
    timers: TimerQueue,
    stopped: bool,
}

impl Reactor {
    /// Creates a reactor. `events` capacity is sized by the caller per its
    /// connection count.
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            timers: TimerQueue::new(),
            stopped: false,
        })
    }

    /// Registration handle.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Borrows the registry and timer queue independently.
    pub fn parts(&mut self) -> ReactorParts<'_> {
        ReactorParts {
            registry: self.poll.registry(),
            timers: &mut self.timers,
        }
    }

    /// Schedules a timer.
    pub fn arm(&mut self, delay_ms: u64, kind: TimerKind) {
        self.timers.arm(delay_ms, kind);
    }

    /// Blocks until socket readiness or the next timer deadline.
    pub fn poll(&mut self, events: &mut Events) -> io::Result<()> {
        let timeout = self.timers.next_timeout(time::now_ms());
        match self.poll.poll(events, timeout) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Collects timers due now into `due`.
    pub fn take_due(&mut self, due: &mut Vec<TimerKind>) {
        self.timers.take_due(time::now_ms(), due);
    }

    /// Requests loop exit at the end of the current turn.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Whether an exit has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

#[cfg(test)]
mod test {
    use super::{TimerKind, TimerQueue};

    #[test]
    fn take_due_returns_timers_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.arm_at(30, TimerKind::StopCheck);
        q.arm_at(10, TimerKind::Calibrate);
        q.arm_at(20, TimerKind::ThreadSync);

        let mut due = Vec::new();
        q.take_due(30, &mut due);
        assert_eq!(
            vec![TimerKind::Calibrate, TimerKind::ThreadSync, TimerKind::StopCheck],
            due
        );
        assert!(q.is_empty());
    }

    #[test]
    fn take_due_leaves_future_timers_armed() {
        let mut q = TimerQueue::new();
        q.arm_at(10, TimerKind::Pace(1));
        q.arm_at(50, TimerKind::Pace(2));

        let mut due = Vec::new();
        q.take_due(10, &mut due);
        assert_eq!(vec![TimerKind::Pace(1)], due);
        assert!(!q.is_empty());
    }

    #[test]
    fn same_deadline_fires_in_arm_order() {
        let mut q = TimerQueue::new();
        q.arm_at(5, TimerKind::Pace(7));
        q.arm_at(5, TimerKind::Pace(8));

        let mut due = Vec::new();
        q.take_due(5, &mut due);
        assert_eq!(vec![TimerKind::Pace(7), TimerKind::Pace(8)], due);
    }

    #[test]
    fn next_timeout_is_zero_for_overdue_timers() {
        let mut q = TimerQueue::new();
        q.arm_at(5, TimerKind::StopCheck);
        assert_eq!(
            Some(std::time::Duration::from_millis(0)),
            q.next_timeout(100)
        );
        assert_eq!(None, TimerQueue::new().next_timeout(100));
    }
}
