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

//! Per-connection send-rate control
//!
//! The ideal schedule places completion `n` at `thread_start + n /
//! throughput`. While the connection is on or ahead of that schedule, sends
//! are delayed to it. Once it falls behind (the target stalled), sends
//! follow an accelerated schedule at twice the nominal rate, anchored at the
//! moment the connection was first observed behind. Catching up at a bounded
//! multiple avoids the unbounded burst a pure deficit-drain would produce.

/// Rate state owned by one connection.
#[derive(Debug, Clone)]
pub struct Pacer {
    /// Nominal rate in requests per microsecond.
    pub throughput: f64,
    /// Accelerated rate used while behind schedule.
    pub catch_up_throughput: f64,
    /// Microsecond timestamp of the first connect; origin of the schedule.
    pub thread_start: u64,
    /// Responses completed on this connection. Never reset, not even by a
    /// reconnect.
    pub complete: u64,
    /// Whether the connection is on the ideal schedule.
    pub caught_up: bool,
    /// When the current catch-up episode began.
    pub catch_up_start_time: u64,
    /// Value of `complete` when the catch-up episode began.
    pub complete_at_catch_up_start: u64,
}

impl Pacer {
    /// Creates a pacer for `throughput` requests per microsecond.
    pub fn new(throughput: f64) -> Self {
        Pacer {
            throughput,
            catch_up_throughput: 2.0 * throughput,
            thread_start: 0,
            complete: 0,
            caught_up: true,
            catch_up_start_time: 0,
            complete_at_catch_up_start: 0,
        }
    }

    /// Microseconds until the next permitted send; 0 means send now.
    pub fn usec_to_next_send(&mut self, now: u64) -> u64 {
        let next = self.thread_start + (self.complete as f64 / self.throughput) as u64;
        if next > now {
            self.caught_up = true;
            return next - now;
        }

        // Behind schedule. Anchor the catch-up schedule at the moment we
        // first noticed.
        if self.caught_up {
            self.caught_up = false;
            self.catch_up_start_time = now;
            self.complete_at_catch_up_start = self.complete;
        }

        let done_since = self.complete - self.complete_at_catch_up_start;
        let catch_next = self.catch_up_start_time
            + (done_since as f64 / self.catch_up_throughput) as u64;
        if catch_next > now {
            catch_next - now
        } else {
            0
        }
    }

    /// When a batch whose first request was the `complete_at_batch_start`th
    /// completion should have started under the ideal schedule.
    #[inline]
    pub fn expected_start(&self, complete_at_batch_start: u64) -> u64 {
        self.thread_start + (complete_at_batch_start as f64 / self.throughput) as u64
    }
}

#[cfg(test)]
mod test {
    use super::Pacer;

    fn pacer_at_1000_rps() -> Pacer {
        // 1000 req/s expressed in requests per microsecond.
        let mut p = Pacer::new(0.001);
        p.thread_start = 0;
        p
    }

    #[test]
    fn first_send_is_immediate() {
        let mut p = pacer_at_1000_rps();
        assert_eq!(0, p.usec_to_next_send(0));
    }

    #[test]
    fn send_ahead_of_schedule_is_delayed_to_the_slot() {
        let mut p = pacer_at_1000_rps();
        p.complete = 1;
        assert_eq!(500, p.usec_to_next_send(500));
        assert!(p.caught_up);
    }

    #[test]
    fn falling_behind_enters_catch_up_at_double_rate() {
        let mut p = pacer_at_1000_rps();
        p.complete = 1;
        assert_eq!(0, p.usec_to_next_send(2000));
        assert!(!p.caught_up);
        assert_eq!(2000, p.catch_up_start_time);
        assert_eq!(1, p.complete_at_catch_up_start);
        assert!((p.catch_up_throughput - 0.002).abs() < f64::EPSILON);
    }

    #[test]
    fn catch_up_schedule_paces_at_twice_nominal() {
        let mut p = pacer_at_1000_rps();
        p.complete = 1;
        assert_eq!(0, p.usec_to_next_send(2000));
        // One completion into the episode: next catch-up slot is 500 µs
        // after the episode began.
        p.complete = 2;
        assert_eq!(400, p.usec_to_next_send(2100));
    }

    #[test]
    fn catching_up_returns_to_the_ideal_schedule() {
        let mut p = pacer_at_1000_rps();
        p.complete = 1;
        assert_eq!(0, p.usec_to_next_send(2000));
        // Enough completions that the ideal schedule is ahead of now again.
        p.complete = 10;
        let delay = p.usec_to_next_send(3000);
        assert_eq!(7000, delay);
        assert!(p.caught_up);
    }

    #[test]
    fn zero_delay_is_idempotent() {
        let mut p = pacer_at_1000_rps();
        p.complete = 1;
        assert_eq!(0, p.usec_to_next_send(2000));
        assert_eq!(0, p.usec_to_next_send(2000));
    }

    #[test]
    fn delay_is_non_increasing_in_now_while_caught_up() {
        let mut prev = u64::MAX;
        for now in [0u64, 100, 250, 400, 900] {
            let mut p = pacer_at_1000_rps();
            p.complete = 1;
            let delay = p.usec_to_next_send(now);
            assert!(delay <= prev);
            prev = delay;
        }
    }

    #[test]
    fn expected_start_follows_the_ideal_schedule() {
        let mut p = pacer_at_1000_rps();
        p.thread_start = 5000;
        assert_eq!(5000, p.expected_start(0));
        assert_eq!(8000, p.expected_start(3));
    }
}
