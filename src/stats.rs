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

//! Latency histograms and per-worker counters

use core::fmt;

use hdrhistogram::Histogram;

/// Largest recordable latency: 24 hours in microseconds.
pub const MAX_LATENCY_US: u64 = 86_400_000_000;

/// Largest recordable throughput sample, in requests per second.
pub const MAX_RATE_RPS: u64 = 10_000_000;

/// Builds a latency histogram covering 1 µs to 24 h at 3 significant digits.
pub fn latency_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)
        .expect("latency histogram bounds are statically valid")
}

/// Builds a histogram for aggregated requests-per-second samples.
pub fn rate_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, MAX_RATE_RPS, 3)
        .expect("rate histogram bounds are statically valid")
}

/// Socket and protocol error counts, reported at the end of a run.
///
/// `established` is informational rather than an error: the number of
/// completed handshakes, including those performed by reconnects. `timeout`
/// exists in the schema but the core records no per-request timeouts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCounters {
    /// Failed connection attempts.
    pub connect: u64,
    /// Read failures and parser consumption mismatches.
    pub read: u64,
    /// Write failures.
    pub write: u64,
    /// Request timeouts.
    pub timeout: u64,
    /// Responses with an HTTP status above 399.
    pub status: u64,
    /// Successful handshakes.
    pub established: u64,
    /// Connections re-established after an error or `Connection: close`.
    pub reconnect: u64,
}

impl ErrorCounters {
    /// Folds another worker's counters into this one.
    pub fn merge(&mut self, other: &ErrorCounters) {
        self.connect += other.connect;
        self.read += other.read;
        self.write += other.write;
        self.timeout += other.timeout;
        self.status += other.status;
        self.established += other.established;
        self.reconnect += other.reconnect;
    }

    /// True when any socket-level error was observed.
    pub fn any_socket_error(&self) -> bool {
        self.connect > 0 || self.read > 0 || self.write > 0 || self.timeout > 0
    }
}

/// Counters and histograms owned by a single worker thread.
///
/// `requests` counts completions within the current sampling interval and is
/// reset by the rate sampler; `complete` is the total for the whole run.
pub struct WorkerStats {
    /// Total completed responses.
    pub complete: u64,
    /// Completed responses in the current sampling interval.
    pub requests: u64,
    /// Bytes read off the wire.
    pub bytes: u64,
    /// Interval start, µs. Reset on phase entry and at calibration.
    pub start: u64,
    /// Corrected latency: dated from the expected send time.
    pub hist: Histogram<u64>,
    /// Uncorrected latency: dated from the actual send time.
    pub u_hist: Histogram<u64>,
    /// Error taxonomy for this worker.
    pub errors: ErrorCounters,
}

impl WorkerStats {
    /// Creates zeroed stats with empty histograms.
    pub fn new() -> Self {
        WorkerStats {
            complete: 0,
            requests: 0,
            bytes: 0,
            start: 0,
            hist: latency_histogram(),
            u_hist: latency_histogram(),
            errors: ErrorCounters::default(),
        }
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerStats")
            .field("complete", &self.complete)
            .field("requests", &self.requests)
            .field("bytes", &self.bytes)
            .field("samples", &self.hist.len())
            .field("errors", &self.errors)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{latency_histogram, ErrorCounters};

    #[test]
    fn error_counters_merge_sums_every_field() {
        let mut a = ErrorCounters {
            connect: 1,
            read: 2,
            write: 3,
            timeout: 4,
            status: 5,
            established: 6,
            reconnect: 7,
        };
        let b = a;
        a.merge(&b);
        assert_eq!(
            a,
            ErrorCounters {
                connect: 2,
                read: 4,
                write: 6,
                timeout: 8,
                status: 10,
                established: 12,
                reconnect: 14,
            }
        );
    }

    #[test]
    fn merged_histograms_match_single_histogram_percentiles() {
        let mut single = latency_histogram();
        let mut left = latency_histogram();
        let mut right = latency_histogram();

        for v in 1..=1000u64 {
            single.saturating_record(v * 100);
            if v % 2 == 0 {
                left.saturating_record(v * 100);
            } else {
                right.saturating_record(v * 100);
            }
        }

        left.add(&right).expect("histograms share configuration");

        for q in [0.5, 0.9, 0.99, 0.999, 1.0] {
            // The histogram keeps 3 significant digits.
            let merged = left.value_at_quantile(q) as f64;
            let direct = single.value_at_quantile(q) as f64;
            assert!((merged - direct).abs() <= direct * 1e-3);
        }
    }

    #[test]
    fn saturating_record_clamps_out_of_range_values() {
        let mut h = latency_histogram();
        h.saturating_record(u64::MAX);
        assert_eq!(1, h.len());
    }
}
