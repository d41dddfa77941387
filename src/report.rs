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

//! Final report formatting

use hdrhistogram::Histogram;

use crate::config::Config;
use crate::coordinator::Summary;

const SPECTRUM: [f64; 8] = [50.0, 75.0, 90.0, 99.0, 99.9, 99.99, 99.999, 100.0];

/// Formats a count with a metric suffix: `1.23k`, `4.56M`, `7.89G`.
pub fn format_metric(n: f64) -> String {
    if n >= 1e9 {
        format!("{:.2}G", n / 1e9)
    } else if n >= 1e6 {
        format!("{:.2}M", n / 1e6)
    } else if n >= 1e3 {
        format!("{:.2}k", n / 1e3)
    } else {
        format!("{:.2}", n)
    }
}

/// Formats a byte count with binary units: `1.18MB`, `52.10KB`.
pub fn format_binary(n: f64) -> String {
    const KB: f64 = 1024.0;
    if n >= KB * KB * KB * KB {
        format!("{:.2}TB", n / (KB * KB * KB * KB))
    } else if n >= KB * KB * KB {
        format!("{:.2}GB", n / (KB * KB * KB))
    } else if n >= KB * KB {
        format!("{:.2}MB", n / (KB * KB))
    } else if n >= KB {
        format!("{:.2}KB", n / KB)
    } else {
        format!("{:.2}B", n)
    }
}

/// Formats a microsecond quantity in the most readable unit.
pub fn format_time_us(us: f64) -> String {
    if us >= 3_600_000_000.0 {
        format!("{:.2}h", us / 3_600_000_000.0)
    } else if us >= 60_000_000.0 {
        format!("{:.2}m", us / 60_000_000.0)
    } else if us >= 1_000_000.0 {
        format!("{:.2}s", us / 1_000_000.0)
    } else if us >= 1_000.0 {
        format!("{:.2}ms", us / 1_000.0)
    } else {
        format!("{:.2}us", us)
    }
}

/// Percentage of recorded samples within one standard deviation of the mean.
fn within_stdev(hist: &Histogram<u64>, mean: f64, stdev: f64) -> f64 {
    if hist.is_empty() {
        return 100.0;
    }
    let lo = mean - stdev;
    let hi = mean + stdev;
    let mut within = 0u64;
    for v in hist.iter_recorded() {
        let value = v.value_iterated_to() as f64;
        if value >= lo && value <= hi {
            within += v.count_at_value();
        }
    }
    within as f64 * 100.0 / hist.len() as f64
}

fn print_stat_row(name: &str, hist: &Histogram<u64>, fmt: fn(f64) -> String) {
    let mean = hist.mean();
    let stdev = hist.stdev();
    println!(
        "    {:<10}{:>8}{:>10}{:>10}{:>9.2}%",
        name,
        fmt(mean),
        fmt(stdev),
        fmt(hist.max() as f64),
        within_stdev(hist, mean, stdev),
    );
}

fn print_spectrum(hist: &Histogram<u64>) {
    for pct in SPECTRUM {
        let value = hist.value_at_quantile(pct / 100.0);
        println!("{:>8.3}% {:>10}", pct, format_time_us(value as f64));
    }
}

/// Prints the run report.
pub fn print(cfg: &Config, summary: &Summary) {
    let runtime_s = summary.runtime_us as f64 / 1_000_000.0;

    println!(
        "Running {} test @ {}",
        format_time_us(cfg.duration_s as f64 * 1_000_000.0),
        cfg.url
    );
    println!(
        "  {} threads and {} connections",
        cfg.threads, cfg.connections
    );

    println!("  Thread Stats   Avg      Stdev     Max   +/- Stdev");
    print_stat_row("Latency", &summary.hist, format_time_us);
    print_stat_row("Req/Sec", &summary.samples, format_metric);

    if cfg.latency {
        println!("  Latency Distribution (HdrHistogram - Recorded Latency)");
        print_spectrum(&summary.hist);
    }
    if cfg.u_latency {
        println!("  Uncorrected Latency (measured without taking delayed starts into account)");
        print_spectrum(&summary.u_hist);
    }

    println!(
        "  {} requests in {}, {} read",
        summary.complete,
        format_time_us(summary.runtime_us as f64),
        format_binary(summary.bytes as f64)
    );

    if summary.errors.any_socket_error() {
        println!(
            "  Socket errors: connect {}, read {}, write {}, timeout {}",
            summary.errors.connect,
            summary.errors.read,
            summary.errors.write,
            summary.errors.timeout
        );
    }
    if summary.errors.status > 0 {
        println!("  Non-2xx or 3xx responses: {}", summary.errors.status);
    }

    if runtime_s > 0.0 {
        println!(
            "Requests/sec: {:>10.2}",
            summary.complete as f64 / runtime_s
        );
        println!(
            "Transfer/sec: {:>10}",
            format_binary(summary.bytes as f64 / runtime_s)
        );
    }
}

#[cfg(test)]
mod test {
    use super::{format_binary, format_metric, format_time_us};

    #[test]
    fn metric_suffixes_scale_by_thousands() {
        assert_eq!("999.00", format_metric(999.0));
        assert_eq!("1.23k", format_metric(1234.0));
        assert_eq!("4.56M", format_metric(4_560_000.0));
        assert_eq!("7.89G", format_metric(7_890_000_000.0));
    }

    #[test]
    fn binary_suffixes_scale_by_1024() {
        assert_eq!("512.00B", format_binary(512.0));
        assert_eq!("1.00KB", format_binary(1024.0));
        assert_eq!("1.18MB", format_binary(1_234_567.0));
    }

    #[test]
    fn time_picks_the_most_readable_unit() {
        assert_eq!("750.00us", format_time_us(750.0));
        assert_eq!("1.23ms", format_time_us(1234.0));
        assert_eq!("30.00s", format_time_us(30_000_000.0));
        assert_eq!("2.00m", format_time_us(120_000_000.0));
        assert_eq!("1.50h", format_time_us(5_400_000_000.0));
    }
}
