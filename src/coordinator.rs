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

//! Run coordination: resolve, spawn, join, aggregate

use core::fmt;
use std::any::Any;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use hdrhistogram::Histogram;

use crate::config::{Config, Scheme};
use crate::net::{tls, Target, TlsTarget};
use crate::phase::ReadyBarrier;
use crate::script;
use crate::stats::{latency_histogram, rate_histogram, ErrorCounters};
use crate::time;
use crate::worker::Worker;

/// State shared by every worker and the signal handler.
pub struct Shared {
    /// Global stop flag; a one-way 0 → 1 transition set on SIGINT.
    pub stop: AtomicBool,
    /// Warmup handshake barrier.
    pub barrier: ReadyBarrier,
    /// Requests-per-second samples from all workers.
    pub samples: Mutex<Histogram<u64>>,
}

impl Shared {
    /// Creates shared state for `workers` threads.
    pub fn new(workers: usize) -> Arc<Shared> {
        Arc::new(Shared {
            stop: AtomicBool::new(false),
            barrier: ReadyBarrier::new(workers),
            samples: Mutex::new(rate_histogram()),
        })
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("stop", &self.stop)
            .field("barrier", &self.barrier)
            .finish()
    }
}

/// Failures that end a run before or while workers exist.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// DNS produced no usable address.
    #[error("unable to resolve {host}:{port}: {source}")]
    Resolve {
        /// Host that failed to resolve.
        host: String,
        /// Service port.
        port: u16,
        /// Underlying resolver error.
        source: io::Error,
    },
    /// The URL host is not a valid TLS server name.
    #[error("invalid TLS server name: {0}")]
    ServerName(String),
    /// The OS refused a worker thread or its reactor.
    #[error("unable to create worker thread: {0}")]
    Spawn(io::Error),
    /// A worker thread panicked. Its sockets, TLS sessions, histograms and
    /// registrations were released on its own thread, and the remaining
    /// workers were stopped and joined before this was reported.
    #[error("worker thread panicked: {0}")]
    WorkerPanic(String),
}

/// Merged results of a completed run.
pub struct Summary {
    /// Total completed responses.
    pub complete: u64,
    /// Total bytes read.
    pub bytes: u64,
    /// Merged error counters.
    pub errors: ErrorCounters,
    /// Merged corrected-latency histogram.
    pub hist: Histogram<u64>,
    /// Merged uncorrected-latency histogram.
    pub u_hist: Histogram<u64>,
    /// Requests-per-second samples across workers.
    pub samples: Histogram<u64>,
    /// Measured runtime: from the measurement start (minimum NORMAL entry
    /// when warmup ran, startup otherwise) to join.
    pub runtime_us: u64,
}

impl fmt::Debug for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Summary")
            .field("complete", &self.complete)
            .field("bytes", &self.bytes)
            .field("errors", &self.errors)
            .field("runtime_us", &self.runtime_us)
            .finish()
    }
}

/// Resolves the target, preferring an IPv4 address when one exists.
pub fn resolve(cfg: &Config) -> Result<SocketAddr, RunError> {
    let mut script = script::for_config(cfg);
    // A script may resolve the target itself; the built-in context never
    // does.
    let _ = script.resolve(&cfg.host, &cfg.port.to_string());

    let addrs = (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()
        .map_err(|source| RunError::Resolve {
            host: cfg.host.clone(),
            port: cfg.port,
            source,
        })?;

    let mut found = None;
    for addr in addrs {
        found = Some(addr);
        if addr.is_ipv4() {
            break;
        }
    }
    found.ok_or_else(|| RunError::Resolve {
        host: cfg.host.clone(),
        port: cfg.port,
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
    })
}

/// Spawns the workers, waits for them, and merges their results.
pub fn run(cfg: Arc<Config>, addr: SocketAddr, shared: Arc<Shared>) -> Result<Summary, RunError> {
    time::init();
    let start_us = time::now_us();
    let stop_at = start_us + cfg.duration_s * 1_000_000;

    let tls = match cfg.scheme {
        Scheme::Http => None,
        Scheme::Https => Some(TlsTarget {
            config: tls::client_config(),
            name: tls::server_name(&cfg.host)
                .map_err(|_| RunError::ServerName(cfg.host.clone()))?,
        }),
    };

    let mut handles = Vec::with_capacity(cfg.threads);
    for id in 0..cfg.threads {
        let bind = if cfg.bind_addrs.is_empty() {
            None
        } else {
            Some(cfg.bind_addrs[id % cfg.bind_addrs.len()])
        };
        let target = Arc::new(Target {
            addr,
            bind,
            tls: tls.clone(),
        });

        let mut worker = Worker::new(id, cfg.clone(), shared.clone(), target, stop_at)
            .map_err(RunError::Spawn)?;
        let panic_stop = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("pelt-worker-{}", id))
            .spawn(move || {
                // Contain a panicking worker on its own thread: the Worker
                // is dropped here, which closes its sockets and releases
                // its histograms and registrations, and the other workers
                // are told to stop.
                match panic::catch_unwind(AssertUnwindSafe(|| worker.run())) {
                    Ok(()) => Ok(worker),
                    Err(payload) => {
                        panic_stop.stop.store(true, Ordering::Relaxed);
                        Err(panic_message(payload.as_ref()))
                    }
                }
            })
            .map_err(RunError::Spawn)?;
        handles.push(handle);
    }

    let mut complete = 0;
    let mut bytes = 0;
    let mut errors = ErrorCounters::default();
    let mut hist = latency_histogram();
    let mut u_hist = latency_histogram();
    let mut min_normal: Option<u64> = None;
    let mut first_panic: Option<String> = None;

    // Join every worker before reporting any failure, so each one winds
    // down and releases its resources.
    for handle in handles {
        let worker = match handle.join() {
            Ok(Ok(worker)) => worker,
            Ok(Err(message)) => {
                first_panic.get_or_insert(message);
                continue;
            }
            Err(payload) => {
                first_panic.get_or_insert(panic_message(payload.as_ref()));
                continue;
            }
        };
        let normal = worker.phase_normal_start();
        if normal > 0 {
            min_normal = Some(min_normal.map_or(normal, |m| m.min(normal)));
        }
        let stats = worker.into_stats();
        complete += stats.complete;
        bytes += stats.bytes;
        errors.merge(&stats.errors);
        hist.add(&stats.hist).expect("histograms share configuration");
        u_hist
            .add(&stats.u_hist)
            .expect("histograms share configuration");
    }

    if let Some(message) = first_panic {
        return Err(RunError::WorkerPanic(message));
    }

    let measurement_start = min_normal.unwrap_or(start_us);
    let runtime_us = time::now_us() - measurement_start;
    let samples = shared
        .samples
        .lock()
        .expect("rate sample mutex poisoned")
        .clone();

    let mut script = script::for_config(&cfg);
    script.summary(runtime_us, complete, bytes);
    script.errors(&errors);
    if script.has_done() {
        script.done(&hist, &samples);
    }

    Ok(Summary {
        complete,
        bytes,
        errors,
        hist,
        u_hist,
        samples,
        runtime_us,
    })
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
