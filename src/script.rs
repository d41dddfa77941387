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

//! Request customization hooks
//!
//! The seam an embedded scripting engine would implement. No engine ships in
//! this build; [`StaticScript`] serves the compiled-in HTTP/1.1 template and
//! leaves every optional hook at its default. Each worker owns one script
//! context; none of the methods are called across threads.

use core::fmt;
use std::sync::Arc;

use hdrhistogram::Histogram;
use rand::rngs::SmallRng;

use crate::config::Config;
use crate::stats::ErrorCounters;

/// Per-worker request/response hook surface.
pub trait Script: fmt::Debug + Send {
    /// Resolves `host`/`service` itself. Returning false defers to system
    /// DNS.
    fn resolve(&mut self, _host: &str, _service: &str) -> bool {
        false
    }

    /// Called once on the owning worker thread before any request.
    fn init(&mut self, _rng: &mut SmallRng, _args: &[String]) {}

    /// Produces the bytes of the next batch. Static scripts return the same
    /// buffer every call.
    fn request(&mut self) -> Arc<[u8]>;

    /// Pipeline depth: how many responses each batch of request bytes will
    /// produce.
    fn verify_request(&mut self) -> usize;

    /// Whether [`Script::request`] always returns the same bytes. A static
    /// request is fetched once and shared by every connection.
    fn is_static(&self) -> bool {
        true
    }

    /// Whether the response hook wants status, headers and body.
    fn want_response(&self) -> bool {
        false
    }

    /// Observes a completed response when [`Script::want_response`] is true.
    fn response(&mut self, _status: u16, _headers: &[u8], _body: &[u8]) {}

    /// Whether a custom end-of-run hook should replace the built-in report.
    fn has_done(&self) -> bool {
        false
    }

    /// Run totals, before the report is printed.
    fn summary(&mut self, _runtime_us: u64, _complete: u64, _bytes: u64) {}

    /// Final error counters.
    fn errors(&mut self, _errors: &ErrorCounters) {}

    /// Final latency and requests-per-second distributions, when
    /// [`Script::has_done`] is true.
    fn done(&mut self, _latency: &Histogram<u64>, _requests: &Histogram<u64>) {}
}

/// The compiled-in single-request GET template.
#[derive(Debug)]
pub struct StaticScript {
    request: Arc<[u8]>,
}

impl StaticScript {
    /// Renders the template for `config`.
    pub fn new(config: &Config) -> Self {
        let mut request = format!("GET {} HTTP/1.1\r\n", config.path);

        let supplies_host = config
            .headers
            .iter()
            .any(|h| h.len() >= 5 && h.as_bytes()[..5].eq_ignore_ascii_case(b"host:"));
        if !supplies_host {
            if config.port == config.scheme.default_port() {
                request.push_str(&format!("Host: {}\r\n", config.host));
            } else {
                request.push_str(&format!("Host: {}:{}\r\n", config.host, config.port));
            }
        }
        for header in &config.headers {
            request.push_str(header);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");

        StaticScript {
            request: request.into_bytes().into(),
        }
    }
}

impl Script for StaticScript {
    fn request(&mut self) -> Arc<[u8]> {
        self.request.clone()
    }

    fn verify_request(&mut self) -> usize {
        1
    }
}

/// Builds the script context for a worker.
pub fn for_config(config: &Config) -> Box<dyn Script> {
    Box::new(StaticScript::new(config))
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use crate::config::{Config, Scheme};

    use super::{Script, StaticScript};

    fn config(scheme: Scheme, port: u16, headers: Vec<String>) -> Config {
        Config {
            url: String::new(),
            scheme,
            host: "example.org".into(),
            port,
            path: "/status".into(),
            connections: 10,
            threads: 2,
            duration_s: 10,
            timeout_ms: 2000,
            rate: 1000,
            headers,
            record_all: true,
            latency: false,
            u_latency: false,
            warmup: false,
            warmup_timeout_ms: None,
            bind_addrs: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                0,
            )],
        }
    }

    #[test]
    fn template_is_a_complete_get_request() {
        let mut script = StaticScript::new(&config(Scheme::Http, 80, Vec::new()));
        let request = script.request();
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.starts_with("GET /status HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.org\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(1, script.verify_request());
        assert!(script.is_static());
    }

    #[test]
    fn non_default_port_appears_in_host_header() {
        let mut script = StaticScript::new(&config(Scheme::Http, 8080, Vec::new()));
        let request = script.request();
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains("Host: example.org:8080\r\n"));
    }

    #[test]
    fn extra_headers_are_appended_and_may_replace_host() {
        let headers = vec!["Host: other".to_owned(), "X-Trace: 1".to_owned()];
        let mut script = StaticScript::new(&config(Scheme::Https, 443, headers));
        let request = script.request();
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains("Host: other\r\n"));
        assert!(text.contains("X-Trace: 1\r\n"));
        assert!(!text.contains("Host: example.org"));
    }
}
