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

//! Run configuration: CLI surface, SI units, URL decomposition

use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Default socket timeout when `-T` is not given, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Errors produced while turning arguments into a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The URL could not be decomposed into scheme/host/port/path.
    #[error("invalid URL: {0}")]
    Url(String),
    /// The URL scheme is neither `http` nor `https`.
    #[error("unsupported scheme: {0}")]
    Scheme(String),
    /// The rate must be greater than zero.
    #[error("throughput must be greater than 0")]
    ZeroRate,
    /// `-R` was not given.
    #[error("throughput must be specified with -R or --rate")]
    MissingRate,
    /// No target URL was given.
    #[error("a target URL is required")]
    MissingUrl,
    /// Fewer connections than threads cannot be distributed.
    #[error("number of connections must be >= threads")]
    TooFewConnections,
    /// A `-i` bind address did not parse.
    #[error("invalid local address: {0}")]
    BindAddr(String),
    /// Script files are accepted by the CLI but no engine is embedded.
    #[error("scripting is not available in this build: {0}")]
    Script(PathBuf),
}

/// URL scheme of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP.
    Http,
    /// TLS.
    Https,
}

impl Scheme {
    /// The port implied by the scheme when the URL names none.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Immutable run configuration, shared across workers after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Original URL, echoed in the report banner.
    pub url: String,
    /// Target scheme.
    pub scheme: Scheme,
    /// Host component, used for the Host header and TLS SNI.
    pub host: String,
    /// Resolved-against port.
    pub port: u16,
    /// Path plus query, `/` when the URL names none.
    pub path: String,
    /// Total connections across all threads.
    pub connections: usize,
    /// Worker thread count.
    pub threads: usize,
    /// Test duration in seconds.
    pub duration_s: u64,
    /// Socket timeout in milliseconds.
    pub timeout_ms: u64,
    /// Total request rate across all threads, requests/second.
    pub rate: u64,
    /// Extra request headers, verbatim `Name: value` strings.
    pub headers: Vec<String>,
    /// Record every pipelined response, not just the last of each batch.
    pub record_all: bool,
    /// Print corrected-latency percentiles.
    pub latency: bool,
    /// Additionally print uncorrected-latency percentiles.
    pub u_latency: bool,
    /// Open all connections before measuring.
    pub warmup: bool,
    /// Override for the warmup timeout; `None` derives it from `connections`.
    pub warmup_timeout_ms: Option<u64>,
    /// Local addresses to bind connections to, round-robin across workers.
    pub bind_addrs: Vec<SocketAddr>,
}

impl Config {
    /// Validates parsed CLI arguments into a run configuration.
    pub fn from_args(args: Args) -> Result<Config, ConfigError> {
        let rate = args.rate.ok_or(ConfigError::MissingRate)?;
        if rate == 0 {
            return Err(ConfigError::ZeroRate);
        }
        let url = args.url.ok_or(ConfigError::MissingUrl)?;
        if (args.connections as usize) < (args.threads as usize) || args.threads == 0 {
            return Err(ConfigError::TooFewConnections);
        }
        if let Some(path) = args.script {
            return Err(ConfigError::Script(path));
        }

        let (scheme, host, port, path) = parse_url(&url)?;
        let bind_addrs = args
            .local_ip
            .iter()
            .map(|s| parse_bind_addr(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            url,
            scheme,
            host,
            port,
            path,
            connections: args.connections as usize,
            threads: args.threads as usize,
            duration_s: args.duration,
            timeout_ms: args.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            rate,
            headers: args.headers,
            record_all: !args.batch_latency,
            latency: args.latency,
            u_latency: args.u_latency,
            warmup: args.warmup,
            warmup_timeout_ms: None,
            bind_addrs,
        })
    }

    /// Per-worker connection count. The remainder `connections % threads` is
    /// not distributed.
    pub fn connections_per_thread(&self) -> usize {
        self.connections / self.threads
    }

    /// Per-worker request rate.
    pub fn rate_per_thread(&self) -> u64 {
        self.rate / self.threads as u64
    }
}

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "pelt", about = "pelt - constant throughput HTTP benchmark")]
pub struct Args {
    /// Connections to keep open, total across threads
    #[arg(short, long, default_value = "10", value_parser = parse_count)]
    pub connections: u64,

    /// Number of worker threads to use
    #[arg(short, long, default_value = "2", value_parser = parse_count)]
    pub threads: u64,

    /// Duration of test, e.g. 30s, 5m, 1h
    #[arg(short, long, default_value = "10s", value_parser = parse_time_s)]
    pub duration: u64,

    /// Work rate in total requests/sec, e.g. 1000, 10k (required for a run)
    #[arg(short = 'R', long, value_parser = parse_count)]
    pub rate: Option<u64>,

    /// Load a script file (no engine is embedded in this build)
    #[arg(short, long)]
    pub script: Option<PathBuf>,

    /// Add a header to each request
    #[arg(short = 'H', long = "header", action = ArgAction::Append)]
    pub headers: Vec<String>,

    /// Socket/request timeout, e.g. 2s, 500ms
    #[arg(short = 'T', long, value_parser = parse_time_ms)]
    pub timeout: Option<u64>,

    /// Print corrected latency percentiles
    #[arg(short = 'L', long)]
    pub latency: bool,

    /// Additionally print uncorrected latency percentiles
    #[arg(short = 'U', long = "u_latency")]
    pub u_latency: bool,

    /// Record only the last response of each pipelined batch
    #[arg(short = 'B', long = "batch_latency")]
    pub batch_latency: bool,

    /// Open all connections before the measured phase begins
    #[arg(short = 'W', long)]
    pub warmup: bool,

    /// Comma-separated local addresses to bind from
    #[arg(short = 'i', long = "local_ip", value_delimiter = ',')]
    pub local_ip: Vec<String>,

    /// Print version details
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Target URL
    #[arg(value_name = "url")]
    pub url: Option<String>,
}

/// Parses a count with an optional SI suffix: `10`, `250k`, `3M`, `1G`.
pub fn parse_count(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, scale) = match s.as_bytes().last() {
        Some(&b'k') | Some(&b'K') => (&s[..s.len() - 1], 1_000),
        Some(&b'M') => (&s[..s.len() - 1], 1_000_000),
        Some(&b'g') | Some(&b'G') => (&s[..s.len() - 1], 1_000_000_000),
        _ => (s, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * scale)
        .map_err(|_| format!("expected a count, got {:?}", s))
}

/// Parses a duration in seconds with an optional unit: `30`, `30s`, `5m`, `1h`.
pub fn parse_time_s(s: &str) -> Result<u64, String> {
    parse_time_ms(s).map(|ms| ms / 1000)
}

/// Parses a duration in milliseconds: `500ms`, `2s`, `5m`, `1h`, bare seconds.
pub fn parse_time_ms(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, scale) = if let Some(d) = s.strip_suffix("ms") {
        (d, 1)
    } else if let Some(d) = s.strip_suffix('s') {
        (d, 1_000)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, 60_000)
    } else if let Some(d) = s.strip_suffix('h') {
        (d, 3_600_000)
    } else {
        (s, 1_000)
    };
    digits
        .parse::<u64>()
        .map(|n| n * scale)
        .map_err(|_| format!("expected a time value, got {:?}", s))
}

/// Decomposes `scheme://host[:port][/path[?query]]` without external help.
///
/// Only enough of RFC 3986 to cover benchmark targets: no userinfo, no
/// fragments. IPv6 hosts use the usual bracket form.
pub fn parse_url(url: &str) -> Result<(Scheme, String, u16, String), ConfigError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| ConfigError::Url(url.into()))?;
    let scheme = match scheme {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => return Err(ConfigError::Scheme(other.into())),
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(ConfigError::Url(url.into()));
    }

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| ConfigError::Url(url.into()))?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| ConfigError::Url(url.into()))?,
            None if after.is_empty() => scheme.default_port(),
            None => return Err(ConfigError::Url(url.into())),
        };
        (host.to_owned(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, p)) => (
                host.to_owned(),
                p.parse().map_err(|_| ConfigError::Url(url.into()))?,
            ),
            None => (authority.to_owned(), scheme.default_port()),
        }
    };

    Ok((scheme, host, port, path.to_owned()))
}

/// Parses a `-i` bind address. IPv6 link-local addresses may carry a
/// `%scope` suffix; a numeric scope is kept, anything else is dropped (the
/// kernel resolves interface names only through `getaddrinfo`).
pub fn parse_bind_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    let s = s.trim();
    let (addr, scope) = match s.split_once('%') {
        Some((a, scope)) => (a, scope.parse::<u32>().unwrap_or(0)),
        None => (s, 0),
    };
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| ConfigError::BindAddr(s.to_owned()))?;
    Ok(match ip {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V4(v4), 0),
        IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(v6, 0, 0, scope)),
    })
}

#[cfg(test)]
mod test {
    use super::{parse_bind_addr, parse_count, parse_time_ms, parse_time_s, parse_url, Scheme};

    #[test]
    fn count_accepts_si_suffixes() {
        assert_eq!(Ok(10), parse_count("10"));
        assert_eq!(Ok(250_000), parse_count("250k"));
        assert_eq!(Ok(3_000_000), parse_count("3M"));
        assert_eq!(Ok(1_000_000_000), parse_count("1G"));
    }

    #[test]
    fn count_rejects_garbage() {
        assert!(parse_count("k").is_err());
        assert!(parse_count("ten").is_err());
        assert!(parse_count("10q").is_err());
    }

    #[test]
    fn time_accepts_unit_suffixes() {
        assert_eq!(Ok(30), parse_time_s("30"));
        assert_eq!(Ok(30), parse_time_s("30s"));
        assert_eq!(Ok(300), parse_time_s("5m"));
        assert_eq!(Ok(3600), parse_time_s("1h"));
        assert_eq!(Ok(500), parse_time_ms("500ms"));
        assert_eq!(Ok(2000), parse_time_ms("2s"));
    }

    #[test]
    fn url_decomposes_with_defaults() {
        let (scheme, host, port, path) = parse_url("http://example.org").unwrap();
        assert_eq!(Scheme::Http, scheme);
        assert_eq!("example.org", host);
        assert_eq!(80, port);
        assert_eq!("/", path);
    }

    #[test]
    fn url_keeps_explicit_port_and_query() {
        let (scheme, host, port, path) = parse_url("https://10.0.0.1:8443/a/b?x=1").unwrap();
        assert_eq!(Scheme::Https, scheme);
        assert_eq!("10.0.0.1", host);
        assert_eq!(8443, port);
        assert_eq!("/a/b?x=1", path);
    }

    #[test]
    fn url_handles_bracketed_ipv6() {
        let (_, host, port, path) = parse_url("http://[::1]:8080/x").unwrap();
        assert_eq!("::1", host);
        assert_eq!(8080, port);
        assert_eq!("/x", path);
    }

    #[test]
    fn url_rejects_unknown_scheme_and_missing_host() {
        assert!(parse_url("ftp://example.org").is_err());
        assert!(parse_url("example.org").is_err());
        assert!(parse_url("http://").is_err());
    }

    #[test]
    fn bind_addr_parses_v4_v6_and_scope() {
        assert_eq!("10.0.0.2:0", parse_bind_addr("10.0.0.2").unwrap().to_string());
        let v6 = parse_bind_addr("fe80::1%3").unwrap();
        match v6 {
            std::net::SocketAddr::V6(a) => assert_eq!(3, a.scope_id()),
            _ => panic!("expected a v6 address"),
        }
        assert!(parse_bind_addr("nonsense").is_err());
    }
}
