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

//! Non-blocking socket abstraction over plain TCP and TLS

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;

pub mod sock;
pub mod tls;

pub use sock::Sock;

/// Uniform status for the five socket operations.
///
/// `Retry` carries the registrations the caller must wait on before trying
/// again. For TLS these may differ from the semantic direction of the call:
/// a write can demand read readiness mid-handshake. The reactor must install
/// exactly the demanded registrations; polling both directions regardless
/// spins the CPU through the whole handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status<T> {
    /// Operation complete.
    Ok(T),
    /// Unrecoverable; the caller must reconnect.
    Error,
    /// Incomplete; retry once the demanded readiness arrives.
    Retry {
        /// Wait for read readiness.
        want_read: bool,
        /// Wait for write readiness.
        want_write: bool,
    },
}

/// Where and how a connection reaches the target.
#[derive(Debug, Clone)]
pub struct Target {
    /// Resolved target address.
    pub addr: SocketAddr,
    /// Optional local address to bind before connecting.
    pub bind: Option<SocketAddr>,
    /// TLS parameters; `None` for plain TCP.
    pub tls: Option<TlsTarget>,
}

/// TLS parameters shared by every connection of a worker.
#[derive(Debug, Clone)]
pub struct TlsTarget {
    /// Client configuration (verification disabled, ALPN `http/1.1`).
    pub config: Arc<ClientConfig>,
    /// SNI name sent to the target.
    pub name: ServerName<'static>,
}
