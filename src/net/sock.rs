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

//! Client socket over plain TCP or rustls

use std::io::{self, ErrorKind, Read, Write};

use log::warn;
use mio::net::TcpStream;
use rustls::ClientConnection;
use socket2::{Domain, Protocol, Socket, Type};

use super::{Status, Target};

/// A non-blocking client socket in one of two flavors.
///
/// All operations return [`Status`]; callers never see `WouldBlock`
/// directly.
#[derive(Debug)]
pub enum Sock {
    /// Plain TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls {
        /// The underlying transport.
        stream: TcpStream,
        /// rustls session state.
        tls: Box<ClientConnection>,
        /// Decrypted bytes buffered inside the session, not yet read out.
        plaintext_avail: usize,
    },
}

#[inline]
fn would_block(e: &io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
}

#[inline]
fn interrupted(e: &io::Error) -> bool {
    e.kind() == ErrorKind::Interrupted
}

impl Sock {
    /// Starts a non-blocking connect towards `target`.
    ///
    /// The returned socket is mid-connect; register it writable and call
    /// [`Sock::connect`] on readiness until it reports `Ok`. A failed bind
    /// to a requested local address is non-fatal and only warned about.
    pub fn open(target: &Target) -> io::Result<Sock> {
        let socket = Socket::new(
            Domain::for_address(target.addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;

        if let Some(local) = target.bind {
            if let Err(err) = socket.bind(&local.into()) {
                warn!("could not bind local address {}: {}", local, err);
            }
        }

        match socket.connect(&target.addr.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(ref e) if would_block(e) => {}
            Err(e) => return Err(e),
        }

        let stream = TcpStream::from_std(socket.into());

        match &target.tls {
            None => Ok(Sock::Plain(stream)),
            Some(tls) => {
                let session = ClientConnection::new(tls.config.clone(), tls.name.clone())
                    .map_err(|e| io::Error::new(ErrorKind::Other, e))?;
                Ok(Sock::Tls {
                    stream,
                    tls: Box::new(session),
                    plaintext_avail: 0,
                })
            }
        }
    }

    /// Drives the connect (and TLS handshake) forward.
    pub fn connect(&mut self) -> Status<()> {
        match self {
            Sock::Plain(stream) => match tcp_established(stream) {
                Status::Ok(()) => {
                    stream.set_nodelay(true).ok();
                    Status::Ok(())
                }
                other => other,
            },
            Sock::Tls { stream, tls, .. } => {
                match tcp_established(stream) {
                    Status::Ok(()) => {}
                    other => return other,
                }
                stream.set_nodelay(true).ok();

                loop {
                    if tls.wants_write() {
                        match tls.write_tls(stream) {
                            Ok(_) => continue,
                            Err(ref e) if would_block(e) => {
                                return Status::Retry {
                                    want_read: false,
                                    want_write: true,
                                }
                            }
                            Err(ref e) if interrupted(e) => continue,
                            Err(_) => return Status::Error,
                        }
                    }
                    if !tls.is_handshaking() {
                        return Status::Ok(());
                    }
                    match tls.read_tls(stream) {
                        Ok(0) => return Status::Error,
                        Ok(_) => {
                            if tls.process_new_packets().is_err() {
                                return Status::Error;
                            }
                        }
                        Err(ref e) if would_block(e) => {
                            return Status::Retry {
                                want_read: true,
                                want_write: tls.wants_write(),
                            }
                        }
                        Err(ref e) if interrupted(e) => continue,
                        Err(_) => return Status::Error,
                    }
                }
            }
        }
    }

    /// Reads plaintext into `buf`. `Ok(0)` is end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Status<usize> {
        match self {
            Sock::Plain(stream) => loop {
                match stream.read(buf) {
                    Ok(n) => return Status::Ok(n),
                    Err(ref e) if would_block(e) => {
                        return Status::Retry {
                            want_read: true,
                            want_write: false,
                        }
                    }
                    Err(ref e) if interrupted(e) => continue,
                    Err(_) => return Status::Error,
                }
            },
            Sock::Tls {
                stream,
                tls,
                plaintext_avail,
            } => loop {
                if *plaintext_avail > 0 {
                    match tls.reader().read(buf) {
                        Ok(n) => {
                            *plaintext_avail = plaintext_avail.saturating_sub(n);
                            return Status::Ok(n);
                        }
                        Err(ref e) if would_block(e) => *plaintext_avail = 0,
                        Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => {
                            return Status::Ok(0)
                        }
                        Err(_) => return Status::Error,
                    }
                }
                match tls.read_tls(stream) {
                    Ok(0) => return Status::Ok(0),
                    Ok(_) => match tls.process_new_packets() {
                        Ok(state) => {
                            *plaintext_avail = state.plaintext_bytes_to_read();
                            if *plaintext_avail == 0 && state.peer_has_closed() {
                                return Status::Ok(0);
                            }
                        }
                        Err(_) => return Status::Error,
                    },
                    Err(ref e) if would_block(e) => {
                        return Status::Retry {
                            want_read: true,
                            want_write: tls.wants_write(),
                        }
                    }
                    Err(ref e) if interrupted(e) => continue,
                    Err(_) => return Status::Error,
                }
            },
        }
    }

    /// Writes as much of `buf` as the transport accepts.
    pub fn write(&mut self, buf: &[u8]) -> Status<usize> {
        match self {
            Sock::Plain(stream) => loop {
                match stream.write(buf) {
                    Ok(n) => return Status::Ok(n),
                    Err(ref e) if would_block(e) => {
                        return Status::Retry {
                            want_read: false,
                            want_write: true,
                        }
                    }
                    Err(ref e) if interrupted(e) => continue,
                    Err(_) => return Status::Error,
                }
            },
            Sock::Tls { stream, tls, .. } => {
                let buffered = match tls.writer().write(buf) {
                    Ok(n) => n,
                    Err(_) => return Status::Error,
                };
                loop {
                    if !tls.wants_write() {
                        break;
                    }
                    match tls.write_tls(stream) {
                        Ok(_) => continue,
                        Err(ref e) if would_block(e) => break,
                        Err(ref e) if interrupted(e) => continue,
                        Err(_) => return Status::Error,
                    }
                }
                if buffered == 0 {
                    // Session buffer full; drain before accepting more.
                    Status::Retry {
                        want_read: false,
                        want_write: true,
                    }
                } else {
                    Status::Ok(buffered)
                }
            }
        }
    }

    /// Whether decrypted bytes are already buffered and readable without a
    /// readiness event. Always false for plain TCP.
    pub fn readable(&self) -> bool {
        match self {
            Sock::Plain(_) => false,
            Sock::Tls { plaintext_avail, .. } => *plaintext_avail > 0,
        }
    }

    /// Closes the socket, releasing the TLS session first.
    pub fn close(mut self) {
        if let Sock::Tls { stream, tls, .. } = &mut self {
            tls.send_close_notify();
            let _ = tls.write_tls(stream);
        }
        // Dropping the stream closes the fd.
    }

    /// The transport to (de)register with the reactor.
    pub fn stream(&mut self) -> &mut TcpStream {
        match self {
            Sock::Plain(stream) => stream,
            Sock::Tls { stream, .. } => stream,
        }
    }
}

/// Whether a non-blocking connect has completed on `stream`.
fn tcp_established(stream: &TcpStream) -> Status<()> {
    match stream.take_error() {
        Ok(None) => {}
        Ok(Some(_)) | Err(_) => return Status::Error,
    }
    match stream.peer_addr() {
        Ok(_) => Status::Ok(()),
        Err(ref e) if e.kind() == ErrorKind::NotConnected => Status::Retry {
            want_read: false,
            want_write: true,
        },
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Status::Retry {
            want_read: false,
            want_write: true,
        },
        Err(_) => Status::Error,
    }
}
