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

//! HTTP/1.1 response parser
//!
//! Byte-at-a-time incremental: `execute` may be fed any split of the input
//! and consumes up to the end of the current message. Bytes belonging to a
//! pipelined successor are left unconsumed; the caller resets the parser and
//! feeds the remainder.

use core::mem;

use super::{ParseError, ParseResult, ResponseSink};

/// Longest accepted status or header line.
const MAX_LINE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    HeaderLine,
    FixedBody,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    ChunkTrailer,
    EofBody,
    Complete,
}

/// Incremental HTTP/1.1 response parser
#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    /// Partial line carried across reads.
    line: Vec<u8>,
    status: u16,
    minor: u8,
    explicit_keep_alive: Option<bool>,
    content_length: Option<u64>,
    chunked: bool,
    remaining: u64,
}

impl ResponseParser {
    /// Creates a parser ready for a status line.
    pub fn new() -> Self {
        ResponseParser {
            state: State::StatusLine,
            line: Vec::new(),
            status: 0,
            minor: 0,
            explicit_keep_alive: None,
            content_length: None,
            chunked: false,
            remaining: 0,
        }
    }

    /// Re-initializes for the next response on the same connection.
    pub fn reset(&mut self) {
        self.state = State::StatusLine;
        self.line.clear();
        self.status = 0;
        self.minor = 0;
        self.explicit_keep_alive = None;
        self.content_length = None;
        self.chunked = false;
        self.remaining = 0;
    }

    /// Whether the current message has been fully parsed.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Status code of the current message, 0 before the status line.
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the response permits connection reuse.
    ///
    /// An explicit `Connection` header wins; otherwise HTTP/1.1 defaults to
    /// keep-alive and HTTP/1.0 to close.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.explicit_keep_alive.unwrap_or(self.minor >= 1)
    }

    /// Feeds `buf`, invoking `sink` callbacks, and returns the number of
    /// bytes consumed. Consumption stops at message completion.
    pub fn execute<S: ResponseSink>(&mut self, buf: &[u8], sink: &mut S) -> ParseResult<usize> {
        let mut i = 0;

        loop {
            match self.state {
                State::Complete => return Ok(i),
                State::EofBody => {
                    if i < buf.len() {
                        sink.on_body(&buf[i..]);
                    }
                    return Ok(buf.len());
                }
                State::FixedBody | State::ChunkData => {
                    if i == buf.len() {
                        return Ok(i);
                    }
                    let take = (buf.len() - i).min(self.remaining as usize);
                    sink.on_body(&buf[i..i + take]);
                    i += take;
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        if self.state == State::FixedBody {
                            self.complete(sink);
                            return Ok(i);
                        }
                        self.state = State::ChunkDataEnd;
                    }
                }
                _ => {
                    if i == buf.len() {
                        return Ok(i);
                    }
                    match buf[i..].iter().position(|&b| b == b'\n') {
                        None => {
                            if self.line.len() + buf.len() - i > MAX_LINE {
                                return Err(ParseError::TooLong);
                            }
                            self.line.extend_from_slice(&buf[i..]);
                            return Ok(buf.len());
                        }
                        Some(rel) => {
                            let j = i + rel;
                            let mut owned = mem::take(&mut self.line);
                            owned.extend_from_slice(&buf[i..j]);
                            if owned.len() > MAX_LINE {
                                return Err(ParseError::TooLong);
                            }
                            let end = match owned.last() {
                                Some(&b'\r') => owned.len() - 1,
                                _ => owned.len(),
                            };
                            self.process_line_slice(&owned[..end], sink)?;
                            owned.clear();
                            self.line = owned;
                            i = j + 1;
                            if self.state == State::Complete {
                                return Ok(i);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Signals end of stream. Completes a message whose body runs to EOF;
    /// returns whether a message was completed.
    pub fn on_eof<S: ResponseSink>(&mut self, sink: &mut S) -> bool {
        if self.state == State::EofBody {
            self.complete(sink);
            true
        } else {
            false
        }
    }

    fn complete<S: ResponseSink>(&mut self, sink: &mut S) {
        self.state = State::Complete;
        sink.on_message_complete(self.status, self.keep_alive());
    }

    fn process_line_slice<S: ResponseSink>(
        &mut self,
        line: &[u8],
        sink: &mut S,
    ) -> ParseResult<()> {
        match self.state {
            State::StatusLine => self.process_status_line(line),
            State::HeaderLine => self.process_header_line(line, sink),
            State::ChunkSize => self.process_chunk_size(line),
            State::ChunkDataEnd => {
                if !line.is_empty() {
                    return Err(ParseError::NewLine);
                }
                self.state = State::ChunkSize;
                Ok(())
            }
            State::ChunkTrailer => {
                if line.is_empty() {
                    self.complete(sink);
                }
                Ok(())
            }
            // Body and terminal states never reach line processing.
            _ => Err(ParseError::NewLine),
        }
    }

    fn process_status_line(&mut self, line: &[u8]) -> ParseResult<()> {
        // Tolerate stray CRLF between messages.
        if line.is_empty() {
            return Ok(());
        }
        if line.len() < 12 || &line[..7] != b"HTTP/1." || !line[7].is_ascii_digit() {
            return Err(ParseError::Version);
        }
        self.minor = line[7] - b'0';
        if line[8] != b' ' {
            return Err(ParseError::StatusCode);
        }
        let code = &line[9..12];
        if !code.iter().all(u8::is_ascii_digit) {
            return Err(ParseError::StatusCode);
        }
        if line.len() > 12 && line[12] != b' ' {
            return Err(ParseError::StatusCode);
        }
        self.status =
            (code[0] - b'0') as u16 * 100 + (code[1] - b'0') as u16 * 10 + (code[2] - b'0') as u16;
        self.state = State::HeaderLine;
        Ok(())
    }

    fn process_header_line<S: ResponseSink>(
        &mut self,
        line: &[u8],
        sink: &mut S,
    ) -> ParseResult<()> {
        if line.is_empty() {
            return self.headers_complete(sink);
        }

        // Obsolete line folding continues the previous value.
        if line[0] == b' ' || line[0] == b'\t' {
            sink.on_header_value(trim_ows(line));
            return Ok(());
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::HeaderName)?;
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|&b| b <= b' ' || b == 0x7f) {
            return Err(ParseError::HeaderName);
        }
        let value = trim_ows(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"content-length") {
            let mut length: u64 = 0;
            if value.is_empty() {
                return Err(ParseError::HeaderValue);
            }
            for &b in value {
                if !b.is_ascii_digit() {
                    return Err(ParseError::HeaderValue);
                }
                length = length
                    .checked_mul(10)
                    .and_then(|l| l.checked_add((b - b'0') as u64))
                    .ok_or(ParseError::HeaderValue)?;
            }
            self.content_length = Some(length);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            if contains_token(value, b"chunked") {
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case(b"connection") {
            if contains_token(value, b"close") {
                self.explicit_keep_alive = Some(false);
            } else if contains_token(value, b"keep-alive") {
                self.explicit_keep_alive = Some(true);
            }
        }

        sink.on_header_field(name);
        sink.on_header_value(value);
        Ok(())
    }

    fn headers_complete<S: ResponseSink>(&mut self, sink: &mut S) -> ParseResult<()> {
        // 1xx, 204 and 304 never carry a body.
        if self.status < 200 || self.status == 204 || self.status == 304 {
            self.complete(sink);
        } else if self.chunked {
            self.state = State::ChunkSize;
        } else {
            match self.content_length {
                Some(0) => self.complete(sink),
                Some(n) => {
                    self.remaining = n;
                    self.state = State::FixedBody;
                }
                None => {
                    // Only the close can delimit the body, so the
                    // connection cannot be reused regardless of headers.
                    self.explicit_keep_alive = Some(false);
                    self.state = State::EofBody;
                }
            }
        }
        Ok(())
    }

    fn process_chunk_size(&mut self, line: &[u8]) -> ParseResult<()> {
        let digits = match line.iter().position(|&b| b == b';') {
            Some(i) => &line[..i],
            None => line,
        };
        if digits.is_empty() {
            return Err(ParseError::ChunkSize);
        }
        let mut size: u64 = 0;
        for &b in digits {
            let d = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b - b'a' + 10,
                b'A'..=b'F' => b - b'A' + 10,
                _ => return Err(ParseError::ChunkSize),
            };
            size = size
                .checked_mul(16)
                .and_then(|s| s.checked_add(d as u64))
                .ok_or(ParseError::ChunkSize)?;
        }
        if size == 0 {
            self.state = State::ChunkTrailer;
        } else {
            self.remaining = size;
            self.state = State::ChunkData;
        }
        Ok(())
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// Case-insensitive search for `token` within a comma-separated list.
fn contains_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| trim_ows(part).eq_ignore_ascii_case(token))
}
