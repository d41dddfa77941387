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

//! Incremental HTTP/1.1 response parsing

use core::fmt::Display;

pub mod response;

pub use response::ResponseParser;

/// Represents possible failures while parsing a response
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid HTTP version in the status line.
    Version,
    /// Invalid status code.
    StatusCode,
    /// Invalid byte in header name.
    HeaderName,
    /// Invalid byte in header value.
    HeaderValue,
    /// Invalid chunk size line.
    ChunkSize,
    /// Invalid or missing new line.
    NewLine,
    /// A header line exceeded the supported size.
    TooLong,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Version => "Invalid version",
            ParseError::StatusCode => "Invalid status code",
            ParseError::HeaderName => "Invalid token in header name",
            ParseError::HeaderValue => "Invalid token in header value",
            ParseError::ChunkSize => "Invalid chunk size",
            ParseError::NewLine => "Invalid or missing new line",
            ParseError::TooLong => "Header line too long",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Result whose Err variant is `ParseError`
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Callbacks invoked by [`ResponseParser`] as a response streams in.
///
/// Header callbacks see one complete name or value at a time; body callbacks
/// see whatever span of the body arrived in the current read. The final
/// callback carries the status code and whether the response permits
/// keep-alive.
pub trait ResponseSink {
    /// A complete header name.
    fn on_header_field(&mut self, name: &[u8]);
    /// A complete header value (or continuation of the previous one).
    fn on_header_value(&mut self, value: &[u8]);
    /// A span of body bytes.
    fn on_body(&mut self, chunk: &[u8]);
    /// The response is complete.
    fn on_message_complete(&mut self, status: u16, keep_alive: bool);
}
