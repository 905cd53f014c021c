// Copyright 2025 Chris Custine
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

//! Protocol layer for the probe datagrams.
//!
//! Requests and replies share a 20-byte header (magic, protocol version,
//! correlation token, send timestamp). Replies append the server's population
//! and version. All integers are big-endian.
//!
//! ```text
//! request: "SP" | version u16 | token u64 | timestamp_us u64
//! reply:   <request header> | users u32 | max_users u32 | bandwidth u32 | server_version u32
//! ```

mod ping;

pub use ping::PingCodec;

use std::fmt;

use thiserror::Error;

/// Magic bytes that open every probe datagram.
pub const MAGIC: [u8; 2] = *b"SP";

/// Protocol version carried next to the magic.
pub const PROTOCOL_VERSION: u16 = 1;

/// Length of a probe request in bytes.
pub const REQUEST_LEN: usize = 20;

/// Length of a probe reply in bytes.
pub const REPLY_LEN: usize = 36;

/// Errors that can occur while decoding a probe datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
}

/// A probe sent to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingRequest {
    /// Opaque random value echoed by the server.
    pub token: u64,
    /// Client monotonic clock at send time, in microseconds.
    pub timestamp_us: u64,
}

/// A server's answer to a [`PingRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    /// Token copied from the request.
    pub token: u64,
    /// Timestamp copied from the request.
    pub timestamp_us: u64,
    /// Users currently connected.
    pub users: u32,
    /// Configured user limit.
    pub max_users: u32,
    /// Per-user bandwidth limit in bits per second.
    pub bandwidth: u32,
    /// Version of the server software.
    pub server_version: ServerVersion,
}

impl PingReply {
    /// Build the reply a server gives to `request`.
    #[must_use]
    pub fn answering(request: PingRequest, users: u32, max_users: u32, bandwidth: u32) -> Self {
        Self {
            token: request.token,
            timestamp_us: request.timestamp_us,
            users,
            max_users,
            bandwidth,
            server_version: ServerVersion::default(),
        }
    }
}

/// Server software version packed as `major << 16 | minor << 8 | patch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion(u32);

impl ServerVersion {
    /// Build a version from its components.
    #[must_use]
    pub fn new(major: u16, minor: u8, patch: u8) -> Self {
        Self(u32::from(major) << 16 | u32::from(minor) << 8 | u32::from(patch))
    }

    /// Wrap the packed wire representation.
    #[must_use]
    pub fn from_wire(raw: u32) -> Self {
        Self(raw)
    }

    /// Packed wire representation.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        self.0
    }

    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "each component occupies its own bit field of the packed version"
    )]
    pub fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "each component occupies its own bit field of the packed version"
    )]
    pub fn minor(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "each component occupies its own bit field of the packed version"
    )]
    pub fn patch(self) -> u8 {
        self.0 as u8
    }

    /// Whether the server reported a version at all.
    #[must_use]
    pub fn is_known(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
        } else {
            f.write_str("unknown")
        }
    }
}

/// Trait for datagram parsers.
pub trait Protocol {
    /// The message type produced by this parser.
    type Message;
    /// The error type for parsing failures.
    type Error;

    /// Parse input bytes into a message.
    ///
    /// Returns `Ok(Some(message))` if parsing succeeded,
    /// `Ok(None)` if the input is valid but doesn't produce a message,
    /// or `Err(error)` if parsing failed.
    fn parse(&mut self, input: &[u8]) -> Result<Option<Self::Message>, Self::Error>;
}
