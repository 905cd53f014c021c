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

//! Binary codec for probe requests and replies.

use super::{
    PingReply, PingRequest, Protocol, ProtocolError, ServerVersion, MAGIC, PROTOCOL_VERSION,
    REPLY_LEN, REQUEST_LEN,
};

/// Encoder/decoder for probe datagrams.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingCodec;

impl PingCodec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encode a probe request.
    #[must_use]
    pub fn encode_request(&self, request: &PingRequest) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        write_header(&mut buf, request.token, request.timestamp_us);
        buf
    }

    /// Encode a probe reply. Used by responders and tests.
    #[must_use]
    pub fn encode_reply(&self, reply: &PingReply) -> [u8; REPLY_LEN] {
        let mut buf = [0u8; REPLY_LEN];
        write_header(&mut buf, reply.token, reply.timestamp_us);
        buf[20..24].copy_from_slice(&reply.users.to_be_bytes());
        buf[24..28].copy_from_slice(&reply.max_users.to_be_bytes());
        buf[28..32].copy_from_slice(&reply.bandwidth.to_be_bytes());
        buf[32..36].copy_from_slice(&reply.server_version.to_wire().to_be_bytes());
        buf
    }

    /// Decode a probe request. Used by responders and tests.
    pub fn decode_request(&self, input: &[u8]) -> Result<PingRequest, ProtocolError> {
        let (token, timestamp_us) = read_header(input)?;
        Ok(PingRequest {
            token,
            timestamp_us,
        })
    }
}

impl Protocol for PingCodec {
    type Message = PingReply;
    type Error = ProtocolError;

    /// Parse a reply. A well-formed request (no population fields) yields
    /// `Ok(None)`.
    fn parse(&mut self, input: &[u8]) -> Result<Option<PingReply>, ProtocolError> {
        let (token, timestamp_us) = read_header(input)?;

        if input.len() < REPLY_LEN {
            return Ok(None);
        }

        Ok(Some(PingReply {
            token,
            timestamp_us,
            users: read_u32(input, 20),
            max_users: read_u32(input, 24),
            bandwidth: read_u32(input, 28),
            server_version: ServerVersion::from_wire(read_u32(input, 32)),
        }))
    }
}

fn write_header(buf: &mut [u8], token: u64, timestamp_us: u64) {
    buf[0..2].copy_from_slice(&MAGIC);
    buf[2..4].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    buf[4..12].copy_from_slice(&token.to_be_bytes());
    buf[12..20].copy_from_slice(&timestamp_us.to_be_bytes());
}

/// Validate the version marker and return `(token, timestamp_us)`.
fn read_header(input: &[u8]) -> Result<(u64, u64), ProtocolError> {
    if input.len() < REQUEST_LEN {
        return Err(ProtocolError::Truncated(input.len()));
    }

    let magic = [input[0], input[1]];
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let version = u16::from_be_bytes([input[2], input[3]]);
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    Ok((read_u64(input, 4), read_u64(input, 12)))
}

fn read_u64(input: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&input[at..at + 8]);
    u64::from_be_bytes(bytes)
}

fn read_u32(input: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&input[at..at + 4]);
    u32::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reply() -> PingReply {
        PingReply {
            token: 0xDEAD_BEEF_0102_0304,
            timestamp_us: 1_234_567,
            users: 12,
            max_users: 100,
            bandwidth: 72_000,
            server_version: ServerVersion::new(1, 5, 0),
        }
    }

    #[test]
    fn test_request_layout() {
        let codec = PingCodec::new();
        let bytes = codec.encode_request(&PingRequest {
            token: 1,
            timestamp_us: 2,
        });

        assert_eq!(&bytes[0..2], b"SP");
        assert_eq!(&bytes[2..4], &[0, 1]);
        assert_eq!(bytes[11], 1);
        assert_eq!(bytes[19], 2);
    }

    #[test]
    fn test_parse_reply() {
        let mut codec = PingCodec::new();
        let bytes = codec.encode_reply(&sample_reply());

        let parsed = codec.parse(&bytes).unwrap();
        assert_eq!(parsed, Some(sample_reply()));
    }

    #[test]
    fn test_reply_echoes_request_header() {
        let codec = PingCodec::new();
        let request = PingRequest {
            token: 42,
            timestamp_us: 99,
        };
        let reply = codec.encode_reply(&PingReply::answering(request, 1, 2, 3));
        let encoded_request = codec.encode_request(&request);

        assert_eq!(&reply[..REQUEST_LEN], &encoded_request[..]);
    }

    #[test]
    fn test_parse_request_yields_nothing() {
        let mut codec = PingCodec::new();
        let bytes = codec.encode_request(&PingRequest {
            token: 7,
            timestamp_us: 8,
        });

        assert_eq!(codec.parse(&bytes).unwrap(), None);
        assert_eq!(
            codec.decode_request(&bytes).unwrap(),
            PingRequest {
                token: 7,
                timestamp_us: 8
            }
        );
    }

    #[test]
    fn test_parse_truncated() {
        let mut codec = PingCodec::new();
        assert_eq!(codec.parse(b"SP\0\x01"), Err(ProtocolError::Truncated(4)));
        assert_eq!(codec.parse(b""), Err(ProtocolError::Truncated(0)));
    }

    #[test]
    fn test_parse_bad_magic() {
        let mut codec = PingCodec::new();
        let mut bytes = codec.encode_reply(&sample_reply());
        bytes[0] = b'X';

        assert_eq!(codec.parse(&bytes), Err(ProtocolError::BadMagic(*b"XP")));
    }

    #[test]
    fn test_parse_unsupported_version() {
        let mut codec = PingCodec::new();
        let mut bytes = codec.encode_reply(&sample_reply());
        bytes[3] = 9;

        assert_eq!(
            codec.parse(&bytes),
            Err(ProtocolError::UnsupportedVersion(9))
        );
    }
}
