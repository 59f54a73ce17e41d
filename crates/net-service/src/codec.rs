// Copyright (C) 2026-present The rcaflow Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Framing of the publish stream.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Frame Length                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      Graph Node Length        |  Graph Node Name (variable)   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Payload (variable)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The frame length counts the bytes following the length field. Responses
//! are a single status byte.

use crate::{FlowUnit, PublishResponseStatus};
use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

pub const FRAME_LENGTH_FIELD_LEN: usize = 4;
pub const GRAPH_NODE_LENGTH_FIELD_LEN: usize = 2;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, strum_macros::Display, Eq, PartialEq, Clone, Serialize, Deserialize)]
pub enum FlowUnitCodecError {
    #[strum(to_string = "I/O error {0}")]
    IoError(String),

    #[strum(to_string = "frame of {0} bytes exceeds the maximum frame size of {1} bytes")]
    FrameTooLarge(usize, usize),

    #[strum(to_string = "frame length {0} is too short to carry a graph node name")]
    InvalidFrameLength(usize),

    #[strum(to_string = "graph node name length {0} exceeds the frame length {1}")]
    InvalidGraphNodeLength(usize, usize),

    #[strum(to_string = "graph node name is not valid UTF-8: {0}")]
    InvalidGraphNodeName(String),

    #[strum(to_string = "graph node name is empty")]
    EmptyGraphNodeName,
}

impl std::error::Error for FlowUnitCodecError {}

impl From<std::io::Error> for FlowUnitCodecError {
    fn from(error: std::io::Error) -> Self {
        Self::IoError(error.to_string())
    }
}

/// Codec for the inbound [FlowUnit] frames
#[derive(Debug, Clone, Copy)]
pub struct FlowUnitCodec {
    max_frame_size: usize,
}

impl Default for FlowUnitCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FlowUnitCodec {
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FlowUnitCodec {
    type Item = FlowUnit;
    type Error = FlowUnitCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_LENGTH_FIELD_LEN {
            return Ok(None);
        }
        let frame_length = NetworkEndian::read_u32(&buf[0..FRAME_LENGTH_FIELD_LEN]) as usize;
        if frame_length > self.max_frame_size {
            // No way to find the next frame boundary reliably, drop everything
            buf.clear();
            return Err(FlowUnitCodecError::FrameTooLarge(
                frame_length,
                self.max_frame_size,
            ));
        }
        if buf.len() < FRAME_LENGTH_FIELD_LEN + frame_length {
            buf.reserve(FRAME_LENGTH_FIELD_LEN + frame_length - buf.len());
            return Ok(None);
        }
        buf.advance(FRAME_LENGTH_FIELD_LEN);
        let mut frame = buf.split_to(frame_length);
        if frame_length < GRAPH_NODE_LENGTH_FIELD_LEN {
            return Err(FlowUnitCodecError::InvalidFrameLength(frame_length));
        }
        let name_length = frame.get_u16() as usize;
        if name_length > frame.len() {
            return Err(FlowUnitCodecError::InvalidGraphNodeLength(
                name_length,
                frame_length,
            ));
        }
        if name_length == 0 {
            return Err(FlowUnitCodecError::EmptyGraphNodeName);
        }
        let name = frame.split_to(name_length);
        let graph_node = std::str::from_utf8(&name)
            .map_err(|err| FlowUnitCodecError::InvalidGraphNodeName(err.to_string()))?;
        Ok(Some(FlowUnit::new(
            graph_node,
            frame.freeze(),
            frame_length,
        )))
    }
}

impl Encoder<FlowUnit> for FlowUnitCodec {
    type Error = FlowUnitCodecError;

    fn encode(&mut self, unit: FlowUnit, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let name = unit.graph_node().as_bytes();
        if name.is_empty() {
            return Err(FlowUnitCodecError::EmptyGraphNodeName);
        }
        if name.len() > u16::MAX as usize {
            return Err(FlowUnitCodecError::InvalidGraphNodeLength(
                name.len(),
                u16::MAX as usize,
            ));
        }
        let frame_length = GRAPH_NODE_LENGTH_FIELD_LEN + name.len() + unit.payload().len();
        if frame_length > self.max_frame_size {
            return Err(FlowUnitCodecError::FrameTooLarge(
                frame_length,
                self.max_frame_size,
            ));
        }
        dst.reserve(FRAME_LENGTH_FIELD_LEN + frame_length);
        dst.put_u32(frame_length as u32);
        dst.put_u16(name.len() as u16);
        dst.put_slice(name);
        dst.put_slice(unit.payload());
        Ok(())
    }
}

#[derive(Debug, strum_macros::Display, Eq, PartialEq, Clone, Serialize, Deserialize)]
pub enum PublishResponseCodecError {
    #[strum(to_string = "I/O error {0}")]
    IoError(String),

    #[strum(to_string = "undefined publish response status {0}")]
    UndefinedStatus(u8),
}

impl std::error::Error for PublishResponseCodecError {}

impl From<std::io::Error> for PublishResponseCodecError {
    fn from(error: std::io::Error) -> Self {
        Self::IoError(error.to_string())
    }
}

/// Codec for the single byte [PublishResponseStatus] sent back to peers
#[derive(Debug, Default, Clone, Copy)]
pub struct PublishResponseCodec;

impl Decoder for PublishResponseCodec {
    type Item = PublishResponseStatus;
    type Error = PublishResponseCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let value = buf.get_u8();
        PublishResponseStatus::try_from(value)
            .map(Some)
            .map_err(|err| PublishResponseCodecError::UndefinedStatus(err.0))
    }
}

impl Encoder<PublishResponseStatus> for PublishResponseCodec {
    type Error = PublishResponseCodecError;

    fn encode(&mut self, status: PublishResponseStatus, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(status.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_decode_flow_unit() {
        let mut codec = FlowUnitCodec::default();
        let mut buf = BytesMut::from(
            &[
                0x00, 0x00, 0x00, 0x0a, // frame length
                0x00, 0x03, // graph node name length
                b'c', b'p', b'u', // graph node name
                b'{', b'"', b'a', b'"', b'}', // payload
            ][..],
        );
        let unit = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(unit.graph_node(), "cpu");
        assert_eq!(unit.payload(), &Bytes::from_static(b"{\"a\"}"));
        assert_eq!(unit.serialized_size(), 10);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frames() {
        let mut codec = FlowUnitCodec::default();
        let mut encoded = BytesMut::new();
        codec
            .encode(
                FlowUnit::new("CPU_Utilization", Bytes::from_static(b"payload"), 0),
                &mut encoded,
            )
            .unwrap();
        codec
            .encode(
                FlowUnit::new("Heap", Bytes::from_static(b"second"), 0),
                &mut encoded,
            )
            .unwrap();

        let mut buf = BytesMut::new();
        let mut decoded = vec![];
        for byte in encoded {
            buf.put_u8(byte);
            if let Some(unit) = codec.decode(&mut buf).unwrap() {
                decoded.push(unit);
            }
        }
        assert_eq!(
            decoded,
            vec![
                FlowUnit::new("CPU_Utilization", Bytes::from_static(b"payload"), 24),
                FlowUnit::new("Heap", Bytes::from_static(b"second"), 12),
            ]
        );
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut codec = FlowUnitCodec::new(16);
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x11, 0x00][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(FlowUnitCodecError::FrameTooLarge(17, 16))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_invalid_frames() {
        let mut codec = FlowUnitCodec::default();

        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x01, 0x00][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(FlowUnitCodecError::InvalidFrameLength(1))
        );
        assert!(buf.is_empty());

        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x03, 0x00, 0x05, b'a'][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(FlowUnitCodecError::InvalidGraphNodeLength(5, 3))
        );

        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x03, 0x00, 0x00, b'a'][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(FlowUnitCodecError::EmptyGraphNodeName)
        );

        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x04, 0x00, 0x02, 0xc3, 0x28][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FlowUnitCodecError::InvalidGraphNodeName(_))
        ));
    }

    #[test]
    fn test_publish_response_codec() {
        let mut codec = PublishResponseCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(PublishResponseStatus::NodeShutdown, &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x01]);
        assert_eq!(
            codec.decode(&mut buf),
            Ok(Some(PublishResponseStatus::NodeShutdown))
        );
        assert_eq!(codec.decode(&mut buf), Ok(None));

        let mut buf = BytesMut::from(&[0x09][..]);
        assert_eq!(
            codec.decode(&mut buf),
            Err(PublishResponseCodecError::UndefinedStatus(9))
        );
    }
}
