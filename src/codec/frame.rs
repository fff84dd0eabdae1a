// Copyright 2025 jonefeewang@gmail.com
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

use bytes::{Buf, BufMut, BytesMut};

use crate::service::CodecConfig;
use crate::AppError::{InvalidValue, MalformedProtocol};
use crate::AppResult;

use super::{Decoder, Encoder, ProtocolDecoder, ProtocolEncoder};

/// Largest accepted message body, 5 MiB exclusive.
pub const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

/// Upper bound on what a length header alone can make the decoder reserve.
/// Larger bodies grow the buffer as their bytes actually arrive.
const BODY_RESERVE_STEP: usize = 64 * 1024;

fn check_length_size(length_size: usize) -> AppResult<()> {
    if !(1..=8).contains(&length_size) {
        return Err(InvalidValue(format!(
            "length field size {} not in 1..=8",
            length_size
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameDecoderState {
    ReadLength,
    ReadBody(usize),
    /// a length was out of bounds, nothing is decoded anymore
    Failed,
}

/// Reassembles `[length: N bytes LE][body]` frames from a growing buffer.
///
/// Each call consumes at most one frame from the front of the buffer; bytes of
/// an incomplete frame stay buffered for the next read.
#[derive(Debug)]
pub struct FrameDecoder {
    length_size: usize,
    contain_length: bool,
    max_frame_size: usize,
    state: FrameDecoderState,
}

impl FrameDecoder {
    pub fn new(length_size: usize, contain_length: bool) -> AppResult<FrameDecoder> {
        check_length_size(length_size)?;
        Ok(FrameDecoder {
            length_size,
            contain_length,
            max_frame_size: MAX_FRAME_SIZE,
            state: FrameDecoderState::ReadLength,
        })
    }

    pub fn from_config(config: &CodecConfig) -> AppResult<FrameDecoder> {
        FrameDecoder::new(config.length_field_size, config.length_includes_header)
    }

    /// Lowers the body size limit, mostly useful for tests and constrained peers.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> FrameDecoder {
        self.max_frame_size = max_frame_size.min(MAX_FRAME_SIZE);
        self
    }

    /// Wraps the decoder into an inbound chain handler.
    pub fn into_handler(self) -> ProtocolDecoder<FrameDecoder> {
        ProtocolDecoder::new(self)
    }

    pub fn is_failed(&self) -> bool {
        self.state == FrameDecoderState::Failed
    }

    fn fail(&mut self, reason: String) -> AppResult<Option<BytesMut>> {
        self.state = FrameDecoderState::Failed;
        Err(MalformedProtocol(reason))
    }
}

impl Decoder for FrameDecoder {
    fn decode(&mut self, buffer: &mut BytesMut) -> AppResult<Option<BytesMut>> {
        if self.state == FrameDecoderState::Failed {
            return Err(MalformedProtocol("frame decoder already failed".into()));
        }

        if self.state == FrameDecoderState::ReadLength {
            if buffer.len() < self.length_size {
                return Ok(None);
            }
            let declared = buffer.get_uint_le(self.length_size);
            let body_len = if self.contain_length {
                declared.checked_sub(self.length_size as u64)
            } else {
                Some(declared)
            };
            match body_len {
                None => {
                    return self.fail(format!(
                        "message body size {} is negative",
                        declared as i128 - self.length_size as i128
                    ));
                }
                Some(len) if len >= self.max_frame_size as u64 => {
                    return self.fail(format!(
                        "message body size {} exceeds max frame size {}",
                        len, self.max_frame_size
                    ));
                }
                Some(len) => {
                    let len = len as usize;
                    if buffer.len() < len {
                        buffer.reserve((len - buffer.len()).min(BODY_RESERVE_STEP));
                    }
                    self.state = FrameDecoderState::ReadBody(len);
                }
            }
        }

        if let FrameDecoderState::ReadBody(len) = self.state {
            if buffer.len() >= len {
                self.state = FrameDecoderState::ReadLength;
                return Ok(Some(buffer.split_to(len)));
            }
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.state = FrameDecoderState::ReadLength;
    }

    fn new_instance(&self) -> Self {
        FrameDecoder {
            length_size: self.length_size,
            contain_length: self.contain_length,
            max_frame_size: self.max_frame_size,
            state: FrameDecoderState::ReadLength,
        }
    }
}

/// Prefixes every outbound payload with its little-endian length.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    length_size: usize,
    contain_length: bool,
}

impl FrameEncoder {
    pub fn new(length_size: usize, contain_length: bool) -> AppResult<FrameEncoder> {
        check_length_size(length_size)?;
        Ok(FrameEncoder {
            length_size,
            contain_length,
        })
    }

    pub fn from_config(config: &CodecConfig) -> AppResult<FrameEncoder> {
        FrameEncoder::new(config.length_field_size, config.length_includes_header)
    }

    pub fn into_handler(self) -> ProtocolEncoder<FrameEncoder> {
        ProtocolEncoder::new(self)
    }
}

impl Encoder for FrameEncoder {
    fn encode(&self, msg: BytesMut) -> AppResult<BytesMut> {
        if msg.len() >= MAX_FRAME_SIZE {
            return Err(MalformedProtocol(format!(
                "message body size {} exceeds max frame size {}",
                msg.len(),
                MAX_FRAME_SIZE
            )));
        }
        let mut frame_len = msg.len() as u64;
        if self.contain_length {
            frame_len += self.length_size as u64;
        }
        if self.length_size < 8 && frame_len >> (8 * self.length_size) != 0 {
            return Err(MalformedProtocol(format!(
                "frame length {} does not fit a {} byte length field",
                frame_len, self.length_size
            )));
        }

        let mut frame = BytesMut::with_capacity(self.length_size + msg.len());
        frame.put_uint_le(frame_len, self.length_size);
        frame.extend_from_slice(&msg);
        Ok(frame)
    }

    fn new_instance(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;
    use rstest::rstest;

    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, buffer: &mut BytesMut) -> Vec<BytesMut> {
        let mut messages = Vec::new();
        while let Some(msg) = decoder.decode(buffer).unwrap() {
            messages.push(msg);
        }
        messages
    }

    fn encode_all(encoder: &FrameEncoder, payloads: &[&[u8]]) -> BytesMut {
        let mut wire = BytesMut::new();
        for payload in payloads {
            wire.extend_from_slice(&encoder.encode(BytesMut::from(*payload)).unwrap());
        }
        wire
    }

    #[rstest]
    #[case(1, false)]
    #[case(2, true)]
    #[case(4, true)]
    #[case(4, false)]
    #[case(8, true)]
    fn test_round_trip(#[case] length_size: usize, #[case] contain_length: bool) {
        let encoder = FrameEncoder::new(length_size, contain_length).unwrap();
        let mut decoder = FrameDecoder::new(length_size, contain_length).unwrap();

        let mut wire = encoder.encode(BytesMut::from(&b"ping"[..])).unwrap();
        assert_eq!(wire.len(), length_size + 4);

        let decoded = decode_all(&mut decoder, &mut wire);
        assert_eq!(decoded, vec![BytesMut::from(&b"ping"[..])]);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_wire_layout_four_byte_inclusive() {
        let encoder = FrameEncoder::new(4, true).unwrap();
        let frame = encoder.encode(BytesMut::from(&b"ping"[..])).unwrap();
        assert_eq!(&frame[..], &[8, 0, 0, 0, b'p', b'i', b'n', b'g']);

        let encoder = FrameEncoder::new(4, false).unwrap();
        let frame = encoder.encode(BytesMut::from(&b"ping"[..])).unwrap();
        assert_eq!(&frame[..4], &[4, 0, 0, 0]);
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let encoder = FrameEncoder::new(4, true).unwrap();
        let mut decoder = FrameDecoder::new(4, true).unwrap();
        let mut wire = encode_all(&encoder, &[b"one", b"", b"three"]);

        let decoded = decode_all(&mut decoder, &mut wire);
        assert_eq!(
            decoded,
            vec![
                BytesMut::from(&b"one"[..]),
                BytesMut::new(),
                BytesMut::from(&b"three"[..])
            ]
        );
    }

    #[test]
    fn test_partial_reads_keep_bytes_buffered() {
        let mut decoder = FrameDecoder::new(4, false).unwrap();
        let mut buffer = BytesMut::from(&[5u8, 0][..]);
        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 2);

        buffer.extend_from_slice(&[0, 0, b'h', b'e']);
        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        // the length field is consumed, the partial body is kept
        assert_eq!(&buffer[..], b"he");

        buffer.extend_from_slice(b"llo!");
        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(&buffer[..], b"!");
    }

    #[test]
    fn test_fragmentation_invariance() {
        let encoder = FrameEncoder::new(4, true).unwrap();
        let payloads: Vec<Vec<u8>> = (0..50u8)
            .map(|i| (0..i as usize * 7).map(|j| (j as u8).wrapping_mul(i)).collect())
            .collect();
        let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
        let wire = encode_all(&encoder, &refs);

        let mut whole_decoder = FrameDecoder::new(4, true).unwrap();
        let mut whole = wire.clone();
        let expected = decode_all(&mut whole_decoder, &mut whole);
        assert_eq!(expected.len(), payloads.len());

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let mut decoder = FrameDecoder::new(4, true).unwrap();
            let mut buffer = BytesMut::new();
            let mut decoded = Vec::new();
            let mut offset = 0;
            while offset < wire.len() {
                let step = rng.gen_range(1..=16).min(wire.len() - offset);
                buffer.extend_from_slice(&wire[offset..offset + step]);
                offset += step;
                decoded.extend(decode_all(&mut decoder, &mut buffer));
            }
            assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn test_negative_body_length_fails() {
        let mut decoder = FrameDecoder::new(4, true).unwrap();
        // declared length 2 is shorter than the 4 byte field itself
        let mut buffer = BytesMut::from(&[2u8, 0, 0, 0, b'a', b'b'][..]);
        assert!(matches!(
            decoder.decode(&mut buffer),
            Err(MalformedProtocol(_))
        ));
        assert!(decoder.is_failed());
    }

    #[rstest]
    #[case(MAX_FRAME_SIZE as u32, true)]
    #[case(MAX_FRAME_SIZE as u32 + 1, true)]
    #[case(MAX_FRAME_SIZE as u32 - 1, false)]
    fn test_max_frame_size_boundary(#[case] declared: u32, #[case] rejected: bool) {
        let mut decoder = FrameDecoder::new(4, false).unwrap();
        let mut buffer = BytesMut::from(&declared.to_le_bytes()[..]);
        let result = decoder.decode(&mut buffer);
        assert_eq!(result.is_err(), rejected);
        if !rejected {
            // still waiting for the body
            assert!(result.unwrap().is_none());
        }
    }

    #[test]
    fn test_large_header_reserves_bounded_space() {
        let mut decoder = FrameDecoder::new(4, false).unwrap();
        let declared = (MAX_FRAME_SIZE - 1) as u32;
        let mut buffer = BytesMut::from(&declared.to_le_bytes()[..]);
        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert!(buffer.capacity() < 1024 * 1024);

        // the body still decodes once it is all there
        buffer.extend_from_slice(&vec![7u8; MAX_FRAME_SIZE - 1]);
        let body = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(body.len(), MAX_FRAME_SIZE - 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_nothing_decoded_after_failure() {
        let encoder = FrameEncoder::new(4, true).unwrap();
        let mut decoder = FrameDecoder::new(4, true).unwrap();
        let mut buffer = BytesMut::from(&[0xffu8, 0xff, 0xff, 0x7f][..]);
        assert!(decoder.decode(&mut buffer).is_err());

        buffer.extend_from_slice(&encoder.encode(BytesMut::from(&b"late"[..])).unwrap());
        assert!(decoder.decode(&mut buffer).is_err());

        let mut fresh = decoder.new_instance();
        assert_eq!(fresh.decode(&mut buffer).unwrap().unwrap(), &b"late"[..]);
    }

    #[test]
    fn test_reset_drops_pending_body_length() {
        let mut decoder = FrameDecoder::new(2, false).unwrap();
        let mut buffer = BytesMut::from(&[10u8, 0, 1, 2][..]);
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        decoder.reset();
        let mut buffer = BytesMut::from(&[1u8, 0, 9][..]);
        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap(), &[9u8][..]);
    }

    #[test]
    fn test_invalid_length_size_rejected() {
        assert!(matches!(FrameDecoder::new(0, true), Err(InvalidValue(_))));
        assert!(matches!(FrameEncoder::new(9, true), Err(InvalidValue(_))));
    }

    #[test]
    fn test_encoder_rejects_length_overflow() {
        let encoder = FrameEncoder::new(1, true).unwrap();
        assert!(encoder.encode(BytesMut::from(&[0u8; 254][..])).is_ok());
        assert!(matches!(
            encoder.encode(BytesMut::from(&[0u8; 255][..])),
            Err(MalformedProtocol(_))
        ));
    }
}
