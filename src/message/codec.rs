// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Low-level message codec functions.

use super::*;
use crate::consts::{COAP_VERSION, PAYLOAD_MARKER};
use crate::error::Error;

/// The largest value representable by the option delta/length extension
/// scheme: `269 + 0xFFFF`.
pub const MAX_OPTION_VALUE_SIZE: usize = 65804;

/// The header fields of a datagram that failed to decode, as far as they
/// could be read. Used to synthesize 4.00/4.02 replies that echo the
/// offending message id and token.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PartialHeader {
    /// The message type field.
    pub msg_type: MsgType,

    /// The message id field.
    pub msg_id: MsgId,

    /// The token, or [`MsgToken::EMPTY`] if the token was unreadable.
    pub token: MsgToken,
}

/// Error type produced by [`decode`], pairing the failure kind with the
/// partially decoded header, when one was readable.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DecodeError {
    /// What went wrong: [`Error::MalformedMessage`] or
    /// [`Error::UnhandledCriticalOption`].
    pub error: Error,

    /// The header of the offending datagram, if the fixed header was intact.
    pub header: Option<PartialHeader>,
}

impl DecodeError {
    fn malformed(header: Option<PartialHeader>) -> DecodeError {
        DecodeError {
            error: Error::MalformedMessage,
            header,
        }
    }

    /// The response code the failed datagram draws: 4.02 for an unhandled
    /// critical option, 4.00 otherwise.
    pub fn response_code(&self) -> MsgCode {
        self.error
            .response_code()
            .unwrap_or(MsgCode::BAD_REQUEST)
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Debug>::fmt(self, f)
    }
}

/// Decodes the delta or length nibble of an option header, consuming
/// extension bytes from `iter` as the nibble value dictates: values up to 12
/// are literal, 13 adds one extension byte, 14 adds two (big-endian, offset
/// by 269), and 15 is reserved.
fn decode_ext(nibble: u8, iter: &mut core::slice::Iter<'_, u8>) -> Result<u32, ()> {
    match nibble {
        13 => match iter.next() {
            Some(ext) => Ok(13 + *ext as u32),
            None => Err(()),
        },
        14 => {
            let msb = *iter.next().ok_or(())? as u32;
            let lsb = *iter.next().ok_or(())? as u32;
            Ok(269 + ((msb << 8) | lsb))
        }
        15 => Err(()),
        literal => Ok(literal as u32),
    }
}

/// Encodes a value as an option delta or length nibble, returning the nibble
/// and appending any extension bytes to `ext`.
///
/// Values above [`MAX_OPTION_VALUE_SIZE`] are not representable; the codec
/// never produces them.
fn encode_ext(value: u32, ext: &mut Vec<u8>) -> u8 {
    debug_assert!(value as usize <= MAX_OPTION_VALUE_SIZE);

    if value <= 12 {
        value as u8
    } else if value <= 268 {
        ext.push((value - 13) as u8);
        13
    } else {
        let value = value - 269;
        ext.push((value >> 8) as u8);
        ext.push(value as u8);
        14
    }
}

/// Parses a datagram into a classified [`InboundMessage`].
///
/// On failure the returned [`DecodeError`] carries the header fields that
/// were readable so the caller can address its 4.00/4.02 reply.
pub fn decode(buffer: &[u8]) -> Result<InboundMessage, DecodeError> {
    if buffer.len() < 4 {
        return Err(DecodeError::malformed(None));
    }

    let version = (buffer[0] & COAP_MSG_VER_MASK) >> COAP_MSG_VER_OFFS;
    if version != COAP_VERSION {
        return Err(DecodeError::malformed(None));
    }

    let msg_type = MsgType::from_bits((buffer[0] & COAP_MSG_T_MASK) >> COAP_MSG_T_OFFS);
    let msg_id = ((buffer[2] as u16) << 8) | buffer[3] as u16;
    let token_len = (buffer[0] & COAP_MSG_TKL_MASK) as usize;

    let mut header = PartialHeader {
        msg_type,
        msg_id,
        token: MsgToken::EMPTY,
    };

    if token_len > 8 || buffer.len() < 4 + token_len {
        return Err(DecodeError::malformed(Some(header)));
    }

    header.token = MsgToken::new(&buffer[4..4 + token_len]);

    let code = MsgCode(buffer[1]);

    if code.is_empty() {
        // An empty message is exactly four bytes.
        if token_len != 0 || buffer.len() != 4 {
            return Err(DecodeError::malformed(Some(header)));
        }
    } else if !code.is_request() && !code.is_response() {
        // Classes 1, 6 and 7 are reserved.
        return Err(DecodeError::malformed(Some(header)));
    }

    let mut msg = Message::new(msg_type, code);
    msg.set_msg_id(msg_id);
    msg.set_token(header.token);

    let mut iter = buffer[4 + token_len..].iter();
    let mut number: u32 = 0;

    while let Some(&first) = iter.next() {
        if first == PAYLOAD_MARKER {
            let payload = iter.as_slice();
            if payload.is_empty() {
                return Err(DecodeError::malformed(Some(header)));
            }
            msg.set_payload(payload.to_vec());
            break;
        }

        let delta = decode_ext(first >> 4, &mut iter)
            .map_err(|_| DecodeError::malformed(Some(header)))?;
        let length = decode_ext(first & 0xF, &mut iter)
            .map_err(|_| DecodeError::malformed(Some(header)))? as usize;

        number += delta;
        if number > u16::max_value() as u32 {
            // Don't let the option number wrap.
            return Err(DecodeError::malformed(Some(header)));
        }

        if length > iter.as_slice().len() {
            return Err(DecodeError::malformed(Some(header)));
        }

        let value = &iter.as_slice()[..length];
        if length > 0 {
            iter.nth(length - 1);
        }

        let option = OptionNumber(number as u16);
        if option.is_recognized() {
            msg.insert_option(option, value.to_vec());
        } else if option.is_critical() {
            return Err(DecodeError {
                error: Error::UnhandledCriticalOption,
                header: Some(header),
            });
        } else {
            debug!("Skipping unrecognized elective option {}", option);
        }
    }

    Ok(if code.is_empty() {
        InboundMessage::Empty(msg)
    } else if code.is_request() {
        InboundMessage::Request(msg)
    } else {
        InboundMessage::Response(msg)
    })
}

/// Serializes a message to its datagram representation.
///
/// Options are emitted in ascending number order (the [`Message`] option
/// list is kept sorted on insertion), so every encoded delta is
/// non-negative. The payload marker is emitted only for non-empty payloads.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + msg.token().len() + msg.payload().len() + 16);

    out.push(
        (COAP_VERSION << COAP_MSG_VER_OFFS)
            | ((msg.msg_type() as u8) << COAP_MSG_T_OFFS)
            | msg.token().len() as u8,
    );
    out.push(msg.code().into());
    out.push((msg.msg_id() >> 8) as u8);
    out.push(msg.msg_id() as u8);
    out.extend_from_slice(msg.token().as_bytes());

    let mut previous: u32 = 0;
    for (number, value) in msg.options() {
        debug_assert!(value.len() <= MAX_OPTION_VALUE_SIZE);

        let mut ext = Vec::with_capacity(4);
        let delta_nibble = encode_ext(number.0 as u32 - previous, &mut ext);
        let length_nibble = encode_ext(value.len() as u32, &mut ext);

        out.push((delta_nibble << 4) | length_nibble);
        out.extend_from_slice(&ext);
        out.extend_from_slice(value);

        previous = number.0 as u32;
    }

    if !msg.payload().is_empty() {
        out.push(PAYLOAD_MARKER);
        out.extend_from_slice(msg.payload());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_request(buffer: &[u8]) -> Message {
        match decode(buffer).expect("decode failed") {
            InboundMessage::Request(msg) => msg,
            other => panic!("not a request: {:?}", other),
        }
    }

    #[test]
    fn decodes_a_simple_get() {
        // CON GET, MID 0x1234, token "tkn1", Uri-Path "foo".
        let msg = decode_request(&[
            0x44, 0x01, 0x12, 0x34, 0x74, 0x6B, 0x6E, 0x31, 0xB3, 0x66, 0x6F, 0x6F,
        ]);

        assert_eq!(msg.msg_type(), MsgType::Con);
        assert_eq!(msg.code(), MsgCode::GET);
        assert_eq!(msg.msg_id(), 0x1234);
        assert_eq!(msg.token(), MsgToken::new(b"tkn1"));
        assert_eq!(msg.uri_path(), "/foo");
        assert!(msg.payload().is_empty());
    }

    #[test]
    fn encodes_a_piggybacked_content_response() {
        let mut msg = Message::new(MsgType::Ack, MsgCode::CONTENT);
        msg.set_msg_id(0x1234);
        msg.set_token(MsgToken::new(b"tkn1"));
        msg.insert_option_uint(OptionNumber::CONTENT_FORMAT, 0);
        msg.set_payload(b"hi".to_vec());

        assert_eq!(
            encode(&msg),
            vec![0x64, 0x45, 0x12, 0x34, 0x74, 0x6B, 0x6E, 0x31, 0xC0, 0xFF, 0x68, 0x69]
        );
    }

    #[test]
    fn round_trips_a_message_with_every_field() {
        let mut msg = Message::new(MsgType::Non, MsgCode::PUT);
        msg.set_msg_id(0xBEEF);
        msg.set_token(MsgToken::new(&[1, 2, 3, 4, 5, 6, 7, 8]));
        msg.set_uri_path("/a/b/c");
        msg.insert_option_uint(OptionNumber::CONTENT_FORMAT, 50);
        msg.insert_option_uint(OptionNumber::SIZE1, 3000);
        msg.set_payload(vec![0u8; 100]);

        let decoded = decode_request(&encode(&msg));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn encoded_option_numbers_never_decrease() {
        let mut msg = Message::new(MsgType::Con, MsgCode::GET);
        msg.insert_option_uint(OptionNumber::SIZE1, 1);
        msg.insert_option_uint(OptionNumber::OBSERVE, 0);
        msg.insert_option(OptionNumber::URI_PATH, b"x".to_vec());
        msg.insert_option_uint(OptionNumber::BLOCK2, 0x10);

        let buffer = encode(&msg);
        let mut iter = buffer[4..].iter();
        let mut last = 0u32;
        while let Some(&first) = iter.next() {
            if first == PAYLOAD_MARKER {
                break;
            }
            let delta = decode_ext(first >> 4, &mut iter).unwrap();
            let length = decode_ext(first & 0xF, &mut iter).unwrap() as usize;
            let number = last + delta;
            assert!(number >= last);
            last = number;
            if length > 0 {
                iter.nth(length - 1);
            }
        }
        assert_eq!(last, OptionNumber::SIZE1.0 as u32);
    }

    #[test]
    fn nibble_boundaries() {
        // Literal nibble.
        let mut ext = Vec::new();
        assert_eq!(encode_ext(12, &mut ext), 12);
        assert!(ext.is_empty());

        // One extension byte.
        ext.clear();
        assert_eq!(encode_ext(13, &mut ext), 13);
        assert_eq!(ext, vec![0]);

        ext.clear();
        assert_eq!(encode_ext(268, &mut ext), 13);
        assert_eq!(ext, vec![255]);

        // Two extension bytes.
        ext.clear();
        assert_eq!(encode_ext(269, &mut ext), 14);
        assert_eq!(ext, vec![0, 0]);

        ext.clear();
        assert_eq!(encode_ext(65804, &mut ext), 14);
        assert_eq!(ext, vec![0xFF, 0xFF]);

        // And back again.
        for value in vec![0u32, 12, 13, 268, 269, 65804] {
            ext.clear();
            let nibble = encode_ext(value, &mut ext);
            let mut iter = ext.iter();
            assert_eq!(decode_ext(nibble, &mut iter), Ok(value));
        }

        // Nibble 15 is reserved.
        assert_eq!(decode_ext(15, &mut [].iter()), Err(()));
    }

    #[test]
    fn token_length_boundaries() {
        // tkl = 0.
        assert!(decode(&[0x40, 0x01, 0x00, 0x01]).is_ok());

        // tkl = 8.
        let mut buffer = vec![0x48, 0x01, 0x00, 0x01];
        buffer.extend_from_slice(&[0u8; 8]);
        assert!(decode(&buffer).is_ok());

        // tkl = 9 is rejected even when the bytes are present.
        let mut buffer = vec![0x49, 0x01, 0x00, 0x01];
        buffer.extend_from_slice(&[0u8; 9]);
        let err = decode(&buffer).unwrap_err();
        assert_eq!(err.error, Error::MalformedMessage);
        assert_eq!(err.header.unwrap().msg_id, 1);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let err = decode(&[0x84, 0x01, 0x12, 0x34, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.error, Error::MalformedMessage);
        assert_eq!(err.header, None);
    }

    #[test]
    fn payload_marker_with_no_payload_is_rejected() {
        let err = decode(&[0x40, 0x01, 0x12, 0x34, 0xFF]).unwrap_err();
        assert_eq!(err.error, Error::MalformedMessage);
        assert_eq!(err.header.unwrap().msg_id, 0x1234);
    }

    #[test]
    fn unknown_critical_option_reports_bad_option() {
        // Option 17 is critical and not recognized by this server.
        let err = decode(&[
            0x44, 0x01, 0x12, 0x34, 0x74, 0x6B, 0x6E, 0x31, 0xD0, 0x04,
        ])
        .unwrap_err();

        assert_eq!(err.error, Error::UnhandledCriticalOption);
        assert_eq!(err.response_code(), MsgCode::BAD_OPTION);

        let header = err.header.unwrap();
        assert_eq!(header.msg_type, MsgType::Con);
        assert_eq!(header.msg_id, 0x1234);
        assert_eq!(header.token, MsgToken::new(b"tkn1"));
    }

    #[test]
    fn unknown_elective_option_is_skipped() {
        // Option 30 is elective and not in the recognized set.
        let msg = decode_request(&[0x40, 0x01, 0x00, 0x01, 0xD1, 0x11, 0xAA]);
        assert!(msg.options().is_empty());
    }

    #[test]
    fn long_option_values_round_trip() {
        let mut msg = Message::new(MsgType::Con, MsgCode::POST);
        msg.insert_option(OptionNumber::URI_PATH, vec![b'a'; 300]);

        let decoded = decode_request(&encode(&msg));
        assert_eq!(decoded.first_option(OptionNumber::URI_PATH).unwrap().len(), 300);
    }

    #[test]
    fn truncated_option_value_is_rejected() {
        // Claims 3 bytes of value, provides 2.
        let err = decode(&[0x40, 0x01, 0x00, 0x01, 0xB3, 0x66, 0x6F]).unwrap_err();
        assert_eq!(err.error, Error::MalformedMessage);
    }

    #[test]
    fn empty_message_with_trailing_bytes_is_rejected() {
        assert!(decode(&[0x70, 0x00, 0x00, 0x01]).is_ok());
        assert!(decode(&[0x70, 0x00, 0x00, 0x01, 0x00]).is_err());
    }

    #[test]
    fn reserved_code_classes_are_rejected() {
        // Class 1 (code 32) and class 7 (code 0xE1) are not usable here.
        assert!(decode(&[0x40, 0x20, 0x00, 0x01]).is_err());
        assert!(decode(&[0x40, 0xE1, 0x00, 0x01]).is_err());
    }

    #[test]
    fn classification_matches_code_ranges() {
        match decode(&[0x60, 0x45, 0x00, 0x01]).unwrap() {
            InboundMessage::Response(msg) => assert_eq!(msg.code(), MsgCode::CONTENT),
            other => panic!("expected response, got {:?}", other),
        }

        match decode(&[0x70, 0x00, 0x00, 0x01]).unwrap() {
            InboundMessage::Empty(msg) => assert!(msg.msg_type().is_rst()),
            other => panic!("expected empty, got {:?}", other),
        }
    }
}
