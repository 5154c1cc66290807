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

//! Types related to parsing and encoding CoAP messages.

use crate::block::BlockInfo;
use crate::content_format::ContentFormat;
use crate::option::OptionNumber;
use crate::util::{encode_uint, try_decode_uint, try_decode_uint16};

mod msg_code;
pub use msg_code::Method;
pub use msg_code::MsgCode;

mod msg_type;
pub use msg_type::MsgType;

mod token;
pub use token::MsgToken;

pub mod codec;
pub use codec::DecodeError;
pub use codec::PartialHeader;

/// Type for representing a CoAP message id.
pub type MsgId = u16;

pub(crate) const COAP_MSG_VER_MASK: u8 = 0b11000000;
pub(crate) const COAP_MSG_VER_OFFS: u8 = 6;
pub(crate) const COAP_MSG_T_MASK: u8 = 0b00110000;
pub(crate) const COAP_MSG_T_OFFS: u8 = 4;
pub(crate) const COAP_MSG_TKL_MASK: u8 = 0b00001111;

/// An owned CoAP message: header fields, an option multiset ordered by
/// ascending option number, and a payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    msg_type: MsgType,
    code: MsgCode,
    msg_id: MsgId,
    token: MsgToken,
    options: Vec<(OptionNumber, Vec<u8>)>,
    payload: Vec<u8>,
}

impl Message {
    /// Creates a new message with the given type and code, no token, no
    /// options, no payload, and a zero message id.
    pub fn new(msg_type: MsgType, code: MsgCode) -> Message {
        Message {
            msg_type,
            code,
            msg_id: 0,
            token: MsgToken::EMPTY,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Creates an empty acknowledgement for the given message id.
    pub fn ack(msg_id: MsgId) -> Message {
        let mut msg = Message::new(MsgType::Ack, MsgCode::EMPTY);
        msg.msg_id = msg_id;
        msg
    }

    /// Creates a reset message for the given message id.
    pub fn rst(msg_id: MsgId) -> Message {
        let mut msg = Message::new(MsgType::Rst, MsgCode::EMPTY);
        msg.msg_id = msg_id;
        msg
    }

    /// The message type.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// The message code.
    pub fn code(&self) -> MsgCode {
        self.code
    }

    /// The message id.
    pub fn msg_id(&self) -> MsgId {
        self.msg_id
    }

    /// The message token.
    pub fn token(&self) -> MsgToken {
        self.token
    }

    /// The message payload. Empty if the message carries none.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The options of this message, ordered by ascending option number.
    pub fn options(&self) -> &[(OptionNumber, Vec<u8>)] {
        &self.options
    }

    /// Replaces the message type.
    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.msg_type = msg_type;
    }

    /// Replaces the message id.
    pub fn set_msg_id(&mut self, msg_id: MsgId) {
        self.msg_id = msg_id;
    }

    /// Replaces the token.
    pub fn set_token(&mut self, token: MsgToken) {
        self.token = token;
    }

    /// Replaces the payload.
    pub fn set_payload<P: Into<Vec<u8>>>(&mut self, payload: P) {
        self.payload = payload.into();
    }

    /// Inserts an option, keeping the option list ordered by number. A
    /// non-repeatable option that is already present has its value replaced;
    /// repeatable options append after their equal-numbered siblings.
    pub fn insert_option<V: Into<Vec<u8>>>(&mut self, number: OptionNumber, value: V) {
        let value = value.into();

        if !number.is_repeatable() {
            if let Some(existing) = self.options.iter_mut().find(|(n, _)| *n == number) {
                existing.1 = value;
                return;
            }
        }

        let index = self
            .options
            .iter()
            .position(|(n, _)| *n > number)
            .unwrap_or(self.options.len());
        self.options.insert(index, (number, value));
    }

    /// Inserts an option with an unsigned integer value, encoded at its
    /// smallest width.
    pub fn insert_option_uint(&mut self, number: OptionNumber, value: u32) {
        self.insert_option(number, encode_uint(value));
    }

    /// Inserts a `Block1`/`Block2` option.
    pub fn insert_option_block(&mut self, number: OptionNumber, block: BlockInfo) {
        self.insert_option_uint(number, block.0);
    }

    /// Removes all instances of the given option.
    pub fn remove_option(&mut self, number: OptionNumber) {
        self.options.retain(|(n, _)| *n != number);
    }

    /// The value of the first instance of the given option, if present.
    pub fn first_option(&self, number: OptionNumber) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, v)| v.as_slice())
    }

    /// The value of the given option decoded as an unsigned integer.
    /// `None` if the option is absent or its value is wider than 32 bits.
    pub fn uint_option(&self, number: OptionNumber) -> Option<u32> {
        self.first_option(number).and_then(try_decode_uint)
    }

    /// The Content-Format option, if present and well-formed.
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.first_option(OptionNumber::CONTENT_FORMAT)
            .and_then(try_decode_uint16)
            .map(ContentFormat)
    }

    /// The Block1 option, if present and valid.
    pub fn block1(&self) -> Option<BlockInfo> {
        self.uint_option(OptionNumber::BLOCK1)
            .and_then(|x| BlockInfo(x).valid())
    }

    /// The Block2 option, if present and valid.
    pub fn block2(&self) -> Option<BlockInfo> {
        self.uint_option(OptionNumber::BLOCK2)
            .and_then(|x| BlockInfo(x).valid())
    }

    /// The Observe option, if present.
    pub fn observe(&self) -> Option<u32> {
        self.uint_option(OptionNumber::OBSERVE)
    }

    /// The resource path of this message, reassembled from its Uri-Path
    /// options. A message without Uri-Path options addresses `/`.
    pub fn uri_path(&self) -> String {
        let mut path = String::new();

        for (number, value) in &self.options {
            if *number == OptionNumber::URI_PATH {
                path.push('/');
                path.push_str(&String::from_utf8_lossy(value));
            }
        }

        if path.is_empty() {
            path.push('/');
        }

        path
    }

    /// Adds the given path as a sequence of Uri-Path options.
    pub fn set_uri_path(&mut self, path: &str) {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.insert_option(OptionNumber::URI_PATH, segment.as_bytes().to_vec());
        }
    }

    /// Adds the given path as a sequence of Location-Path options.
    pub fn set_location_path(&mut self, path: &str) {
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.insert_option(OptionNumber::LOCATION_PATH, segment.as_bytes().to_vec());
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{:?} {}", self.msg_type, self.code)?;
        write!(f, " MID:{:04X}", self.msg_id)?;

        if !self.token.is_empty() {
            write!(f, " TOK:{}", self.token)?;
        }

        for (number, value) in &self.options {
            write!(f, " {}:{:02x?}", number, value)?;
        }

        if !self.payload.is_empty() {
            match std::str::from_utf8(&self.payload) {
                Ok(s) => write!(f, " {:?}", s)?,
                Err(_) => write!(f, " {:02x?}", self.payload)?,
            }
        }

        write!(f, ">")
    }
}

/// The classification of a successfully decoded inbound message, derived
/// from its code byte: empty messages (code 0), requests (codes 1-31), and
/// responses (codes 64-191).
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum InboundMessage {
    /// An empty message: an acknowledgement, a reset, or a ping.
    Empty(Message),

    /// A request.
    Request(Message),

    /// A response. A server receiving one of these answers with RST.
    Response(Message),
}

impl InboundMessage {
    /// Borrows the message envelope regardless of classification.
    pub fn message(&self) -> &Message {
        match self {
            InboundMessage::Empty(msg) => msg,
            InboundMessage::Request(msg) => msg,
            InboundMessage::Response(msg) => msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_stay_sorted() {
        let mut msg = Message::new(MsgType::Con, MsgCode::GET);
        msg.insert_option_uint(OptionNumber::CONTENT_FORMAT, 0);
        msg.insert_option(OptionNumber::URI_PATH, b"foo".to_vec());
        msg.insert_option_uint(OptionNumber::OBSERVE, 0);
        msg.insert_option(OptionNumber::URI_PATH, b"bar".to_vec());

        let numbers: Vec<u16> = msg.options().iter().map(|(n, _)| n.0).collect();
        assert_eq!(numbers, vec![6, 11, 11, 12]);
    }

    #[test]
    fn repeatable_options_preserve_insertion_order() {
        let mut msg = Message::new(MsgType::Con, MsgCode::GET);
        msg.set_uri_path("/deeply/nested/resource");
        assert_eq!(msg.uri_path(), "/deeply/nested/resource");
    }

    #[test]
    fn singleton_options_replace() {
        let mut msg = Message::new(MsgType::Ack, MsgCode::CONTENT);
        msg.insert_option_uint(OptionNumber::CONTENT_FORMAT, 0);
        msg.insert_option_uint(OptionNumber::CONTENT_FORMAT, 50);
        assert_eq!(msg.options().len(), 1);
        assert_eq!(msg.content_format(), Some(ContentFormat::APPLICATION_JSON));
    }

    #[test]
    fn empty_path_is_root() {
        let msg = Message::new(MsgType::Con, MsgCode::GET);
        assert_eq!(msg.uri_path(), "/");
    }

    #[test]
    fn block_accessors_validate() {
        let mut msg = Message::new(MsgType::Con, MsgCode::GET);
        msg.insert_option_block(
            OptionNumber::BLOCK2,
            BlockInfo::new(3, true, 2).unwrap(),
        );

        let block = msg.block2().unwrap();
        assert_eq!(block.num(), 3);
        assert!(block.more());
        assert_eq!(block.len(), 64);
        assert_eq!(msg.block1(), None);
    }
}
