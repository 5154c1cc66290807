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

use core::ops::Deref;

/// Type for holding the value of a CoAP message token: zero to eight opaque
/// bytes correlating a request with its response(s), independent of the
/// message id.
///
/// Tokens are compared byte-for-byte, length included; they are never
/// interpreted as text or numbers.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Ord, PartialOrd)]
pub struct MsgToken {
    len: u8,
    bytes: [u8; 8],
}

impl MsgToken {
    /// Constant representing an empty token.
    pub const EMPTY: MsgToken = MsgToken {
        len: 0u8,
        bytes: [0; 8],
    };

    /// Creates a new token from the given byte slice.
    ///
    /// Note: this will panic if the slice is longer than eight bytes. The
    /// decoder checks the token length field before calling this.
    pub fn new(x: &[u8]) -> MsgToken {
        let mut bytes = [0u8; 8];
        let len = x.len();
        bytes[..len].copy_from_slice(x);
        MsgToken {
            len: len as u8,
            bytes,
        }
    }

    /// Returns the length of this token.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if the length of this token is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a byte slice containing this token.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Display for MsgToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl Default for MsgToken {
    fn default() -> Self {
        MsgToken::EMPTY
    }
}

impl Deref for MsgToken {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl core::cmp::PartialEq<[u8]> for MsgToken {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl From<&[u8]> for MsgToken {
    fn from(x: &[u8]) -> Self {
        MsgToken::new(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_of_different_lengths_are_distinct() {
        // 0x00 and the empty token must never collide.
        assert_ne!(MsgToken::new(&[0x00]), MsgToken::EMPTY);
        assert_ne!(MsgToken::new(&[0x00]), MsgToken::new(&[0x00, 0x00]));
    }

    #[test]
    fn eight_byte_tokens_round_trip() {
        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let token = MsgToken::new(&bytes);
        assert_eq!(token.len(), 8);
        assert_eq!(token.as_bytes(), &bytes[..]);
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(MsgToken::new(b"tkn1").to_string(), "746B6E31");
        assert_eq!(MsgToken::EMPTY.to_string(), "");
    }
}
