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

//! CoAP option numbers and their registry properties, per
//! [IETF-RFC7252 Section 5.10](https://tools.ietf.org/html/rfc7252#section-5.10).

use std::fmt::{Debug, Display, Formatter};

/// The expected format of an option value.
#[derive(Debug, Copy, Eq, PartialEq, Clone)]
pub enum OptionValueType {
    /// Zero-length value, presence is the signal.
    Flag,

    /// Raw bytes.
    Opaque,

    /// Variable-width unsigned integer in network byte order.
    Integer,

    /// UTF-8 text.
    String,

    /// A [`BlockInfo`](crate::BlockInfo) value.
    Block,
}

/// Type representing a CoAP option number.
#[derive(Copy, Eq, PartialEq, Hash, Clone, Ord, PartialOrd)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    /// URI_HOST option.
    pub const URI_HOST: OptionNumber = OptionNumber(3);

    /// ETAG option.
    pub const ETAG: OptionNumber = OptionNumber(4);

    /// OBSERVE option.
    pub const OBSERVE: OptionNumber = OptionNumber(6);

    /// URI_PORT option.
    pub const URI_PORT: OptionNumber = OptionNumber(7);

    /// LOCATION_PATH option.
    pub const LOCATION_PATH: OptionNumber = OptionNumber(8);

    /// URI_PATH option.
    pub const URI_PATH: OptionNumber = OptionNumber(11);

    /// CONTENT_FORMAT option.
    pub const CONTENT_FORMAT: OptionNumber = OptionNumber(12);

    /// MAX_AGE option.
    pub const MAX_AGE: OptionNumber = OptionNumber(14);

    /// URI_QUERY option.
    pub const URI_QUERY: OptionNumber = OptionNumber(15);

    /// LOCATION_QUERY option.
    pub const LOCATION_QUERY: OptionNumber = OptionNumber(20);

    /// BLOCK2 option.
    pub const BLOCK2: OptionNumber = OptionNumber(23);

    /// BLOCK1 option.
    pub const BLOCK1: OptionNumber = OptionNumber(27);

    /// SIZE2 option.
    pub const SIZE2: OptionNumber = OptionNumber(28);

    /// SIZE1 option.
    pub const SIZE1: OptionNumber = OptionNumber(60);

    /// Returns true if this option number is critical: a receiver that does
    /// not recognize a critical option must reject the message.
    pub fn is_critical(self) -> bool {
        const FLAG_CRITICAL: u16 = 1;
        self.0 & FLAG_CRITICAL == FLAG_CRITICAL
    }

    /// Returns true if this option number is one this implementation
    /// understands. Unrecognized *critical* numbers cause a message to be
    /// rejected with 4.02 Bad Option; unrecognized elective numbers are
    /// silently skipped.
    pub fn is_recognized(self) -> bool {
        match self {
            OptionNumber::URI_HOST
            | OptionNumber::ETAG
            | OptionNumber::OBSERVE
            | OptionNumber::URI_PORT
            | OptionNumber::LOCATION_PATH
            | OptionNumber::URI_PATH
            | OptionNumber::CONTENT_FORMAT
            | OptionNumber::MAX_AGE
            | OptionNumber::URI_QUERY
            | OptionNumber::LOCATION_QUERY
            | OptionNumber::BLOCK2
            | OptionNumber::BLOCK1
            | OptionNumber::SIZE2
            | OptionNumber::SIZE1 => true,
            OptionNumber(_) => false,
        }
    }

    /// Returns the expected value type for this option number.
    pub fn value_type(self) -> OptionValueType {
        match self {
            OptionNumber::URI_HOST => OptionValueType::String,
            OptionNumber::ETAG => OptionValueType::Opaque,
            OptionNumber::OBSERVE => OptionValueType::Integer,
            OptionNumber::URI_PORT => OptionValueType::Integer,
            OptionNumber::LOCATION_PATH => OptionValueType::String,
            OptionNumber::URI_PATH => OptionValueType::String,
            OptionNumber::CONTENT_FORMAT => OptionValueType::Integer,
            OptionNumber::MAX_AGE => OptionValueType::Integer,
            OptionNumber::URI_QUERY => OptionValueType::String,
            OptionNumber::LOCATION_QUERY => OptionValueType::String,
            OptionNumber::BLOCK2 => OptionValueType::Block,
            OptionNumber::BLOCK1 => OptionValueType::Block,
            OptionNumber::SIZE2 => OptionValueType::Integer,
            OptionNumber::SIZE1 => OptionValueType::Integer,
            OptionNumber(_) => OptionValueType::Opaque,
        }
    }

    /// Returns true if multiple instances of this option are allowed in one
    /// message, false if only one instance is allowed.
    pub fn is_repeatable(self) -> bool {
        match self {
            OptionNumber::ETAG
            | OptionNumber::LOCATION_PATH
            | OptionNumber::URI_PATH
            | OptionNumber::URI_QUERY
            | OptionNumber::LOCATION_QUERY => true,
            OptionNumber(_) => false,
        }
    }

    /// Returns the name of this option number, if recognized.
    pub fn static_name(self) -> Option<&'static str> {
        Some(match self {
            OptionNumber::URI_HOST => "Uri-Host",
            OptionNumber::ETAG => "ETag",
            OptionNumber::OBSERVE => "Observe",
            OptionNumber::URI_PORT => "Uri-Port",
            OptionNumber::LOCATION_PATH => "Location-Path",
            OptionNumber::URI_PATH => "Uri-Path",
            OptionNumber::CONTENT_FORMAT => "Content-Format",
            OptionNumber::MAX_AGE => "Max-Age",
            OptionNumber::URI_QUERY => "Uri-Query",
            OptionNumber::LOCATION_QUERY => "Location-Query",
            OptionNumber::BLOCK2 => "Block2",
            OptionNumber::BLOCK1 => "Block1",
            OptionNumber::SIZE2 => "Size2",
            OptionNumber::SIZE1 => "Size1",
            OptionNumber(_) => return None,
        })
    }
}

impl Display for OptionNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self.static_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown-{}", self.0),
        }
    }
}

impl Debug for OptionNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "OptionNumber({}, {})", self.0, self)
    }
}

impl From<u16> for OptionNumber {
    fn from(x: u16) -> Self {
        OptionNumber(x)
    }
}

impl Default for OptionNumber {
    fn default() -> Self {
        OptionNumber(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criticality_is_the_low_bit() {
        assert!(OptionNumber::URI_PATH.is_critical());
        assert!(OptionNumber::BLOCK2.is_critical());
        assert!(!OptionNumber::CONTENT_FORMAT.is_critical());
        assert!(!OptionNumber::OBSERVE.is_critical());
        assert!(OptionNumber(17).is_critical());
    }

    #[test]
    fn unregistered_numbers_are_unrecognized() {
        assert!(!OptionNumber(17).is_recognized());
        assert!(!OptionNumber(35).is_recognized());
        assert!(OptionNumber::BLOCK1.is_recognized());
    }

    #[test]
    fn path_and_query_options_repeat() {
        assert!(OptionNumber::URI_PATH.is_repeatable());
        assert!(OptionNumber::URI_QUERY.is_repeatable());
        assert!(!OptionNumber::CONTENT_FORMAT.is_repeatable());
        assert!(!OptionNumber::OBSERVE.is_repeatable());
    }
}
