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

use std::fmt::{Debug, Display, Formatter};

/// Type representing a CoAP message code: a 3-bit class and a 5-bit detail,
/// carried in a single byte.
///
/// This is a plain newtype rather than a closed enum so that well-formed
/// messages bearing codes this implementation does not know (e.g. a FETCH
/// request) can still be decoded and answered with 4.05 or RST instead of
/// failing the parse.
#[derive(Copy, Eq, PartialEq, Hash, Clone, Ord, PartialOrd)]
pub struct MsgCode(pub u8);

/// Helper function
const fn calc_code(class: u8, detail: u8) -> MsgCode {
    MsgCode(((class & 0x7) << 5) | detail)
}

impl MsgCode {
    /// Empty message code. Only used for ping requests, resets, and empty
    /// acknowledgements.
    pub const EMPTY: MsgCode = calc_code(0, 0);

    /// CoAP GET method.
    pub const GET: MsgCode = calc_code(0, 1);

    /// CoAP POST method.
    pub const POST: MsgCode = calc_code(0, 2);

    /// CoAP PUT method.
    pub const PUT: MsgCode = calc_code(0, 3);

    /// CoAP DELETE method.
    pub const DELETE: MsgCode = calc_code(0, 4);

    /// CoAP 2.01 Created.
    pub const CREATED: MsgCode = calc_code(2, 1);

    /// CoAP 2.02 Deleted.
    pub const DELETED: MsgCode = calc_code(2, 2);

    /// CoAP 2.03 Valid.
    pub const VALID: MsgCode = calc_code(2, 3);

    /// CoAP 2.04 Changed.
    pub const CHANGED: MsgCode = calc_code(2, 4);

    /// CoAP 2.05 Content.
    pub const CONTENT: MsgCode = calc_code(2, 5);

    /// CoAP 2.31 Continue, from IETF-RFC7959.
    pub const CONTINUE: MsgCode = calc_code(2, 31);

    /// CoAP 4.00 Bad Request.
    pub const BAD_REQUEST: MsgCode = calc_code(4, 0);

    /// CoAP 4.02 Bad Option.
    pub const BAD_OPTION: MsgCode = calc_code(4, 2);

    /// CoAP 4.04 Not Found.
    pub const NOT_FOUND: MsgCode = calc_code(4, 4);

    /// CoAP 4.05 Method Not Allowed.
    pub const METHOD_NOT_ALLOWED: MsgCode = calc_code(4, 5);

    /// CoAP 4.06 Not Acceptable.
    pub const NOT_ACCEPTABLE: MsgCode = calc_code(4, 6);

    /// CoAP 4.08 Request Entity Incomplete, from IETF-RFC7959.
    pub const REQUEST_ENTITY_INCOMPLETE: MsgCode = calc_code(4, 8);

    /// CoAP 4.12 Precondition Failed.
    pub const PRECONDITION_FAILED: MsgCode = calc_code(4, 12);

    /// CoAP 4.13 Request Entity Too Large.
    pub const REQUEST_ENTITY_TOO_LARGE: MsgCode = calc_code(4, 13);

    /// CoAP 4.15 Unsupported Content-Format.
    pub const UNSUPPORTED_CONTENT_FORMAT: MsgCode = calc_code(4, 15);

    /// CoAP 5.00 Internal Server Error.
    pub const INTERNAL_SERVER_ERROR: MsgCode = calc_code(5, 0);

    /// CoAP 5.01 Not Implemented.
    pub const NOT_IMPLEMENTED: MsgCode = calc_code(5, 1);

    /// CoAP 5.03 Service Unavailable.
    pub const SERVICE_UNAVAILABLE: MsgCode = calc_code(5, 3);

    /// The 3-bit class of this code.
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The 5-bit detail of this code.
    pub fn detail(self) -> u8 {
        self.0 & 0b11111
    }

    /// Returns true if this is the empty code.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if this code marks a request: class 0 with a non-zero
    /// detail, i.e. code values 1 through 31.
    pub fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    /// Returns true if this code marks a response: code values 64 through
    /// 191 (classes 2, 4, and 5).
    pub fn is_response(self) -> bool {
        self.0 >= 64 && self.0 <= 191
    }

    /// Returns true if this code is a client or server error response.
    pub fn is_error(self) -> bool {
        self.class() == 4 || self.class() == 5
    }

    /// Returns true if this code is a success response.
    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl Default for MsgCode {
    fn default() -> Self {
        MsgCode::EMPTY
    }
}

impl From<MsgCode> for u8 {
    fn from(code: MsgCode) -> Self {
        code.0
    }
}

impl From<u8> for MsgCode {
    fn from(x: u8) -> Self {
        MsgCode(x)
    }
}

impl Display for MsgCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl Debug for MsgCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "MsgCode({})", self)
    }
}

/// Enum representing the request methods this server dispatches on.
#[derive(Debug, Copy, Eq, PartialEq, Clone, Hash)]
pub enum Method {
    /// CoAP GET.
    Get,

    /// CoAP POST.
    Post,

    /// CoAP PUT.
    Put,

    /// CoAP DELETE.
    Delete,
}

impl Method {
    /// Maps a request code to a method, returning `None` for request codes
    /// this server does not implement (those draw 4.05).
    pub fn from_code(code: MsgCode) -> Option<Method> {
        match code {
            MsgCode::GET => Some(Method::Get),
            MsgCode::POST => Some(Method::Post),
            MsgCode::PUT => Some(Method::Put),
            MsgCode::DELETE => Some(Method::Delete),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_bytes_match_rfc7252() {
        assert_eq!(MsgCode::GET.0, 0x01);
        assert_eq!(MsgCode::CONTENT.0, 0x45);
        assert_eq!(MsgCode::CONTINUE.0, 0x5F);
        assert_eq!(MsgCode::BAD_REQUEST.0, 0x80);
        assert_eq!(MsgCode::BAD_OPTION.0, 0x82);
        assert_eq!(MsgCode::NOT_FOUND.0, 0x84);
        assert_eq!(MsgCode::REQUEST_ENTITY_INCOMPLETE.0, 0x88);
        assert_eq!(MsgCode::REQUEST_ENTITY_TOO_LARGE.0, 0x8D);
        assert_eq!(MsgCode::INTERNAL_SERVER_ERROR.0, 0xA0);
    }

    #[test]
    fn classification_ranges() {
        assert!(MsgCode::EMPTY.is_empty());
        assert!(MsgCode::GET.is_request());
        assert!(MsgCode(31).is_request());
        assert!(!MsgCode(32).is_request());
        assert!(MsgCode(64).is_response());
        assert!(MsgCode(191).is_response());
        assert!(!MsgCode(192).is_response());
        assert!(MsgCode::NOT_FOUND.is_error());
        assert!(MsgCode::CONTENT.is_success());
    }

    #[test]
    fn unknown_methods_do_not_dispatch() {
        assert_eq!(Method::from_code(MsgCode::PUT), Some(Method::Put));
        assert_eq!(Method::from_code(MsgCode(0x05)), None);
        assert_eq!(Method::from_code(MsgCode::CONTENT), None);
    }

    #[test]
    fn display_is_dotted() {
        assert_eq!(MsgCode::CONTENT.to_string(), "2.05");
        assert_eq!(MsgCode::BAD_REQUEST.to_string(), "4.00");
        assert_eq!(MsgCode::CONTINUE.to_string(), "2.31");
    }
}
