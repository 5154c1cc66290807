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

use crate::message::MsgCode;
use std::fmt::{Debug, Display, Formatter};

/// Type for errors encountered while decoding datagrams or serving requests.
///
/// Most variants have a deterministic mapping to a CoAP response code,
/// available through [`Error::response_code`].
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Error {
    /// The datagram could not be parsed as a CoAP message: wrong version,
    /// truncated header or option, a token longer than eight bytes, a
    /// reserved nibble value, or a payload marker followed by nothing.
    MalformedMessage,

    /// The message carried a critical option this server does not recognize.
    UnhandledCriticalOption,

    /// The requested resource does not exist.
    NotFound,

    /// The request method is not supported by this server or was refused by
    /// the resource.
    MethodNotAllowed,

    /// A block-wise transfer arrived with a gap or an overlap.
    EntityIncomplete,

    /// A block-wise request body exceeded the server's assembly buffer.
    EntityTooLarge,

    /// A resource handler failed or panicked.
    InternalError,

    /// A confirmable transmission was never acknowledged.
    ResponseTimeout,

    /// A duplicate request arrived before a response was ready and was
    /// silently discarded.
    DuplicateDropped,

    /// An I/O error occurred while performing this operation.
    IOError,
}

impl Error {
    /// Returns the CoAP response code this error maps to, or `None` for
    /// errors that must never produce wire output.
    pub fn response_code(self) -> Option<MsgCode> {
        match self {
            Error::MalformedMessage => Some(MsgCode::BAD_REQUEST),
            Error::UnhandledCriticalOption => Some(MsgCode::BAD_OPTION),
            Error::NotFound => Some(MsgCode::NOT_FOUND),
            Error::MethodNotAllowed => Some(MsgCode::METHOD_NOT_ALLOWED),
            Error::EntityIncomplete => Some(MsgCode::REQUEST_ENTITY_INCOMPLETE),
            Error::EntityTooLarge => Some(MsgCode::REQUEST_ENTITY_TOO_LARGE),
            Error::InternalError => Some(MsgCode::INTERNAL_SERVER_ERROR),
            Error::ResponseTimeout | Error::DuplicateDropped | Error::IOError => None,
        }
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::IOError
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_errors_have_no_response_code() {
        assert_eq!(Error::ResponseTimeout.response_code(), None);
        assert_eq!(Error::DuplicateDropped.response_code(), None);
        assert_eq!(Error::IOError.response_code(), None);
    }

    #[test]
    fn wire_errors_map_to_their_codes() {
        assert_eq!(
            Error::MalformedMessage.response_code(),
            Some(MsgCode::BAD_REQUEST)
        );
        assert_eq!(
            Error::UnhandledCriticalOption.response_code(),
            Some(MsgCode::BAD_OPTION)
        );
        assert_eq!(
            Error::EntityIncomplete.response_code(),
            Some(MsgCode::REQUEST_ENTITY_INCOMPLETE)
        );
    }
}
