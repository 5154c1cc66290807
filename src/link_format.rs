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

//! Mechanisms and constants for encoding [IETF-RFC6690 CoAP link-formats],
//! as served from `/.well-known/core`.
//!
//! [IETF-RFC6690 CoAP link-formats]: https://tools.ietf.org/html/rfc6690

use std::fmt::Write;

/// Resource Type Attribute.
///
/// An opaque string used to assign an application-specific semantic type to
/// a resource.
///
/// * <a href="https://tools.ietf.org/html/rfc6690#section-3.1">RFC6690, Section 3.1</a>
pub const LINK_ATTR_RESOURCE_TYPE: &str = "rt";

/// Content-Format Code(s).
///
/// Space-separated list of content type integers appropriate for being
/// specified in an Accept option.
pub const LINK_ATTR_CONTENT_FORMAT: &str = "ct";

/// Observable flag, from [IETF-RFC7641 Section 6](https://tools.ietf.org/html/rfc7641#section-6).
pub const LINK_ATTR_OBSERVABLE: &str = "obs";

const LINK_SEPARATOR_CHAR: char = ',';
const ATTR_SEPARATOR_CHAR: char = ';';

/// Helper for writing RFC6690 link-formats to anything implementing
/// [`std::fmt::Write`].
///
/// ## Example
///
/// ```
/// use coap_server::link_format::{LinkFormatWrite, LINK_ATTR_RESOURCE_TYPE};
///
/// let mut buffer = String::new();
/// let mut write = LinkFormatWrite::new(&mut buffer);
///
/// write
///     .link("/sensor/light")
///     .attr(LINK_ATTR_RESOURCE_TYPE, "light-lux")
///     .attr_u16("ct", 0);
///
/// assert_eq!(&buffer, "</sensor/light>;rt=\"light-lux\";ct=0");
/// ```
#[derive(Debug)]
pub struct LinkFormatWrite<'a, T: ?Sized> {
    write: &'a mut T,
    is_first: bool,
}

impl<'a, T: Write + ?Sized> LinkFormatWrite<'a, T> {
    /// Creates a new `LinkFormatWrite` wrapping the given
    /// [`std::fmt::Write`] instance.
    pub fn new(write: &'a mut T) -> LinkFormatWrite<'a, T> {
        LinkFormatWrite {
            write,
            is_first: true,
        }
    }

    /// Adds a link to the link format and returns a [`LinkAttributeWrite`]
    /// for attaching attributes to it.
    pub fn link<'b>(&'b mut self, target: &str) -> LinkAttributeWrite<'a, 'b, T> {
        if self.is_first {
            self.is_first = false;
        } else {
            let _ = self.write.write_char(LINK_SEPARATOR_CHAR);
        }

        let _ = write!(self.write, "<{}>", target);

        LinkAttributeWrite(self)
    }
}

/// Helper for writing link format attributes; created by calling
/// [`LinkFormatWrite::link`].
#[derive(Debug)]
pub struct LinkAttributeWrite<'a, 'b, T: ?Sized>(&'b mut LinkFormatWrite<'a, T>);

impl<'a, 'b, T: Write + ?Sized> LinkAttributeWrite<'a, 'b, T> {
    fn attr_key_eq(&mut self, key: &'static str) {
        debug_assert!(key
            .find(|c: char| c.is_ascii_whitespace() || c == '=')
            .is_none());

        let _ = self.0.write.write_char(ATTR_SEPARATOR_CHAR);
        let _ = self.0.write.write_str(key);
        let _ = self.0.write.write_char('=');
    }

    /// Adds a quoted string attribute to the link.
    pub fn attr(mut self, key: &'static str, value: &str) -> Self {
        self.attr_key_eq(key);

        let _ = self.0.write.write_char('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                let _ = self.0.write.write_char('\\');
            }
            let _ = self.0.write.write_char(c);
        }
        let _ = self.0.write.write_char('"');

        self
    }

    /// Adds an attribute with a `u16` value to the link.
    pub fn attr_u16(mut self, key: &'static str, value: u16) -> Self {
        self.attr_key_eq(key);
        let _ = write!(self.0.write, "{}", value);
        self
    }

    /// Adds a value-less flag attribute (such as `obs`) to the link.
    pub fn attr_flag(self, key: &'static str) -> Self {
        let _ = self.0.write.write_char(ATTR_SEPARATOR_CHAR);
        let _ = self.0.write.write_str(key);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_comma_separated() {
        let mut buffer = String::new();
        let mut write = LinkFormatWrite::new(&mut buffer);

        write.link("/temp").attr_u16(LINK_ATTR_CONTENT_FORMAT, 0).attr_flag(LINK_ATTR_OBSERVABLE);
        write.link("/config");

        assert_eq!(&buffer, "</temp>;ct=0;obs,</config>");
    }

    #[test]
    fn quoted_attributes_escape() {
        let mut buffer = String::new();
        let mut write = LinkFormatWrite::new(&mut buffer);

        write.link("/x").attr(LINK_ATTR_RESOURCE_TYPE, "a\"b");

        assert_eq!(&buffer, "</x>;rt=\"a\\\"b\"");
    }
}
