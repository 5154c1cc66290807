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

//! Maps non-duplicate requests onto resource operations.
//!
//! Dispatch is pure with respect to the wire: the returned message carries
//! code, options, and payload, and the server core finalizes its type,
//! message id, and token.

use super::observe::{ObserveLayer, ObserverId};
use crate::consts::{OBSERVE_DEREGISTER, OBSERVE_REGISTER, WELL_KNOWN_CORE_PATH};
use crate::content_format::ContentFormat;
use crate::link_format::{LinkFormatWrite, LINK_ATTR_CONTENT_FORMAT, LINK_ATTR_OBSERVABLE, LINK_ATTR_RESOURCE_TYPE};
use crate::message::{Message, Method, MsgCode, MsgType};
use crate::option::OptionNumber;
use crate::registry::ResourceRegistry;
use std::net::SocketAddr;

fn response(code: MsgCode) -> Message {
    Message::new(MsgType::Non, code)
}

fn content_response(payload: Vec<u8>, content_format: ContentFormat) -> Message {
    let mut msg = response(MsgCode::CONTENT);
    msg.insert_option_uint(OptionNumber::CONTENT_FORMAT, content_format.0 as u32);
    msg.set_payload(payload);
    msg
}

/// Builds the RFC6690 listing of every visible resource, or 4.04 when the
/// tree has none.
fn discover(registry: &dyn ResourceRegistry) -> Message {
    let mut listing = String::new();
    let mut write = LinkFormatWrite::new(&mut listing);
    let mut any = false;

    for resource in registry.resources() {
        if !resource.is_visible() {
            continue;
        }
        any = true;

        let mut link = write
            .link(resource.path())
            .attr_u16(LINK_ATTR_CONTENT_FORMAT, resource.content_format().0);
        if let Some(rt) = resource.resource_type() {
            link = link.attr(LINK_ATTR_RESOURCE_TYPE, rt);
        }
        if resource.is_observable() {
            link.attr_flag(LINK_ATTR_OBSERVABLE);
        }
    }

    if !any {
        return response(MsgCode::NOT_FOUND);
    }

    content_response(listing.into_bytes(), ContentFormat::APPLICATION_LINK_FORMAT)
}

fn handle_get(
    registry: &dyn ResourceRegistry,
    observe: &ObserveLayer,
    addr: SocketAddr,
    request: &Message,
    path: &str,
) -> Message {
    if path == WELL_KNOWN_CORE_PATH {
        return discover(registry);
    }

    let resource = match registry.lookup(path) {
        Some(resource) => resource,
        None => return response(MsgCode::NOT_FOUND),
    };

    let observer = ObserverId::new(addr, request.token());

    // Relations are keyed by the resource's normalized path.
    if request.observe() == Some(OBSERVE_DEREGISTER)
        && observe.deregister(resource.path(), &observer)
    {
        registry.unsubscribe(&resource, &observer);
    }

    let mut msg = match registry.get(&resource, request) {
        Ok((payload, content_format)) => content_response(payload, content_format),
        Err(code) => return response(code),
    };

    if request.observe() == Some(OBSERVE_REGISTER) && resource.is_observable() {
        observe.register(resource.path(), observer, request);
        registry.subscribe(&resource, &observer);
        msg.insert_option_uint(OptionNumber::OBSERVE, 0);
    }

    msg
}

fn handle_post(registry: &dyn ResourceRegistry, request: &Message, path: &str) -> Message {
    match registry.create(path, request) {
        Ok(resource) => {
            let mut msg = response(MsgCode::CREATED);
            msg.set_location_path(resource.path());
            msg
        }
        Err(code) => response(code),
    }
}

fn handle_put(registry: &dyn ResourceRegistry, request: &Message, path: &str) -> Message {
    let resource = match registry.lookup(path) {
        Some(resource) => resource,
        None => return response(MsgCode::NOT_FOUND),
    };

    match registry.update(&resource, request) {
        Ok((code, etag)) => {
            let mut msg = response(code);
            if let Some(etag) = etag {
                msg.insert_option(OptionNumber::ETAG, etag);
            }
            msg
        }
        Err(code) => response(code),
    }
}

fn handle_delete(registry: &dyn ResourceRegistry, request: &Message, path: &str) -> Message {
    let resource = match registry.lookup(path) {
        Some(resource) => resource,
        None => return response(MsgCode::NOT_FOUND),
    };

    response(registry.delete(&resource, request))
}

/// Dispatches a request to the matching resource operation and returns the
/// response core. Observer purging for deleted resources happens in the
/// server core, which watches for 2.02.
pub(crate) fn dispatch(
    registry: &dyn ResourceRegistry,
    observe: &ObserveLayer,
    addr: SocketAddr,
    request: &Message,
) -> Message {
    let path = request.uri_path();

    match Method::from_code(request.code()) {
        Some(Method::Get) => handle_get(registry, observe, addr, request, &path),
        Some(Method::Post) => handle_post(registry, request, &path),
        Some(Method::Put) => handle_put(registry, request, &path),
        Some(Method::Delete) => handle_delete(registry, request, &path),
        None => {
            warn!("Request method {} not allowed", request.code());
            response(MsgCode::METHOD_NOT_ALLOWED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgToken;
    use crate::registry::{MemoryRegistry, Resource};

    fn peer() -> SocketAddr {
        "192.0.2.9:40000".parse().unwrap()
    }

    fn request(code: MsgCode, path: &str) -> Message {
        let mut msg = Message::new(MsgType::Con, code);
        msg.set_msg_id(0x77);
        msg.set_token(MsgToken::new(b"rq"));
        msg.set_uri_path(path);
        msg
    }

    fn fixture() -> (MemoryRegistry, ObserveLayer) {
        let registry = MemoryRegistry::new();
        registry.insert(Resource::new("/foo").with_payload("hi"));
        registry.insert(
            Resource::new("/temp")
                .with_payload("20 C")
                .observable(true)
                .with_resource_type("temperature"),
        );
        (registry, ObserveLayer::new())
    }

    #[test]
    fn get_found() {
        let (registry, observe) = fixture();
        let msg = dispatch(&registry, &observe, peer(), &request(MsgCode::GET, "/foo"));

        assert_eq!(msg.code(), MsgCode::CONTENT);
        assert_eq!(msg.payload(), b"hi");
        assert_eq!(msg.content_format(), Some(ContentFormat::TEXT_PLAIN_UTF8));
    }

    #[test]
    fn get_missing_is_not_found() {
        let (registry, observe) = fixture();
        let msg = dispatch(&registry, &observe, peer(), &request(MsgCode::GET, "/nope"));
        assert_eq!(msg.code(), MsgCode::NOT_FOUND);
    }

    #[test]
    fn discovery_lists_visible_resources() {
        let (registry, observe) = fixture();
        registry.insert(Resource::new("/secret").visible(false));

        let msg = dispatch(
            &registry,
            &observe,
            peer(),
            &request(MsgCode::GET, "/.well-known/core"),
        );

        assert_eq!(msg.code(), MsgCode::CONTENT);
        assert_eq!(
            msg.content_format(),
            Some(ContentFormat::APPLICATION_LINK_FORMAT)
        );

        let listing = String::from_utf8(msg.payload().to_vec()).unwrap();
        assert_eq!(
            listing,
            "</foo>;ct=0,</temp>;ct=0;rt=\"temperature\";obs"
        );
    }

    #[test]
    fn discovery_of_an_empty_tree_is_not_found() {
        let registry = MemoryRegistry::new();
        let observe = ObserveLayer::new();

        let msg = dispatch(
            &registry,
            &observe,
            peer(),
            &request(MsgCode::GET, "/.well-known/core"),
        );
        assert_eq!(msg.code(), MsgCode::NOT_FOUND);
    }

    #[test]
    fn post_creates_with_location() {
        let (registry, observe) = fixture();

        let mut msg = request(MsgCode::POST, "/things/new");
        msg.set_payload(b"body".to_vec());

        let msg = dispatch(&registry, &observe, peer(), &msg);
        assert_eq!(msg.code(), MsgCode::CREATED);

        let segments: Vec<&[u8]> = msg
            .options()
            .iter()
            .filter(|(n, _)| *n == OptionNumber::LOCATION_PATH)
            .map(|(_, v)| v.as_slice())
            .collect();
        assert_eq!(segments, vec![b"things".as_ref(), b"new".as_ref()]);

        assert!(registry.lookup("/things/new").is_some());
    }

    #[test]
    fn put_updates_existing() {
        let (registry, observe) = fixture();

        let mut msg = request(MsgCode::PUT, "/foo");
        msg.set_payload(b"rewritten".to_vec());

        let msg = dispatch(&registry, &observe, peer(), &msg);
        assert_eq!(msg.code(), MsgCode::CHANGED);
        assert_eq!(registry.lookup("/foo").unwrap().payload(), b"rewritten");
    }

    #[test]
    fn put_missing_is_not_found() {
        let (registry, observe) = fixture();
        let msg = dispatch(&registry, &observe, peer(), &request(MsgCode::PUT, "/nope"));
        assert_eq!(msg.code(), MsgCode::NOT_FOUND);
    }

    #[test]
    fn delete_removes() {
        let (registry, observe) = fixture();
        let msg = dispatch(&registry, &observe, peer(), &request(MsgCode::DELETE, "/foo"));
        assert_eq!(msg.code(), MsgCode::DELETED);
        assert!(registry.lookup("/foo").is_none());
    }

    #[test]
    fn unknown_method_is_not_allowed() {
        let (registry, observe) = fixture();
        let msg = dispatch(&registry, &observe, peer(), &request(MsgCode(0x05), "/foo"));
        assert_eq!(msg.code(), MsgCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn observe_register_stores_a_relation() {
        let (registry, observe) = fixture();

        let mut msg = request(MsgCode::GET, "/temp");
        msg.insert_option_uint(OptionNumber::OBSERVE, OBSERVE_REGISTER);

        let reply = dispatch(&registry, &observe, peer(), &msg);
        assert_eq!(reply.code(), MsgCode::CONTENT);
        assert_eq!(reply.observe(), Some(0));
        assert_eq!(observe.count("/temp"), 1);
    }

    #[test]
    fn observe_register_on_plain_resource_is_ignored() {
        let (registry, observe) = fixture();

        let mut msg = request(MsgCode::GET, "/foo");
        msg.insert_option_uint(OptionNumber::OBSERVE, OBSERVE_REGISTER);

        let reply = dispatch(&registry, &observe, peer(), &msg);
        assert_eq!(reply.code(), MsgCode::CONTENT);
        assert_eq!(reply.observe(), None);
        assert_eq!(observe.count("/foo"), 0);
    }

    #[test]
    fn observe_deregister_removes_the_relation() {
        let (registry, observe) = fixture();

        let mut msg = request(MsgCode::GET, "/temp");
        msg.insert_option_uint(OptionNumber::OBSERVE, OBSERVE_REGISTER);
        dispatch(&registry, &observe, peer(), &msg);
        assert_eq!(observe.count("/temp"), 1);

        let mut msg = request(MsgCode::GET, "/temp");
        msg.insert_option_uint(OptionNumber::OBSERVE, OBSERVE_DEREGISTER);
        let reply = dispatch(&registry, &observe, peer(), &msg);

        assert_eq!(reply.code(), MsgCode::CONTENT);
        assert_eq!(reply.observe(), None);
        assert_eq!(observe.count("/temp"), 0);
    }
}
