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

//! The resource tree interface consumed by the server core, along with a
//! plain in-memory implementation suitable for tests and simple servers.

use crate::content_format::ContentFormat;
use crate::message::{Message, MsgCode};
use crate::server::observe::ObserverId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Normalizes a resource path to the form the tree is keyed by: a leading
/// slash, no trailing slash, no empty segments.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        normalized.push('/');
    }

    normalized
}

/// A served resource: path, content format, and the metadata the core needs
/// to list and observe it. The payload lives behind a lock so embedders can
/// mutate it and then call
/// [`CoapServer::notify`](crate::server::CoapServer::notify).
#[derive(Debug)]
pub struct Resource {
    path: String,
    content_format: ContentFormat,
    observable: bool,
    visible: bool,
    resource_type: Option<String>,
    payload: RwLock<Vec<u8>>,
}

impl Resource {
    /// Creates a new, visible, non-observable resource with an empty
    /// `text/plain` payload.
    pub fn new<P: Into<String>>(path: P) -> Resource {
        Resource {
            path: normalize_path(&path.into()),
            content_format: ContentFormat::TEXT_PLAIN_UTF8,
            observable: false,
            visible: true,
            resource_type: None,
            payload: RwLock::new(Vec::new()),
        }
    }

    /// Sets the initial payload.
    pub fn with_payload<P: Into<Vec<u8>>>(self, payload: P) -> Resource {
        *self.payload.write().expect("Lock failed") = payload.into();
        self
    }

    /// Sets the content format of the payload.
    pub fn with_content_format(mut self, content_format: ContentFormat) -> Resource {
        self.content_format = content_format;
        self
    }

    /// Marks this resource as observable (RFC7641).
    pub fn observable(mut self, observable: bool) -> Resource {
        self.observable = observable;
        self
    }

    /// Controls whether the resource is listed in `/.well-known/core`.
    pub fn visible(mut self, visible: bool) -> Resource {
        self.visible = visible;
        self
    }

    /// Sets the `rt` link attribute advertised for this resource.
    pub fn with_resource_type<S: Into<String>>(mut self, rt: S) -> Resource {
        self.resource_type = Some(rt.into());
        self
    }

    /// The normalized path of this resource.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The content format of the payload.
    pub fn content_format(&self) -> ContentFormat {
        self.content_format
    }

    /// Returns true if this resource accepts observe registrations.
    pub fn is_observable(&self) -> bool {
        self.observable
    }

    /// Returns true if this resource is listed in `/.well-known/core`.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// The `rt` link attribute, if one was set.
    pub fn resource_type(&self) -> Option<&str> {
        self.resource_type.as_deref()
    }

    /// Returns a copy of the current payload.
    pub fn payload(&self) -> Vec<u8> {
        self.payload.read().expect("Lock failed").clone()
    }

    /// Replaces the payload. Call
    /// [`CoapServer::notify`](crate::server::CoapServer::notify) afterwards
    /// to push the change to observers.
    pub fn set_payload<P: Into<Vec<u8>>>(&self, payload: P) {
        *self.payload.write().expect("Lock failed") = payload.into();
    }

    pub(crate) fn rewrite_path(&mut self, path: &str) {
        self.path = normalize_path(path);
    }
}

/// The resource tree consumed by the server core.
///
/// The core performs lookups and invokes the method handlers through this
/// trait; it never stores resources itself. Embedders either implement this
/// for their own storage or use [`MemoryRegistry`].
pub trait ResourceRegistry: Send + Sync + 'static {
    /// Looks up the resource serving `path` (normalized, leading slash).
    fn lookup(&self, path: &str) -> Option<Arc<Resource>>;

    /// Every resource in the tree, used to answer `/.well-known/core`.
    /// The core filters out resources that are not
    /// [visible](Resource::is_visible).
    fn resources(&self) -> Vec<Arc<Resource>>;

    /// Handles a GET: produces the representation of `resource`.
    fn get(
        &self,
        resource: &Resource,
        request: &Message,
    ) -> Result<(Vec<u8>, ContentFormat), MsgCode>;

    /// Handles a POST to `path`: creates (or replaces) a resource and
    /// returns it, or an error response code.
    fn create(&self, path: &str, request: &Message) -> Result<Arc<Resource>, MsgCode>;

    /// Handles a PUT to an existing resource. Returns the success response
    /// code (usually 2.04) and an optional ETag to echo, or an error
    /// response code.
    fn update(
        &self,
        resource: &Resource,
        request: &Message,
    ) -> Result<(MsgCode, Option<Vec<u8>>), MsgCode>;

    /// Handles a DELETE of an existing resource. Returns the response code
    /// (usually 2.02).
    fn delete(&self, resource: &Resource, request: &Message) -> MsgCode;

    /// Adds a resource during server setup, returning the shared handle.
    fn insert(&self, resource: Resource) -> Arc<Resource>;

    /// Informs the registry that an observer registered on `resource`.
    fn subscribe(&self, resource: &Resource, observer: &ObserverId) {
        let _ = (resource, observer);
    }

    /// Informs the registry that an observer was removed from `resource`.
    fn unsubscribe(&self, resource: &Resource, observer: &ObserverId) {
        let _ = (resource, observer);
    }
}

impl std::fmt::Debug for dyn ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ResourceRegistry")
    }
}

/// A plain `HashMap`-backed [`ResourceRegistry`].
///
/// GET serves the stored payload, POST creates payload-bearing resources,
/// PUT replaces the payload, DELETE removes the entry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    tree: RwLock<HashMap<String, Arc<Resource>>>,
}

impl MemoryRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> MemoryRegistry {
        MemoryRegistry {
            tree: RwLock::new(HashMap::new()),
        }
    }
}

impl ResourceRegistry for MemoryRegistry {
    fn lookup(&self, path: &str) -> Option<Arc<Resource>> {
        self.tree
            .read()
            .expect("Lock failed")
            .get(&normalize_path(path))
            .cloned()
    }

    fn resources(&self) -> Vec<Arc<Resource>> {
        let mut resources: Vec<Arc<Resource>> = self
            .tree
            .read()
            .expect("Lock failed")
            .values()
            .cloned()
            .collect();
        resources.sort_by(|a, b| a.path().cmp(b.path()));
        resources
    }

    fn get(
        &self,
        resource: &Resource,
        _request: &Message,
    ) -> Result<(Vec<u8>, ContentFormat), MsgCode> {
        Ok((resource.payload(), resource.content_format()))
    }

    fn create(&self, path: &str, request: &Message) -> Result<Arc<Resource>, MsgCode> {
        let resource = Resource::new(path)
            .with_payload(request.payload().to_vec())
            .with_content_format(
                request
                    .content_format()
                    .unwrap_or(ContentFormat::APPLICATION_OCTET_STREAM),
            );

        Ok(self.insert(resource))
    }

    fn update(
        &self,
        resource: &Resource,
        request: &Message,
    ) -> Result<(MsgCode, Option<Vec<u8>>), MsgCode> {
        resource.set_payload(request.payload().to_vec());
        Ok((MsgCode::CHANGED, None))
    }

    fn delete(&self, resource: &Resource, _request: &Message) -> MsgCode {
        self.tree
            .write()
            .expect("Lock failed")
            .remove(resource.path());
        MsgCode::DELETED
    }

    fn insert(&self, resource: Resource) -> Arc<Resource> {
        let resource = Arc::new(resource);
        self.tree
            .write()
            .expect("Lock failed")
            .insert(resource.path().to_string(), resource.clone());
        resource
    }
}
