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

//! Block-wise transfer coordination, per
//! [IETF-RFC7959](https://tools.ietf.org/html/rfc7959).
//!
//! Inbound requests are intercepted twice: once before dispatch (Block1
//! reassembly and Block2 continuations served from the session cache) and
//! once after (slicing oversize response bodies).

use crate::block::BlockInfo;
use crate::consts::{MAX_PAYLOAD, MAX_REQUEST_BODY};
use crate::content_format::ContentFormat;
use crate::message::{Message, MsgCode, MsgToken, MsgType};
use crate::option::OptionNumber;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Which end of the transfer a session belongs to. Block1 (request body)
/// and Block2 (response body) sessions never share a key, even for the same
/// token.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) enum BlockRole {
    Block1,
    Block2,
}

/// Key of the block-wise session table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct BlockKey {
    pub addr: SocketAddr,
    pub token: MsgToken,
    pub role: BlockRole,
}

#[derive(Debug)]
enum BlockState {
    /// A request body under Block1 reassembly.
    Assembling {
        buffer: Vec<u8>,
        next_num: u32,
        szx: u8,
        at: Instant,
    },

    /// A response body being served out in Block2 slices.
    Serving {
        payload: Vec<u8>,
        code: MsgCode,
        content_format: Option<ContentFormat>,
        szx: u8,
        at: Instant,
    },
}

impl BlockState {
    fn at(&self) -> Instant {
        match self {
            BlockState::Assembling { at, .. } => *at,
            BlockState::Serving { at, .. } => *at,
        }
    }
}

/// What to do with an intercepted request.
#[derive(Debug)]
pub(crate) enum RequestDisposition {
    /// Hand the (possibly reassembled) request to the dispatcher. When the
    /// request closed a Block1 session, `block1_echo` is the option the
    /// final response must carry.
    Forward {
        request: Message,
        block1_echo: Option<BlockInfo>,
    },

    /// Reply immediately; no handler runs. The caller finalizes type,
    /// message id, and token.
    Respond(Message),
}

fn error_response(code: MsgCode) -> Message {
    Message::new(MsgType::Non, code)
}

/// The block-wise session table and slicing policy.
#[derive(Debug)]
pub(crate) struct BlockwiseLayer {
    preferred_szx: u8,
    sessions: Mutex<HashMap<BlockKey, BlockState>>,
}

impl BlockwiseLayer {
    pub fn new(preferred_szx: u8) -> BlockwiseLayer {
        BlockwiseLayer {
            preferred_szx: preferred_szx.min(BlockInfo::SZX_MAX),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Inspects an inbound request before dispatch.
    pub fn intercept_request(&self, addr: SocketAddr, request: &Message) -> RequestDisposition {
        if let Some(block1) = request.block1() {
            return self.handle_block1(addr, request, block1);
        }

        if let Some(block2) = request.block2() {
            if block2.num() > 0 {
                if let Some(disposition) = self.serve_block2_slice(addr, request, block2) {
                    return disposition;
                }
                // No session (the client may have rotated its token): fall
                // through and let the handler produce a fresh body to slice.
            }
        }

        RequestDisposition::Forward {
            request: request.clone(),
            block1_echo: None,
        }
    }

    fn handle_block1(
        &self,
        addr: SocketAddr,
        request: &Message,
        block1: BlockInfo,
    ) -> RequestDisposition {
        let key = BlockKey {
            addr,
            token: request.token(),
            role: BlockRole::Block1,
        };

        let mut sessions = self.sessions.lock().expect("Lock failed");

        if block1.num() == 0 {
            sessions.insert(
                key,
                BlockState::Assembling {
                    buffer: Vec::new(),
                    next_num: 0,
                    szx: block1.szx(),
                    at: Instant::now(),
                },
            );
        }

        enum Assembly {
            Reject(MsgCode),
            Continue(u8),
            Complete(u8),
        }

        let assembly = match sessions.get_mut(&key) {
            // A non-initial block with no session to append to.
            None => Assembly::Reject(MsgCode::REQUEST_ENTITY_INCOMPLETE),
            Some(BlockState::Serving { .. }) => {
                unreachable!("Block1 key holds a Block2 session")
            }
            Some(BlockState::Assembling {
                buffer,
                next_num,
                szx,
                at,
            }) => {
                *at = Instant::now();

                // The block size may only shrink over the course of a
                // session, and every non-final block must be exactly the
                // negotiated size.
                if block1.num() != *next_num
                    || block1.szx() > *szx
                    || (block1.more() && request.payload().len() != block1.len())
                {
                    Assembly::Reject(MsgCode::REQUEST_ENTITY_INCOMPLETE)
                } else {
                    *szx = block1.szx();
                    buffer.extend_from_slice(request.payload());

                    if buffer.len() > MAX_REQUEST_BODY {
                        Assembly::Reject(MsgCode::REQUEST_ENTITY_TOO_LARGE)
                    } else if block1.more() {
                        *next_num += 1;
                        Assembly::Continue(*szx)
                    } else {
                        Assembly::Complete(*szx)
                    }
                }
            }
        };

        match assembly {
            Assembly::Reject(code) => {
                sessions.remove(&key);
                RequestDisposition::Respond(error_response(code))
            }
            Assembly::Continue(szx) => {
                let echo = BlockInfo::new(block1.num(), true, szx).expect("Block fields checked");
                let mut response = Message::new(MsgType::Non, MsgCode::CONTINUE);
                response.insert_option_block(OptionNumber::BLOCK1, echo);
                RequestDisposition::Respond(response)
            }
            Assembly::Complete(szx) => {
                let buffer = match sessions.remove(&key) {
                    Some(BlockState::Assembling { buffer, .. }) => buffer,
                    _ => unreachable!("Session vanished while locked"),
                };

                let mut assembled = request.clone();
                assembled.remove_option(OptionNumber::BLOCK1);
                assembled.set_payload(buffer);

                RequestDisposition::Forward {
                    request: assembled,
                    block1_echo: Some(
                        BlockInfo::new(block1.num(), false, szx).expect("Block fields checked"),
                    ),
                }
            }
        }
    }

    /// Serves block `num > 0` of a cached response body, if a session is
    /// live for this token.
    fn serve_block2_slice(
        &self,
        addr: SocketAddr,
        request: &Message,
        block2: BlockInfo,
    ) -> Option<RequestDisposition> {
        let key = BlockKey {
            addr,
            token: request.token(),
            role: BlockRole::Block2,
        };

        let mut sessions = self.sessions.lock().expect("Lock failed");

        enum Cached {
            Miss,
            Renegotiated,
            Hit(Vec<u8>, MsgCode, Option<ContentFormat>, u8),
        }

        let cached = match sessions.get_mut(&key) {
            None => Cached::Miss,
            Some(BlockState::Assembling { .. }) => {
                unreachable!("Block2 key holds a Block1 session")
            }
            Some(BlockState::Serving {
                payload,
                code,
                content_format,
                szx,
                at,
            }) => {
                if block2.szx() != *szx {
                    // The client renegotiated mid-transfer; drop the cache
                    // and serve statelessly from a fresh handler run.
                    Cached::Renegotiated
                } else {
                    *at = Instant::now();
                    Cached::Hit(payload.clone(), *code, *content_format, *szx)
                }
            }
        };

        let (payload, code, content_format, szx) = match cached {
            Cached::Miss => return None,
            Cached::Renegotiated => {
                sessions.remove(&key);
                return None;
            }
            Cached::Hit(payload, code, content_format, szx) => {
                (payload, code, content_format, szx)
            }
        };

        let size = block2.len();
        let offset = block2.offset();

        if offset >= payload.len() {
            sessions.remove(&key);
            return Some(RequestDisposition::Respond(error_response(
                MsgCode::BAD_OPTION,
            )));
        }

        let end = (offset + size).min(payload.len());
        let more = end < payload.len();

        if !more {
            sessions.remove(&key);
        }

        let mut response = Message::new(MsgType::Non, code);
        if let Some(content_format) = content_format {
            response.insert_option_uint(OptionNumber::CONTENT_FORMAT, content_format.0 as u32);
        }
        response.insert_option_block(
            OptionNumber::BLOCK2,
            BlockInfo::new(block2.num(), more, szx).expect("Block fields checked"),
        );
        response.set_payload(payload[offset..end].to_vec());

        Some(RequestDisposition::Respond(response))
    }

    /// Inspects a dispatched response before it is finalized: echoes the
    /// final Block1 option and slices oversize bodies into a Block2
    /// session.
    pub fn intercept_response(
        &self,
        addr: SocketAddr,
        request: &Message,
        mut response: Message,
        block1_echo: Option<BlockInfo>,
    ) -> Message {
        if let Some(echo) = block1_echo {
            response.insert_option_block(OptionNumber::BLOCK1, echo);
        }

        if !response.code().is_success() {
            return response;
        }

        let requested = request.block2();
        let len = response.payload().len();

        if len <= MAX_PAYLOAD && requested.is_none() {
            return response;
        }

        let szx = match requested {
            Some(block2) => block2.szx().min(self.preferred_szx),
            None => self.preferred_szx,
        };
        let size = 1usize << (szx + 4);

        if len <= size && requested.map(|b| b.num()).unwrap_or(0) == 0 {
            // Fits in a single block; confirm the negotiated size.
            if requested.is_some() {
                response.insert_option_block(
                    OptionNumber::BLOCK2,
                    BlockInfo::new(0, false, szx).expect("szx is clamped"),
                );
            }
            return response;
        }

        let num = requested.map(|b| b.num()).unwrap_or(0);
        let offset = num as usize * size;

        if offset >= len {
            return error_response(MsgCode::BAD_OPTION);
        }

        let end = (offset + size).min(len);
        let more = end < len;

        let key = BlockKey {
            addr,
            token: request.token(),
            role: BlockRole::Block2,
        };

        let mut sessions = self.sessions.lock().expect("Lock failed");
        if more {
            sessions.insert(
                key,
                BlockState::Serving {
                    payload: response.payload().to_vec(),
                    code: response.code(),
                    content_format: response.content_format(),
                    szx,
                    at: Instant::now(),
                },
            );
        } else {
            sessions.remove(&key);
        }
        drop(sessions);

        let slice = response.payload()[offset..end].to_vec();
        response.insert_option_block(
            OptionNumber::BLOCK2,
            BlockInfo::new(num, more, szx).expect("szx is clamped"),
        );
        if num == 0 {
            response.insert_option_uint(OptionNumber::SIZE2, len as u32);
        }
        response.set_payload(slice);

        response
    }

    /// Drops sessions that have seen no traffic for `max_age`. Runs from
    /// the purge job.
    pub fn purge_stale(&self, max_age: Duration) {
        let now = Instant::now();
        self.sessions
            .lock()
            .expect("Lock failed")
            .retain(|_, state| now.duration_since(state.at()) < max_age);
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.lock().expect("Lock failed").len()
    }
}
