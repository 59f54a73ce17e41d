// Copyright (C) 2026-present The rcaflow Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ingestion of flow units streamed by remote RCA nodes.
//!
//! Peers open a long-lived TCP stream to the [listener::PublishListenerActor]
//! and publish [FlowUnit] frames on it. Every frame is handed to the
//! [dispatcher::IngestionDispatcher], which admits it to a bounded worker pool
//! or drops it when the pool is saturated. Admitted frames are executed as
//! [task::IngestionTask]s that write the carried samples into the windowed
//! metric store.
//!
//! Each peer's response channel is kept in the
//! [registry::PeerStreamRegistry], so the node can notify all connected peers
//! when it shuts down.

pub mod codec;
pub mod dispatcher;
pub mod listener;
pub mod peer_state;
pub mod registry;
pub mod stats;
pub mod stream;
pub mod task;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, net::SocketAddr};

pub type ActorId = u32;

/// Identity of a connected peer
pub type PeerId = SocketAddr;

/// A message published by a remote node: the graph node that produced it and
/// its opaque serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowUnit {
    graph_node: String,
    payload: Bytes,
    serialized_size: usize,
}

impl FlowUnit {
    pub fn new(graph_node: impl Into<String>, payload: Bytes, serialized_size: usize) -> Self {
        Self {
            graph_node: graph_node.into(),
            payload,
            serialized_size,
        }
    }

    pub fn graph_node(&self) -> &str {
        self.graph_node.as_str()
    }

    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size of the message on the wire, used for throughput accounting
    pub const fn serialized_size(&self) -> usize {
        self.serialized_size
    }
}

/// Status sent back to a peer on its response channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PublishResponseStatus {
    Success = 0,
    NodeShutdown = 1,
}

impl Display for PublishResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::NodeShutdown => write!(f, "NODE_SHUTDOWN"),
        }
    }
}

impl From<PublishResponseStatus> for u8 {
    fn from(value: PublishResponseStatus) -> Self {
        value as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndefinedPublishResponseStatus(pub u8);

impl TryFrom<u8> for PublishResponseStatus {
    type Error = UndefinedPublishResponseStatus;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::NodeShutdown),
            other => Err(UndefinedPublishResponseStatus(other)),
        }
    }
}
