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

//! Registry of the response channels of all connected peers.
//!
//! The registry only supports registering a channel, tearing down a single
//! registration and terminating all channels at once. All mutations and the
//! shutdown broadcast are serialized by a single lock, so a peer that connects
//! while the node is shutting down is either notified or rejected, never
//! forgotten.

use crate::{
    stream::{StreamAction, StreamEvent, StreamState},
    PeerId, PublishResponseStatus,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

pub type ResponseSender = mpsc::Sender<PublishResponseStatus>;
pub type ResponseReceiver = mpsc::Receiver<PublishResponseStatus>;

/// Create the response channel of a peer. A stream carries at most one
/// terminal status, so there is no need for a deeper buffer.
pub fn create_response_channel() -> (ResponseSender, ResponseReceiver) {
    mpsc::channel(1)
}

#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum RegistryError {
    #[strum(to_string = "registry is shut down, rejecting peer {0}")]
    ShuttingDown(PeerId),
}

impl std::error::Error for RegistryError {}

#[derive(Debug)]
struct ChannelState {
    state: StreamState,
    tx: Option<ResponseSender>,
}

/// Response side of one peer stream, guarded by the stream state machine.
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct PeerChannel {
    peer: PeerId,
    inner: Arc<Mutex<ChannelState>>,
}

impl PeerChannel {
    pub fn new(peer: PeerId, tx: ResponseSender) -> Self {
        Self {
            peer,
            inner: Arc::new(Mutex::new(ChannelState {
                state: StreamState::Open,
                tx: Some(tx),
            })),
        }
    }

    pub const fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Advance the stream state machine and perform the resulting action on
    /// the response channel. Never blocks: a status that cannot be queued is
    /// dropped.
    pub fn apply(&self, event: StreamEvent) -> StreamAction {
        let mut inner = self.inner.lock();
        let (next, action) = inner.state.transition(event);
        if inner.state != next {
            trace!("[{}] stream {} -> {next} on {event}", self.peer, inner.state);
        }
        inner.state = next;
        match action {
            StreamAction::Respond(status) => {
                if let Some(tx) = inner.tx.take() {
                    if let Err(err) = tx.try_send(status) {
                        debug!(
                            "[{}] unable to send {status}, peer already went away: {err}",
                            self.peer
                        );
                    }
                }
            }
            StreamAction::Close => {
                inner.tx.take();
            }
            StreamAction::Submit | StreamAction::Ignore => {}
        }
        action
    }
}

#[derive(Debug)]
struct RegistryState {
    next_id: u64,
    accepting: bool,
    channels: BTreeMap<u64, PeerChannel>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            next_id: 0,
            accepting: true,
            channels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerStreamRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl PeerStreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: PeerChannel) -> Result<Registration, RegistryError> {
        let mut inner = self.inner.lock();
        if !inner.accepting {
            return Err(RegistryError::ShuttingDown(channel.peer()));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.channels.insert(id, channel.clone());
        debug!(
            "[{}] registered response channel, {} peers connected",
            channel.peer(),
            inner.channels.len()
        );
        Ok(Registration {
            id,
            channel,
            registry: Some(Arc::downgrade(&self.inner)),
        })
    }

    /// Send `status` to every registered peer, close all the channels and
    /// stop accepting new registrations.
    ///
    /// Returns the number of peers that were sent the status. Peers that are
    /// already completing their stream are closed without a status.
    pub fn broadcast_shutdown(&self, status: PublishResponseStatus) -> usize {
        let mut inner = self.inner.lock();
        inner.accepting = false;
        let channels = std::mem::take(&mut inner.channels);
        let total = channels.len();
        let notified = channels
            .into_values()
            .filter(|channel| {
                matches!(
                    channel.apply(StreamEvent::Shutdown(status)),
                    StreamAction::Respond(_)
                )
            })
            .count();
        if total > 0 {
            info!("Sent {status} to {notified} out of {total} connected peers");
        }
        notified
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lock().accepting
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().channels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().channels.len()
    }
}

/// Entry of one peer in the [PeerStreamRegistry], removed from the registry
/// on [Registration::deregister] or when dropped.
#[derive(Debug)]
pub struct Registration {
    id: u64,
    channel: PeerChannel,
    registry: Option<Weak<Mutex<RegistryState>>>,
}

impl Registration {
    pub const fn channel(&self) -> &PeerChannel {
        &self.channel
    }

    pub fn deregister(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            if registry.lock().channels.remove(&self.id).is_some() {
                debug!("[{}] response channel deregistered", self.channel.peer());
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.remove();
    }
}
