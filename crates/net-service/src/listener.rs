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

//! Publish Listener Actor Module
//!
//! The `PublishListenerActor` accepts the TCP streams opened by remote nodes
//! and serves every stream in its own task:
//!
//! 1. The peer's response channel is registered in the
//!    [PeerStreamRegistry]. Peers connecting after the node started shutting
//!    down are answered with `NODE_SHUTDOWN` right away.
//! 2. Inbound frames are decoded with the [FlowUnitCodec] and handed to the
//!    [IngestionDispatcher].
//! 3. Statuses queued on the response channel are written back by a writer
//!    task, which closes the write side of the stream once the channel is
//!    closed.
//!
//! The actor itself is controlled through [PublishListenerActorHandle]. On
//! shutdown it broadcasts `NODE_SHUTDOWN` to all registered peers and waits
//! (bounded by a timeout) for their streams to close.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use rcaflow_metricsdb::WindowedMetricStore;
//! use rcaflow_net_service::{
//!     dispatcher::{IngestionDispatcher, WorkerPool},
//!     listener::PublishListenerActorHandle,
//!     peer_state::NodeStateTracker,
//!     registry::PeerStreamRegistry,
//!     stats::OtelStatsSink,
//!     task::TaskContext,
//! };
//! use std::{net::SocketAddr, sync::Arc, time::Duration};
//!
//! #[tokio::main]
//! async fn main() {
//!     let addr: SocketAddr = "127.0.0.1:9650".parse().unwrap();
//!     let store = Arc::new(WindowedMetricStore::new(Duration::from_secs(5)).unwrap());
//!     let meter = opentelemetry::global::meter("my-library-name");
//!     let context = TaskContext::new(
//!         store,
//!         Arc::new(NodeStateTracker::new()),
//!         Arc::new(OtelStatsSink::new(meter)),
//!     );
//!     let dispatcher = Arc::new(IngestionDispatcher::new(context));
//!     dispatcher.install_pool(Arc::new(WorkerPool::new(1, 4, 1000).unwrap()));
//!     let (join_handle, actor_handle) = PublishListenerActorHandle::new(
//!         1,
//!         addr,
//!         100,
//!         4 * 1024 * 1024,
//!         Duration::from_secs(5),
//!         PeerStreamRegistry::new(),
//!         dispatcher,
//!     )
//!     .await
//!     .expect("Failed to create PublishListenerActor");
//!
//!     // Tell all connected peers that the node is going down
//!     actor_handle
//!         .shutdown()
//!         .await
//!         .expect("Failed to shut down actor");
//!     join_handle
//!         .await
//!         .expect("Actor failed")
//!         .expect("actor failed");
//! }
//! ```

use crate::{
    codec::{FlowUnitCodec, PublishResponseCodec, PublishResponseCodecError},
    dispatcher::IngestionDispatcher,
    registry::{
        create_response_channel, PeerChannel, PeerStreamRegistry, ResponseReceiver,
    },
    stats,
    stream::{StreamAction, StreamEvent},
    ActorId, PeerId, PublishResponseStatus,
};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, trace, warn};

/// Commands that can be sent to the [PublishListenerActor].
#[derive(Debug, Clone, strum_macros::Display)]
pub(crate) enum PublishListenerActorCommand {
    /// Notify all peers and shut down the actor
    Shutdown(mpsc::Sender<ActorId>),
    LocalAddr(mpsc::Sender<(ActorId, SocketAddr)>),
    PeersCount(mpsc::Sender<(ActorId, usize)>),
}

/// Errors that can occur in the `PublishListenerActor`.
#[derive(Debug, strum_macros::Display)]
pub enum PublishListenerActorError {
    #[strum(to_string = "[Actor {0}-{1}] failed to bind to socket address {1}: {2}")]
    SocketBindError(ActorId, SocketAddr, std::io::Error),
    #[strum(to_string = "[Actor {0}-{1}] failed to get local address: {2}")]
    GetLocalAddressError(ActorId, SocketAddr, std::io::Error),
    #[strum(to_string = "[Actor {0}-{1}] command channel closed")]
    CommandChannelClosed(ActorId, SocketAddr),
}

impl std::error::Error for PublishListenerActorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SocketBindError(_, _, err) => Some(err),
            Self::GetLocalAddressError(_, _, err) => Some(err),
            Self::CommandChannelClosed(_, _) => None,
        }
    }
}

/// Drain the response channel of a peer onto its stream, then close the
/// write side of the stream.
async fn write_responses(
    write_half: OwnedWriteHalf,
    mut rx: ResponseReceiver,
) -> Result<(), PublishResponseCodecError> {
    let mut sink = FramedWrite::new(write_half, PublishResponseCodec);
    while let Some(status) = rx.recv().await {
        sink.send(status).await?;
    }
    sink.close().await
}

/// Serve one peer stream from registration until the stream is closed
async fn serve_peer(
    actor_id: ActorId,
    socket_addr: SocketAddr,
    peer: PeerId,
    socket: TcpStream,
    max_frame_size: usize,
    registry: PeerStreamRegistry,
    dispatcher: Arc<IngestionDispatcher>,
) {
    let (tx, rx) = create_response_channel();
    let registration = match registry.register(PeerChannel::new(peer, tx)) {
        Ok(registration) => registration,
        Err(err) => {
            info!("[Actor {actor_id}-{socket_addr}] {err}");
            let (_, write_half) = socket.into_split();
            let mut sink = FramedWrite::new(write_half, PublishResponseCodec);
            if let Err(err) = sink.send(PublishResponseStatus::NodeShutdown).await {
                debug!("[Actor {actor_id}-{socket_addr}] [{peer}] unable to reject peer: {err}");
            }
            let _ = sink.close().await;
            return;
        }
    };
    let stream_error_labels = [opentelemetry::KeyValue::new(
        stats::PEER_ADDRESS_LABEL,
        format!("{}", peer.ip()),
    )];
    let channel = registration.channel().clone();
    let (read_half, write_half) = socket.into_split();
    let mut frames = FramedRead::new(read_half, FlowUnitCodec::new(max_frame_size));
    let mut writer = tokio::spawn(write_responses(write_half, rx));
    let mut writer_result = None;

    loop {
        tokio::select! {
            biased;
            ret = &mut writer => {
                writer_result = Some(ret);
                break;
            }
            next = frames.next() => {
                match next {
                    Some(Ok(flow_unit)) => {
                        if channel.apply(StreamEvent::Next) == StreamAction::Submit {
                            trace!(
                                "[Actor {actor_id}-{socket_addr}] [{peer}] received {} bytes from graph node {}",
                                flow_unit.serialized_size(),
                                flow_unit.graph_node()
                            );
                            dispatcher.submit(peer, flow_unit);
                        }
                    }
                    Some(Err(err)) => {
                        warn!("[Actor {actor_id}-{socket_addr}] [{peer}] terminating stream on error: {err}");
                        dispatcher
                            .context()
                            .stats()
                            .increment(stats::STREAM_ERROR, 1, &stream_error_labels);
                        channel.apply(StreamEvent::Error);
                        break;
                    }
                    None => {
                        debug!("[Actor {actor_id}-{socket_addr}] [{peer}] peer completed its stream");
                        channel.apply(StreamEvent::Completed);
                        break;
                    }
                }
            }
        }
    }

    let writer_result = match writer_result {
        Some(ret) => ret,
        None => writer.await,
    };
    match writer_result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!("[Actor {actor_id}-{socket_addr}] [{peer}] unable to write response: {err}");
            dispatcher
                .context()
                .stats()
                .increment(stats::STREAM_ERROR, 1, &stream_error_labels);
            channel.apply(StreamEvent::Error);
        }
        Err(err) => {
            error!("[Actor {actor_id}-{socket_addr}] [{peer}] response writer failed: {err}");
            channel.apply(StreamEvent::Error);
        }
    }
    channel.apply(StreamEvent::Flushed);
    registration.deregister();
    debug!("[Actor {actor_id}-{socket_addr}] [{peer}] stream closed");
}

/// Actor owning the TCP listener the peers publish to.
#[derive(Debug)]
struct PublishListenerActor {
    actor_id: ActorId,
    socket_addr: SocketAddr,
    cmd_rx: mpsc::Receiver<PublishListenerActorCommand>,
    max_frame_size: usize,
    shutdown_timeout: Duration,
    registry: PeerStreamRegistry,
    dispatcher: Arc<IngestionDispatcher>,
    connections: JoinSet<()>,
}

impl PublishListenerActor {
    fn new(
        actor_id: ActorId,
        socket_addr: SocketAddr,
        cmd_rx: mpsc::Receiver<PublishListenerActorCommand>,
        max_frame_size: usize,
        shutdown_timeout: Duration,
        registry: PeerStreamRegistry,
        dispatcher: Arc<IngestionDispatcher>,
    ) -> Self {
        Self {
            actor_id,
            socket_addr,
            cmd_rx,
            max_frame_size,
            shutdown_timeout,
            registry,
            dispatcher,
            connections: JoinSet::new(),
        }
    }

    fn handle_accept(&mut self, peer: PeerId, socket: TcpStream) {
        debug!(
            "[Actor {}-{}] accepted connection from {peer}",
            self.actor_id, self.socket_addr
        );
        if let Err(err) = socket.set_nodelay(true) {
            debug!(
                "[Actor {}-{}] [{peer}] unable to set TCP_NODELAY: {err}",
                self.actor_id, self.socket_addr
            );
        }
        self.connections.spawn(serve_peer(
            self.actor_id,
            self.socket_addr,
            peer,
            socket,
            self.max_frame_size,
            self.registry.clone(),
            self.dispatcher.clone(),
        ));
    }

    async fn handle_shutdown(&mut self, tx: mpsc::Sender<ActorId>) -> bool {
        info!(
            "[Actor {}-{}] Received shutdown command, notifying connected peers",
            self.actor_id, self.socket_addr
        );
        let notified = self
            .registry
            .broadcast_shutdown(PublishResponseStatus::NodeShutdown);
        let connections = &mut self.connections;
        let drained = tokio::time::timeout(self.shutdown_timeout, async move {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "[Actor {}-{}] {} peer streams did not close within {:?}, aborting them",
                self.actor_id,
                self.socket_addr,
                self.connections.len(),
                self.shutdown_timeout
            );
            self.connections.shutdown().await;
        }
        info!(
            "[Actor {}-{}] Notified {notified} peers, shutting down",
            self.actor_id, self.socket_addr
        );
        let _ = tx.send(self.actor_id).await;
        true
    }

    async fn handle_local_addr(&self, tx: mpsc::Sender<(ActorId, SocketAddr)>) -> bool {
        if let Err(err) = tx.send((self.actor_id, self.socket_addr)).await {
            error!(
                "[Actor {}-{}] Unable to send back the local address: {err}",
                self.actor_id, self.socket_addr
            );
        }
        false
    }

    async fn handle_peers_count(&self, tx: mpsc::Sender<(ActorId, usize)>) -> bool {
        if let Err(err) = tx.send((self.actor_id, self.registry.len())).await {
            error!(
                "[Actor {}-{}] Unable to send back the number of peers: {err}",
                self.actor_id, self.socket_addr
            );
        }
        false
    }

    async fn handle_cmd(
        &mut self,
        cmd: Option<PublishListenerActorCommand>,
    ) -> Result<bool, PublishListenerActorError> {
        let cmd_result = match cmd {
            Some(PublishListenerActorCommand::Shutdown(tx)) => self.handle_shutdown(tx).await,
            Some(PublishListenerActorCommand::LocalAddr(tx)) => self.handle_local_addr(tx).await,
            Some(PublishListenerActorCommand::PeersCount(tx)) => {
                self.handle_peers_count(tx).await
            }
            None => {
                warn!(
                    "[Actor {}-{}] Command channel is closed, shutting down actor",
                    self.actor_id, self.socket_addr
                );
                self.registry
                    .broadcast_shutdown(PublishResponseStatus::NodeShutdown);
                return Err(PublishListenerActorError::CommandChannelClosed(
                    self.actor_id,
                    self.socket_addr,
                ));
            }
        };
        Ok(cmd_result)
    }

    async fn run(mut self) -> Result<(ActorId, SocketAddr), PublishListenerActorError> {
        let actor_id = self.actor_id;
        let socket_addr = self.socket_addr;
        info!("[Actor {actor_id}-{socket_addr}] Spawning Actor and binding TCP listener");
        let listener = match TcpListener::bind(socket_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("[Actor {actor_id}-{socket_addr}] Error binding TCP listener: {err}");
                return Err(PublishListenerActorError::SocketBindError(
                    actor_id,
                    socket_addr,
                    err,
                ));
            }
        };
        // Get the local address of the socket, handy in cases where the port is 0
        self.socket_addr = listener.local_addr().map_err(|err| {
            PublishListenerActorError::GetLocalAddressError(actor_id, socket_addr, err)
        })?;
        let socket_addr = self.socket_addr;
        loop {
            tokio::select! {
                biased; // Prioritize command messages
                cmd = self.cmd_rx.recv() => {
                    match self.handle_cmd(cmd).await {
                        Ok(true) => return Ok((actor_id, socket_addr)),
                        Ok(false) => {}
                        Err(err) => return Err(err),
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => self.handle_accept(peer, socket),
                        Err(err) => {
                            // Typically running out of file descriptors, keep serving the
                            // established streams
                            warn!("[Actor {actor_id}-{socket_addr}] Error accepting connection: {err}");
                        }
                    }
                }
                Some(ret) = self.connections.join_next(), if !self.connections.is_empty() => {
                    if let Err(err) = ret {
                        error!("[Actor {actor_id}-{socket_addr}] peer stream task failed: {err}");
                    }
                }
            }
        }
    }
}

#[derive(Debug, strum_macros::Display)]
pub enum PublishListenerActorHandleError {
    #[strum(to_string = "Error sending command to actor")]
    SendError,
    #[strum(to_string = "Error receiving response from actor")]
    ReceiveError,
}

impl std::error::Error for PublishListenerActorHandleError {}

/// A handle is the public interface for interacting with a
/// `PublishListenerActor`.
#[derive(Debug, Clone)]
pub struct PublishListenerActorHandle {
    actor_id: ActorId,
    local_addr: SocketAddr,
    cmd_buffer_size: usize,
    cmd_tx: mpsc::Sender<PublishListenerActorCommand>,
}

impl PublishListenerActorHandle {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        actor_id: ActorId,
        socket_addr: SocketAddr,
        cmd_buffer_size: usize,
        max_frame_size: usize,
        shutdown_timeout: Duration,
        registry: PeerStreamRegistry,
        dispatcher: Arc<IngestionDispatcher>,
    ) -> Result<
        (
            JoinHandle<Result<(ActorId, SocketAddr), PublishListenerActorError>>,
            Self,
        ),
        PublishListenerActorHandleError,
    > {
        let (cmd_tx, cmd_rx) = mpsc::channel(cmd_buffer_size);
        let actor = PublishListenerActor::new(
            actor_id,
            socket_addr,
            cmd_rx,
            max_frame_size,
            shutdown_timeout,
            registry,
            dispatcher,
        );
        let join_handle = tokio::spawn(actor.run());
        let (tx, mut rx) = mpsc::channel(cmd_buffer_size);
        cmd_tx
            .send(PublishListenerActorCommand::LocalAddr(tx))
            .await
            .map_err(|_| PublishListenerActorHandleError::SendError)?;
        let local_addr = rx
            .recv()
            .await
            .ok_or(PublishListenerActorHandleError::ReceiveError)?
            .1;
        Ok((
            join_handle,
            Self {
                actor_id,
                local_addr,
                cmd_buffer_size,
                cmd_tx,
            },
        ))
    }

    pub const fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&self) -> Result<Vec<ActorId>, PublishListenerActorHandleError> {
        let (tx, mut rx) = mpsc::channel(self.cmd_buffer_size);
        self.cmd_tx
            .send(PublishListenerActorCommand::Shutdown(tx))
            .await
            .map_err(|_| PublishListenerActorHandleError::SendError)?;
        let mut actors = vec![];
        while let Some(actor_id) = rx.recv().await {
            actors.push(actor_id);
        }
        Ok(actors)
    }

    /// Number of peers with a registered publish stream
    pub async fn peers_count(&self) -> Result<usize, PublishListenerActorHandleError> {
        let (tx, mut rx) = mpsc::channel(self.cmd_buffer_size);
        self.cmd_tx
            .send(PublishListenerActorCommand::PeersCount(tx))
            .await
            .map_err(|_| PublishListenerActorHandleError::SendError)?;
        rx.recv()
            .await
            .map(|(_, count)| count)
            .ok_or(PublishListenerActorHandleError::ReceiveError)
    }
}
