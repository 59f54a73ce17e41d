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

//! Wiring of the ingestion node: the windowed metric store, the dispatcher
//! and its worker pool, and the publish listener, plus the housekeeping
//! around them (window retention, configuration reload and graceful
//! shutdown).

pub mod config;
pub mod telemetry;

use crate::config::{AgentConfig, IngestionConfig, StoreConfig};
use chrono::{TimeDelta, Utc};
use opentelemetry::metrics::Meter;
use rcaflow_metricsdb::{SegmentId, WindowedMetricStore};
use rcaflow_net_service::{
    dispatcher::{IngestionDispatcher, WorkerPool},
    listener::{PublishListenerActorError, PublishListenerActorHandle},
    peer_state::NodeStateTracker,
    registry::PeerStreamRegistry,
    stats::OtelStatsSink,
    task::TaskContext,
    ActorId, PeerId,
};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};

const LISTENER_ACTOR_ID: ActorId = 1;

type ListenerJoinHandle = JoinHandle<Result<(ActorId, SocketAddr), PublishListenerActorError>>;

pub fn init_tracing(level: &str) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::from_str(level)?)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// The running ingestion node
#[derive(Debug)]
pub struct IngestionRuntime {
    ingestion: IngestionConfig,
    store: Arc<WindowedMetricStore>,
    liveness: Arc<NodeStateTracker>,
    dispatcher: Arc<IngestionDispatcher>,
    listener: PublishListenerActorHandle,
    listener_join: ListenerJoinHandle,
    next_pool_id: u64,
}

impl IngestionRuntime {
    /// Create the store and the worker pool, then start accepting peers
    pub async fn start(
        ingestion: IngestionConfig,
        store_config: &StoreConfig,
        meter: Meter,
    ) -> anyhow::Result<Self> {
        ingestion.validate()?;
        store_config.validate()?;
        let store = Arc::new(WindowedMetricStore::new(store_config.window_duration)?);
        let liveness = Arc::new(NodeStateTracker::new());
        let context = TaskContext::new(
            store.clone(),
            liveness.clone(),
            Arc::new(OtelStatsSink::new(meter)),
        );
        let dispatcher = Arc::new(IngestionDispatcher::new(context));
        let pool = WorkerPool::new(1, ingestion.workers, ingestion.queue_capacity)?;
        dispatcher.install_pool(Arc::new(pool));

        let (listener_join, listener) = PublishListenerActorHandle::new(
            LISTENER_ACTOR_ID,
            ingestion.listener.address,
            ingestion.cmd_buffer_size,
            ingestion.max_frame_size,
            ingestion.shutdown_timeout,
            PeerStreamRegistry::new(),
            dispatcher.clone(),
        )
        .await?;
        info!(
            "Accepting flow units on {} with {} workers and a queue of {}",
            listener.local_addr(),
            ingestion.workers,
            ingestion.queue_capacity
        );
        Ok(Self {
            ingestion,
            store,
            liveness,
            dispatcher,
            listener,
            listener_join,
            next_pool_id: 2,
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub const fn store(&self) -> &Arc<WindowedMetricStore> {
        &self.store
    }

    pub const fn liveness(&self) -> &Arc<NodeStateTracker> {
        &self.liveness
    }

    pub const fn dispatcher(&self) -> &Arc<IngestionDispatcher> {
        &self.dispatcher
    }

    pub const fn ingestion_config(&self) -> &IngestionConfig {
        &self.ingestion
    }

    /// Apply a reloaded ingestion configuration. When the pool dimensions
    /// changed, a new pool is installed and the previous one is returned so
    /// the caller can wait for its queued tasks. Listener settings only take
    /// effect on restart.
    pub fn apply_ingestion_config(
        &mut self,
        ingestion: IngestionConfig,
    ) -> anyhow::Result<Option<Arc<WorkerPool>>> {
        ingestion.validate()?;
        if ingestion.listener != self.ingestion.listener
            || ingestion.max_frame_size != self.ingestion.max_frame_size
            || ingestion.cmd_buffer_size != self.ingestion.cmd_buffer_size
            || ingestion.shutdown_timeout != self.ingestion.shutdown_timeout
        {
            warn!("Listener configuration changed, restart the agent to apply it");
        }
        if !self.ingestion.pool_changed(&ingestion) {
            debug!("Worker pool configuration unchanged");
            return Ok(None);
        }
        let pool = WorkerPool::new(
            self.next_pool_id,
            ingestion.workers,
            ingestion.queue_capacity,
        )?;
        self.next_pool_id += 1;
        info!(
            "Replacing worker pool: {} workers and a queue of {}",
            ingestion.workers, ingestion.queue_capacity
        );
        let previous = self.dispatcher.install_pool(Arc::new(pool));
        self.ingestion.workers = ingestion.workers;
        self.ingestion.queue_capacity = ingestion.queue_capacity;
        Ok(previous)
    }

    /// Drop the collection windows and forget the peers that are older than
    /// `retention`
    pub fn purge_expired(&self, retention: Duration) -> (Vec<SegmentId>, Vec<PeerId>) {
        let now = Utc::now();
        let retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        let cutoff = now
            .timestamp_millis()
            .saturating_sub(retention.num_milliseconds());
        let windows = self.store.purge_before(cutoff);
        let peers = self.liveness.purge_inactive(now, retention);
        (windows, peers)
    }

    /// Notify the peers, stop the listener, then let the workers drain the
    /// tasks that were already admitted
    pub async fn shutdown(self) -> anyhow::Result<()> {
        match self.listener.shutdown().await {
            Ok(actors) => info!("Publish listener actors {actors:?} shut down"),
            Err(err) => warn!("Publish listener already stopped: {err}"),
        }
        match self.listener_join.await {
            Ok(Ok((actor_id, addr))) => debug!("[Actor {actor_id}-{addr}] terminated"),
            Ok(Err(err)) => error!("Publish listener terminated with an error: {err}"),
            Err(err) => error!("Publish listener task failed: {err}"),
        }
        let dispatcher = self.dispatcher.clone();
        tokio::task::spawn_blocking(move || dispatcher.shutdown()).await?;
        let counts = self.dispatcher.counts();
        info!(
            "Ingestion stopped, accepted: {}, rejected: {}, not ready: {}",
            counts.accepted, counts.rejected, counts.not_ready
        );
        Ok(())
    }
}

/// SIGHUP stream, never fires on platforms without unix signals
struct ReloadSignal {
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl ReloadSignal {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            hangup: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> Option<()> {
        #[cfg(unix)]
        {
            self.hangup.recv().await
        }
        #[cfg(not(unix))]
        {
            std::future::pending().await
        }
    }
}

fn reload_config(
    path: &Path,
    runtime: &mut IngestionRuntime,
    store_config: &mut StoreConfig,
) -> anyhow::Result<()> {
    let config = AgentConfig::load(path)?;
    if config.store.window_duration != store_config.window_duration
        || config.store.purge_interval != store_config.purge_interval
    {
        warn!("Window duration and purge interval only take effect on restart");
    }
    store_config.retention = config.store.retention;
    if let Some(previous) = runtime.apply_ingestion_config(config.ingestion)? {
        // Tasks admitted to the previous pool still run to completion
        tokio::task::spawn_blocking(move || {
            previous.join();
            info!("[Pool {}] drained and stopped", previous.id());
        });
    }
    Ok(())
}

/// Run the node until a termination signal is received
pub async fn run(config_path: PathBuf, config: AgentConfig) -> anyhow::Result<()> {
    let provider = match &config.telemetry {
        Some(telemetry) => Some(telemetry::init_meter_provider(telemetry)?),
        None => None,
    };
    let mut store_config = config.store.clone();
    let mut runtime =
        IngestionRuntime::start(config.ingestion, &store_config, telemetry::meter()).await?;

    let mut purge_interval = tokio::time::interval(store_config.purge_interval);
    purge_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut reload = ReloadSignal::new()?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            biased;
            _ = &mut ctrl_c => {
                info!("Termination signal received, gracefully shutting down");
                break;
            }
            Some(()) = reload.recv() => {
                info!("Reloading configuration from {}", config_path.display());
                if let Err(err) = reload_config(&config_path, &mut runtime, &mut store_config) {
                    error!("Failed to reload configuration, keeping the current one: {err}");
                }
            }
            _ = purge_interval.tick() => {
                runtime.purge_expired(store_config.retention);
            }
        }
    }
    runtime.shutdown().await?;
    if let Some(provider) = provider {
        tokio::task::spawn_blocking(move || telemetry::shutdown_meter_provider(provider)).await?;
    }
    Ok(())
}
