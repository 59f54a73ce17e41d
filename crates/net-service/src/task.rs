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

//! Processing of a single admitted flow unit on a pool worker.

use crate::{
    peer_state::PeerLivenessTracker,
    stats::{self, StatsSink},
    FlowUnit, PeerId,
};
use chrono::Utc;
use rcaflow_metricsdb::{
    DimensionKey, MetricValues, StoreError, Timestamp, WindowError, WindowedMetricStore,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, trace, warn};

/// One sample carried in a flow unit payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadSample {
    pub dimensions: DimensionKey,
    pub metrics: MetricValues,
    /// Overrides the timestamp of the payload for this sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// JSON document carried as the payload of a [FlowUnit]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowUnitPayload {
    pub timestamp: Timestamp,
    pub samples: Vec<PayloadSample>,
}

#[derive(Debug, strum_macros::Display)]
pub enum IngestionTaskError {
    #[strum(to_string = "unable to decode payload: {0}")]
    Decode(String),
    #[strum(to_string = "payload carries no samples")]
    EmptyPayload,
    #[strum(to_string = "unable to write samples: {0}")]
    Store(StoreError),
}

impl std::error::Error for IngestionTaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for IngestionTaskError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<WindowError> for IngestionTaskError {
    fn from(err: WindowError) -> Self {
        Self::Store(StoreError::Window(err))
    }
}

/// Collaborators shared by all ingestion tasks
#[derive(Debug, Clone)]
pub struct TaskContext {
    store: Arc<WindowedMetricStore>,
    liveness: Arc<dyn PeerLivenessTracker>,
    stats: Arc<dyn StatsSink>,
}

impl TaskContext {
    pub fn new(
        store: Arc<WindowedMetricStore>,
        liveness: Arc<dyn PeerLivenessTracker>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            store,
            liveness,
            stats,
        }
    }

    pub const fn store(&self) -> &Arc<WindowedMetricStore> {
        &self.store
    }

    pub fn stats(&self) -> &dyn StatsSink {
        self.stats.as_ref()
    }
}

/// Decode the payload of a flow unit. Metric values are validated by the
/// store when the samples are written.
pub fn decode_payload(flow_unit: &FlowUnit) -> Result<FlowUnitPayload, IngestionTaskError> {
    let payload: FlowUnitPayload = serde_json::from_slice(flow_unit.payload())
        .map_err(|err| IngestionTaskError::Decode(err.to_string()))?;
    if payload.samples.is_empty() {
        return Err(IngestionTaskError::EmptyPayload);
    }
    Ok(payload)
}

/// An admitted flow unit waiting for a worker. Executed once, never retried.
#[derive(Debug)]
pub struct IngestionTask {
    peer: PeerId,
    flow_unit: FlowUnit,
    context: TaskContext,
}

impl IngestionTask {
    pub const fn new(peer: PeerId, flow_unit: FlowUnit, context: TaskContext) -> Self {
        Self {
            peer,
            flow_unit,
            context,
        }
    }

    pub const fn peer(&self) -> PeerId {
        self.peer
    }

    pub const fn flow_unit(&self) -> &FlowUnit {
        &self.flow_unit
    }

    /// Execute the task. Failures are logged and counted, never returned.
    pub fn run(self) {
        let peer = self.peer;
        let graph_node = self.flow_unit.graph_node().to_string();
        let labels = [stats::graph_node_label(&graph_node)];
        let mut written = 0;
        let result = self.execute(&mut written);
        if written > 0 {
            self.context
                .stats
                .increment(stats::SAMPLES_WRITTEN, written as u64, &labels);
            self.context
                .liveness
                .record_contact(peer, &graph_node, Utc::now());
        }
        match result {
            Ok(()) => {
                trace!("[{peer}] graph node {graph_node}: committed {written} samples");
            }
            Err(err @ IngestionTaskError::Store(_)) => {
                warn!(
                    "[{peer}] graph node {graph_node}: dropping flow unit after committing {written} samples, {err}"
                );
                self.context.stats.increment(stats::STORE_ERROR, 1, &labels);
            }
            Err(err) => {
                debug!("[{peer}] graph node {graph_node}: dropping flow unit, {err}");
                self.context.stats.increment(stats::DECODE_ERROR, 1, &labels);
            }
        }
    }

    /// Write all the samples of the flow unit, one batch per window they
    /// fall into. Every batch is staged before the first one is committed,
    /// `written` counts the rows committed so far.
    fn execute(&self, written: &mut usize) -> Result<(), IngestionTaskError> {
        let payload = decode_payload(&self.flow_unit)?;
        let store = &self.context.store;
        let mut by_window = BTreeMap::<Timestamp, Vec<(Timestamp, PayloadSample)>>::new();
        for sample in payload.samples {
            let ts = sample.timestamp.unwrap_or(payload.timestamp);
            by_window
                .entry(store.collection_range(ts).start())
                .or_default()
                .push((ts, sample));
        }
        let windows = by_window
            .keys()
            .map(|window_start| store.window_for(*window_start))
            .collect::<Result<Vec<_>, _>>()?;
        let mut batches = Vec::with_capacity(windows.len());
        for (window, samples) in windows.iter().zip(by_window.into_values()) {
            let batch = window.start_batch()?;
            for (ts, sample) in samples {
                batch.put_metric(sample.dimensions, sample.metrics, ts)?;
            }
            batches.push(batch);
        }
        for batch in batches {
            *written += batch.commit()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{peer_state::NodeStateTracker, stats::test_utils::RecordingStatsSink};
    use bytes::Bytes;
    use rcaflow_metricsdb::sample::dimensions;
    use std::{net::SocketAddr, time::Duration};

    struct Fixture {
        store: Arc<WindowedMetricStore>,
        liveness: Arc<NodeStateTracker>,
        stats: Arc<RecordingStatsSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(WindowedMetricStore::new(Duration::from_secs(5)).unwrap()),
                liveness: Arc::new(NodeStateTracker::new()),
                stats: Arc::new(RecordingStatsSink::default()),
            }
        }

        fn context(&self) -> TaskContext {
            TaskContext::new(
                self.store.clone(),
                self.liveness.clone(),
                self.stats.clone(),
            )
        }
    }

    fn peer() -> PeerId {
        SocketAddr::from(([10, 0, 0, 1], 9650))
    }

    fn flow_unit(graph_node: &str, payload: &str) -> FlowUnit {
        FlowUnit::new(
            graph_node,
            Bytes::copy_from_slice(payload.as_bytes()),
            payload.len(),
        )
    }

    #[test]
    fn test_decode_payload() {
        let unit = flow_unit(
            "cpu",
            r#"{"timestamp": 7000, "samples": [
                {"dimensions": {"tid": "1"}, "metrics": {"CPU_Utilization": 2.5}},
                {"dimensions": {"tid": "2"}, "metrics": {"CPU_Utilization": 1.0}, "timestamp": 8000}
            ]}"#,
        );
        let payload = decode_payload(&unit).unwrap();
        assert_eq!(payload.timestamp, 7000);
        assert_eq!(payload.samples.len(), 2);
        assert_eq!(payload.samples[0].timestamp, None);
        assert_eq!(payload.samples[1].timestamp, Some(8000));

        assert!(matches!(
            decode_payload(&flow_unit("cpu", "not json")),
            Err(IngestionTaskError::Decode(_))
        ));
        assert!(matches!(
            decode_payload(&flow_unit("cpu", r#"{"timestamp": 1, "samples": []}"#)),
            Err(IngestionTaskError::EmptyPayload)
        ));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_run_writes_samples_and_records_contact() {
        let fixture = Fixture::new();
        let unit = flow_unit(
            "cpu",
            r#"{"timestamp": 7000, "samples": [
                {"dimensions": {"tid": "1"}, "metrics": {"CPU_Utilization": 2.5}},
                {"dimensions": {"tid": "2"}, "metrics": {"CPU_Utilization": 1.0}},
                {"dimensions": {"tid": "1"}, "metrics": {"CPU_Utilization": 4.0}, "timestamp": 12000}
            ]}"#,
        );
        IngestionTask::new(peer(), unit, fixture.context()).run();

        let first = fixture.store.window_for(7000).unwrap();
        assert_eq!(first.len(), 2);
        let row = first.get(&dimensions([("tid", "1")])).unwrap();
        assert_eq!(row.metric("CPU_Utilization"), Some(2.5));
        assert_eq!(row.timestamp(), 7000);

        let second = fixture.store.window_for(12000).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(
            second
                .get(&dimensions([("tid", "1")]))
                .unwrap()
                .metric("CPU_Utilization"),
            Some(4.0)
        );

        assert_eq!(fixture.stats.get(stats::SAMPLES_WRITTEN, Some("cpu")), 3);
        assert!(fixture.liveness.last_contact_for(&peer(), "cpu").is_some());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_run_counts_decode_errors() {
        let fixture = Fixture::new();
        IngestionTask::new(peer(), flow_unit("heap", "{"), fixture.context()).run();
        IngestionTask::new(
            peer(),
            flow_unit("heap", r#"{"timestamp": 1, "samples": []}"#),
            fixture.context(),
        )
        .run();
        assert_eq!(fixture.stats.get(stats::DECODE_ERROR, Some("heap")), 2);
        assert_eq!(fixture.stats.get(stats::SAMPLES_WRITTEN, Some("heap")), 0);
        assert!(fixture.store.windows().is_empty());
        assert!(fixture.liveness.peers().is_empty());
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_run_counts_store_errors() {
        let fixture = Fixture::new();
        let window = fixture.store.window_for(7000).unwrap();
        window.seal();
        let unit = flow_unit(
            "cpu",
            r#"{"timestamp": 7000, "samples": [
                {"dimensions": {"tid": "1"}, "metrics": {"CPU_Utilization": 2.5}}
            ]}"#,
        );
        IngestionTask::new(peer(), unit, fixture.context()).run();
        assert_eq!(fixture.stats.get(stats::STORE_ERROR, Some("cpu")), 1);
        assert!(window.is_empty());
        assert!(fixture.liveness.last_contact(&peer()).is_none());
        assert!(logs_contain("dropping flow unit"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_run_commits_nothing_when_a_later_window_is_sealed() {
        let fixture = Fixture::new();
        let earlier = fixture.store.window_for(7000).unwrap();
        fixture.store.window_for(12000).unwrap().seal();
        let unit = flow_unit(
            "cpu",
            r#"{"timestamp": 7000, "samples": [
                {"dimensions": {"tid": "1"}, "metrics": {"CPU_Utilization": 2.5}},
                {"dimensions": {"tid": "1"}, "metrics": {"CPU_Utilization": 4.0}, "timestamp": 12000}
            ]}"#,
        );
        IngestionTask::new(peer(), unit, fixture.context()).run();
        assert!(earlier.is_empty());
        assert_eq!(fixture.stats.get(stats::STORE_ERROR, Some("cpu")), 1);
        assert_eq!(fixture.stats.get(stats::SAMPLES_WRITTEN, Some("cpu")), 0);
        assert!(fixture.liveness.last_contact(&peer()).is_none());
        assert!(logs_contain("after committing 0 samples"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_run_rejects_out_of_range_numbers() {
        let fixture = Fixture::new();
        // Larger than any f64, rejected while decoding
        let unit = flow_unit(
            "cpu",
            r#"{"timestamp": 7000, "samples": [
                {"dimensions": {"tid": "1"}, "metrics": {"CPU_Utilization": 1e400}}
            ]}"#,
        );
        IngestionTask::new(peer(), unit, fixture.context()).run();
        assert_eq!(fixture.stats.get(stats::DECODE_ERROR, Some("cpu")), 1);
        assert!(fixture.store.windows().is_empty());
    }
}
