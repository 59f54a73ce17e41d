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

use opentelemetry::{
    metrics::{Counter, Meter},
    KeyValue,
};
use parking_lot::RwLock;
use std::{collections::HashMap, fmt::Debug};

pub const BYTES_IN: &str = "rcaflow.net.bytes_in";
pub const QUEUE_FULL: &str = "rcaflow.net.threadpool.queue_full";
pub const NOT_READY: &str = "rcaflow.net.not_ready";
pub const DECODE_ERROR: &str = "rcaflow.net.task.decode_error";
pub const STORE_ERROR: &str = "rcaflow.net.task.store_error";
pub const SAMPLES_WRITTEN: &str = "rcaflow.net.task.samples_written";
pub const STREAM_ERROR: &str = "rcaflow.net.stream.error";

pub const GRAPH_NODE_LABEL: &str = "rcaflow.graph_node";
pub const PEER_ADDRESS_LABEL: &str = "network.peer.address";

pub fn graph_node_label(graph_node: &str) -> KeyValue {
    KeyValue::new(GRAPH_NODE_LABEL, graph_node.to_string())
}

/// Capability used by the ingestion path to aggregate counters
pub trait StatsSink: Debug + Send + Sync {
    fn increment(&self, name: &'static str, value: u64, labels: &[KeyValue]);
}

fn describe(name: &str) -> &'static str {
    match name {
        BYTES_IN => "Number of bytes of flow units accepted for ingestion",
        QUEUE_FULL => "Number of flow units dropped because the worker pool queue is full",
        NOT_READY => "Number of flow units dropped because no worker pool is installed",
        DECODE_ERROR => "Number of flow units with a payload that could not be decoded",
        STORE_ERROR => "Number of flow units that failed to be written to the metric store",
        SAMPLES_WRITTEN => "Number of metric samples committed to the metric store",
        STREAM_ERROR => "Number of peer streams terminated by an error",
        _ => "rcaflow ingestion counter",
    }
}

/// [StatsSink] backed by opentelemetry counters, created on first use
pub struct OtelStatsSink {
    meter: Meter,
    counters: RwLock<HashMap<&'static str, Counter<u64>>>,
}

impl OtelStatsSink {
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            counters: RwLock::new(HashMap::new()),
        }
    }

    fn counter(&self, name: &'static str) -> Counter<u64> {
        if let Some(counter) = self.counters.read().get(name) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(name)
            .or_insert_with(|| {
                self.meter
                    .u64_counter(name)
                    .with_description(describe(name))
                    .build()
            })
            .clone()
    }
}

impl Debug for OtelStatsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelStatsSink")
            .field("counters", &self.counters.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StatsSink for OtelStatsSink {
    fn increment(&self, name: &'static str, value: u64, labels: &[KeyValue]) {
        self.counter(name).add(value, labels);
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use parking_lot::Mutex;

    /// Records every increment, used to assert on the counters in tests
    #[derive(Debug, Default)]
    pub(crate) struct RecordingStatsSink {
        counts: Mutex<HashMap<(&'static str, Option<String>), u64>>,
    }

    impl RecordingStatsSink {
        pub(crate) fn get(&self, name: &'static str, graph_node: Option<&str>) -> u64 {
            self.counts
                .lock()
                .get(&(name, graph_node.map(str::to_string)))
                .copied()
                .unwrap_or_default()
        }
    }

    impl StatsSink for RecordingStatsSink {
        fn increment(&self, name: &'static str, value: u64, labels: &[KeyValue]) {
            let graph_node = labels
                .iter()
                .find(|kv| kv.key.as_str() == GRAPH_NODE_LABEL)
                .map(|kv| kv.value.as_str().to_string());
            *self.counts.lock().entry((name, graph_node)).or_default() += value;
        }
    }
}
