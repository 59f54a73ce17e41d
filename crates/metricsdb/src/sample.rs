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

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Ordered set of categorical labels (e.g. thread id, thread name)
/// identifying a metric series within a window.
pub type DimensionKey = BTreeMap<String, String>;

/// Metric name to value mapping of a single sample
pub type MetricValues = BTreeMap<String, f64>;

/// Build a [DimensionKey] from string pairs
pub fn dimensions<K, V, I>(pairs: I) -> DimensionKey
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// A single row of a window: the latest values reported for one dimension
/// key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    dimensions: DimensionKey,
    metrics: MetricValues,
    timestamp: Timestamp,
}

impl MetricSample {
    pub const fn new(dimensions: DimensionKey, metrics: MetricValues, timestamp: Timestamp) -> Self {
        Self {
            dimensions,
            metrics,
            timestamp,
        }
    }

    pub const fn dimensions(&self) -> &DimensionKey {
        &self.dimensions
    }

    pub const fn metrics(&self) -> &MetricValues {
        &self.metrics
    }

    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions.get(name).map(String::as_str)
    }

    pub fn into_parts(self) -> (DimensionKey, MetricValues, Timestamp) {
        (self.dimensions, self.metrics, self.timestamp)
    }
}
