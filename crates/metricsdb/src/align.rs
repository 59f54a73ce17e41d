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

//! Resampling of two windows onto an arbitrary target range.
//!
//! Each input window is represented by the timestamp of its earliest sample.
//! With `t1 < t2` the representative timestamps of the earlier and the later
//! window, a dimension key present in both windows is merged per metric as:
//!
//! ```text
//!     w_earlier = (t2 - target_end) / (t2 - t1)
//!     w_later   = (target_end - t1) / (t2 - t1)
//!     value     = earlier * w_earlier + later * w_later
//! ```
//!
//! Both weights are clamped to `[0, 1]`, so a target ending before `t1`
//! yields the earlier sample and a target ending after `t2` yields the later
//! one. Windows represented by the same timestamp are averaged. Keys present
//! in only one window are passed through unchanged.

use crate::{
    sample::{DimensionKey, MetricSample, MetricValues, Timestamp},
    window::{Window, WindowRange},
};
use std::collections::BTreeMap;
use tracing::trace;

/// Weights `(earlier, later)` of a series sampled at `t1` in the earlier
/// window and at `t2 >= t1` in the later window, aligned onto a target range
/// ending at `target_end`.
pub fn interpolation_weights(t1: Timestamp, t2: Timestamp, target_end: Timestamp) -> (f64, f64) {
    if t1 == t2 {
        return (0.5, 0.5);
    }
    // f64 arithmetic, the differences may not fit in an i64
    let span = t2 as f64 - t1 as f64;
    (
        ((t2 as f64 - target_end as f64) / span).clamp(0.0, 1.0),
        ((target_end as f64 - t1 as f64) / span).clamp(0.0, 1.0),
    )
}

/// Timestamp standing for a whole window: its earliest sample
pub fn representative_timestamp(samples: &[MetricSample]) -> Option<Timestamp> {
    samples.iter().map(MetricSample::timestamp).min()
}

/// Stateless aligner of two windows onto a target range
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowAligner;

impl WindowAligner {
    /// Seal both windows and compute the aligned rows, ordered by dimension
    /// key. The result covers the union of the keys of both windows.
    pub fn align(first: &Window, second: &Window, target: WindowRange) -> Vec<MetricSample> {
        first.seal();
        second.seal();
        let aligned = Self::align_samples(first.fetch_all(), second.fetch_all(), target);
        trace!(
            "Aligned windows {} and {} onto {target}: {} rows",
            first.id(),
            second.id(),
            aligned.len()
        );
        aligned
    }

    pub fn align_samples(
        first: Vec<MetricSample>,
        second: Vec<MetricSample>,
        target: WindowRange,
    ) -> Vec<MetricSample> {
        // On equal representative timestamps the first window is the earlier
        let (second_is_earlier, weights) =
            match (representative_timestamp(&first), representative_timestamp(&second)) {
                (Some(t_first), Some(t_second)) if t_second < t_first => {
                    (true, interpolation_weights(t_second, t_first, target.end()))
                }
                (Some(t_first), Some(t_second)) => {
                    (false, interpolation_weights(t_first, t_second, target.end()))
                }
                // No key can be present in both windows
                _ => (false, (0.5, 0.5)),
            };

        let mut pairs: BTreeMap<DimensionKey, (Option<MetricSample>, Option<MetricSample>)> =
            BTreeMap::new();
        for sample in first {
            let key = sample.dimensions().clone();
            pairs.entry(key).or_default().0 = Some(sample);
        }
        for sample in second {
            let key = sample.dimensions().clone();
            pairs.entry(key).or_default().1 = Some(sample);
        }
        pairs
            .into_values()
            .filter_map(|pair| match pair {
                (Some(first), Some(second)) if second_is_earlier => {
                    Some(Self::merge(second, first, weights, target.end()))
                }
                (Some(first), Some(second)) => {
                    Some(Self::merge(first, second, weights, target.end()))
                }
                (Some(only), None) | (None, Some(only)) => Some(only),
                (None, None) => None,
            })
            .collect()
    }

    /// Weighted merge of two samples of the same series, stamped with
    /// `timestamp`.
    ///
    /// A zero weight passes the other sample through unchanged. Metrics
    /// reported by only one of the samples are copied from it.
    pub fn merge(
        earlier: MetricSample,
        later: MetricSample,
        (earlier_weight, later_weight): (f64, f64),
        timestamp: Timestamp,
    ) -> MetricSample {
        if later_weight == 0.0 {
            return earlier;
        }
        if earlier_weight == 0.0 {
            return later;
        }
        let (dimensions, earlier_metrics, _) = earlier.into_parts();
        let (_, mut later_metrics, _) = later.into_parts();
        let mut merged = MetricValues::new();
        for (name, earlier_value) in earlier_metrics {
            let value = match later_metrics.remove(&name) {
                Some(later_value) => earlier_value * earlier_weight + later_value * later_weight,
                None => earlier_value,
            };
            merged.insert(name, value);
        }
        merged.extend(later_metrics);
        MetricSample::new(dimensions, merged, timestamp)
    }
}
