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

//! Windowed metric storage for the RCA ingestion pipeline.
//!
//! The main components are:
//! - [window::Window]: a named segment holding at most one sample per
//!   dimension key, written through [window::WriteBatch]es that are applied
//!   atomically on commit.
//! - [store::WindowedMetricStore]: owns all segments, creates the collection
//!   window for a given timestamp and purges expired ones.
//! - [align::WindowAligner]: resamples two segments onto an arbitrary target
//!   range using time-weighted interpolation.
//!
//! Example usage:
//! ```rust
//! use rcaflow_metricsdb::{sample::dimensions, store::WindowedMetricStore};
//! use std::{collections::BTreeMap, time::Duration};
//!
//! let store = WindowedMetricStore::new(Duration::from_secs(5)).unwrap();
//! let window = store.window_for(7_000).unwrap();
//! let batch = window.start_batch().unwrap();
//! batch
//!     .put_metric(
//!         dimensions([("tid", "1")]),
//!         BTreeMap::from([("CPU_Utilization".to_string(), 2.5)]),
//!         7_000,
//!     )
//!     .unwrap();
//! batch.commit().unwrap();
//! assert_eq!(window.fetch_all().len(), 1);
//! ```

pub mod align;
pub mod sample;
pub mod store;
pub mod window;

pub use align::WindowAligner;
pub use sample::{DimensionKey, MetricSample, MetricValues, Timestamp};
pub use store::{StoreError, WindowedMetricStore};
pub use window::{SegmentId, Window, WindowError, WindowKind, WindowRange, WriteBatch};
