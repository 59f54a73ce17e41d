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

//! Window segments and their write batches.
//!
//! A [Window] holds at most one row per [DimensionKey]. Rows are never written
//! directly: writers stage samples in a [WriteBatch] and the batch is applied
//! to the segment under the segment write lock on [WriteBatch::commit]. A
//! batch that is dropped without being committed leaves the segment untouched.
//!
//! Same-key conflicts are resolved by the sample timestamp (last write wins);
//! when timestamps are equal the write applied last wins.

use crate::sample::{DimensionKey, MetricSample, MetricValues, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Display};
use tracing::{debug, trace};

/// Opaque name of a segment, used to target it in further operations
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SegmentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Half-open validity range `[start, end)` of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowRange {
    start: Timestamp,
    end: Timestamp,
}

impl WindowRange {
    /// Returns `None` when `end` is before `start`
    pub const fn new(start: Timestamp, end: Timestamp) -> Option<Self> {
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    pub const fn start(&self) -> Timestamp {
        self.start
    }

    pub const fn end(&self) -> Timestamp {
        self.end
    }

    pub const fn duration(&self) -> Timestamp {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub const fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl Display for WindowRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// How a window came into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum WindowKind {
    /// Created by the store to collect samples of one collection interval
    Collection,
    /// Output of an alignment pass
    Aligned,
}

#[derive(Debug, Clone, PartialEq, strum_macros::Display)]
pub enum WindowError {
    #[strum(to_string = "window {0} is sealed and no longer accepts writes")]
    Sealed(SegmentId),
    #[strum(to_string = "timestamp {1} is outside of window {0} validity {2}")]
    OutOfWindow(SegmentId, Timestamp, WindowRange),
    #[strum(to_string = "metric {1} written to window {0} has a non-finite value")]
    NonFiniteValue(SegmentId, String),
}

impl std::error::Error for WindowError {}

#[derive(Debug, Clone, PartialEq)]
struct Row {
    metrics: MetricValues,
    timestamp: Timestamp,
}

/// Insert or overwrite the row for `dimensions`, unless the existing row
/// carries a newer timestamp. Returns true if the row was applied.
fn upsert(rows: &mut BTreeMap<DimensionKey, Row>, dimensions: DimensionKey, row: Row) -> bool {
    match rows.get_mut(&dimensions) {
        Some(existing) if existing.timestamp > row.timestamp => false,
        Some(existing) => {
            *existing = row;
            true
        }
        None => {
            rows.insert(dimensions, row);
            true
        }
    }
}

#[derive(Debug, Default)]
struct Segment {
    sealed: bool,
    rows: BTreeMap<DimensionKey, Row>,
}

/// A named segment holding the samples of one time window
#[derive(Debug)]
pub struct Window {
    id: SegmentId,
    range: WindowRange,
    kind: WindowKind,
    segment: RwLock<Segment>,
}

impl Window {
    pub(crate) fn new(id: SegmentId, range: WindowRange, kind: WindowKind) -> Self {
        Self {
            id,
            range,
            kind,
            segment: RwLock::new(Segment::default()),
        }
    }

    pub const fn id(&self) -> &SegmentId {
        &self.id
    }

    /// Name under which the segment is registered in the store
    pub fn table_name(&self) -> &str {
        self.id.as_str()
    }

    pub const fn range(&self) -> WindowRange {
        self.range
    }

    pub const fn kind(&self) -> WindowKind {
        self.kind
    }

    pub fn is_sealed(&self) -> bool {
        self.segment.read().sealed
    }

    /// Stop accepting writes. Returns true if this call sealed the window.
    pub fn seal(&self) -> bool {
        let mut segment = self.segment.write();
        if segment.sealed {
            false
        } else {
            debug!("[Window {}] sealed with {} rows", self.id, segment.rows.len());
            segment.sealed = true;
            true
        }
    }

    /// Acquire a write batch for this window. The batch can be shared between
    /// threads, its rows are applied in one step on [WriteBatch::commit].
    pub fn start_batch(&self) -> Result<WriteBatch<'_>, WindowError> {
        if self.is_sealed() {
            return Err(WindowError::Sealed(self.id.clone()));
        }
        Ok(WriteBatch {
            window: self,
            staged: Mutex::new(BTreeMap::new()),
        })
    }

    /// Write a single sample in its own batch
    pub fn put_metric(
        &self,
        dimensions: DimensionKey,
        metrics: MetricValues,
        timestamp: Timestamp,
    ) -> Result<(), WindowError> {
        let batch = self.start_batch()?;
        batch.put_metric(dimensions, metrics, timestamp)?;
        batch.commit().map(|_| ())
    }

    /// Snapshot of all committed rows ordered by dimension key
    pub fn fetch_all(&self) -> Vec<MetricSample> {
        let segment = self.segment.read();
        segment
            .rows
            .iter()
            .map(|(dimensions, row)| {
                MetricSample::new(dimensions.clone(), row.metrics.clone(), row.timestamp)
            })
            .collect()
    }

    pub fn get(&self, dimensions: &DimensionKey) -> Option<MetricSample> {
        let segment = self.segment.read();
        segment.rows.get(dimensions).map(|row| {
            MetricSample::new(dimensions.clone(), row.metrics.clone(), row.timestamp)
        })
    }

    pub fn len(&self) -> usize {
        self.segment.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segment.read().rows.is_empty()
    }

    fn apply(&self, staged: BTreeMap<DimensionKey, Row>) -> Result<usize, WindowError> {
        let mut segment = self.segment.write();
        if segment.sealed {
            return Err(WindowError::Sealed(self.id.clone()));
        }
        let staged_len = staged.len();
        let mut applied = 0;
        for (dimensions, row) in staged {
            if upsert(&mut segment.rows, dimensions, row) {
                applied += 1;
            }
        }
        trace!(
            "[Window {}] committed {applied} out of {staged_len} staged rows",
            self.id
        );
        Ok(applied)
    }
}

/// Scoped write batch of a [Window].
///
/// `put_metric` only takes `&self`, so a batch can be shared by several
/// writer threads. The batch is either applied completely by
/// [WriteBatch::commit] or discarded when dropped.
#[derive(Debug)]
pub struct WriteBatch<'a> {
    window: &'a Window,
    staged: Mutex<BTreeMap<DimensionKey, Row>>,
}

impl<'a> WriteBatch<'a> {
    pub const fn window(&self) -> &'a Window {
        self.window
    }

    /// Stage the sample for `dimensions`, overwriting a staged sample for the
    /// same key unless that one is newer.
    pub fn put_metric(
        &self,
        dimensions: DimensionKey,
        metrics: MetricValues,
        timestamp: Timestamp,
    ) -> Result<(), WindowError> {
        if !self.window.range.contains(timestamp) {
            return Err(WindowError::OutOfWindow(
                self.window.id.clone(),
                timestamp,
                self.window.range,
            ));
        }
        if let Some((name, _)) = metrics.iter().find(|(_, value)| !value.is_finite()) {
            return Err(WindowError::NonFiniteValue(
                self.window.id.clone(),
                name.clone(),
            ));
        }
        self.stage(dimensions, metrics, timestamp);
        Ok(())
    }

    /// Stage without validating the timestamp against the window range; used
    /// for aligned output where pass-through rows keep their own timestamps.
    pub(crate) fn stage(&self, dimensions: DimensionKey, metrics: MetricValues, timestamp: Timestamp) {
        let mut staged = self.staged.lock();
        upsert(&mut staged, dimensions, Row { metrics, timestamp });
    }

    pub fn len(&self) -> usize {
        self.staged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.lock().is_empty()
    }

    /// Apply all staged rows to the window, returns the number of rows that
    /// were written (rows older than the committed ones are skipped).
    pub fn commit(self) -> Result<usize, WindowError> {
        let staged = std::mem::take(&mut *self.staged.lock());
        self.window.apply(staged)
    }

    pub fn discard(self) {}
}

impl Drop for WriteBatch<'_> {
    fn drop(&mut self) {
        let staged = self.staged.get_mut();
        if !staged.is_empty() {
            debug!(
                "[Window {}] discarding {} uncommitted rows",
                self.window.id,
                staged.len()
            );
        }
    }
}
