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

use crate::{
    align::WindowAligner,
    sample::Timestamp,
    window::{SegmentId, Window, WindowError, WindowKind, WindowRange},
};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, strum_macros::Display)]
pub enum StoreError {
    #[strum(to_string = "window duration must be between one millisecond and i64::MAX milliseconds")]
    InvalidWindowDuration(Duration),
    #[strum(to_string = "no segment named {0}")]
    UnknownSegment(SegmentId),
    #[strum(to_string = "a segment named {0} already exists")]
    DuplicateSegment(SegmentId),
    #[strum(to_string = "invalid target range [{0}, {1})")]
    InvalidTargetRange(Timestamp, Timestamp),
    #[strum(to_string = "{0}")]
    Window(WindowError),
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Window(err) => Some(err),
            _ => None,
        }
    }
}

impl From<WindowError> for StoreError {
    fn from(value: WindowError) -> Self {
        Self::Window(value)
    }
}

/// Holds one segment per collection window plus the segments produced by
/// alignment passes.
///
/// Collection windows are aligned on multiples of the configured window
/// duration and named after their start timestamp.
#[derive(Debug)]
pub struct WindowedMetricStore {
    window_duration: Timestamp,
    windows: RwLock<BTreeMap<SegmentId, Arc<Window>>>,
}

impl WindowedMetricStore {
    pub fn new(window_duration: Duration) -> Result<Self, StoreError> {
        let millis = Timestamp::try_from(window_duration.as_millis())
            .map_err(|_| StoreError::InvalidWindowDuration(window_duration))?;
        if millis < 1 {
            return Err(StoreError::InvalidWindowDuration(window_duration));
        }
        Ok(Self {
            window_duration: millis,
            windows: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration as u64)
    }

    /// Validity range of the collection window containing `ts`
    pub fn collection_range(&self, ts: Timestamp) -> WindowRange {
        // Saturate instead of overflowing for timestamps at the edges of i64,
        // the last window must still be non-empty
        let start = ts
            .saturating_sub(ts.rem_euclid(self.window_duration))
            .min(Timestamp::MAX - self.window_duration);
        WindowRange::new(start, start.saturating_add(self.window_duration))
            .expect("window duration is always positive")
    }

    /// Get or create the collection window containing `ts`
    pub fn window_for(&self, ts: Timestamp) -> Result<Arc<Window>, StoreError> {
        let range = self.collection_range(ts);
        let id = SegmentId::from(format!("{}", range.start()));
        if let Some(window) = self.windows.read().get(&id) {
            return Self::check_collection(window, &id);
        }
        let mut windows = self.windows.write();
        let window = windows.entry(id.clone()).or_insert_with(|| {
            debug!("Creating collection window {id} for {range}");
            Arc::new(Window::new(id.clone(), range, WindowKind::Collection))
        });
        Self::check_collection(window, &id)
    }

    fn check_collection(window: &Arc<Window>, id: &SegmentId) -> Result<Arc<Window>, StoreError> {
        if window.kind() == WindowKind::Collection {
            Ok(window.clone())
        } else {
            Err(StoreError::DuplicateSegment(id.clone()))
        }
    }

    /// Create an empty, explicitly named window
    pub fn create_window(
        &self,
        name: impl Into<SegmentId>,
        range: WindowRange,
    ) -> Result<Arc<Window>, StoreError> {
        self.insert(name.into(), range, WindowKind::Aligned)
    }

    fn insert(
        &self,
        id: SegmentId,
        range: WindowRange,
        kind: WindowKind,
    ) -> Result<Arc<Window>, StoreError> {
        let mut windows = self.windows.write();
        if windows.contains_key(&id) {
            return Err(StoreError::DuplicateSegment(id));
        }
        let window = Arc::new(Window::new(id.clone(), range, kind));
        windows.insert(id, window.clone());
        Ok(window)
    }

    pub fn window(&self, id: &SegmentId) -> Option<Arc<Window>> {
        self.windows.read().get(id).cloned()
    }

    /// All windows ordered by segment name
    pub fn windows(&self) -> Vec<Arc<Window>> {
        self.windows.read().values().cloned().collect()
    }

    pub fn drop_window(&self, id: &SegmentId) -> Option<Arc<Window>> {
        self.windows.write().remove(id)
    }

    /// Remove the collection windows whose validity ends at or before `ts`.
    /// Aligned windows are kept until dropped explicitly.
    pub fn purge_before(&self, ts: Timestamp) -> Vec<SegmentId> {
        let mut purged = vec![];
        self.windows.write().retain(|id, window| {
            if window.kind() == WindowKind::Collection && window.range().end() <= ts {
                purged.push(id.clone());
                false
            } else {
                true
            }
        });
        if !purged.is_empty() {
            info!("Purged {} expired windows older than {ts}", purged.len());
        }
        purged
    }

    /// Align `first` and `second` onto `[target_start, target_end)` and store
    /// the result in a new window named `output`.
    ///
    /// Both inputs are sealed by the alignment.
    pub fn align_window(
        &self,
        first: &SegmentId,
        second: &SegmentId,
        output: impl Into<SegmentId>,
        target_start: Timestamp,
        target_end: Timestamp,
    ) -> Result<Arc<Window>, StoreError> {
        let output = output.into();
        let target = WindowRange::new(target_start, target_end)
            .ok_or(StoreError::InvalidTargetRange(target_start, target_end))?;
        let first = self
            .window(first)
            .ok_or_else(|| StoreError::UnknownSegment(first.clone()))?;
        let second = self
            .window(second)
            .ok_or_else(|| StoreError::UnknownSegment(second.clone()))?;
        if self.windows.read().contains_key(&output) {
            return Err(StoreError::DuplicateSegment(output));
        }

        let aligned = WindowAligner::align(&first, &second, target);
        let window = Window::new(output.clone(), target, WindowKind::Aligned);
        let batch = window.start_batch()?;
        for sample in aligned {
            let (dimensions, metrics, ts) = sample.into_parts();
            batch.stage(dimensions, metrics, ts);
        }
        batch.commit()?;

        let mut windows = self.windows.write();
        if windows.contains_key(&output) {
            return Err(StoreError::DuplicateSegment(output));
        }
        let window = Arc::new(window);
        windows.insert(output, window.clone());
        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{dimensions, MetricSample, MetricValues};
    use std::collections::BTreeMap;

    const CPU: &str = "CPU_Utilization";
    const RSS: &str = "Paging_RSS";

    fn metrics(cpu: f64) -> MetricValues {
        BTreeMap::from([(CPU.to_string(), cpu), (RSS.to_string(), 3.63)])
    }

    fn thread(tid: &str) -> crate::sample::DimensionKey {
        dimensions([("tid", tid), ("tName", "dummy thread")])
    }

    fn assert_close(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("metric is missing");
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn store() -> WindowedMetricStore {
        WindowedMetricStore::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_invalid_window_duration() {
        assert_eq!(
            WindowedMetricStore::new(Duration::from_micros(10)).unwrap_err(),
            StoreError::InvalidWindowDuration(Duration::from_micros(10))
        );
    }

    #[test]
    fn test_window_for_reuses_collection_window() {
        let store = store();
        let a = store.window_for(7000).unwrap();
        let b = store.window_for(9999).unwrap();
        let c = store.window_for(10000).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.table_name(), "5000");
        assert_eq!(a.range(), WindowRange::new(5000, 10000).unwrap());
        assert_eq!(c.table_name(), "10000");
        assert_eq!(store.collection_range(-1), WindowRange::new(-5000, 0).unwrap());
    }

    #[test]
    fn test_window_for_conflicting_name() {
        let store = store();
        store
            .create_window("5000", WindowRange::new(0, 1).unwrap())
            .unwrap();
        assert_eq!(
            store.window_for(7000).unwrap_err(),
            StoreError::DuplicateSegment(SegmentId::from("5000"))
        );
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_purge_before() {
        let store = store();
        store.window_for(1000).unwrap();
        store.window_for(6000).unwrap();
        store.window_for(11000).unwrap();
        store
            .create_window("aligned", WindowRange::new(0, 5000).unwrap())
            .unwrap();
        let purged = store.purge_before(10000);
        assert_eq!(purged, vec![SegmentId::from("0"), SegmentId::from("5000")]);
        let names = store
            .windows()
            .iter()
            .map(|w| w.table_name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["10000".to_string(), "aligned".to_string()]);
        assert!(logs_contain("Purged 2 expired windows"));
        assert!(store.purge_before(10000).is_empty());
    }

    #[test]
    fn test_align_window_uniform_timestamps() {
        let store = store();
        let w1 = store.window_for(7000).unwrap();
        w1.put_metric(thread("1"), metrics(2.3333), 7000).unwrap();
        w1.put_metric(thread("2"), metrics(5.0), 7000).unwrap();
        let w2 = store.window_for(12000).unwrap();
        w2.put_metric(thread("1"), metrics(2.3333), 12000).unwrap();
        w2.put_metric(thread("2"), metrics(3.0), 12000).unwrap();
        w2.put_metric(thread("3"), metrics(3.0), 12000).unwrap();

        let aligned = store
            .align_window(w1.id(), w2.id(), "aligned", 5000, 10000)
            .unwrap();
        assert_eq!(aligned.kind(), WindowKind::Aligned);
        assert_eq!(aligned.range(), WindowRange::new(5000, 10000).unwrap());
        let rows = aligned.fetch_all();
        assert_eq!(rows.len(), 3);
        assert_close(rows[0].metric(CPU), 2.3333);
        assert_close(rows[1].metric(CPU), 3.8);
        assert_close(rows[1].metric(RSS), 3.63);
        assert_eq!(rows[2], MetricSample::new(thread("3"), metrics(3.0), 12000));
    }

    #[test]
    fn test_align_window_heterogeneous_timestamps() {
        let store = store();
        let w1 = store.window_for(5000).unwrap();
        w1.put_metric(thread("1"), BTreeMap::from([(CPU.to_string(), 10.0)]), 7000)
            .unwrap();
        w1.put_metric(thread("2"), BTreeMap::from([(CPU.to_string(), 20.0)]), 8000)
            .unwrap();
        let w2 = store.window_for(10000).unwrap();
        w2.put_metric(thread("1"), BTreeMap::from([(CPU.to_string(), 20.0)]), 13000)
            .unwrap();
        w2.put_metric(thread("3"), BTreeMap::from([(CPU.to_string(), 30.0)]), 12000)
            .unwrap();

        let aligned = store
            .align_window(w1.id(), w2.id(), "aligned", 5000, 10000)
            .unwrap();
        let rows = aligned.fetch_all();
        assert_eq!(rows.len(), 3);
        assert_close(rows[0].metric(CPU), 16.0);
        assert_close(rows[1].metric(CPU), 20.0);
        assert_close(rows[2].metric(CPU), 30.0);
    }

    #[test]
    fn test_align_window_errors() {
        let store = store();
        let w1 = store.window_for(5000).unwrap();
        let w2 = store.window_for(10000).unwrap();
        assert_eq!(
            store
                .align_window(w1.id(), &SegmentId::from("missing"), "out", 5000, 10000)
                .unwrap_err(),
            StoreError::UnknownSegment(SegmentId::from("missing"))
        );
        assert_eq!(
            store
                .align_window(w1.id(), w2.id(), "out", 10000, 5000)
                .unwrap_err(),
            StoreError::InvalidTargetRange(10000, 5000)
        );
        assert_eq!(
            store
                .align_window(w1.id(), w2.id(), "10000", 5000, 10000)
                .unwrap_err(),
            StoreError::DuplicateSegment(SegmentId::from("10000"))
        );
    }

    #[test]
    fn test_aligned_window_feeds_further_alignment() {
        let store = store();
        let w1 = store.window_for(5000).unwrap();
        w1.put_metric(thread("1"), BTreeMap::from([(CPU.to_string(), 10.0)]), 7000)
            .unwrap();
        let w2 = store.window_for(10000).unwrap();
        w2.put_metric(thread("1"), BTreeMap::from([(CPU.to_string(), 20.0)]), 13000)
            .unwrap();
        let w3 = store.window_for(15000).unwrap();
        w3.put_metric(thread("1"), BTreeMap::from([(CPU.to_string(), 40.0)]), 16000)
            .unwrap();

        let first = store
            .align_window(w1.id(), w2.id(), "first", 5000, 10000)
            .unwrap();
        // (13000 - 10000) / (13000 - 7000) = 0.5
        let row = &first.fetch_all()[0];
        assert_eq!(row.timestamp(), 10000);
        assert_close(row.metric(CPU), 15.0);
        // The aligned window is represented by its row at t=10000
        let second = store
            .align_window(first.id(), w3.id(), "second", 8000, 13000)
            .unwrap();
        assert!(first.is_sealed());
        assert!(w1.is_sealed() && w2.is_sealed() && w3.is_sealed());
        // 15 * 0.5 + 40 * 0.5
        assert_close(second.fetch_all()[0].metric(CPU), 27.5);
    }

    #[test]
    fn test_sealed_collection_window_rejects_late_writes() {
        let store = store();
        let w1 = store.window_for(5000).unwrap();
        let w2 = store.window_for(10000).unwrap();
        store
            .align_window(w1.id(), w2.id(), "aligned", 5000, 10000)
            .unwrap();
        let ret = store
            .window_for(6000)
            .unwrap()
            .put_metric(thread("1"), metrics(1.0), 6000);
        assert_eq!(
            ret,
            Err(WindowError::Sealed(SegmentId::from("5000")))
        );
    }
}
