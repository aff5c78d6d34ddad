use ordered_float::OrderedFloat;
use tracing::{debug, info};

use crate::model::{CoordTransform, TimeRecord, DEFAULT_CHUNK_SIZE};

/// Which physical arrangement an index uses. Fixed at creation, based on
/// whether the load configured an end-time attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLayout {
    /// Records sorted by epoch and split into fixed-size chunks for
    /// two-level binary search.
    Point,
    /// Flat `(epoch, end_epoch)` interval array, scanned whole per query.
    /// Duration layers are expected to stay small enough for this.
    Duration,
}

/// Time-sorted store of one layer's records.
///
/// Built once by an ingest pass, then read-only for the query path. A reload
/// builds a fresh index and swaps it in; the live one is never mutated while
/// queries may be in flight.
#[derive(Debug)]
pub struct TemporalIndex {
    layout: IndexLayout,
    chunk_size: usize,
    records: Vec<TimeRecord>,

    // Point layout: per-chunk epoch arrays plus each chunk's last epoch,
    // the coarse key for chunk selection.
    chunks: Vec<Vec<f64>>,
    chunk_last: Vec<f64>,

    // Duration layout: interval pairs, parallel to `records`.
    durations: Vec<(f64, f64)>,
}

impl TemporalIndex {
    pub fn new(layout: IndexLayout) -> Self {
        Self::with_chunk_size(layout, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(layout: IndexLayout, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            layout,
            chunk_size,
            records: Vec::new(),
            chunks: Vec::new(),
            chunk_last: Vec::new(),
            durations: Vec::new(),
        }
    }

    pub fn layout(&self) -> IndexLayout {
        self.layout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, idx: usize) -> Option<&TimeRecord> {
        self.records.get(idx)
    }

    pub fn records(&self) -> &[TimeRecord] {
        &self.records
    }

    pub fn chunks(&self) -> &[Vec<f64>] {
        &self.chunks
    }

    pub fn chunk_last(&self) -> &[f64] {
        &self.chunk_last
    }

    pub fn durations(&self) -> &[(f64, f64)] {
        &self.durations
    }

    /// Append a record produced by ingest. The index is unordered until the
    /// next [`order`](Self::order) call.
    pub fn push(&mut self, record: TimeRecord) {
        self.records.push(record);
    }

    /// Sort records ascending by epoch and rebuild the layout arrays.
    ///
    /// The sort is stable: equal epochs keep their ingest order. Calling this
    /// twice on an unmodified record set produces an identical index. An
    /// empty record set yields an empty index with zero chunks.
    pub fn order(&mut self) {
        self.records
            .sort_by_key(|r| OrderedFloat(r.epoch));

        self.chunks.clear();
        self.chunk_last.clear();
        self.durations.clear();

        match self.layout {
            IndexLayout::Duration => {
                // Records without a usable interval cannot participate in
                // overlap tests; drop them so the pair array stays parallel
                // to the record array.
                let before = self.records.len();
                self.records.retain(|r| r.end_epoch.is_some());
                let dropped = before - self.records.len();
                if dropped > 0 {
                    info!(dropped, "records without an end time dropped from duration index");
                }
                self.durations = self
                    .records
                    .iter()
                    .map(|r| (r.epoch, r.end_epoch.unwrap_or(r.epoch)))
                    .collect();
                debug!(size = self.durations.len(), "duration array rebuilt");
            }
            IndexLayout::Point => {
                for chunk in self.records.chunks(self.chunk_size) {
                    let epochs: Vec<f64> = chunk.iter().map(|r| r.epoch).collect();
                    // chunks() never yields an empty slice, so last() holds
                    if let Some(&last) = epochs.last() {
                        self.chunk_last.push(last);
                    }
                    self.chunks.push(epochs);
                }
                info!(
                    records = self.records.len(),
                    chunks = self.chunks.len(),
                    "ordered point index"
                );
            }
        }
    }

    /// Smallest epoch in the index, before any time shift.
    pub fn min_time(&self) -> Option<f64> {
        self.records.first().map(|r| r.epoch)
    }

    /// Largest visible time in the index, before any time shift. For the
    /// duration layout this is the largest interval end, which need not
    /// belong to the last record.
    pub fn max_time(&self) -> Option<f64> {
        match self.layout {
            IndexLayout::Point => self.records.last().map(|r| r.epoch),
            IndexLayout::Duration => self
                .durations
                .iter()
                .map(|&(_, end)| end)
                .max_by(|a, b| a.total_cmp(b)),
        }
    }

    /// Flat epoch sequence for the whole index, in time order. Feeds
    /// host-side summaries such as the timeline histogram.
    pub fn flat_epochs(&self) -> Vec<f64> {
        match self.layout {
            IndexLayout::Duration => self.durations.iter().map(|&(start, _)| start).collect(),
            IndexLayout::Point => self.chunks.iter().flatten().copied().collect(),
        }
    }

    /// Rewrite every record's marker index, used when the host collapses its
    /// symbol table to a single symbol.
    pub fn set_all_marker_indices(&mut self, marker_index: usize) {
        for r in self.records.iter_mut() {
            r.marker_index = marker_index;
        }
    }

    /// Reproject every record's geometry in place. Epochs are untouched, so
    /// the sort order and chunk arrays stay valid.
    pub fn transform_geometries(&mut self, xform: &dyn CoordTransform) {
        for r in self.records.iter_mut() {
            r.geometry.transform(xform);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coord, FeatureId, Geometry};

    pub(crate) fn point_record(id: i64, epoch: f64) -> TimeRecord {
        TimeRecord {
            id: FeatureId::Int(id),
            epoch,
            end_epoch: None,
            marker_index: 0,
            label: None,
            geometry: Geometry::Point(Coord::new(epoch, -epoch)),
        }
    }

    pub(crate) fn duration_record(id: i64, epoch: f64, end: f64) -> TimeRecord {
        TimeRecord {
            end_epoch: Some(end),
            ..point_record(id, epoch)
        }
    }

    #[test]
    fn order_sorts_and_chunks() {
        let mut index = TemporalIndex::with_chunk_size(IndexLayout::Point, 2);
        for &e in &[30.0, 10.0, 50.0, 20.0, 40.0] {
            index.push(point_record(e as i64, e));
        }
        index.order();

        assert_eq!(index.chunks(), &[vec![10.0, 20.0], vec![30.0, 40.0], vec![50.0]]);
        assert_eq!(index.chunk_last(), &[20.0, 40.0, 50.0]);
        assert_eq!(index.min_time(), Some(10.0));
        assert_eq!(index.max_time(), Some(50.0));
    }

    #[test]
    fn order_is_idempotent() {
        let mut index = TemporalIndex::with_chunk_size(IndexLayout::Point, 3);
        for &e in &[5.0, 1.0, 9.0, 3.0, 3.0, 7.0, 2.0] {
            index.push(point_record(e as i64, e));
        }
        index.order();
        let chunks = index.chunks().to_vec();
        let last = index.chunk_last().to_vec();
        index.order();
        assert_eq!(index.chunks(), &chunks[..]);
        assert_eq!(index.chunk_last(), &last[..]);
    }

    #[test]
    fn stable_sort_keeps_ingest_order_on_ties() {
        let mut index = TemporalIndex::with_chunk_size(IndexLayout::Point, 10);
        index.push(point_record(1, 20.0));
        index.push(point_record(2, 10.0));
        index.push(point_record(3, 10.0));
        index.order();
        let ids: Vec<_> = index.records().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![FeatureId::Int(2), FeatureId::Int(3), FeatureId::Int(1)]);
    }

    #[test]
    fn empty_order_is_well_defined() {
        let mut index = TemporalIndex::new(IndexLayout::Point);
        index.order();
        assert!(index.is_empty());
        assert_eq!(index.chunks().len(), 0);
        assert_eq!(index.min_time(), None);
        assert_eq!(index.max_time(), None);
        assert!(index.flat_epochs().is_empty());
    }

    #[test]
    fn duration_order_drops_open_intervals() {
        let mut index = TemporalIndex::new(IndexLayout::Duration);
        index.push(duration_record(1, 10.0, 15.0));
        index.push(point_record(2, 5.0)); // no end time
        index.push(duration_record(3, 0.0, 40.0));
        index.order();

        assert_eq!(index.len(), 2);
        assert_eq!(index.durations(), &[(0.0, 40.0), (10.0, 15.0)]);
        // Max visible time comes from the widest interval, not the last start.
        assert_eq!(index.max_time(), Some(40.0));
        assert_eq!(index.flat_epochs(), vec![0.0, 10.0]);
    }

    #[test]
    fn marker_indices_can_be_reset() {
        let mut index = TemporalIndex::new(IndexLayout::Point);
        let mut rec = point_record(1, 1.0);
        rec.marker_index = 7;
        index.push(rec);
        index.order();
        index.set_all_marker_indices(0);
        assert_eq!(index.record(0).map(|r| r.marker_index), Some(0));
    }
}
