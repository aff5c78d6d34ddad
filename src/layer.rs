use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{FieldParsers, LoadConfig};
use crate::index::{IndexLayout, TemporalIndex};
use crate::ingest::{CancelToken, Ingest, IngestOutcome, MarkerClassifier, NullProgress};
use crate::model::{CoordTransform, FeatureId, RawFeature, Rect};
use crate::window::{self, WindowQuery, WindowState};

/// Gap hints returned for an invisible layer, chosen so that hint merging
/// across layers always skips past it instead of stalling on it.
pub const SKIP_AHEAD: f64 = f64::INFINITY;
pub const SKIP_BEHIND: f64 = 1.0;

/// Handle for a connected observer, used to disconnect it again.
pub type ObserverId = usize;

/// Ordered list of callbacks with explicit connect/disconnect. Callbacks
/// receive the emitting layer's uid.
#[derive(Default)]
pub struct ObserverList {
    next_id: ObserverId,
    entries: Vec<(ObserverId, Box<dyn FnMut(Uuid) + Send>)>,
}

impl ObserverList {
    pub fn connect(&mut self, callback: impl FnMut(Uuid) + Send + 'static) -> ObserverId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, Box::new(callback)));
        id
    }

    pub fn disconnect(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn emit(&mut self, uid: Uuid) {
        for (_, callback) in self.entries.iter_mut() {
            callback(uid);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList").field("count", &self.entries.len()).finish()
    }
}

/// One animated layer: its load configuration, the swapped-in temporal
/// index, and the window state the last clock tick resolved.
///
/// Window queries run against a fully built index. A reload builds into a
/// fresh index on a worker and [`complete_load`](Self::complete_load) swaps
/// it in; while `is_loading` the layer answers every query with cleared
/// indices.
#[derive(Debug)]
pub struct TimeLayer {
    uid: Uuid,
    name: String,
    config: LoadConfig,
    parsers: FieldParsers,
    index: TemporalIndex,

    window: WindowState,
    current_time: f64,
    history: f64,
    forward: bool,
    time_shift: f64,

    visible: bool,
    visible_return: bool,

    loading: bool,
    reloadable: bool,
    load_banner: String,
    status_message: Option<String>,

    /// Emitted after a data update lands in this layer.
    pub on_update: ObserverList,
    /// Emitted when this layer wants its source re-read.
    pub on_reload: ObserverList,
    /// Emitted when this layer asks to be closed.
    pub on_close: ObserverList,
}

impl TimeLayer {
    pub fn new(name: impl Into<String>, config: LoadConfig, parsers: FieldParsers) -> Self {
        let layout = if config.is_duration() {
            IndexLayout::Duration
        } else {
            IndexLayout::Point
        };
        Self {
            uid: Uuid::new_v4(),
            name: name.into(),
            config,
            parsers,
            index: TemporalIndex::new(layout),
            window: WindowState::Empty,
            current_time: 0.0,
            history: 60.0,
            forward: true,
            time_shift: 0.0,
            visible: true,
            visible_return: true,
            loading: false,
            reloadable: false,
            load_banner: String::new(),
            status_message: None,
            on_update: ObserverList::default(),
            on_reload: ObserverList::default(),
            on_close: ObserverList::default(),
        }
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LoadConfig {
        &self.config
    }

    pub fn parsers(&self) -> FieldParsers {
        self.parsers
    }

    pub fn index(&self) -> &TemporalIndex {
        &self.index
    }

    pub fn is_duration_layer(&self) -> bool {
        self.index.layout() == IndexLayout::Duration
    }

    // --- LOAD LIFECYCLE ---

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn load_banner(&self) -> &str {
        &self.load_banner
    }

    /// Status notice produced by the last load (e.g. records skipped by the
    /// renderer), surfaced to the host once.
    pub fn take_status_message(&mut self) -> Option<String> {
        self.status_message.take()
    }

    /// Mark the layer loading (or not). `reloadable` keeps the reload
    /// request path open for a layer stuck in a failed or canceled load.
    pub fn set_loading(&mut self, loading: bool, banner: &str, reloadable: bool) {
        self.loading = loading;
        self.load_banner = banner.to_string();
        self.reloadable = reloadable;
    }

    /// Swap in a freshly built index. Queries were answering "no data"
    /// throughout the build; from here they see the new records only.
    pub fn complete_load(&mut self, index: TemporalIndex, status_message: Option<String>) {
        info!(layer = %self.name, records = index.len(), "index swapped in");
        self.index = index;
        self.window = WindowState::Empty;
        self.status_message = status_message;
        self.loading = false;
        self.reloadable = false;
        self.load_banner.clear();
        let uid = self.uid;
        self.on_update.emit(uid);
    }

    /// Ask the host to re-read the source. Ignored while a non-reloadable
    /// load is already in progress.
    pub fn request_reload(&mut self) {
        if !self.loading || self.reloadable {
            let uid = self.uid;
            self.on_reload.emit(uid);
        }
    }

    pub fn request_close(&mut self) {
        info!(layer = %self.name, "close requested");
        let uid = self.uid;
        self.on_close.emit(uid);
    }

    /// Fold new source features into the live index and re-order it.
    ///
    /// This is the committed-features path for live sources. The caller owns
    /// the layer exclusively for the duration; window state is re-resolved
    /// on the next clock tick.
    pub fn apply_update<I>(&mut self, features: I, classifier: &mut dyn MarkerClassifier) -> IngestOutcome
    where
        I: IntoIterator<Item = RawFeature>,
    {
        let features: Vec<RawFeature> = features.into_iter().collect();
        info!(layer = %self.name, count = features.len(), "applying feature update");
        let cancel = CancelToken::new();
        let total = features.len();
        let outcome = Ingest {
            config: &self.config,
            parsers: self.parsers,
            classifier,
            labeler: None,
            progress: &NullProgress,
            cancel: &cancel,
        }
        .run(&mut self.index, features, total);

        if let IngestOutcome::Complete(report) = &outcome {
            if report.failed > 0 {
                warn!(layer = %self.name, failed = report.failed, "records failed during update");
            }
            self.window = WindowState::Empty;
            let uid = self.uid;
            self.on_update.emit(uid);
        }
        outcome
    }

    // --- VISIBILITY ---

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Hide or restore the layer as part of a whole-display toggle,
    /// remembering the per-layer visibility to come back to.
    pub fn toggle_display(&mut self, shown: bool) {
        if shown {
            self.visible = self.visible_return;
        } else {
            self.visible_return = self.visible;
            self.visible = false;
        }
    }

    // --- WINDOWING ---

    pub fn set_history(&mut self, history: f64) {
        self.history = history;
    }

    pub fn history(&self) -> f64 {
        self.history
    }

    pub fn set_direction(&mut self, forward: bool) {
        self.forward = forward;
    }

    pub fn set_time_shift(&mut self, shift: f64) {
        self.time_shift = shift;
    }

    /// Clock time of the last resolved window's end.
    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn time_shift(&self) -> f64 {
        self.time_shift
    }

    /// Move the data window so it ends at clock time `t` and cache the
    /// visible range. Returns the layer's no-data hint: `0` when the window
    /// has data (or no hint applies), otherwise the clock time at which data
    /// next appears in the current play direction.
    pub fn set_time(&mut self, t: f64) -> f64 {
        // Never index into a structure under construction.
        if self.loading {
            self.window = WindowState::Empty;
            return 0.0;
        }
        // Invisible layers report a hint that merging always skips past.
        if !self.visible {
            return if self.forward { SKIP_AHEAD } else { SKIP_BEHIND };
        }

        let query = WindowQuery {
            query_time: t,
            history: self.history,
            forward: self.forward,
            time_shift: self.time_shift,
        };
        let resolution = window::resolve(&self.index, &query);
        self.current_time = t;
        self.window = resolution.window;
        resolution.next_data_time
    }

    /// Feature ids inside the current window, in draw order.
    pub fn visible_ids(&self) -> Vec<FeatureId> {
        if !self.visible {
            return Vec::new();
        }
        self.window
            .indices()
            .into_iter()
            .filter_map(|i| self.index.record(i).map(|r| r.id.clone()))
            .collect()
    }

    /// One-call window query: position the window, return the visible ids.
    pub fn set_time_window(&mut self, t: f64, history: f64, forward: bool) -> Vec<FeatureId> {
        self.history = history;
        self.forward = forward;
        self.set_time(t);
        self.visible_ids()
    }

    pub fn window_count(&self) -> usize {
        self.window.count()
    }

    /// First/last data time of this layer in clock coordinates (time shift
    /// already removed). `None` until data is loaded.
    pub fn time_bounds(&self) -> Option<(f64, f64)> {
        let min = self.index.min_time()?;
        let max = self.index.max_time()?;
        Some((min - self.time_shift, max - self.time_shift))
    }

    /// Extent of the geometry inside the current window.
    pub fn window_extent(&self) -> Option<Rect> {
        if !self.visible {
            return None;
        }
        let mut extent: Option<Rect> = None;
        for i in self.window.indices() {
            if let Some(record) = self.index.record(i) {
                if let Some(env) = record.geometry.envelope() {
                    match extent.as_mut() {
                        Some(rect) => {
                            rect.expand(crate::model::Coord::new(env.min_x, env.min_y));
                            rect.expand(crate::model::Coord::new(env.max_x, env.max_y));
                        }
                        None => extent = Some(env),
                    }
                }
            }
        }
        extent
    }

    // --- SYMBOLS & GEOMETRY ---

    /// Collapse every record to the first symbol; used when the host's
    /// renderer falls back to a single symbol.
    pub fn reset_marker_indices(&mut self) {
        self.index.set_all_marker_indices(0);
    }

    /// Reproject all record geometry after a map CRS change. Callers hold
    /// the layer exclusively; a loading layer has nothing to transform yet.
    pub fn transform_geometries(&mut self, xform: &dyn CoordTransform) {
        info!(layer = %self.name, "transforming layer geometry");
        self.index.transform_geometries(xform);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SingleSymbol;
    use crate::model::{Coord, Geometry, RawValue, TimeRecord};
    use crate::parser::ParserKind;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn point_parsers() -> FieldParsers {
        FieldParsers { epoch: ParserKind::EpochSeconds, duration: None }
    }

    fn loaded_layer(epochs: &[f64]) -> TimeLayer {
        let mut layer = TimeLayer::new("flights", LoadConfig::new("t"), point_parsers());
        let mut index = TemporalIndex::with_chunk_size(IndexLayout::Point, 2);
        for (i, &e) in epochs.iter().enumerate() {
            index.push(TimeRecord {
                id: FeatureId::Int(i as i64),
                epoch: e,
                end_epoch: None,
                marker_index: 0,
                label: None,
                geometry: Geometry::Point(Coord::new(e, -e)),
            });
        }
        index.order();
        layer.complete_load(index, None);
        layer
    }

    fn raw_feature(id: i64, epoch: f64) -> RawFeature {
        let mut attributes = HashMap::new();
        attributes.insert("t".to_string(), RawValue::Number(epoch));
        RawFeature {
            id: FeatureId::Int(id),
            geometry: Some(Geometry::Point(Coord::new(epoch, 0.0))),
            attributes,
        }
    }

    #[test]
    fn set_time_window_returns_visible_ids() {
        let mut layer = loaded_layer(&[10.0, 20.0, 30.0, 40.0, 50.0]);
        let ids = layer.set_time_window(35.0, 10.0, true);
        assert_eq!(ids, vec![FeatureId::Int(2)]);
    }

    #[test]
    fn loading_layer_answers_cleared() {
        let mut layer = loaded_layer(&[10.0, 20.0, 30.0]);
        layer.set_loading(true, "Loading...", false);
        assert_eq!(layer.set_time(20.0), 0.0);
        assert!(layer.visible_ids().is_empty());
        assert!(layer.is_loading());
    }

    #[test]
    fn invisible_layer_reports_skip_sentinels() {
        let mut layer = loaded_layer(&[10.0, 20.0]);
        layer.set_visible(false);
        layer.set_direction(true);
        assert_eq!(layer.set_time(15.0), SKIP_AHEAD);
        layer.set_direction(false);
        assert_eq!(layer.set_time(15.0), SKIP_BEHIND);
        assert!(layer.visible_ids().is_empty());
    }

    #[test]
    fn display_toggle_restores_previous_visibility() {
        let mut layer = loaded_layer(&[1.0]);
        layer.set_visible(false);
        layer.toggle_display(false);
        layer.toggle_display(true);
        assert!(!layer.is_visible());

        layer.set_visible(true);
        layer.toggle_display(false);
        assert!(!layer.is_visible());
        layer.toggle_display(true);
        assert!(layer.is_visible());
    }

    #[test]
    fn time_bounds_account_for_time_shift() {
        let mut layer = loaded_layer(&[100.0, 200.0]);
        layer.set_time_shift(50.0);
        assert_eq!(layer.time_bounds(), Some((50.0, 150.0)));
    }

    #[test]
    fn reload_requests_respect_the_loading_gate() {
        let mut layer = loaded_layer(&[1.0]);
        let fired = Arc::new(Mutex::new(0));
        let fired_cb = fired.clone();
        layer.on_reload.connect(move |_| *fired_cb.lock().unwrap() += 1);

        layer.request_reload();
        assert_eq!(*fired.lock().unwrap(), 1);

        layer.set_loading(true, "Loading...", false);
        layer.request_reload();
        assert_eq!(*fired.lock().unwrap(), 1);

        // A failed/canceled load leaves the layer reloadable.
        layer.set_loading(true, "Failed.", true);
        layer.request_reload();
        assert_eq!(*fired.lock().unwrap(), 2);
    }

    #[test]
    fn observers_can_disconnect() {
        let mut list = ObserverList::default();
        let count = Arc::new(Mutex::new(0));
        let count_cb = count.clone();
        let id = list.connect(move |_| *count_cb.lock().unwrap() += 1);
        list.emit(Uuid::new_v4());
        assert!(list.disconnect(id));
        list.emit(Uuid::new_v4());
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(!list.disconnect(id));
    }

    #[test]
    fn apply_update_extends_and_reorders() {
        let mut layer = loaded_layer(&[10.0, 30.0]);
        let mut classifier = SingleSymbol;
        let outcome = layer.apply_update(vec![raw_feature(100, 20.0)], &mut classifier);
        assert!(outcome.succeeded());
        assert_eq!(layer.index().len(), 3);
        let ids = layer.set_time_window(30.0, 20.0, true);
        assert_eq!(
            ids,
            vec![FeatureId::Int(0), FeatureId::Int(100), FeatureId::Int(1)]
        );
    }

    #[test]
    fn window_extent_covers_visible_geometry() {
        let mut layer = loaded_layer(&[10.0, 20.0, 30.0]);
        layer.set_time_window(30.0, 30.0, true);
        let extent = layer.window_extent().unwrap();
        assert_eq!(extent.min_x, 10.0);
        assert_eq!(extent.max_x, 30.0);
    }

    #[test]
    fn geometry_transform_reaches_every_record() {
        let mut layer = loaded_layer(&[10.0, 20.0]);
        layer.transform_geometries(&|c: Coord| Coord::new(c.x * 2.0, c.y));
        layer.set_time_window(30.0, 30.0, true);
        let extent = layer.window_extent().unwrap();
        assert_eq!(extent.max_x, 40.0);
    }
}
