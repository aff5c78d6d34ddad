pub mod config;
pub mod error;
pub mod index;
pub mod ingest;
pub mod layer;
pub mod model;
pub mod parser;
pub mod task;
pub mod window;

use std::fmt;

use tracing::info;
use uuid::Uuid;

pub use crate::error::{Error, Result};
use crate::layer::TimeLayer;

/// Outcome of one animation step across the layer set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Data was resolved for this tick; `visible` counts records across all
    /// layers' windows.
    Rendered { visible: usize },
    /// Every layer reported a no-data hint. The clock should move directly
    /// to this time instead of single-stepping through the empty interval.
    Jump(f64),
}

/// The animation engine: a set of time layers sharing one clock.
///
/// The player fans each tick out to its layers, merges their no-data hints
/// to skip empty intervals, and tracks the combined data time range.
pub struct TimePlayer {
    layers: Vec<TimeLayer>,
    history: f64,
    forward: bool,
    skip_gaps: bool,
    current_time: f64,
    min_time: f64,
    max_time: f64,
}

impl fmt::Debug for TimePlayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimePlayer")
            .field("layers", &self.layers.len())
            .field("current_time", &self.current_time)
            .finish()
    }
}

impl Default for TimePlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimePlayer {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            history: 60.0,
            forward: true,
            skip_gaps: true,
            current_time: 0.0,
            min_time: f64::INFINITY,
            max_time: f64::NEG_INFINITY,
        }
    }

    // --- LAYER SET ---

    /// Adopt a loaded layer, aligning it with the shared clock settings.
    pub fn add_layer(&mut self, mut layer: TimeLayer) -> Uuid {
        layer.set_history(self.history);
        layer.set_direction(self.forward);
        let uid = layer.uid();
        info!(layer = %layer.name(), %uid, "layer added to player");
        self.layers.push(layer);
        self.refresh_data_limits();
        uid
    }

    pub fn remove_layer(&mut self, uid: Uuid) -> Option<TimeLayer> {
        let pos = self.layers.iter().position(|l| l.uid() == uid)?;
        let layer = self.layers.remove(pos);
        self.refresh_data_limits();
        Some(layer)
    }

    pub fn layer(&self, uid: Uuid) -> Option<&TimeLayer> {
        self.layers.iter().find(|l| l.uid() == uid)
    }

    pub fn layer_mut(&mut self, uid: Uuid) -> Option<&mut TimeLayer> {
        self.layers.iter_mut().find(|l| l.uid() == uid)
    }

    pub fn layers(&self) -> &[TimeLayer] {
        &self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Swap a layer with its neighbor toward the front (`+1`) or back
    /// (`-1`) of the draw order.
    pub fn move_layer(&mut self, uid: Uuid, direction: i32) -> bool {
        let Some(pos) = self.layers.iter().position(|l| l.uid() == uid) else {
            return false;
        };
        if direction > 0 && pos + 1 < self.layers.len() {
            self.layers.swap(pos, pos + 1);
            true
        } else if direction < 0 && pos > 0 {
            self.layers.swap(pos, pos - 1);
            true
        } else {
            false
        }
    }

    /// Close every layer. The collection is snapshotted first: close
    /// observers may mutate layer state while we iterate, so the walk never
    /// reads the live list it is emptying.
    pub fn close_all(&mut self) {
        let uids: Vec<Uuid> = self.layers.iter().map(|l| l.uid()).collect();
        for uid in uids {
            if let Some(pos) = self.layers.iter().position(|l| l.uid() == uid) {
                let mut layer = self.layers.remove(pos);
                layer.request_close();
            }
        }
        self.min_time = f64::INFINITY;
        self.max_time = f64::NEG_INFINITY;
        info!("all layers closed");
    }

    // --- SHARED CLOCK SETTINGS ---

    pub fn set_history(&mut self, history: f64) {
        self.history = history;
        for layer in self.layers.iter_mut() {
            layer.set_history(history);
        }
    }

    pub fn history(&self) -> f64 {
        self.history
    }

    pub fn set_direction(&mut self, forward: bool) {
        self.forward = forward;
        for layer in self.layers.iter_mut() {
            layer.set_direction(forward);
        }
    }

    pub fn set_skip_gaps(&mut self, skip: bool) {
        self.skip_gaps = skip;
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    // --- DATA LIMITS ---

    /// Recompute the combined data range, skipping layers mid-load.
    pub fn refresh_data_limits(&mut self) {
        self.min_time = f64::INFINITY;
        self.max_time = f64::NEG_INFINITY;
        for layer in self.layers.iter() {
            if layer.is_loading() {
                continue;
            }
            if let Some((lo, hi)) = layer.time_bounds() {
                self.min_time = self.min_time.min(lo);
                self.max_time = self.max_time.max(hi);
            }
        }
    }

    /// Combined first/last data time across loaded layers.
    pub fn time_bounds(&self) -> Option<(f64, f64)> {
        if self.min_time.is_finite() && self.max_time.is_finite() {
            Some((self.min_time, self.max_time))
        } else {
            None
        }
    }

    pub fn is_any_loading(&self) -> bool {
        self.layers.iter().any(|l| l.is_loading())
    }

    /// Every layer's epochs concatenated, the feed for timeline summaries.
    pub fn merged_epochs(&self) -> Vec<f64> {
        let mut epochs = Vec::new();
        for layer in self.layers.iter() {
            epochs.extend(layer.index().flat_epochs());
        }
        epochs
    }

    // --- ANIMATION STEP ---

    /// Position every layer's window at clock time `t`.
    ///
    /// With gap skipping on, a tick where *every* layer reports a no-data
    /// hint merges those hints by sorted search and returns the jump target:
    /// the nearest hint at or past `t` going forward, or the nearest hint
    /// below `t` plus the window length going backward.
    pub fn step(&mut self, t: f64) -> StepOutcome {
        self.current_time = t;

        if !self.skip_gaps {
            for layer in self.layers.iter_mut() {
                layer.set_time(t);
            }
            return StepOutcome::Rendered { visible: self.visible_count() };
        }

        let mut hints = Vec::new();
        for layer in self.layers.iter_mut() {
            let hint = layer.set_time(t);
            if hint > 0.0 {
                hints.push(hint);
            }
        }

        if !self.layers.is_empty() && hints.len() == self.layers.len() {
            hints.sort_by(|a, b| a.total_cmp(b));
            let cut = hints.partition_point(|&h| h < t);
            let target = if self.forward {
                hints[cut.min(hints.len() - 1)]
            } else {
                hints[cut.saturating_sub(1)] + self.history
            };
            info!(from = t, to = target, "no data in any layer, skipping gap");
            return StepOutcome::Jump(target);
        }

        StepOutcome::Rendered { visible: self.visible_count() }
    }

    fn visible_count(&self) -> usize {
        self.layers.iter().map(|l| l.window_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldParsers, LoadConfig};
    use crate::index::{IndexLayout, TemporalIndex};
    use crate::model::{Coord, FeatureId, Geometry, TimeRecord};
    use crate::parser::ParserKind;

    fn loaded_layer(name: &str, epochs: &[f64]) -> TimeLayer {
        let parsers = FieldParsers { epoch: ParserKind::EpochSeconds, duration: None };
        let mut layer = TimeLayer::new(name, LoadConfig::new("t"), parsers);
        let mut index = TemporalIndex::with_chunk_size(IndexLayout::Point, 2);
        for (i, &e) in epochs.iter().enumerate() {
            index.push(TimeRecord {
                id: FeatureId::Int(i as i64),
                epoch: e,
                end_epoch: None,
                marker_index: 0,
                label: None,
                geometry: Geometry::Point(Coord::new(e, 0.0)),
            });
        }
        index.order();
        layer.complete_load(index, None);
        layer
    }

    #[test]
    fn data_limits_span_all_loaded_layers() {
        let mut player = TimePlayer::new();
        player.add_layer(loaded_layer("a", &[10.0, 20.0]));
        player.add_layer(loaded_layer("b", &[5.0, 300.0]));
        assert_eq!(player.time_bounds(), Some((5.0, 300.0)));
    }

    #[test]
    fn loading_layers_are_skipped_in_limits() {
        let mut player = TimePlayer::new();
        player.add_layer(loaded_layer("a", &[10.0, 20.0]));
        let uid = player.add_layer(loaded_layer("b", &[5.0, 300.0]));
        player.layer_mut(uid).unwrap().set_loading(true, "Loading...", false);
        player.refresh_data_limits();
        assert_eq!(player.time_bounds(), Some((10.0, 20.0)));
    }

    #[test]
    fn step_renders_when_any_layer_has_data() {
        let mut player = TimePlayer::new();
        player.set_history(5.0);
        player.add_layer(loaded_layer("a", &[10.0, 20.0]));
        player.add_layer(loaded_layer("b", &[100.0, 200.0]));

        match player.step(12.0) {
            StepOutcome::Rendered { visible } => assert_eq!(visible, 1),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn step_jumps_forward_over_a_shared_gap() {
        let mut player = TimePlayer::new();
        player.set_history(5.0);
        player.add_layer(loaded_layer("a", &[10.0, 20.0]));
        player.add_layer(loaded_layer("b", &[100.0, 200.0]));

        // Window [45, 50]: nothing anywhere; the next data ahead is 100.
        assert_eq!(player.step(50.0), StepOutcome::Jump(100.0));
    }

    #[test]
    fn step_jumps_backward_with_history_padding() {
        let mut player = TimePlayer::new();
        player.set_history(5.0);
        player.set_direction(false);
        player.add_layer(loaded_layer("a", &[10.0, 20.0]));
        player.add_layer(loaded_layer("b", &[100.0, 200.0]));

        // Nothing in [45, 50] backward either; the nearest data behind is
        // epoch 10/20, and the jump re-opens the window past it.
        match player.step(50.0) {
            StepOutcome::Jump(t) => assert_eq!(t, 15.0),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn invisible_layers_do_not_stall_the_skip() {
        let mut player = TimePlayer::new();
        player.set_history(5.0);
        let hidden = player.add_layer(loaded_layer("a", &[40.0, 60.0])); // would cover t
        player.add_layer(loaded_layer("b", &[100.0, 200.0]));
        player.layer_mut(hidden).unwrap().set_visible(false);

        assert_eq!(player.step(50.0), StepOutcome::Jump(100.0));
    }

    #[test]
    fn skip_disabled_never_jumps() {
        let mut player = TimePlayer::new();
        player.set_history(5.0);
        player.set_skip_gaps(false);
        player.add_layer(loaded_layer("a", &[10.0, 20.0]));
        match player.step(50.0) {
            StepOutcome::Rendered { visible } => assert_eq!(visible, 0),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn close_all_notifies_every_layer_once() {
        use std::sync::{Arc, Mutex};
        let mut player = TimePlayer::new();
        let closed = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let mut layer = loaded_layer(name, &[1.0]);
            let closed_cb = closed.clone();
            layer.on_close.connect(move |uid| closed_cb.lock().unwrap().push(uid));
            player.add_layer(layer);
        }
        player.close_all();
        assert_eq!(player.layer_count(), 0);
        assert_eq!(closed.lock().unwrap().len(), 3);
        assert_eq!(player.time_bounds(), None);
    }

    #[test]
    fn move_layer_reorders_draw_order() {
        let mut player = TimePlayer::new();
        let a = player.add_layer(loaded_layer("a", &[1.0]));
        let _b = player.add_layer(loaded_layer("b", &[1.0]));
        assert!(player.move_layer(a, 1));
        assert_eq!(player.layers()[1].uid(), a);
        assert!(!player.move_layer(a, 1)); // already at the end
    }

    #[test]
    fn merged_epochs_concatenate_layers() {
        let mut player = TimePlayer::new();
        player.add_layer(loaded_layer("a", &[10.0, 20.0]));
        player.add_layer(loaded_layer("b", &[5.0]));
        let mut epochs = player.merged_epochs();
        epochs.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(epochs, vec![5.0, 10.0, 20.0]);
    }

    #[test]
    fn empty_player_steps_without_jumping() {
        let mut player = TimePlayer::new();
        assert_eq!(player.step(10.0), StepOutcome::Rendered { visible: 0 });
        assert_eq!(player.time_bounds(), None);
    }
}
