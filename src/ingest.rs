use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{FieldParsers, LoadConfig};
use crate::error::Error;
use crate::index::TemporalIndex;
use crate::model::{RawFeature, RawValue, TimeRecord};
use crate::parser;

/// Host-supplied symbol classification: maps a feature to an index into the
/// host-owned symbol table (rule/category/graduated/random/single renderers
/// all hide behind this). `None` means no render class matched; the record
/// is skipped, not failed hard.
pub trait MarkerClassifier: Send {
    fn classify(&mut self, feature: &RawFeature) -> Option<usize>;
}

impl<F> MarkerClassifier for F
where
    F: FnMut(&RawFeature) -> Option<usize> + Send,
{
    fn classify(&mut self, feature: &RawFeature) -> Option<usize> {
        self(feature)
    }
}

/// Every record draws with the first symbol. The fallback when a layer has
/// no attribute-driven rendering.
pub struct SingleSymbol;

impl MarkerClassifier for SingleSymbol {
    fn classify(&mut self, _feature: &RawFeature) -> Option<usize> {
        Some(0)
    }
}

/// Host-side label resolution (expression evaluation happens outside this
/// crate; the result is carried opaquely on the record).
pub trait LabelResolver: Send {
    fn label(&mut self, feature: &RawFeature) -> Option<String>;
}

impl<F> LabelResolver for F
where
    F: FnMut(&RawFeature) -> Option<String> + Send,
{
    fn label(&mut self, feature: &RawFeature) -> Option<String> {
        self(feature)
    }
}

/// Fire-and-forget progress reporting. A slow sink must not throttle the
/// ingest loop, so implementations should hand off and return.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, fraction: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn progress(&self, fraction: f64) {
        self(fraction)
    }
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn progress(&self, _fraction: f64) {}
}

/// Cooperative cancellation flag, checked between records (never mid-record).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tally of a completed ingest pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IngestReport {
    pub loaded: usize,
    pub failed: usize,
    /// One-time notice for the host (e.g. records skipped because the
    /// renderer produced no class for them).
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Complete(IngestReport),
    /// Cancellation observed between records. The caller discards the
    /// partially built index.
    Canceled { partial: usize },
}

impl IngestOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, IngestOutcome::Complete(_))
    }
}

/// One ingest pass: configuration plus the host hooks it runs through.
pub struct Ingest<'a, 'b> {
    pub config: &'a LoadConfig,
    pub parsers: FieldParsers,
    pub classifier: &'a mut (dyn MarkerClassifier + 'b),
    pub labeler: Option<&'a mut (dyn LabelResolver + 'b)>,
    pub progress: &'a dyn ProgressSink,
    pub cancel: &'a CancelToken,
}

impl Ingest<'_, '_> {
    /// Stream `features` into `index`, then order it.
    ///
    /// Partial-failure tolerant: a record with missing geometry, an
    /// unparsable timestamp, an inverted interval, or no matching render
    /// class is counted and skipped; one bad record never aborts the batch.
    /// `total` drives fractional progress and may be an estimate.
    pub fn run<I>(mut self, index: &mut TemporalIndex, features: I, total: usize) -> IngestOutcome
    where
        I: IntoIterator<Item = RawFeature>,
    {
        let offset_secs = self.config.utc_offset_secs();
        let mut report = IngestReport::default();
        let mut renderer_skip_noted = false;

        for feature in features {
            if self.cancel.is_canceled() {
                info!(partial = report.loaded, "ingest canceled between records");
                return IngestOutcome::Canceled { partial: report.loaded };
            }

            let geometry = match feature.geometry.clone() {
                Some(g) => g,
                None => {
                    record_failure(&mut report, &feature, "feature has no geometry");
                    continue;
                }
            };

            let epoch_value = attribute_or_null(&feature, &self.config.epoch_field);
            let epoch = match parser::parse(self.parsers.epoch, &epoch_value, offset_secs) {
                Ok(secs) => secs,
                Err(e) => {
                    record_failure(&mut report, &feature, &e.to_string());
                    continue;
                }
            };

            let end_epoch = match (&self.config.duration_field, self.parsers.duration) {
                (Some(field), Some(kind)) => {
                    let value = attribute_or_null(&feature, field);
                    match parser::parse(kind, &value, offset_secs) {
                        Ok(end) if end >= epoch => Some(end),
                        Ok(_) => {
                            record_failure(&mut report, &feature, "interval ends before it starts");
                            continue;
                        }
                        Err(e) => {
                            record_failure(&mut report, &feature, &e.to_string());
                            continue;
                        }
                    }
                }
                _ => None,
            };

            let marker_index = match self.classifier.classify(&feature) {
                Some(idx) => idx,
                None => {
                    // Not rendered under the layer's renderer settings:
                    // skipped quietly, surfaced once to the host.
                    if !renderer_skip_noted {
                        renderer_skip_noted = true;
                        warn!("features without a matching render class were not loaded");
                        report.status_message = Some(
                            "Features not rendered under the layer renderer settings have not been loaded."
                                .to_string(),
                        );
                    }
                    report.failed += 1;
                    continue;
                }
            };

            let label = self.labeler.as_mut().and_then(|l| l.label(&feature));

            index.push(TimeRecord {
                id: feature.id.clone(),
                epoch,
                end_epoch,
                marker_index,
                label,
                geometry,
            });
            report.loaded += 1;

            if total > 0 {
                self.progress.progress(report.loaded as f64 / total as f64);
            }
        }

        index.order();
        info!(
            loaded = report.loaded,
            failed = report.failed,
            "ingest pass finished"
        );
        IngestOutcome::Complete(report)
    }
}

fn attribute_or_null(feature: &RawFeature, field: &str) -> RawValue {
    feature.attribute(field).cloned().unwrap_or(RawValue::Null)
}

fn record_failure(report: &mut IngestReport, feature: &RawFeature, reason: &str) {
    report.failed += 1;
    // Log the first few failures verbatim, then sample to avoid flooding.
    if report.failed <= 10 || report.failed % 100 == 0 {
        warn!(id = %feature.id, failed = report.failed, "record skipped: {}", reason);
    }
}

/// Convenience wrapper shared by the load task and live updates: builds the
/// error for a pass that produced nothing.
pub fn require_records(index: &TemporalIndex, layer_name: &str) -> Result<(), Error> {
    if index.is_empty() {
        Err(Error::EmptyLoad(layer_name.to_string()))
    } else {
        Ok(())
    }
}
