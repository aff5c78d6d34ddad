use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::config::{FieldParsers, LoadConfig};
use crate::error::Error;
use crate::index::{IndexLayout, TemporalIndex};
use crate::ingest::{
    require_records, CancelToken, Ingest, IngestOutcome, IngestReport, LabelResolver,
    MarkerClassifier, ProgressSink,
};
use crate::model::RawFeature;

/// Lifecycle of one load: `Pending → Running → {Succeeded, Failed, Canceled}`.
/// Terminal states are never left and never observed twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Canceled)
    }
}

/// What a finished task hands to its completion callback. The built index
/// travels here on success; otherwise the worker's partial state has already
/// been discarded.
#[derive(Debug)]
pub enum TaskOutcome {
    Succeeded(TemporalIndex, IngestReport),
    Failed(Error),
    Canceled,
}

pub type CompletionCallback = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

/// One asynchronous layer load. The index under construction is owned by the
/// worker thread until the task reaches a terminal state; ownership transfers
/// through the completion callback, which fires exactly once per task.
pub struct IngestTask {
    pub layer_name: String,
    pub config: LoadConfig,
    pub parsers: FieldParsers,
    pub classifier: Box<dyn MarkerClassifier>,
    pub labeler: Option<Box<dyn LabelResolver>>,
}

impl IngestTask {
    /// Start the load on a dedicated worker thread.
    ///
    /// `total` sizes the progress fraction and may be an estimate; the
    /// feature stream itself is pulled until exhaustion or cancellation.
    pub fn spawn<I>(mut self, features: I, total: usize, on_complete: CompletionCallback) -> IngestHandle
    where
        I: IntoIterator<Item = RawFeature> + Send + 'static,
    {
        let state = Arc::new(Mutex::new(TaskState::Pending));
        let progress = Arc::new(AtomicU64::new(0f64.to_bits()));
        let cancel = CancelToken::new();

        let layout = if self.config.is_duration() {
            IndexLayout::Duration
        } else {
            IndexLayout::Point
        };

        let worker_state = state.clone();
        let worker_cancel = cancel.clone();
        let sink = SharedProgress(progress.clone());
        let description = format!("Loading {}", self.layer_name);
        info!(task = %description, "task started");

        let join = thread::spawn(move || {
            set_state(&worker_state, TaskState::Running);

            let mut index = TemporalIndex::new(layout);
            let outcome = Ingest {
                config: &self.config,
                parsers: self.parsers,
                classifier: &mut *self.classifier,
                labeler: self.labeler.as_deref_mut(),
                progress: &sink,
                cancel: &worker_cancel,
            }
            .run(&mut index, features, total);

            match outcome {
                IngestOutcome::Canceled { partial } => {
                    // Drop the partial index here; nothing is swapped in.
                    set_state(&worker_state, TaskState::Canceled);
                    info!(layer = %self.layer_name, partial, "load canceled by the user");
                    on_complete(TaskOutcome::Canceled);
                }
                IngestOutcome::Complete(report) => match require_records(&index, &self.layer_name) {
                    Ok(()) => {
                        set_state(&worker_state, TaskState::Succeeded);
                        info!(
                            layer = %self.layer_name,
                            loaded = report.loaded,
                            failed = report.failed,
                            "load completed"
                        );
                        on_complete(TaskOutcome::Succeeded(index, report));
                    }
                    Err(e) => {
                        set_state(&worker_state, TaskState::Failed);
                        error!(layer = %self.layer_name, "load failed: {}", e);
                        on_complete(TaskOutcome::Failed(e));
                    }
                },
            }
        });

        IngestHandle { description, state, progress, cancel, join }
    }
}

fn set_state(state: &Mutex<TaskState>, next: TaskState) {
    if let Ok(mut guard) = state.lock() {
        *guard = next;
    }
}

/// Caller-side view of a spawned load.
pub struct IngestHandle {
    description: String,
    state: Arc<Mutex<TaskState>>,
    progress: Arc<AtomicU64>,
    cancel: CancelToken,
    join: JoinHandle<()>,
}

impl IngestHandle {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().map(|s| *s).unwrap_or(TaskState::Failed)
    }

    /// Last reported progress fraction in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Relaxed))
    }

    /// Request cooperative cancellation; observed between records.
    pub fn cancel(&self) {
        info!(task = %self.description, "cancellation requested");
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Block until the worker exits. The completion callback has already
    /// fired by the time this returns.
    pub fn join(self) {
        let _ = self.join.join();
    }
}

struct SharedProgress(Arc<AtomicU64>);

impl ProgressSink for SharedProgress {
    fn progress(&self, fraction: f64) {
        self.0.store(fraction.to_bits(), Ordering::Relaxed);
    }
}
