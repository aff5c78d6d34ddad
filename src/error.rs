use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes for layer loading and time handling.
///
/// Per-record ingest problems (bad geometry, unparsable timestamp on one
/// feature) are NOT represented here; they are tallied by the ingest loop
/// and never abort a batch.
#[derive(Debug, Error)]
pub enum Error {
    /// The sampled field held no usable value (null or empty string).
    /// Non-fatal: the field is simply left unconfigured for time.
    #[error("field has no usable sample value")]
    NoSample,

    /// A sample value was present but no parsing strategy matched it.
    /// Non-fatal, but the field cannot be used for time.
    #[error("no time format matched sample {0:?}")]
    UnparsableSample(String),

    /// A value failed to parse under the strategy fixed at classification
    /// time. Raised per-value; the ingest loop absorbs it into its tally.
    #[error("bad timestamp {value:?}: {reason}")]
    BadTimestamp { value: String, reason: String },

    /// Zero features were available (or survived ingest) for a load.
    /// Fatal for that load operation; names the affected layer.
    #[error("no features were loaded from layer {0}")]
    EmptyLoad(String),

    /// Unexpected failure inside a load worker.
    #[error("load of layer {layer} failed: {message}")]
    TaskFailed { layer: String, message: String },

    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings format error: {0}")]
    Json(#[from] serde_json::Error),
}
