use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::Result;
use crate::model::RawFeature;
use crate::parser::{self, ParserKind};

/// How a layer load interprets its source: which attributes carry time, the
/// UTC offset for string timestamps, and the display options resolved in the
/// load dialog. Never mutated after a successful load except by an explicit
/// re-edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    pub epoch_field: String,
    /// End-time attribute; present only for duration layers.
    pub duration_field: Option<String>,
    /// Whole hours relative to UTC, as entered by the user. Applied as
    /// seconds, and only to string-shaped time fields.
    pub utc_offset: i32,
    /// Opaque host expression evaluated per feature for labels.
    pub label_expression: Option<String>,
    /// Attribute used for color-by-attribute symbol assignment.
    pub color_attribute: Option<String>,
    #[serde(rename = "load_selected_only")]
    pub selected_only: bool,
}

impl LoadConfig {
    pub fn new(epoch_field: impl Into<String>) -> Self {
        Self {
            epoch_field: epoch_field.into(),
            duration_field: None,
            utc_offset: 0,
            label_expression: None,
            color_attribute: None,
            selected_only: false,
        }
    }

    pub fn utc_offset_secs(&self) -> f64 {
        f64::from(self.utc_offset) * 3600.0
    }

    pub fn is_duration(&self) -> bool {
        self.duration_field.is_some()
    }

    /// Fix the parsing strategy for the configured time field(s) from one
    /// sample feature. Every later value of those fields is assumed to share
    /// the sample's shape.
    pub fn resolve(&self, sample: &RawFeature) -> Result<FieldParsers> {
        let value = sample
            .attribute(&self.epoch_field)
            .cloned()
            .unwrap_or(crate::model::RawValue::Null);
        let epoch = parser::classify(&value)?;

        let duration = match &self.duration_field {
            Some(field) => {
                let value = sample
                    .attribute(field)
                    .cloned()
                    .unwrap_or(crate::model::RawValue::Null);
                Some(parser::classify(&value)?)
            }
            None => None,
        };

        Ok(FieldParsers { epoch, duration })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Parsing strategies resolved at classification time. Carried alongside the
/// configuration instead of hidden parser state, so interleaved
/// classification of several fields cannot cross wires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldParsers {
    pub epoch: ParserKind,
    pub duration: Option<ParserKind>,
}

/// File-backed store of per-layer load settings.
///
/// Settings are keyed by a SHA-256 digest of (layer name, field count,
/// feature count) so a repeat load of the same source can skip the dialog.
/// The key is a content-identity heuristic; collisions are possible and
/// accepted.
#[derive(Debug)]
pub struct SettingsStore {
    root: PathBuf,
}

impl SettingsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn layer_key(layer_name: &str, field_count: usize, feature_count: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(layer_name.as_bytes());
        hasher.update(field_count.to_string().as_bytes());
        hasher.update(feature_count.to_string().as_bytes());
        let digest = hasher.finalize();

        let mut key = String::with_capacity(digest.len() * 2);
        for byte in digest {
            key.push_str(&format!("{:02x}", byte));
        }
        key
    }

    fn settings_path(&self, key: &str) -> PathBuf {
        self.root.join(key).join("settings.json")
    }

    /// Previously saved settings for this source, or `None` when the source
    /// has not been configured before.
    pub fn lookup(
        &self,
        layer_name: &str,
        field_count: usize,
        feature_count: usize,
    ) -> Result<Option<LoadConfig>> {
        let key = Self::layer_key(layer_name, field_count, feature_count);
        let path = self.settings_path(&key);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        let config = LoadConfig::from_json(&json)?;
        info!(layer = layer_name, key = %key, "restored saved layer settings");
        Ok(Some(config))
    }

    pub fn save(
        &self,
        layer_name: &str,
        field_count: usize,
        feature_count: usize,
        config: &LoadConfig,
    ) -> Result<()> {
        let key = Self::layer_key(layer_name, field_count, feature_count);
        let path = self.settings_path(&key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, config.to_json()?)?;
        info!(layer = layer_name, path = %path.display(), "saved layer settings");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
