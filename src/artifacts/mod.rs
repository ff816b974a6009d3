//! Model persistence
//!
//! Every fitted component serializes to explicit JSON parameter files under
//! a partitioned directory layout:
//!
//! ```text
//! <root>/ticker=<SYM>/timeframe=<TF>/model_id=<ID>/
//!     scaler.json
//!     encoder.json
//!     hmm.json
//!     metadata.json
//! ```
//!
//! Load failures are typed so callers can distinguish a model that was
//! never trained from one whose files are damaged.

use crate::encoder::{Encoder, EncoderKind};
use crate::inference::{InferenceConfig, InferenceEngine};
use crate::labeling::StateLabel;
use crate::model::{CovarianceKind, RegimeHmm, RegimeMetrics};
use crate::scaler::{Scaler, ScalerKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;

const SCALER_FILE: &str = "scaler.json";
const ENCODER_FILE: &str = "encoder.json";
const HMM_FILE: &str = "hmm.json";
const METADATA_FILE: &str = "metadata.json";

/// Artifact load/store failures.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("model artifact not found: {0}")]
    Missing(PathBuf),
    #[error("corrupt artifact {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("artifact {path} has schema version {found}, this build reads {expected}")]
    SchemaVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything about a trained model except its parameter arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub schema_version: u32,
    pub model_id: String,
    pub ticker: String,
    pub timeframe: String,
    pub created_at: DateTime<Utc>,
    pub feature_names: Vec<String>,
    pub scaler: ScalerKind,
    pub encoder: EncoderKind,
    pub latent_dim: usize,
    pub n_states: usize,
    pub covariance: CovarianceKind,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub train_rows: usize,
    /// Validation-set fit metrics recorded at training time
    pub metrics: RegimeMetrics,
    pub ood_log_likelihood_threshold: f64,
    /// Semantic per-state labels derived from the state centroids
    pub state_labels: Vec<StateLabel>,
    /// New-state-index -> previous-model-label map, when matching succeeded
    pub state_mapping: Option<Vec<usize>>,
    pub parent_model_id: Option<String>,
}

/// A fully loaded model: parameters plus metadata.
pub struct ModelBundle {
    pub scaler: Scaler,
    pub encoder: Encoder,
    pub hmm: RegimeHmm,
    pub metadata: ModelMetadata,
}

impl ModelBundle {
    /// Build a streaming engine from this bundle, with the OOD threshold
    /// the model was trained with.
    pub fn engine(&self) -> InferenceEngine {
        let config = InferenceConfig {
            ood_log_likelihood_threshold: self.metadata.ood_log_likelihood_threshold,
            ..InferenceConfig::default()
        };
        self.engine_with(config)
    }

    pub fn engine_with(&self, config: InferenceConfig) -> InferenceEngine {
        InferenceEngine::new(
            self.scaler.clone(),
            self.encoder.clone(),
            self.hmm.clone(),
            self.metadata.feature_names.clone(),
            self.metadata.model_id.clone(),
            config,
        )
    }
}

/// Timeframe strings are `<number><unit>` with unit m/h/d, e.g. "15m", "4h".
pub fn validate_timeframe(timeframe: &str) -> anyhow::Result<()> {
    let (digits, unit) = timeframe.split_at(timeframe.len().saturating_sub(1));
    anyhow::ensure!(
        !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
            && matches!(unit, "m" | "h" | "d"),
        "invalid timeframe '{}', expected forms like 15m, 1h, 1d",
        timeframe
    );
    Ok(())
}

/// Model id derived from the training timestamp, millisecond-precise so
/// back-to-back runs never collide.
pub fn generate_model_id(created_at: DateTime<Utc>) -> String {
    created_at.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// Filesystem-backed model store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn model_dir(&self, ticker: &str, timeframe: &str, model_id: &str) -> PathBuf {
        self.root
            .join(format!("ticker={}", ticker))
            .join(format!("timeframe={}", timeframe))
            .join(format!("model_id={}", model_id))
    }

    /// Persist a trained model. Metadata is written last so a directory
    /// with metadata present is always complete.
    pub fn save(&self, bundle: &ModelBundle) -> Result<(), ArtifactError> {
        let dir = self.model_dir(
            &bundle.metadata.ticker,
            &bundle.metadata.timeframe,
            &bundle.metadata.model_id,
        );
        fs::create_dir_all(&dir)?;

        write_json(&dir.join(SCALER_FILE), &bundle.scaler)?;
        write_json(&dir.join(ENCODER_FILE), &bundle.encoder)?;
        write_json(&dir.join(HMM_FILE), &bundle.hmm)?;
        write_json(&dir.join(METADATA_FILE), &bundle.metadata)?;

        tracing::info!(dir = %dir.display(), model_id = %bundle.metadata.model_id, "model saved");
        Ok(())
    }

    pub fn load(
        &self,
        ticker: &str,
        timeframe: &str,
        model_id: &str,
    ) -> Result<ModelBundle, ArtifactError> {
        let dir = self.model_dir(ticker, timeframe, model_id);
        let metadata: ModelMetadata = read_json(&dir.join(METADATA_FILE))?;

        if metadata.schema_version != SCHEMA_VERSION {
            return Err(ArtifactError::SchemaVersion {
                path: dir.join(METADATA_FILE),
                found: metadata.schema_version,
                expected: SCHEMA_VERSION,
            });
        }

        Ok(ModelBundle {
            scaler: read_json(&dir.join(SCALER_FILE))?,
            encoder: read_json(&dir.join(ENCODER_FILE))?,
            hmm: read_json(&dir.join(HMM_FILE))?,
            metadata,
        })
    }

    /// Metadata of every stored model for one stream, oldest first.
    pub fn list_models(
        &self,
        ticker: &str,
        timeframe: &str,
    ) -> Result<Vec<ModelMetadata>, ArtifactError> {
        let dir = self
            .root
            .join(format!("ticker={}", ticker))
            .join(format!("timeframe={}", timeframe));
        if !dir.exists() {
            return Ok(vec![]);
        }

        let mut models = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let metadata_path = path.join(METADATA_FILE);
            if !metadata_path.exists() {
                continue;
            }
            match read_json::<ModelMetadata>(&metadata_path) {
                Ok(metadata) => models.push(metadata),
                Err(err) => {
                    tracing::warn!(path = %metadata_path.display(), error = %err, "skipping unreadable model");
                }
            }
        }

        models.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.model_id.cmp(&b.model_id))
        });
        Ok(models)
    }

    /// Most recently trained model for one stream.
    pub fn latest(
        &self,
        ticker: &str,
        timeframe: &str,
    ) -> Result<Option<ModelBundle>, ArtifactError> {
        let models = self.list_models(ticker, timeframe)?;
        match models.last() {
            Some(metadata) => Ok(Some(self.load(ticker, timeframe, &metadata.model_id)?)),
            None => Ok(None),
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| ArtifactError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ArtifactError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArtifactError::Missing(path.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&text).map_err(|source| ArtifactError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}
