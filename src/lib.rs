//! Market regime identification over engineered feature streams
//!
//! The crate trains Gaussian HMM regime models on scaled, PCA-encoded
//! feature tables and serves them through a gated streaming inference
//! engine, with versioned JSON artifacts and lifecycle monitoring around
//! the deployed model.

pub mod artifacts;
pub mod data;
pub mod encoder;
pub mod inference;
pub mod labeling;
pub mod lifecycle;
pub mod model;
pub mod scaler;
pub mod training;

pub use artifacts::{ArtifactError, ArtifactStore, ModelBundle, ModelMetadata};
pub use data::{FeatureTable, FeatureVector, TimeSplitter};
pub use encoder::{Encoder, EncoderKind};
pub use inference::{InferenceConfig, InferenceEngine, InferenceOutput};
pub use labeling::{label_states, LabelingConfig, StateLabel};
pub use model::{CovarianceKind, HmmConfig, RegimeHmm, RegimeMetrics, UNKNOWN_STATE};
pub use scaler::{Scaler, ScalerKind};
pub use training::{
    CrossValidator, HyperparameterTuner, TrainingConfig, TrainingPipeline, TrainingResult,
    TuningMetric,
};
