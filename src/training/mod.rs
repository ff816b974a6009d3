//! Offline training: single runs, walk-forward validation, grid tuning
//!
//! The pipeline owns the leakage discipline: every preprocessing component
//! is fitted on the training window only and applied unchanged to the
//! validation window.

use crate::artifacts::{
    generate_model_id, validate_timeframe, ArtifactStore, ModelBundle, ModelMetadata,
    SCHEMA_VERSION,
};
use crate::data::{validate_no_leakage, FeatureTable, TimeSplitter};
use crate::encoder::{Encoder, EncoderKind};
use crate::labeling::{label_states, LabelingConfig, StateLabel};
use crate::model::{
    match_states, select_n_states, CovarianceKind, HmmConfig, RegimeHmm, RegimeMetrics,
};
use crate::scaler::{Scaler, ScalerKind};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Fallback OOD threshold when the training distribution is degenerate.
const DEFAULT_OOD_THRESHOLD: f64 = -50.0;
/// Percentile of training log-likelihood used as the OOD threshold.
const OOD_PERCENTILE: f64 = 0.005;

/// One training run's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub ticker: String,
    pub timeframe: String,
    pub scaler: ScalerKind,
    pub encoder: EncoderKind,
    /// None selects the latent dimension from explained variance
    pub latent_dim: Option<usize>,
    /// Rows per window for the temporal encoder
    pub encoder_window: usize,
    /// None selects the state count by BIC over `state_candidates`
    pub n_states: Option<usize>,
    pub state_candidates: Vec<usize>,
    pub covariance: CovarianceKind,
    pub clip_std: Option<f64>,
    pub train_fraction: f64,
    pub seed: u64,
    /// Try to relabel states for continuity with the previous model
    pub match_previous: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            ticker: String::new(),
            timeframe: "1h".into(),
            scaler: ScalerKind::Robust,
            encoder: EncoderKind::Pca,
            latent_dim: None,
            encoder_window: 8,
            n_states: None,
            state_candidates: (3..15).collect(),
            covariance: CovarianceKind::Diag,
            clip_std: Some(5.0),
            train_fraction: 0.8,
            seed: 42,
            match_previous: true,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.ticker.is_empty(), "ticker must not be empty");
        validate_timeframe(&self.timeframe)?;
        anyhow::ensure!(
            self.train_fraction > 0.0 && self.train_fraction < 1.0,
            "train fraction must be in (0, 1), got {}",
            self.train_fraction
        );
        if self.n_states.is_none() {
            anyhow::ensure!(
                !self.state_candidates.is_empty(),
                "automatic state selection needs candidate counts"
            );
        }
        Ok(())
    }
}

/// Summary of a completed training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    pub model_id: String,
    pub n_states: usize,
    pub latent_dim: usize,
    pub train_metrics: RegimeMetrics,
    pub val_metrics: RegimeMetrics,
    /// Variance fraction the encoder's components explain
    pub explained_variance: f64,
    /// Mean squared reconstruction error on the validation window
    pub reconstruction_error: f64,
    pub ood_log_likelihood_threshold: f64,
    pub state_labels: Vec<StateLabel>,
    pub state_mapping: Option<Vec<usize>>,
}

/// Components fitted on one training window.
struct FittedComponents {
    scaler: Scaler,
    encoder: Encoder,
    hmm: RegimeHmm,
    train_latent: ndarray::Array2<f64>,
    val_latent: ndarray::Array2<f64>,
    val_scaled: ndarray::Array2<f64>,
}

/// Trains, evaluates, and persists one model per run.
pub struct TrainingPipeline {
    store: ArtifactStore,
    config: TrainingConfig,
}

impl TrainingPipeline {
    pub fn new(store: ArtifactStore, config: TrainingConfig) -> Self {
        Self { store, config }
    }

    /// Run a full training pass over a time-ordered feature table and
    /// persist the resulting model.
    pub fn train(&self, table: &FeatureTable) -> anyhow::Result<TrainingResult> {
        self.config.validate()?;
        anyhow::ensure!(!table.is_empty(), "training table is empty");

        let split = TimeSplitter::new(self.config.train_fraction).split(table)?;
        validate_no_leakage(&split.train, &split.val)?;
        tracing::info!(
            ticker = %self.config.ticker,
            train_rows = split.train.n_samples(),
            val_rows = split.val.n_samples(),
            "training started"
        );

        let fitted = fit_components(&self.config, &split.train, &split.val)?;

        let train_metrics = fitted.hmm.metrics(&fitted.train_latent)?;
        let val_metrics = fitted.hmm.metrics(&fitted.val_latent)?;
        let explained_variance = fitted.encoder.explained_variance();
        let reconstruction_error =
            finite_mean(&fitted.encoder.reconstruction_error(&fitted.val_scaled));
        let ood_threshold = ood_threshold(&fitted.hmm, &fitted.train_latent);
        let state_labels = label_states(
            &fitted.hmm,
            &fitted.encoder,
            &table.names,
            &LabelingConfig::default(),
        );

        let state_mapping = if self.config.match_previous {
            self.relabel_against_previous(&fitted.hmm)
        } else {
            None
        };
        let parent_model_id = state_mapping
            .as_ref()
            .and_then(|_| self.previous_model_id());

        let created_at = Utc::now();
        let mut model_id = generate_model_id(created_at);
        let mut bump = 1;
        while self
            .store
            .model_dir(&self.config.ticker, &self.config.timeframe, &model_id)
            .exists()
        {
            model_id = format!("{}-{}", generate_model_id(created_at), bump);
            bump += 1;
        }

        let metadata = ModelMetadata {
            schema_version: SCHEMA_VERSION,
            model_id,
            ticker: self.config.ticker.clone(),
            timeframe: self.config.timeframe.clone(),
            created_at,
            feature_names: table.names.clone(),
            scaler: self.config.scaler,
            encoder: self.config.encoder,
            latent_dim: fitted.encoder.latent_dim(),
            n_states: fitted.hmm.n_states(),
            covariance: self.config.covariance,
            train_start: split.train_start,
            train_end: split.train_end,
            train_rows: split.train.n_samples(),
            metrics: val_metrics.clone(),
            ood_log_likelihood_threshold: ood_threshold,
            state_labels: state_labels.clone(),
            state_mapping: state_mapping.clone(),
            parent_model_id,
        };

        let result = TrainingResult {
            model_id: metadata.model_id.clone(),
            n_states: metadata.n_states,
            latent_dim: metadata.latent_dim,
            train_metrics,
            val_metrics,
            explained_variance,
            reconstruction_error,
            ood_log_likelihood_threshold: ood_threshold,
            state_labels,
            state_mapping,
        };

        let bundle = ModelBundle {
            scaler: fitted.scaler,
            encoder: fitted.encoder,
            hmm: fitted.hmm,
            metadata,
        };
        self.store.save(&bundle)?;

        tracing::info!(
            model_id = %result.model_id,
            n_states = result.n_states,
            val_log_likelihood = result.val_metrics.log_likelihood,
            "training finished"
        );
        Ok(result)
    }

    /// Hungarian-match new state means against the latest stored model.
    /// Any failure downgrades to fresh labels with a warning.
    fn relabel_against_previous(&self, hmm: &RegimeHmm) -> Option<Vec<usize>> {
        let previous = match self
            .store
            .latest(&self.config.ticker, &self.config.timeframe)
        {
            Ok(Some(bundle)) => bundle,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(error = %err, "could not load previous model, skipping state matching");
                return None;
            }
        };

        match match_states(&previous.hmm.state_means(), &hmm.state_means()) {
            Ok(mapping) => {
                tracing::info!(?mapping, parent = %previous.metadata.model_id, "states matched to previous model");
                Some(mapping)
            }
            Err(err) => {
                tracing::warn!(error = %err, "state matching failed, keeping fresh labels");
                None
            }
        }
    }

    fn previous_model_id(&self) -> Option<String> {
        self.store
            .list_models(&self.config.ticker, &self.config.timeframe)
            .ok()?
            .last()
            .map(|m| m.model_id.clone())
    }
}

/// Fit scaler -> encoder -> HMM on the training window only.
fn fit_components(
    config: &TrainingConfig,
    train: &FeatureTable,
    val: &FeatureTable,
) -> anyhow::Result<FittedComponents> {
    let scaler = Scaler::fit(config.scaler, &train.data, config.clip_std)?;
    let scaled_train = scaler.transform(&train.data);
    let scaled_val = scaler.transform(&val.data);

    let encoder = Encoder::fit(
        config.encoder,
        &scaled_train,
        config.latent_dim,
        config.encoder_window,
    )?;
    let train_latent = encoder.transform(&scaled_train);
    let val_latent = encoder.transform(&scaled_val);

    let base = HmmConfig {
        covariance: config.covariance,
        seed: config.seed,
        ..HmmConfig::default()
    };

    let hmm = match config.n_states {
        Some(k) => {
            let mut model = RegimeHmm::new(HmmConfig {
                n_states: k,
                ..base
            });
            model.fit(&train_latent)?;
            model
        }
        None => {
            let (model, scores) = select_n_states(&train_latent, &config.state_candidates, &base)?;
            tracing::info!(chosen = model.n_states(), candidates = scores.len(), "state count selected by BIC");
            model
        }
    };

    Ok(FittedComponents {
        scaler,
        encoder,
        hmm,
        train_latent,
        val_latent,
        val_scaled: scaled_val,
    })
}

/// Mean over the finite entries, NaN when none are.
fn finite_mean(values: &ndarray::Array1<f64>) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        f64::NAN
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    }
}

/// OOD threshold: a low percentile of the training rows' own emission
/// log-likelihood, so roughly that share of training data would flag.
fn ood_threshold(hmm: &RegimeHmm, train_latent: &ndarray::Array2<f64>) -> f64 {
    let mut lls: Vec<f64> = (0..train_latent.nrows())
        .map(|i| hmm.emission_log_likelihood(&train_latent.row(i).to_owned()))
        .filter(|v| v.is_finite())
        .collect();
    if lls.is_empty() {
        return DEFAULT_OOD_THRESHOLD;
    }
    lls.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((lls.len() - 1) as f64 * OOD_PERCENTILE).floor() as usize;
    lls[idx]
}

/// One walk-forward fold's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold: usize,
    pub n_states: usize,
    pub val_log_likelihood: f64,
    pub val_bic: f64,
    pub val_mean_dwell: f64,
}

/// Aggregated walk-forward validation report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossValidationReport {
    pub folds: Vec<FoldResult>,
    pub mean_log_likelihood: f64,
    pub std_log_likelihood: f64,
}

/// Walk-forward cross-validation: refit on each sliding window, score the
/// following validation window.
pub struct CrossValidator {
    pub train_window: usize,
    pub val_window: usize,
    pub step: usize,
}

impl CrossValidator {
    pub fn new(train_window: usize, val_window: usize, step: usize) -> Self {
        Self {
            train_window,
            val_window,
            step,
        }
    }

    pub fn run(
        &self,
        table: &FeatureTable,
        config: &TrainingConfig,
    ) -> anyhow::Result<CrossValidationReport> {
        config.validate()?;
        let windows = TimeSplitter::default().walk_forward(
            table,
            self.train_window,
            self.val_window,
            self.step,
        )?;

        let mut folds = Vec::new();
        for (fold, w) in windows.iter().enumerate() {
            let train = table.slice(w.train_start, w.train_end);
            let val = table.slice(w.val_start, w.val_end);
            validate_no_leakage(&train, &val)?;

            let fitted = match fit_components(config, &train, &val) {
                Ok(fitted) => fitted,
                Err(err) => {
                    tracing::warn!(fold, error = %err, "fold failed, skipping");
                    continue;
                }
            };
            let metrics = fitted.hmm.metrics(&fitted.val_latent)?;
            folds.push(FoldResult {
                fold,
                n_states: fitted.hmm.n_states(),
                val_log_likelihood: metrics.log_likelihood,
                val_bic: metrics.bic,
                val_mean_dwell: metrics.mean_dwell,
            });
        }

        anyhow::ensure!(!folds.is_empty(), "every walk-forward fold failed");

        let lls: Vec<f64> = folds.iter().map(|f| f.val_log_likelihood).collect();
        let mean_log_likelihood = (&lls).mean();
        let std_log_likelihood = if lls.len() > 1 { (&lls).std_dev() } else { 0.0 };

        Ok(CrossValidationReport {
            folds,
            mean_log_likelihood,
            std_log_likelihood,
        })
    }
}

/// One grid cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    pub latent_dim: usize,
    pub n_states: usize,
    pub covariance: CovarianceKind,
}

/// Validation metric a grid search optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningMetric {
    LogLikelihood,
    Bic,
    Aic,
}

impl TuningMetric {
    fn score(&self, metrics: &RegimeMetrics) -> f64 {
        match self {
            TuningMetric::LogLikelihood => metrics.log_likelihood,
            TuningMetric::Bic => metrics.bic,
            TuningMetric::Aic => metrics.aic,
        }
    }

    /// Whether `a` beats `b`. Information criteria prefer lower values.
    fn better(&self, a: f64, b: f64) -> bool {
        match self {
            TuningMetric::LogLikelihood => a > b,
            TuningMetric::Bic | TuningMetric::Aic => a < b,
        }
    }
}

impl std::fmt::Display for TuningMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TuningMetric::LogLikelihood => "log-likelihood",
            TuningMetric::Bic => "bic",
            TuningMetric::Aic => "aic",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for TuningMetric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log-likelihood" | "log_likelihood" | "ll" => Ok(TuningMetric::LogLikelihood),
            "bic" => Ok(TuningMetric::Bic),
            "aic" => Ok(TuningMetric::Aic),
            other => anyhow::bail!(
                "unknown tuning metric '{}', expected log-likelihood, bic, or aic",
                other
            ),
        }
    }
}

/// Grid evaluation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningReport {
    pub best: GridPoint,
    pub metric: TuningMetric,
    pub best_score: f64,
    /// Every evaluated cell with its validation score
    pub evaluated: Vec<(GridPoint, f64)>,
}

/// Exhaustive grid search scored on the validation window.
pub struct HyperparameterTuner {
    pub latent_dims: Vec<usize>,
    pub state_counts: Vec<usize>,
    pub covariances: Vec<CovarianceKind>,
    pub metric: TuningMetric,
}

impl Default for HyperparameterTuner {
    fn default() -> Self {
        Self {
            latent_dims: vec![2, 3, 4],
            state_counts: vec![3, 4, 5, 6],
            covariances: vec![CovarianceKind::Diag, CovarianceKind::Full],
            metric: TuningMetric::LogLikelihood,
        }
    }
}

impl HyperparameterTuner {
    pub fn run(
        &self,
        table: &FeatureTable,
        base: &TrainingConfig,
    ) -> anyhow::Result<TuningReport> {
        base.validate()?;
        let split = TimeSplitter::new(base.train_fraction).split(table)?;

        let mut evaluated = Vec::new();
        let mut best: Option<(GridPoint, f64)> = None;

        for &latent_dim in &self.latent_dims {
            for &n_states in &self.state_counts {
                for &covariance in &self.covariances {
                    let point = GridPoint {
                        latent_dim,
                        n_states,
                        covariance,
                    };
                    let mut config = base.clone();
                    config.latent_dim = Some(latent_dim);
                    config.n_states = Some(n_states);
                    config.covariance = covariance;

                    let score = match fit_components(&config, &split.train, &split.val)
                        .and_then(|f| f.hmm.metrics(&f.val_latent))
                        .map(|m| self.metric.score(&m))
                    {
                        Ok(score) if score.is_finite() => score,
                        Ok(_) => {
                            tracing::warn!(?point, "non-finite validation score, skipping cell");
                            continue;
                        }
                        Err(err) => {
                            tracing::warn!(?point, error = %err, "grid cell failed, skipping");
                            continue;
                        }
                    };

                    tracing::debug!(?point, score, metric = %self.metric, "grid cell scored");
                    if best.as_ref().map_or(true, |(_, s)| self.metric.better(score, *s)) {
                        best = Some((point.clone(), score));
                    }
                    evaluated.push((point, score));
                }
            }
        }

        let (best, best_score) =
            best.ok_or_else(|| anyhow::anyhow!("every grid cell failed to fit"))?;
        Ok(TuningReport {
            best,
            metric: self.metric,
            best_score,
            evaluated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Time-ordered table alternating between two 4D clusters.
    fn synthetic_table(n_blocks: usize, block: usize, seed: u64) -> FeatureTable {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = n_blocks * block;
        let mut data = Array2::zeros((n, 4));
        for b in 0..n_blocks {
            let center = if b % 2 == 0 { 0.0 } else { 5.0 };
            for i in 0..block {
                for j in 0..4 {
                    data[[b * block + i, j]] = center + rng.gen::<f64>() - 0.5;
                }
            }
        }
        let timestamps = (0..n)
            .map(|i| {
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::hours(i as i64)
            })
            .collect();
        let names = vec!["ret".into(), "vol".into(), "range".into(), "flow".into()];
        FeatureTable::new(data, names, timestamps).unwrap()
    }

    fn temp_store(name: &str) -> ArtifactStore {
        let dir = std::env::temp_dir().join(format!("regime_tracker_train_{}", name));
        std::fs::remove_dir_all(&dir).ok();
        ArtifactStore::new(dir)
    }

    fn config(ticker: &str) -> TrainingConfig {
        TrainingConfig {
            ticker: ticker.into(),
            latent_dim: Some(2),
            n_states: Some(2),
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_train_persists_loadable_model() {
        let store = temp_store("persist");
        let table = synthetic_table(10, 30, 1);
        let pipeline = TrainingPipeline::new(store.clone(), config("BTCUSDT"));

        let result = pipeline.train(&table).unwrap();
        assert_eq!(result.n_states, 2);
        assert!(result.val_metrics.log_likelihood.is_finite());
        assert!(result.explained_variance > 0.0 && result.explained_variance <= 1.0 + 1e-9);
        assert!(result.reconstruction_error.is_finite());
        assert!(result.ood_log_likelihood_threshold.is_finite());
        assert_eq!(result.state_labels.len(), 2);

        let bundle = store
            .load("BTCUSDT", "1h", &result.model_id)
            .unwrap();
        assert_eq!(bundle.metadata.feature_names, table.names);
        assert_eq!(bundle.metadata.state_labels, result.state_labels);
        assert_eq!(bundle.metadata.train_rows, 240);
        assert!(bundle.metadata.train_end < table.timestamps[240]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let table = synthetic_table(4, 30, 2);
        let mut bad = config("");
        bad.ticker = String::new();
        assert!(TrainingPipeline::new(temp_store("badcfg"), bad)
            .train(&table)
            .is_err());

        let mut bad_tf = config("BTCUSDT");
        bad_tf.timeframe = "soon".into();
        assert!(TrainingPipeline::new(temp_store("badtf"), bad_tf)
            .train(&table)
            .is_err());
    }

    #[test]
    fn test_retrain_records_state_mapping() {
        let store = temp_store("mapping");
        let table = synthetic_table(10, 30, 3);
        let pipeline = TrainingPipeline::new(store.clone(), config("BTCUSDT"));

        let first = pipeline.train(&table).unwrap();
        assert!(first.state_mapping.is_none());

        let second = pipeline.train(&table).unwrap();
        let mapping = second.state_mapping.expect("second run should match states");
        let mut sorted = mapping.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1]);

        let bundle = store.load("BTCUSDT", "1h", &second.model_id).unwrap();
        assert!(bundle.metadata.parent_model_id.is_some());
    }

    #[test]
    fn test_ood_threshold_is_low_percentile() {
        let table = synthetic_table(8, 30, 5);
        let cfg = config("BTCUSDT");
        let split = TimeSplitter::new(0.8).split(&table).unwrap();
        let fitted = fit_components(&cfg, &split.train, &split.val).unwrap();

        let threshold = ood_threshold(&fitted.hmm, &fitted.train_latent);
        let flagged = (0..fitted.train_latent.nrows())
            .filter(|&i| {
                fitted
                    .hmm
                    .emission_log_likelihood(&fitted.train_latent.row(i).to_owned())
                    < threshold
            })
            .count();
        // At most ~0.5% of training rows may fall under their own threshold
        assert!(flagged as f64 <= 0.01 * fitted.train_latent.nrows() as f64);
    }

    #[test]
    fn test_walk_forward_aggregates_folds() {
        let table = synthetic_table(12, 30, 7);
        let report = CrossValidator::new(160, 40, 40)
            .run(&table, &config("BTCUSDT"))
            .unwrap();
        assert!(report.folds.len() >= 3);
        assert!(report.mean_log_likelihood.is_finite());
        assert!(report.std_log_likelihood >= 0.0);
    }

    #[test]
    fn test_tuner_prefers_separable_cell() {
        let table = synthetic_table(10, 30, 9);
        let tuner = HyperparameterTuner {
            latent_dims: vec![2],
            state_counts: vec![2, 3],
            covariances: vec![CovarianceKind::Diag],
            ..Default::default()
        };
        let mut base = config("BTCUSDT");
        base.n_states = None;
        base.latent_dim = None;
        let report = tuner.run(&table, &base).unwrap();
        assert!(!report.evaluated.is_empty());
        assert!(report.best_score.is_finite());
        assert_eq!(report.best.latent_dim, 2);
    }

    #[test]
    fn test_tuner_honors_configured_metric() {
        let table = synthetic_table(10, 30, 11);
        let mut base = config("BTCUSDT");
        base.n_states = None;
        base.latent_dim = None;

        let by_bic = HyperparameterTuner {
            latent_dims: vec![2],
            state_counts: vec![2, 3],
            covariances: vec![CovarianceKind::Diag],
            metric: TuningMetric::Bic,
        };
        let report = by_bic.run(&table, &base).unwrap();
        assert_eq!(report.metric, TuningMetric::Bic);
        // Lower is better for an information criterion
        for (_, score) in &report.evaluated {
            assert!(report.best_score <= *score + 1e-9);
        }
    }

    #[test]
    fn test_tuning_metric_parses_and_orders() {
        assert_eq!(
            "bic".parse::<TuningMetric>().unwrap(),
            TuningMetric::Bic
        );
        assert_eq!(
            "log-likelihood".parse::<TuningMetric>().unwrap(),
            TuningMetric::LogLikelihood
        );
        assert!("sharpe".parse::<TuningMetric>().is_err());

        assert!(TuningMetric::LogLikelihood.better(-10.0, -20.0));
        assert!(TuningMetric::Bic.better(100.0, 200.0));
        assert!(TuningMetric::Aic.better(100.0, 200.0));
    }
}
