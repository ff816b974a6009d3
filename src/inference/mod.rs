//! Online regime inference
//!
//! One observation in, one classification out. The engine scales and encodes
//! the observation, screens it against the training distribution, and runs
//! the raw model decision through dwell, probability, and majority-vote
//! gates so the published state does not chatter bar to bar.

use crate::data::{FeatureTable, FeatureVector};
use crate::encoder::Encoder;
use crate::model::{RegimeHmm, UNKNOWN_STATE};
use crate::scaler::Scaler;
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fraction of trained features that may be absent before an observation
/// is rejected as a contract violation rather than degraded.
const MAX_MISSING_FRACTION: f64 = 0.2;

/// Anti-chatter and screening knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Raw-state posterior required to publish a switch
    pub switch_threshold: f64,
    /// Bars the published state must persist before it may switch
    pub min_dwell_bars: usize,
    /// Raw-state majority vote window
    pub vote_window: usize,
    /// Emission log-likelihood below which an observation is out-of-distribution
    pub ood_log_likelihood_threshold: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            switch_threshold: 0.6,
            min_dwell_bars: 3,
            vote_window: 3,
            ood_log_likelihood_threshold: -50.0,
        }
    }
}

/// One classified observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// Published regime id; -1 means unknown
    pub state_id: i64,
    /// Posterior probability of the published state
    pub confidence: f64,
    /// Full posterior over model states
    pub posterior: Vec<f64>,
    /// Emission log-likelihood of the encoded observation
    pub log_likelihood: f64,
    pub is_ood: bool,
    /// Encoded observation, empty while a temporal window is warming up
    pub latent: Vec<f64>,
    pub model_id: String,
}

impl InferenceOutput {
    /// Unknown-state output with a uniform posterior.
    pub fn unknown(
        symbol: String,
        timestamp: DateTime<Utc>,
        n_states: usize,
        log_likelihood: f64,
        is_ood: bool,
        latent: Vec<f64>,
        model_id: String,
    ) -> Self {
        let uniform = 1.0 / n_states.max(1) as f64;
        Self {
            symbol,
            timestamp,
            state_id: UNKNOWN_STATE,
            confidence: uniform,
            posterior: vec![uniform; n_states],
            log_likelihood,
            is_ood,
            latent,
            model_id,
        }
    }

    /// Shannon entropy of the posterior, in nats.
    pub fn entropy(&self) -> f64 {
        -self
            .posterior
            .iter()
            .filter(|&&p| p > 0.0)
            .map(|&p| p * p.ln())
            .sum::<f64>()
    }
}

/// Mutable per-stream decision state.
#[derive(Debug, Clone)]
struct EngineState {
    stable_state: i64,
    /// Bars since the published state last changed (or began)
    dwell: usize,
    /// Most recent raw model decisions
    recent_raw: VecDeque<i64>,
    /// Scaled rows buffered for temporal encoders
    window: VecDeque<Array1<f64>>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            stable_state: UNKNOWN_STATE,
            dwell: 0,
            recent_raw: VecDeque::new(),
            window: VecDeque::new(),
        }
    }
}

/// Streaming regime classifier over a loaded model.
pub struct InferenceEngine {
    scaler: Scaler,
    encoder: Encoder,
    hmm: RegimeHmm,
    feature_names: Vec<String>,
    model_id: String,
    config: InferenceConfig,
    state: EngineState,
}

impl InferenceEngine {
    pub fn new(
        scaler: Scaler,
        encoder: Encoder,
        hmm: RegimeHmm,
        feature_names: Vec<String>,
        model_id: String,
        config: InferenceConfig,
    ) -> Self {
        Self {
            scaler,
            encoder,
            hmm,
            feature_names,
            model_id,
            config,
            state: EngineState::new(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn n_states(&self) -> usize {
        self.hmm.n_states()
    }

    /// Currently published state.
    pub fn stable_state(&self) -> i64 {
        self.state.stable_state
    }

    /// Forget all per-stream state. Required before switching streams.
    pub fn reset(&mut self) {
        self.state = EngineState::new();
    }

    /// Classify one observation.
    ///
    /// Errors only on a feature-contract violation (more than 20% of the
    /// trained feature names absent). NaN values and other per-bar problems
    /// degrade to an unknown output rather than failing the stream.
    pub fn process(&mut self, observation: &FeatureVector) -> anyhow::Result<InferenceOutput> {
        let missing = self
            .feature_names
            .iter()
            .filter(|name| !observation.features.contains_key(name.as_str()))
            .count();
        let missing_fraction = missing as f64 / self.feature_names.len().max(1) as f64;
        anyhow::ensure!(
            missing_fraction <= MAX_MISSING_FRACTION,
            "{} of {} trained features missing from observation at {}",
            missing,
            self.feature_names.len(),
            observation.timestamp
        );

        let raw_row = observation.to_array(&self.feature_names);
        let scaled = self.scaler.transform_row(&raw_row);

        let latent = match self.encode(scaled) {
            Some(latent) => latent,
            None => {
                // Temporal window still warming up
                self.state.dwell += 1;
                return Ok(self.unknown_output(observation, f64::NAN, false, vec![]));
            }
        };

        if latent.iter().any(|v| !v.is_finite()) {
            self.state.dwell += 1;
            return Ok(self.unknown_output(observation, f64::NAN, false, latent.to_vec()));
        }

        // Screen against the training distribution before decoding
        let log_likelihood = self.hmm.emission_log_likelihood(&latent);
        if !log_likelihood.is_finite()
            || log_likelihood < self.config.ood_log_likelihood_threshold
        {
            tracing::debug!(
                symbol = %observation.symbol,
                log_likelihood,
                threshold = self.config.ood_log_likelihood_threshold,
                "observation out of distribution"
            );
            self.state.dwell += 1;
            return Ok(self.unknown_output(observation, log_likelihood, true, latent.to_vec()));
        }

        let posterior = self.hmm.filter_posterior(&latent);
        if posterior.iter().any(|v| !v.is_finite()) {
            self.state.dwell += 1;
            return Ok(self.unknown_output(observation, log_likelihood, false, latent.to_vec()));
        }
        let (raw_state, raw_prob) = argmax(&posterior);

        let published = self.apply_gates(raw_state as i64, raw_prob);
        self.push_raw(raw_state as i64);

        let confidence = if published >= 0 {
            posterior[published as usize]
        } else {
            raw_prob
        };

        Ok(InferenceOutput {
            symbol: observation.symbol.clone(),
            timestamp: observation.timestamp,
            state_id: published,
            confidence,
            posterior: posterior.to_vec(),
            log_likelihood,
            is_ood: false,
            latent: latent.to_vec(),
            model_id: self.model_id.clone(),
        })
    }

    /// Classify a whole table in order, starting from a clean slate.
    ///
    /// The engine keys its decision state to one stream, so the caller
    /// names the symbol for the whole table.
    pub fn process_batch(
        &mut self,
        table: &FeatureTable,
        symbol: &str,
    ) -> anyhow::Result<Vec<InferenceOutput>> {
        if symbol.is_empty() {
            tracing::warn!("classifying a batch with an empty symbol");
        }
        self.reset();
        let mut outputs = Vec::with_capacity(table.n_samples());
        for i in 0..table.n_samples() {
            // NaN cells stay in the map so a sparse bar degrades to
            // unknown instead of tripping the feature contract
            let features = table
                .names
                .iter()
                .zip(table.data.row(i).iter())
                .map(|(n, v)| (n.clone(), *v))
                .collect();
            let observation = FeatureVector {
                symbol: symbol.to_string(),
                timestamp: table.timestamps[i],
                features,
            };
            outputs.push(self.process(&observation)?);
        }
        Ok(outputs)
    }

    /// Produce the latent row for one scaled observation, buffering rows
    /// for temporal encoders. None while the window is incomplete.
    fn encode(&mut self, scaled: Array1<f64>) -> Option<Array1<f64>> {
        let context = self.encoder.context_rows();
        if context <= 1 {
            let matrix = scaled.insert_axis(Axis(0));
            return Some(self.encoder.transform(&matrix).row(0).to_owned());
        }

        self.state.window.push_back(scaled);
        while self.state.window.len() > context {
            self.state.window.pop_front();
        }
        if self.state.window.len() < context {
            return None;
        }

        let d = self.state.window[0].len();
        let mut rows = Array2::zeros((context, d));
        for (i, row) in self.state.window.iter().enumerate() {
            rows.row_mut(i).assign(row);
        }
        match &self.encoder {
            Encoder::TemporalPca(enc) => enc.transform_window(&rows).ok(),
            Encoder::Pca(_) => unreachable!("context_rows > 1 implies temporal encoder"),
        }
    }

    /// Dwell, probability, and majority-vote gates between the raw model
    /// decision and the published state.
    fn apply_gates(&mut self, raw_state: i64, raw_prob: f64) -> i64 {
        if self.state.stable_state == UNKNOWN_STATE {
            // First classifiable bar seeds the published state directly
            self.state.stable_state = raw_state;
            self.state.dwell = 1;
            return raw_state;
        }

        if raw_state == self.state.stable_state {
            self.state.dwell += 1;
            return self.state.stable_state;
        }

        let dwell_ok = self.state.dwell >= self.config.min_dwell_bars;
        let prob_ok = raw_prob >= self.config.switch_threshold;
        // Vote gate only arms once a full window of prior raw decisions
        // exists; the current bar is not its own vote
        let vote_ok = if self.state.recent_raw.len() >= self.config.vote_window {
            self.majority_raw_state() == raw_state
        } else {
            true
        };

        if dwell_ok && prob_ok && vote_ok {
            tracing::info!(
                from = self.state.stable_state,
                to = raw_state,
                raw_prob,
                "regime switch published"
            );
            self.state.stable_state = raw_state;
            self.state.dwell = 1;
        } else {
            self.state.dwell += 1;
        }
        self.state.stable_state
    }

    /// Most common state in the recorded raw window, lowest id on ties.
    fn majority_raw_state(&self) -> i64 {
        let mut counts = vec![0usize; self.hmm.n_states()];
        for &s in &self.state.recent_raw {
            if s >= 0 && (s as usize) < counts.len() {
                counts[s as usize] += 1;
            }
        }
        counts
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
            .map(|(i, _)| i as i64)
            .unwrap_or(UNKNOWN_STATE)
    }

    fn push_raw(&mut self, raw_state: i64) {
        self.state.recent_raw.push_back(raw_state);
        while self.state.recent_raw.len() > self.config.vote_window {
            self.state.recent_raw.pop_front();
        }
    }

    fn unknown_output(
        &self,
        observation: &FeatureVector,
        log_likelihood: f64,
        is_ood: bool,
        latent: Vec<f64>,
    ) -> InferenceOutput {
        InferenceOutput::unknown(
            observation.symbol.clone(),
            observation.timestamp,
            self.hmm.n_states(),
            log_likelihood,
            is_ood,
            latent,
            self.model_id.clone(),
        )
    }
}

fn argmax(values: &Array1<f64>) -> (usize, f64) {
    let mut best = 0;
    let mut best_val = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    (best, best_val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderKind;
    use crate::model::HmmConfig;
    use crate::scaler::ScalerKind;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    const NAMES: [&str; 4] = ["ret", "vol", "range", "flow"];

    fn ts(i: usize) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(i as i64)
    }

    fn cluster_row(rng: &mut StdRng, center: f64) -> Vec<f64> {
        (0..4).map(|_| center + rng.gen::<f64>() * 0.4 - 0.2).collect()
    }

    /// Train a 2-state engine on alternating blocks around 0.0 and 5.0.
    fn trained_engine(config: InferenceConfig) -> InferenceEngine {
        let mut rng = StdRng::seed_from_u64(77);
        let mut rows = Vec::new();
        for block in 0..8 {
            let center = if block % 2 == 0 { 0.0 } else { 5.0 };
            for _ in 0..25 {
                rows.extend(cluster_row(&mut rng, center));
            }
        }
        let x = Array2::from_shape_vec((200, 4), rows).unwrap();

        let scaler = Scaler::fit(ScalerKind::Standard, &x, Some(5.0)).unwrap();
        let scaled = scaler.transform(&x);
        let encoder = Encoder::fit(EncoderKind::Pca, &scaled, Some(2), 1).unwrap();
        let latent = encoder.transform(&scaled);
        let mut hmm = RegimeHmm::new(HmmConfig {
            n_states: 2,
            ..HmmConfig::default()
        });
        hmm.fit(&latent).unwrap();

        InferenceEngine::new(
            scaler,
            encoder,
            hmm,
            NAMES.iter().map(|s| s.to_string()).collect(),
            "m-test".into(),
            config,
        )
    }

    fn obs(i: usize, center: f64, seed: u64) -> FeatureVector {
        let mut rng = StdRng::seed_from_u64(seed + i as u64);
        let features: HashMap<String, f64> = NAMES
            .iter()
            .map(|&n| (n.to_string(), center + rng.gen::<f64>() * 0.4 - 0.2))
            .collect();
        FeatureVector {
            symbol: "BTCUSDT".into(),
            timestamp: ts(i),
            features,
        }
    }

    #[test]
    fn test_first_observation_seeds_state() {
        let mut engine = trained_engine(InferenceConfig::default());
        let out = engine.process(&obs(0, 0.0, 1)).unwrap();
        assert!(out.state_id >= 0);
        assert!(!out.is_ood);
        assert_eq!(out.state_id, engine.stable_state());
        // The encoded observation rides along with the decision
        assert_eq!(out.latent.len(), 2);
        assert!(out.latent.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_single_bar_blip_is_suppressed() {
        let mut engine = trained_engine(InferenceConfig::default());
        let mut states = Vec::new();
        // Pattern: low, low, low, HIGH, low, low, low
        for (i, &center) in [0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0].iter().enumerate() {
            states.push(engine.process(&obs(i, center, 10)).unwrap().state_id);
        }
        let seeded = states[0];
        assert!(states.iter().all(|&s| s == seeded), "blip leaked: {:?}", states);
    }

    #[test]
    fn test_sustained_shift_eventually_switches() {
        let mut engine = trained_engine(InferenceConfig::default());
        for i in 0..5 {
            engine.process(&obs(i, 0.0, 20)).unwrap();
        }
        let before = engine.stable_state();
        let mut last = None;
        for i in 5..15 {
            last = Some(engine.process(&obs(i, 5.0, 20)).unwrap());
        }
        let last = last.unwrap();
        // The switch must land on a real state, not leak out as unknown
        assert!(last.state_id >= 0);
        assert_ne!(last.state_id, before);
        assert!(!last.is_ood);
        let total: f64 = last.posterior.iter().sum();
        assert!((total - 1.0).abs() < 1e-9, "posterior {:?}", last.posterior);
        assert!(last.confidence >= engine.config.switch_threshold);
    }

    #[test]
    fn test_switch_waits_for_raw_majority() {
        let mut engine = trained_engine(InferenceConfig::default());
        let mut states = Vec::new();
        for (i, &center) in [0.0, 0.0, 0.0, 5.0, 5.0, 5.0, 5.0].iter().enumerate() {
            states.push(engine.process(&obs(i, center, 25)).unwrap().state_id);
        }
        let old = states[0];
        // Dwell and probability pass from the first shifted bar, but the
        // vote window still remembers the old regime for two more bars
        assert_eq!(states[3], old);
        assert_eq!(states[4], old);
        assert_ne!(states[5], old);
        assert_eq!(states[6], states[5]);
    }

    #[test]
    fn test_low_confidence_blocks_switch() {
        let mut engine = trained_engine(InferenceConfig {
            switch_threshold: 1.01, // unreachable
            ..InferenceConfig::default()
        });
        for i in 0..5 {
            engine.process(&obs(i, 0.0, 30)).unwrap();
        }
        let before = engine.stable_state();
        for i in 5..20 {
            assert_eq!(engine.process(&obs(i, 5.0, 30)).unwrap().state_id, before);
        }
    }

    #[test]
    fn test_outlier_is_ood_and_preserves_stable_state() {
        let mut engine = trained_engine(InferenceConfig::default());
        for i in 0..4 {
            engine.process(&obs(i, 0.0, 40)).unwrap();
        }
        let before = engine.stable_state();

        let out = engine.process(&obs(4, 500.0, 40)).unwrap();
        assert_eq!(out.state_id, UNKNOWN_STATE);
        assert!(out.is_ood);
        // Uniform posterior means maximal entropy
        assert!((out.entropy() - (2.0_f64).ln()).abs() < 1e-12);

        let after = engine.process(&obs(5, 0.0, 40)).unwrap();
        assert_eq!(after.state_id, before);
    }

    #[test]
    fn test_excess_missing_features_is_error() {
        let mut engine = trained_engine(InferenceConfig::default());
        let mut observation = obs(0, 0.0, 50);
        observation.features.remove("ret");
        observation.features.remove("vol");
        assert!(engine.process(&observation).is_err());
    }

    #[test]
    fn test_batch_matches_streaming() {
        let mut engine = trained_engine(InferenceConfig::default());

        let n = 30;
        let mut data = Array2::zeros((n, 4));
        let mut timestamps = Vec::new();
        for i in 0..n {
            let center = if i < 15 { 0.0 } else { 5.0 };
            let o = obs(i, center, 60);
            data.row_mut(i).assign(&o.to_array(
                &NAMES.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            ));
            timestamps.push(ts(i));
        }
        let table = FeatureTable::new(
            data,
            NAMES.iter().map(|s| s.to_string()).collect(),
            timestamps,
        )
        .unwrap();

        let batch = engine.process_batch(&table, "BTCUSDT").unwrap();
        assert_eq!(batch.len(), n);
        assert!(batch.iter().all(|o| o.symbol == "BTCUSDT"));

        // Re-running resets and reproduces the same decisions
        let again = engine.process_batch(&table, "BTCUSDT").unwrap();
        for (a, b) in batch.iter().zip(again.iter()) {
            assert_eq!(a.state_id, b.state_id);
        }
    }

    #[test]
    fn test_temporal_encoder_warms_up_as_unknown() {
        let mut rng = StdRng::seed_from_u64(91);
        let mut rows = Vec::new();
        for block in 0..8 {
            let center = if block % 2 == 0 { 0.0 } else { 5.0 };
            for _ in 0..25 {
                rows.extend(cluster_row(&mut rng, center));
            }
        }
        let x = Array2::from_shape_vec((200, 4), rows).unwrap();
        let scaler = Scaler::fit(ScalerKind::Standard, &x, Some(5.0)).unwrap();
        let scaled = scaler.transform(&x);
        let encoder = Encoder::fit(EncoderKind::TemporalPca, &scaled, Some(2), 4).unwrap();
        let latent = encoder.transform(&scaled);
        let mut hmm = RegimeHmm::new(HmmConfig {
            n_states: 2,
            ..HmmConfig::default()
        });
        hmm.fit(&latent).unwrap();

        let mut engine = InferenceEngine::new(
            scaler,
            encoder,
            hmm,
            NAMES.iter().map(|s| s.to_string()).collect(),
            "m-temporal".into(),
            InferenceConfig::default(),
        );

        for i in 0..3 {
            let out = engine.process(&obs(i, 0.0, 70)).unwrap();
            assert_eq!(out.state_id, UNKNOWN_STATE, "bar {} should be warmup", i);
            assert!(!out.is_ood);
            assert!(out.latent.is_empty());
        }
        let out = engine.process(&obs(3, 0.0, 70)).unwrap();
        assert!(out.state_id >= 0);
        assert_eq!(out.latent.len(), 2);
    }
}
