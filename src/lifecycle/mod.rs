//! Deployed-model lifecycle: health, drift, shadow evaluation, retraining
//!
//! Everything here consumes the engine's `InferenceOutput` stream; nothing
//! reaches back into model internals, so monitors work identically for any
//! model the artifact store can load.

use crate::artifacts::ModelMetadata;
use crate::inference::{InferenceEngine, InferenceOutput};
use crate::model::UNKNOWN_STATE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, VecDeque};

/// PSI above which state distributions are drifting.
pub const PSI_WARNING: f64 = 0.1;
/// PSI above which drift is severe.
pub const PSI_SEVERE: f64 = 0.25;

const PSI_EPS: f64 = 1e-6;

/// Rolling-window health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Observations kept in the rolling window
    pub window: usize,
    /// Alert when this share of the window is out-of-distribution
    pub ood_rate_ceiling: f64,
    /// Alert when window means drift this many baseline std devs
    pub z_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 500,
            ood_rate_ceiling: 0.2,
            z_threshold: 3.0,
        }
    }
}

/// Reference statistics captured when a model is deployed, typically from
/// its validation outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthBaseline {
    pub mean_log_likelihood: f64,
    pub std_log_likelihood: f64,
    pub mean_entropy: f64,
    pub std_entropy: f64,
}

impl HealthBaseline {
    pub fn from_outputs(outputs: &[InferenceOutput]) -> Option<Self> {
        let lls: Vec<f64> = outputs
            .iter()
            .map(|o| o.log_likelihood)
            .filter(|v| v.is_finite())
            .collect();
        if lls.len() < 2 {
            return None;
        }
        let entropies: Vec<f64> = outputs.iter().map(|o| o.entropy()).collect();
        Some(Self {
            mean_log_likelihood: (&lls).mean(),
            std_log_likelihood: (&lls).std_dev(),
            mean_entropy: (&entropies).mean(),
            std_entropy: (&entropies).std_dev(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthAlert {
    OodRateHigh,
    LogLikelihoodAnomaly,
    EntropyAnomaly,
}

/// Snapshot of the rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub observations: usize,
    pub ood_rate: f64,
    pub mean_log_likelihood: f64,
    pub mean_entropy: f64,
    /// Share of window bars per published state, unknown included
    pub occupancy: BTreeMap<i64, f64>,
    pub alerts: Vec<HealthAlert>,
}

struct HealthRecord {
    state_id: i64,
    log_likelihood: f64,
    entropy: f64,
    is_ood: bool,
}

/// Tracks classification quality over a rolling window of outputs.
pub struct HealthMonitor {
    config: HealthConfig,
    baseline: Option<HealthBaseline>,
    window: VecDeque<HealthRecord>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, baseline: Option<HealthBaseline>) -> Self {
        Self {
            config,
            baseline,
            window: VecDeque::new(),
        }
    }

    pub fn observe(&mut self, output: &InferenceOutput) {
        self.window.push_back(HealthRecord {
            state_id: output.state_id,
            log_likelihood: output.log_likelihood,
            entropy: output.entropy(),
            is_ood: output.is_ood,
        });
        while self.window.len() > self.config.window {
            self.window.pop_front();
        }
    }

    pub fn report(&self) -> HealthReport {
        let n = self.window.len();
        if n == 0 {
            return HealthReport {
                observations: 0,
                ood_rate: 0.0,
                mean_log_likelihood: f64::NAN,
                mean_entropy: f64::NAN,
                occupancy: BTreeMap::new(),
                alerts: vec![],
            };
        }

        let ood = self.window.iter().filter(|r| r.is_ood).count();
        let ood_rate = ood as f64 / n as f64;

        let lls: Vec<f64> = self
            .window
            .iter()
            .map(|r| r.log_likelihood)
            .filter(|v| v.is_finite())
            .collect();
        let mean_ll = if lls.is_empty() { f64::NAN } else { (&lls).mean() };

        let entropies: Vec<f64> = self.window.iter().map(|r| r.entropy).collect();
        let mean_entropy = (&entropies).mean();

        let mut occupancy = BTreeMap::new();
        for r in &self.window {
            *occupancy.entry(r.state_id).or_insert(0.0) += 1.0;
        }
        for v in occupancy.values_mut() {
            *v /= n as f64;
        }

        let mut alerts = Vec::new();
        if ood_rate > self.config.ood_rate_ceiling {
            alerts.push(HealthAlert::OodRateHigh);
        }
        if let Some(baseline) = &self.baseline {
            if baseline.std_log_likelihood > 0.0
                && mean_ll.is_finite()
                && (mean_ll - baseline.mean_log_likelihood).abs() / baseline.std_log_likelihood
                    > self.config.z_threshold
            {
                alerts.push(HealthAlert::LogLikelihoodAnomaly);
            }
            if baseline.std_entropy > 0.0
                && (mean_entropy - baseline.mean_entropy).abs() / baseline.std_entropy
                    > self.config.z_threshold
            {
                alerts.push(HealthAlert::EntropyAnomaly);
            }
        }

        HealthReport {
            observations: n,
            ood_rate,
            mean_log_likelihood: mean_ll,
            mean_entropy,
            occupancy,
            alerts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    Stable,
    Warning,
    Severe,
}

/// Population stability index between two published-state samples.
///
/// States are binned by id with the unknown label as its own bin; empty
/// bins are epsilon-smoothed so the index stays finite.
pub fn population_stability_index(reference: &[i64], current: &[i64], n_states: usize) -> f64 {
    let bins = n_states + 1; // last bin is unknown
    let bin_of = |state: i64| -> usize {
        if state == UNKNOWN_STATE || state < 0 || state as usize >= n_states {
            n_states
        } else {
            state as usize
        }
    };

    let proportions = |sample: &[i64]| -> Vec<f64> {
        let mut counts = vec![0.0; bins];
        for &s in sample {
            counts[bin_of(s)] += 1.0;
        }
        let total = sample.len().max(1) as f64;
        counts.into_iter().map(|c| (c / total).max(PSI_EPS)).collect()
    };

    let p = proportions(reference);
    let q = proportions(current);
    p.iter()
        .zip(q.iter())
        .map(|(&p, &q)| (q - p) * (q / p).ln())
        .sum()
}

pub fn classify_drift(psi: f64) -> DriftSeverity {
    if psi >= PSI_SEVERE {
        DriftSeverity::Severe
    } else if psi >= PSI_WARNING {
        DriftSeverity::Warning
    } else {
        DriftSeverity::Stable
    }
}

/// Sliding drift detector: fixed reference window vs a rolling current window.
pub struct DriftDetector {
    n_states: usize,
    reference: Vec<i64>,
    current: VecDeque<i64>,
    window: usize,
}

impl DriftDetector {
    pub fn new(n_states: usize, reference: Vec<i64>, window: usize) -> Self {
        Self {
            n_states,
            reference,
            current: VecDeque::new(),
            window,
        }
    }

    pub fn observe(&mut self, state_id: i64) {
        self.current.push_back(state_id);
        while self.current.len() > self.window {
            self.current.pop_front();
        }
    }

    pub fn psi(&self) -> f64 {
        let current: Vec<i64> = self.current.iter().copied().collect();
        population_stability_index(&self.reference, &current, self.n_states)
    }

    pub fn severity(&self) -> DriftSeverity {
        classify_drift(self.psi())
    }
}

/// Side-by-side comparison of a candidate against production.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowReport {
    pub bars: usize,
    /// Share of bars where both engines published the same state
    pub agreement_rate: f64,
    pub production_mean_log_likelihood: f64,
    pub candidate_mean_log_likelihood: f64,
    pub production_mean_entropy: f64,
    pub candidate_mean_entropy: f64,
    pub production_ood_rate: f64,
    pub candidate_ood_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub promote: bool,
    pub reasons: Vec<String>,
}

/// Promotion gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionPolicy {
    /// Candidate mean log-likelihood must beat production by this much
    pub log_likelihood_margin: f64,
    pub min_agreement: f64,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            log_likelihood_margin: 0.0,
            min_agreement: 0.6,
        }
    }
}

/// Runs a candidate engine in the shadow of production. Consumers only ever
/// see production output; the candidate just accumulates statistics.
pub struct ShadowEvaluator {
    production: InferenceEngine,
    candidate: InferenceEngine,
    agreements: usize,
    bars: usize,
    production_lls: Vec<f64>,
    candidate_lls: Vec<f64>,
    production_entropies: Vec<f64>,
    candidate_entropies: Vec<f64>,
    production_ood: usize,
    candidate_ood: usize,
}

impl ShadowEvaluator {
    pub fn new(production: InferenceEngine, candidate: InferenceEngine) -> Self {
        Self {
            production,
            candidate,
            agreements: 0,
            bars: 0,
            production_lls: Vec::new(),
            candidate_lls: Vec::new(),
            production_entropies: Vec::new(),
            candidate_entropies: Vec::new(),
            production_ood: 0,
            candidate_ood: 0,
        }
    }

    pub fn observe(
        &mut self,
        observation: &crate::data::FeatureVector,
    ) -> anyhow::Result<InferenceOutput> {
        let production_out = self.production.process(observation)?;
        match self.candidate.process(observation) {
            Ok(candidate_out) => {
                self.bars += 1;
                if candidate_out.state_id == production_out.state_id {
                    self.agreements += 1;
                }
                if production_out.log_likelihood.is_finite() {
                    self.production_lls.push(production_out.log_likelihood);
                }
                if candidate_out.log_likelihood.is_finite() {
                    self.candidate_lls.push(candidate_out.log_likelihood);
                }
                self.production_entropies.push(production_out.entropy());
                self.candidate_entropies.push(candidate_out.entropy());
                if production_out.is_ood {
                    self.production_ood += 1;
                }
                if candidate_out.is_ood {
                    self.candidate_ood += 1;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "candidate failed on observation, production unaffected");
            }
        }
        Ok(production_out)
    }

    pub fn report(&self) -> ShadowReport {
        let bars = self.bars.max(1) as f64;
        ShadowReport {
            bars: self.bars,
            agreement_rate: self.agreements as f64 / bars,
            production_mean_log_likelihood: mean_or_nan(&self.production_lls),
            candidate_mean_log_likelihood: mean_or_nan(&self.candidate_lls),
            production_mean_entropy: mean_or_nan(&self.production_entropies),
            candidate_mean_entropy: mean_or_nan(&self.candidate_entropies),
            production_ood_rate: self.production_ood as f64 / bars,
            candidate_ood_rate: self.candidate_ood as f64 / bars,
        }
    }

    /// Candidate is promoted only when it scores better, mostly agrees with
    /// production, and is no more prone to flagging OOD.
    pub fn promotion_decision(&self, policy: &PromotionPolicy) -> PromotionDecision {
        let report = self.report();
        let mut reasons = Vec::new();

        if report.bars == 0 {
            return PromotionDecision {
                promote: false,
                reasons: vec!["no shadow observations yet".into()],
            };
        }

        let score_ok = report.candidate_mean_log_likelihood
            > report.production_mean_log_likelihood + policy.log_likelihood_margin;
        if !score_ok {
            reasons.push(format!(
                "candidate log-likelihood {:.3} does not beat production {:.3} by {:.3}",
                report.candidate_mean_log_likelihood,
                report.production_mean_log_likelihood,
                policy.log_likelihood_margin
            ));
        }

        let agreement_ok = report.agreement_rate >= policy.min_agreement;
        if !agreement_ok {
            reasons.push(format!(
                "agreement {:.2} below required {:.2}",
                report.agreement_rate, policy.min_agreement
            ));
        }

        let ood_ok = report.candidate_ood_rate <= report.production_ood_rate;
        if !ood_ok {
            reasons.push(format!(
                "candidate OOD rate {:.3} exceeds production {:.3}",
                report.candidate_ood_rate, report.production_ood_rate
            ));
        }

        PromotionDecision {
            promote: score_ok && agreement_ok && ood_ok,
            reasons,
        }
    }
}

fn mean_or_nan(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.mean()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrainTrigger {
    ScheduledAge,
    OodRateHigh,
    LogLikelihoodAnomaly,
    EntropyAnomaly,
    Drift,
}

/// Decides when a deployed model should be refit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainingScheduler {
    /// Refit after this many days regardless of health
    pub cadence_days: i64,
}

impl Default for RetrainingScheduler {
    fn default() -> Self {
        Self { cadence_days: 30 }
    }
}

impl RetrainingScheduler {
    /// Collect every reason the model should be retrained now. Empty means
    /// the model stays.
    pub fn evaluate(
        &self,
        metadata: &ModelMetadata,
        health: &HealthReport,
        drift: DriftSeverity,
        now: DateTime<Utc>,
    ) -> Vec<RetrainTrigger> {
        let mut triggers = Vec::new();

        if now - metadata.created_at >= chrono::Duration::days(self.cadence_days) {
            triggers.push(RetrainTrigger::ScheduledAge);
        }
        for alert in &health.alerts {
            triggers.push(match alert {
                HealthAlert::OodRateHigh => RetrainTrigger::OodRateHigh,
                HealthAlert::LogLikelihoodAnomaly => RetrainTrigger::LogLikelihoodAnomaly,
                HealthAlert::EntropyAnomaly => RetrainTrigger::EntropyAnomaly,
            });
        }
        if drift == DriftSeverity::Severe {
            triggers.push(RetrainTrigger::Drift);
        }

        if !triggers.is_empty() {
            tracing::info!(model_id = %metadata.model_id, ?triggers, "retraining recommended");
        }
        triggers
    }
}
