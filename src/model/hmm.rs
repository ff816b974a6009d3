//! Gaussian HMM over latent feature rows
//!
//! Fitting runs Baum-Welch from a seeded k-means start with
//! diagonally-biased transitions; rows containing NaN are masked out of
//! fitting and decode to the unknown label (-1) instead of failing.

use super::algorithms::{baum_welch_step, forward_backward, viterbi};
use super::gaussian::{CovarianceKind, StateGaussian};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Label emitted for rows the model refuses to classify.
pub const UNKNOWN_STATE: i64 = -1;

/// Mixture-weight smoothing for per-bar scoring. EM tends to collapse the
/// start distribution onto the first training bar's state, so weights need
/// a floor large enough that bars from the other trained states still score
/// in range.
const EPS: f64 = 1e-9;

/// Fitting hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmmConfig {
    pub n_states: usize,
    pub covariance: CovarianceKind,
    pub max_iter: usize,
    pub tol: f64,
    /// Floor added to every covariance diagonal each M-step
    pub cov_reg: f64,
    /// Initial self-transition probability
    pub diagonal_bias: f64,
    pub seed: u64,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            n_states: 3,
            covariance: CovarianceKind::Diag,
            max_iter: 100,
            tol: 1e-4,
            cov_reg: 1e-3,
            diagonal_bias: 0.9,
            seed: 42,
        }
    }
}

/// A fitted (or fittable) regime HMM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeHmm {
    pub config: HmmConfig,
    pub start_probs: Array1<f64>,
    pub transitions: Array2<f64>,
    pub states: Vec<StateGaussian>,
    pub is_fitted: bool,
    /// Per-iteration training log-likelihood
    pub log_likelihood_history: Vec<f64>,
}

/// Summary statistics of a fitted model over a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub n_states: usize,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    /// Average consecutive bars spent in one state
    pub mean_dwell: f64,
    /// Fraction of bars assigned to each state
    pub occupancy: Vec<f64>,
}

impl RegimeHmm {
    pub fn new(config: HmmConfig) -> Self {
        Self {
            config,
            start_probs: Array1::zeros(0),
            transitions: Array2::zeros((0, 0)),
            states: vec![],
            is_fitted: false,
            log_likelihood_history: vec![],
        }
    }

    pub fn n_states(&self) -> usize {
        self.config.n_states
    }

    pub fn state_means(&self) -> Vec<Array1<f64>> {
        self.states.iter().map(|s| s.mean.clone()).collect()
    }

    /// Fit with Baum-Welch on the NaN-free rows of `x`.
    ///
    /// Returns the final training log-likelihood.
    pub fn fit(&mut self, x: &Array2<f64>) -> anyhow::Result<f64> {
        let observations = complete_rows(x);
        let k = self.config.n_states;
        anyhow::ensure!(k >= 2, "need at least 2 states, got {}", k);
        anyhow::ensure!(
            observations.nrows() >= (k * 2).max(10),
            "insufficient data: {} usable rows for {} states",
            observations.nrows(),
            k
        );

        self.initialize(&observations)?;
        self.log_likelihood_history.clear();

        let mut prev_ll = f64::NEG_INFINITY;
        for iter in 0..self.config.max_iter {
            let step = baum_welch_step(
                &observations,
                &self.start_probs,
                &self.transitions,
                &self.states,
            );

            self.start_probs = step.start_probs;
            self.transitions = step.transitions;
            for (j, state) in self.states.iter_mut().enumerate() {
                state.update_weighted(
                    &observations,
                    &step.posteriors.column(j).to_owned(),
                    self.config.covariance,
                    self.config.cov_reg,
                )?;
            }

            self.log_likelihood_history.push(step.log_likelihood);

            if (step.log_likelihood - prev_ll).abs() < self.config.tol {
                tracing::debug!(iterations = iter + 1, "EM converged");
                break;
            }
            prev_ll = step.log_likelihood;
        }

        self.is_fitted = true;
        Ok(self
            .log_likelihood_history
            .last()
            .copied()
            .unwrap_or(f64::NEG_INFINITY))
    }

    /// Seed emissions from k-means centers, start probabilities uniform,
    /// transitions diagonally biased.
    fn initialize(&mut self, observations: &Array2<f64>) -> anyhow::Result<()> {
        let k = self.config.n_states;
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let centers = kmeans_centers(observations, k, &mut rng);
        self.states = centers
            .into_iter()
            .map(|c| StateGaussian::spherical(c, 1.0))
            .collect();

        self.start_probs = Array1::from_elem(k, 1.0 / k as f64);

        let off = (1.0 - self.config.diagonal_bias) / (k as f64 - 1.0).max(1.0);
        let mut transitions = Array2::from_elem((k, k), off);
        for i in 0..k {
            transitions[[i, i]] = self.config.diagonal_bias;
        }
        self.transitions = transitions;
        Ok(())
    }

    /// Viterbi decode. Rows with missing values get the unknown label.
    pub fn predict(&self, x: &Array2<f64>) -> anyhow::Result<Vec<i64>> {
        anyhow::ensure!(self.is_fitted, "model not fitted yet");

        let (valid_idx, observations) = complete_rows_indexed(x);
        let mut labels = vec![UNKNOWN_STATE; x.nrows()];
        if observations.nrows() == 0 {
            return Ok(labels);
        }

        let (path, _) = viterbi(
            &observations,
            &self.start_probs,
            &self.transitions,
            &self.states,
        );
        for (pos, &row) in valid_idx.iter().enumerate() {
            labels[row] = path[pos] as i64;
        }
        Ok(labels)
    }

    /// Posterior state probabilities. Rows with missing values are NaN.
    pub fn predict_proba(&self, x: &Array2<f64>) -> anyhow::Result<Array2<f64>> {
        anyhow::ensure!(self.is_fitted, "model not fitted yet");

        let (valid_idx, observations) = complete_rows_indexed(x);
        let mut probs = Array2::from_elem((x.nrows(), self.config.n_states), f64::NAN);
        if observations.nrows() == 0 {
            return Ok(probs);
        }

        let fb = forward_backward(
            &observations,
            &self.start_probs,
            &self.transitions,
            &self.states,
        );
        for (pos, &row) in valid_idx.iter().enumerate() {
            let posterior = fb.posteriors.row(pos);
            // Unnormalizable rows (every state underflowed) stay NaN
            if posterior.sum() > 0.5 {
                probs.row_mut(row).assign(&posterior);
            }
        }
        Ok(probs)
    }

    /// Filtered posterior for one observation, computed in log space.
    ///
    /// The streaming engine scores each bar on its own, where the scaled
    /// forward pass underflows for observations far from the start-weighted
    /// states. Working in log space keeps any in-distribution bar decodable.
    /// NaN input or an unnormalizable mixture yields an all-NaN vector.
    pub fn filter_posterior(&self, x: &Array1<f64>) -> Array1<f64> {
        let k = self.config.n_states;
        if x.iter().any(|v| !v.is_finite()) {
            return Array1::from_elem(k, f64::NAN);
        }
        let log_terms: Vec<f64> = self
            .states
            .iter()
            .zip(self.start_probs.iter())
            .map(|(state, &w)| (w + EPS).ln() + state.log_pdf(x))
            .collect();
        let total = log_sum_exp(&log_terms);
        if !total.is_finite() {
            return Array1::from_elem(k, f64::NAN);
        }
        Array1::from_iter(log_terms.iter().map(|v| (v - total).exp()))
    }

    /// Sequence log-likelihood over the NaN-free rows.
    pub fn score(&self, x: &Array2<f64>) -> anyhow::Result<f64> {
        anyhow::ensure!(self.is_fitted, "model not fitted yet");
        let observations = complete_rows(x);
        let fb = forward_backward(
            &observations,
            &self.start_probs,
            &self.transitions,
            &self.states,
        );
        Ok(fb.log_likelihood)
    }

    /// Per-observation emission log-likelihood under the start-weighted
    /// state mixture. NaN input yields NaN, which callers treat as
    /// out-of-distribution.
    pub fn emission_log_likelihood(&self, x: &Array1<f64>) -> f64 {
        if x.iter().any(|v| !v.is_finite()) {
            return f64::NAN;
        }
        let terms: Vec<f64> = self
            .states
            .iter()
            .zip(self.start_probs.iter())
            .map(|(state, &w)| (w + EPS).ln() + state.log_pdf(x))
            .collect();
        log_sum_exp(&terms)
    }

    pub fn aic(&self, x: &Array2<f64>) -> anyhow::Result<f64> {
        Ok(2.0 * self.count_parameters() as f64 - 2.0 * self.score(x)?)
    }

    pub fn bic(&self, x: &Array2<f64>) -> anyhow::Result<f64> {
        let n = complete_rows(x).nrows() as f64;
        Ok(self.count_parameters() as f64 * n.ln() - 2.0 * self.score(x)?)
    }

    /// Free parameter count for the information criteria.
    fn count_parameters(&self) -> usize {
        let n = self.config.n_states;
        let d = self.states.first().map(|s| s.dim()).unwrap_or(0);
        let cov_params = match self.config.covariance {
            CovarianceKind::Diag => n * d,
            CovarianceKind::Full => n * d * (d + 1) / 2,
        };
        (n - 1) + n * (n - 1) + n * d + cov_params
    }

    /// Fit-quality summary over a dataset.
    pub fn metrics(&self, x: &Array2<f64>) -> anyhow::Result<RegimeMetrics> {
        let labels = self.predict(x)?;
        let assigned: Vec<i64> = labels.iter().copied().filter(|&l| l >= 0).collect();

        let mut occupancy = vec![0.0; self.config.n_states];
        for &label in &assigned {
            occupancy[label as usize] += 1.0;
        }
        let total = assigned.len().max(1) as f64;
        for o in occupancy.iter_mut() {
            *o /= total;
        }

        Ok(RegimeMetrics {
            n_states: self.config.n_states,
            log_likelihood: self.score(x)?,
            aic: self.aic(x)?,
            bic: self.bic(x)?,
            mean_dwell: mean_dwell(&assigned),
            occupancy,
        })
    }
}

/// Fit one model per candidate state count and keep the BIC minimizer.
///
/// Candidates that fail to fit are skipped with a warning; only when every
/// candidate fails does selection error out.
pub fn select_n_states(
    x: &Array2<f64>,
    candidates: &[usize],
    base: &HmmConfig,
) -> anyhow::Result<(RegimeHmm, Vec<(usize, f64)>)> {
    anyhow::ensure!(!candidates.is_empty(), "no candidate state counts given");

    let mut best: Option<(RegimeHmm, f64)> = None;
    let mut scores = Vec::new();

    for &k in candidates {
        let mut config = base.clone();
        config.n_states = k;
        let mut model = RegimeHmm::new(config);

        let bic = match model.fit(x).and_then(|_| model.bic(x)) {
            Ok(bic) if bic.is_finite() => bic,
            Ok(bic) => {
                tracing::warn!(n_states = k, bic, "skipping candidate with non-finite BIC");
                continue;
            }
            Err(err) => {
                tracing::warn!(n_states = k, error = %err, "candidate fit failed, skipping");
                continue;
            }
        };

        tracing::debug!(n_states = k, bic, "candidate scored");
        scores.push((k, bic));
        if best.as_ref().map_or(true, |(_, b)| bic < *b) {
            best = Some((model, bic));
        }
    }

    let (model, _) = best.ok_or_else(|| anyhow::anyhow!("every candidate state count failed to fit"))?;
    Ok((model, scores))
}

/// Average run length of consecutive equal labels.
pub fn mean_dwell(labels: &[i64]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let mut runs = 1usize;
    for w in labels.windows(2) {
        if w[0] != w[1] {
            runs += 1;
        }
    }
    labels.len() as f64 / runs as f64
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

fn kmeans_centers(observations: &Array2<f64>, k: usize, rng: &mut StdRng) -> Vec<Array1<f64>> {
    let n = observations.nrows();
    let d = observations.ncols();

    let mut centers: Vec<Array1<f64>> = (0..k)
        .map(|_| observations.row(rng.gen_range(0..n)).to_owned())
        .collect();

    for _ in 0..10 {
        let mut assignments = vec![0usize; n];
        for i in 0..n {
            let mut best_dist = f64::MAX;
            for (j, center) in centers.iter().enumerate() {
                let dist: f64 = observations
                    .row(i)
                    .iter()
                    .zip(center.iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum();
                if dist < best_dist {
                    best_dist = dist;
                    assignments[i] = j;
                }
            }
        }

        for j in 0..k {
            let mut sum = Array1::zeros(d);
            let mut count = 0usize;
            for i in 0..n {
                if assignments[i] == j {
                    sum += &observations.row(i);
                    count += 1;
                }
            }
            if count > 0 {
                centers[j] = sum / count as f64;
            } else {
                // Empty cluster gets re-seeded from a random observation
                centers[j] = observations.row(rng.gen_range(0..n)).to_owned();
            }
        }
    }

    centers
}

fn complete_rows(x: &Array2<f64>) -> Array2<f64> {
    complete_rows_indexed(x).1
}

fn complete_rows_indexed(x: &Array2<f64>) -> (Vec<usize>, Array2<f64>) {
    let keep: Vec<usize> = (0..x.nrows())
        .filter(|&i| x.row(i).iter().all(|v| v.is_finite()))
        .collect();
    let mut out = Array2::zeros((keep.len(), x.ncols()));
    for (new_i, &old_i) in keep.iter().enumerate() {
        out.row_mut(new_i).assign(&x.row(old_i));
    }
    (keep, out)
}
