//! Viterbi decoding, scaled forward-backward, and the Baum-Welch E/M step
//!
//! All routines assume complete (NaN-free) observation rows; masking happens
//! in the model layer before anything reaches these functions.

use super::gaussian::StateGaussian;
use ndarray::{Array1, Array2};

const TINY: f64 = 1e-300;

/// Result of one forward-backward sweep.
#[derive(Debug, Clone)]
pub struct ForwardBackward {
    /// Posterior state probabilities, T x N, rows sum to 1
    pub posteriors: Array2<f64>,
    /// Scaled forward variables, T x N
    pub alpha: Array2<f64>,
    /// Scaled backward variables, T x N
    pub beta: Array2<f64>,
    /// log P(observations | model)
    pub log_likelihood: f64,
}

/// Parameter updates produced by one EM iteration.
#[derive(Debug, Clone)]
pub struct EmStep {
    pub start_probs: Array1<f64>,
    pub transitions: Array2<f64>,
    /// State responsibilities from the E-step, T x N
    pub posteriors: Array2<f64>,
    pub log_likelihood: f64,
}

/// Most likely state path through the observations (log-space Viterbi).
pub fn viterbi(
    observations: &Array2<f64>,
    start_probs: &Array1<f64>,
    transitions: &Array2<f64>,
    states: &[StateGaussian],
) -> (Vec<usize>, f64) {
    let t = observations.nrows();
    let n = start_probs.len();
    if t == 0 {
        return (vec![], 0.0);
    }

    let log_start = start_probs.mapv(|p| (p + TINY).ln());
    let log_trans = transitions.mapv(|p| (p + TINY).ln());

    let mut delta = Array2::zeros((t, n));
    let mut backptr = Array2::<usize>::zeros((t, n));

    let first = observations.row(0).to_owned();
    for j in 0..n {
        delta[[0, j]] = log_start[j] + states[j].log_pdf(&first);
    }

    for step in 1..t {
        let obs = observations.row(step).to_owned();
        for j in 0..n {
            let mut best_val = f64::NEG_INFINITY;
            let mut best_prev = 0;
            for i in 0..n {
                let val = delta[[step - 1, i]] + log_trans[[i, j]];
                if val > best_val {
                    best_val = val;
                    best_prev = i;
                }
            }
            delta[[step, j]] = best_val + states[j].log_pdf(&obs);
            backptr[[step, j]] = best_prev;
        }
    }

    let mut last = 0;
    let mut best = f64::NEG_INFINITY;
    for j in 0..n {
        if delta[[t - 1, j]] > best {
            best = delta[[t - 1, j]];
            last = j;
        }
    }

    let mut path = vec![0; t];
    path[t - 1] = last;
    for step in (0..t - 1).rev() {
        path[step] = backptr[[step + 1, path[step + 1]]];
    }

    (path, best)
}

/// Scaled forward-backward sweep.
///
/// Per-step scaling keeps the recursions in floating range; the sequence
/// log-likelihood is the sum of log scale factors.
pub fn forward_backward(
    observations: &Array2<f64>,
    start_probs: &Array1<f64>,
    transitions: &Array2<f64>,
    states: &[StateGaussian],
) -> ForwardBackward {
    let t = observations.nrows();
    let n = start_probs.len();
    if t == 0 {
        return ForwardBackward {
            posteriors: Array2::zeros((0, n)),
            alpha: Array2::zeros((0, n)),
            beta: Array2::zeros((0, n)),
            log_likelihood: 0.0,
        };
    }

    let emission_probs = emission_matrix(observations, states);

    let mut alpha = Array2::zeros((t, n));
    let mut scale = Array1::zeros(t);

    for j in 0..n {
        alpha[[0, j]] = start_probs[j] * emission_probs[[0, j]];
    }
    scale[0] = alpha.row(0).sum();
    if scale[0] > TINY {
        alpha.row_mut(0).mapv_inplace(|v| v / scale[0]);
    }

    for step in 1..t {
        for j in 0..n {
            let mut sum = 0.0;
            for i in 0..n {
                sum += alpha[[step - 1, i]] * transitions[[i, j]];
            }
            alpha[[step, j]] = sum * emission_probs[[step, j]];
        }
        scale[step] = alpha.row(step).sum();
        if scale[step] > TINY {
            let s = scale[step];
            alpha.row_mut(step).mapv_inplace(|v| v / s);
        }
    }

    let log_likelihood = scale.iter().map(|s| (s + TINY).ln()).sum();

    let mut beta = Array2::zeros((t, n));
    beta.row_mut(t - 1).fill(1.0);

    for step in (0..t - 1).rev() {
        for i in 0..n {
            let mut sum = 0.0;
            for j in 0..n {
                sum += transitions[[i, j]] * emission_probs[[step + 1, j]] * beta[[step + 1, j]];
            }
            beta[[step, i]] = sum;
        }
        if scale[step + 1] > TINY {
            let s = scale[step + 1];
            beta.row_mut(step).mapv_inplace(|v| v / s);
        }
    }

    let mut posteriors = Array2::zeros((t, n));
    for step in 0..t {
        let mut sum = 0.0;
        for j in 0..n {
            posteriors[[step, j]] = alpha[[step, j]] * beta[[step, j]];
            sum += posteriors[[step, j]];
        }
        if sum > TINY {
            posteriors.row_mut(step).mapv_inplace(|v| v / sum);
        }
    }

    ForwardBackward {
        posteriors,
        alpha,
        beta,
        log_likelihood,
    }
}

/// One Baum-Welch iteration: E-step posteriors plus re-estimated start
/// probabilities and transitions. Emission updates stay with the caller,
/// which owns the covariance structure.
pub fn baum_welch_step(
    observations: &Array2<f64>,
    start_probs: &Array1<f64>,
    transitions: &Array2<f64>,
    states: &[StateGaussian],
) -> EmStep {
    let t = observations.nrows();
    let n = start_probs.len();

    let fb = forward_backward(observations, start_probs, transitions, states);
    let emission_probs = emission_matrix(observations, states);

    // Expected transition counts
    let mut xi_sum: Array2<f64> = Array2::zeros((n, n));
    for step in 0..t.saturating_sub(1) {
        for i in 0..n {
            for j in 0..n {
                xi_sum[[i, j]] += fb.alpha[[step, i]]
                    * transitions[[i, j]]
                    * emission_probs[[step + 1, j]]
                    * fb.beta[[step + 1, j]];
            }
        }
    }

    let new_start = fb.posteriors.row(0).to_owned();

    let mut new_transitions = Array2::zeros((n, n));
    for i in 0..n {
        let occupancy: f64 = (0..t.saturating_sub(1)).map(|s| fb.posteriors[[s, i]]).sum();
        if occupancy > TINY {
            for j in 0..n {
                new_transitions[[i, j]] = xi_sum[[i, j]] / occupancy;
            }
        } else {
            new_transitions.row_mut(i).fill(1.0 / n as f64);
        }
        let row_sum: f64 = new_transitions.row(i).sum();
        if row_sum > TINY {
            new_transitions.row_mut(i).mapv_inplace(|v| v / row_sum);
        }
    }

    EmStep {
        start_probs: new_start,
        transitions: new_transitions,
        posteriors: fb.posteriors,
        log_likelihood: fb.log_likelihood,
    }
}

fn emission_matrix(observations: &Array2<f64>, states: &[StateGaussian]) -> Array2<f64> {
    let t = observations.nrows();
    let n = states.len();
    let mut probs = Array2::zeros((t, n));
    for step in 0..t {
        let obs = observations.row(step).to_owned();
        for j in 0..n {
            probs[[step, j]] = states[j].pdf(&obs);
        }
    }
    probs
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, array};

    fn two_state_model() -> (Array1<f64>, Array2<f64>, Vec<StateGaussian>) {
        let start = array![0.6, 0.4];
        let transitions = arr2(&[[0.7, 0.3], [0.4, 0.6]]);
        let states = vec![
            StateGaussian::new(array![0.0], Array2::eye(1)).unwrap(),
            StateGaussian::new(array![3.0], Array2::eye(1)).unwrap(),
        ];
        (start, transitions, states)
    }

    #[test]
    fn test_viterbi_separates_clusters() {
        let (start, transitions, states) = two_state_model();
        let obs = arr2(&[[0.1], [0.2], [2.8], [3.1]]);

        let (path, log_prob) = viterbi(&obs, &start, &transitions, &states);

        assert_eq!(path, vec![0, 0, 1, 1]);
        assert!(log_prob.is_finite());
    }

    #[test]
    fn test_posteriors_are_distributions() {
        let (start, transitions, states) = two_state_model();
        let obs = arr2(&[[0.1], [0.2], [2.8], [3.1]]);

        let fb = forward_backward(&obs, &start, &transitions, &states);

        assert_eq!(fb.posteriors.nrows(), 4);
        for step in 0..4 {
            let sum: f64 = fb.posteriors.row(step).sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!(fb.log_likelihood.is_finite());
        assert!(fb.posteriors[[0, 0]] > 0.5);
        assert!(fb.posteriors[[3, 1]] > 0.5);
    }

    #[test]
    fn test_em_step_improves_likelihood() {
        let (start, transitions, mut states) = two_state_model();
        let obs = arr2(&[[0.1], [-0.2], [0.3], [2.9], [3.2], [2.7], [0.0], [0.1]]);

        let step1 = baum_welch_step(&obs, &start, &transitions, &states);
        for (j, state) in states.iter_mut().enumerate() {
            state
                .update_weighted(
                    &obs,
                    &step1.posteriors.column(j).to_owned(),
                    crate::model::gaussian::CovarianceKind::Diag,
                    1e-3,
                )
                .unwrap();
        }
        let step2 = baum_welch_step(&obs, &step1.start_probs, &step1.transitions, &states);

        assert!(step2.log_likelihood >= step1.log_likelihood - 1e-9);
        for i in 0..2 {
            let row_sum: f64 = step2.transitions.row(i).sum();
            assert!((row_sum - 1.0).abs() < 1e-9);
        }
    }
}
