//! Multivariate Gaussian emission distributions

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Emission covariance structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceKind {
    Diag,
    Full,
}

impl std::fmt::Display for CovarianceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CovarianceKind::Diag => write!(f, "diag"),
            CovarianceKind::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for CovarianceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "diag" => Ok(CovarianceKind::Diag),
            "full" => Ok(CovarianceKind::Full),
            other => anyhow::bail!("unknown covariance kind: {}", other),
        }
    }
}

/// One state's Gaussian emission.
///
/// The precision matrix and log-determinant are derived from the covariance
/// at construction and persisted alongside it, so a loaded model scores
/// observations without any refitting step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateGaussian {
    pub mean: Array1<f64>,
    pub covariance: Array2<f64>,
    precision: Array2<f64>,
    log_det: f64,
}

impl StateGaussian {
    pub fn new(mean: Array1<f64>, covariance: Array2<f64>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            covariance.nrows() == mean.len() && covariance.ncols() == mean.len(),
            "covariance shape {:?} does not match mean dimension {}",
            covariance.dim(),
            mean.len()
        );

        let chol = cholesky(&covariance)
            .or_else(|| {
                // One jitter retry for marginally non-PD covariances
                let mut jittered = covariance.clone();
                for i in 0..jittered.nrows() {
                    jittered[[i, i]] += 1e-6;
                }
                cholesky(&jittered)
            })
            .ok_or_else(|| anyhow::anyhow!("covariance is not positive definite"))?;

        let log_det = 2.0 * chol.diag().iter().map(|v| v.ln()).sum::<f64>();
        let precision = inverse_from_cholesky(&chol);

        Ok(Self {
            mean,
            covariance,
            precision,
            log_det,
        })
    }

    /// Spherical Gaussian, used to seed EM from k-means centers.
    pub fn spherical(mean: Array1<f64>, variance: f64) -> Self {
        let d = mean.len();
        let covariance = Array2::eye(d) * variance;
        // Spherical covariance is PD for any positive variance
        Self::new(mean, covariance).unwrap()
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn log_pdf(&self, x: &Array1<f64>) -> f64 {
        let d = self.dim() as f64;
        let diff = x - &self.mean;
        let quad_form = diff.dot(&self.precision.dot(&diff));
        -0.5 * (d * (2.0 * PI).ln() + self.log_det + quad_form)
    }

    pub fn pdf(&self, x: &Array1<f64>) -> f64 {
        self.log_pdf(x).exp()
    }

    /// Re-estimate from weighted samples (EM M-step).
    ///
    /// `cov_reg` is added to the diagonal so no state collapses to a
    /// singular covariance; `kind` decides whether off-diagonal terms
    /// are kept.
    pub fn update_weighted(
        &mut self,
        samples: &Array2<f64>,
        weights: &Array1<f64>,
        kind: CovarianceKind,
        cov_reg: f64,
    ) -> anyhow::Result<()> {
        let d = samples.ncols();
        let weight_sum = weights.sum();
        if weight_sum < 1e-10 {
            // State got no responsibility this round, keep old parameters
            return Ok(());
        }

        let mut new_mean = Array1::zeros(d);
        for (i, row) in samples.axis_iter(Axis(0)).enumerate() {
            new_mean = new_mean + &row.mapv(|v| v * weights[i]);
        }
        new_mean /= weight_sum;

        let mut new_cov = Array2::zeros((d, d));
        for (i, row) in samples.axis_iter(Axis(0)).enumerate() {
            let diff = &row.to_owned() - &new_mean;
            for j in 0..d {
                for k in 0..d {
                    new_cov[[j, k]] += weights[i] * diff[j] * diff[k];
                }
            }
        }
        new_cov /= weight_sum;

        if kind == CovarianceKind::Diag {
            for j in 0..d {
                for k in 0..d {
                    if j != k {
                        new_cov[[j, k]] = 0.0;
                    }
                }
            }
        }

        for j in 0..d {
            new_cov[[j, j]] += cov_reg;
        }

        *self = Self::new(new_mean, new_cov)?;
        Ok(())
    }
}

/// Lower-triangular Cholesky factor, or None if not positive definite.
fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut l: Array2<f64> = Array2::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }

    Some(l)
}

/// Invert A = L L^T by solving against the identity column by column.
fn inverse_from_cholesky(l: &Array2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let mut inv = Array2::zeros((n, n));

    for col in 0..n {
        // Forward solve L y = e_col
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let mut sum = if i == col { 1.0 } else { 0.0 };
            for k in 0..i {
                sum -= l[[i, k]] * y[k];
            }
            y[i] = sum / l[[i, i]];
        }
        // Back solve L^T x = y
        let mut x = Array1::zeros(n);
        for i in (0..n).rev() {
            let mut sum = y[i];
            for k in i + 1..n {
                sum -= l[[k, i]] * x[k];
            }
            x[i] = sum / l[[i, i]];
        }
        inv.column_mut(col).assign(&x);
    }

    inv
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_log_pdf_standard_normal() {
        let g = StateGaussian::new(array![0.0, 0.0], Array2::eye(2)).unwrap();
        // Density of a 2D standard normal at the origin is 1/(2 pi)
        let expected = -(2.0 * PI).ln();
        assert!((g.log_pdf(&array![0.0, 0.0]) - expected).abs() < 1e-10);
        assert!(g.pdf(&array![0.0, 0.0]) > g.pdf(&array![1.0, 1.0]));
    }

    #[test]
    fn test_full_covariance_quad_form() {
        let cov = array![[2.0, 0.6], [0.6, 1.0]];
        let g = StateGaussian::new(array![0.0, 0.0], cov.clone()).unwrap();

        // Verify against explicit 2x2 inverse
        let det: f64 = 2.0 * 1.0 - 0.6 * 0.6;
        let x = array![1.0, -0.5];
        let quad = (1.0 * 1.0 - 2.0 * 0.6 * 1.0 * (-0.5) + 2.0 * 0.25) / det;
        let expected = -0.5 * (2.0 * (2.0 * PI).ln() + det.ln() + quad);
        assert!((g.log_pdf(&x) - expected).abs() < 1e-10);
    }

    #[test]
    fn test_non_positive_definite_rejected() {
        let cov = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(StateGaussian::new(array![0.0, 0.0], cov).is_err());
    }

    #[test]
    fn test_update_weighted_diag_zeroes_off_diagonal() {
        let samples = array![[1.0, 2.0], [1.5, 2.5], [0.5, 1.5], [1.0, 2.0]];
        let weights = Array1::from_elem(4, 1.0);

        let mut g = StateGaussian::spherical(array![0.0, 0.0], 1.0);
        g.update_weighted(&samples, &weights, CovarianceKind::Diag, 1e-3)
            .unwrap();

        assert!((g.mean[0] - 1.0).abs() < 1e-10);
        assert!((g.mean[1] - 2.0).abs() < 1e-10);
        assert_eq!(g.covariance[[0, 1]], 0.0);
        assert!(g.covariance[[0, 0]] >= 1e-3);
    }

    #[test]
    fn test_zero_weights_keep_parameters() {
        let samples = array![[10.0, 10.0]];
        let weights = array![0.0];
        let mut g = StateGaussian::spherical(array![1.0, 1.0], 1.0);
        g.update_weighted(&samples, &weights, CovarianceKind::Full, 1e-3)
            .unwrap();
        assert_eq!(g.mean[0], 1.0);
    }

    #[test]
    fn test_serde_preserves_scoring() {
        let g = StateGaussian::new(array![0.5, -0.5], array![[1.5, 0.3], [0.3, 0.8]]).unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let loaded: StateGaussian = serde_json::from_str(&json).unwrap();
        let x = array![0.2, 0.1];
        assert_eq!(g.log_pdf(&x), loaded.log_pdf(&x));
    }
}
