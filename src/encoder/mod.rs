//! Dimensionality reduction ahead of the regime model
//!
//! Two variants: plain PCA over scaled feature rows, and temporal PCA over
//! flattened sliding windows of consecutive rows. The latent dimension may
//! be fixed by configuration or chosen from the explained-variance profile.

pub mod eigen;

use eigen::{covariance_matrix, SymmetricEigen};
use ndarray::{s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Fraction of variance the auto-selected latent space must explain.
const VARIANCE_TARGET: f64 = 0.95;
/// Bounds on the auto-selected latent dimension.
const MIN_LATENT_DIM: usize = 2;
const MAX_LATENT_DIM: usize = 16;

/// Encoder variant selector, part of the training configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    Pca,
    TemporalPca,
}

impl std::fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderKind::Pca => write!(f, "pca"),
            EncoderKind::TemporalPca => write!(f, "temporal_pca"),
        }
    }
}

impl std::str::FromStr for EncoderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pca" => Ok(EncoderKind::Pca),
            "temporal_pca" => Ok(EncoderKind::TemporalPca),
            other => anyhow::bail!("unknown encoder kind: {}", other),
        }
    }
}

/// A fitted encoder with serializable parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Encoder {
    Pca(PcaEncoder),
    TemporalPca(TemporalPcaEncoder),
}

impl Encoder {
    /// Fit the requested variant.
    ///
    /// `latent_dim = None` picks the smallest dimension explaining 95% of
    /// variance, clamped to [2, 16] and the input width. `window` only
    /// applies to the temporal variant.
    pub fn fit(
        kind: EncoderKind,
        x: &Array2<f64>,
        latent_dim: Option<usize>,
        window: usize,
    ) -> anyhow::Result<Self> {
        match kind {
            EncoderKind::Pca => Ok(Encoder::Pca(PcaEncoder::fit(x, latent_dim)?)),
            EncoderKind::TemporalPca => Ok(Encoder::TemporalPca(TemporalPcaEncoder::fit(
                x, latent_dim, window,
            )?)),
        }
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            Encoder::Pca(_) => EncoderKind::Pca,
            Encoder::TemporalPca(_) => EncoderKind::TemporalPca,
        }
    }

    pub fn latent_dim(&self) -> usize {
        match self {
            Encoder::Pca(e) => e.latent_dim(),
            Encoder::TemporalPca(e) => e.pca.latent_dim(),
        }
    }

    /// Rows of history the encoder needs to emit one latent row.
    pub fn context_rows(&self) -> usize {
        match self {
            Encoder::Pca(_) => 1,
            Encoder::TemporalPca(e) => e.window,
        }
    }

    /// Transform a full scaled feature matrix into latent rows.
    ///
    /// Output always has `x.nrows()` rows; rows the encoder cannot produce
    /// (incomplete leading windows, missing inputs) are NaN.
    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        match self {
            Encoder::Pca(e) => e.transform(x),
            Encoder::TemporalPca(e) => e.transform(x),
        }
    }

    /// Map latent rows back to the scaled feature space.
    ///
    /// The temporal variant reconstructs a whole flattened window per row,
    /// which has no single-bar feature interpretation, so it refuses.
    pub fn inverse_transform(&self, z: &Array2<f64>) -> anyhow::Result<Array2<f64>> {
        match self {
            Encoder::Pca(e) => Ok(e.inverse_transform(z)),
            Encoder::TemporalPca(_) => {
                anyhow::bail!("temporal encoder cannot invert to single-bar features")
            }
        }
    }

    /// Total variance fraction the kept components explain.
    pub fn explained_variance(&self) -> f64 {
        match self {
            Encoder::Pca(e) => e.explained_variance_ratio.sum(),
            Encoder::TemporalPca(e) => e.pca.explained_variance_ratio.sum(),
        }
    }

    /// Per-row squared reconstruction error, aligned with the input rows.
    ///
    /// Rows the encoder cannot reconstruct (missing values, incomplete
    /// leading windows) are NaN.
    pub fn reconstruction_error(&self, x: &Array2<f64>) -> Array1<f64> {
        match self {
            Encoder::Pca(e) => e.reconstruction_error(x),
            Encoder::TemporalPca(e) => {
                let mut out = Array1::from_elem(x.nrows(), f64::NAN);
                if x.nrows() >= e.window {
                    let per_window = e.pca.reconstruction_error(&make_windows(x, e.window));
                    for (i, &err) in per_window.iter().enumerate() {
                        out[i + e.window - 1] = err;
                    }
                }
                out
            }
        }
    }
}

/// Principal-component projection fitted on scaled feature rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaEncoder {
    pub mean: Array1<f64>,
    /// Projection matrix, input_dim x latent_dim
    pub components: Array2<f64>,
    /// Per-component explained variance ratio
    pub explained_variance_ratio: Array1<f64>,
}

impl PcaEncoder {
    pub fn fit(x: &Array2<f64>, latent_dim: Option<usize>) -> anyhow::Result<Self> {
        let complete = complete_rows(x);
        anyhow::ensure!(
            complete.nrows() > x.ncols(),
            "need more than {} complete rows to fit PCA, got {}",
            x.ncols(),
            complete.nrows()
        );

        let cov = covariance_matrix(&complete);
        let eigen = SymmetricEigen::decompose(&cov);

        let total: f64 = eigen.eigenvalues.iter().map(|v| v.max(0.0)).sum();
        anyhow::ensure!(total > 0.0, "degenerate covariance: no variance to explain");
        let ratios = eigen.eigenvalues.mapv(|v| v.max(0.0) / total);

        let k = match latent_dim {
            Some(k) => {
                anyhow::ensure!(
                    k >= 1 && k <= x.ncols(),
                    "latent dim {} out of range for {} features",
                    k,
                    x.ncols()
                );
                k
            }
            None => select_latent_dim(&ratios, x.ncols()),
        };

        let mean = complete.mean_axis(Axis(0)).unwrap();
        let components = eigen.eigenvectors.slice(s![.., ..k]).to_owned();
        let explained_variance_ratio = ratios.slice(s![..k]).to_owned();

        Ok(Self {
            mean,
            components,
            explained_variance_ratio,
        })
    }

    pub fn latent_dim(&self) -> usize {
        self.components.ncols()
    }

    pub fn input_dim(&self) -> usize {
        self.components.nrows()
    }

    /// Project rows into latent space; rows with any NaN become NaN rows.
    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = Array2::from_elem((x.nrows(), self.latent_dim()), f64::NAN);
        for (i, row) in x.axis_iter(Axis(0)).enumerate() {
            if row.iter().all(|v| !v.is_nan()) {
                let centered = &row.to_owned() - &self.mean;
                out.row_mut(i).assign(&centered.dot(&self.components));
            }
        }
        out
    }

    /// Map latent rows back to the input space.
    pub fn inverse_transform(&self, z: &Array2<f64>) -> Array2<f64> {
        z.dot(&self.components.t()) + &self.mean
    }

    /// Per-row mean squared reconstruction error; rows with any NaN are NaN.
    pub fn reconstruction_error(&self, x: &Array2<f64>) -> Array1<f64> {
        let reconstructed = self.inverse_transform(&self.transform(x));
        let mut out = Array1::from_elem(x.nrows(), f64::NAN);
        for i in 0..x.nrows() {
            let row = x.row(i);
            if row.iter().all(|v| !v.is_nan()) {
                out[i] = row
                    .iter()
                    .zip(reconstructed.row(i).iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    / x.ncols() as f64;
            }
        }
        out
    }
}

/// PCA over flattened sliding windows of consecutive rows.
///
/// A window of `window` rows with `d` features flattens to one
/// `window * d` vector, oldest row first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalPcaEncoder {
    pub window: usize,
    pub pca: PcaEncoder,
}

impl TemporalPcaEncoder {
    pub fn fit(x: &Array2<f64>, latent_dim: Option<usize>, window: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(window >= 2, "temporal window must be at least 2, got {}", window);
        anyhow::ensure!(
            x.nrows() >= window,
            "need at least {} rows to form one window, got {}",
            window,
            x.nrows()
        );

        let flattened = make_windows(x, window);
        let pca = PcaEncoder::fit(&flattened, latent_dim)?;
        Ok(Self { window, pca })
    }

    /// Transform a full matrix. The first `window - 1` output rows are NaN
    /// since no complete window ends there.
    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let k = self.pca.latent_dim();
        let mut out = Array2::from_elem((x.nrows(), k), f64::NAN);
        if x.nrows() < self.window {
            return out;
        }
        let flattened = make_windows(x, self.window);
        let latent = self.pca.transform(&flattened);
        for i in 0..latent.nrows() {
            out.row_mut(i + self.window - 1).assign(&latent.row(i));
        }
        out
    }

    /// Transform one complete window of rows (oldest first).
    pub fn transform_window(&self, rows: &Array2<f64>) -> anyhow::Result<Array1<f64>> {
        anyhow::ensure!(
            rows.nrows() == self.window,
            "expected {} rows, got {}",
            self.window,
            rows.nrows()
        );
        let flat = flatten_window(rows);
        let matrix = flat.insert_axis(Axis(0));
        Ok(self.pca.transform(&matrix).row(0).to_owned())
    }
}

/// Flatten every complete sliding window into one row.
///
/// Output row i covers input rows i..i+window, so output row i describes
/// the window ending at input row i + window - 1.
pub fn make_windows(x: &Array2<f64>, window: usize) -> Array2<f64> {
    let n = x.nrows();
    let d = x.ncols();
    if n < window {
        return Array2::zeros((0, window * d));
    }
    let mut out = Array2::zeros((n - window + 1, window * d));
    for i in 0..=n - window {
        out.row_mut(i)
            .assign(&flatten_window(&x.slice(s![i..i + window, ..]).to_owned()));
    }
    out
}

fn flatten_window(rows: &Array2<f64>) -> Array1<f64> {
    Array1::from_iter(rows.iter().copied())
}

/// Smallest dimension whose cumulative explained variance reaches the
/// target, clamped to [2, 16] and the input width.
pub fn select_latent_dim(explained_variance_ratio: &Array1<f64>, input_dim: usize) -> usize {
    let mut cumulative = 0.0;
    let mut k = explained_variance_ratio.len();
    for (i, r) in explained_variance_ratio.iter().enumerate() {
        cumulative += r;
        if cumulative >= VARIANCE_TARGET {
            k = i + 1;
            break;
        }
    }
    k.clamp(MIN_LATENT_DIM.min(input_dim), MAX_LATENT_DIM.min(input_dim))
}

fn complete_rows(x: &Array2<f64>) -> Array2<f64> {
    let keep: Vec<usize> = (0..x.nrows())
        .filter(|&i| x.row(i).iter().all(|v| !v.is_nan()))
        .collect();
    let mut out = Array2::zeros((keep.len(), x.ncols()));
    for (new_i, &old_i) in keep.iter().enumerate() {
        out.row_mut(new_i).assign(&x.row(old_i));
    }
    out
}
