//! Per-feature normalization
//!
//! Three variants behind one fit/transform/inverse_transform surface:
//! robust (median/IQR, the default), standard (mean/std), and a Yeo-Johnson
//! power transform for heavy-tailed features. All variants fit on the
//! non-missing entries of each column and pass NaN cells through untouched.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-9;

/// Scaler variant selector, part of the training configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerKind {
    Robust,
    Standard,
    Power,
}

impl std::fmt::Display for ScalerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalerKind::Robust => write!(f, "robust"),
            ScalerKind::Standard => write!(f, "standard"),
            ScalerKind::Power => write!(f, "power"),
        }
    }
}

impl std::str::FromStr for ScalerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "robust" => Ok(ScalerKind::Robust),
            "standard" => Ok(ScalerKind::Standard),
            "power" => Ok(ScalerKind::Power),
            other => anyhow::bail!("unknown scaler kind: {}", other),
        }
    }
}

/// A fitted scaler with serializable parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scaler {
    Robust(AffineScaler),
    Standard(AffineScaler),
    Power(PowerScaler),
}

impl Scaler {
    /// Fit the requested variant on a 2D sample.
    ///
    /// Per-column statistics ignore NaN entries; columns with near-zero
    /// spread get scale 1 so transform never divides by ~0.
    pub fn fit(kind: ScalerKind, x: &Array2<f64>, clip_std: Option<f64>) -> anyhow::Result<Self> {
        anyhow::ensure!(x.nrows() > 0, "cannot fit scaler on empty sample");
        match kind {
            ScalerKind::Robust => Ok(Scaler::Robust(AffineScaler::fit_robust(x, clip_std))),
            ScalerKind::Standard => Ok(Scaler::Standard(AffineScaler::fit_standard(x, clip_std))),
            ScalerKind::Power => Ok(Scaler::Power(PowerScaler::fit(x, clip_std))),
        }
    }

    pub fn kind(&self) -> ScalerKind {
        match self {
            Scaler::Robust(_) => ScalerKind::Robust,
            Scaler::Standard(_) => ScalerKind::Standard,
            Scaler::Power(_) => ScalerKind::Power,
        }
    }

    pub fn n_features(&self) -> usize {
        match self {
            Scaler::Robust(s) | Scaler::Standard(s) => s.center.len(),
            Scaler::Power(s) => s.lambdas.len(),
        }
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        match self {
            Scaler::Robust(s) | Scaler::Standard(s) => s.transform(x),
            Scaler::Power(s) => s.transform(x),
        }
    }

    pub fn inverse_transform(&self, x: &Array2<f64>) -> Array2<f64> {
        match self {
            Scaler::Robust(s) | Scaler::Standard(s) => s.inverse_transform(x),
            Scaler::Power(s) => s.inverse_transform(x),
        }
    }

    /// Transform a single observation.
    pub fn transform_row(&self, x: &Array1<f64>) -> Array1<f64> {
        let matrix = x.clone().insert_axis(ndarray::Axis(0));
        self.transform(&matrix).row(0).to_owned()
    }
}

/// Shift-and-scale parameters shared by the robust and standard variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffineScaler {
    pub center: Array1<f64>,
    pub scale: Array1<f64>,
    pub clip_std: Option<f64>,
}

impl AffineScaler {
    fn fit_robust(x: &Array2<f64>, clip_std: Option<f64>) -> Self {
        let d = x.ncols();
        let mut center = Array1::zeros(d);
        let mut scale = Array1::ones(d);

        for j in 0..d {
            let mut col: Vec<f64> = x.column(j).iter().copied().filter(|v| !v.is_nan()).collect();
            if col.is_empty() {
                continue;
            }
            col.sort_by(|a, b| a.partial_cmp(b).unwrap());
            center[j] = percentile_sorted(&col, 50.0);
            let iqr = percentile_sorted(&col, 75.0) - percentile_sorted(&col, 25.0);
            scale[j] = if iqr < EPS { 1.0 } else { iqr };
        }

        Self {
            center,
            scale,
            clip_std,
        }
    }

    fn fit_standard(x: &Array2<f64>, clip_std: Option<f64>) -> Self {
        let d = x.ncols();
        let mut center = Array1::zeros(d);
        let mut scale = Array1::ones(d);

        for j in 0..d {
            let col: Vec<f64> = x.column(j).iter().copied().filter(|v| !v.is_nan()).collect();
            if col.is_empty() {
                continue;
            }
            let (mean, std) = mean_std(&col);
            center[j] = mean;
            scale[j] = if std < EPS { 1.0 } else { std };
        }

        Self {
            center,
            scale,
            clip_std,
        }
    }

    fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = x.clone();
        for j in 0..x.ncols().min(self.center.len()) {
            for v in out.column_mut(j).iter_mut() {
                if !v.is_nan() {
                    *v = (*v - self.center[j]) / self.scale[j];
                    if let Some(clip) = self.clip_std {
                        *v = v.clamp(-clip, clip);
                    }
                }
            }
        }
        out
    }

    fn inverse_transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = x.clone();
        for j in 0..x.ncols().min(self.center.len()) {
            for v in out.column_mut(j).iter_mut() {
                if !v.is_nan() {
                    *v = *v * self.scale[j] + self.center[j];
                }
            }
        }
        out
    }
}

/// Yeo-Johnson power transform followed by standardization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerScaler {
    pub lambdas: Array1<f64>,
    pub center: Array1<f64>,
    pub scale: Array1<f64>,
    pub clip_std: Option<f64>,
}

impl PowerScaler {
    fn fit(x: &Array2<f64>, clip_std: Option<f64>) -> Self {
        let d = x.ncols();
        let mut lambdas = Array1::ones(d);
        let mut center = Array1::zeros(d);
        let mut scale = Array1::ones(d);

        for j in 0..d {
            let col: Vec<f64> = x.column(j).iter().copied().filter(|v| !v.is_nan()).collect();
            if col.len() <= 10 {
                // Too few points to estimate a lambda, fall back to identity
                if !col.is_empty() {
                    let (mean, std) = mean_std(&col);
                    center[j] = mean;
                    scale[j] = if std < EPS { 1.0 } else { std };
                }
                continue;
            }

            let lambda = select_lambda(&col);
            lambdas[j] = lambda;

            let transformed: Vec<f64> = col.iter().map(|&v| yeo_johnson(v, lambda)).collect();
            let (mean, std) = mean_std(&transformed);
            center[j] = mean;
            scale[j] = if std < EPS { 1.0 } else { std };
        }

        Self {
            lambdas,
            center,
            scale,
            clip_std,
        }
    }

    fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = x.clone();
        for j in 0..x.ncols().min(self.lambdas.len()) {
            for v in out.column_mut(j).iter_mut() {
                if !v.is_nan() {
                    *v = (yeo_johnson(*v, self.lambdas[j]) - self.center[j]) / self.scale[j];
                    if let Some(clip) = self.clip_std {
                        *v = v.clamp(-clip, clip);
                    }
                }
            }
        }
        out
    }

    fn inverse_transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = x.clone();
        for j in 0..x.ncols().min(self.lambdas.len()) {
            for v in out.column_mut(j).iter_mut() {
                if !v.is_nan() {
                    let unscaled = *v * self.scale[j] + self.center[j];
                    *v = yeo_johnson_inverse(unscaled, self.lambdas[j]);
                }
            }
        }
        out
    }
}

/// Yeo-Johnson transform for one value.
fn yeo_johnson(x: f64, lambda: f64) -> f64 {
    if x >= 0.0 {
        if lambda.abs() < EPS {
            (x + 1.0).ln()
        } else {
            ((x + 1.0).powf(lambda) - 1.0) / lambda
        }
    } else if (lambda - 2.0).abs() < EPS {
        -(-x + 1.0).ln()
    } else {
        -((-x + 1.0).powf(2.0 - lambda) - 1.0) / (2.0 - lambda)
    }
}

/// Exact inverse of `yeo_johnson`.
fn yeo_johnson_inverse(y: f64, lambda: f64) -> f64 {
    if y >= 0.0 {
        if lambda.abs() < EPS {
            y.exp() - 1.0
        } else {
            (y * lambda + 1.0).powf(1.0 / lambda) - 1.0
        }
    } else if (lambda - 2.0).abs() < EPS {
        1.0 - (-y).exp()
    } else {
        1.0 - (-(2.0 - lambda) * y + 1.0).powf(1.0 / (2.0 - lambda))
    }
}

/// Profile log-likelihood of the Yeo-Johnson transform for a given lambda.
fn yj_log_likelihood(col: &[f64], lambda: f64) -> f64 {
    let n = col.len() as f64;
    let transformed: Vec<f64> = col.iter().map(|&v| yeo_johnson(v, lambda)).collect();
    let (_, std) = mean_std(&transformed);
    let var = (std * std).max(EPS);

    let jacobian: f64 = col
        .iter()
        .map(|&v| (lambda - 1.0) * v.signum() * (v.abs() + 1.0).ln())
        .sum();

    -0.5 * n * var.ln() + jacobian
}

/// Golden-section search for the lambda maximizing the YJ log-likelihood.
fn select_lambda(col: &[f64]) -> f64 {
    const GOLDEN: f64 = 0.618_033_988_749_894_8;
    let mut lo = -3.0_f64;
    let mut hi = 3.0_f64;

    let mut a = hi - GOLDEN * (hi - lo);
    let mut b = lo + GOLDEN * (hi - lo);
    let mut fa = yj_log_likelihood(col, a);
    let mut fb = yj_log_likelihood(col, b);

    for _ in 0..60 {
        if fa > fb {
            hi = b;
            b = a;
            fb = fa;
            a = hi - GOLDEN * (hi - lo);
            fa = yj_log_likelihood(col, a);
        } else {
            lo = a;
            a = b;
            fa = fb;
            b = lo + GOLDEN * (hi - lo);
            fb = yj_log_likelihood(col, b);
        }
        if (hi - lo).abs() < 1e-4 {
            break;
        }
    }

    0.5 * (lo + hi)
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Linear-interpolated percentile of an ascending-sorted slice.
fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}
