//! Symmetric eigendecomposition via power iteration with deflation.
//!
//! Feature covariance matrices here are small (tens of columns), so an
//! iterative method is adequate and keeps the crate free of LAPACK bindings.

use ndarray::{Array1, Array2, Axis};

const CONVERGENCE_TOL: f64 = 1e-10;
const MAX_POWER_ITER: usize = 200;

/// Eigenpairs of a symmetric matrix, sorted by descending eigenvalue.
#[derive(Debug, Clone)]
pub struct SymmetricEigen {
    pub eigenvalues: Array1<f64>,
    /// Column i is the eigenvector for eigenvalue i
    pub eigenvectors: Array2<f64>,
}

impl SymmetricEigen {
    pub fn decompose(matrix: &Array2<f64>) -> Self {
        let n = matrix.nrows();
        let mut eigenvalues = Array1::zeros(n);
        let mut eigenvectors = Array2::zeros((n, n));
        let mut deflated = matrix.clone();

        for i in 0..n {
            let (value, vector) = power_iteration(&deflated);
            eigenvalues[i] = value;
            eigenvectors.column_mut(i).assign(&vector);

            // Deflate: A <- A - lambda * v v^T
            for r in 0..n {
                for c in 0..n {
                    deflated[[r, c]] -= value * vector[r] * vector[c];
                }
            }
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            eigenvalues[b]
                .partial_cmp(&eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let sorted_values = Array1::from_iter(order.iter().map(|&i| eigenvalues[i]));
        let mut sorted_vectors = Array2::zeros((n, n));
        for (new_idx, &old_idx) in order.iter().enumerate() {
            sorted_vectors
                .column_mut(new_idx)
                .assign(&eigenvectors.column(old_idx));
        }

        Self {
            eigenvalues: sorted_values,
            eigenvectors: sorted_vectors,
        }
    }
}

fn power_iteration(matrix: &Array2<f64>) -> (f64, Array1<f64>) {
    let n = matrix.nrows();
    let mut v = Array1::from_elem(n, 1.0 / (n as f64).sqrt());
    let mut eigenvalue = 0.0;

    for _ in 0..MAX_POWER_ITER {
        let av = matrix.dot(&v);
        let new_eigenvalue = v.dot(&av);

        let norm = av.dot(&av).sqrt();
        let new_v = if norm > CONVERGENCE_TOL { av / norm } else { av };

        if (new_eigenvalue - eigenvalue).abs() < CONVERGENCE_TOL {
            return (new_eigenvalue, new_v);
        }
        eigenvalue = new_eigenvalue;
        v = new_v;
    }

    (eigenvalue, v)
}

/// Sample covariance matrix of row-observations.
pub fn covariance_matrix(data: &Array2<f64>) -> Array2<f64> {
    let n = data.nrows() as f64;
    let mean = data.mean_axis(Axis(0)).unwrap();
    let centered = data - &mean;
    centered.t().dot(&centered) / (n - 1.0).max(1.0)
}
