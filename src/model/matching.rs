//! State relabeling across retrains
//!
//! A freshly fitted model numbers its states arbitrarily. To keep state ids
//! meaningful to downstream consumers, new states are matched to the previous
//! model's states by minimum total distance between state means.

use ndarray::{Array1, Array2};

/// Map each new state index to the old state label it replaces.
///
/// Requires equal state counts; callers skip relabeling (and keep fresh
/// labels) when the count changed.
pub fn match_states(
    old_means: &[Array1<f64>],
    new_means: &[Array1<f64>],
) -> anyhow::Result<Vec<usize>> {
    anyhow::ensure!(
        old_means.len() == new_means.len(),
        "state count changed ({} -> {}), no matching possible",
        old_means.len(),
        new_means.len()
    );
    anyhow::ensure!(!new_means.is_empty(), "no states to match");

    let n = new_means.len();
    let mut cost = Array2::zeros((n, n));
    for (i, new_mean) in new_means.iter().enumerate() {
        for (j, old_mean) in old_means.iter().enumerate() {
            anyhow::ensure!(
                new_mean.len() == old_mean.len(),
                "state dimension mismatch: {} vs {}",
                new_mean.len(),
                old_mean.len()
            );
            cost[[i, j]] = euclidean(new_mean, old_mean);
        }
    }

    Ok(min_cost_assignment(&cost))
}

fn euclidean(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Hungarian algorithm (shortest augmenting path with potentials) on a
/// square cost matrix. Returns the column assigned to each row.
fn min_cost_assignment(cost: &Array2<f64>) -> Vec<usize> {
    let n = cost.nrows();
    // 1-indexed working arrays; index 0 is the virtual source
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; n + 1];
    let mut assigned_row = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for row in 1..=n {
        assigned_row[0] = row;
        let mut j0 = 0usize;
        let mut min_to = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = assigned_row[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;

            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let reduced = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if reduced < min_to[j] {
                    min_to[j] = reduced;
                    way[j] = j0;
                }
                if min_to[j] < delta {
                    delta = min_to[j];
                    j1 = j;
                }
            }

            for j in 0..=n {
                if used[j] {
                    u[assigned_row[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_to[j] -= delta;
                }
            }

            j0 = j1;
            if assigned_row[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            assigned_row[j0] = assigned_row[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut result = vec![0usize; n];
    for j in 1..=n {
        if assigned_row[j] > 0 {
            result[assigned_row[j] - 1] = j - 1;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_identity_when_means_unchanged() {
        let means = vec![arr1(&[0.0, 0.0]), arr1(&[5.0, 5.0]), arr1(&[-5.0, 2.0])];
        let mapping = match_states(&means, &means).unwrap();
        assert_eq!(mapping, vec![0, 1, 2]);
    }

    #[test]
    fn test_recovers_permutation() {
        let old = vec![arr1(&[0.0, 0.0]), arr1(&[5.0, 5.0]), arr1(&[-5.0, 2.0])];
        // New model found the same clusters in a different order
        let new = vec![
            arr1(&[5.1, 4.9]),
            arr1(&[-4.8, 2.2]),
            arr1(&[0.1, -0.1]),
        ];
        let mapping = match_states(&old, &new).unwrap();
        assert_eq!(mapping, vec![1, 2, 0]);
    }

    #[test]
    fn test_count_change_is_error() {
        let old = vec![arr1(&[0.0]), arr1(&[1.0])];
        let new = vec![arr1(&[0.0]), arr1(&[1.0]), arr1(&[2.0])];
        assert!(match_states(&old, &new).is_err());
    }

    #[test]
    fn test_assignment_minimizes_total_cost() {
        // Greedy on row 0 would pick column 0 (cost 1) forcing total 1 + 10;
        // the optimal assignment is 2 + 2.
        let cost =
            Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 2.0, 10.0]).unwrap();
        let assignment = min_cost_assignment(&cost);
        assert_eq!(assignment, vec![1, 0]);
    }
}
