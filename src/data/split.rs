//! Leakage-safe train/validation splitting
//!
//! Splits are strictly time-ordered: every training timestamp must precede
//! every validation timestamp. Violations are fatal, never patched over.

use super::table::FeatureTable;
use chrono::{DateTime, Utc};

/// A time-ordered train/validation split.
#[derive(Debug, Clone)]
pub struct DataSplit {
    pub train: FeatureTable,
    pub val: FeatureTable,
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub val_start: DateTime<Utc>,
    pub val_end: DateTime<Utc>,
}

/// Row-index bounds for one walk-forward fold.
#[derive(Debug, Clone, Copy)]
pub struct WalkForwardWindow {
    pub train_start: usize,
    pub train_end: usize,
    pub val_start: usize,
    pub val_end: usize,
}

/// Verify that the split has no temporal leakage.
///
/// Hard precondition for training: max(train timestamps) < min(val timestamps).
pub fn validate_no_leakage(train: &FeatureTable, val: &FeatureTable) -> anyhow::Result<()> {
    let train_end = train
        .timestamps
        .iter()
        .max()
        .ok_or_else(|| anyhow::anyhow!("empty training table"))?;
    let val_start = val
        .timestamps
        .iter()
        .min()
        .ok_or_else(|| anyhow::anyhow!("empty validation table"))?;

    anyhow::ensure!(
        train_end < val_start,
        "temporal leakage: training window ends at {} but validation starts at {}",
        train_end,
        val_start
    );
    Ok(())
}

/// Splits a time-ordered feature table into train/validation windows.
pub struct TimeSplitter {
    /// Fraction of rows assigned to training in `split`
    pub train_fraction: f64,
}

impl Default for TimeSplitter {
    fn default() -> Self {
        Self {
            train_fraction: 0.8,
        }
    }
}

impl TimeSplitter {
    pub fn new(train_fraction: f64) -> Self {
        Self { train_fraction }
    }

    /// Single chronological split at `train_fraction`.
    pub fn split(&self, table: &FeatureTable) -> anyhow::Result<DataSplit> {
        let n = table.n_samples();
        anyhow::ensure!(n >= 4, "need at least 4 rows to split, got {}", n);

        let cut = ((n as f64 * self.train_fraction) as usize).clamp(1, n - 1);
        let train = table.slice(0, cut);
        let val = table.slice(cut, n);

        validate_no_leakage(&train, &val)?;

        Ok(DataSplit {
            train_start: train.timestamps[0],
            train_end: *train.timestamps.last().unwrap(),
            val_start: val.timestamps[0],
            val_end: *val.timestamps.last().unwrap(),
            train,
            val,
        })
    }

    /// Successive sliding windows for walk-forward validation.
    ///
    /// Each fold trains on `train_window` rows and validates on the next
    /// `val_window` rows; folds advance by `step` rows.
    pub fn walk_forward(
        &self,
        table: &FeatureTable,
        train_window: usize,
        val_window: usize,
        step: usize,
    ) -> anyhow::Result<Vec<WalkForwardWindow>> {
        anyhow::ensure!(train_window > 0 && val_window > 0 && step > 0, "window sizes must be positive");

        let n = table.n_samples();
        anyhow::ensure!(
            n >= train_window + val_window,
            "need at least {} rows for one fold, got {}",
            train_window + val_window,
            n
        );

        let mut windows = Vec::new();
        let mut start = 0;
        while start + train_window + val_window <= n {
            windows.push(WalkForwardWindow {
                train_start: start,
                train_end: start + train_window,
                val_start: start + train_window,
                val_end: start + train_window + val_window,
            });
            start += step;
        }
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::Array2;

    fn table(n: usize) -> FeatureTable {
        let timestamps = (0..n)
            .map(|i| Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(i as i64))
            .collect();
        FeatureTable::new(Array2::zeros((n, 2)), vec!["a".into(), "b".into()], timestamps).unwrap()
    }

    #[test]
    fn test_split_is_leakage_free() {
        let split = TimeSplitter::default().split(&table(100)).unwrap();
        assert_eq!(split.train.n_samples(), 80);
        assert_eq!(split.val.n_samples(), 20);
        assert!(split.train_end < split.val_start);
    }

    #[test]
    fn test_leakage_detected() {
        let t = table(10);
        // Validation window starts before training ends.
        let train = t.slice(0, 8);
        let val = t.slice(4, 10);
        assert!(validate_no_leakage(&train, &val).is_err());
    }

    #[test]
    fn test_walk_forward_fold_count() {
        let t = table(100);
        let folds = TimeSplitter::default()
            .walk_forward(&t, 50, 10, 10)
            .unwrap();
        assert_eq!(folds.len(), 5);
        for w in &folds {
            assert_eq!(w.train_end, w.val_start);
            assert_eq!(w.val_end - w.val_start, 10);
        }
    }

    #[test]
    fn test_walk_forward_too_short() {
        let t = table(10);
        assert!(TimeSplitter::default().walk_forward(&t, 50, 10, 10).is_err());
    }
}
