//! Feature table with named columns
//!
//! Rows are time-ordered observations, columns are named features.
//! Missing values are NaN, which is distinct from zero and propagates
//! through the scaler/encoder as a per-row validity mask.

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, s};
use std::collections::HashMap;

/// Named scalar features for one (symbol, timestamp) observation.
#[derive(Debug, Clone)]
pub struct FeatureVector {
    /// Ticker symbol
    pub symbol: String,
    /// Bar close timestamp
    pub timestamp: DateTime<Utc>,
    /// Feature name -> value (absent name means missing)
    pub features: HashMap<String, f64>,
}

impl FeatureVector {
    /// Convert to a dense array in the given feature order.
    ///
    /// Missing features become NaN.
    pub fn to_array(&self, feature_names: &[String]) -> Array1<f64> {
        Array1::from_iter(
            feature_names
                .iter()
                .map(|name| self.features.get(name).copied().unwrap_or(f64::NAN)),
        )
    }
}

/// Feature matrix with named columns and row timestamps.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    /// Feature matrix (rows = observations, cols = features)
    pub data: Array2<f64>,
    /// Feature names, order-significant
    pub names: Vec<String>,
    /// Timestamps corresponding to each row
    pub timestamps: Vec<DateTime<Utc>>,
}

impl FeatureTable {
    /// Build a table from raw parts, validating shape agreement.
    pub fn new(
        data: Array2<f64>,
        names: Vec<String>,
        timestamps: Vec<DateTime<Utc>>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            data.ncols() == names.len(),
            "column count {} does not match {} feature names",
            data.ncols(),
            names.len()
        );
        anyhow::ensure!(
            data.nrows() == timestamps.len(),
            "row count {} does not match {} timestamps",
            data.nrows(),
            timestamps.len()
        );
        Ok(Self {
            data,
            names,
            timestamps,
        })
    }

    /// Number of observations
    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    /// Number of features
    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    /// Get a feature column by name
    pub fn column(&self, name: &str) -> Option<Array1<f64>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.data.column(idx).to_owned())
    }

    /// Restrict to the given feature names, in that order.
    pub fn select(&self, feature_names: &[String]) -> anyhow::Result<FeatureTable> {
        let mut indices = Vec::with_capacity(feature_names.len());
        for name in feature_names {
            let idx = self
                .names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| anyhow::anyhow!("feature '{}' not present in table", name))?;
            indices.push(idx);
        }

        let mut data = Array2::zeros((self.n_samples(), indices.len()));
        for (j, &idx) in indices.iter().enumerate() {
            data.column_mut(j).assign(&self.data.column(idx));
        }

        Ok(FeatureTable {
            data,
            names: feature_names.to_vec(),
            timestamps: self.timestamps.clone(),
        })
    }

    /// Get a contiguous row slice as a new table
    pub fn slice(&self, start: usize, end: usize) -> FeatureTable {
        FeatureTable {
            data: self.data.slice(s![start..end, ..]).to_owned(),
            names: self.names.clone(),
            timestamps: self.timestamps[start..end].to_vec(),
        }
    }

    /// Row as a feature dictionary (NaN cells omitted).
    pub fn row_features(&self, idx: usize) -> HashMap<String, f64> {
        self.names
            .iter()
            .zip(self.data.row(idx).iter())
            .filter(|(_, v)| v.is_finite())
            .map(|(n, v)| (n.clone(), *v))
            .collect()
    }

    /// Indices of rows containing no missing values.
    pub fn valid_rows(&self) -> Vec<usize> {
        (0..self.n_samples())
            .filter(|&i| self.data.row(i).iter().all(|v| !v.is_nan()))
            .collect()
    }

    /// Load from CSV with a `timestamp` column (RFC 3339) followed by
    /// named numeric feature columns. Empty cells become NaN.
    pub fn from_csv(path: &str) -> anyhow::Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;

        let headers = reader.headers()?.clone();
        anyhow::ensure!(
            headers.len() >= 2 && &headers[0] == "timestamp",
            "expected 'timestamp' plus feature columns, got {:?}",
            headers
        );
        let names: Vec<String> = headers.iter().skip(1).map(|s| s.to_string()).collect();

        let mut timestamps = Vec::new();
        let mut values = Vec::new();

        for result in reader.records() {
            let record = result?;
            let ts = DateTime::parse_from_rfc3339(&record[0])
                .map_err(|e| anyhow::anyhow!("bad timestamp '{}': {}", &record[0], e))?
                .with_timezone(&Utc);
            timestamps.push(ts);

            for field in record.iter().skip(1) {
                if field.is_empty() {
                    values.push(f64::NAN);
                } else {
                    values.push(field.parse()?);
                }
            }
        }

        let n_rows = timestamps.len();
        let data = Array2::from_shape_vec((n_rows, names.len()), values)?;
        Self::new(data, names, timestamps)
    }

    /// Write to CSV in the same layout `from_csv` reads.
    pub fn to_csv(&self, path: &str) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;

        let mut header = vec!["timestamp".to_string()];
        header.extend(self.names.iter().cloned());
        writer.write_record(&header)?;

        for (i, ts) in self.timestamps.iter().enumerate() {
            let mut record = vec![ts.to_rfc3339()];
            for v in self.data.row(i).iter() {
                if v.is_nan() {
                    record.push(String::new());
                } else {
                    record.push(v.to_string());
                }
            }
            writer.write_record(&record)?;
        }

        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ndarray::arr2;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    fn sample_table() -> FeatureTable {
        FeatureTable::new(
            arr2(&[[1.0, 2.0], [3.0, f64::NAN], [5.0, 6.0]]),
            vec!["ret".into(), "vol".into()],
            vec![ts(0), ts(1), ts(2)],
        )
        .unwrap()
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let result = FeatureTable::new(
            arr2(&[[1.0, 2.0]]),
            vec!["only_one".into()],
            vec![ts(0)],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_valid_rows_skips_nan() {
        let table = sample_table();
        assert_eq!(table.valid_rows(), vec![0, 2]);
    }

    #[test]
    fn test_select_reorders_columns() {
        let table = sample_table();
        let selected = table.select(&["vol".into(), "ret".into()]).unwrap();
        assert_eq!(selected.names, vec!["vol".to_string(), "ret".to_string()]);
        assert_eq!(selected.data[[0, 0]], 2.0);
        assert_eq!(selected.data[[0, 1]], 1.0);
    }

    #[test]
    fn test_row_features_drops_missing() {
        let table = sample_table();
        let row = table.row_features(1);
        assert_eq!(row.len(), 1);
        assert_eq!(row["ret"], 3.0);
    }

    #[test]
    fn test_feature_vector_to_array_fills_nan() {
        let mut features = HashMap::new();
        features.insert("ret".to_string(), 0.5);
        let fv = FeatureVector {
            symbol: "BTCUSDT".into(),
            timestamp: ts(0),
            features,
        };
        let arr = fv.to_array(&["ret".into(), "vol".into()]);
        assert_eq!(arr[0], 0.5);
        assert!(arr[1].is_nan());
    }

    #[test]
    fn test_csv_round_trip() {
        let table = sample_table();
        let path = std::env::temp_dir().join("regime_tracker_table_test.csv");
        let path_str = path.to_str().unwrap();
        table.to_csv(path_str).unwrap();
        let loaded = FeatureTable::from_csv(path_str).unwrap();
        assert_eq!(loaded.names, table.names);
        assert_eq!(loaded.n_samples(), 3);
        assert!(loaded.data[[1, 1]].is_nan());
        assert_eq!(loaded.data[[2, 1]], 6.0);
        std::fs::remove_file(path).ok();
    }
}
