//! Semantic labels for fitted regime states
//!
//! Maps each state's latent centroid back to the scaled feature space and
//! classifies it by trend direction and volatility character, producing
//! human-readable labels like `up_trending` that survive retrains because
//! they derive from what the state means, not from its index.

use crate::encoder::Encoder;
use crate::model::RegimeHmm;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Human-readable description of one regime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLabel {
    pub state_id: usize,
    /// Full label, e.g. "up_trending"
    pub label: String,
    /// Abbreviated form for compact display, e.g. "UP-T"
    pub short_label: String,
    pub description: String,
}

/// Which features carry trend and volatility information, and the
/// scaled-space thresholds that separate the classes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelingConfig {
    /// Averaged for the trend reading; absent names are skipped
    pub return_features: Vec<String>,
    /// Averaged for the volatility reading; absent names are skipped
    pub volatility_features: Vec<String>,
    pub trend_threshold: f64,
    pub volatility_threshold: f64,
    pub breakout_threshold: f64,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            return_features: vec!["r5".into(), "r15".into(), "r60".into()],
            volatility_features: vec!["vol_z_60".into()],
            trend_threshold: 0.2,
            volatility_threshold: 1.0,
            breakout_threshold: 2.0,
        }
    }
}

/// Label every state of a fitted model.
///
/// State centroids live in latent space; the encoder maps them back to
/// scaled features for classification. When that inverse does not exist
/// (temporal encoders), every state gets a placeholder label instead of
/// the call failing.
pub fn label_states(
    hmm: &RegimeHmm,
    encoder: &Encoder,
    feature_names: &[String],
    config: &LabelingConfig,
) -> Vec<StateLabel> {
    let means = hmm.state_means();
    let k = means.len();
    if k == 0 {
        return vec![];
    }

    let mut centroids = Array2::zeros((k, means[0].len()));
    for (i, mean) in means.iter().enumerate() {
        centroids.row_mut(i).assign(mean);
    }

    let scaled_centroids = match encoder.inverse_transform(&centroids) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(error = %err, "cannot recover feature-space centroids, using placeholder labels");
            return (0..k).map(placeholder_label).collect();
        }
    };

    (0..k)
        .map(|state_id| {
            let trend = classify_trend(
                feature_average(&scaled_centroids, state_id, feature_names, &config.return_features),
                config,
            );
            let volatility = classify_volatility(
                feature_average(
                    &scaled_centroids,
                    state_id,
                    feature_names,
                    &config.volatility_features,
                ),
                config,
            );
            let label = format!("{}_{}", trend, volatility);
            tracing::debug!(state_id, %label, "state labeled");
            StateLabel {
                state_id,
                short_label: short_label(trend, volatility),
                description: describe(trend, volatility),
                label,
            }
        })
        .collect()
}

fn placeholder_label(state_id: usize) -> StateLabel {
    StateLabel {
        state_id,
        label: "unknown".into(),
        short_label: format!("S{}", state_id),
        description: format!("State {} (classification unavailable)", state_id),
    }
}

/// Average centroid value over the configured feature names that exist.
/// No overlap reads as zero, which classifies as neutral.
fn feature_average(
    centroids: &Array2<f64>,
    state_id: usize,
    feature_names: &[String],
    wanted: &[String],
) -> f64 {
    let values: Vec<f64> = wanted
        .iter()
        .filter_map(|name| feature_names.iter().position(|n| n == name))
        .map(|idx| centroids[[state_id, idx]])
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn classify_trend(value: f64, config: &LabelingConfig) -> &'static str {
    if value > config.trend_threshold {
        "up"
    } else if value < -config.trend_threshold {
        "down"
    } else {
        "neutral"
    }
}

fn classify_volatility(value: f64, config: &LabelingConfig) -> &'static str {
    if value > config.breakout_threshold {
        "breakout"
    } else if value > config.volatility_threshold {
        "volatile"
    } else if value < -config.volatility_threshold {
        "consolidation"
    } else {
        "trending"
    }
}

fn short_label(trend: &str, volatility: &str) -> String {
    let t = match trend {
        "up" => "UP",
        "down" => "DN",
        _ => "NT",
    };
    let v = match volatility {
        "breakout" => "B",
        "volatile" => "V",
        "consolidation" => "C",
        _ => "T",
    };
    format!("{}-{}", t, v)
}

fn describe(trend: &str, volatility: &str) -> String {
    let direction = match trend {
        "up" => "Bullish",
        "down" => "Bearish",
        _ => "Neutral",
    };
    let character = match volatility {
        "breakout" => "breakout with expanding volatility",
        "volatile" => "high-volatility, choppy price action",
        "consolidation" => "low-volatility consolidation",
        _ => "steady directional behavior",
    };
    format!("{} regime with {}", direction, character)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::PcaEncoder;
    use crate::model::{HmmConfig, StateGaussian};
    use ndarray::{arr1, Array1};

    const NAMES: [&str; 3] = ["r5", "vol_z_60", "other"];

    /// Identity encoder so latent centroids are the scaled centroids.
    fn identity_encoder(dim: usize) -> Encoder {
        Encoder::Pca(PcaEncoder {
            mean: Array1::zeros(dim),
            components: Array2::eye(dim),
            explained_variance_ratio: Array1::from_elem(dim, 1.0 / dim as f64),
        })
    }

    fn model_with_means(means: Vec<Array1<f64>>) -> RegimeHmm {
        let mut hmm = RegimeHmm::new(HmmConfig {
            n_states: means.len(),
            ..HmmConfig::default()
        });
        hmm.states = means
            .into_iter()
            .map(|m| StateGaussian::spherical(m, 1.0))
            .collect();
        hmm.is_fitted = true;
        hmm
    }

    fn names() -> Vec<String> {
        NAMES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_labels_follow_centroid_character() {
        let hmm = model_with_means(vec![
            arr1(&[1.0, 0.0, 0.0]),  // strong positive returns, calm
            arr1(&[-1.0, 1.5, 0.0]), // negative returns, elevated vol
            arr1(&[0.0, -1.5, 0.0]), // flat, suppressed vol
        ]);
        let labels = label_states(&hmm, &identity_encoder(3), &names(), &LabelingConfig::default());

        assert_eq!(labels.len(), 3);
        assert_eq!(labels[0].label, "up_trending");
        assert_eq!(labels[0].short_label, "UP-T");
        assert_eq!(labels[1].label, "down_volatile");
        assert_eq!(labels[2].label, "neutral_consolidation");
    }

    #[test]
    fn test_breakout_beats_volatile() {
        let hmm = model_with_means(vec![
            arr1(&[0.5, 2.5, 0.0]),
            arr1(&[0.0, 0.0, 0.0]),
        ]);
        let labels = label_states(&hmm, &identity_encoder(3), &names(), &LabelingConfig::default());
        assert_eq!(labels[0].label, "up_breakout");
        assert_eq!(labels[1].label, "neutral_trending");
    }

    #[test]
    fn test_unconfigured_features_read_neutral() {
        let hmm = model_with_means(vec![arr1(&[5.0, 5.0])]);
        let feature_names = vec!["alpha".to_string(), "beta".to_string()];
        let labels = label_states(
            &hmm,
            &identity_encoder(2),
            &feature_names,
            &LabelingConfig::default(),
        );
        assert_eq!(labels[0].label, "neutral_trending");
    }

    #[test]
    fn test_temporal_encoder_gets_placeholder_labels() {
        let hmm = model_with_means(vec![arr1(&[0.0, 0.0]), arr1(&[1.0, 1.0])]);
        let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(3);
        let x = Array2::from_shape_fn((60, 2), |_| rand::Rng::gen::<f64>(&mut rng));
        let temporal =
            Encoder::fit(crate::encoder::EncoderKind::TemporalPca, &x, Some(2), 4).unwrap();

        let labels = label_states(&hmm, &temporal, &names()[..2].to_vec(), &LabelingConfig::default());
        assert_eq!(labels[0].label, "unknown");
        assert_eq!(labels[0].short_label, "S0");
        assert_eq!(labels[1].short_label, "S1");
    }
}
