//! End-to-end: train on synthetic regimes, persist, reload, classify.

use chrono::{DateTime, TimeZone, Utc};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regime_tracker::lifecycle::{PromotionPolicy, ShadowEvaluator};
use regime_tracker::{
    ArtifactStore, FeatureTable, FeatureVector, TrainingConfig, TrainingPipeline, UNKNOWN_STATE,
};
use std::collections::HashMap;

const NAMES: [&str; 4] = ["ret", "vol", "range", "flow"];
const CENTERS: [[f64; 4]; 3] = [
    [0.0, 0.0, 0.0, 0.0],
    [6.0, 6.0, 0.0, 0.0],
    [-6.0, 3.0, 6.0, -6.0],
];

fn ts(i: usize) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(i as i64)
}

/// 300 bars cycling through three well-separated clusters in blocks of 25.
fn three_regime_table(seed: u64) -> (FeatureTable, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = 300;
    let block = 25;
    let mut data = Array2::zeros((n, 4));
    let mut truth = Vec::with_capacity(n);

    for i in 0..n {
        let cluster = (i / block) % 3;
        truth.push(cluster);
        for j in 0..4 {
            data[[i, j]] = CENTERS[cluster][j] + rng.gen::<f64>() * 0.6 - 0.3;
        }
    }

    let table = FeatureTable::new(
        data,
        NAMES.iter().map(|s| s.to_string()).collect(),
        (0..n).map(ts).collect(),
    )
    .unwrap();
    (table, truth)
}

fn temp_store(name: &str) -> ArtifactStore {
    let dir = std::env::temp_dir().join(format!("regime_tracker_e2e_{}", name));
    std::fs::remove_dir_all(&dir).ok();
    ArtifactStore::new(dir)
}

fn config() -> TrainingConfig {
    TrainingConfig {
        ticker: "BTCUSDT".into(),
        latent_dim: Some(2),
        n_states: Some(3),
        ..TrainingConfig::default()
    }
}

#[test]
fn train_persist_reload_classify() {
    let store = temp_store("full");
    let (table, truth) = three_regime_table(1);

    let result = TrainingPipeline::new(store.clone(), config())
        .train(&table)
        .unwrap();
    assert_eq!(result.n_states, 3);
    assert!(result.val_metrics.mean_dwell > 1.0);
    assert_eq!(result.state_labels.len(), 3);

    let bundle = store.load("BTCUSDT", "1h", &result.model_id).unwrap();
    assert_eq!(bundle.metadata.state_labels.len(), 3);
    let mut engine = bundle.engine();
    let outputs = engine.process_batch(&table, "BTCUSDT").unwrap();
    assert_eq!(outputs.len(), table.n_samples());

    // Published states must consistently relabel the true clusters:
    // majority-map each true cluster to a published state, then measure
    // agreement over all bars.
    let mut votes: HashMap<(usize, i64), usize> = HashMap::new();
    for (out, &t) in outputs.iter().zip(truth.iter()) {
        *votes.entry((t, out.state_id)).or_default() += 1;
    }
    let mut cluster_to_state: HashMap<usize, i64> = HashMap::new();
    for cluster in 0..3 {
        let best = (0..3)
            .map(|s| (s as i64, *votes.get(&(cluster, s as i64)).unwrap_or(&0)))
            .max_by_key(|&(_, count)| count)
            .unwrap()
            .0;
        cluster_to_state.insert(cluster, best);
    }
    // Distinct clusters map to distinct states
    let mapped: std::collections::HashSet<i64> = cluster_to_state.values().copied().collect();
    assert_eq!(mapped.len(), 3);

    let correct = outputs
        .iter()
        .zip(truth.iter())
        .filter(|(out, &t)| out.state_id == cluster_to_state[&t])
        .count();
    // The vote gate holds each switch back for a couple of bars, so each
    // of the 11 block boundaries costs a few mismatched bars.
    let accuracy = correct as f64 / outputs.len() as f64;
    assert!(accuracy >= 0.90, "accuracy {:.3} below 0.90", accuracy);

    // The anti-chatter gates may only delay switches, never fragment runs
    let states: Vec<i64> = outputs.iter().map(|o| o.state_id).collect();
    assert!(regime_tracker::model::mean_dwell(&states) > 5.0);
}

#[test]
fn outlier_bar_is_flagged_and_recovered_from() {
    let store = temp_store("ood");
    let (table, _) = three_regime_table(2);
    let result = TrainingPipeline::new(store.clone(), config())
        .train(&table)
        .unwrap();
    let bundle = store.load("BTCUSDT", "1h", &result.model_id).unwrap();
    let mut engine = bundle.engine();

    let mut rng = StdRng::seed_from_u64(5);
    let obs = |i: usize, center: [f64; 4], rng: &mut StdRng| FeatureVector {
        symbol: "BTCUSDT".into(),
        timestamp: ts(1000 + i),
        features: NAMES
            .iter()
            .enumerate()
            .map(|(j, &n)| (n.to_string(), center[j] + rng.gen::<f64>() * 0.4 - 0.2))
            .collect(),
    };

    for i in 0..5 {
        let out = engine.process(&obs(i, CENTERS[0], &mut rng)).unwrap();
        assert!(!out.is_ood);
    }
    let stable = engine.stable_state();

    let spike = engine
        .process(&obs(5, [250.0, -250.0, 250.0, -250.0], &mut rng))
        .unwrap();
    assert_eq!(spike.state_id, UNKNOWN_STATE);
    assert!(spike.is_ood);

    let recovered = engine.process(&obs(6, CENTERS[0], &mut rng)).unwrap();
    assert_eq!(recovered.state_id, stable);
}

#[test]
fn shadow_evaluation_of_identical_models_agrees_but_does_not_promote() {
    let store = temp_store("shadow");
    let (table, _) = three_regime_table(3);
    let result = TrainingPipeline::new(store.clone(), config())
        .train(&table)
        .unwrap();
    let bundle = store.load("BTCUSDT", "1h", &result.model_id).unwrap();

    let mut shadow = ShadowEvaluator::new(bundle.engine(), bundle.engine());
    let mut rng = StdRng::seed_from_u64(9);
    for i in 0..50 {
        let cluster = (i / 10) % 3;
        let observation = FeatureVector {
            symbol: "BTCUSDT".into(),
            timestamp: ts(2000 + i),
            features: NAMES
                .iter()
                .enumerate()
                .map(|(j, &n)| {
                    (
                        n.to_string(),
                        CENTERS[cluster][j] + rng.gen::<f64>() * 0.4 - 0.2,
                    )
                })
                .collect(),
        };
        shadow.observe(&observation).unwrap();
    }

    let report = shadow.report();
    assert_eq!(report.bars, 50);
    assert!(report.agreement_rate > 0.99);

    // An identical candidate cannot strictly beat production
    let decision = shadow.promotion_decision(&PromotionPolicy::default());
    assert!(!decision.promote);
    assert!(!decision.reasons.is_empty());
}

#[test]
fn retrain_on_same_data_keeps_state_identity() {
    let store = temp_store("relabel");
    let (table, _) = three_regime_table(4);
    let pipeline = TrainingPipeline::new(store.clone(), config());

    pipeline.train(&table).unwrap();
    let second = pipeline.train(&table).unwrap();

    let mapping = second.state_mapping.expect("states should match");
    let mut sorted = mapping.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2]);

    let models = store.list_models("BTCUSDT", "1h").unwrap();
    assert_eq!(models.len(), 2);
}
