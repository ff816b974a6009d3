//! Regime tracker CLI
//!
//! Training, classification, tuning, walk-forward validation, and model
//! inventory over the filesystem artifact store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use regime_tracker::{
    model::CovarianceKind,
    training::{HyperparameterTuner, TuningMetric},
    ArtifactStore, CrossValidator, EncoderKind, FeatureTable, ScalerKind, TrainingConfig,
    TrainingPipeline, UNKNOWN_STATE,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "regime_tracker")]
#[command(about = "HMM regime identification over feature streams")]
struct Cli {
    /// Root directory of the model store
    #[arg(long, default_value = "models", global = true)]
    models_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a feature CSV and persist it
    Train {
        /// Input CSV (timestamp column plus feature columns)
        #[arg(short, long)]
        input: String,

        /// Ticker symbol (e.g. BTCUSDT)
        #[arg(short, long)]
        ticker: String,

        /// Bar timeframe (e.g. 15m, 1h)
        #[arg(long, default_value = "1h")]
        timeframe: String,

        /// Scaler variant: robust, standard, power
        #[arg(long, default_value = "robust")]
        scaler: ScalerKind,

        /// Encoder variant: pca, temporal_pca
        #[arg(long, default_value = "pca")]
        encoder: EncoderKind,

        /// Latent dimension (omit for automatic selection)
        #[arg(long)]
        latent_dim: Option<usize>,

        /// State count (omit for BIC selection)
        #[arg(short = 'n', long)]
        n_states: Option<usize>,

        /// Covariance structure: diag, full
        #[arg(long, default_value = "diag")]
        covariance: CovarianceKind,

        /// Fraction of rows used for training
        #[arg(long, default_value = "0.8")]
        train_fraction: f64,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// Skip state matching against the previous model
        #[arg(long)]
        no_match: bool,
    },

    /// Classify a feature CSV with a stored model
    Classify {
        #[arg(short, long)]
        input: String,

        #[arg(short, long)]
        ticker: String,

        #[arg(long, default_value = "1h")]
        timeframe: String,

        /// Model id (defaults to the latest stored model)
        #[arg(short, long)]
        model_id: Option<String>,

        /// Write the full output sequence to this JSON file
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Grid-search hyperparameters on a feature CSV
    Tune {
        #[arg(short, long)]
        input: String,

        #[arg(short, long)]
        ticker: String,

        #[arg(long, default_value = "1h")]
        timeframe: String,

        #[arg(long, value_delimiter = ',', default_value = "2,3,4")]
        latent_dims: Vec<usize>,

        #[arg(long, value_delimiter = ',', default_value = "3,4,5,6")]
        state_counts: Vec<usize>,

        /// Validation metric: log-likelihood, bic, aic
        #[arg(long, default_value = "log-likelihood")]
        metric: TuningMetric,
    },

    /// Walk-forward validation on a feature CSV
    WalkForward {
        #[arg(short, long)]
        input: String,

        #[arg(short, long)]
        ticker: String,

        #[arg(long, default_value = "1h")]
        timeframe: String,

        /// Training rows per fold
        #[arg(long, default_value = "1000")]
        train_window: usize,

        /// Validation rows per fold
        #[arg(long, default_value = "250")]
        val_window: usize,

        /// Rows each fold advances
        #[arg(long, default_value = "250")]
        step: usize,

        /// Latent dimension (omit for automatic selection)
        #[arg(long)]
        latent_dim: Option<usize>,

        /// State count (omit for BIC selection)
        #[arg(short = 'n', long)]
        n_states: Option<usize>,
    },

    /// List stored models for a stream
    Models {
        #[arg(short, long)]
        ticker: String,

        #[arg(long, default_value = "1h")]
        timeframe: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("regime_tracker=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let store = ArtifactStore::new(&cli.models_dir);

    match cli.command {
        Commands::Train {
            input,
            ticker,
            timeframe,
            scaler,
            encoder,
            latent_dim,
            n_states,
            covariance,
            train_fraction,
            seed,
            no_match,
        } => {
            let config = TrainingConfig {
                ticker,
                timeframe,
                scaler,
                encoder,
                latent_dim,
                n_states,
                covariance,
                train_fraction,
                seed,
                match_previous: !no_match,
                ..TrainingConfig::default()
            };
            train(&store, config, &input)?;
        }
        Commands::Classify {
            input,
            ticker,
            timeframe,
            model_id,
            output,
        } => {
            classify(
                &store,
                &ticker,
                &timeframe,
                model_id.as_deref(),
                &input,
                output.as_deref(),
            )?;
        }
        Commands::Tune {
            input,
            ticker,
            timeframe,
            latent_dims,
            state_counts,
            metric,
        } => {
            tune(&ticker, &timeframe, &input, latent_dims, state_counts, metric)?;
        }
        Commands::WalkForward {
            input,
            ticker,
            timeframe,
            train_window,
            val_window,
            step,
            latent_dim,
            n_states,
        } => {
            walk_forward(
                &ticker,
                &timeframe,
                &input,
                train_window,
                val_window,
                step,
                latent_dim,
                n_states,
            )?;
        }
        Commands::Models { ticker, timeframe } => {
            list_models(&store, &ticker, &timeframe)?;
        }
    }

    Ok(())
}

fn train(store: &ArtifactStore, config: TrainingConfig, input: &str) -> Result<()> {
    println!("{}", "Loading feature table...".cyan());
    let table = FeatureTable::from_csv(input)?;
    println!(
        "Loaded {} rows x {} features",
        table.n_samples(),
        table.n_features()
    );

    println!("{}", "Training...".cyan());
    let pipeline = TrainingPipeline::new(store.clone(), config);
    let result = pipeline.train(&table)?;

    println!(
        "{}",
        format!("Training complete! Model id: {}", result.model_id).green()
    );
    println!("  States:          {}", result.n_states);
    println!(
        "  Latent dim:      {} ({:.1}% variance explained)",
        result.latent_dim,
        result.explained_variance * 100.0
    );
    println!("  Recon error:     {:.6}", result.reconstruction_error);
    println!(
        "  Val log-lik:     {:.4}",
        result.val_metrics.log_likelihood
    );
    println!("  Val BIC:         {:.2}", result.val_metrics.bic);
    println!("  Val mean dwell:  {:.2} bars", result.val_metrics.mean_dwell);
    println!(
        "  OOD threshold:   {:.4}",
        result.ood_log_likelihood_threshold
    );
    if !result.state_labels.is_empty() {
        println!("  State labels:");
        for label in &result.state_labels {
            println!("    {} {} - {}", label.state_id, label.short_label, label.label);
        }
    }
    if let Some(mapping) = &result.state_mapping {
        println!("  State mapping:   {:?} (vs previous model)", mapping);
    }
    Ok(())
}

fn classify(
    store: &ArtifactStore,
    ticker: &str,
    timeframe: &str,
    model_id: Option<&str>,
    input: &str,
    output: Option<&str>,
) -> Result<()> {
    let bundle = match model_id {
        Some(id) => store.load(ticker, timeframe, id)?,
        None => store
            .latest(ticker, timeframe)?
            .ok_or_else(|| anyhow::anyhow!("no models stored for {}/{}", ticker, timeframe))?,
    };
    println!(
        "Using model {} ({} states, trained {})",
        bundle.metadata.model_id.bold(),
        bundle.metadata.n_states,
        bundle.metadata.created_at.format("%Y-%m-%d")
    );

    let table = FeatureTable::from_csv(input)?;
    let mut engine = bundle.engine();
    let outputs = engine.process_batch(&table, ticker)?;

    let unknown = outputs
        .iter()
        .filter(|o| o.state_id == UNKNOWN_STATE)
        .count();
    let ood = outputs.iter().filter(|o| o.is_ood).count();
    println!(
        "Classified {} bars ({} unknown, {} out-of-distribution)",
        outputs.len(),
        unknown,
        ood
    );

    println!("\nLast 5 bars:");
    for out in outputs.iter().rev().take(5).rev() {
        let state_str = if out.state_id == UNKNOWN_STATE {
            "UNKNOWN".yellow()
        } else {
            format!("state {}", out.state_id).normal()
        };
        println!(
            "  {} | {} | confidence {:.1}% | log-lik {:.2}{}",
            out.timestamp,
            state_str,
            out.confidence * 100.0,
            out.log_likelihood,
            if out.is_ood { " [OOD]".red().to_string() } else { String::new() }
        );
    }

    if let Some(current) = outputs.last() {
        println!("\n{}", "=== Current Regime ===".bold());
        if current.state_id == UNKNOWN_STATE {
            println!("  {}", "UNKNOWN".yellow().bold());
        } else {
            println!("  {}", format!("State {}", current.state_id).bold());
            if let Some(label) = bundle
                .metadata
                .state_labels
                .iter()
                .find(|l| l.state_id == current.state_id as usize)
            {
                println!("  Label:      {} ({})", label.label, label.description);
            }
            println!("  Confidence: {:.1}%", current.confidence * 100.0);
            println!("  Entropy:    {:.3} nats", current.entropy());
        }
    }

    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&outputs)?)?;
        println!("{}", format!("Saved outputs to {}", path).green());
    }
    Ok(())
}

fn tune(
    ticker: &str,
    timeframe: &str,
    input: &str,
    latent_dims: Vec<usize>,
    state_counts: Vec<usize>,
    metric: TuningMetric,
) -> Result<()> {
    let table = FeatureTable::from_csv(input)?;
    let base = TrainingConfig {
        ticker: ticker.to_string(),
        timeframe: timeframe.to_string(),
        ..TrainingConfig::default()
    };
    let tuner = HyperparameterTuner {
        latent_dims,
        state_counts,
        metric,
        ..HyperparameterTuner::default()
    };

    println!("{}", "Running grid search...".cyan());
    let report = tuner.run(&table, &base)?;

    println!("\nEvaluated {} cells:", report.evaluated.len());
    for (point, score) in &report.evaluated {
        println!(
            "  latent={} states={} cov={} -> val {} {:.4}",
            point.latent_dim, point.n_states, point.covariance, report.metric, score
        );
    }
    println!(
        "\n{}",
        format!(
            "Best: latent={} states={} cov={} (val {} {:.4})",
            report.best.latent_dim,
            report.best.n_states,
            report.best.covariance,
            report.metric,
            report.best_score
        )
        .green()
        .bold()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn walk_forward(
    ticker: &str,
    timeframe: &str,
    input: &str,
    train_window: usize,
    val_window: usize,
    step: usize,
    latent_dim: Option<usize>,
    n_states: Option<usize>,
) -> Result<()> {
    let table = FeatureTable::from_csv(input)?;
    let config = TrainingConfig {
        ticker: ticker.to_string(),
        timeframe: timeframe.to_string(),
        latent_dim,
        n_states,
        ..TrainingConfig::default()
    };

    println!("{}", "Running walk-forward validation...".cyan());
    let report = CrossValidator::new(train_window, val_window, step).run(&table, &config)?;

    println!("\n{} folds:", report.folds.len());
    for fold in &report.folds {
        println!(
            "  fold {} | states={} | val log-lik {:.4} | BIC {:.2} | dwell {:.2}",
            fold.fold, fold.n_states, fold.val_log_likelihood, fold.val_bic, fold.val_mean_dwell
        );
    }
    println!(
        "\n{}",
        format!(
            "Mean val log-lik: {:.4} (std {:.4})",
            report.mean_log_likelihood, report.std_log_likelihood
        )
        .green()
    );
    Ok(())
}

fn list_models(store: &ArtifactStore, ticker: &str, timeframe: &str) -> Result<()> {
    let models = store.list_models(ticker, timeframe)?;
    if models.is_empty() {
        println!("No models stored for {}/{}", ticker, timeframe);
        return Ok(());
    }

    println!("{}", format!("Models for {}/{}:", ticker, timeframe).bold());
    for (i, m) in models.iter().enumerate() {
        let marker = if i == models.len() - 1 {
            " (latest)".green().to_string()
        } else {
            String::new()
        };
        println!(
            "  {} | {} states | latent {} | trained {} on {} rows | val log-lik {:.2}{}",
            m.model_id.bold(),
            m.n_states,
            m.latent_dim,
            m.created_at.format("%Y-%m-%d %H:%M"),
            m.train_rows,
            m.metrics.log_likelihood,
            marker
        );
    }
    Ok(())
}
