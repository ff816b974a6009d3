//! Regime HMM: emissions, decoding algorithms, fitting, state matching

pub mod algorithms;
pub mod gaussian;
pub mod hmm;
pub mod matching;

pub use gaussian::{CovarianceKind, StateGaussian};
pub use hmm::{mean_dwell, select_n_states, HmmConfig, RegimeHmm, RegimeMetrics, UNKNOWN_STATE};
pub use matching::match_states;
