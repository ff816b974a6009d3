//! Feature tables and time-ordered splitting

pub mod split;
pub mod table;

pub use split::{validate_no_leakage, DataSplit, TimeSplitter, WalkForwardWindow};
pub use table::{FeatureTable, FeatureVector};
