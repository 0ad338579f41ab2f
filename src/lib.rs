// OBS clock drift estimation from ambient-noise cross-correlations

pub mod apriori;
pub mod config;
pub mod constants;
pub mod correlation;
pub mod drift;
pub mod error;
pub mod geodesy;
pub mod graph;
pub mod inversion;
pub mod output;
pub mod params;
pub mod shift;
pub mod signal;
pub mod snr;
pub mod station;
pub mod trace;
pub mod windowing;

pub use drift::ClockDrift;
pub use error::{DriftError, Result};
