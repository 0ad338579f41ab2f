// Shared constants for drift estimation

/// Seconds in one day. Elapsed time in the drift model is expressed in days.
pub const SECONDS_PER_DAY: f64 = 86400.0;

/// Fraction of the trace tapered at each end before filtering.
pub const TAPER_FRACTION: f64 = 0.1;

/// Number of corners of the Butterworth band-pass.
pub const FILTER_CORNERS: i32 = 4;

/// Fast signal-window velocity bound, as a multiple of the reference velocity.
pub const VEL_FAST_FACTOR: f64 = 1.5;

/// Slow signal-window velocity bound, as a multiple of the reference velocity.
pub const VEL_SLOW_FACTOR: f64 = 0.75;

/// Maximum lag (samples) searched when comparing the earliest and latest
/// correlations of a pair for a priori seeding.
pub const SEED_MAX_LAG: usize = 1000;

/// Default width of a correlation period, in days.
pub const DEFAULT_DAYS_APART: f64 = 60.0;

/// Relative tolerance used when checking that the sample interval is a
/// multiple of `dt_err`.
pub const DT_ERR_REL_TOL: f64 = 1e-6;

/// Singular values below this fraction of the largest are treated as zero
/// by the inversion.
pub const SVD_RCOND: f64 = 1e-10;
