// Signal and noise windows on both sides of a symmetric correlation
//
// Zero lag sits at sample `nt = nn / 2` (0-based). The causal side holds
// positive lags (indices above nt), the acausal side negative lags (below
// nt). Windows are inclusive index ranges.

use serde::Serialize;

use crate::error::{DriftError, Result};

/// Inclusive sample-index range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexWindow {
    pub start: usize,
    pub end: usize,
}

impl IndexWindow {
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, i: usize) -> bool {
        i >= self.start && i <= self.end
    }

    pub fn overlaps(&self, other: &IndexWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Reflect about `center`: index i maps to 2 * center - i
    pub fn mirrored(&self, center: usize) -> Option<IndexWindow> {
        let start = (2 * center).checked_sub(self.end)?;
        let end = (2 * center).checked_sub(self.start)?;
        Some(IndexWindow { start, end })
    }

    pub fn slice<'a>(&self, data: &'a [f64]) -> &'a [f64] {
        &data[self.start..=self.end]
    }
}

/// The four windows used for SNR estimation and peak picking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalWindows {
    pub zero_lag: usize,
    pub causal_signal: IndexWindow,
    pub causal_noise: IndexWindow,
    pub acausal_signal: IndexWindow,
    pub acausal_noise: IndexWindow,
}

/// Signed sample offset for a lag time, rounded half away from zero.
/// Offsets that cannot fit in a trace of `nn` samples (or are NaN) saturate
/// at `nn + 1` so the window check rejects them.
fn offset(seconds: f64, dt: f64, nn: usize) -> i64 {
    let limit = nn as i64 + 1;
    let samples = (seconds / dt).round();
    if samples.is_nan() {
        return limit;
    }
    samples.clamp(-(limit as f64), limit as f64) as i64
}

/// Check `[start, end]` against the half-open bounds `[lower, upper)`
fn checked_window(start: i64, end: i64, lower: i64, upper: i64) -> Result<IndexWindow> {
    if start < lower || end >= upper || start > end {
        return Err(DriftError::WindowOutOfBounds { start, end, lower, upper });
    }
    Ok(IndexWindow {
        start: start as usize,
        end: end as usize,
    })
}

/// Compute signal and noise windows for one correlation.
///
/// # Arguments
/// * `nn` - Number of samples in the trace
/// * `dt` - Sample interval (s)
/// * `cpl_dist` - Station separation (m)
/// * `apr_dt_cpl` - A priori apparent shift of the pair (s); each side is
///   moved by half of it
/// * `v1`, `v2` - Fast and slow velocity bounds of the signal window (m/s)
/// * `noise_st` - Start of the noise window (s); the noise window spans
///   `[noise_st, 2 * noise_st]`
///
/// # Errors
/// `InvalidParameters` if `dt` is not a positive finite interval.
/// `WindowOutOfBounds` if a causal window does not lie strictly after zero
/// lag and inside the trace, or an acausal window strictly before zero lag
/// and at or after sample 0.
pub fn compute_windows(
    nn: usize,
    dt: f64,
    cpl_dist: f64,
    apr_dt_cpl: f64,
    v1: f64,
    v2: f64,
    noise_st: f64,
) -> Result<SignalWindows> {
    if !(dt.is_finite() && dt > 0.0) {
        return Err(DriftError::InvalidParameters(format!("sample interval {} is not positive", dt)));
    }
    let nt = (nn / 2) as i64;
    let half_shift = apr_dt_cpl / 2.0;
    let t_fast = cpl_dist / v1;
    let t_slow = cpl_dist / v2;

    let causal_signal = checked_window(
        nt + offset(t_fast + half_shift, dt, nn),
        nt + offset(t_slow + half_shift, dt, nn),
        nt + 1,
        nn as i64,
    )?;
    let causal_noise = checked_window(
        nt + offset(noise_st + half_shift, dt, nn),
        nt + offset(2.0 * noise_st + half_shift, dt, nn),
        nt + 1,
        nn as i64,
    )?;
    let acausal_signal = checked_window(
        nt - offset(t_slow - half_shift, dt, nn),
        nt - offset(t_fast - half_shift, dt, nn),
        0,
        nt,
    )?;
    let acausal_noise = checked_window(
        nt - offset(2.0 * noise_st - half_shift, dt, nn),
        nt - offset(noise_st - half_shift, dt, nn),
        0,
        nt,
    )?;

    Ok(SignalWindows {
        zero_lag: nt as usize,
        causal_signal,
        causal_noise,
        acausal_signal,
        acausal_noise,
    })
}
