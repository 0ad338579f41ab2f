// Signal-to-noise ratio of the causal and acausal arrivals
//
// Signal amplitude is the peak absolute value inside each signal window.
// Noise is pooled over both noise windows: one mean and one (sample)
// variance over the concatenated samples.

use serde::Serialize;

use crate::error::{DriftError, Result};
use crate::windowing::{IndexWindow, SignalWindows};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Snr {
    pub causal: f64,
    pub acausal: f64,
}

impl Snr {
    /// Both sides at or above `threshold`. NaN never passes.
    pub fn passes(&self, threshold: f64) -> bool {
        self.causal >= threshold && self.acausal >= threshold
    }

    pub fn min(&self) -> f64 {
        self.causal.min(self.acausal)
    }
}

fn peak_amplitude(data: &[f64], window: &IndexWindow) -> f64 {
    window.slice(data).iter().fold(0.0, |m, x| m.max(x.abs()))
}

/// Compute causal and acausal SNR.
///
/// # Errors
/// * `WindowOutOfBounds` if a window reaches past the end of `data`
/// * `UndefinedSnr` if the pooled noise has fewer than two samples or zero
///   standard deviation
pub fn estimate_snr(data: &[f64], windows: &SignalWindows) -> Result<Snr> {
    for w in [windows.causal_signal, windows.causal_noise, windows.acausal_signal, windows.acausal_noise] {
        if w.end >= data.len() {
            return Err(DriftError::WindowOutOfBounds {
                start: w.start as i64,
                end: w.end as i64,
                lower: 0,
                upper: data.len() as i64,
            });
        }
    }

    let noise = windows
        .causal_noise
        .slice(data)
        .iter()
        .chain(windows.acausal_noise.slice(data).iter());
    let n = windows.causal_noise.len() + windows.acausal_noise.len();
    if n <= 1 {
        return Err(DriftError::UndefinedSnr(format!("{} noise samples", n)));
    }

    let mean = noise.clone().sum::<f64>() / n as f64;
    let variance = noise.map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let std = variance.sqrt();
    if !(std > 0.0) {
        return Err(DriftError::UndefinedSnr("noise standard deviation is zero".to_string()));
    }

    Ok(Snr {
        causal: peak_amplitude(data, &windows.causal_signal) / std,
        acausal: peak_amplitude(data, &windows.acausal_signal) / std,
    })
}
