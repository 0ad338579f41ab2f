// Signal conditioning - cosine taper and zero-phase band-pass
//
// The band-pass is applied in the frequency domain with the squared
// magnitude response of an analog Butterworth band-pass. That is the
// amplitude response of running the filter forward and backward, with no
// phase shift, so peak lags are preserved.

use std::f64::consts::PI;

use rustfft::{num_complex::Complex, FftPlanner};

use crate::constants::{FILTER_CORNERS, TAPER_FRACTION};
use crate::trace::Trace;

/// Trace conditioning applied before windowing.
pub trait SignalProcessor: Send + Sync {
    /// Taper `fraction` of the samples at each end, in place
    fn taper(&self, data: &mut [f64], fraction: f64);

    /// Zero-phase band-pass between `freqmin` and `freqmax` (Hz)
    fn bandpass(&self, data: &[f64], dt: f64, freqmin: f64, freqmax: f64) -> Vec<f64>;

    /// Taper then band-pass a trace
    fn condition(&self, trace: &Trace, freqmin: f64, freqmax: f64) -> Vec<f64> {
        let mut data = trace.data.clone();
        self.taper(&mut data, TAPER_FRACTION);
        self.bandpass(&data, trace.delta, freqmin, freqmax)
    }
}

/// Default processor: cosine taper and Butterworth band-pass
#[derive(Debug, Clone)]
pub struct ButterworthProcessor {
    pub corners: i32,
}

impl Default for ButterworthProcessor {
    fn default() -> Self {
        ButterworthProcessor { corners: FILTER_CORNERS }
    }
}

/// Power gain of an analog Butterworth band-pass at frequency `f`
fn bandpass_gain(f: f64, freqmin: f64, freqmax: f64, corners: i32) -> f64 {
    if f <= 0.0 {
        return 0.0;
    }
    let f0_sq = freqmin * freqmax;
    let x = (f * f - f0_sq) / (f * (freqmax - freqmin));
    1.0 / (1.0 + x.powi(2 * corners))
}

impl SignalProcessor for ButterworthProcessor {
    fn taper(&self, data: &mut [f64], fraction: f64) {
        let n = data.len();
        let width = ((n as f64) * fraction).floor() as usize;
        if width == 0 || 2 * width > n {
            return;
        }
        for i in 0..width {
            let w = 0.5 * (1.0 - (PI * i as f64 / width as f64).cos());
            data[i] *= w;
            data[n - 1 - i] *= w;
        }
    }

    fn bandpass(&self, data: &[f64], dt: f64, freqmin: f64, freqmax: f64) -> Vec<f64> {
        let n = data.len();
        if n == 0 || dt <= 0.0 {
            return data.to_vec();
        }

        // Zero-pad to avoid wrap-around between the two ends
        let fft_len = (2 * n).next_power_of_two();
        let mut planner = FftPlanner::<f64>::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);

        let mut spectrum: Vec<Complex<f64>> = data
            .iter()
            .map(|&x| Complex::new(x, 0.0))
            .chain(std::iter::repeat(Complex::new(0.0, 0.0)).take(fft_len - n))
            .collect();
        forward.process(&mut spectrum);

        let df = 1.0 / (fft_len as f64 * dt);
        for (k, bin) in spectrum.iter_mut().enumerate() {
            // Negative frequencies mirror the positive half
            let k_pos = if k <= fft_len / 2 { k } else { fft_len - k };
            *bin *= bandpass_gain(k_pos as f64 * df, freqmin, freqmax, self.corners);
        }

        inverse.process(&mut spectrum);
        let scale = 1.0 / fft_len as f64;
        spectrum.iter().take(n).map(|c| c.re * scale).collect()
    }
}
