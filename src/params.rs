// Processing parameters - one immutable bundle per analysed frequency band

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{DT_ERR_REL_TOL, VEL_FAST_FACTOR, VEL_SLOW_FACTOR};
use crate::error::{DriftError, Result};

/// Per-band processing configuration.
///
/// Every field has a default, so a parameter file only needs to list what
/// differs from the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingParameters {
    /// Low corner of the band-pass (Hz)
    pub freqmin: f64,
    /// High corner of the band-pass (Hz)
    pub freqmax: f64,
    /// Reference surface-wave velocity (m/s)
    pub ref_vel: f64,
    /// Minimum station separation in wavelengths at `freqmax`
    pub dist_trh: f64,
    /// Signal-to-noise ratio threshold
    pub snr_trh: f64,
    /// Start of the noise window (s)
    pub noise_st: f64,
    /// Clock quantization; the sample interval must be a multiple of it (s)
    pub dt_err: f64,
    /// Keep per-pass window and SNR diagnostics on each correlation
    pub resp_details: bool,
    /// Fast velocity bound of the signal window (m/s), default 1.5 x ref_vel
    pub vel_fast: Option<f64>,
    /// Slow velocity bound of the signal window (m/s), default 0.75 x ref_vel
    pub vel_slow: Option<f64>,
}

impl Default for ProcessingParameters {
    fn default() -> Self {
        ProcessingParameters {
            freqmin: 0.15,
            freqmax: 0.3,
            ref_vel: 2500.0,
            dist_trh: 2.0,
            snr_trh: 10.0,
            noise_st: 240.0,
            dt_err: 0.004,
            resp_details: false,
            vel_fast: None,
            vel_slow: None,
        }
    }
}

impl ProcessingParameters {
    /// Shortest wavelength of the band (m)
    pub fn min_wavelength(&self) -> f64 {
        self.ref_vel / self.freqmax
    }

    /// Station separation expressed in minimum wavelengths
    pub fn separation_ratio(&self, separation_m: f64) -> f64 {
        separation_m / self.min_wavelength()
    }

    /// Whether a pair at this separation passes the separation gate
    pub fn passes_separation(&self, separation_m: f64) -> bool {
        self.separation_ratio(separation_m) >= self.dist_trh
    }

    /// (fast, slow) velocity bounds delimiting the signal window
    pub fn velocity_bounds(&self) -> (f64, f64) {
        (
            self.vel_fast.unwrap_or(self.ref_vel * VEL_FAST_FACTOR),
            self.vel_slow.unwrap_or(self.ref_vel * VEL_SLOW_FACTOR),
        )
    }

    /// Whether the sample interval is an integer multiple of `dt_err`
    pub fn is_dt_multiple(&self, dt: f64) -> bool {
        let ratio = dt / self.dt_err;
        (ratio - ratio.round()).abs() <= DT_ERR_REL_TOL * ratio.max(1.0)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.freqmin > 0.0 && self.freqmin < self.freqmax) {
            return Err(DriftError::InvalidParameters(format!(
                "need 0 < freqmin < freqmax, got {} / {}",
                self.freqmin, self.freqmax
            )));
        }
        if self.ref_vel <= 0.0 {
            return Err(DriftError::InvalidParameters(format!("ref_vel must be positive, got {}", self.ref_vel)));
        }
        let (fast, slow) = self.velocity_bounds();
        if !(slow > 0.0 && fast > slow) {
            return Err(DriftError::InvalidParameters(format!(
                "need vel_fast > vel_slow > 0, got {} / {}",
                fast, slow
            )));
        }
        if self.dt_err <= 0.0 {
            return Err(DriftError::InvalidParameters(format!("dt_err must be positive, got {}", self.dt_err)));
        }
        if self.noise_st <= 0.0 {
            return Err(DriftError::InvalidParameters(format!("noise_st must be positive, got {}", self.noise_st)));
        }
        Ok(())
    }
}

/// Load a JSON array of parameter bands.
pub fn load_parameter_file(path: &Path) -> Result<Vec<ProcessingParameters>> {
    if !path.exists() {
        return Err(DriftError::FileNotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    let bands: Vec<ProcessingParameters> =
        serde_json::from_str(&text).map_err(|e| DriftError::InvalidParameters(e.to_string()))?;
    if bands.is_empty() {
        return Err(DriftError::InvalidParameters("parameter file lists no bands".to_string()));
    }
    for band in &bands {
        band.validate()?;
    }
    Ok(bands)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band_02_04() -> ProcessingParameters {
        ProcessingParameters {
            freqmin: 0.2,
            freqmax: 0.4,
            ref_vel: 4500.0,
            dist_trh: 2.5,
            snr_trh: 30.0,
            noise_st: 240.0,
            dt_err: 0.004,
            ..Default::default()
        }
    }

    #[test]
    fn test_separation_gate_concrete_scenario() {
        let params = band_02_04();
        assert!((params.min_wavelength() - 11250.0).abs() < 1e-9);
        let ratio = params.separation_ratio(50000.0);
        assert!((ratio - 4.444).abs() < 1e-3);
        assert!(params.passes_separation(50000.0));
        assert!(!params.passes_separation(20000.0));
    }

    #[test]
    fn test_velocity_bounds() {
        let params = band_02_04();
        assert_eq!(params.velocity_bounds(), (6750.0, 3375.0));

        let custom = ProcessingParameters { vel_fast: Some(5000.0), vel_slow: Some(4000.0), ..band_02_04() };
        assert_eq!(custom.velocity_bounds(), (5000.0, 4000.0));
    }

    #[test]
    fn test_dt_multiple() {
        let params = ProcessingParameters::default();
        assert!(params.is_dt_multiple(0.2));
        assert!(params.is_dt_multiple(0.004));
        assert!(!params.is_dt_multiple(0.005));
    }

    #[test]
    fn test_validate() {
        assert!(ProcessingParameters::default().validate().is_ok());
        let bad = ProcessingParameters { freqmin: 0.5, freqmax: 0.3, ..Default::default() };
        assert!(matches!(bad.validate(), Err(DriftError::InvalidParameters(_))));
        let bad = ProcessingParameters { vel_fast: Some(1000.0), ..Default::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial_band() {
        let bands: Vec<ProcessingParameters> =
            serde_json::from_str(r#"[{"freqmin": 0.2, "freqmax": 0.4, "ref_vel": 4500}]"#).unwrap();
        assert_eq!(bands.len(), 1);
        assert_eq!(bands[0].ref_vel, 4500.0);
        assert_eq!(bands[0].snr_trh, 10.0);
        assert_eq!(bands[0].vel_fast, None);
    }

    #[test]
    fn test_load_parameter_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bands.json");
        std::fs::write(&path, r#"[{"freqmin": 0.1, "freqmax": 0.2}, {"freqmin": 0.2, "freqmax": 0.4}]"#).unwrap();
        let bands = load_parameter_file(&path).unwrap();
        assert_eq!(bands.len(), 2);

        let missing = dir.path().join("missing.json");
        assert!(matches!(load_parameter_file(&missing), Err(DriftError::FileNotFound(_))));
    }
}
