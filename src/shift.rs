// Apparent shift estimation for one correlation
//
// The apparent shift is the sum of the causal and acausal peak lags. For a
// trace delayed as a whole by s = dt1 - dt2 the causal arrival sits at
// T + s and the acausal one at -T + s, so the sum is 2 * (dt1 - dt2)
// whatever the travel time T.

use tracing::debug;

use crate::apriori::AprioriDriftModel;
use crate::correlation::{Correlation, Exclusion, ShiftDiagnostics};
use crate::error::{DriftError, Result};
use crate::params::ProcessingParameters;
use crate::signal::SignalProcessor;
use crate::snr::estimate_snr;
use crate::trace::TraceLoader;
use crate::windowing::{compute_windows, IndexWindow};

/// Lag (s) of the largest absolute sample inside `window`, refined to
/// sub-sample precision with a parabola through the peak and its two
/// neighbours. The first sample wins ties.
pub fn peak_lag(data: &[f64], window: &IndexWindow, zero_lag: usize, dt: f64) -> f64 {
    let mut peak = window.start;
    for i in window.start..=window.end {
        if data[i].abs() > data[peak].abs() {
            peak = i;
        }
    }

    let mut offset = 0.0;
    if peak > 0 && peak + 1 < data.len() {
        let (y0, y1, y2) = (data[peak - 1].abs(), data[peak].abs(), data[peak + 1].abs());
        let denom = y0 - 2.0 * y1 + y2;
        if denom < 0.0 {
            offset = (0.5 * (y0 - y2) / denom).clamp(-0.5, 0.5);
        }
    }

    (peak as f64 + offset - zero_lag as f64) * dt
}

/// Computes one apparent shift per call and appends it to the correlation
pub struct ApparentShiftEstimator<'a> {
    loader: &'a dyn TraceLoader,
    processor: &'a dyn SignalProcessor,
}

impl<'a> ApparentShiftEstimator<'a> {
    pub fn new(loader: &'a dyn TraceLoader, processor: &'a dyn SignalProcessor) -> Self {
        ApparentShiftEstimator { loader, processor }
    }

    /// Estimate the apparent shift of `correlation` under `params`, using the
    /// latest a priori drift of both stations to place the windows.
    ///
    /// Gate failures append NaN and record an `Exclusion`; the return value
    /// is then NaN.
    ///
    /// # Errors
    /// * `MissingAprioriDrift` if either station has no a priori estimate
    /// * `WindowOutOfBounds` if the windows do not fit in the trace
    /// * `FileNotFound` / `UnsupportedFormat` from the trace loader, or
    ///   `UnsupportedFormat` for an empty trace or a bad sample interval
    ///
    /// The correlation is left untouched when an error is returned.
    pub fn estimate(
        &self,
        correlation: &mut Correlation,
        params: &ProcessingParameters,
        apriori: &AprioriDriftModel,
    ) -> Result<f64> {
        let ratio = params.separation_ratio(correlation.separation);
        if ratio < params.dist_trh {
            return Ok(exclude(correlation, ShiftDiagnostics::default(), Exclusion::InsufficientSeparation { ratio }));
        }

        let apr1 = apriori.drift_at(&correlation.station1, correlation.t_days)?;
        let apr2 = apriori.drift_at(&correlation.station2, correlation.t_days)?;
        let apr_dt_cpl = 2.0 * apr1 - 2.0 * apr2;

        let trace = self.loader.load(&correlation.path)?;
        if !(trace.delta.is_finite() && trace.delta > 0.0) || trace.data.is_empty() {
            return Err(DriftError::UnsupportedFormat {
                path: correlation.path.clone(),
                reason: format!("unusable trace: delta {}, {} samples", trace.delta, trace.data.len()),
            });
        }
        if !params.is_dt_multiple(trace.delta) {
            debug!(
                file = %correlation.path.display(),
                delta = trace.delta,
                dt_err = params.dt_err,
                "Sample interval is not a multiple of dt_err"
            );
        }
        let data = self.processor.condition(&trace, params.freqmin, params.freqmax);

        let (v1, v2) = params.velocity_bounds();
        let windows = compute_windows(
            data.len(),
            trace.delta,
            correlation.separation,
            apr_dt_cpl,
            v1,
            v2,
            params.noise_st,
        )?;

        let mut diagnostics = ShiftDiagnostics {
            apr_dt_cpl,
            windows: params.resp_details.then_some(windows),
            ..Default::default()
        };

        let snr = match estimate_snr(&data, &windows) {
            Ok(snr) => snr,
            Err(DriftError::UndefinedSnr(reason)) => {
                return Ok(exclude(correlation, diagnostics, Exclusion::UndefinedSnr(reason)));
            }
            Err(e) => return Err(e),
        };
        diagnostics.snr = Some(snr);
        if !snr.passes(params.snr_trh) {
            let exclusion = Exclusion::InsufficientSnr {
                causal: snr.causal,
                acausal: snr.acausal,
            };
            return Ok(exclude(correlation, diagnostics, exclusion));
        }

        let causal = peak_lag(&data, &windows.causal_signal, windows.zero_lag, trace.delta);
        let acausal = peak_lag(&data, &windows.acausal_signal, windows.zero_lag, trace.delta);
        let measured = causal + acausal;

        // Report on the dt_err grid, keep what was rounded away
        let t_app = (measured / params.dt_err).round() * params.dt_err;
        let residual = measured - t_app;
        if residual.abs() > 0.0 {
            debug!(
                station1 = %correlation.station1,
                station2 = %correlation.station2,
                measured,
                residual,
                "Shift finer than dt_err"
            );
        }

        diagnostics.causal_lag = Some(causal);
        diagnostics.acausal_lag = Some(acausal);
        diagnostics.quantization_residual = residual;
        correlation.record(t_app, diagnostics);
        Ok(t_app)
    }
}

fn exclude(correlation: &mut Correlation, mut diagnostics: ShiftDiagnostics, exclusion: Exclusion) -> f64 {
    debug!(
        station1 = %correlation.station1,
        station2 = %correlation.station2,
        date = %correlation.average_date,
        "Correlation excluded: {}",
        exclusion
    );
    diagnostics.exclusion = Some(exclusion);
    correlation.record(f64::NAN, diagnostics);
    f64::NAN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apriori::DriftCurve;
    use crate::signal::ButterworthProcessor;
    use crate::station::{Station, StationPair};
    use crate::trace::synthetic::correlation_trace;
    use crate::trace::{MemoryTraceLoader, Trace};
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;

    fn stations(lon_b: f64) -> Vec<Station> {
        vec![Station::new("A", 0, false, 0.0, 0.0), Station::new("B", 1, true, 0.0, lon_b)]
    }

    fn correlation(stations: &[Station]) -> Correlation {
        let t: DateTime<Utc> = "2015-01-01T00:00:00Z".parse().unwrap();
        let pair = StationPair::new(&stations[1], &stations[0]).unwrap();
        Correlation::new(&pair, t, 10.0, PathBuf::from("B_A.json"), 0, t)
    }

    fn params() -> ProcessingParameters {
        // 2001 samples at 0.2 s only reach 200 s of lag
        ProcessingParameters { noise_st: 90.0, ..Default::default() }
    }

    fn loader_with(trace: Trace) -> MemoryTraceLoader {
        let loader = MemoryTraceLoader::new();
        loader.insert("B_A.json", trace);
        loader
    }

    #[test]
    fn test_peak_lag_subsample() {
        let data: Vec<f64> = (0..41).map(|i| (-((i as f64 - 30.3) / 3.0).powi(2)).exp()).collect();
        let lag = peak_lag(&data, &IndexWindow { start: 25, end: 35 }, 20, 1.0);
        assert!((lag - 10.3).abs() < 0.05, "lag {}", lag);

        // Negative lobes count by magnitude
        let flipped: Vec<f64> = data.iter().map(|x| -x).collect();
        let lag = peak_lag(&flipped, &IndexWindow { start: 25, end: 35 }, 20, 1.0);
        assert!((lag - 10.3).abs() < 0.05);
    }

    #[test]
    fn test_shift_of_delayed_trace() {
        let stations = stations(0.45);
        let loader = loader_with(correlation_trace(2001, 0.2, 20.0, 0.4, 0.002, 1));
        let processor = ButterworthProcessor::default();
        let estimator = ApparentShiftEstimator::new(&loader, &processor);
        let apriori = AprioriDriftModel::seed_zero(&stations);

        let mut c = correlation(&stations);
        let t_app = estimator.estimate(&mut c, &params(), &apriori).unwrap();
        assert!((t_app - 0.8).abs() < 0.01, "t_app {}", t_app);
        assert_eq!(c.t_app, vec![t_app]);
        assert!(c.exclusion.is_none());

        let diag = c.latest_diagnostics().unwrap();
        assert!(diag.snr.unwrap().min() > 10.0);
        assert!(diag.windows.is_none());
        assert!((diag.causal_lag.unwrap() - 20.4).abs() < 0.01);
        assert!((diag.acausal_lag.unwrap() + 19.6).abs() < 0.01);
        // Value lies on the dt_err grid
        let steps = t_app / 0.004;
        assert!((steps - steps.round()).abs() < 1e-6);
        assert!(diag.quantization_residual.abs() <= 0.002 + 1e-12);
    }

    #[test]
    fn test_shift_is_idempotent() {
        let stations = stations(0.45);
        let loader = loader_with(correlation_trace(2001, 0.2, 20.0, -0.6, 0.002, 2));
        let processor = ButterworthProcessor::default();
        let estimator = ApparentShiftEstimator::new(&loader, &processor);
        let apriori = AprioriDriftModel::seed_zero(&stations);
        let params = ProcessingParameters { resp_details: true, ..params() };

        let mut c = correlation(&stations);
        let first = estimator.estimate(&mut c, &params, &apriori).unwrap();
        let second = estimator.estimate(&mut c, &params, &apriori).unwrap();
        assert_eq!(c.t_app.len(), 2);
        assert_eq!(c.t_app[0], first);
        assert!((first - second).abs() < 1e-12);
        assert!(c.diagnostics[1].windows.is_some());
    }

    #[test]
    fn test_apriori_moves_windows() {
        let stations = stations(0.45);
        let loader = loader_with(correlation_trace(2001, 0.2, 20.0, 3.0, 0.002, 3));
        let processor = ButterworthProcessor::default();
        let estimator = ApparentShiftEstimator::new(&loader, &processor);

        let mut apriori = AprioriDriftModel::seed_zero(&stations);
        apriori.update("B", DriftCurve::new(0.0, 3.0));

        let mut c = correlation(&stations);
        let t_app = estimator.estimate(&mut c, &params(), &apriori).unwrap();
        assert!((c.diagnostics[0].apr_dt_cpl - 6.0).abs() < 1e-12);
        assert!((t_app - 6.0).abs() < 0.01, "t_app {}", t_app);
    }

    #[test]
    fn test_close_pair_excluded_regardless_of_snr() {
        // 5.6 km is below 2 wavelengths of 8.3 km; the trace is never loaded
        let stations = stations(0.05);
        let loader = MemoryTraceLoader::new();
        let processor = ButterworthProcessor::default();
        let estimator = ApparentShiftEstimator::new(&loader, &processor);
        let apriori = AprioriDriftModel::new();

        let mut c = correlation(&stations);
        let t_app = estimator.estimate(&mut c, &params(), &apriori).unwrap();
        assert!(t_app.is_nan());
        assert!(c.t_app[0].is_nan());
        assert!(matches!(c.exclusion, Some(Exclusion::InsufficientSeparation { .. })));
    }

    #[test]
    fn test_low_snr_excluded() {
        let stations = stations(0.45);
        let loader = loader_with(correlation_trace(2001, 0.2, 20.0, 0.0, 0.002, 4));
        let processor = ButterworthProcessor::default();
        let estimator = ApparentShiftEstimator::new(&loader, &processor);
        let apriori = AprioriDriftModel::seed_zero(&stations);
        let params = ProcessingParameters { snr_trh: 1e9, ..params() };

        let mut c = correlation(&stations);
        assert!(estimator.estimate(&mut c, &params, &apriori).unwrap().is_nan());
        assert!(matches!(c.exclusion, Some(Exclusion::InsufficientSnr { .. })));
        assert!(c.latest_diagnostics().unwrap().snr.is_some());
    }

    #[test]
    fn test_flat_trace_has_undefined_snr() {
        let stations = stations(0.45);
        let loader = loader_with(Trace::new(0.2, vec![0.0; 2001]));
        let processor = ButterworthProcessor::default();
        let estimator = ApparentShiftEstimator::new(&loader, &processor);
        let apriori = AprioriDriftModel::seed_zero(&stations);

        let mut c = correlation(&stations);
        assert!(estimator.estimate(&mut c, &params(), &apriori).unwrap().is_nan());
        assert!(matches!(c.exclusion, Some(Exclusion::UndefinedSnr(_))));
    }

    #[test]
    fn test_hard_failures_leave_correlation_untouched() {
        let stations = stations(0.45);
        let loader = loader_with(correlation_trace(2001, 0.2, 20.0, 0.0, 0.002, 5));
        let processor = ButterworthProcessor::default();
        let estimator = ApparentShiftEstimator::new(&loader, &processor);
        let mut c = correlation(&stations);

        let empty = AprioriDriftModel::new();
        let err = estimator.estimate(&mut c, &params(), &empty).unwrap_err();
        assert_eq!(err, DriftError::MissingAprioriDrift("B".to_string()));

        let apriori = AprioriDriftModel::seed_zero(&stations);
        let long_noise = ProcessingParameters { noise_st: 150.0, ..params() };
        let err = estimator.estimate(&mut c, &long_noise, &apriori).unwrap_err();
        assert!(matches!(err, DriftError::WindowOutOfBounds { .. }));

        assert!(c.t_app.is_empty());
        assert!(c.diagnostics.is_empty());
    }

    #[test]
    fn test_degenerate_sample_interval_is_an_error() {
        let stations = stations(0.45);
        let processor = ButterworthProcessor::default();
        let apriori = AprioriDriftModel::seed_zero(&stations);
        let mut c = correlation(&stations);

        // Parses fine but puts every window billions of samples out
        let loader = loader_with(Trace::new(1e-300, vec![1.0; 2001]));
        let err = ApparentShiftEstimator::new(&loader, &processor)
            .estimate(&mut c, &params(), &apriori)
            .unwrap_err();
        assert!(matches!(err, DriftError::WindowOutOfBounds { .. }), "{:?}", err);

        for delta in [0.0, f64::NAN, f64::INFINITY] {
            let loader = loader_with(Trace::new(delta, vec![1.0; 2001]));
            let err = ApparentShiftEstimator::new(&loader, &processor)
                .estimate(&mut c, &params(), &apriori)
                .unwrap_err();
            assert!(matches!(err, DriftError::UnsupportedFormat { .. }), "delta {}", delta);
        }
        assert!(c.t_app.is_empty());
    }
}
