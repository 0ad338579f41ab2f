// Clock drift orchestration
//
// One iteration:
//   1. apparent shift of every correlation (parallel, one worker per
//      correlation)
//   2. optional station selection on the new shifts
//   3. network inversion over the usable shifts, optionally repeated once
//      after flagging outliers
//   4. append the inverted curves to the a priori model
// Iterations stop when no drift parameter moves by more than the tolerance
// or the iteration budget is spent.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::apriori::{seed_from_pairs, AprioriDriftModel, DriftCurve};
use crate::constants::{DEFAULT_DAYS_APART, SECONDS_PER_DAY};
use crate::correlation::{discover_correlations, Correlation, Exclusion, ShiftDiagnostics};
use crate::error::{DriftError, Result};
use crate::inversion::{invert, predicted_shift, DriftInversionResult, InversionObservation, Weighting};
use crate::params::ProcessingParameters;
use crate::shift::ApparentShiftEstimator;
use crate::signal::{ButterworthProcessor, SignalProcessor};
use crate::station::Station;
use crate::trace::TraceLoader;

/// Outcome counts of one shift-estimation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub estimated: usize,
    pub excluded: usize,
    pub failed: usize,
}

/// Minimum data coverage a station needs to stay in the inversion
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SelectionCriteria {
    /// Periods with enough correlations
    pub min_periods: usize,
    /// Correlations per period for stations needing correction
    pub min_corr_obs: usize,
    /// Correlations per period for reference stations
    pub min_corr_land: usize,
    /// Dates closer than this many days fall in the same period
    pub days_apart: f64,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        SelectionCriteria {
            min_periods: 1,
            min_corr_obs: 1,
            min_corr_land: 1,
            days_apart: DEFAULT_DAYS_APART,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationReport {
    pub iteration: usize,
    pub pass: PassSummary,
    pub observations: usize,
    pub outliers: usize,
    pub excluded_stations: Vec<String>,
    pub unresolved: Vec<String>,
    pub rank_deficient: bool,
    pub rms: f64,
    /// Stations needing correction whose curve was updated
    pub updated: usize,
    /// Largest change of any drift rate or offset in this iteration
    pub max_change: f64,
    /// Set only when some station was estimated and nothing moved by more
    /// than the tolerance
    pub converged: bool,
}

/// Group dates into periods: a date joins the first period whose key is
/// less than `days_apart` days away, otherwise it opens a new period.
/// Returns (period key, count) in order of creation.
pub fn count_periods(dates: &[DateTime<Utc>], days_apart: f64) -> Vec<(DateTime<Utc>, usize)> {
    let mut sorted = dates.to_vec();
    sorted.sort();

    let mut periods: Vec<(DateTime<Utc>, usize)> = Vec::new();
    for date in sorted {
        let found = periods.iter_mut().find(|(key, _)| {
            let seconds = (date - *key).num_milliseconds().abs() as f64 / 1000.0;
            seconds < days_apart * SECONDS_PER_DAY
        });
        match found {
            Some((_, count)) => *count += 1,
            None => periods.push((date, 1)),
        }
    }
    periods
}

/// Where a station stands after the last inversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StationStatus {
    Reference,
    Resolved(DriftCurve),
    /// Removed by the data-coverage selection
    Excluded,
    /// No path to a reference station
    Unresolved,
    /// No inversion has run yet
    Pending,
}

/// Clock drift estimation over a station network
pub struct ClockDrift {
    pub stations: Vec<Station>,
    pub bands: Vec<ProcessingParameters>,
    pub correlations: Vec<Correlation>,
    pub reference_time: DateTime<Utc>,
    pub apriori: AprioriDriftModel,
    pub weighting: Weighting,
    /// Residual (s) above which a shift is flagged as an outlier
    pub max_residual: Option<f64>,
    pub selection: Option<SelectionCriteria>,
    /// Stations removed by the selection
    pub excluded_stations: Vec<String>,
    pub reports: Vec<IterationReport>,
    pub last_result: Option<DriftInversionResult>,
    loader: Box<dyn TraceLoader>,
    processor: Box<dyn SignalProcessor>,
}

impl ClockDrift {
    /// Every station starts with zero a priori drift.
    pub fn new(
        stations: Vec<Station>,
        bands: Vec<ProcessingParameters>,
        correlations: Vec<Correlation>,
        reference_time: DateTime<Utc>,
        loader: Box<dyn TraceLoader>,
    ) -> Result<Self> {
        if bands.is_empty() {
            return Err(DriftError::InvalidParameters("at least one band is required".to_string()));
        }
        for band in &bands {
            band.validate()?;
        }
        for c in &correlations {
            if c.band >= bands.len() {
                return Err(DriftError::InvalidParameters(format!(
                    "correlation {} refers to band {}",
                    c.path.display(),
                    c.band
                )));
            }
            for code in [&c.station1, &c.station2] {
                if !stations.iter().any(|s| &s.code == code) {
                    return Err(DriftError::UnknownStation(code.clone()));
                }
            }
        }

        let apriori = AprioriDriftModel::seed_zero(&stations);
        Ok(ClockDrift {
            stations,
            bands,
            correlations,
            reference_time,
            apriori,
            weighting: Weighting::default(),
            max_residual: None,
            selection: None,
            excluded_stations: Vec::new(),
            reports: Vec::new(),
            last_result: None,
            loader,
            processor: Box::new(ButterworthProcessor::default()),
        })
    }

    /// Index the correlation files of `data_dir` and build the network.
    pub fn from_directory(
        stations: Vec<Station>,
        bands: Vec<ProcessingParameters>,
        data_dir: &Path,
        extension: &str,
        reference_time: DateTime<Utc>,
        loader: Box<dyn TraceLoader>,
    ) -> Result<Self> {
        let correlations = discover_correlations(data_dir, extension, &stations, bands.len(), reference_time)?;
        Self::new(stations, bands, correlations, reference_time, loader)
    }

    pub fn with_processor(mut self, processor: Box<dyn SignalProcessor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_weighting(mut self, weighting: Weighting) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn with_max_residual(mut self, max_residual: Option<f64>) -> Self {
        self.max_residual = max_residual;
        self
    }

    pub fn with_selection(mut self, selection: Option<SelectionCriteria>) -> Self {
        self.selection = selection;
        self
    }

    pub fn station(&self, code: &str) -> Result<&Station> {
        self.stations
            .iter()
            .find(|s| s.code == code)
            .ok_or_else(|| DriftError::UnknownStation(code.to_string()))
    }

    /// Replace the zero seed of stations needing correction with drift rates
    /// estimated from the earliest and latest correlation of each pair,
    /// averaged over bands. Returns the number of seeded stations.
    pub fn seed_from_pairs(&mut self) -> Result<usize> {
        let mut sums: HashMap<String, (DriftCurve, usize)> = HashMap::new();
        for (band, params) in self.bands.iter().enumerate() {
            let seeds = seed_from_pairs(
                &self.correlations,
                &self.stations,
                params,
                band,
                self.loader.as_ref(),
                self.processor.as_ref(),
            )?;
            for (code, curve) in seeds {
                let entry = sums.entry(code).or_insert((DriftCurve::default(), 0));
                entry.0.rate += curve.rate;
                entry.0.offset += curve.offset;
                entry.1 += 1;
            }
        }

        let mut seeded = 0;
        for station in self.stations.iter().filter(|s| s.needs_correction) {
            if let Some((sum, n)) = sums.get(&station.code) {
                let curve = DriftCurve::new(sum.rate / *n as f64, sum.offset / *n as f64);
                debug!(station = %station.code, rate = curve.rate, offset = curve.offset, "A priori seed");
                self.apriori.update(&station.code, curve);
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    /// Append one apparent shift to every correlation.
    ///
    /// Runs in parallel; returns once all correlations are done. A failing
    /// correlation gets NaN and an `Exclusion::Failed` reason; the others
    /// carry on.
    pub fn calculate_shifts(&mut self) -> PassSummary {
        let estimator = ApparentShiftEstimator::new(self.loader.as_ref(), self.processor.as_ref());
        let bands = &self.bands;
        let apriori = &self.apriori;

        let outcomes: Vec<Option<bool>> = self
            .correlations
            .par_iter_mut()
            .map(|c| match estimator.estimate(c, &bands[c.band], apriori) {
                Ok(t_app) => Some(t_app.is_finite()),
                Err(e) => {
                    warn!(file = %c.path.display(), "Shift estimation failed: {}", e);
                    let diagnostics = ShiftDiagnostics {
                        exclusion: Some(Exclusion::Failed(e.to_string())),
                        ..Default::default()
                    };
                    c.record(f64::NAN, diagnostics);
                    None
                }
            })
            .collect();

        let mut summary = PassSummary::default();
        for outcome in outcomes {
            match outcome {
                Some(true) => summary.estimated += 1,
                Some(false) => summary.excluded += 1,
                None => summary.failed += 1,
            }
        }
        summary
    }

    fn is_excluded(&self, code: &str) -> bool {
        self.excluded_stations.iter().any(|s| s == code)
    }

    /// Dates of usable correlations of `code`, ignoring correlations with
    /// stations in `removed`
    fn usable_dates(&self, code: &str, removed: &HashSet<String>) -> Vec<DateTime<Utc>> {
        self.correlations
            .iter()
            .filter(|c| c.involves(code) && c.is_usable())
            .filter(|c| !removed.contains(&c.station1) && !removed.contains(&c.station2))
            .map(|c| c.average_date)
            .collect()
    }

    /// Usable correlations of a station per correlation period
    pub fn correlations_per_period(&self, code: &str, days_apart: f64) -> Vec<(DateTime<Utc>, usize)> {
        count_periods(&self.usable_dates(code, &HashSet::new()), days_apart)
    }

    /// Drop stations without enough usable correlations per period. After
    /// each removal the remaining stations are recounted without the removed
    /// station's correlations. Returns the removed stations.
    pub fn select_stations(&mut self, criteria: &SelectionCriteria) -> Vec<String> {
        let mut removed: HashSet<String> = HashSet::new();
        let mut order = Vec::new();

        let mut restart = true;
        while restart {
            restart = false;
            for station in &self.stations {
                if removed.contains(&station.code) {
                    continue;
                }
                let min_corr = if station.needs_correction {
                    criteria.min_corr_obs
                } else {
                    criteria.min_corr_land
                };
                let periods = count_periods(&self.usable_dates(&station.code, &removed), criteria.days_apart);
                let good = periods.iter().filter(|(_, n)| *n >= min_corr).count();
                if good < criteria.min_periods {
                    warn!(station = %station.code, periods = good, "Station removed from the inversion");
                    removed.insert(station.code.clone());
                    order.push(station.code.clone());
                    restart = true;
                    break;
                }
            }
        }

        self.excluded_stations = order.clone();
        order
    }

    /// Latest usable shifts of the stations still in the inversion, with the
    /// index of the correlation each came from
    pub fn build_observations(&self) -> Vec<(usize, InversionObservation)> {
        self.correlations
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_usable())
            .filter(|(_, c)| !self.is_excluded(&c.station1) && !self.is_excluded(&c.station2))
            .filter_map(|(i, c)| {
                let t_app = c.latest_t_app()?;
                let weight = match self.weighting {
                    Weighting::Uniform => 1.0,
                    Weighting::Snr => c.latest_diagnostics().and_then(|d| d.snr).map_or(1.0, |s| s.min()),
                };
                Some((
                    i,
                    InversionObservation {
                        station1: c.station1.clone(),
                        station2: c.station2.clone(),
                        t_days: c.t_days,
                        t_app,
                        weight,
                    },
                ))
            })
            .collect()
    }

    /// Invert the latest shifts and store predicted shifts and residuals on
    /// the latest diagnostics of each correlation that entered the system.
    pub fn invert(&mut self) -> Result<DriftInversionResult> {
        let indexed = self.build_observations();
        let stations: Vec<Station> = self
            .stations
            .iter()
            .filter(|s| !self.is_excluded(&s.code))
            .cloned()
            .collect();
        let observations: Vec<InversionObservation> = indexed.iter().map(|(_, o)| o.clone()).collect();
        let result = invert(&stations, &observations)?;

        for ((i, obs), residual) in indexed.iter().zip(result.residuals.iter()) {
            if let (Some(d1), Some(d2)) = (result.drifts.get(&obs.station1), result.drifts.get(&obs.station2)) {
                if let Some(diag) = self.correlations[*i].latest_diagnostics_mut() {
                    diag.predicted = Some(predicted_shift(d1, d2, obs.t_days));
                    diag.residual = residual.is_finite().then_some(*residual);
                }
            }
        }

        self.last_result = Some(result.clone());
        Ok(result)
    }

    /// Flag correlations whose latest residual exceeds `max_residual`.
    /// Their t_app history is kept; they drop out of the next inversion.
    pub fn flag_outliers(&mut self, max_residual: f64) -> usize {
        let mut flagged = 0;
        for c in &mut self.correlations {
            if let Some(diag) = c.diagnostics.last_mut() {
                if !diag.outlier && diag.residual.map_or(false, |r| r.abs() > max_residual) {
                    debug!(file = %c.path.display(), residual = ?diag.residual, "Outlier");
                    diag.outlier = true;
                    flagged += 1;
                }
            }
        }
        flagged
    }

    /// Append the inverted curves to the a priori model. Unresolved stations
    /// keep their previous curve. Returns the largest parameter change.
    pub fn update_apriori(&mut self, result: &DriftInversionResult) -> f64 {
        let mut max_change: f64 = 0.0;
        for station in self.stations.iter().filter(|s| s.needs_correction) {
            let Ok(new) = result.drift(&station.code) else {
                continue;
            };
            if let Ok(previous) = self.apriori.latest(&station.code) {
                max_change = max_change.max(previous.max_change(new));
            }
            self.apriori.update(&station.code, *new);
        }
        max_change
    }

    pub fn station_status(&self, code: &str) -> Result<StationStatus> {
        let station = self.station(code)?;
        if station.is_reference() {
            return Ok(StationStatus::Reference);
        }
        if self.is_excluded(code) {
            return Ok(StationStatus::Excluded);
        }
        Ok(match &self.last_result {
            None => StationStatus::Pending,
            Some(result) => match result.drift(code) {
                Ok(curve) => StationStatus::Resolved(*curve),
                Err(_) => StationStatus::Unresolved,
            },
        })
    }

    /// Shift predicted for a correlation by the latest a priori model
    pub fn predicted_shift(&self, correlation: &Correlation) -> Result<f64> {
        let d1 = self.apriori.latest(&correlation.station1)?;
        let d2 = self.apriori.latest(&correlation.station2)?;
        Ok(predicted_shift(d1, d2, correlation.t_days))
    }

    /// Iterate shift estimation and inversion until the largest parameter
    /// change drops below `tolerance` or `max_iterations` is reached.
    pub fn run(&mut self, max_iterations: usize, tolerance: f64) -> Result<&[IterationReport]> {
        let first = self.reports.len();
        for iteration in first..first + max_iterations {
            let span = info_span!("iteration", n = iteration);
            let _enter = span.enter();

            let pass = self.calculate_shifts();
            if let Some(criteria) = self.selection {
                self.select_stations(&criteria);
            }

            let mut result = self.invert()?;
            let mut outliers = 0;
            if let Some(max_residual) = self.max_residual {
                outliers = self.flag_outliers(max_residual);
                if outliers > 0 {
                    result = self.invert()?;
                }
            }

            let updated = self
                .stations
                .iter()
                .filter(|s| s.needs_correction && result.drift(&s.code).is_ok())
                .count();
            let max_change = self.update_apriori(&result);
            let estimated_any = result.n_equations > 0 && updated > 0;
            let converged = estimated_any && max_change < tolerance;
            let report = IterationReport {
                iteration,
                pass,
                observations: result.n_equations,
                outliers,
                excluded_stations: self.excluded_stations.clone(),
                unresolved: result.unresolved.clone(),
                rank_deficient: result.is_rank_deficient(),
                rms: result.rms,
                updated,
                max_change,
                converged,
            };
            info!(
                estimated = pass.estimated,
                excluded = pass.excluded,
                failed = pass.failed,
                observations = report.observations,
                outliers,
                max_change,
                rms = report.rms,
                "Iteration done"
            );
            self.reports.push(report);

            // The a priori model did not change, so another pass sees the same windows
            if !estimated_any {
                warn!(
                    observations = result.n_equations,
                    updated, "No station drift estimated; stopping without convergence"
                );
                break;
            }
            if converged {
                info!(iterations = iteration + 1, "Drift estimates converged");
                break;
            }
        }
        Ok(&self.reports[first..])
    }

    /// Correlations of a station pair, in either order
    pub fn correlations_of_pair(&self, a: &str, b: &str) -> Vec<&Correlation> {
        self.correlations.iter().filter(|c| c.is_pair(a, b)).collect()
    }

    pub fn correlations_of_station(&self, code: &str) -> Vec<&Correlation> {
        self.correlations.iter().filter(|c| c.involves(code)).collect()
    }

    pub fn correlations_of_band(&self, band: usize) -> Vec<&Correlation> {
        self.correlations.iter().filter(|c| c.band == band).collect()
    }

    /// Correlations of a station whose latest shift is usable
    pub fn usable_count(&self, code: &str) -> usize {
        self.correlations.iter().filter(|c| c.involves(code) && c.is_usable()).count()
    }

    /// Stations with fewer than `min` usable correlations
    pub fn stations_below(&self, min: usize) -> Vec<&str> {
        self.stations
            .iter()
            .filter(|s| self.usable_count(&s.code) < min)
            .map(|s| s.code.as_str())
            .collect()
    }
}
