// A priori clock drift model
//
// Each station carries a history of linear drift curves
//   dt_ins(t) = rate * t + offset
// with t in days since the reference time. The latest curve is the prior
// for the next shift-estimation pass; older curves are kept for
// diagnostics.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, info};

use crate::constants::SEED_MAX_LAG;
use crate::correlation::Correlation;
use crate::error::{DriftError, Result};
use crate::params::ProcessingParameters;
use crate::signal::SignalProcessor;
use crate::station::Station;
use crate::trace::TraceLoader;

/// Linear clock drift of one station
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct DriftCurve {
    /// Drift rate (s/day)
    pub rate: f64,
    /// Drift at the reference time (s)
    pub offset: f64,
}

impl DriftCurve {
    pub fn new(rate: f64, offset: f64) -> Self {
        DriftCurve { rate, offset }
    }

    /// Clock error (s) at `t_days` after the reference time
    pub fn at(&self, t_days: f64) -> f64 {
        self.rate * t_days + self.offset
    }

    /// Largest parameter difference to another curve
    pub fn max_change(&self, other: &DriftCurve) -> f64 {
        (self.rate - other.rate).abs().max((self.offset - other.offset).abs())
    }
}

/// Per-station drift history
#[derive(Debug, Clone, Default, Serialize)]
pub struct AprioriDriftModel {
    history: BTreeMap<String, Vec<DriftCurve>>,
}

impl AprioriDriftModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every station at zero drift
    pub fn seed_zero(stations: &[Station]) -> Self {
        let mut model = Self::new();
        for station in stations {
            model.update(&station.code, DriftCurve::default());
        }
        model
    }

    pub fn contains(&self, code: &str) -> bool {
        self.history.get(code).map_or(false, |h| !h.is_empty())
    }

    /// Most recent curve of a station
    pub fn latest(&self, code: &str) -> Result<&DriftCurve> {
        self.history
            .get(code)
            .and_then(|h| h.last())
            .ok_or_else(|| DriftError::MissingAprioriDrift(code.to_string()))
    }

    /// Append a new curve. Previous curves stay in the history.
    pub fn update(&mut self, code: &str, curve: DriftCurve) {
        self.history.entry(code.to_string()).or_default().push(curve);
    }

    /// Latest clock error of a station at `t_days`
    pub fn drift_at(&self, code: &str, t_days: f64) -> Result<f64> {
        Ok(self.latest(code)?.at(t_days))
    }

    pub fn history(&self, code: &str) -> &[DriftCurve] {
        self.history.get(code).map(|h| h.as_slice()).unwrap_or(&[])
    }

    pub fn stations(&self) -> impl Iterator<Item = &str> {
        self.history.keys().map(|k| k.as_str())
    }

    /// Latest curve of every station
    pub fn latest_all(&self) -> BTreeMap<String, DriftCurve> {
        self.history
            .iter()
            .filter_map(|(code, h)| h.last().map(|c| (code.clone(), *c)))
            .collect()
    }
}

/// Lag (samples) maximising sum_i early[i] * late[i + lag] over
/// `-max_lag..=max_lag`. Positive when `late` is delayed relative to `early`.
pub fn lag_of_max_correlation(early: &[f64], late: &[f64], max_lag: usize) -> i64 {
    let n = early.len().min(late.len()) as i64;
    let max_lag = (max_lag as i64).min(n.saturating_sub(1));

    let mut best_lag: i64 = 0;
    let mut best = f64::NEG_INFINITY;
    for lag in -max_lag..=max_lag {
        let lo = 0i64.max(-lag);
        let hi = n.min(n - lag);
        let sum: f64 = (lo..hi).map(|i| early[i as usize] * late[(i + lag) as usize]).sum();
        // Ties go to the smallest |lag|
        if sum > best || (sum == best && lag.abs() < best_lag.abs()) {
            best = sum;
            best_lag = lag;
        }
    }
    best_lag
}

#[derive(Default)]
struct RateAccumulator {
    sum: f64,
    count: usize,
    t_first: f64,
}

impl RateAccumulator {
    fn add(&mut self, rate: f64, t_first: f64) {
        if self.count == 0 || t_first < self.t_first {
            self.t_first = t_first;
        }
        self.sum += rate;
        self.count += 1;
    }
}

/// Seed drift curves by comparing the earliest and latest correlation of
/// each station pair in one band.
///
/// The whole-trace delay between the two dates divided by the elapsed days
/// is a shift rate for the pair, attributed to the station(s) needing
/// correction and averaged per station. Each seeded curve is zero at the
/// station's earliest correlation date. Stations without a usable pair are
/// not in the returned map.
pub fn seed_from_pairs(
    correlations: &[Correlation],
    stations: &[Station],
    params: &ProcessingParameters,
    band: usize,
    loader: &dyn TraceLoader,
    processor: &dyn SignalProcessor,
) -> Result<HashMap<String, DriftCurve>> {
    let mut pairs: BTreeMap<(String, String), Vec<&Correlation>> = BTreeMap::new();
    for c in correlations.iter().filter(|c| c.band == band) {
        pairs.entry((c.station1.clone(), c.station2.clone())).or_default().push(c);
    }

    let needs_correction = |code: &str| stations.iter().find(|s| s.code == code).map(|s| s.needs_correction);

    let mut rates: HashMap<String, RateAccumulator> = HashMap::new();
    for ((code1, code2), mut group) in pairs {
        if group.len() < 2 {
            continue;
        }
        group.sort_by(|a, b| a.t_days.total_cmp(&b.t_days));
        let (early, late) = (group[0], group[group.len() - 1]);
        let elapsed = late.t_days - early.t_days;
        if elapsed <= 0.0 {
            continue;
        }

        let early_trace = loader.load(&early.path)?;
        let late_trace = loader.load(&late.path)?;
        let early_data = processor.condition(&early_trace, params.freqmin, params.freqmax);
        let late_data = processor.condition(&late_trace, params.freqmin, params.freqmax);

        let lag = lag_of_max_correlation(&early_data, &late_data, SEED_MAX_LAG);
        let rate = lag as f64 * early_trace.delta / elapsed;
        debug!(station1 = %code1, station2 = %code2, lag, rate, "Pair shift rate");

        // shift = dt1 - dt2
        match (needs_correction(&code1), needs_correction(&code2)) {
            (Some(true), Some(true)) => {
                rates.entry(code1).or_default().add(rate / 2.0, early.t_days);
                rates.entry(code2).or_default().add(-rate / 2.0, early.t_days);
            }
            (Some(true), _) => rates.entry(code1).or_default().add(rate, early.t_days),
            (_, Some(true)) => rates.entry(code2).or_default().add(-rate, early.t_days),
            _ => {}
        }
    }

    let seeds: HashMap<String, DriftCurve> = rates
        .into_iter()
        .map(|(code, acc)| {
            let rate = acc.sum / acc.count as f64;
            (code, DriftCurve::new(rate, -rate * acc.t_first))
        })
        .collect();
    info!(stations = seeds.len(), "Seeded a priori drift from station pairs");
    Ok(seeds)
}
