// Network drift inversion
//
// Each usable apparent shift gives one equation
//   t_app = 2 * (a1 * t + b1) - 2 * (a2 * t + b2)
// in the drift rate a and offset b of the two stations. Reference stations
// are fixed at zero and have no columns. Stations whose connected component
// holds no reference are unresolved: they get no columns and no drift.
// The weighted system is solved by SVD least squares.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::apriori::DriftCurve;
use crate::constants::SVD_RCOND;
use crate::error::{DriftError, Result};
use crate::graph::StationGraph;
use crate::station::Station;

/// One row of the drift system
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InversionObservation {
    pub station1: String,
    pub station2: String,
    /// Days since the reference time
    pub t_days: f64,
    /// Observed apparent shift (s)
    pub t_app: f64,
    pub weight: f64,
}

/// How observations are weighted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Weighting {
    /// Every observation counts the same
    #[default]
    Uniform,
    /// Weight by the smaller of the causal and acausal SNR
    Snr,
}

/// Shift predicted for a pair by two drift curves
pub fn predicted_shift(drift1: &DriftCurve, drift2: &DriftCurve, t_days: f64) -> f64 {
    2.0 * (drift1.at(t_days) - drift2.at(t_days))
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftInversionResult {
    /// Resolved stations, references included at zero drift
    pub drifts: BTreeMap<String, DriftCurve>,
    /// Stations needing correction with no path to a reference station
    pub unresolved: Vec<String>,
    /// Observed minus predicted shift per observation, in input order. NaN
    /// for observations that did not enter the system.
    pub residuals: Vec<f64>,
    pub n_equations: usize,
    pub n_unknowns: usize,
    pub rank: usize,
    /// Root mean square of the finite residuals (s)
    pub rms: f64,
}

impl DriftInversionResult {
    pub fn drift(&self, code: &str) -> Result<&DriftCurve> {
        self.drifts
            .get(code)
            .ok_or_else(|| DriftError::UnresolvedStation(code.to_string()))
    }

    pub fn is_rank_deficient(&self) -> bool {
        self.rank < self.n_unknowns
    }
}

/// Solve for the drift of every station needing correction.
///
/// # Arguments
/// * `stations` - Stations taking part in the inversion
/// * `observations` - Apparent shifts; non-finite shifts and non-positive
///   weights are ignored
///
/// # Returns
/// Drift curves of the resolved stations, the unresolved stations and the
/// residuals
///
/// # Errors
/// `UnknownStation` if an observation names a station not in `stations`,
/// `Inversion` if the solver fails.
pub fn invert(stations: &[Station], observations: &[InversionObservation]) -> Result<DriftInversionResult> {
    let mut graph = StationGraph::new(stations.iter().map(|s| s.code.clone()).collect());
    for obs in observations {
        for code in [&obs.station1, &obs.station2] {
            if graph.index_of(code).is_none() {
                return Err(DriftError::UnknownStation(code.clone()));
            }
        }
        if obs.t_app.is_finite() && obs.weight > 0.0 {
            graph.add_edge(&obs.station1, &obs.station2);
        }
    }

    let anchored = graph.anchored(|code| stations.iter().any(|s| s.code == code && s.is_reference()));

    // Column block of each resolvable station needing correction
    let mut columns: BTreeMap<&str, usize> = BTreeMap::new();
    let mut unresolved = Vec::new();
    for (station, &ok) in stations.iter().zip(anchored.iter()) {
        if station.is_reference() {
            continue;
        }
        if ok {
            let next = 2 * columns.len();
            columns.insert(&station.code, next);
        } else {
            warn!(station = %station.code, "Station not connected to a reference station");
            unresolved.push(station.code.clone());
        }
    }
    let is_resolved = |code: &str| {
        columns.contains_key(code) || stations.iter().any(|s| s.code == code && s.is_reference())
    };

    let rows: Vec<usize> = observations
        .iter()
        .enumerate()
        .filter(|(_, o)| o.t_app.is_finite() && o.weight > 0.0)
        .filter(|(_, o)| is_resolved(&o.station1) && is_resolved(&o.station2))
        .map(|(i, _)| i)
        .collect();

    let n = 2 * columns.len();
    let m = rows.len();
    let mut a = DMatrix::<f64>::zeros(m, n);
    let mut b = DVector::<f64>::zeros(m);
    for (r, &i) in rows.iter().enumerate() {
        let obs = &observations[i];
        let w = obs.weight.sqrt();
        if let Some(&c) = columns.get(obs.station1.as_str()) {
            a[(r, c)] += 2.0 * obs.t_days * w;
            a[(r, c + 1)] += 2.0 * w;
        }
        if let Some(&c) = columns.get(obs.station2.as_str()) {
            a[(r, c)] -= 2.0 * obs.t_days * w;
            a[(r, c + 1)] -= 2.0 * w;
        }
        b[r] = obs.t_app * w;
    }

    let (x, rank) = if n == 0 || m == 0 {
        (DVector::<f64>::zeros(n), 0)
    } else {
        let svd = a.svd(true, true);
        let eps = SVD_RCOND * svd.singular_values.max();
        let rank = svd.singular_values.iter().filter(|&&s| s > eps).count();
        let x = svd.solve(&b, eps).map_err(|e| DriftError::Inversion(e.to_string()))?;
        (x, rank)
    };
    if rank < n {
        warn!(rank, unknowns = n, "Drift system is rank deficient");
    }

    let mut drifts = BTreeMap::new();
    for station in stations {
        if station.is_reference() {
            drifts.insert(station.code.clone(), DriftCurve::default());
        } else if let Some(&c) = columns.get(station.code.as_str()) {
            drifts.insert(station.code.clone(), DriftCurve::new(x[c], x[c + 1]));
        }
    }

    let mut residuals = vec![f64::NAN; observations.len()];
    for &i in &rows {
        let obs = &observations[i];
        if let (Some(d1), Some(d2)) = (drifts.get(&obs.station1), drifts.get(&obs.station2)) {
            residuals[i] = obs.t_app - predicted_shift(d1, d2, obs.t_days);
        }
    }
    let finite: Vec<f64> = residuals.iter().copied().filter(|r| r.is_finite()).collect();
    let rms = if finite.is_empty() {
        0.0
    } else {
        (finite.iter().map(|r| r * r).sum::<f64>() / finite.len() as f64).sqrt()
    };

    debug!(equations = m, unknowns = n, rank, rms, "Inversion solved");

    Ok(DriftInversionResult {
        drifts,
        unresolved,
        residuals,
        n_equations: m,
        n_unknowns: n,
        rank,
        rms,
    })
}
