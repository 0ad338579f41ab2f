// Result writers - JSON summary and CSV observation table

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::apriori::DriftCurve;
use crate::correlation::Correlation;
use crate::drift::{ClockDrift, IterationReport};
use crate::error::{DriftError, Result};
use crate::params::ProcessingParameters;

/// Trait for output handlers
pub trait OutputHandler {
    /// Write the state of a finished run
    fn write_results(&mut self, drift: &ClockDrift) -> Result<()>;
}

#[derive(Debug, Serialize)]
pub struct StationSummary {
    pub needs_correction: bool,
    /// Curve from the last inversion; absent if the station was unresolved
    /// or excluded there
    pub drift: Option<DriftCurve>,
    pub excluded: bool,
    /// Curve after each iteration, starting with the seed
    pub history: Vec<DriftCurve>,
    pub usable_correlations: usize,
}

/// Everything written to the JSON results file
#[derive(Debug, Serialize)]
pub struct DriftSummary<'a> {
    pub reference_time: DateTime<Utc>,
    pub bands: &'a [ProcessingParameters],
    pub stations: BTreeMap<&'a str, StationSummary>,
    pub unresolved: Vec<String>,
    pub excluded_stations: &'a [String],
    pub iterations: &'a [IterationReport],
    pub correlations: &'a [Correlation],
}

impl<'a> DriftSummary<'a> {
    pub fn from_run(drift: &'a ClockDrift) -> Self {
        let unresolved = drift
            .last_result
            .as_ref()
            .map(|r| r.unresolved.clone())
            .unwrap_or_default();

        let stations = drift
            .stations
            .iter()
            .map(|s| {
                let summary = StationSummary {
                    needs_correction: s.needs_correction,
                    drift: drift.last_result.as_ref().and_then(|r| r.drifts.get(&s.code)).copied(),
                    excluded: drift.excluded_stations.contains(&s.code),
                    history: drift.apriori.history(&s.code).to_vec(),
                    usable_correlations: drift.usable_count(&s.code),
                };
                (s.code.as_str(), summary)
            })
            .collect();

        DriftSummary {
            reference_time: drift.reference_time,
            bands: &drift.bands,
            stations,
            unresolved,
            excluded_stations: &drift.excluded_stations,
            iterations: &drift.reports,
            correlations: &drift.correlations,
        }
    }
}

/// JSON results file
pub struct JsonOutput {
    path: PathBuf,
}

impl JsonOutput {
    pub fn new(path: &Path) -> Self {
        JsonOutput { path: path.to_path_buf() }
    }

    pub fn format_json(drift: &ClockDrift) -> Result<String> {
        serde_json::to_string_pretty(&DriftSummary::from_run(drift)).map_err(|e| DriftError::Io(e.to_string()))
    }
}

impl OutputHandler for JsonOutput {
    fn write_results(&mut self, drift: &ClockDrift) -> Result<()> {
        let json = Self::format_json(drift)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// CSV format output, one row per correlation
pub struct CsvOutput {
    writer: BufWriter<File>,
}

pub const CSV_HEADER: &str = "station1,station2,band,average_date,t_days,number_days,separation_m,t_app,predicted,residual,exclusion";

fn csv_number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.6}", v),
        _ => String::new(),
    }
}

impl CsvOutput {
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(CsvOutput {
            writer: BufWriter::new(file),
        })
    }

    pub fn format_row(correlation: &Correlation) -> String {
        let diagnostics = correlation.latest_diagnostics();
        let exclusion = match (&correlation.exclusion, diagnostics.map_or(false, |d| d.outlier)) {
            (Some(e), _) => e.to_string().replace(',', ";"),
            (None, true) => "outlier".to_string(),
            (None, false) => String::new(),
        };
        format!(
            "{},{},{},{},{:.4},{},{:.1},{},{},{},{}",
            correlation.station1,
            correlation.station2,
            correlation.band,
            correlation.average_date.to_rfc3339(),
            correlation.t_days,
            correlation.number_days,
            correlation.separation,
            csv_number(correlation.latest_t_app()),
            csv_number(diagnostics.and_then(|d| d.predicted)),
            csv_number(diagnostics.and_then(|d| d.residual)),
            exclusion
        )
    }
}

impl OutputHandler for CsvOutput {
    fn write_results(&mut self, drift: &ClockDrift) -> Result<()> {
        writeln!(self.writer, "{}", CSV_HEADER)?;
        for correlation in &drift.correlations {
            writeln!(self.writer, "{}", Self::format_row(correlation))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{Exclusion, ShiftDiagnostics};
    use crate::station::{Station, StationPair};
    use crate::trace::MemoryTraceLoader;
    use chrono::Duration;

    fn small_run() -> ClockDrift {
        let reference: DateTime<Utc> = "2015-01-01T00:00:00Z".parse().unwrap();
        let stations = vec![
            Station::new("A", 0, false, 0.0, 0.0),
            Station::new("B", 1, true, 0.0, 0.45),
            Station::new("C", 2, true, 3.0, 3.0),
        ];
        let pair = StationPair::new(&stations[0], &stations[1]).unwrap();
        let mut correlations = Vec::new();
        for (days, t_app) in [(0i64, -0.2), (10, -0.4), (20, f64::NAN)] {
            let date = reference + Duration::days(days);
            let mut c = Correlation::new(&pair, date, 10.0, PathBuf::from(days.to_string()), 0, reference);
            let exclusion = t_app.is_nan().then(|| Exclusion::InsufficientSnr { causal: 3.0, acausal: 4.0 });
            c.record(t_app, ShiftDiagnostics { exclusion, ..Default::default() });
            correlations.push(c);
        }
        let mut drift = ClockDrift::new(
            stations,
            vec![ProcessingParameters::default()],
            correlations,
            reference,
            Box::new(MemoryTraceLoader::new()),
        )
        .unwrap();
        let result = drift.invert().unwrap();
        drift.update_apriori(&result);
        drift
    }

    #[test]
    fn test_csv_rows() {
        let drift = small_run();
        let row = CsvOutput::format_row(&drift.correlations[1]);
        assert!(row.starts_with("A,B,0,2015-01-11T00:00:00+00:00,10.0000,10,"));
        assert!(row.contains(",-0.400000,-0.400000,"), "{}", row);

        let excluded = CsvOutput::format_row(&drift.correlations[2]);
        assert!(excluded.ends_with(",,,insufficient SNR (causal 3.0; acausal 4.0)"), "{}", excluded);
        assert_eq!(excluded.split(',').count(), CSV_HEADER.split(',').count());
    }

    #[test]
    fn test_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observations.csv");
        let drift = small_run();
        CsvOutput::new(&path).unwrap().write_results(&drift).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], CSV_HEADER);
    }

    #[test]
    fn test_json_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift.json");
        let drift = small_run();
        JsonOutput::new(&path).write_results(&drift).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let b = &value["stations"]["B"];
        assert!((b["drift"]["rate"].as_f64().unwrap() - 0.01).abs() < 1e-9);
        assert_eq!(b["history"].as_array().unwrap().len(), 2);
        // C never resolved: no drift, listed as unresolved
        assert!(value["stations"]["C"]["drift"].is_null());
        assert_eq!(value["unresolved"][0], "C");
        assert_eq!(value["correlations"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_seeded_unresolved_station_has_no_drift() {
        let mut drift = small_run();
        drift.apriori.update("C", DriftCurve::new(0.02, -0.3));
        let result = drift.invert().unwrap();
        drift.update_apriori(&result);

        let value: serde_json::Value = serde_json::from_str(&JsonOutput::format_json(&drift).unwrap()).unwrap();
        let c = &value["stations"]["C"];
        assert!(c["drift"].is_null());
        assert_eq!(c["history"].as_array().unwrap().len(), 2);
        assert_eq!(value["unresolved"][0], "C");
        assert!(value["stations"]["A"]["drift"]["rate"].as_f64().unwrap().abs() < 1e-12);
        assert_eq!(value["stations"]["B"]["excluded"], false);
    }

    #[test]
    fn test_no_drift_before_any_inversion() {
        let reference: DateTime<Utc> = "2015-01-01T00:00:00Z".parse().unwrap();
        let stations = vec![Station::new("A", 0, false, 0.0, 0.0), Station::new("B", 1, true, 0.0, 0.45)];
        let drift = ClockDrift::new(
            stations,
            vec![ProcessingParameters::default()],
            Vec::new(),
            reference,
            Box::new(MemoryTraceLoader::new()),
        )
        .unwrap();
        let summary = DriftSummary::from_run(&drift);
        assert!(summary.stations["B"].drift.is_none());
        assert_eq!(summary.stations["B"].history.len(), 1);
    }
}
