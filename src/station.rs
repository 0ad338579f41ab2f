// Station metadata - identities, coordinates, deployment windows
//
// The station table is whitespace separated with one header line:
//   project  code  needs_correction  latitude  longitude  elevation  sensor_type  [start  end]
// `needs_correction` is True/False, elevation `-` means 0, and the optional
// deployment window columns are RFC 3339 instants (`-` for open ends).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{DriftError, Result};
use crate::geodesy;

/// A seismic station
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Station {
    pub code: String,
    /// Position in the station list; column block in the inversion
    pub index: usize,
    /// OBS with a free-running clock. Stations that don't need correction
    /// are time references: their drift is fixed at zero.
    pub needs_correction: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub sensor_type: String,
    pub project: String,
    pub deployed_from: Option<DateTime<Utc>>,
    pub deployed_until: Option<DateTime<Utc>>,
}

impl Station {
    pub fn new(code: &str, index: usize, needs_correction: bool, latitude: f64, longitude: f64) -> Self {
        Station {
            code: code.to_string(),
            index,
            needs_correction,
            latitude,
            longitude,
            elevation: 0.0,
            sensor_type: String::new(),
            project: String::new(),
            deployed_from: None,
            deployed_until: None,
        }
    }

    pub fn is_reference(&self) -> bool {
        !self.needs_correction
    }

    /// Whether the station was recording at `t`
    pub fn deployed_at(&self, t: DateTime<Utc>) -> bool {
        self.deployed_from.map_or(true, |from| t >= from) && self.deployed_until.map_or(true, |until| t <= until)
    }
}

/// Unordered pair of stations with their geodesic separation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationPair {
    pub station1: String,
    pub station2: String,
    /// Geodesic distance in meters
    pub separation: f64,
}

impl StationPair {
    pub fn new(s1: &Station, s2: &Station) -> Result<Self> {
        let separation = geodesy::distance(s1.latitude, s1.longitude, s2.latitude, s2.longitude)?;
        Ok(StationPair {
            station1: s1.code.clone(),
            station2: s2.code.clone(),
            separation,
        })
    }

    /// Order-independent key
    pub fn key(&self) -> (&str, &str) {
        if self.station1 <= self.station2 {
            (&self.station1, &self.station2)
        } else {
            (&self.station2, &self.station1)
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.station1 == code || self.station2 == code
    }

    /// Same pair regardless of order
    pub fn same_as(&self, a: &str, b: &str) -> bool {
        (self.station1 == a && self.station2 == b) || (self.station1 == b && self.station2 == a)
    }
}

fn parse_bool(value: &str, line: usize) -> Result<bool> {
    match value {
        "True" | "true" => Ok(true),
        "False" | "false" => Ok(false),
        other => Err(DriftError::InvalidStationFile {
            line,
            reason: format!("needs_correction should be True or False, got {}", other),
        }),
    }
}

fn parse_f64(value: &str, name: &str, line: usize) -> Result<f64> {
    value.parse::<f64>().map_err(|_| DriftError::InvalidStationFile {
        line,
        reason: format!("invalid {}: {}", name, value),
    })
}

fn parse_instant(value: Option<&str>, name: &str, line: usize) -> Result<Option<DateTime<Utc>>> {
    match value {
        None | Some("-") => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| DriftError::InvalidStationFile {
                line,
                reason: format!("invalid {}: {}", name, text),
            }),
    }
}

/// Parse a station table. Line numbers in errors are 1-based.
pub fn parse_station_table(text: &str) -> Result<Vec<Station>> {
    let mut stations: Vec<Station> = Vec::new();

    for (i, row) in text.lines().enumerate().skip(1) {
        let line = i + 1;
        let columns: Vec<&str> = row.split_whitespace().collect();
        if columns.is_empty() {
            continue;
        }
        if columns.len() < 7 {
            return Err(DriftError::InvalidStationFile {
                line,
                reason: format!("expected at least 7 columns, got {}", columns.len()),
            });
        }

        let code = columns[1];
        if stations.iter().any(|s| s.code == code) {
            return Err(DriftError::InvalidStationFile {
                line,
                reason: format!("duplicate station {}", code),
            });
        }

        let latitude = parse_f64(columns[3], "latitude", line)?;
        let longitude = parse_f64(columns[4], "longitude", line)?;
        if latitude.abs() > 90.0 || longitude.abs() > 180.0 {
            return Err(DriftError::InvalidStationFile {
                line,
                reason: DriftError::InvalidCoordinate { lat: latitude, lon: longitude }.to_string(),
            });
        }
        let elevation = if columns[5] == "-" { 0.0 } else { parse_f64(columns[5], "elevation", line)? };

        stations.push(Station {
            code: code.to_string(),
            index: stations.len(),
            needs_correction: parse_bool(columns[2], line)?,
            latitude,
            longitude,
            elevation,
            sensor_type: columns[6].to_string(),
            project: columns[0].to_string(),
            deployed_from: parse_instant(columns.get(7).copied(), "deployment start", line)?,
            deployed_until: parse_instant(columns.get(8).copied(), "deployment end", line)?,
        });
    }

    Ok(stations)
}

pub fn load_station_file(path: &Path) -> Result<Vec<Station>> {
    if !path.exists() {
        return Err(DriftError::FileNotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    parse_station_table(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
project code needs_correction latitude longitude elevation sensor_type
IMAGE   O01  True   63.3  -23.2  -1500  OBS
IMAGE   O02  True   63.6  -23.0  -     OBS
IMAGE   KEF  False  63.9  -22.6  50     land  2014-08-01T00:00:00Z  -
";

    #[test]
    fn test_parse_station_table() {
        let stations = parse_station_table(TABLE).unwrap();
        assert_eq!(stations.len(), 3);
        assert_eq!(stations[0].code, "O01");
        assert_eq!(stations[0].index, 0);
        assert!(stations[0].needs_correction);
        assert_eq!(stations[0].elevation, -1500.0);
        assert_eq!(stations[1].elevation, 0.0);
        assert!(stations[2].is_reference());
        assert_eq!(stations[2].project, "IMAGE");
        assert!(stations[2].deployed_from.is_some());
        assert!(stations[2].deployed_until.is_none());
    }

    #[test]
    fn test_parse_bad_flag() {
        let text = "header\nP X maybe 1.0 2.0 0 OBS\n";
        match parse_station_table(text) {
            Err(DriftError::InvalidStationFile { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_short_row_and_bad_coordinate() {
        assert!(parse_station_table("header\nP X True 1.0\n").is_err());
        assert!(parse_station_table("header\nP X True 95.0 2.0 0 OBS\n").is_err());
        assert!(parse_station_table("header\nP X True 1.0 2.0 0 OBS\nP X True 1.0 2.0 0 OBS\n").is_err());
    }

    #[test]
    fn test_deployed_at() {
        let stations = parse_station_table(TABLE).unwrap();
        let before: DateTime<Utc> = "2014-07-01T00:00:00Z".parse().unwrap();
        let after: DateTime<Utc> = "2015-07-01T00:00:00Z".parse().unwrap();
        assert!(!stations[2].deployed_at(before));
        assert!(stations[2].deployed_at(after));
        assert!(stations[0].deployed_at(before));
    }

    #[test]
    fn test_station_pair() {
        let a = Station::new("B", 0, true, 0.0, 0.0);
        let b = Station::new("A", 1, false, 0.0, 1.0);
        let pair = StationPair::new(&a, &b).unwrap();
        assert!((pair.separation - 111_319.49).abs() < 0.01);
        assert_eq!(pair.key(), ("A", "B"));
        assert!(pair.same_as("A", "B"));
        assert!(pair.same_as("B", "A"));
        assert!(pair.contains("A"));
        assert!(!pair.contains("C"));
    }
}
