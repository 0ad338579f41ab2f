// Trace loading - correlation time series from disk or memory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{DriftError, Result};

/// A symmetric noise cross-correlation trace with zero lag at the middle
/// sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Sample interval (s)
    pub delta: f64,
    pub data: Vec<f64>,
}

impl Trace {
    pub fn new(delta: f64, data: Vec<f64>) -> Self {
        Trace { delta, data }
    }

    pub fn npts(&self) -> usize {
        self.data.len()
    }

    pub fn sampling_rate(&self) -> f64 {
        1.0 / self.delta
    }

    /// Index of the zero-lag sample
    pub fn zero_lag_index(&self) -> usize {
        self.data.len() / 2
    }

    /// Lag time (s) of sample `i`
    pub fn lag_of(&self, i: f64) -> f64 {
        (i - self.zero_lag_index() as f64) * self.delta
    }
}

/// Source of correlation traces
pub trait TraceLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Trace>;
}

/// Reads traces stored as `{"delta": .., "data": [..]}` JSON documents
#[derive(Debug, Default, Clone)]
pub struct JsonTraceLoader;

impl TraceLoader for JsonTraceLoader {
    fn load(&self, path: &Path) -> Result<Trace> {
        if !path.is_file() {
            return Err(DriftError::FileNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let trace: Trace = serde_json::from_str(&text).map_err(|e| DriftError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !(trace.delta.is_finite() && trace.delta > 0.0) || trace.data.is_empty() {
            return Err(DriftError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: "trace needs a positive delta and at least one sample".to_string(),
            });
        }
        Ok(trace)
    }
}

/// In-memory trace store keyed by path
#[derive(Debug, Default)]
pub struct MemoryTraceLoader {
    traces: RwLock<HashMap<PathBuf, Trace>>,
}

impl MemoryTraceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, trace: Trace) {
        if let Ok(mut traces) = self.traces.write() {
            traces.insert(path.into(), trace);
        }
    }
}

impl TraceLoader for MemoryTraceLoader {
    fn load(&self, path: &Path) -> Result<Trace> {
        let traces = self
            .traces
            .read()
            .map_err(|_| DriftError::Io("trace store lock poisoned".to_string()))?;
        traces
            .get(path)
            .cloned()
            .ok_or_else(|| DriftError::FileNotFound(path.to_path_buf()))
    }
}

/// Synthetic correlation traces for tests
#[cfg(test)]
pub(crate) mod synthetic {
    use std::f64::consts::PI;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::Trace;

    pub const RICKER_FREQ: f64 = 0.22;

    pub fn ricker(t: f64, freq: f64) -> f64 {
        let a = (PI * freq * t).powi(2);
        (1.0 - 2.0 * a) * (-a).exp()
    }

    /// Arrivals at lags `travel + shift` (causal) and `-travel + shift`
    /// (acausal) over seeded uniform noise of amplitude `noise`.
    pub fn correlation_trace(npts: usize, dt: f64, travel: f64, shift: f64, noise: f64, seed: u64) -> Trace {
        let nt = (npts / 2) as f64;
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..npts)
            .map(|i| {
                let lag = (i as f64 - nt) * dt;
                ricker(lag - travel - shift, RICKER_FREQ)
                    + 0.8 * ricker(lag + travel - shift, RICKER_FREQ)
                    + noise * rng.gen_range(-1.0..1.0)
            })
            .collect();
        Trace::new(dt, data)
    }
}
