//! Anomaly Detection
//!
//! Scores how unusual a run's tracked metric is compared with earlier runs
//! of the same workflow, using a z-score over a bounded history:
//! `score = min(1, |z| / 3)`. Below the minimum sample count the detector
//! abstains and the anomaly dimension contributes 0.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use log::debug;
use serde::{Deserialize, Serialize};

/// Samples kept per workflow.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// One anomaly measurement.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AnomalyScore {
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
    pub score: f64,
    pub samples: usize,
}

/// Per-workflow metric history.
#[derive(Debug)]
pub struct AnomalyDetector {
    min_samples: usize,
    history_limit: usize,
    history: RwLock<HashMap<String, VecDeque<f64>>>,
}

impl AnomalyDetector {
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples,
            history_limit: DEFAULT_HISTORY_LIMIT,
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Caps the number of samples kept per workflow.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Minimum samples before scores are produced.
    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Number of samples recorded for a workflow.
    pub fn samples(&self, workflow_id: &str) -> usize {
        self.history
            .read()
            .map(|h| h.get(workflow_id).map(|s| s.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Scores a value against the workflow's history.
    ///
    /// Returns `None` while fewer than `min_samples` values are recorded.
    pub fn score(&self, workflow_id: &str, value: f64) -> Option<AnomalyScore> {
        let history = self.history.read().ok()?;
        let samples = history.get(workflow_id)?;
        let n = samples.len();
        if n < self.min_samples || n == 0 {
            debug!(
                "Anomaly detection for '{}' abstains: {} of {} samples",
                workflow_id, n, self.min_samples
            );
            return None;
        }

        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        let std_dev = variance.sqrt();

        let z_score = if std_dev > f64::EPSILON {
            (value - mean) / std_dev
        } else if (value - mean).abs() <= f64::EPSILON {
            0.0
        } else {
            // Flat history: any deviation counts as maximally unusual.
            3.0_f64.copysign(value - mean)
        };

        Some(AnomalyScore {
            value,
            mean,
            std_dev,
            z_score,
            score: (z_score.abs() / 3.0).min(1.0),
            samples: n,
        })
    }

    /// Records a value, evicting the oldest beyond the history limit.
    pub fn record(&self, workflow_id: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        if let Ok(mut history) = self.history.write() {
            let samples = history.entry(workflow_id.to_string()).or_default();
            samples.push_back(value);
            while samples.len() > self.history_limit {
                samples.pop_front();
            }
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(10)
    }
}
