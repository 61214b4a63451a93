//! Anomaly detection domain types.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Classification applied to a detection once its score crosses a method's
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyType {
    Frequency,
    Timing,
    Pattern,
    Sequence,
    StatisticalOutlier,
}

/// Outcome of a previously emitted detection, reported back for online
/// learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackOutcome {
    TruePositive,
    FalsePositive,
    TrueNegative,
    FalseNegative,
}

/// Feedback on one past detection, used to recalibrate [`crate::AnomalyDetector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFeedback {
    pub prediction_id: String,
    pub actual_outcome: FeedbackOutcome,
    pub confidence: f64,
    pub timestamp_unix: i64,
}

/// Per-feature running statistics used by the statistical detection method.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Running counters describing detector health.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub total_predictions: u64,
    pub anomalies_detected: u64,
    pub false_positives: u64,
    pub true_positives: u64,
    pub model_accuracy: f64,
}

/// Outcome of scoring a single behavior vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub session_id: String,
    pub overall_score: f64,
    pub anomaly_types: Vec<AnomalyType>,
    pub feature_contributions: HashMap<String, f64>,
    pub detection_timestamp_unix: i64,
    pub model_version: String,
    pub model_confidence: f64,
    pub detection_method: String,
    pub explanation: String,
    pub recommended_actions: Vec<String>,
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}
