//! Ensemble anomaly detection over behavioral feature vectors.
//!
//! [`AnomalyDetector`] combines three independent methods — an isolation
//! forest, per-feature statistical z-scores, and a small set of hand-written
//! rules — into a single [`AnomalyResult`]. The isolation forest degrades
//! gracefully: until enough training samples accumulate it contributes a
//! score of zero and the ensemble falls back to the statistical and
//! rule-based methods alone, logging the downgrade once.
//!
//! ```
//! use protection_anomaly::AnomalyDetector;
//! use protection_behavioral::{BehaviorVector, FEATURE_NAMES};
//! use std::collections::HashMap;
//!
//! # async fn example() {
//! let detector = AnomalyDetector::new();
//! let mut features = HashMap::new();
//! for name in FEATURE_NAMES {
//!     features.insert(name.to_string(), 0.0);
//! }
//! let vector = BehaviorVector {
//!     features,
//!     feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
//!     extraction_timestamp_unix: 0,
//!     window_size: 10,
//!     confidence: 0.5,
//! };
//! let result = detector.detect(&vector).await;
//! println!("{:.2}", result.overall_score);
//! # }
//! ```

mod forest;
mod model;

pub use model::{
    AnomalyResult, AnomalyType, FeatureStats, FeedbackOutcome, ModelFeedback, ModelMetrics,
};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use protection_behavioral::BehaviorVector;
use rand::rngs::StdRng;
use rand::SeedableRng;

use forest::IsolationForest;
use model::now_unix;

/// Score above which a method's contribution counts as an anomaly signal.
const ANOMALY_THRESHOLD: f64 = 0.1;
/// Minimum samples required before the isolation forest (re)trains.
const MIN_TRAINING_SAMPLES: usize = 100;
/// How long a trained forest is trusted before a retrain is attempted.
const RETRAIN_INTERVAL_SECS: i64 = 24 * 3600;
const TRAINING_BUFFER_CAP: usize = 10_000;
const FEEDBACK_BUFFER_CAP: usize = 1_000;

struct TrainingSample {
    features: Vec<f64>,
}

struct State {
    training_buffer: VecDeque<TrainingSample>,
    feedback_buffer: VecDeque<ModelFeedback>,
    feature_stats: HashMap<String, FeatureStats>,
    forest: Option<IsolationForest>,
    metrics: ModelMetrics,
    last_training_unix: Option<i64>,
    rng: StdRng,
}

/// Multi-method anomaly detector with online learning over a bounded
/// training buffer.
pub struct AnomalyDetector {
    state: Mutex<State>,
    degraded_logged: AtomicBool,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                training_buffer: VecDeque::new(),
                feedback_buffer: VecDeque::new(),
                feature_stats: HashMap::new(),
                forest: None,
                metrics: ModelMetrics::default(),
                last_training_unix: None,
                rng: StdRng::from_os_rng(),
            }),
            degraded_logged: AtomicBool::new(false),
        }
    }

    /// Scores `vector` with the full ensemble and records it for online
    /// learning.
    pub async fn detect(&self, vector: &BehaviorVector) -> AnomalyResult {
        let feature_array = vectorize(&vector.features);
        let mut state = self.state.lock().expect("anomaly detector mutex poisoned");

        let isolation_score = match &state.forest {
            Some(forest) => forest.score(&feature_array),
            None => {
                if !self.degraded_logged.swap(true, Ordering::Relaxed) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("anomaly detector running without a trained isolation forest; using statistical and rule-based methods only");
                }
                0.0
            }
        };
        let statistical_score = statistical_detection(&vector.features, &state.feature_stats);
        let pattern_score = pattern_detection(&vector.features);
        let overall_score = (isolation_score + statistical_score + pattern_score) / 3.0;

        let mut anomaly_types = Vec::new();
        if isolation_score > ANOMALY_THRESHOLD {
            anomaly_types.push(AnomalyType::StatisticalOutlier);
        }
        if statistical_score > ANOMALY_THRESHOLD {
            anomaly_types.push(AnomalyType::Frequency);
        }
        if pattern_score > ANOMALY_THRESHOLD {
            anomaly_types.push(AnomalyType::Pattern);
        }

        let feature_contributions = feature_contributions(&vector.features, &state.feature_stats);
        let explanation = explain(overall_score);
        let recommended_actions = recommended_actions(overall_score, &anomaly_types);

        state.metrics.total_predictions += 1;
        if overall_score > ANOMALY_THRESHOLD {
            state.metrics.anomalies_detected += 1;
        }

        state.training_buffer.push_back(TrainingSample { features: feature_array });
        if state.training_buffer.len() > TRAINING_BUFFER_CAP {
            state.training_buffer.pop_front();
        }

        AnomalyResult {
            session_id: vector.extraction_timestamp_unix.to_string(),
            overall_score,
            anomaly_types,
            feature_contributions,
            detection_timestamp_unix: now_unix(),
            model_version: "1.0".to_string(),
            model_confidence: vector.confidence,
            detection_method: "ensemble".to_string(),
            explanation,
            recommended_actions,
        }
    }

    /// Retrains the isolation forest and feature statistics from the
    /// current training buffer, if there's enough data.
    pub async fn train(&self) {
        let mut state = self.state.lock().expect("anomaly detector mutex poisoned");
        if state.training_buffer.len() < MIN_TRAINING_SAMPLES {
            return;
        }
        let samples: Vec<Vec<f64>> = state.training_buffer.iter().map(|s| s.features.clone()).collect();
        state.forest = IsolationForest::train(&samples, &mut state.rng);
        state.feature_stats = compute_feature_stats(&samples);
        state.last_training_unix = Some(now_unix());
    }

    /// Returns `true` when enough time, data, or accuracy drift has
    /// accumulated to justify a retrain.
    pub async fn should_retrain(&self) -> bool {
        let state = self.state.lock().expect("anomaly detector mutex poisoned");
        match state.last_training_unix {
            Some(last) if now_unix() - last < RETRAIN_INTERVAL_SECS => {
                state.metrics.model_accuracy < 0.7 || state.training_buffer.len() >= TRAINING_BUFFER_CAP
            }
            _ => state.training_buffer.len() >= MIN_TRAINING_SAMPLES,
        }
    }

    /// Records feedback on a past detection and retrains if
    /// [`Self::should_retrain`] now holds.
    pub async fn update_online(&self, feedback: ModelFeedback) {
        {
            let mut state = self.state.lock().expect("anomaly detector mutex poisoned");
            match feedback.actual_outcome {
                FeedbackOutcome::TruePositive => state.metrics.true_positives += 1,
                FeedbackOutcome::FalsePositive => state.metrics.false_positives += 1,
                _ => {}
            }
            state.feedback_buffer.push_back(feedback);
            if state.feedback_buffer.len() > FEEDBACK_BUFFER_CAP {
                state.feedback_buffer.pop_front();
            }
            let total = state.feedback_buffer.len() as f64;
            if total > 0.0 {
                let correct = state
                    .feedback_buffer
                    .iter()
                    .filter(|f| matches!(f.actual_outcome, FeedbackOutcome::TruePositive | FeedbackOutcome::TrueNegative))
                    .count() as f64;
                state.metrics.model_accuracy = correct / total;
            }
        }
        if self.should_retrain().await {
            self.train().await;
        }
    }

    /// Current detector health counters.
    pub async fn metrics(&self) -> ModelMetrics {
        self.state.lock().expect("anomaly detector mutex poisoned").metrics
    }

    /// Whether the isolation forest has been trained yet.
    pub async fn is_trained(&self) -> bool {
        self.state.lock().expect("anomaly detector mutex poisoned").forest.is_some()
    }
}

fn vectorize(features: &HashMap<String, f64>) -> Vec<f64> {
    protection_behavioral::FEATURE_NAMES
        .iter()
        .map(|name| features.get(*name).copied().unwrap_or(0.0))
        .collect()
}

fn compute_feature_stats(samples: &[Vec<f64>]) -> HashMap<String, FeatureStats> {
    let mut stats = HashMap::new();
    for (i, name) in protection_behavioral::FEATURE_NAMES.iter().enumerate() {
        let values: Vec<f64> = samples.iter().map(|s| s[i]).collect();
        if values.is_empty() {
            continue;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        stats.insert((*name).to_string(), FeatureStats { mean, std: variance.sqrt(), min, max });
    }
    stats
}

fn statistical_detection(features: &HashMap<String, f64>, stats: &HashMap<String, FeatureStats>) -> f64 {
    if stats.is_empty() {
        return 0.0;
    }
    let scores: Vec<f64> = features
        .iter()
        .filter_map(|(name, value)| {
            let s = stats.get(name)?;
            if s.std <= 0.0 {
                return None;
            }
            Some(((value - s.mean).abs() / s.std / 3.0).min(1.0))
        })
        .collect();
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

fn pattern_detection(features: &HashMap<String, f64>) -> f64 {
    let mut score: f64 = 0.0;
    if features.get("response_time").copied().unwrap_or(0.0) < 50.0 {
        score += 0.2;
    }
    if features.get("request_frequency").copied().unwrap_or(0.0) > 10.0 {
        score += 0.3;
    }
    if features.get("error_rate").copied().unwrap_or(0.0) > 0.2 {
        score += 0.4;
    }
    if features.get("interval_stddev").copied().unwrap_or(1.0) < 0.1 {
        score += 0.3;
    }
    score.min(1.0)
}

fn feature_contributions(
    features: &HashMap<String, f64>,
    stats: &HashMap<String, FeatureStats>,
) -> HashMap<String, f64> {
    features
        .iter()
        .map(|(name, value)| {
            let contribution = match stats.get(name) {
                Some(s) if s.std > 0.0 => ((value - s.mean).abs() / s.std / 3.0).min(1.0),
                _ => 0.0,
            };
            (name.clone(), contribution)
        })
        .collect()
}

fn explain(overall_score: f64) -> String {
    if overall_score > 0.7 {
        "high anomaly score indicates significant deviation from normal behavior".to_string()
    } else if overall_score > 0.5 {
        "moderate anomaly detected with some unusual patterns".to_string()
    } else if overall_score > 0.3 {
        "slight behavioral anomaly detected".to_string()
    } else {
        "behavior appears normal".to_string()
    }
}

fn recommended_actions(overall_score: f64, anomaly_types: &[AnomalyType]) -> Vec<String> {
    let mut actions = Vec::new();
    if overall_score > 0.8 {
        actions.push("increase monitoring intensity".to_string());
        actions.push("apply stricter rate limits".to_string());
        actions.push("require additional authentication".to_string());
    } else if overall_score > 0.6 {
        actions.push("enhanced logging and monitoring".to_string());
        actions.push("moderate rate limit reduction".to_string());
    } else if overall_score > 0.4 {
        actions.push("monitor for continued anomalous behavior".to_string());
    }
    if anomaly_types.contains(&AnomalyType::Frequency) {
        actions.push("implement request frequency limits".to_string());
    }
    if anomaly_types.contains(&AnomalyType::Pattern) {
        actions.push("analyze request patterns for automation".to_string());
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use protection_behavioral::FEATURE_NAMES;

    fn vector(values: [f64; 7]) -> BehaviorVector {
        let mut features = HashMap::new();
        for (name, value) in FEATURE_NAMES.iter().zip(values.iter()) {
            features.insert((*name).to_string(), *value);
        }
        BehaviorVector {
            features,
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            extraction_timestamp_unix: 1_000,
            window_size: 10,
            confidence: 0.8,
        }
    }

    #[tokio::test]
    async fn untrained_detector_uses_statistical_and_rule_based_only() {
        let detector = AnomalyDetector::new();
        let result = detector.detect(&vector([100.0, 512.0, 5.0, 1.0, 2.0, 0.0, 3.0])).await;
        assert!(!detector.is_trained().await);
        assert!(result.overall_score < ANOMALY_THRESHOLD);
    }

    #[tokio::test]
    async fn bot_like_pattern_scores_high_on_rules() {
        let detector = AnomalyDetector::new();
        let result = detector
            .detect(&vector([10.0, 100.0, 0.5, 0.01, 30.0, 0.5, 1.0]))
            .await;
        assert!(result.overall_score > 0.3);
        assert!(result.anomaly_types.contains(&AnomalyType::Pattern));
    }

    #[tokio::test]
    async fn training_buffer_is_capped() {
        let detector = AnomalyDetector::new();
        for _ in 0..(TRAINING_BUFFER_CAP + 50) {
            detector.detect(&vector([1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 1.0])).await;
        }
        let state = detector.state.lock().unwrap();
        assert!(state.training_buffer.len() <= TRAINING_BUFFER_CAP);
    }

    #[tokio::test]
    async fn training_produces_a_forest() {
        let detector = AnomalyDetector::new();
        for i in 0..150 {
            let jitter = (i % 5) as f64;
            detector
                .detect(&vector([100.0 + jitter, 512.0, 5.0, 1.0, 2.0, 0.0, 3.0]))
                .await;
        }
        detector.train().await;
        assert!(detector.is_trained().await);
    }

    #[tokio::test]
    async fn feedback_updates_accuracy_and_can_trigger_retrain() {
        let detector = AnomalyDetector::new();
        for i in 0..150 {
            let jitter = (i % 5) as f64;
            detector
                .detect(&vector([100.0 + jitter, 512.0, 5.0, 1.0, 2.0, 0.0, 3.0]))
                .await;
        }
        detector
            .update_online(ModelFeedback {
                prediction_id: "p1".to_string(),
                actual_outcome: FeedbackOutcome::TruePositive,
                confidence: 0.9,
                timestamp_unix: now_unix(),
            })
            .await;
        let metrics = detector.metrics().await;
        assert_eq!(metrics.true_positives, 1);
        assert!(detector.is_trained().await);
    }
}
