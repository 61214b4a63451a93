//! Per-session behavioral pattern analysis.
//!
//! [`BehavioralAnalyzer`] builds a rolling profile of how each session
//! interacts with the service — request shape, timing, and error mix — and
//! turns that profile into a [`BehaviorScore`] the coordinator can weigh
//! alongside reputation and circuit state. It also extracts a bounded
//! sequence of [`BehaviorVector`]s per session for `protection-anomaly` to
//! consume.
//!
//! ```
//! use protection_behavioral::{BehavioralAnalyzer, RequestObservation};
//!
//! # async fn example() {
//! let analyzer = BehavioralAnalyzer::new();
//! let score = analyzer
//!     .analyze_request_pattern(
//!         "session-1",
//!         RequestObservation {
//!             endpoint: "/v1/chat".into(),
//!             method: "POST".into(),
//!             response_time_ms: 120.0,
//!             status_code: 200,
//!             payload_size: 2048,
//!         },
//!     )
//!     .await;
//! println!("{:?}", score.risk_level);
//! # }
//! ```

mod model;

pub use model::{
    BehaviorProfile, BehaviorScore, BehaviorType, BehaviorVector, ErrorPattern, RequestObservation,
    RequestPattern, RiskLevel, TemporalAnomaly, TemporalAnomalyKind, TimingProfile, Trend,
    FEATURE_NAMES, MAX_BEHAVIOR_VECTORS, RETAINED_BEHAVIOR_VECTORS,
};

use std::collections::HashMap;
use std::sync::Mutex;

use model::now_unix;

/// How much history is retained for timing-interval statistics.
const TIMING_WINDOW: usize = 10;
/// Error entries kept for the rolling error-rate check.
const ERROR_WINDOW: usize = 20;
/// EMA smoothing factor applied to response time / payload size / error rate.
const EMA_ALPHA: f64 = 0.1;
/// Sessions inactive longer than this are dropped by `cleanup_old_data`.
const PATTERN_MEMORY_SECS: i64 = 7 * 24 * 3600;

struct SessionState {
    profile: BehaviorProfile,
    request_timestamps: Vec<i64>,
    recent_intervals: Vec<f64>,
    recent_errors: Vec<bool>,
    last_request_unix: Option<i64>,
}

impl SessionState {
    fn new(session_id: &str) -> Self {
        Self {
            profile: BehaviorProfile::new(session_id),
            request_timestamps: Vec::new(),
            recent_intervals: Vec::new(),
            recent_errors: Vec::new(),
            last_request_unix: None,
        }
    }
}

/// Builds and scores per-session behavior profiles.
///
/// All mutable state lives behind a single synchronous [`Mutex`]; critical
/// sections never cross an `.await`, so contention stays cheap even under
/// concurrent sessions.
pub struct BehavioralAnalyzer {
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl Default for BehavioralAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl BehavioralAnalyzer {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Records `observation` against `session_id`'s profile and returns the
    /// freshly computed [`BehaviorScore`].
    pub async fn analyze_request_pattern(
        &self,
        session_id: &str,
        observation: RequestObservation,
    ) -> BehaviorScore {
        let mut sessions = self.sessions.lock().expect("behavioral mutex poisoned");
        let state = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(session_id));

        record_request(state, &observation);
        update_request_patterns(state, &observation);
        update_timing_patterns(state);
        update_error_patterns(state, &observation);

        let score = calculate_behavior_score(session_id, state);
        state.profile.current_risk_level = score.risk_level;
        state.profile.confidence_score = score.confidence;
        state.profile.last_updated_unix = now_unix();
        score
    }

    /// Extracts the current behavior vector and appends it to the session's
    /// bounded history, trimming to [`RETAINED_BEHAVIOR_VECTORS`] once
    /// [`MAX_BEHAVIOR_VECTORS`] is exceeded.
    pub async fn update_behavior_model(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("behavioral mutex poisoned");
        let Some(state) = sessions.get_mut(session_id) else {
            return;
        };
        let vector = extract_behavior_vector(state);
        state.profile.behavior_vectors.push(vector);
        if state.profile.behavior_vectors.len() > MAX_BEHAVIOR_VECTORS {
            let drop = state.profile.behavior_vectors.len() - RETAINED_BEHAVIOR_VECTORS;
            state.profile.behavior_vectors.drain(0..drop);
        }
        normalize_endpoint_preferences(state);
    }

    /// Runs the four frequency/timing/pattern/error heuristics against the
    /// current profile.
    pub async fn detect_anomalies(&self, session_id: &str) -> Vec<TemporalAnomaly> {
        let sessions = self.sessions.lock().expect("behavioral mutex poisoned");
        let Some(state) = sessions.get(session_id) else {
            return Vec::new();
        };
        let mut anomalies = Vec::new();
        detect_frequency_anomalies(state, &mut anomalies);
        detect_timing_anomalies(state, &mut anomalies);
        detect_pattern_anomalies(state, &mut anomalies);
        detect_error_anomalies(state, &mut anomalies);
        anomalies
    }

    /// Escalates [`BehaviorProfile::current_risk_level`] one step when the
    /// last few behavior vectors show a consistently increasing risk trend.
    pub async fn predict_risk_level(&self, session_id: &str) -> RiskLevel {
        let sessions = self.sessions.lock().expect("behavioral mutex poisoned");
        let Some(state) = sessions.get(session_id) else {
            return RiskLevel::Low;
        };
        let base = state.profile.current_risk_level;
        let recent: Vec<f64> = state
            .profile
            .behavior_vectors
            .iter()
            .rev()
            .take(5)
            .map(risk_from_vector)
            .collect();
        if recent.len() >= 3 && is_trend_increasing(&recent) {
            escalate(base)
        } else {
            base
        }
    }

    /// Returns a clone of the session's profile, if one has been built.
    pub async fn get_behavior_profile(&self, session_id: &str) -> Option<BehaviorProfile> {
        let sessions = self.sessions.lock().expect("behavioral mutex poisoned");
        sessions.get(session_id).map(|s| s.profile.clone())
    }

    /// Recomputes a [`BehaviorScore`] from the session's existing profile
    /// without recording a new observation. Used ahead of a request, before
    /// its own outcome is known, so admission decisions weigh the session's
    /// established pattern rather than a fabricated sample.
    pub async fn current_behavior_score(&self, session_id: &str) -> Option<BehaviorScore> {
        let sessions = self.sessions.lock().expect("behavioral mutex poisoned");
        let state = sessions.get(session_id)?;
        Some(calculate_behavior_score(session_id, state))
    }

    /// Drops profiles that haven't seen a request in over
    /// [`PATTERN_MEMORY_SECS`]. Returns the number of sessions evicted.
    pub async fn cleanup_old_data(&self) -> usize {
        let cutoff = now_unix() - PATTERN_MEMORY_SECS;
        let mut sessions = self.sessions.lock().expect("behavioral mutex poisoned");
        let before = sessions.len();
        sessions.retain(|_, state| state.profile.last_updated_unix >= cutoff);
        before - sessions.len()
    }

    /// Number of sessions currently tracked.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().expect("behavioral mutex poisoned").len()
    }
}

fn record_request(state: &mut SessionState, observation: &RequestObservation) {
    let now = now_unix();
    if let Some(last) = state.last_request_unix {
        let interval = (now - last).max(0) as f64;
        state.recent_intervals.push(interval);
        if state.recent_intervals.len() > TIMING_WINDOW {
            let drop = state.recent_intervals.len() - TIMING_WINDOW;
            state.recent_intervals.drain(0..drop);
        }
    }
    state.last_request_unix = Some(now);
    state.request_timestamps.push(now);
    // keep only the last five minutes of raw timestamps for the frequency check
    let window_start = now - 300;
    state.request_timestamps.retain(|&ts| ts >= window_start);

    state.recent_errors.push(observation.is_error());
    if state.recent_errors.len() > ERROR_WINDOW {
        let drop = state.recent_errors.len() - ERROR_WINDOW;
        state.recent_errors.drain(0..drop);
    }

    state.profile.total_requests += 1;
    *state
        .profile
        .endpoint_preferences
        .entry(observation.endpoint.clone())
        .or_insert(0.0) += 1.0;
}

fn update_request_patterns(state: &mut SessionState, observation: &RequestObservation) {
    let key_endpoint = observation.endpoint.clone();
    let key_method = observation.method.clone();
    let now = now_unix();

    let existing = state
        .profile
        .request_patterns
        .iter_mut()
        .find(|p| p.endpoint == key_endpoint && p.method == key_method);

    let is_err = if observation.is_error() { 1.0 } else { 0.0 };

    match existing {
        Some(pattern) => {
            pattern.avg_response_time_ms = ema(pattern.avg_response_time_ms, observation.response_time_ms);
            pattern.error_rate = ema(pattern.error_rate, is_err);
            pattern.payload_size_avg =
                ema(pattern.payload_size_avg as f64, observation.payload_size as f64) as u64;
            pattern.last_updated_unix = now;
        }
        None => state.profile.request_patterns.push(RequestPattern {
            endpoint: key_endpoint,
            method: key_method,
            avg_response_time_ms: observation.response_time_ms,
            error_rate: is_err,
            payload_size_avg: observation.payload_size,
            last_updated_unix: now,
        }),
    }
}

fn ema(previous: f64, sample: f64) -> f64 {
    EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * previous
}

fn update_timing_patterns(state: &mut SessionState) {
    if state.recent_intervals.is_empty() {
        return;
    }
    let n = state.recent_intervals.len() as f64;
    let mean = state.recent_intervals.iter().sum::<f64>() / n;
    let variance = state
        .recent_intervals
        .iter()
        .map(|v| (v - mean).powi(2))
        .sum::<f64>()
        / n;
    let stddev = variance.sqrt();

    let hour = ((now_unix() / 3600) % 24) as u8;
    let burst_frequency = state
        .recent_intervals
        .iter()
        .filter(|&&interval| interval < 1.0)
        .count() as f64;

    let profile = state
        .profile
        .timing_characteristics
        .get_or_insert_with(|| TimingProfile {
            avg_request_interval_secs: mean,
            interval_stddev: stddev,
            peak_activity_hours: Vec::new(),
            burst_frequency: 0.0,
        });
    profile.avg_request_interval_secs = mean;
    profile.interval_stddev = stddev;
    profile.burst_frequency = burst_frequency;
    if !profile.peak_activity_hours.contains(&hour) {
        profile.peak_activity_hours.push(hour);
    }
}

fn update_error_patterns(state: &mut SessionState, observation: &RequestObservation) {
    if !observation.is_error() {
        return;
    }
    let error_type = format!("HTTP_{}", observation.status_code);
    let now = now_unix();
    match state
        .profile
        .error_patterns
        .iter_mut()
        .find(|p| p.error_type == error_type)
    {
        Some(pattern) => {
            pattern.frequency += 1;
            pattern.last_occurrence_unix = now;
            if !pattern.endpoints_affected.contains(&observation.endpoint) {
                pattern.endpoints_affected.push(observation.endpoint.clone());
            }
        }
        None => state.profile.error_patterns.push(ErrorPattern {
            error_type,
            frequency: 1,
            endpoints_affected: vec![observation.endpoint.clone()],
            first_occurrence_unix: now,
            last_occurrence_unix: now,
            error_rate_trend: Trend::Stable,
        }),
    }
}

fn normalize_endpoint_preferences(state: &mut SessionState) {
    let total: f64 = state.profile.endpoint_preferences.values().sum();
    if total <= 0.0 {
        return;
    }
    for value in state.profile.endpoint_preferences.values_mut() {
        *value /= total;
    }
}

fn calculate_behavior_score(session_id: &str, state: &SessionState) -> BehaviorScore {
    let request_score = score_request_patterns(state);
    let timing_score = score_timing_patterns(state);
    let error_score = score_error_patterns(state);
    let resource_score = score_resource_usage(state);

    let mut pattern_scores = HashMap::new();
    pattern_scores.insert(BehaviorType::RequestPattern, request_score);
    pattern_scores.insert(BehaviorType::TimingPattern, timing_score);
    pattern_scores.insert(BehaviorType::ErrorPattern, error_score);
    pattern_scores.insert(BehaviorType::ResourcePattern, resource_score);

    let overall = (request_score + timing_score + error_score + resource_score) / 4.0;
    let risk_level = risk_level_for(overall);
    let confidence = (state.profile.total_requests as f64 / 20.0).min(1.0);

    let mut risk_factors = Vec::new();
    let mut positive_indicators = Vec::new();
    if request_score < 0.6 {
        risk_factors.push("elevated response times or payload sizes".to_string());
    } else {
        positive_indicators.push("request shape within normal range".to_string());
    }
    if timing_score < 0.6 {
        risk_factors.push("bursty or bot-like request timing".to_string());
    }
    if error_score < 0.6 {
        risk_factors.push("elevated error rate across recent requests".to_string());
    } else {
        positive_indicators.push("low recent error rate".to_string());
    }

    BehaviorScore {
        session_id: session_id.to_string(),
        overall_behavior_score: overall,
        pattern_scores,
        risk_level,
        confidence,
        risk_factors,
        positive_indicators,
        timestamp_unix: now_unix(),
    }
}

fn risk_level_for(score: f64) -> RiskLevel {
    if score >= 0.8 {
        RiskLevel::Low
    } else if score >= 0.6 {
        RiskLevel::Medium
    } else if score >= 0.4 {
        RiskLevel::High
    } else {
        RiskLevel::Critical
    }
}

fn escalate(level: RiskLevel) -> RiskLevel {
    match level {
        RiskLevel::Low => RiskLevel::Medium,
        RiskLevel::Medium => RiskLevel::High,
        RiskLevel::High | RiskLevel::Critical => RiskLevel::Critical,
    }
}

fn score_request_patterns(state: &SessionState) -> f64 {
    if state.profile.request_patterns.is_empty() {
        return 1.0;
    }
    let mut score = 1.0f64;
    for pattern in &state.profile.request_patterns {
        if pattern.avg_response_time_ms > 5000.0 {
            score *= 0.7;
        } else if pattern.avg_response_time_ms > 1000.0 {
            score *= 0.9;
        }
    }
    score.max(0.0)
}

fn score_timing_patterns(state: &SessionState) -> f64 {
    let Some(timing) = &state.profile.timing_characteristics else {
        return 1.0;
    };
    let mut score = 1.0f64;
    if timing.burst_frequency > 20.0 {
        score *= 0.3;
    } else if timing.burst_frequency > 10.0 {
        score *= 0.6;
    }
    if timing.avg_request_interval_secs < 1.0 {
        score *= 0.4;
    } else if timing.avg_request_interval_secs < 5.0 {
        score *= 0.7;
    }
    score.max(0.0)
}

fn score_error_patterns(state: &SessionState) -> f64 {
    let total_errors: u64 = state.profile.error_patterns.iter().map(|p| p.frequency).sum();
    if total_errors == 0 {
        return 1.0;
    }
    let base = (1.0 - (total_errors as f64 / 20.0) * 0.8).max(0.2);
    let diversity_penalty = (state.profile.error_patterns.len() as f64 * 0.05).min(0.3);
    (base - diversity_penalty).max(0.0)
}

fn score_resource_usage(state: &SessionState) -> f64 {
    let Some(pattern) = state.profile.request_patterns.first() else {
        return 1.0;
    };
    if pattern.payload_size_avg > 10_000_000 {
        0.5
    } else {
        1.0
    }
}

fn extract_behavior_vector(state: &SessionState) -> BehaviorVector {
    let pattern_count = state.profile.request_patterns.len() as f64;
    let avg_response_time = if pattern_count > 0.0 {
        state.profile.request_patterns.iter().map(|p| p.avg_response_time_ms).sum::<f64>() / pattern_count
    } else {
        0.0
    };
    let avg_payload = if pattern_count > 0.0 {
        state
            .profile
            .request_patterns
            .iter()
            .map(|p| p.payload_size_avg as f64)
            .sum::<f64>()
            / pattern_count
    } else {
        0.0
    };
    let (avg_interval, interval_stddev) = state
        .profile
        .timing_characteristics
        .as_ref()
        .map(|t| (t.avg_request_interval_secs, t.interval_stddev))
        .unwrap_or((0.0, 0.0));
    let request_frequency = state.request_timestamps.len() as f64;
    let error_rate = if state.recent_errors.is_empty() {
        0.0
    } else {
        state.recent_errors.iter().filter(|&&e| e).count() as f64 / state.recent_errors.len() as f64
    };
    let endpoint_diversity = state.profile.endpoint_preferences.len() as f64;

    let values = [
        avg_response_time,
        avg_payload,
        avg_interval,
        interval_stddev,
        request_frequency,
        error_rate,
        endpoint_diversity,
    ];
    let mut features = HashMap::new();
    for (name, value) in FEATURE_NAMES.iter().zip(values.iter()) {
        features.insert((*name).to_string(), *value);
    }

    BehaviorVector {
        features,
        feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        extraction_timestamp_unix: now_unix(),
        window_size: TIMING_WINDOW as u32,
        confidence: (state.profile.total_requests as f64 / 20.0).min(1.0),
    }
}

fn risk_from_vector(vector: &BehaviorVector) -> f64 {
    let error_rate = vector.features.get("error_rate").copied().unwrap_or(0.0);
    let frequency = vector.features.get("request_frequency").copied().unwrap_or(0.0);
    (error_rate * 0.6 + (frequency / 20.0).min(1.0) * 0.4).min(1.0)
}

fn is_trend_increasing(recent_newest_first: &[f64]) -> bool {
    let mut increasing = 0usize;
    let mut total = 0usize;
    for pair in recent_newest_first.windows(2) {
        total += 1;
        if pair[0] > pair[1] {
            increasing += 1;
        }
    }
    total > 0 && (increasing as f64 / total as f64) > 0.6
}

fn detect_frequency_anomalies(state: &SessionState, out: &mut Vec<TemporalAnomaly>) {
    if state.request_timestamps.len() > 20 {
        out.push(TemporalAnomaly {
            kind: TemporalAnomalyKind::Frequency,
            timestamp_unix: now_unix(),
            severity: ((state.request_timestamps.len() as f64 - 20.0) / 20.0).min(1.0),
            duration_secs: 300.0,
            affected_patterns: Vec::new(),
            description: format!(
                "{} requests observed in the last 5 minutes",
                state.request_timestamps.len()
            ),
        });
    }
}

fn detect_timing_anomalies(state: &SessionState, out: &mut Vec<TemporalAnomaly>) {
    let Some(timing) = &state.profile.timing_characteristics else {
        return;
    };
    if timing.interval_stddev < 0.1 && timing.avg_request_interval_secs < 10.0 {
        out.push(TemporalAnomaly {
            kind: TemporalAnomalyKind::Timing,
            timestamp_unix: now_unix(),
            severity: 0.8,
            duration_secs: timing.avg_request_interval_secs * TIMING_WINDOW as f64,
            affected_patterns: Vec::new(),
            description: "request interval is too regular to be human-driven".to_string(),
        });
    }
}

fn detect_pattern_anomalies(state: &SessionState, out: &mut Vec<TemporalAnomaly>) {
    let preferences = &state.profile.endpoint_preferences;
    if preferences.len() < 2 {
        return;
    }
    let max_share = preferences.values().cloned().fold(0.0f64, f64::max);
    let even_share = 1.0 / preferences.len() as f64;
    if (max_share - even_share) > 0.3 {
        out.push(TemporalAnomaly {
            kind: TemporalAnomalyKind::Pattern,
            timestamp_unix: now_unix(),
            severity: (max_share - even_share).min(1.0),
            duration_secs: 0.0,
            affected_patterns: preferences.keys().cloned().collect(),
            description: "endpoint usage shifted sharply toward a single endpoint".to_string(),
        });
    }
}

fn detect_error_anomalies(state: &SessionState, out: &mut Vec<TemporalAnomaly>) {
    if state.recent_errors.is_empty() {
        return;
    }
    let error_rate =
        state.recent_errors.iter().filter(|&&e| e).count() as f64 / state.recent_errors.len() as f64;
    if error_rate > 0.2 {
        out.push(TemporalAnomaly {
            kind: TemporalAnomalyKind::Sequence,
            timestamp_unix: now_unix(),
            severity: error_rate,
            duration_secs: 0.0,
            affected_patterns: Vec::new(),
            description: format!("{:.0}% of recent requests failed", error_rate * 100.0),
        });
    }
}
