use std::time::{Duration, Instant};

use serde::Serialize;

/// Advisory throttling recommendation for one provider/model pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PredictiveAnalysis {
    pub predicted_429_probability: f64,
    pub should_proactively_throttle: bool,
    /// The effective limit scaled down by the predicted probability, never below 1.
    pub recommended_concurrency: usize,
}

impl PredictiveAnalysis {
    /// The analysis of a key with no rejection history.
    pub fn neutral(effective_limit: usize) -> Self {
        Self {
            predicted_429_probability: 0.0,
            should_proactively_throttle: false,
            recommended_concurrency: effective_limit.max(1),
        }
    }

    pub(crate) fn from_probability(
        probability: f64,
        effective_limit: usize,
        throttle_threshold: f64,
    ) -> Self {
        Self {
            predicted_429_probability: probability,
            should_proactively_throttle: probability > throttle_threshold,
            recommended_concurrency: recommended_concurrency(effective_limit, probability),
        }
    }
}

/// Everything the controller knows about a key, in one read.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RateControlSummary {
    /// What [`RateLimitController::effective_limit`] would return.
    ///
    /// [`RateLimitController::effective_limit`]: super::RateLimitController::effective_limit
    pub adaptive_limit: usize,
    pub original_limit: usize,
    pub predictive_limit: usize,
    pub predicted_429_probability: f64,
    pub should_throttle: bool,
    /// Rejections within the recent window.
    pub recent_429_count: usize,
}

/// Probability that the next request is rejected, from the rejection history.
///
/// Each rejection contributes `exp(-age / window)`; the summed weight `w` maps to
/// `1 - exp(-w / scale)`. More rejections, or more recent ones, always give a higher
/// probability, and an empty history gives exactly 0.
pub(crate) fn rejection_probability<'a>(
    history: impl IntoIterator<Item = &'a Instant>,
    now: Instant,
    window: Duration,
    scale: f64,
) -> f64 {
    let window = window.as_secs_f64().max(f64::EPSILON);
    let weight: f64 = history
        .into_iter()
        .map(|at| {
            let age = now.saturating_duration_since(*at).as_secs_f64();
            (-age / window).exp()
        })
        .sum();
    if weight <= 0.0 {
        return 0.0;
    }
    (1.0 - (-weight / scale).exp()).clamp(0.0, 1.0)
}

/// Number of rejections no older than `window`.
pub(crate) fn recent_count<'a>(
    history: impl IntoIterator<Item = &'a Instant>,
    now: Instant,
    window: Duration,
) -> usize {
    history
        .into_iter()
        .filter(|at| now.saturating_duration_since(**at) <= window)
        .count()
}

fn recommended_concurrency(effective_limit: usize, probability: f64) -> usize {
    let scaled = (effective_limit as f64 * (1.0 - probability)).floor() as usize;
    scaled.max(1)
}
