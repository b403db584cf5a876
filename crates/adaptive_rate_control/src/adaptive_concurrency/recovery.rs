use std::time::{Duration, Instant};

use bon::Builder;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{LearnedLimitRecord, RateLimitController};

pub(crate) const MIN_REDUCTION_FACTOR: f64 = 0.05;
pub(crate) const MAX_REDUCTION_FACTOR: f64 = 0.95;
pub(crate) const MIN_RECOVERY_FACTOR: f64 = 1.05;
pub(crate) const MAX_RECOVERY_FACTOR: f64 = 4.0;
pub(crate) const MIN_RECOVERY_INTERVAL: Duration = Duration::from_millis(10);
const MIN_TICK_PERIOD: Duration = Duration::from_millis(5);

/// Shape of the reduce-then-recover curve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RecoveryConfig {
    /// Minimum time between two recovery steps of the same key, and between arming
    /// recovery and its first step.
    ///
    /// **Default**: 30s
    pub recovery_interval: Duration,

    /// Multiplier applied to the ceiling on every rejection.
    ///
    /// **Default**: 0.7
    /// **Range**: clamped to `[0.05, 0.95]`
    pub reduction_factor: f64,

    /// Multiplier applied to the ceiling on every recovery step. A step always adds at
    /// least one slot, so a ceiling of 1 still recovers.
    ///
    /// **Default**: 1.5
    /// **Range**: clamped to `[1.05, 4.0]`
    pub recovery_factor: f64,
}

const fn default_recovery_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_reduction_factor() -> f64 {
    0.7
}

const fn default_recovery_factor() -> f64 {
    1.5
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            recovery_interval: default_recovery_interval(),
            reduction_factor: default_reduction_factor(),
            recovery_factor: default_recovery_factor(),
        }
    }
}

/// A partial [`RecoveryConfig`]. Only the fields that are set replace current values.
///
/// ```rust
/// use std::time::Duration;
/// use adaptive_rate_control::adaptive_concurrency::{RecoveryConfig, RecoveryConfigUpdate};
///
/// let mut config = RecoveryConfig::default();
/// config.merge(RecoveryConfigUpdate::builder().recovery_interval(Duration::from_secs(5)).build());
/// assert_eq!(config.recovery_interval, Duration::from_secs(5));
/// assert_eq!(config.reduction_factor, RecoveryConfig::default().reduction_factor);
/// ```
#[derive(Clone, Copy, Debug, Default, Builder)]
pub struct RecoveryConfigUpdate {
    pub recovery_interval: Option<Duration>,
    pub reduction_factor: Option<f64>,
    pub recovery_factor: Option<f64>,
}

impl RecoveryConfig {
    /// Merge `update` field by field, clamping each value into its valid range.
    /// Non-finite factors are ignored.
    pub fn merge(&mut self, update: RecoveryConfigUpdate) {
        if let Some(interval) = update.recovery_interval {
            self.recovery_interval = interval.max(MIN_RECOVERY_INTERVAL);
        }
        if let Some(factor) = update.reduction_factor.and_then(|value| {
            clamp_factor(
                "reduction_factor",
                value,
                MIN_REDUCTION_FACTOR,
                MAX_REDUCTION_FACTOR,
            )
        }) {
            self.reduction_factor = factor;
        }
        if let Some(factor) = update.recovery_factor.and_then(|value| {
            clamp_factor(
                "recovery_factor",
                value,
                MIN_RECOVERY_FACTOR,
                MAX_RECOVERY_FACTOR,
            )
        }) {
            self.recovery_factor = factor;
        }
    }

    pub(crate) fn sanitized(self) -> Self {
        let mut sanitized = Self::default();
        sanitized.merge(RecoveryConfigUpdate {
            recovery_interval: Some(self.recovery_interval),
            reduction_factor: Some(self.reduction_factor),
            recovery_factor: Some(self.recovery_factor),
        });
        sanitized
    }

    /// How often the background task looks for records due a recovery step.
    pub(crate) fn tick_period(&self) -> Duration {
        (self.recovery_interval / 4).max(MIN_TICK_PERIOD)
    }
}

fn clamp_factor(name: &'static str, value: f64, min: f64, max: f64) -> Option<f64> {
    if !value.is_finite() {
        warn!(message = "Ignoring non-finite recovery setting.", setting = name, value);
        return None;
    }
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!(
            message = "Recovery setting out of range; clamped.",
            setting = name,
            requested = value,
            applied = clamped,
        );
    }
    Some(clamped)
}

impl LearnedLimitRecord {
    /// Arm a recovery if the ceiling is degraded and none is pending.
    ///
    /// Returns `true` if this call armed it.
    pub(crate) fn arm_recovery(&mut self, now: Instant) -> bool {
        if !self.is_degraded() || self.recovery_scheduled {
            return false;
        }
        self.recovery_scheduled = true;
        self.recovery_armed_at = Some(now);
        true
    }

    pub(crate) fn disarm_recovery(&mut self) {
        self.recovery_scheduled = false;
        self.recovery_armed_at = None;
    }

    /// Step the ceiling up if a recovery is pending and `interval` has passed since it
    /// was armed or since the previous step, whichever is later.
    ///
    /// Returns `true` if the ceiling moved.
    pub(crate) fn step_recovery(&mut self, now: Instant, config: &RecoveryConfig) -> bool {
        if !self.recovery_scheduled {
            return false;
        }
        if !self.is_degraded() {
            self.disarm_recovery();
            return false;
        }
        let anchor = match (self.recovery_armed_at, self.last_recovery_at) {
            (Some(armed), Some(stepped)) => armed.max(stepped),
            (armed, stepped) => armed.or(stepped).unwrap_or(now),
        };
        if now.saturating_duration_since(anchor) < config.recovery_interval {
            return false;
        }

        let scaled = (self.concurrency as f64 * config.recovery_factor).floor() as usize;
        self.concurrency = scaled
            .max(self.concurrency + 1)
            .min(self.original_limit);
        self.last_recovery_at = Some(now);
        if !self.is_degraded() {
            self.disarm_recovery();
        }
        true
    }
}

/// Owns the background recovery task started by [`RateLimitController::start_recovery`].
///
/// Dropping the handle stops the task; [`RecoveryHandle::shutdown`] also waits for it.
#[derive(Debug)]
pub struct RecoveryHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RecoveryHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                warn!(message = "Recovery task ended abnormally.", %error);
            }
        }
    }
}

impl Drop for RecoveryHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawn the periodic recovery loop. Must be called within a Tokio runtime.
pub(crate) fn spawn(controller: RateLimitController, token: CancellationToken) -> RecoveryHandle {
    let task_token = token.clone();
    let task = tokio::spawn(async move {
        debug!(message = "Recovery task started.");
        loop {
            let period = controller.recovery_config().tick_period();
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    let stepped = controller.recover_due();
                    if stepped > 0 {
                        trace!(message = "Recovery tick stepped records.", stepped);
                    }
                }
            }
        }
        debug!(message = "Recovery task stopped.");
    });
    RecoveryHandle {
        token,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn degraded(concurrency: usize, original: usize) -> LearnedLimitRecord {
        let mut record = LearnedLimitRecord::new(original);
        record.concurrency = concurrency;
        record
    }

    #[test]
    fn merge_only_touches_provided_fields() {
        let mut config = RecoveryConfig::default();
        config.merge(
            RecoveryConfigUpdate::builder()
                .recovery_factor(2.0)
                .build(),
        );

        assert_eq!(config.recovery_factor, 2.0);
        assert_eq!(config.reduction_factor, 0.7);
        assert_eq!(config.recovery_interval, Duration::from_secs(30));
    }

    #[test]
    fn merge_clamps_and_ignores_garbage() {
        let mut config = RecoveryConfig::default();
        config.merge(RecoveryConfigUpdate {
            recovery_interval: Some(Duration::ZERO),
            reduction_factor: Some(1.7),
            recovery_factor: Some(f64::NAN),
        });

        assert_eq!(config.recovery_interval, MIN_RECOVERY_INTERVAL);
        assert_eq!(config.reduction_factor, MAX_REDUCTION_FACTOR);
        assert_eq!(config.recovery_factor, 1.5);
    }

    #[test]
    fn arming_requires_a_degraded_ceiling() {
        let now = Instant::now();
        let mut healthy = LearnedLimitRecord::new(4);
        assert!(!healthy.arm_recovery(now));
        assert!(!healthy.recovery_scheduled);

        let mut record = degraded(1, 4);
        assert!(record.arm_recovery(now));
        assert!(!record.arm_recovery(now), "already armed");
        assert!(record.recovery_scheduled);
    }

    #[test]
    fn steps_are_time_gated_and_stop_at_the_ceiling() {
        let config = RecoveryConfig::default();
        let start = Instant::now();
        let mut record = degraded(1, 4);
        record.arm_recovery(start);

        assert!(!record.step_recovery(start + Duration::from_secs(29), &config));
        assert_eq!(record.concurrency, 1);

        // 1 * 1.5 floors to 1, so the step adds the minimum single slot.
        let first = start + Duration::from_secs(30);
        assert!(record.step_recovery(first, &config));
        assert_eq!(record.concurrency, 2);
        assert_eq!(record.last_recovery_at, Some(first));
        assert!(record.recovery_scheduled);

        assert!(!record.step_recovery(first + Duration::from_secs(10), &config));

        let second = first + Duration::from_secs(30);
        assert!(record.step_recovery(second, &config));
        assert_eq!(record.concurrency, 3);

        let third = second + Duration::from_secs(30);
        assert!(record.step_recovery(third, &config));
        assert_eq!(record.concurrency, 4);
        assert!(!record.recovery_scheduled);
        assert_eq!(record.recovery_armed_at, None);

        assert!(!record.step_recovery(third + Duration::from_secs(300), &config));
        assert_eq!(record.concurrency, 4);
    }

    #[test]
    fn unarmed_records_do_not_recover() {
        let config = RecoveryConfig::default();
        let mut record = degraded(2, 8);
        assert!(!record.step_recovery(Instant::now() + Duration::from_secs(3600), &config));
        assert_eq!(record.concurrency, 2);
    }

    #[test]
    fn tick_period_has_a_floor() {
        let config = RecoveryConfig {
            recovery_interval: Duration::from_millis(10),
            ..RecoveryConfig::default()
        };
        assert_eq!(config.tick_period(), MIN_TICK_PERIOD);
        assert_eq!(RecoveryConfig::default().tick_period(), Duration::from_millis(7500));
    }
}
