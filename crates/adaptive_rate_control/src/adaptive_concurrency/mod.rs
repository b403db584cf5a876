//! Learn the max number of requests a provider/model pair accepts concurrently.

mod classifier;
mod clock;
mod controller;
mod executor;
pub mod internal_event;
mod key;
mod predictor;
mod recovery;
mod store;

use std::{fmt::Display, str::FromStr, time::Duration};

use bon::Builder;

pub use classifier::{RateLimitSignal, is_rate_limit_error, is_rate_limit_error_value};
pub use clock::{Clock, ManualClock, TokioClock};
pub use controller::{MAX_GLOBAL_MULTIPLIER, MIN_GLOBAL_MULTIPLIER, RateLimitController};
pub use executor::{ExecutionOptions, ExecutorError, normalize_limit, run_with_concurrency_limit};
pub use key::ProviderKey;
pub use predictor::{PredictiveAnalysis, RateControlSummary};
pub use recovery::{RecoveryConfig, RecoveryConfigUpdate, RecoveryHandle};
pub use store::LearnedLimitRecord;

fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

/// Configuration of the adaptive rate controller.
///
/// These parameters typically do not require changes from the default. The values only
/// need to satisfy two observable bounds: three back-to-back rejections from a ceiling of
/// four must leave a single slot, and the global multiplier never exceeds 2.0.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `default_preset_limit` | 4 | Ceiling seeded for a key first seen through a rejection |
/// | `recovery` | see [`RecoveryConfig`] | Reduction/recovery factors and the recovery interval |
/// | `consecutive_penalty_threshold` | 3 | Consecutive rejections before the extra penalty applies |
/// | `consecutive_penalty_factor` | 0.5 | Extra multiplicative penalty for unrecovered rejections |
/// | `throttle_threshold` | 0.5 | Probability above which callers are told to throttle |
/// | `recent_window` | 60s | Decay constant of the predictor and window of the recent count |
/// | `probability_scale` | 3.0 | Decayed rejections needed to reach `1 - 1/e` probability |
/// | `history_capacity` | 256 | Rejection timestamps retained per key |
/// | `global_multiplier` | 1.0 | Initial global multiplier, clamped to `[0.1, 2.0]` |
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use adaptive_rate_control::adaptive_concurrency::{AdaptiveRateSettings, RecoveryConfig};
///
/// let settings = AdaptiveRateSettings::builder()
///     .default_preset_limit(8)
///     .recovery(RecoveryConfig {
///         recovery_interval: Duration::from_secs(10),
///         ..RecoveryConfig::default()
///     })
///     .throttle_threshold(0.7)
///     .build();
/// assert_eq!(settings.get_default_preset_limit(), 8);
/// ```
#[derive(Clone, Copy, Debug, Builder)]
pub struct AdaptiveRateSettings {
    /// Ceiling seeded for a key whose first observation is a rejection rather than a
    /// limit query carrying the caller's preset.
    #[builder(default = default_preset_limit())]
    pub(super) default_preset_limit: usize,

    /// Reduction and recovery curve.
    #[builder(default)]
    pub(super) recovery: RecoveryConfig,

    /// Number of rejections without an intervening success after which each further
    /// rejection is penalized twice.
    #[builder(default = default_consecutive_penalty_threshold())]
    pub(super) consecutive_penalty_threshold: u32,

    /// Multiplier of the extra penalty.
    ///
    /// **Range**: 0 < consecutive_penalty_factor < 1
    #[builder(default = default_consecutive_penalty_factor())]
    pub(super) consecutive_penalty_factor: f64,

    /// Predicted rejection probability above which `should_proactively_throttle` is set.
    #[builder(default = default_throttle_threshold())]
    pub(super) throttle_threshold: f64,

    /// Decay constant of rejection weights, and the window of `recent_429_count`.
    #[builder(default = default_recent_window())]
    pub(super) recent_window: Duration,

    /// Sum of decayed rejection weights that maps to a probability of `1 - 1/e`.
    ///
    /// Lower values make the predictor more pessimistic.
    #[builder(default = default_probability_scale())]
    pub(super) probability_scale: f64,

    /// Rejection timestamps kept per key. Older entries fall off the front.
    #[builder(default = default_history_capacity())]
    pub(super) history_capacity: usize,

    /// Initial global multiplier.
    #[builder(default = default_global_multiplier())]
    pub(super) global_multiplier: f64,
}

const fn default_preset_limit() -> usize {
    4
}

const fn default_consecutive_penalty_threshold() -> u32 {
    3
}

const fn default_consecutive_penalty_factor() -> f64 {
    0.5
}

const fn default_throttle_threshold() -> f64 {
    0.5
}

const fn default_recent_window() -> Duration {
    Duration::from_secs(60)
}

const fn default_probability_scale() -> f64 {
    3.0
}

const fn default_history_capacity() -> usize {
    256
}

const fn default_global_multiplier() -> f64 {
    1.0
}

impl Default for AdaptiveRateSettings {
    fn default() -> Self {
        Self {
            default_preset_limit: default_preset_limit(),
            recovery: RecoveryConfig::default(),
            consecutive_penalty_threshold: default_consecutive_penalty_threshold(),
            consecutive_penalty_factor: default_consecutive_penalty_factor(),
            throttle_threshold: default_throttle_threshold(),
            recent_window: default_recent_window(),
            probability_scale: default_probability_scale(),
            history_capacity: default_history_capacity(),
            global_multiplier: default_global_multiplier(),
        }
    }
}

impl AdaptiveRateSettings {
    /// Default settings overlaid with `ADAPTIVE_RATE_*` environment variables.
    ///
    /// Recognized variables: `ADAPTIVE_RATE_DEFAULT_PRESET`, `ADAPTIVE_RATE_REDUCTION_FACTOR`,
    /// `ADAPTIVE_RATE_RECOVERY_FACTOR`, `ADAPTIVE_RATE_RECOVERY_INTERVAL_MS`,
    /// `ADAPTIVE_RATE_GLOBAL_MULTIPLIER` and `ADAPTIVE_RATE_THROTTLE_THRESHOLD`.
    /// Values that fail to parse are logged and ignored.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(preset) = env_override("ADAPTIVE_RATE_DEFAULT_PRESET") {
            settings.default_preset_limit = preset;
        }
        if let Some(threshold) = env_override("ADAPTIVE_RATE_THROTTLE_THRESHOLD") {
            settings.throttle_threshold = threshold;
        }
        if let Some(multiplier) = env_override("ADAPTIVE_RATE_GLOBAL_MULTIPLIER") {
            settings.global_multiplier = multiplier;
        }
        settings.recovery.merge(RecoveryConfigUpdate {
            recovery_interval: env_override("ADAPTIVE_RATE_RECOVERY_INTERVAL_MS")
                .map(Duration::from_millis),
            reduction_factor: env_override("ADAPTIVE_RATE_REDUCTION_FACTOR"),
            recovery_factor: env_override("ADAPTIVE_RATE_RECOVERY_FACTOR"),
        });
        settings
    }

    /// Copy with every field forced into its valid range.
    pub(super) fn sanitized(mut self) -> Self {
        self.default_preset_limit = self.default_preset_limit.max(1);
        self.recovery = self.recovery.sanitized();
        self.consecutive_penalty_threshold = self.consecutive_penalty_threshold.max(1);
        if !(self.consecutive_penalty_factor > 0.0 && self.consecutive_penalty_factor < 1.0) {
            warn!(
                message = "Consecutive penalty factor out of range; using default.",
                value = self.consecutive_penalty_factor,
            );
            self.consecutive_penalty_factor = default_consecutive_penalty_factor();
        }
        if !self.throttle_threshold.is_finite() {
            self.throttle_threshold = default_throttle_threshold();
        }
        self.throttle_threshold = self.throttle_threshold.clamp(0.0, 1.0);
        if self.recent_window.is_zero() {
            self.recent_window = default_recent_window();
        }
        if !(self.probability_scale.is_finite() && self.probability_scale > 0.0) {
            self.probability_scale = default_probability_scale();
        }
        self.history_capacity = self.history_capacity.max(1);
        self
    }

    pub fn get_default_preset_limit(&self) -> usize {
        self.default_preset_limit
    }

    pub fn get_recovery(&self) -> RecoveryConfig {
        self.recovery
    }

    pub fn get_throttle_threshold(&self) -> f64 {
        self.throttle_threshold
    }

    pub fn get_recent_window(&self) -> Duration {
        self.recent_window
    }
}

fn env_override<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(message = "Ignoring unparsable environment override.", variable = name, %error);
            None
        }
    }
}
