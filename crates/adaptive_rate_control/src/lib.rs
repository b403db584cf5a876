//! Adaptive concurrency learning for rate-limited remote services.
//!
//! This crate learns, per provider/model pair, how many requests can safely be in
//! flight at once, and runs batches of work under that ceiling.
//!
//! # Algorithm Overview
//!
//! 1. **Multiplicative Decrease**: every rate-limit rejection multiplies the learned
//!    ceiling by a reduction factor (default: 0.7). Three or more rejections without an
//!    intervening success halve it again.
//! 2. **Time-gated Increase**: a success arms recovery. A background ticker multiplies
//!    the ceiling by a recovery factor (default: 1.5) once per recovery interval until the
//!    original ceiling is restored.
//! 3. **Prediction**: recent rejections are decayed into a probability of the next
//!    request being rejected, which callers may use to throttle proactively.
//!
//! # Features
//! - Case-insensitive provider/model keys with per-key serialized updates
//! - Text-based rate-limit error classification that walks wrapped error chains
//! - A global multiplier clamped to `[0.1, 2.0]`
//! - An order-preserving bounded executor with cooperative cancellation
//!
//! # Safety & Concurrency
//! - Thread-safe: per-key mutexes, atomics for the multiplier
//! - No unsafe code
//!
//! # Basic Usage
//! ```
//! use adaptive_rate_control::adaptive_concurrency::{
//!     AdaptiveRateSettings, ExecutionOptions, RateLimitController, run_with_concurrency_limit,
//! };
//!
//! # tokio_test::block_on(async {
//! let controller = RateLimitController::new(AdaptiveRateSettings::default());
//! let limit = controller.effective_limit("anthropic", "claude-x", 4);
//!
//! let doubled = run_with_concurrency_limit(
//!     vec![1, 2, 3],
//!     limit as f64,
//!     |item, _index| async move { Ok::<_, std::io::Error>(item * 2) },
//!     ExecutionOptions::default(),
//! )
//! .await
//! .unwrap();
//! assert_eq!(doubled, vec![2, 4, 6]);
//! # });
//! ```
//!
//! # Configuration
//! See [`adaptive_concurrency::AdaptiveRateSettings`] for tuning parameters.
//!
//! # Metrics
//! Emits metrics via the `InternalEvent` trait.
pub mod adaptive_concurrency;
pub mod global;

#[macro_use]
extern crate tracing;

pub use adaptive_concurrency::{
    AdaptiveRateSettings, ExecutionOptions, ExecutorError, LearnedLimitRecord,
    PredictiveAnalysis, ProviderKey, RateControlSummary, RateLimitController, RateLimitSignal,
    RecoveryConfig, RecoveryConfigUpdate, is_rate_limit_error, run_with_concurrency_limit,
};
