use std::{
    future::Future,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use tokio_util::sync::CancellationToken;

use super::{
    AdaptiveRateSettings, Clock, LearnedLimitRecord, PredictiveAnalysis, ProviderKey,
    RateControlSummary, RateLimitSignal, RecoveryConfig, RecoveryConfigUpdate, RecoveryHandle,
    TokioClock, classifier,
    internal_event::{
        GlobalMultiplierChanged, LearnedLimitReset, PredictionComputed, RateLimitObserved,
        RecoveryArmed, RecoveryStepped, emit,
    },
    predictor, recovery,
    store::{LearnedLimitStore, lock},
};

/// Lower bound of the global multiplier.
pub const MIN_GLOBAL_MULTIPLIER: f64 = 0.1;
/// Upper bound of the global multiplier.
pub const MAX_GLOBAL_MULTIPLIER: f64 = 2.0;

/// Shared state of the controller.
#[derive(Debug)]
struct Inner {
    settings: AdaptiveRateSettings,
    store: LearnedLimitStore,
    recovery: RwLock<RecoveryConfig>,
    // f64 bits.
    multiplier: AtomicU64,
    clock: Arc<dyn Clock>,
    // Parent of every recovery task token; replaced on shutdown.
    shutdown: Mutex<CancellationToken>,
}

/// Learns a concurrency ceiling per provider/model pair.
///
/// Cloning is cheap and every clone shares the same learned state, so one controller can
/// be handed to every call site and to the background recovery task.
///
/// # Example
///
/// ```rust
/// use adaptive_rate_control::adaptive_concurrency::RateLimitController;
///
/// let controller = RateLimitController::default();
/// assert_eq!(controller.effective_limit("Anthropic", "Claude-X", 4), 4);
///
/// controller.record_429("anthropic", "claude-x");
/// assert!(controller.effective_limit("anthropic", "claude-x", 4) < 4);
///
/// controller.record_success("anthropic", "claude-x");
/// assert!(controller.learned_limit("anthropic", "claude-x").unwrap().recovery_scheduled);
/// ```
#[derive(Clone, Debug)]
pub struct RateLimitController {
    inner: Arc<Inner>,
}

impl Default for RateLimitController {
    fn default() -> Self {
        Self::new(AdaptiveRateSettings::default())
    }
}

impl RateLimitController {
    pub fn new(settings: AdaptiveRateSettings) -> Self {
        Self::with_clock(settings, Arc::new(TokioClock))
    }

    /// Build a controller reading time from `clock`, e.g. a [`ManualClock`] in tests.
    ///
    /// [`ManualClock`]: super::ManualClock
    pub fn with_clock(settings: AdaptiveRateSettings, clock: Arc<dyn Clock>) -> Self {
        let settings = settings.sanitized();
        let multiplier = clamp_multiplier(settings.global_multiplier);
        Self {
            inner: Arc::new(Inner {
                settings,
                store: LearnedLimitStore::default(),
                recovery: RwLock::new(settings.recovery),
                multiplier: AtomicU64::new(multiplier.to_bits()),
                clock,
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn settings(&self) -> &AdaptiveRateSettings {
        &self.inner.settings
    }

    /// The concurrency to hand to the executor for this provider/model.
    ///
    /// The base is the learned ceiling if one exists, else `preset_limit`, in which case a
    /// record seeded with the preset is created so later rejections reduce from it. The
    /// base is scaled by the global multiplier, floored, and never below 1.
    pub fn effective_limit(&self, provider: &str, model: &str, preset_limit: usize) -> usize {
        let key = ProviderKey::new(provider, model);
        let record = self
            .inner
            .store
            .get_or_insert_with(&key, || LearnedLimitRecord::new(preset_limit));
        let base = lock(&record).concurrency;
        self.scale(base)
    }

    /// Record a rate-limit rejection.
    ///
    /// The ceiling is multiplied by the reduction factor (floored, at least 1). From the
    /// third rejection without an intervening success on, it is halved once more. Any
    /// pending recovery is cancelled; only a success arms it again.
    pub fn record_429(&self, provider: &str, model: &str) {
        let key = ProviderKey::new(provider, model);
        let settings = &self.inner.settings;
        let reduction_factor = self.recovery_config().reduction_factor;
        let now = self.inner.clock.now();

        let record = self.inner.store.get_or_insert_with(&key, || {
            LearnedLimitRecord::new(settings.default_preset_limit)
        });
        let mut record = lock(&record);

        record.concurrency = reduce(record.concurrency, reduction_factor);
        record.consecutive_429_count = record.consecutive_429_count.saturating_add(1);
        record.total_429_count = record.total_429_count.saturating_add(1);
        if record.consecutive_429_count >= settings.consecutive_penalty_threshold {
            record.concurrency = reduce(record.concurrency, settings.consecutive_penalty_factor);
        }
        record.push_rejection(now, settings.history_capacity);
        record.disarm_recovery();

        emit(RateLimitObserved {
            key: &key,
            concurrency: record.concurrency,
            original_limit: record.original_limit,
            consecutive_429_count: record.consecutive_429_count,
            total_429_count: record.total_429_count,
        });
    }

    /// Record a successful call.
    ///
    /// Resets the consecutive rejection count and, if the ceiling is degraded, arms a
    /// time-gated recovery. Unknown keys are left untouched.
    pub fn record_success(&self, provider: &str, model: &str) {
        let key = ProviderKey::new(provider, model);
        let Some(record) = self.inner.store.get(&key) else {
            trace!(message = "Success for unknown key; nothing to recover.", %key);
            return;
        };
        let now = self.inner.clock.now();
        let mut record = lock(&record);

        record.consecutive_429_count = 0;
        if record.arm_recovery(now) {
            emit(RecoveryArmed {
                key: &key,
                concurrency: record.concurrency,
                original_limit: record.original_limit,
            });
        }
    }

    /// Step every record whose recovery is due. Returns how many records moved.
    ///
    /// The task started by [`RateLimitController::start_recovery`] calls this
    /// periodically; tests with a manual clock may call it directly.
    pub fn recover_due(&self) -> usize {
        let config = self.recovery_config();
        let now = self.inner.clock.now();
        let mut stepped = 0;

        for (key, record) in self.inner.store.entries() {
            let mut record = lock(&record);
            let from = record.concurrency;
            if record.step_recovery(now, &config) {
                stepped += 1;
                emit(RecoveryStepped {
                    key: &key,
                    from,
                    to: record.concurrency,
                    original_limit: record.original_limit,
                });
            }
        }
        stepped
    }

    /// Spawn the background task that applies due recovery steps.
    ///
    /// Must be called within a Tokio runtime. The task stops when the returned handle is
    /// dropped or shut down, or when [`RateLimitController::shutdown`] is called.
    pub fn start_recovery(&self) -> RecoveryHandle {
        let token = self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token();
        recovery::spawn(self.clone(), token)
    }

    /// A copy of the learned record, if the key has been seen.
    pub fn learned_limit(&self, provider: &str, model: &str) -> Option<LearnedLimitRecord> {
        self.inner
            .store
            .snapshot(&ProviderKey::new(provider, model))
    }

    /// Forget everything learned about one key and restart it at `original_limit`.
    pub fn reset_learned_limit(&self, provider: &str, model: &str, original_limit: usize) {
        let key = ProviderKey::new(provider, model);
        let record = self
            .inner
            .store
            .get_or_insert_with(&key, || LearnedLimitRecord::new(original_limit));
        let mut record = lock(&record);
        record.reset(original_limit);

        emit(LearnedLimitReset {
            key: &key,
            original_limit: record.original_limit,
        });
    }

    pub fn reset_all_learned_limits(&self) {
        let discarded = self.inner.store.len();
        self.inner.store.clear();
        debug!(message = "All learned limits discarded.", discarded);
    }

    /// See [`is_rate_limit_error`](super::is_rate_limit_error).
    pub fn is_rate_limit_error<'a>(&self, signal: impl Into<RateLimitSignal<'a>>) -> bool {
        classifier::is_rate_limit_error(signal)
    }

    /// Probability in `[0, 1]` that the next call to this key is rejected.
    ///
    /// Zero for unseen keys and keys without rejections.
    pub fn analyze_429_probability(&self, provider: &str, model: &str) -> f64 {
        let key = ProviderKey::new(provider, model);
        match self.inner.store.snapshot(&key) {
            Some(record) => self.probability(&key, &record, self.inner.clock.now()),
            None => 0.0,
        }
    }

    /// Advisory throttling recommendation. Does not create or modify records.
    pub fn predictive_analysis(
        &self,
        provider: &str,
        model: &str,
        preset_limit: usize,
    ) -> PredictiveAnalysis {
        let key = ProviderKey::new(provider, model);
        let Some(record) = self.inner.store.snapshot(&key) else {
            return PredictiveAnalysis::neutral(self.scale(preset_limit.max(1)));
        };
        let probability = self.probability(&key, &record, self.inner.clock.now());
        PredictiveAnalysis::from_probability(
            probability,
            self.scale(record.concurrency),
            self.inner.settings.throttle_threshold,
        )
    }

    /// The adaptive, original and predictive limits of a key in one read.
    ///
    /// Pure aggregation: unlike [`RateLimitController::effective_limit`] this never
    /// creates a record.
    pub fn combined_summary(
        &self,
        provider: &str,
        model: &str,
        preset_limit: usize,
    ) -> RateControlSummary {
        let key = ProviderKey::new(provider, model);
        let now = self.inner.clock.now();
        let settings = &self.inner.settings;

        let record = self
            .inner
            .store
            .snapshot(&key)
            .unwrap_or_else(|| LearnedLimitRecord::new(preset_limit));
        let adaptive_limit = self.scale(record.concurrency);
        let analysis = if record.historical_429s.is_empty() {
            PredictiveAnalysis::neutral(adaptive_limit)
        } else {
            PredictiveAnalysis::from_probability(
                self.probability(&key, &record, now),
                adaptive_limit,
                settings.throttle_threshold,
            )
        };

        RateControlSummary {
            adaptive_limit,
            original_limit: record.original_limit,
            predictive_limit: analysis.recommended_concurrency,
            predicted_429_probability: analysis.predicted_429_probability,
            should_throttle: analysis.should_proactively_throttle,
            recent_429_count: predictor::recent_count(
                &record.historical_429s,
                now,
                settings.recent_window,
            ),
        }
    }

    /// Set the multiplier applied to every effective limit, clamped to
    /// `[MIN_GLOBAL_MULTIPLIER, MAX_GLOBAL_MULTIPLIER]`. NaN restores 1.0.
    pub fn set_global_multiplier(&self, value: f64) {
        let applied = clamp_multiplier(value);
        self.inner
            .multiplier
            .store(applied.to_bits(), Ordering::Release);
        emit(GlobalMultiplierChanged {
            requested: value,
            applied,
        });
    }

    pub fn global_multiplier(&self) -> f64 {
        f64::from_bits(self.inner.multiplier.load(Ordering::Acquire))
    }

    /// Merge a partial recovery configuration into the current one.
    pub fn configure_recovery(&self, update: RecoveryConfigUpdate) {
        let mut config = self
            .inner
            .recovery
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        config.merge(update);
        debug!(
            message = "Recovery configuration updated.",
            recovery_interval_ms = config.recovery_interval.as_millis() as u64,
            reduction_factor = config.reduction_factor,
            recovery_factor = config.recovery_factor,
        );
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        *self
            .inner
            .recovery
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Await `call` and feed its outcome back into the controller.
    ///
    /// `Ok` counts as a success; an error that [classifies](super::is_rate_limit_error) as
    /// a rate limit counts as a rejection; any other error is returned without touching
    /// learned state.
    pub async fn observe<T, E, Fut>(&self, provider: &str, model: &str, call: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let outcome = call.await;
        match &outcome {
            Ok(_) => self.record_success(provider, model),
            Err(error) if classifier::is_rate_limit_error_value(error) => {
                self.record_429(provider, model)
            }
            Err(_) => {}
        }
        outcome
    }

    /// Stop recovery tasks and discard all learned state and runtime configuration.
    ///
    /// The controller stays usable afterwards, as if freshly constructed.
    pub fn shutdown(&self) {
        {
            let mut token = self
                .inner
                .shutdown
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            token.cancel();
            *token = CancellationToken::new();
        }
        self.inner.store.clear();
        *self
            .inner
            .recovery
            .write()
            .unwrap_or_else(PoisonError::into_inner) = self.inner.settings.recovery;
        self.inner.multiplier.store(
            clamp_multiplier(self.inner.settings.global_multiplier).to_bits(),
            Ordering::Release,
        );
        info!(message = "Rate limit controller shut down.");
    }

    fn scale(&self, base: usize) -> usize {
        let scaled = (base as f64 * self.global_multiplier()).floor() as usize;
        scaled.max(1)
    }

    fn probability(&self, key: &ProviderKey, record: &LearnedLimitRecord, now: Instant) -> f64 {
        if record.historical_429s.is_empty() {
            return 0.0;
        }
        let settings = &self.inner.settings;
        let probability = predictor::rejection_probability(
            &record.historical_429s,
            now,
            settings.recent_window,
            settings.probability_scale,
        );
        emit(PredictionComputed { key, probability });
        probability
    }
}

fn reduce(concurrency: usize, factor: f64) -> usize {
    ((concurrency as f64 * factor).floor() as usize).max(1)
}

fn clamp_multiplier(value: f64) -> f64 {
    if value.is_nan() {
        return 1.0;
    }
    value.clamp(MIN_GLOBAL_MULTIPLIER, MAX_GLOBAL_MULTIPLIER)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;
    use crate::adaptive_concurrency::ManualClock;

    fn manual() -> (RateLimitController, ManualClock) {
        let clock = ManualClock::new();
        let controller =
            RateLimitController::with_clock(AdaptiveRateSettings::default(), Arc::new(clock.clone()));
        (controller, clock)
    }

    #[test]
    fn unseen_keys_resolve_to_scaled_preset() {
        let (controller, _) = manual();
        for preset in [1, 3, 4, 17] {
            let model = format!("model-{preset}");
            assert_eq!(controller.effective_limit("openai", &model, preset), preset);
        }

        controller.set_global_multiplier(1.5);
        assert_eq!(controller.effective_limit("openai", "fresh", 3), 4);
    }

    #[test]
    fn zero_preset_still_allows_one_slot() {
        let (controller, _) = manual();
        assert_eq!(controller.effective_limit("p", "m", 0), 1);
    }

    #[test]
    fn three_consecutive_rejections_from_four_leave_one_slot() {
        let (controller, _) = manual();
        assert_eq!(controller.effective_limit("anthropic", "claude", 4), 4);

        for _ in 0..3 {
            controller.record_429("anthropic", "claude");
        }

        let record = controller.learned_limit("anthropic", "claude").unwrap();
        assert_eq!(record.consecutive_429_count, 3);
        assert_eq!(record.total_429_count, 3);
        assert!(record.concurrency <= 1);
        assert_eq!(record.historical_429s.len(), 3);
    }

    #[test]
    fn rejection_on_unseen_key_seeds_default_preset() {
        let (controller, _) = manual();
        controller.record_429("gemini", "pro");

        let record = controller.learned_limit("gemini", "pro").unwrap();
        assert_eq!(record.original_limit, 4);
        assert_eq!(record.concurrency, 2);
    }

    #[test]
    fn concurrency_never_drops_below_one() {
        let (controller, _) = manual();
        controller.effective_limit("p", "m", 50);
        for _ in 0..40 {
            controller.record_429("p", "m");
            assert!(controller.learned_limit("p", "m").unwrap().concurrency >= 1);
        }
        assert_eq!(controller.effective_limit("p", "m", 50), 1);
    }

    #[test]
    fn consecutive_rejections_degrade_faster_than_isolated_ones() {
        let (controller, _) = manual();
        controller.effective_limit("p", "isolated", 100);
        controller.effective_limit("p", "consecutive", 100);

        for _ in 0..4 {
            controller.record_429("p", "isolated");
            controller.record_success("p", "isolated");
            controller.record_429("p", "consecutive");
        }

        let isolated = controller.learned_limit("p", "isolated").unwrap();
        let consecutive = controller.learned_limit("p", "consecutive").unwrap();
        // 100 -> 70 -> 49 -> 34 -> 23 versus 100 -> 70 -> 49 -> 17 -> 5.
        assert_eq!(isolated.concurrency, 23);
        assert_eq!(consecutive.concurrency, 5);
        assert_eq!(isolated.total_429_count, consecutive.total_429_count);
    }

    #[test]
    fn success_resets_streak_and_arms_only_when_degraded() {
        let (controller, _) = manual();
        controller.effective_limit("p", "m", 4);

        controller.record_success("p", "m");
        let record = controller.learned_limit("p", "m").unwrap();
        assert_eq!(record.consecutive_429_count, 0);
        assert!(!record.recovery_scheduled);

        controller.record_429("p", "m");
        controller.record_429("p", "m");
        controller.record_success("p", "m");
        let record = controller.learned_limit("p", "m").unwrap();
        assert_eq!(record.consecutive_429_count, 0);
        assert_eq!(record.total_429_count, 2);
        assert!(record.recovery_scheduled);
    }

    #[test]
    fn success_on_unknown_key_creates_nothing() {
        let (controller, _) = manual();
        controller.record_success("nobody", "nothing");
        assert!(controller.learned_limit("nobody", "nothing").is_none());
    }

    #[test]
    fn rejection_cancels_pending_recovery() {
        let (controller, _) = manual();
        controller.effective_limit("p", "m", 4);
        controller.record_429("p", "m");
        controller.record_success("p", "m");
        assert!(controller.learned_limit("p", "m").unwrap().recovery_scheduled);

        controller.record_429("p", "m");
        assert!(!controller.learned_limit("p", "m").unwrap().recovery_scheduled);
    }

    #[test]
    fn recovery_steps_back_to_original_limit() {
        let (controller, clock) = manual();
        controller.effective_limit("p", "m", 8);
        for _ in 0..3 {
            controller.record_429("p", "m");
        }
        // 8 -> 5 -> 3 -> 2 -> 1 (penalty).
        assert_eq!(controller.learned_limit("p", "m").unwrap().concurrency, 1);
        controller.record_success("p", "m");

        assert_eq!(controller.recover_due(), 0, "interval has not elapsed");

        let mut observed = vec![1];
        for _ in 0..6 {
            clock.advance(Duration::from_secs(30));
            controller.recover_due();
            observed.push(controller.learned_limit("p", "m").unwrap().concurrency);
        }

        assert_eq!(observed, vec![1, 2, 3, 4, 6, 8, 8]);
        let record = controller.learned_limit("p", "m").unwrap();
        assert!(!record.recovery_scheduled);
        assert!(record.last_recovery_at.is_some());
    }

    #[test]
    fn recovery_honors_reconfigured_interval() {
        let (controller, clock) = manual();
        controller.configure_recovery(
            RecoveryConfigUpdate::builder()
                .recovery_interval(Duration::from_secs(5))
                .build(),
        );
        controller.effective_limit("p", "m", 4);
        controller.record_429("p", "m");
        controller.record_success("p", "m");

        clock.advance(Duration::from_secs(5));
        assert_eq!(controller.recover_due(), 1);
        assert_eq!(controller.learned_limit("p", "m").unwrap().concurrency, 3);
    }

    #[test]
    fn keys_are_case_insensitive() {
        let (controller, _) = manual();
        assert_eq!(
            controller.effective_limit("Anthropic", "Claude-X", 4),
            controller.effective_limit("anthropic", "claude-x", 4),
        );

        controller.record_429("ANTHROPIC", "CLAUDE-X");
        assert_eq!(
            controller.learned_limit("anthropic", "claude-x").unwrap().total_429_count,
            1
        );
    }

    #[test]
    fn global_multiplier_is_clamped() {
        let (controller, _) = manual();

        controller.set_global_multiplier(10.0);
        assert_eq!(controller.global_multiplier(), MAX_GLOBAL_MULTIPLIER);
        assert!(controller.effective_limit("a", "b", 4) <= 8);

        controller.set_global_multiplier(0.5);
        assert_eq!(controller.effective_limit("c", "d", 4), 2);

        controller.set_global_multiplier(-3.0);
        assert_eq!(controller.global_multiplier(), MIN_GLOBAL_MULTIPLIER);
        assert_eq!(controller.effective_limit("c", "d", 4), 1);

        controller.set_global_multiplier(f64::NAN);
        assert_eq!(controller.global_multiplier(), 1.0);
    }

    #[test]
    fn reset_restores_a_clean_record() {
        let (controller, _) = manual();
        controller.effective_limit("p", "m", 4);
        for _ in 0..5 {
            controller.record_429("p", "m");
        }
        controller.record_success("p", "m");

        controller.reset_learned_limit("p", "m", 4);
        let record = controller.learned_limit("p", "m").unwrap();
        assert_eq!(record.concurrency, 4);
        assert_eq!(record.original_limit, 4);
        assert_eq!(record.consecutive_429_count, 0);
        assert_eq!(record.total_429_count, 0);
        assert!(record.historical_429s.is_empty());
        assert!(!record.recovery_scheduled);
        assert_eq!(record.last_recovery_at, None);
    }

    #[test]
    fn reset_all_forgets_every_key() {
        let (controller, _) = manual();
        controller.record_429("a", "1");
        controller.record_429("b", "2");

        controller.reset_all_learned_limits();
        assert!(controller.learned_limit("a", "1").is_none());
        assert_eq!(controller.effective_limit("b", "2", 6), 6);
    }

    #[test]
    fn probability_is_zero_without_history_and_grows_with_rejections() {
        let (controller, _) = manual();
        assert_eq!(controller.analyze_429_probability("p", "m"), 0.0);
        controller.effective_limit("p", "m", 4);
        assert_eq!(controller.analyze_429_probability("p", "m"), 0.0);

        let mut previous = 0.0;
        for _ in 0..4 {
            controller.record_429("p", "m");
            let probability = controller.analyze_429_probability("p", "m");
            assert!(probability > previous);
            previous = probability;
        }
    }

    #[test]
    fn probability_decays_with_time() {
        let (controller, clock) = manual();
        controller.record_429("p", "m");
        let fresh = controller.analyze_429_probability("p", "m");

        clock.advance(Duration::from_secs(120));
        let later = controller.analyze_429_probability("p", "m");
        assert!(later < fresh);
        assert!(later > 0.0);
    }

    #[test]
    fn predictive_analysis_for_unseen_key_is_neutral_and_read_only() {
        let (controller, _) = manual();
        controller.set_global_multiplier(0.5);

        let analysis = controller.predictive_analysis("p", "m", 8);
        assert_eq!(analysis, PredictiveAnalysis::neutral(4));
        assert!(controller.learned_limit("p", "m").is_none());
    }

    #[test]
    fn predictive_analysis_throttles_after_a_burst() {
        let (controller, _) = manual();
        controller.effective_limit("p", "m", 100);
        controller.record_429("p", "m");

        let mild = controller.predictive_analysis("p", "m", 100);
        assert!(!mild.should_proactively_throttle);
        assert!(mild.recommended_concurrency < 70);

        controller.record_429("p", "m");
        controller.record_429("p", "m");
        let burst = controller.predictive_analysis("p", "m", 100);
        assert!(burst.should_proactively_throttle);
        assert!(burst.recommended_concurrency >= 1);
        assert!(burst.predicted_429_probability > mild.predicted_429_probability);
    }

    #[test]
    fn combined_summary_aggregates_without_mutation() {
        let (controller, clock) = manual();

        let unseen = controller.combined_summary("p", "m", 6);
        assert_eq!(unseen.adaptive_limit, 6);
        assert_eq!(unseen.original_limit, 6);
        assert_eq!(unseen.predictive_limit, 6);
        assert_eq!(unseen.recent_429_count, 0);
        assert!(controller.learned_limit("p", "m").is_none());

        controller.effective_limit("p", "m", 10);
        controller.record_429("p", "m");
        clock.advance(Duration::from_secs(120));
        controller.record_429("p", "m");

        let summary = controller.combined_summary("p", "m", 10);
        assert_eq!(summary.adaptive_limit, controller.effective_limit("p", "m", 10));
        assert_eq!(summary.original_limit, 10);
        assert_eq!(summary.recent_429_count, 1);
        assert_eq!(
            summary.predicted_429_probability,
            controller.analyze_429_probability("p", "m")
        );
        assert!(summary.predictive_limit <= summary.adaptive_limit);

        let json = serde_json::to_value(summary).unwrap();
        assert_eq!(json["original_limit"], 10);
    }

    #[test]
    fn configure_recovery_merges_partially() {
        let (controller, _) = manual();
        controller.configure_recovery(
            RecoveryConfigUpdate::builder()
                .reduction_factor(0.5)
                .build(),
        );

        let config = controller.recovery_config();
        assert_eq!(config.reduction_factor, 0.5);
        assert_eq!(config.recovery_factor, 1.5);
        assert_eq!(config.recovery_interval, Duration::from_secs(30));

        controller.effective_limit("p", "m", 8);
        controller.record_429("p", "m");
        assert_eq!(controller.learned_limit("p", "m").unwrap().concurrency, 4);
    }

    #[test]
    fn shutdown_discards_state_and_configuration() {
        let (controller, _) = manual();
        controller.record_429("p", "m");
        controller.set_global_multiplier(2.0);
        controller.configure_recovery(RecoveryConfigUpdate::builder().recovery_factor(3.0).build());

        controller.shutdown();

        assert!(controller.learned_limit("p", "m").is_none());
        assert_eq!(controller.global_multiplier(), 1.0);
        assert_eq!(controller.recovery_config(), RecoveryConfig::default());
    }

    #[test]
    fn clones_share_learned_state() {
        let (controller, _) = manual();
        let other = controller.clone();
        other.record_429("p", "m");
        assert!(controller.learned_limit("p", "m").is_some());
    }

    #[test]
    fn emits_rejection_metrics() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let (controller, _) = manual();
            controller.record_429("p", "m");
            controller.record_429("p", "m");
        });

        let rejections = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == "adaptive_rate_429_total")
            .map(|(_, _, _, value)| value);
        assert_eq!(rejections, Some(DebugValue::Counter(2)));
    }

    #[derive(Debug, snafu::Snafu)]
    #[snafu(display("provider said: {body}"))]
    struct CallError {
        body: String,
    }

    #[tokio::test]
    async fn observe_feeds_outcomes_back() {
        let (controller, _) = manual();
        controller.effective_limit("p", "m", 4);

        let rejected: Result<(), CallError> = controller
            .observe("p", "m", async {
                Err(CallError {
                    body: "429 Too Many Requests".to_owned(),
                })
            })
            .await;
        assert!(rejected.is_err());
        assert_eq!(controller.learned_limit("p", "m").unwrap().total_429_count, 1);

        let unrelated: Result<(), CallError> = controller
            .observe("p", "m", async {
                Err(CallError {
                    body: "invalid api key".to_owned(),
                })
            })
            .await;
        assert!(unrelated.is_err());
        assert_eq!(controller.learned_limit("p", "m").unwrap().consecutive_429_count, 1);

        let value = controller
            .observe("p", "m", async { Ok::<_, CallError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        let record = controller.learned_limit("p", "m").unwrap();
        assert_eq!(record.consecutive_429_count, 0);
        assert!(record.recovery_scheduled);
    }

    #[tokio::test]
    async fn background_recovery_follows_tokio_time() {
        tokio::time::pause();
        let controller = RateLimitController::default();
        controller.effective_limit("p", "m", 4);
        controller.record_429("p", "m");
        controller.record_success("p", "m");
        let degraded = controller.learned_limit("p", "m").unwrap().concurrency;
        assert_eq!(degraded, 2);

        let handle = controller.start_recovery();
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_secs(40)).await;
        let recovered = controller.learned_limit("p", "m").unwrap().concurrency;
        assert!(recovered > degraded);
        assert!(recovered <= 4);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn controller_shutdown_stops_recovery_tasks() {
        let controller = RateLimitController::default();
        let handle = controller.start_recovery();

        controller.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("recovery task should stop after controller shutdown");
    }
}
