use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::InternalEvent;
use crate::adaptive_concurrency::ProviderKey;

#[derive(Clone, Copy, Debug)]
pub struct RateLimitObserved<'a> {
    pub key: &'a ProviderKey,
    pub concurrency: usize,
    pub original_limit: usize,
    pub consecutive_429_count: u32,
    pub total_429_count: u64,
}

impl InternalEvent for RateLimitObserved<'_> {
    fn emit(self) {
        warn!(
            target: "adaptive_rate::stats",
            message = "Rate limit observed; concurrency reduced.",
            provider = self.key.provider(),
            model = self.key.model(),
            concurrency = self.concurrency,
            original_limit = self.original_limit,
            consecutive_429s = self.consecutive_429_count,
            total_429s = self.total_429_count,
        );
        counter!(
            "adaptive_rate_429_total",
            "provider" => self.key.provider().to_owned(),
            "model" => self.key.model().to_owned()
        )
        .increment(1);
        concurrency_gauge(self.key).set(self.concurrency as f64);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RecoveryArmed<'a> {
    pub key: &'a ProviderKey,
    pub concurrency: usize,
    pub original_limit: usize,
}

impl InternalEvent for RecoveryArmed<'_> {
    fn emit(self) {
        debug!(
            target: "adaptive_rate::stats",
            message = "Recovery armed.",
            provider = self.key.provider(),
            model = self.key.model(),
            concurrency = self.concurrency,
            original_limit = self.original_limit,
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RecoveryStepped<'a> {
    pub key: &'a ProviderKey,
    pub from: usize,
    pub to: usize,
    pub original_limit: usize,
}

impl InternalEvent for RecoveryStepped<'_> {
    fn emit(self) {
        let complete = self.to >= self.original_limit;
        debug!(
            target: "adaptive_rate::stats",
            message = "Recovery step applied.",
            provider = self.key.provider(),
            model = self.key.model(),
            from = self.from,
            to = self.to,
            original_limit = self.original_limit,
            complete,
        );
        counter!(
            "adaptive_rate_recovery_steps_total",
            "provider" => self.key.provider().to_owned(),
            "model" => self.key.model().to_owned()
        )
        .increment(1);
        concurrency_gauge(self.key).set(self.to as f64);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LearnedLimitReset<'a> {
    pub key: &'a ProviderKey,
    pub original_limit: usize,
}

impl InternalEvent for LearnedLimitReset<'_> {
    fn emit(self) {
        info!(
            target: "adaptive_rate::stats",
            message = "Learned limit reset.",
            provider = self.key.provider(),
            model = self.key.model(),
            original_limit = self.original_limit,
        );
        concurrency_gauge(self.key).set(self.original_limit as f64);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GlobalMultiplierChanged {
    pub requested: f64,
    pub applied: f64,
}

impl InternalEvent for GlobalMultiplierChanged {
    fn emit(self) {
        if self.requested == self.applied {
            info!(message = "Global multiplier updated.", multiplier = self.applied);
        } else {
            warn!(
                message = "Global multiplier out of range; clamped.",
                requested = self.requested,
                applied = self.applied,
            );
        }
        gauge!("adaptive_rate_global_multiplier").set(self.applied);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PredictionComputed<'a> {
    pub key: &'a ProviderKey,
    pub probability: f64,
}

impl InternalEvent for PredictionComputed<'_> {
    fn emit(self) {
        // Histogram: one key is usually analyzed many times per reporting interval.
        histogram!(
            "adaptive_rate_predicted_429_probability",
            "provider" => self.key.provider().to_owned(),
            "model" => self.key.model().to_owned()
        )
        .record(self.probability);
        trace!(
            target: "adaptive_rate::stats",
            provider = self.key.provider(),
            model = self.key.model(),
            probability = self.probability,
            "Rejection probability computed"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ExecutorInFlight {
    pub in_flight: usize,
}

impl InternalEvent for ExecutorInFlight {
    fn emit(self) {
        histogram!("adaptive_rate_executor_in_flight").record(self.in_flight as f64);
        trace!(target: "adaptive_rate::stats", in_flight = self.in_flight, "In-flight Updated");
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ExecutorFinished {
    pub items: usize,
    pub limit: usize,
    pub completed: usize,
    pub elapsed: Duration,
    pub failed: bool,
}

impl InternalEvent for ExecutorFinished {
    fn emit(self) {
        debug!(
            message = "Bounded batch settled.",
            items = self.items,
            limit = self.limit,
            completed = self.completed,
            elapsed_ms = self.elapsed.as_millis() as u64,
            failed = self.failed,
        );
        histogram!("adaptive_rate_executor_batch_duration_seconds").record(self.elapsed);
    }
}

fn concurrency_gauge(key: &ProviderKey) -> metrics::Gauge {
    gauge!(
        "adaptive_rate_concurrency",
        "provider" => key.provider().to_owned(),
        "model" => key.model().to_owned()
    )
}
