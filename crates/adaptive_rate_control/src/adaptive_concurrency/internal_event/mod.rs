//! Metrics and log records for controller and executor state changes.

mod adaptive_rate;

pub use adaptive_rate::{
    ExecutorFinished, ExecutorInFlight, GlobalMultiplierChanged, LearnedLimitReset,
    PredictionComputed, RateLimitObserved, RecoveryArmed, RecoveryStepped,
};

/// An observable event. Emitting records its metrics and logs it.
pub trait InternalEvent: Sized {
    fn emit(self);
}

pub(crate) fn emit(event: impl InternalEvent) {
    event.emit();
}
