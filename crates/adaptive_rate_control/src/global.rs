//! A process-wide controller for call sites that do not carry their own.
//!
//! The controller is built lazily from [`AdaptiveRateSettings::from_env`]. [`init`] also
//! starts its background recovery task when called inside a Tokio runtime; without
//! one, recovery only advances through [`RateLimitController::recover_due`].

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::adaptive_concurrency::{AdaptiveRateSettings, RateLimitController, RecoveryHandle};

static CONTROLLER: OnceLock<RateLimitController> = OnceLock::new();
static RECOVERY: Mutex<Option<RecoveryHandle>> = Mutex::new(None);

/// The shared controller, starting its recovery task if a runtime is available and
/// none is running yet.
pub fn init() -> RateLimitController {
    let controller = controller();
    let mut recovery = recovery_slot();
    if recovery.as_ref().is_some_and(RecoveryHandle::is_running) {
        return controller;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(_) => {
            *recovery = Some(controller.start_recovery());
            info!(message = "Global rate limit controller initialized.");
        }
        Err(_) => {
            debug!(message = "No Tokio runtime; global recovery task not started.");
        }
    }
    controller
}

/// The shared controller. Does not start recovery; see [`init`].
pub fn controller() -> RateLimitController {
    CONTROLLER
        .get_or_init(|| RateLimitController::new(AdaptiveRateSettings::from_env()))
        .clone()
}

/// Stop the recovery task and discard everything the shared controller has learned.
///
/// A later [`init`] starts over from a clean state.
pub fn shutdown() {
    drop(recovery_slot().take());
    if let Some(controller) = CONTROLLER.get() {
        controller.shutdown();
    }
}

fn recovery_slot() -> MutexGuard<'static, Option<RecoveryHandle>> {
    RECOVERY.lock().unwrap_or_else(PoisonError::into_inner)
}
