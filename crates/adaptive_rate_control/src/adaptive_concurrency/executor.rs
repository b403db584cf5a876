use std::{
    fmt::{Debug, Display},
    future::Future,
};

use bon::Builder;
use futures::stream::{FuturesUnordered, StreamExt};
use snafu::Snafu;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::internal_event::{ExecutorFinished, ExecutorInFlight, emit};

/// How a bounded batch reacts to failures and outside cancellation.
#[derive(Clone, Debug, Builder)]
pub struct ExecutionOptions {
    /// Stop dispatching new items after the first worker error. In-flight items are
    /// still awaited before the error is returned.
    ///
    /// **Default**: true
    #[builder(default = true)]
    pub abort_on_error: bool,

    /// Checked before every dispatch. Once cancelled, no further item is started.
    pub cancellation: Option<CancellationToken>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            abort_on_error: true,
            cancellation: None,
        }
    }
}

/// Why a bounded batch did not produce a full result vector.
#[derive(Debug, Snafu)]
pub enum ExecutorError<E>
where
    E: Debug + Display,
{
    /// The first worker failure of the batch. Later failures are logged and dropped.
    #[snafu(display("Task {index} failed: {error}"))]
    Worker { index: usize, error: E },

    #[snafu(display("Batch cancelled before every task was dispatched"))]
    Cancelled,
}

impl<E> ExecutorError<E>
where
    E: Debug + Display,
{
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Index of the failed item, if a worker failed.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Worker { index, .. } => Some(*index),
            Self::Cancelled => None,
        }
    }

    pub fn into_worker_error(self) -> Option<E> {
        match self {
            Self::Worker { error, .. } => Some(error),
            Self::Cancelled => None,
        }
    }
}

/// Turn a requested concurrency into a slot count for `len` items.
///
/// NaN, zero and negative values give 1, fractions are truncated, and anything above
/// `len` (including infinity) gives `len`. The result is never below 1.
///
/// ```rust
/// use adaptive_rate_control::adaptive_concurrency::normalize_limit;
///
/// assert_eq!(normalize_limit(2.9, 10), 2);
/// assert_eq!(normalize_limit(f64::INFINITY, 10), 10);
/// assert_eq!(normalize_limit(f64::NAN, 10), 1);
/// assert_eq!(normalize_limit(-4.0, 10), 1);
/// ```
pub fn normalize_limit(limit: f64, len: usize) -> usize {
    let len = len.max(1);
    if limit.is_nan() || limit < 1.0 {
        return 1;
    }
    if limit >= len as f64 {
        return len;
    }
    (limit.trunc() as usize).clamp(1, len)
}

/// Run `worker` over `items` with at most `limit` invocations in flight.
///
/// Results come back in input order regardless of completion order. Every item is
/// handed to the worker at most once, together with its index. The batch runs on the
/// calling task; worker futures are polled cooperatively and need not be `'static`.
///
/// The first worker error becomes the batch's error. With
/// [`abort_on_error`](ExecutionOptions::abort_on_error) no new item is started after it,
/// otherwise the remaining items still run. A cancelled token stops dispatching; if it
/// was already cancelled no item is started at all. In-flight work is always awaited
/// before returning.
pub async fn run_with_concurrency_limit<T, R, E, F, Fut>(
    items: impl IntoIterator<Item = T>,
    limit: f64,
    mut worker: F,
    options: ExecutionOptions,
) -> Result<Vec<R>, ExecutorError<E>>
where
    F: FnMut(T, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Debug + Display,
{
    let items: Vec<T> = items.into_iter().collect();
    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let limit = normalize_limit(limit, total);
    let cancellation = options.cancellation.unwrap_or_default();
    if cancellation.is_cancelled() {
        debug!(message = "Batch cancelled before dispatch.", items = total);
        return CancelledSnafu.fail();
    }

    let started = Instant::now();
    let mut results: Vec<Option<R>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut pending = items.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    let mut failure: Option<ExecutorError<E>> = None;
    let mut cancelled = false;
    let mut completed = 0;

    loop {
        while in_flight.len() < limit && !cancelled {
            if failure.is_some() && options.abort_on_error {
                break;
            }
            let Some((index, item)) = pending.next() else {
                break;
            };
            if cancellation.is_cancelled() {
                debug!(message = "Batch cancelled; draining in-flight tasks.", index);
                cancelled = true;
                break;
            }
            trace!(message = "Dispatching task.", index);
            let task = worker(item, index);
            in_flight.push(async move { (index, task.await) });
            emit(ExecutorInFlight {
                in_flight: in_flight.len(),
            });
        }

        let Some((index, outcome)) = in_flight.next().await else {
            break;
        };
        match outcome {
            Ok(value) => {
                results[index] = Some(value);
                completed += 1;
            }
            Err(error) if failure.is_none() => {
                debug!(message = "Task failed.", index, %error);
                failure = Some(WorkerSnafu { index, error }.build());
            }
            Err(error) => {
                debug!(message = "Dropping error after first failure.", index, %error);
            }
        }
    }

    emit(ExecutorFinished {
        items: total,
        limit,
        completed,
        elapsed: started.elapsed(),
        failed: failure.is_some() || cancelled,
    });

    if let Some(failure) = failure {
        return Err(failure);
    }
    if cancelled {
        return CancelledSnafu.fail();
    }
    Ok(results.into_iter().flatten().collect())
}
