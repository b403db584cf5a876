use std::error::Error as StdError;

/// Substrings, matched case-insensitively, that mark an error as a rate-limit rejection.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "rate-limit",
    "ratelimit",
    "quota exceeded",
];

/// Anything a caller may hand to the classifier.
///
/// Callers rarely control the error type their transport produces, so the classifier
/// accepts structured errors, bare messages, and the absence of an error alike.
#[derive(Clone, Copy, Debug)]
pub enum RateLimitSignal<'a> {
    /// A structured error. Its whole `source()` chain is inspected.
    Error(&'a (dyn StdError + 'static)),
    /// A plain message, e.g. a response body.
    Message(&'a str),
    /// Nothing to classify.
    Absent,
}

impl<'a> RateLimitSignal<'a> {
    pub fn from_error<E>(error: &'a E) -> Self
    where
        E: StdError + 'static,
    {
        Self::Error(error)
    }

    /// The text the heuristic runs over, or `None` for [`RateLimitSignal::Absent`].
    ///
    /// For structured errors this joins the error and every cause in its chain, so a
    /// `429` buried under several layers of wrapping is still visible.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Error(error) => {
                let mut message = error.to_string();
                let mut cause = error.source();
                while let Some(inner) = cause {
                    message.push_str(": ");
                    message.push_str(&inner.to_string());
                    cause = inner.source();
                }
                Some(message)
            }
            Self::Message(message) => Some((*message).to_owned()),
            Self::Absent => None,
        }
    }
}

impl<'a> From<&'a str> for RateLimitSignal<'a> {
    fn from(message: &'a str) -> Self {
        Self::Message(message)
    }
}

impl<'a> From<&'a String> for RateLimitSignal<'a> {
    fn from(message: &'a String) -> Self {
        Self::Message(message.as_str())
    }
}

impl<'a> From<&'a (dyn StdError + 'static)> for RateLimitSignal<'a> {
    fn from(error: &'a (dyn StdError + 'static)) -> Self {
        Self::Error(error)
    }
}

impl<'a> From<&'a (dyn StdError + Send + Sync + 'static)> for RateLimitSignal<'a> {
    fn from(error: &'a (dyn StdError + Send + Sync + 'static)) -> Self {
        Self::Error(error)
    }
}

impl<'a, T> From<Option<T>> for RateLimitSignal<'a>
where
    T: Into<RateLimitSignal<'a>>,
{
    fn from(signal: Option<T>) -> Self {
        signal.map_or(Self::Absent, Into::into)
    }
}

/// Returns `true` when the signal looks like a rate-limit or quota rejection.
///
/// This is a text heuristic, not a protocol-level status check: it never fails and
/// returns `false` for [`RateLimitSignal::Absent`].
///
/// ```
/// use adaptive_rate_control::adaptive_concurrency::is_rate_limit_error;
///
/// assert!(is_rate_limit_error("HTTP 429 Too Many Requests"));
/// assert!(is_rate_limit_error("Rate-Limit reached for requests"));
/// assert!(!is_rate_limit_error("connection reset by peer"));
/// assert!(!is_rate_limit_error(None::<&str>));
/// ```
pub fn is_rate_limit_error<'a>(signal: impl Into<RateLimitSignal<'a>>) -> bool {
    signal
        .into()
        .message()
        .is_some_and(|message| matches_rate_limit(&message))
}

/// [`is_rate_limit_error`] for a concrete error value.
pub fn is_rate_limit_error_value<E>(error: &E) -> bool
where
    E: StdError + 'static,
{
    is_rate_limit_error(RateLimitSignal::from_error(error))
}

fn matches_rate_limit(message: &str) -> bool {
    let message = message.to_lowercase();
    RATE_LIMIT_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
}
