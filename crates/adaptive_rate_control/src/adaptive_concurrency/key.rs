use std::fmt;

use serde::Serialize;

/// Canonical identity of a remote service: a provider and one of its models.
///
/// Both parts are trimmed and lower-cased, so `"Anthropic"`/`"Claude-X"` and
/// `" anthropic "`/`"claude-x"` address the same learned limit. Empty parts are valid
/// and distinct from every non-empty part.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProviderKey {
    provider: String,
    model: String,
}

impl ProviderKey {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: normalize(provider),
            model: normalize(model),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

fn normalize(part: &str) -> String {
    part.trim().to_lowercase()
}
