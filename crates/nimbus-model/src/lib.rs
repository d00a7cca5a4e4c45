// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod sanitize;
mod types;
mod provider;
mod mock;

pub use catalog::{ModelCatalogEntry, InputModality};
pub use types::*;
pub use provider::{ModelProvider, ResponseStream};
pub use mock::{MockProvider, ScriptedMockProvider};

use anyhow::bail;
use nimbus_config::ModelCandidate;

/// Construct a boxed [`ModelProvider`] from a resolved model candidate.
///
/// Only the `mock` driver is bundled here: the wire adapters that speak to
/// real hosted model APIs are external collaborators plugged in by the
/// embedder, not part of this crate's scope. Any other `provider` value is
/// rejected with a clear error rather than silently falling back to mock.
pub fn from_candidate(cfg: &ModelCandidate) -> anyhow::Result<Box<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Box::new(MockProvider)),
        other => bail!(
            "unknown model provider '{other}' — no wire adapter bundled; \
             plug in an external ModelProvider implementation for this provider"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(provider: &str, name: &str) -> ModelCandidate {
        ModelCandidate {
            provider: provider.into(),
            name: name.into(),
            api_key_env: None,
            base_url: None,
            max_tokens: 4096,
        }
    }

    #[test]
    fn from_candidate_mock_succeeds() {
        let cfg = candidate("mock", "mock-model");
        assert!(from_candidate(&cfg).is_ok());
    }

    #[test]
    fn from_candidate_unknown_provider_errors() {
        let cfg = candidate("openai", "gpt-4o");
        assert!(from_candidate(&cfg).is_err());
    }
}
