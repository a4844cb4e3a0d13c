//! LLM capability boundary (spec §6, §9).
//!
//! A single abstract interface so the rest of the pipeline never depends on
//! a vendor SDK directly — mirroring the teacher's habit of hiding external
//! services behind a small trait (`autonomous::branch_manager::GitExecutor`)
//! and the graceful-degradation style of `agents::mem0_client::Mem0Client`
//! (an optional HTTP-backed capability that the caller can query for
//! availability and otherwise fall back around).
//!
//! Two methods, matching spec §6 exactly:
//! - `complete(system, user, temperature, seed) -> String`
//! - `generate(user, temperature) -> JSON string`
//!
//! Providers may be swapped by configuration (`LLM_PROVIDER`); vendor SDKs
//! themselves are out of scope (spec §1) — `HttpLlmProvider` speaks the
//! OpenAI-compatible chat-completions wire format directly over `reqwest`,
//! which is sufficient to cover both recognized providers without pulling in
//! a vendor crate.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::config::HealerConfig;

/// Distinguishes a rate-limit/quota failure from any other LLM error so the
/// caller can flip `RunState.fallback_triggered` (spec §4.4, §4.5, §7)
/// without string-matching at every call site.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited or quota exceeded: {0}")]
    RateLimited(String),
    #[error("LLM request failed: {0}")]
    Other(String),
}

impl LlmError {
    /// Classify a raw error string per spec §4.4: "429" / "quota" / "rate".
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("429") || lower.contains("quota") || lower.contains("rate") {
            LlmError::RateLimited(message.to_string())
        } else {
            LlmError::Other(message.to_string())
        }
    }
}

/// The abstract LLM capability. Implementors may call out to any vendor;
/// the rest of the pipeline only ever sees this trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// A single chat-style completion call with explicit temperature and
    /// deterministic seed (spec §4.5, §6).
    async fn complete(
        &self,
        system: &str,
        user: &str,
        temperature: f64,
        seed: u64,
    ) -> Result<String, LlmError>;

    /// Convenience wrapper used by callers that only need a JSON-schema
    /// response with no separate system prompt (spec §6, used by the
    /// Classifier's proactive scan and the Resolver's per-file analysis).
    async fn generate(&self, user: &str, temperature: f64) -> Result<String, LlmError> {
        self.complete(
            "Respond with strict JSON only, matching the schema described in the prompt. \
             No prose, no markdown fences.",
            user,
            temperature,
            42,
        )
        .await
    }
}

/// Speaks the OpenAI-compatible `/chat/completions` wire format.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpLlmProvider {
    pub fn new(config: &HealerConfig) -> Result<Self> {
        let api_key = config
            .llm_api_key
            .clone()
            .context("no LLM API key configured")?;
        let client = reqwest::Client::builder()
            .timeout(config.llm_request_timeout)
            .build()
            .context("failed to build LLM HTTP client")?;
        let endpoint = match config.llm_provider {
            crate::config::LlmProviderKind::Anthropic => {
                "https://api.anthropic.com/v1/messages".to_string()
            }
            _ => "https://api.openai.com/v1/chat/completions".to_string(),
        };
        Ok(Self {
            client,
            endpoint,
            api_key,
            model: config.llm_model.clone(),
        })
    }

    /// Build a provider against an arbitrary endpoint (used by tests against
    /// a `wiremock` server).
    pub fn with_endpoint(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        temperature: f64,
        seed: u64,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "temperature": temperature,
            "seed": seed,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::classify(&e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::classify(&e.to_string()))?;

        if !status.is_success() {
            return Err(LlmError::classify(&format!("HTTP {status}: {text}")));
        }

        extract_message_content(&text).ok_or_else(|| {
            LlmError::Other("LLM response did not contain a message body".to_string())
        })
    }
}

/// Pulls `choices[0].message.content` out of an OpenAI-shaped response body.
fn extract_message_content(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

/// Deterministic mock used when no provider is configured, and in tests.
/// Always returns a canned response driven by a closure so tests can script
/// specific behaviors (including simulated rate limits).
pub struct MockLlmProvider<F>
where
    F: Fn(&str, &str) -> Result<String, LlmError> + Send + Sync,
{
    responder: F,
}

impl<F> MockLlmProvider<F>
where
    F: Fn(&str, &str) -> Result<String, LlmError> + Send + Sync,
{
    pub fn new(responder: F) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl<F> LlmProvider for MockLlmProvider<F>
where
    F: Fn(&str, &str) -> Result<String, LlmError> + Send + Sync,
{
    async fn complete(
        &self,
        system: &str,
        user: &str,
        _temperature: f64,
        _seed: u64,
    ) -> Result<String, LlmError> {
        (self.responder)(system, user)
    }
}

/// Builds the configured provider, returning `None` when the pipeline should
/// run in fallback (rule-engine-only) mode from the start (spec §4.4, §4.5).
pub fn build_provider(config: &HealerConfig) -> Option<Box<dyn LlmProvider>> {
    if !config.llm_enabled() {
        return None;
    }
    match HttpLlmProvider::new(config) {
        Ok(p) => Some(Box::new(p)),
        Err(e) => {
            tracing::warn!(error = %e, "failed to construct LLM provider, degrading to fallback");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_messages() {
        assert!(matches!(LlmError::classify("HTTP 429: too many requests"), LlmError::RateLimited(_)));
        assert!(matches!(LlmError::classify("quota exceeded for org"), LlmError::RateLimited(_)));
        assert!(matches!(LlmError::classify("rate limit hit"), LlmError::RateLimited(_)));
        assert!(matches!(LlmError::classify("connection reset"), LlmError::Other(_)));
    }

    #[tokio::test]
    async fn mock_provider_returns_scripted_response() {
        let provider = MockLlmProvider::new(|_sys, _user| Ok("FIX_DESCRIPTION: test\n```\ncode\n```".to_string()));
        let out = provider.complete("sys", "user", 0.7, 42).await.unwrap();
        assert!(out.contains("FIX_DESCRIPTION"));
    }

    #[tokio::test]
    async fn mock_provider_can_simulate_rate_limit() {
        let provider = MockLlmProvider::new(|_sys, _user| {
            Err(LlmError::classify("HTTP 429: rate limited"))
        });
        let err = provider.complete("sys", "user", 0.7, 42).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited(_)));
    }

    #[test]
    fn extracts_message_content_from_openai_shape() {
        let body = r#"{"choices":[{"message":{"content":"hello"}}]}"#;
        assert_eq!(extract_message_content(body), Some("hello".to_string()));
    }
}
