/// Provider client — one operation, two wire shapes.
///
/// The annotator needs exactly one thing from a provider: send a system
/// prompt plus a user message, get text back. That's a tagged union with an
/// `annotate` method, not a trait hierarchy. No streaming — the response is a
/// single JSON document and the caller isn't interactive.
use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::time::Duration;

use crate::config::{Config, ProviderKind};

const MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT_SECS: u64 = 60;

const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

// ── Provider ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Provider {
    Anthropic { base: String, key: String, model: String },
    OpenAiCompat { base: String, key: String, model: String },
}

impl Provider {
    /// Resolve the provider from config. Fails when no API key can be found —
    /// that failure belongs to the detached annotate process, never a hook.
    pub fn from_config(config: &Config) -> Result<Self> {
        let key = config.resolved_api_key().ok_or_else(|| {
            anyhow!("no API key (set apiKey in config.json, or DISTILL_API_KEY / ANTHROPIC_API_KEY)")
        })?;
        let base = |default: &str| {
            config
                .api_base_url
                .clone()
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let model = |default: &str| {
            config
                .model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Ok(match config.provider {
            ProviderKind::Anthropic => Provider::Anthropic {
                base: base(ANTHROPIC_DEFAULT_BASE),
                key,
                model: model(ANTHROPIC_DEFAULT_MODEL),
            },
            ProviderKind::Openai => Provider::OpenAiCompat {
                base: base(OPENAI_DEFAULT_BASE),
                key,
                model: model(OPENAI_DEFAULT_MODEL),
            },
        })
    }

    /// Send one annotation request and return the raw response text.
    pub async fn annotate(&self, system: &str, user: &str) -> Result<String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        match self {
            Provider::Anthropic { base, key, model } => {
                let body = serde_json::json!({
                    "model": model,
                    "max_tokens": MAX_TOKENS,
                    "system": system,
                    "messages": [{"role": "user", "content": user}],
                });
                let resp = http
                    .post(format!("{}/messages", base.trim_end_matches('/')))
                    .header("x-api-key", key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("Content-Type", "application/json")
                    .json(&body)
                    .send()
                    .await?;
                let body = check_status(resp).await?;
                extract_anthropic_text(&body)
            }
            Provider::OpenAiCompat { base, key, model } => {
                let body = serde_json::json!({
                    "model": model,
                    "max_tokens": MAX_TOKENS,
                    "messages": [
                        {"role": "system", "content": system},
                        {"role": "user", "content": user},
                    ],
                });
                let resp = http
                    .post(format!("{}/chat/completions", base.trim_end_matches('/')))
                    .header("Authorization", format!("Bearer {key}"))
                    .header("Content-Type", "application/json")
                    .json(&body)
                    .send()
                    .await?;
                let body = check_status(resp).await?;
                extract_openai_text(&body)
            }
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        bail!("API error {status}: {text}");
    }
    Ok(resp.json().await?)
}

// ── Response extraction ───────────────────────────────────────────────────────

/// Anthropic returns `content` as a list of blocks; concatenate the text ones.
fn extract_anthropic_text(body: &Value) -> Result<String> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| anyhow!("no content blocks in response"))?;
    let text: String = blocks
        .iter()
        .filter_map(|b| b["text"].as_str())
        .collect();
    if text.is_empty() {
        bail!("response contained no text blocks");
    }
    Ok(text)
}

fn extract_openai_text(body: &Value) -> Result<String> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("no message content in response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_config_requires_key() {
        let config = Config {
            api_key: Some(String::new()),
            ..Config::default()
        };
        // Empty key counts as absent (env fallbacks aside)
        if std::env::var("DISTILL_API_KEY").is_err() && std::env::var("ANTHROPIC_API_KEY").is_err() {
            assert!(Provider::from_config(&config).is_err());
        }
    }

    #[test]
    fn test_from_config_defaults() {
        let config = Config {
            api_key: Some("sk-test".to_string()),
            ..Config::default()
        };
        match Provider::from_config(&config).unwrap() {
            Provider::Anthropic { base, key, model } => {
                assert_eq!(base, ANTHROPIC_DEFAULT_BASE);
                assert_eq!(key, "sk-test");
                assert_eq!(model, ANTHROPIC_DEFAULT_MODEL);
            }
            Provider::OpenAiCompat { .. } => panic!("expected anthropic"),
        }
    }

    #[test]
    fn test_from_config_openai_overrides() {
        let config = Config {
            provider: ProviderKind::Openai,
            api_key: Some("sk-test".to_string()),
            api_base_url: Some("http://localhost:8080/v1".to_string()),
            model: Some("local-model".to_string()),
            ..Config::default()
        };
        match Provider::from_config(&config).unwrap() {
            Provider::OpenAiCompat { base, model, .. } => {
                assert_eq!(base, "http://localhost:8080/v1");
                assert_eq!(model, "local-model");
            }
            Provider::Anthropic { .. } => panic!("expected openai"),
        }
    }

    #[test]
    fn test_extract_anthropic_text() {
        let body = json!({
            "content": [
                {"type": "text", "text": "{\"annotations\""},
                {"type": "text", "text": ": []}"},
            ]
        });
        assert_eq!(extract_anthropic_text(&body).unwrap(), "{\"annotations\": []}");

        let empty = json!({"content": []});
        assert!(extract_anthropic_text(&empty).is_err());
        assert!(extract_anthropic_text(&json!({})).is_err());
    }

    #[test]
    fn test_extract_openai_text() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "{}"}}]
        });
        assert_eq!(extract_openai_text(&body).unwrap(), "{}");
        assert!(extract_openai_text(&json!({"choices": []})).is_err());
    }
}
