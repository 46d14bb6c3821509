//! Chat-completion providers.
//!
//! [`ChatProvider`] is the seam between the answer orchestrator and the
//! model that writes the answer:
//! - **[`OpenAIChat`]** calls `POST {base_url}/chat/completions`, retrying
//!   rate limits, server errors and network failures with the same backoff
//!   as the embedding client.
//! - **[`ExtractiveChat`]** runs offline. It answers by quoting the context
//!   blocks of the prompt verbatim, with their source file names.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::answer::{context_blocks, has_claim_section, ContextBlock};
use crate::config::GenerationConfig;
use crate::embedding::backoff_delay;
use crate::error::{Result, VerifyError};

/// A model that turns a system prompt and a user message into text.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Create the configured [`ChatProvider`].
pub fn create_chat_provider(config: &GenerationConfig) -> Result<Arc<dyn ChatProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "extractive" => Ok(Arc::new(ExtractiveChat)),
        other => Err(VerifyError::InvalidArgument(format!(
            "Unknown generation provider: {}",
            other
        ))),
    }
}

// ============ OpenAI Provider ============

pub struct OpenAIChat {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    max_retries: u32,
}

impl OpenAIChat {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                VerifyError::generation(
                    "OpenAI",
                    format!("{} environment variable not set", config.api_key_env),
                )
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VerifyError::generation("OpenAI", e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

fn completion_text(response: ChatResponse) -> Option<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

#[async_trait]
impl ChatProvider for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        debug!(provider = "OpenAI", model = %self.model, prompt_chars = user.len(), "requesting completion");

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: ChatResponse = response.json().await.map_err(|e| {
                            VerifyError::generation("OpenAI", format!("failed to parse response: {e}"))
                        })?;
                        return completion_text(parsed).ok_or_else(|| {
                            VerifyError::generation("OpenAI", "model returned an empty completion")
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(provider = "OpenAI", %status, attempt, "retryable completion error");
                        last_err = Some(format!("API returned {}: {}", status, body_text));
                        continue;
                    }

                    return Err(VerifyError::generation(
                        "OpenAI",
                        format!("API returned {}: {}", status, body_text),
                    ));
                }
                Err(e) => {
                    warn!(provider = "OpenAI", error = %e, attempt, "completion request failed");
                    last_err = Some(format!("request failed: {e}"));
                }
            }
        }

        Err(VerifyError::generation(
            "OpenAI",
            last_err.unwrap_or_else(|| "completion failed after retries".to_string()),
        ))
    }
}

// ============ Extractive Provider ============

/// Offline provider that quotes the prompt's context instead of
/// generating text. It never judges the claim itself.
pub struct ExtractiveChat;

const EXCERPT_CHARS: usize = 320;

#[async_trait]
impl ChatProvider for ExtractiveChat {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, _system: &str, user: &str) -> Result<String> {
        let blocks = context_blocks(user);
        let Some(first) = blocks.first() else {
            return Ok(
                "I cannot confirm this from the knowledge base. Please consult official CPF sources."
                    .to_string(),
            );
        };

        if !has_claim_section(user) {
            return Ok(blocks
                .iter()
                .map(|b| format!("- {} ({})", excerpt(&b.text, EXCERPT_CHARS / 2), b.source_id))
                .collect::<Vec<_>>()
                .join("\n"));
        }

        let mut answer = format!(
            "The most relevant passage in the knowledge base reads: \"{}\" ({}).",
            excerpt(&first.text, EXCERPT_CHARS),
            first.source_id
        );
        let others = other_sources(&blocks);
        if !others.is_empty() {
            answer.push_str(&format!(" Related context: {}.", others.join(", ")));
        }
        answer.push_str(
            " Compare the claim against the quoted text to judge whether it is supported.",
        );
        Ok(answer)
    }
}

fn other_sources(blocks: &[ContextBlock]) -> Vec<String> {
    let mut seen = vec![blocks[0].source_id.as_str()];
    let mut out = Vec::new();
    for block in &blocks[1..] {
        if !seen.contains(&block.source_id.as_str()) {
            seen.push(&block.source_id);
            out.push(format!("({})", block.source_id));
        }
    }
    out
}

/// Leading sentences of `text`, on one line, cut to at most `max` chars.
fn excerpt(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }

    let cut: String = flat.chars().take(max).collect();
    if let Some(pos) = cut.rfind(". ").filter(|&pos| pos > max / 3) {
        return cut[..=pos].to_string();
    }
    let base = match cut.rfind(' ') {
        Some(pos) if pos > 0 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}...", base.trim_end())
}
