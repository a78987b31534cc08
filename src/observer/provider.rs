// The Observer capability (§4.6 step 7): a trait so the pipeline doesn't
// care whether parsing comes from a hosted chat-completions endpoint, a
// local model, or (in tests) a fixture. `HttpObserver` talks to an
// OpenAI-compatible `/chat/completions` endpoint and expects the model to
// return a JSON object matching `ParsedOutput`, the same "ask the model for
// structured JSON, parse defensively" posture `embeddings::Embedder` uses
// for its own HTTP calls.

use super::types::{ObserverContext, ObserverUsage, ParsedOutput};
use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 2;

#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, context: &ObserverContext) -> Result<ParsedOutput>;
}

#[derive(Debug, Clone)]
pub struct HttpObserverConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: usize,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl HttpObserverConfig {
    pub fn from_config(config: &Config) -> Self {
        HttpObserverConfig {
            base_url: config.observer_provider.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: config.observer_model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
            api_key: config.observer_api_key.clone(),
            max_tokens: config.observer_max_tokens,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

pub struct HttpObserver {
    client: reqwest::Client,
    config: HttpObserverConfig,
}

const SYSTEM_PROMPT: &str = "You summarize one turn of an autonomous coding agent's work into structured memory. \
Respond with a single JSON object: {\"observations\": [{\"kind\": one of observation|entities|note|decision|discovery|change|feature|bugfix|refactor|exploration, \
\"title\": string, \"narrative\": string, \"facts\": [string], \"concepts\": [string], \"files_read\": [string], \"files_modified\": [string], \"confidence\": number 0-1}], \
\"summary\": {\"request\": string, \"investigated\": string, \"learned\": string, \"completed\": string, \"next_steps\": string, \"notes\": string, \"files_read\": [string], \"files_edited\": [string]} or null, \
\"skip_summary_reason\": string or null}. Emit no observations for trivial turns. Never include prose outside the JSON object.";

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl HttpObserver {
    pub fn new(config: HttpObserverConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(HttpObserver { client, config })
    }

    fn user_message(context: &ObserverContext) -> String {
        let mut body = format!("project: {}\nprompt_number: {}\n\n", context.project.as_deref().unwrap_or("unknown"), context.prompt_number.unwrap_or(0));
        body.push_str("user_prompt:\n");
        body.push_str(&context.user_prompt);
        body.push_str("\n\n");
        if let Some(diff) = &context.diff_summary {
            body.push_str("diff_summary:\n");
            body.push_str(diff);
            body.push_str("\n\n");
        }
        if !context.recent_files.is_empty() {
            body.push_str("recent_files: ");
            body.push_str(&context.recent_files.join(", "));
            body.push_str("\n\n");
        }
        body.push_str("tool_events:\n");
        for event in &context.tool_events {
            body.push_str(&format!("- {} {:?}\n", event.tool, event.title));
        }
        if let Some(message) = &context.last_assistant_message {
            body.push_str("\nlast_assistant_message:\n");
            body.push_str(message);
        }
        body
    }
}

#[async_trait]
impl Observer for HttpObserver {
    async fn observe(&self, context: &ObserverContext) -> Result<ParsedOutput> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::user_message(context)},
            ],
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut req = self.client.post(&url).json(&body);
            if let Some(key) = &self.config.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: ChatCompletionResponse = resp.json().await?;
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .ok_or_else(|| Error::ObserverFailure("empty chat completion response".to_string()))?;

                    let mut output: ParsedOutput = serde_json::from_str(content.trim()).map_err(|e| {
                        Error::ObserverFailure(format!("observer returned non-conforming JSON: {e}"))
                    })?;
                    if let Some(usage) = parsed.usage {
                        output.usage = Some(ObserverUsage {
                            prompt_tokens: usage.prompt_tokens,
                            completion_tokens: usage.completion_tokens,
                            total_tokens: usage.total_tokens,
                        });
                    }
                    return Ok(output);
                }
                Ok(resp) if resp.status().is_server_error() && attempt <= self.config.max_retries => {
                    tracing::warn!(status = %resp.status(), attempt, "observer request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(Error::ObserverFailure(format!("observer request failed: {status} {text}")));
                }
                Err(e) if attempt <= self.config.max_retries => {
                    tracing::warn!(error = %e, attempt, "observer request error, retrying");
                    tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                }
                Err(e) => return Err(Error::ObserverFailure(format!("observer request error: {e}"))),
            }
        }
    }
}
