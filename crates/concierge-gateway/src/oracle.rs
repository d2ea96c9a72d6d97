//! OpenRouter-backed intent oracle.
//!
//! Sends the message and the capability menu to an OpenAI-compatible chat endpoint and
//! expects one JSON object back. The reply is untrusted: unknown capabilities are
//! dropped and the scope is never taken from it.
//!
//! API key: `OPENROUTER_API_KEY`. Model: `OPENROUTER_MODEL`, default `meta-llama/llama-3.3-70b-instruct`.

use async_trait::async_trait;
use concierge_core::config::OracleConfig;
use concierge_core::{Capability, IntentOracle, OracleError, OracleReply, StructuredIntent};
use serde::{Deserialize, Serialize};

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";

const SYSTEM_PROMPT: &str = "You classify messages sent to an advertising-results assistant. \
Reply with one JSON object and nothing else. Keys: \
\"capabilities\" (array, values from the offered menu), \
\"metrics\" (array of sales, revenue, spend, impressions, clicks, leads, ctr, cpc, cpm, roas), \
\"location\" (city name or null), \
\"time_signal\" (the time phrase exactly as written, or null), \
\"report\" (true when a full report is asked for), \
\"by_market\" (true when a per-city list is asked for), \
\"language\" (\"en\" or \"es\"), \
\"crm\" (null or {\"category\": contacts|conversations|calendars|opportunities|payments, \
\"action\": get|search|list|create|add_tag|send|update|delete|remove_tag, \"parameters\": {}}). \
Use an empty capabilities array when nothing on the menu applies.";

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: String,
}

/// Model reply: capability tags plus the structured intent fields at the top level.
#[derive(Debug, Deserialize)]
struct LlmIntent {
    #[serde(default)]
    capabilities: Vec<serde_json::Value>,
    #[serde(flatten)]
    intent: StructuredIntent,
}

pub struct OpenRouterOracle {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenRouterOracle {
    /// `None` when `OPENROUTER_API_KEY` is unset or blank.
    pub fn from_env(config: &OracleConfig) -> Option<Self> {
        let key = std::env::var("OPENROUTER_API_KEY").ok()?.trim().to_string();
        if key.is_empty() {
            return None;
        }
        let model = std::env::var("OPENROUTER_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Some(Self::new(key, model, config))
    }

    pub fn new(api_key: String, model: String, config: &OracleConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key: api_key.trim().to_string(),
            model,
            client,
        }
    }
}

#[async_trait]
impl IntentOracle for OpenRouterOracle {
    async fn interpret(&self, text: &str, menu: &[Capability]) -> Result<Option<OracleReply>, OracleError> {
        let menu_names: Vec<String> = menu
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("Menu: {}\nMessage: {}", menu_names.join(", "), text),
                },
            ],
            temperature: 0.0,
            max_tokens: 300,
        };

        let res = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "Concierge")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    OracleError::Transient(e.to_string())
                } else {
                    OracleError::Permanent(e.to_string())
                }
            })?;

        let status = res.status();
        if !status.is_success() {
            let detail = res.text().await.unwrap_or_default();
            let message = format!("OpenRouter API error {status}: {detail}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                OracleError::Transient(message)
            } else {
                OracleError::Permanent(message)
            });
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| OracleError::Permanent(format!("OpenRouter response parse failed: {e}")))?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();
        parse_reply(content, menu)
    }
}

/// Extracts the JSON object from model output (fences and chatter around it are
/// ignored) and keeps only capabilities on `menu`.
fn parse_reply(content: &str, menu: &[Capability]) -> Result<Option<OracleReply>, OracleError> {
    let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) else {
        return Err(OracleError::Permanent("model reply holds no JSON object".to_string()));
    };
    if end < start {
        return Err(OracleError::Permanent("model reply holds no JSON object".to_string()));
    }
    let llm: LlmIntent = serde_json::from_str(&content[start..=end])
        .map_err(|e| OracleError::Permanent(format!("model reply is not an intent: {e}")))?;

    let mut capabilities: Vec<Capability> = llm
        .capabilities
        .into_iter()
        .filter_map(|v| serde_json::from_value::<Capability>(v).ok())
        .filter(|c| menu.contains(c))
        .collect();
    capabilities.dedup();
    if capabilities.is_empty() {
        return Ok(None);
    }
    tracing::debug!(target: "concierge::router", capabilities = ?capabilities, "Oracle reply parsed");
    Ok(Some(OracleReply {
        capabilities,
        intent: llm.intent,
    }))
}
