//! OpenAI-compatible chat-completions backend (vLLM, llama-server,
//! OpenRouter, and friends).

use crate::payload::{parse_outcome, user_message, SchemaShape};
use anchorstitch_core::{CallOutcome, ContentModel, Error, GenOptions, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout_ms: u64,
    shape: SchemaShape,
}

impl OpenAiCompatClient {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        model: String,
        timeout_ms: u64,
        shape: SchemaShape,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            model,
            timeout_ms,
            shape,
        }
    }

    pub fn from_env(
        client: reqwest::Client,
        model_override: Option<String>,
        shape: SchemaShape,
    ) -> Result<Self> {
        let base_url = crate::env("ANCHORSTITCH_OPENAI_COMPAT_BASE_URL").ok_or_else(|| {
            Error::NotConfigured("missing ANCHORSTITCH_OPENAI_COMPAT_BASE_URL".to_string())
        })?;
        let api_key = crate::env("ANCHORSTITCH_OPENAI_COMPAT_API_KEY");
        let model = model_override
            .or_else(|| crate::env("ANCHORSTITCH_OPENAI_COMPAT_MODEL"))
            .ok_or_else(|| {
                Error::NotConfigured(
                    "missing model (set --model or ANCHORSTITCH_OPENAI_COMPAT_MODEL)".to_string(),
                )
            })?;
        let timeout_ms = crate::env_u64("ANCHORSTITCH_OPENAI_COMPAT_TIMEOUT_MS", 120_000);
        Ok(Self::new(client, base_url, api_key, model, timeout_ms, shape))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn chat(&self, system: &str, user: &str, opts: &GenOptions) -> Result<(String, u64)> {
        let req = ChatCompletionsRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: opts.temperature,
            top_p: opts.top_p,
            seed: opts.seed,
            max_tokens: opts.max_tokens,
            frequency_penalty: opts.frequency_penalty,
            presence_penalty: opts.presence_penalty,
        };

        let mut builder = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Model(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            // No body in the error: it may echo the API key's project metadata.
            return Err(Error::Model(format!("chat completions HTTP {status}")));
        }

        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Model(e.to_string()))?;
        let usage = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Model("chat completions returned no choices".to_string()))?;
        Ok((content, usage))
    }
}

#[async_trait::async_trait]
impl ContentModel for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    async fn invoke(
        &self,
        instructions: &str,
        slice: &str,
        helper: Option<&str>,
        opts: &GenOptions,
    ) -> Result<CallOutcome> {
        let user = user_message(slice, helper);
        let (text, usage) = self.chat(instructions, &user, opts).await?;
        parse_outcome(&text, usage, &self.shape)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_unset_sampling_fields() {
        let req = ChatCompletionsRequest {
            model: "m".to_string(),
            messages: vec![],
            temperature: Some(0.2),
            top_p: None,
            seed: None,
            max_tokens: None,
            frequency_penalty: None,
            presence_penalty: None,
        };
        let js = serde_json::to_value(&req).unwrap();
        assert_eq!(
            js,
            serde_json::json!({"model": "m", "messages": [], "temperature": 0.2})
        );
    }
}
