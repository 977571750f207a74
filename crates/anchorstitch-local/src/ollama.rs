//! Local Ollama backend for the content-model capability.

use crate::payload::{parse_outcome, user_message, SchemaShape};
use anchorstitch_core::{CallOutcome, ContentModel, Error, GenOptions, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout_ms: u64,
    shape: SchemaShape,
}

impl OllamaClient {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        model: String,
        timeout_ms: u64,
        shape: SchemaShape,
    ) -> Self {
        Self {
            client,
            base_url,
            model,
            timeout_ms,
            shape,
        }
    }

    pub fn from_env(client: reqwest::Client, shape: SchemaShape) -> Result<Self> {
        // Opt-in: don't start calling localhost unless the user asked for it.
        if !crate::env_bool("ANCHORSTITCH_OLLAMA_ENABLE") {
            return Err(Error::NotConfigured(
                "ANCHORSTITCH_OLLAMA_ENABLE is not set (or false)".to_string(),
            ));
        }
        let base_url = crate::env("ANCHORSTITCH_OLLAMA_BASE_URL")
            .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
        let model = crate::env("ANCHORSTITCH_OLLAMA_MODEL")
            .unwrap_or_else(|| "qwen2.5:7b-instruct".to_string());
        let timeout_ms = crate::env_u64("ANCHORSTITCH_OLLAMA_TIMEOUT_MS", 120_000);
        Ok(Self::new(client, base_url, model, timeout_ms, shape))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint_chat(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }

    async fn chat(&self, system: &str, user: &str, opts: &GenOptions) -> Result<(String, u64)> {
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            stream: Some(false),
            options: ModelOptions::from_gen(opts),
        };

        let resp = self
            .client
            .post(self.endpoint_chat())
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Model(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Model(format!("ollama chat HTTP {status}")));
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| Error::Model(e.to_string()))?;
        let usage =
            parsed.prompt_eval_count.unwrap_or(0) + parsed.eval_count.unwrap_or(0);
        Ok((parsed.message.content, usage))
    }
}

#[async_trait::async_trait]
impl ContentModel for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
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
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ModelOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
}

impl ModelOptions {
    fn from_gen(opts: &GenOptions) -> Option<Self> {
        let o = Self {
            temperature: opts.temperature,
            top_p: opts.top_p,
            seed: opts.seed,
            num_predict: opts.max_tokens,
            repeat_penalty: opts.repeat_penalty,
            frequency_penalty: opts.frequency_penalty,
            presence_penalty: opts.presence_penalty,
        };
        let all_unset = o.temperature.is_none()
            && o.top_p.is_none()
            && o.seed.is_none()
            && o.num_predict.is_none()
            && o.repeat_penalty.is_none()
            && o.frequency_penalty.is_none()
            && o.presence_penalty.is_none();
        if all_unset {
            None
        } else {
            Some(o)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}
