use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

pub use dqa_error::{DqaError, Result};

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, system: &str, context: &str, user: &str) -> Result<String>;
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// 适配器层瞬时故障重试参数（5xx / 连接失败）
const TRANSIENT_RETRIES: usize = 2;
const BACKOFF_BASE_MS: u64 = 250;

fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

// ========== OpenAI-compatible (covers OpenAI, DeepSeek, some Qwen proxies) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-4o, deepseek-chat
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OaiChatReq {
    model: String,
    messages: Vec<OaiChatReqMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: String,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip(self, system, context, user))]
    async fn chat(&self, system: &str, context: &str, user: &str) -> Result<String> {
        let url = format!(
            "{}/v1/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let body = OaiChatReq {
            model: self.cfg.chat_model.clone(),
            messages: vec![
                OaiChatReqMsg {
                    role: "system".into(),
                    content: system.to_string(),
                },
                OaiChatReqMsg {
                    role: "user".into(),
                    content: format!("{}\n\nContext:\n{}", user, context),
                },
            ],
            temperature: Some(0.0),
        };

        let mut backoff_ms = BACKOFF_BASE_MS;
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.cfg.api_key)
                .json(&body)
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    // 连接类瞬时故障在适配器层重试
                    if e.is_connect() && attempt <= TRANSIENT_RETRIES + 1 {
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = backoff_ms.saturating_mul(2);
                        continue;
                    }
                    return Err(DqaError::from(e));
                }
            };

            let status = resp.status();
            if status.as_u16() == 429 {
                // 限流不在此处重试：上抛由编排器按独立预算退避一次
                let retry_after = parse_retry_after(&resp);
                return Err(DqaError::RateLimited {
                    provider: "openai_compat".to_string(),
                    retry_after,
                });
            }
            if status.is_server_error() && attempt <= TRANSIENT_RETRIES + 1 {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2);
                continue;
            }
            if !status.is_success() {
                let txt = resp.text().await.unwrap_or_default();
                return Err(DqaError::GenerationService {
                    provider: "openai_compat".to_string(),
                    message: format!("status={} body={}", status, txt),
                    retry_after: None,
                });
            }

            let data: OaiChatResp = resp.json().await.map_err(|e| DqaError::Network {
                operation: "chat_response_read".to_string(),
                message: e.to_string(),
            })?;
            let content = data
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .unwrap_or_default();
            return Ok(content);
        }
    }
}

#[derive(Serialize)]
struct OaiEmbedReq {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OaiEmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

#[async_trait]
impl EmbedModel for OpenAiCompatClient {
    #[instrument(skip(self, texts))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .clone()
            .ok_or_else(|| DqaError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;
        let url = format!("{}/v1/embeddings", self.cfg.base_url.trim_end_matches('/'));
        let body = OaiEmbedReq {
            model,
            input: texts.to_vec(),
        };

        let mut backoff_ms = BACKOFF_BASE_MS;
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.cfg.api_key)
                .json(&body)
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if e.is_connect() && attempt <= TRANSIENT_RETRIES + 1 {
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = backoff_ms.saturating_mul(2);
                        continue;
                    }
                    return Err(DqaError::from(e));
                }
            };

            let status = resp.status();
            // 嵌入调用对 429 与 5xx 统一在适配器层做有界退避重试
            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && attempt <= TRANSIENT_RETRIES + 1 {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2);
                continue;
            }
            if !status.is_success() {
                let retry_after = parse_retry_after(&resp);
                let txt = resp.text().await.unwrap_or_default();
                return Err(DqaError::EmbeddingService {
                    provider: "openai_compat".to_string(),
                    message: format!("status={} body={}", status, txt),
                    retry_after,
                });
            }

            let data: OaiEmbedResp = resp.json().await.map_err(|e| DqaError::Network {
                operation: "embed_response_read".to_string(),
                message: e.to_string(),
            })?;
            return Ok(data.data.into_iter().map(|d| d.embedding).collect());
        }
    }
}

// ========== Anthropic (Claude) ==========

#[derive(Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,   // e.g. claude-3-5-sonnet-latest
    pub api_url: String, // default https://api.anthropic.com
}

#[derive(Clone)]
pub struct AnthropicClient {
    http: Client,
    cfg: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(cfg: AnthropicConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }
}

#[derive(Serialize)]
struct AnthMessageReqMsg {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct AnthMessageReq {
    model: String,
    system: String,
    messages: Vec<AnthMessageReqMsg>,
    max_tokens: u32,
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct AnthMessageRespContent {
    #[allow(dead_code)]
    r#type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthMessageResp {
    content: Vec<AnthMessageRespContent>,
}

#[async_trait]
impl ChatModel for AnthropicClient {
    #[instrument(skip(self, system, context, user))]
    async fn chat(&self, system: &str, context: &str, user: &str) -> Result<String> {
        let url = format!("{}/v1/messages", self.cfg.api_url.trim_end_matches('/'));
        let body = AnthMessageReq {
            model: self.cfg.model.clone(),
            system: system.to_string(),
            messages: vec![AnthMessageReqMsg {
                role: "user",
                content: format!("{}\n\nContext:\n{}", user, context),
            }],
            max_tokens: 2048,
            temperature: Some(0.0),
        };

        let mut backoff_ms = BACKOFF_BASE_MS;
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let result = self
                .http
                .post(&url)
                .header("x-api-key", &self.cfg.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if e.is_connect() && attempt <= TRANSIENT_RETRIES + 1 {
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = backoff_ms.saturating_mul(2);
                        continue;
                    }
                    return Err(DqaError::from(e));
                }
            };

            let status = resp.status();
            if status.as_u16() == 429 {
                let retry_after = parse_retry_after(&resp);
                return Err(DqaError::RateLimited {
                    provider: "anthropic".to_string(),
                    retry_after,
                });
            }
            if status.is_server_error() && attempt <= TRANSIENT_RETRIES + 1 {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2);
                continue;
            }
            if !status.is_success() {
                let txt = resp.text().await.unwrap_or_default();
                return Err(DqaError::GenerationService {
                    provider: "anthropic".to_string(),
                    message: format!("status={} body={}", status, txt),
                    retry_after: None,
                });
            }

            let data: AnthMessageResp = resp.json().await.map_err(|e| DqaError::Network {
                operation: "chat_response_read".to_string(),
                message: e.to_string(),
            })?;
            let mut out = String::new();
            for c in data.content.into_iter() {
                if let Some(t) = c.text {
                    out.push_str(&t);
                }
            }
            return Ok(out);
        }
    }
}

#[async_trait]
impl EmbedModel for AnthropicClient {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(DqaError::Configuration {
            key: "embedding_provider".to_string(),
            reason: "Anthropic does not provide embeddings; configure another embedding provider"
                .to_string(),
        })
    }
}

// ========== Provider Factory & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "anthropic")]
    Anthropic {
        api_url: Option<String>,
        api_key: String,
        model: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EmbedProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
}

pub struct Providers {
    pub chat: Box<dyn ChatModel>,
    pub embed: Box<dyn EmbedModel>,
}

pub fn make_providers(chat: ChatProviderConfig, embed: EmbedProviderConfig) -> Result<Providers> {
    let chat_box: Box<dyn ChatModel> = match chat {
        ChatProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: model,
            embedding_model: None,
        })),
        ChatProviderConfig::Anthropic {
            api_url,
            api_key,
            model,
        } => Box::new(AnthropicClient::new(AnthropicConfig {
            api_url: api_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            api_key,
            model,
        })),
    };

    let embed_box: Box<dyn EmbedModel> = match embed {
        EmbedProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: "".into(),
            embedding_model: Some(model),
        })),
    };

    Ok(Providers {
        chat: chat_box,
        embed: embed_box,
    })
}
