//! Language-model collaborator
//!
//! The LLM is an external text-completion service invoked synchronously.
//! [`LanguageModel`] is the seam; [`HttpLanguageModel`] talks to any
//! OpenAI-compatible chat-completions endpoint, and [`MockLanguageModel`]
//! scripts replies for tests. [`LlmClient`] layers the gateway's prompt
//! building and the independent LLM deadline on top.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::config::LlmSettings;
use crate::error::{GatewayError, GatewayResult};

/// External text-completion service
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One synchronous completion: system prompt + user prompt in, text out
    async fn complete(&self, system: &str, user: &str) -> GatewayResult<String>;

    /// Credential/reachability probe for the startup checks
    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Chat-completions client for any OpenAI-compatible server
pub struct HttpLanguageModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLanguageModel {
    /// Builds a client from the configured endpoint settings
    #[must_use]
    pub fn new(settings: &LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        }
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn complete(&self, system: &str, user: &str) -> GatewayResult<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            stream: false,
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::LlmFailed {
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::LlmFailed {
                detail: format!("completion endpoint returned {status}: {body}"),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| GatewayError::LlmFailed {
            detail: e.to_string(),
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GatewayError::LlmFailed {
                detail: "completion endpoint returned no choices".to_string(),
            })
    }

    async fn ping(&self) -> GatewayResult<()> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| GatewayError::LlmFailed {
                detail: format!("completion endpoint unreachable: {e}"),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::LlmFailed {
                detail: format!("credential check returned {}", response.status()),
            })
        }
    }
}

/// Scripted model for tests: replies are popped in order
#[derive(Default)]
pub struct MockLanguageModel {
    replies: Mutex<VecDeque<GatewayResult<String>>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockLanguageModel {
    /// Empty script; every call fails until replies are pushed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Model that stalls longer than any test deadline, for timeout paths
    #[must_use]
    pub fn stalled(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queues the next successful reply
    pub fn push_reply(&self, text: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(Ok(text.into()));
    }

    /// Queues the next failure
    pub fn push_failure(&self, detail: impl Into<String>) {
        self.replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(Err(GatewayError::LlmFailed {
                detail: detail.into(),
            }));
    }

    /// User prompts observed so far, in call order
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn complete(&self, _system: &str, user: &str) -> GatewayResult<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(user.to_string());
        self.replies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Err(GatewayError::LlmFailed {
                    detail: "mock model script exhausted".to_string(),
                })
            })
    }
}

/// Structured verdict of the data-source classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingClassification {
    /// Chosen service: `csv_sql` or `csv_analytic`
    pub service: String,
    /// Model-provided rationale, echoed to the UI for transparency
    pub reasoning: String,
    /// Model-reported confidence in `[0, 1]`
    pub confidence: f64,
}

const SQL_SYSTEM_PROMPT: &str = "You translate analytical questions into a single read-only SQL \
    SELECT statement for the schema provided. Reply with the SQL statement only, no prose, no \
    markdown fences.";

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize tabular query results as a short, direct \
    natural-language answer to the user's question. Do not mention SQL.";

const CLASSIFIER_SYSTEM_PROMPT: &str = "You pick the best engine for a question about an \
    uploaded CSV file. Reply with JSON only: {\"service\": \"csv_sql\" or \"csv_analytic\", \
    \"reasoning\": string, \"confidence\": number between 0 and 1}. Choose csv_sql for \
    filtering, counting and aggregation; csv_analytic for statistical profiling and \
    correlations.";

/// Prompt building plus the independent LLM deadline
pub struct LlmClient {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl LlmClient {
    /// Wraps a model with the configured per-call deadline
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    async fn call(&self, system: &str, user: &str) -> GatewayResult<String> {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        match tokio::time::timeout(self.timeout, self.model.complete(system, user)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(GatewayError::LlmTimeout { timeout_ms }),
        }
    }

    /// Generates SQL for a question against the given schema description
    ///
    /// # Errors
    ///
    /// `llm_timeout` when the deadline elapses; completion failures otherwise.
    pub async fn generate_sql(&self, schema: &str, question: &str) -> GatewayResult<String> {
        let user = format!("Schema:\n{schema}\nQuestion: {question}");
        let raw = self.call(SQL_SYSTEM_PROMPT, &user).await?;
        Ok(strip_sql_fences(&raw))
    }

    /// Turns a result table back into a natural-language answer
    ///
    /// # Errors
    ///
    /// `llm_timeout` when the deadline elapses; completion failures otherwise.
    pub async fn summarize(&self, question: &str, table_text: &str) -> GatewayResult<String> {
        let user = format!("Question: {question}\nResult:\n{table_text}");
        self.call(SUMMARY_SYSTEM_PROMPT, &user).await
    }

    /// Classifies which CSV engine should answer the question
    ///
    /// # Errors
    ///
    /// `llm_timeout` when the deadline elapses; completion or parse failures
    /// otherwise.
    pub async fn classify(&self, question: &str) -> GatewayResult<RoutingClassification> {
        let raw = self.call(CLASSIFIER_SYSTEM_PROMPT, question).await?;
        let json = extract_json_object(&raw);
        let classification: RoutingClassification =
            serde_json::from_str(json).map_err(|e| GatewayError::LlmFailed {
                detail: format!("classifier returned unparseable JSON: {e}"),
            })?;
        debug!(
            service = classification.service,
            confidence = classification.confidence,
            "classifier verdict"
        );
        Ok(classification)
    }
}

/// Strips markdown fences and trailing semicolon noise from generated SQL
fn strip_sql_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fences = trimmed
        .strip_prefix("```sql")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest))
        .unwrap_or(trimmed);
    without_fences.trim().to_string()
}

/// Extracts the first JSON object from a possibly chatty reply
fn extract_json_object(raw: &str) -> &str {
    let Some(start) = raw.find('{') else {
        return raw;
    };
    let Some(end) = raw.rfind('}') else {
        return raw;
    };
    if end > start { &raw[start..=end] } else { raw }
}
