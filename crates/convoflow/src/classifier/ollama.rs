use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classifier::Classifier;
use crate::error::ClassifierError;
use crate::pipeline::model::SourceRecord;

const DEFAULT_SYSTEM_PROMPT: &str = "You classify customer-support conversations. \
Reply with a single JSON object with the keys \"intent\", \"topic\", \"sentiment\" \
and \"categorization\". Do not add any text outside the JSON object.";

#[derive(Clone, Debug)]
pub struct OllamaConfig {
    pub endpoint: String,
    pub model: String,
    pub system_prompt: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub num_predict: u32,
}

impl OllamaConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout: Duration::from_secs(120),
            temperature: 0.1,
            num_predict: 300,
        }
    }
}

/// `Classifier` backed by Ollama's `/api/chat`.
#[derive(Clone)]
pub struct OllamaClassifier {
    http: reqwest::Client,
    cfg: OllamaConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

impl OllamaClassifier {
    pub fn new(cfg: OllamaConfig) -> Result<Self, ClassifierError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            cfg: OllamaConfig {
                endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
                ..cfg
            },
        })
    }
}

#[async_trait]
impl Classifier for OllamaClassifier {
    async fn classify(&self, record: &SourceRecord) -> Result<Value, ClassifierError> {
        let conversation = render_conversation(&record.payload).ok_or_else(|| {
            ClassifierError::InvalidInput(format!("conversation {} has no text", record.id))
        })?;

        let url = format!("{}/api/chat", self.cfg.endpoint);
        let body = ChatRequest {
            model: &self.cfg.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.cfg.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &conversation,
                },
            ],
            stream: false,
            options: ChatOptions {
                temperature: self.cfg.temperature,
                num_predict: self.cfg.num_predict,
            },
        };

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.cfg.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), text));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;
        let content = parsed.message.map(|m| m.content).unwrap_or_default();

        extract_json_object(&content)
    }
}

fn map_transport_error(err: reqwest::Error, timeout: Duration) -> ClassifierError {
    if err.is_timeout() {
        ClassifierError::Timeout(timeout)
    } else {
        ClassifierError::Unavailable(err.to_string())
    }
}

fn map_status(status: u16, body: String) -> ClassifierError {
    let msg = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    match status {
        401 | 403 => ClassifierError::Auth(msg),
        408 => ClassifierError::Timeout(Duration::ZERO),
        429 => ClassifierError::RateLimited(msg),
        400..=499 => ClassifierError::InvalidInput(msg),
        _ => ClassifierError::Unavailable(msg),
    }
}

/// Flatten the opaque payload into chat text. Known shapes: a `messages`
/// array (`sender` + `content`/`text`), a `tweets` array (`text`), or a bare
/// `text`/`content` string.
pub fn render_conversation(payload: &Value) -> Option<String> {
    let mut out = String::new();

    if let Some(tweets) = payload.get("tweets").and_then(Value::as_array) {
        for tweet in tweets {
            if let Some(text) = tweet.get("text").and_then(Value::as_str) {
                out.push_str("Customer: ");
                out.push_str(text);
                out.push('\n');
            }
        }
    }

    if out.trim().is_empty() {
        if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
            for message in messages {
                let text = message
                    .get("content")
                    .or_else(|| message.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let sender = message
                    .get("sender")
                    .and_then(Value::as_str)
                    .unwrap_or("customer");
                out.push_str(&capitalize(sender));
                out.push_str(": ");
                out.push_str(text);
                out.push('\n');
            }
        }
    }

    if out.trim().is_empty() {
        if let Some(text) = payload
            .get("text")
            .or_else(|| payload.get("content"))
            .and_then(Value::as_str)
        {
            out.push_str(text);
        }
    }

    if out.trim().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Parse model output as a JSON object, falling back to the outermost
/// `{...}` substring when the model wraps it in prose or code fences.
pub fn extract_json_object(content: &str) -> Result<Value, ClassifierError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ClassifierError::MalformedResponse(
            "empty model output".to_string(),
        ));
    }

    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(content) {
        return Ok(v);
    }

    match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            match serde_json::from_str::<Value>(&content[start..=end]) {
                Ok(v @ Value::Object(_)) => Ok(v),
                Ok(_) => Err(ClassifierError::MalformedResponse(
                    "model output is not a JSON object".to_string(),
                )),
                Err(e) => Err(ClassifierError::MalformedResponse(e.to_string())),
            }
        }
        _ => Err(ClassifierError::MalformedResponse(
            "no JSON object in model output".to_string(),
        )),
    }
}
