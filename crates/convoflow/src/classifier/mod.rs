use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClassifierError;
use crate::pipeline::model::SourceRecord;

pub mod ollama;

pub use ollama::{OllamaClassifier, OllamaConfig};

/// The LLM oracle. Repeated calls with the same input must be safe; any
/// response scraping happens inside the implementation, so callers only
/// ever see a validated JSON classification or a typed error.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, record: &SourceRecord) -> Result<Value, ClassifierError>;
}
