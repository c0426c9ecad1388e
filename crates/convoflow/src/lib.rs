pub mod admin;
pub mod classifier;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod store;

pub use classifier::{Classifier, OllamaClassifier};
pub use config::{Config, PipelineConfig, RunMode};
pub use error::{BatchFileError, ClassifierError, PipelineError, StoreError};
pub use store::{ConversationStore, PgConversationStore};
