use serde::{Deserialize, Serialize};

use crate::pipeline::retry::ErrorClass;

/// Stable failure codes written into retry-queue entries and the
/// permanent-failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    RateLimit,
    DependencyDown,
    DbDeadlock,
    Serialization,
    SlotTimeout,
    MalformedResponse,
    BadPayload,
    Auth,
    ResourceExhausted,
    Unknown,
}

impl ErrorCode {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TIMEOUT" => Self::Timeout,
            "RATE_LIMIT" => Self::RateLimit,
            "DEPENDENCY_DOWN" => Self::DependencyDown,
            "DB_DEADLOCK" => Self::DbDeadlock,
            "SERIALIZATION" => Self::Serialization,
            "SLOT_TIMEOUT" => Self::SlotTimeout,
            "MALFORMED_RESPONSE" => Self::MalformedResponse,
            "BAD_PAYLOAD" => Self::BadPayload,
            "AUTH" => Self::Auth,
            "RESOURCE_EXHAUSTED" => Self::ResourceExhausted,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::DependencyDown => "DEPENDENCY_DOWN",
            Self::DbDeadlock => "DB_DEADLOCK",
            Self::Serialization => "SERIALIZATION",
            Self::SlotTimeout => "SLOT_TIMEOUT",
            Self::MalformedResponse => "MALFORMED_RESPONSE",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::Auth => "AUTH",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout
            | Self::RateLimit
            | Self::DependencyDown
            | Self::DbDeadlock
            | Self::Serialization
            | Self::SlotTimeout
            | Self::MalformedResponse => ErrorClass::Transient,
            Self::BadPayload | Self::Auth => ErrorClass::Permanent,
            Self::ResourceExhausted => ErrorClass::ResourceExhausted,
            // unknown failures get the benefit of the doubt
            Self::Unknown => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn suggested_action(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::Timeout => {
            "Raise the classify/write timeout or shrink the conversation. Check LLM latency."
        }
        ErrorCode::RateLimit => {
            "Back off. Lower max concurrency or raise the classifier backoff base."
        }
        ErrorCode::DependencyDown => {
            "Retry later. Check classifier endpoint and database health."
        }
        ErrorCode::DbDeadlock => {
            "Retry is OK. Look for competing writers on classification_results."
        }
        ErrorCode::Serialization => {
            "Retry is OK. Reduce concurrent writes or lower the isolation level."
        }
        ErrorCode::SlotTimeout => {
            "Workers were saturated. Raise the acquire timeout or max concurrency."
        }
        ErrorCode::MalformedResponse => {
            "Model output was not JSON. Inspect the prompt and model; re-run the item."
        }
        ErrorCode::BadPayload => {
            "Non-retryable. The conversation payload is empty or invalid; fix the source record."
        }
        ErrorCode::Auth => {
            "Non-retryable. Check classifier/database credentials before re-running."
        }
        ErrorCode::ResourceExhausted => {
            "Free disk or memory on the worker host before resuming."
        }
        ErrorCode::Unknown => {
            "Inspect the reason and logs. Add a mapping once the failure is understood."
        }
    }
}
