use std::error::Error as StdError;

use crate::messaging::types::MessageStatus;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Core error type for the messaging pipeline.
///
/// Driver crates map their transport failures into `AuthFailed`, `Connect`,
/// `Timeout` or `Config`; the pipeline relays them unmodified.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{}", not_registered(.0))]
    NotRegistered(Option<String>),

    #[error("{}", capability(.0, "receive"))]
    ReceiveCapability(Option<String>),

    #[error("{}", capability(.0, "send"))]
    SendCapability(Option<String>),

    #[error("service '{0}' already exists")]
    NameExists(String),

    #[error("service authentication failed: {0}")]
    AuthFailed(#[source] BoxError),

    #[error("service connection error: {0}")]
    Connect(#[source] BoxError),

    #[error("service connection timeout: {0}")]
    Timeout(#[source] BoxError),

    #[error("service not configured correctly: {0}")]
    Config(String),

    #[error(
        "body size {} exceeds what {} can send ({max_size})",
        .body.chars().count(),
        .service.as_deref().unwrap_or("the service")
    )]
    BodyTooLarge {
        body: String,
        max_size: usize,
        service: Option<String>,
    },

    #[error("no service to send this message")]
    NoService,

    #[error("invalid message status transition: {from} -> {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("attachment stream already consumed")]
    AttachmentConsumed,

    #[error("service '{0}' has no media helper to turn attachments into URLs")]
    NoMediaHelper(String),

    #[error("failed to close {} service(s): {}", .failures.len(), failed_names(.failures))]
    CloseFailed { failures: Vec<(String, Error)> },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_registered(name: impl Into<String>) -> Self {
        Self::NotRegistered(Some(name.into()))
    }

    pub fn send_capability(name: impl Into<String>) -> Self {
        Self::SendCapability(Some(name.into()))
    }

    pub fn receive_capability(name: impl Into<String>) -> Self {
        Self::ReceiveCapability(Some(name.into()))
    }

    pub fn auth_failed(source: impl Into<BoxError>) -> Self {
        Self::AuthFailed(source.into())
    }

    pub fn connect(source: impl Into<BoxError>) -> Self {
        Self::Connect(source.into())
    }

    pub fn timeout(source: impl Into<BoxError>) -> Self {
        Self::Timeout(source.into())
    }

    pub fn config(message: impl std::fmt::Display) -> Self {
        Self::Config(message.to_string())
    }

    pub fn body_too_large(body: impl Into<String>, max_size: usize, service: Option<&str>) -> Self {
        Self::BodyTooLarge {
            body: body.into(),
            max_size,
            service: service.map(str::to_string),
        }
    }

    /// Length in characters of an oversized body, if this is `BodyTooLarge`.
    pub fn body_size(&self) -> Option<usize> {
        match self {
            Self::BodyTooLarge { body, .. } => Some(body.chars().count()),
            _ => None,
        }
    }
}

fn not_registered(name: &Option<String>) -> String {
    match name {
        Some(name) => format!("service '{name}' not registered on this manager"),
        None => "no service registered on this manager".to_string(),
    }
}

fn capability(name: &Option<String>, verb: &str) -> String {
    match name {
        Some(name) => format!("service '{name}' cannot {verb} messages"),
        None => format!("no service registered to {verb} on this manager"),
    }
}

fn failed_names(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name} ({err})"))
        .collect::<Vec<_>>()
        .join(", ")
}
