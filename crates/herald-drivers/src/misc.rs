use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use herald_core::{
    ports::failed_stream, Capabilities, Configurable, Driver, Fields, Message, MessageStream,
    Payload, Result,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

/// Accepts every send and drops it.
#[derive(Debug, Default)]
pub struct NullDriver;

#[derive(Debug, Default, Deserialize)]
pub struct NullOptions {}

#[async_trait]
impl Driver for NullDriver {
    fn kind(&self) -> &str {
        "null"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::send_only()
    }

    async fn send(&mut self, _fields: &Fields) -> Result<Message> {
        Ok(Message::default())
    }
}

impl Configurable for NullDriver {
    const NAME: &'static str = "null";
    type Options = NullOptions;

    fn new(_options: NullOptions) -> Result<Self> {
        Ok(Self)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogOptions {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default = "default_log_message")]
    pub message: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            message: default_log_message(),
        }
    }
}

fn default_log_message() -> String {
    "message sent".to_string()
}

/// Writes every send to the log instead of a channel.
#[derive(Debug)]
pub struct LogDriver {
    level: LogLevel,
    message: String,
}

#[async_trait]
impl Driver for LogDriver {
    fn kind(&self) -> &str {
        "logger"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::send_only()
    }

    async fn send(&mut self, fields: &Fields) -> Result<Message> {
        let raw = Value::Object(fields.clone());
        let msg = self.message.as_str();
        match self.level {
            LogLevel::Trace => trace!(fields = %raw, "{msg}"),
            LogLevel::Debug => debug!(fields = %raw, "{msg}"),
            LogLevel::Info => info!(fields = %raw, "{msg}"),
            LogLevel::Warn => warn!(fields = %raw, "{msg}"),
            LogLevel::Error => error!(fields = %raw, "{msg}"),
        }
        Ok(Message::new(Payload::Generic).with_raw(raw))
    }
}

impl Configurable for LogDriver {
    const NAME: &'static str = "logger";
    type Options = LogOptions;

    fn new(options: LogOptions) -> Result<Self> {
        Ok(Self {
            level: options.level,
            message: options.message,
        })
    }
}

type SendHook = Arc<dyn Fn(&Fields) -> Result<Message> + Send + Sync>;

/// Send-only driver backed by a closure.
#[derive(Clone)]
pub struct SendFn(SendHook);

impl SendFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Fields) -> Result<Message> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for SendFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendFn")
    }
}

#[async_trait]
impl Driver for SendFn {
    fn kind(&self) -> &str {
        "send_function"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::send_only()
    }

    async fn send(&mut self, fields: &Fields) -> Result<Message> {
        (self.0)(fields)
    }
}

type ReceiveHook = Arc<dyn Fn(usize, &Fields) -> Result<Vec<Message>> + Send + Sync>;

/// Receive-only driver backed by a closure returning a batch.
#[derive(Clone)]
pub struct ReceiveFn(ReceiveHook);

impl ReceiveFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(usize, &Fields) -> Result<Vec<Message>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for ReceiveFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReceiveFn")
    }
}

#[async_trait]
impl Driver for ReceiveFn {
    fn kind(&self) -> &str {
        "receive_function"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::receive_only()
    }

    fn receive(&mut self, limit: usize, options: &Fields) -> MessageStream<'static> {
        match (self.0)(limit, options) {
            Ok(batch) => stream::iter(batch.into_iter().take(limit).map(Ok)).boxed(),
            Err(err) => failed_stream(err),
        }
    }
}
