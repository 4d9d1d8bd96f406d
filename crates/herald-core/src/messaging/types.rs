use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{messaging::attachment::Attachment, ports::Endpoint, Error, Result};

/// Flat field map handed to `send`, `receive` options and driver constructors.
pub type Fields = serde_json::Map<String, Value>;

/// Delivery status of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Draft,
    Queued,
    Sent,
    Delivered,
    Received,
    Read,
    Cancelled,
    Error,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Received => "received",
            Self::Read => "read",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// `cancelled` and `error` never re-open.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Error)
    }

    /// Whether `self -> next` moves forward. Staying put is always allowed.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        if self == next {
            return true;
        }
        match self {
            Draft => matches!(next, Queued | Sent | Delivered | Received | Cancelled | Error),
            Queued => matches!(next, Sent | Delivered | Cancelled | Error),
            Sent => matches!(next, Delivered | Read | Error),
            Delivered | Received => next == Read,
            Read | Cancelled | Error => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let status = match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Self::Draft,
            "queued" | "accepted" | "sending" => Self::Queued,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "received" | "receiving" => Self::Received,
            "read" => Self::Read,
            "cancelled" | "canceled" => Self::Cancelled,
            "error" | "failed" | "undelivered" => Self::Error,
            other => return Err(Error::config(format!("unknown message status: {other}"))),
        };
        Ok(status)
    }
}

/// Non-owning handle to the endpoint a message came from.
///
/// Used to route replies. It never keeps the endpoint alive.
#[derive(Clone)]
pub struct ServiceRef(Weak<dyn Endpoint>);

impl ServiceRef {
    pub fn new(endpoint: Weak<dyn Endpoint>) -> Self {
        Self(endpoint)
    }

    pub fn upgrade(&self) -> Option<Arc<dyn Endpoint>> {
        self.0.upgrade()
    }
}

impl fmt::Debug for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(endpoint) => write!(f, "ServiceRef({})", endpoint.name()),
            None => f.write_str("ServiceRef(<dropped>)"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct EmailContent {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    pub amp_html_body: Option<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub from: Option<String>,
    pub attachments: Vec<Attachment>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct SmsContent {
    pub to: Option<String>,
    pub body: Option<String>,
    pub from: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct MmsContent {
    pub to: Option<String>,
    pub body: Option<String>,
    pub from: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub address: Option<String>,
    pub label: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct WhatsAppContent {
    pub to: Option<String>,
    pub body: Option<String>,
    pub from: Option<String>,
    pub attachments: Vec<Attachment>,
    pub location: Option<Location>,
    pub profile_name: Option<String>,
    pub forwarded: bool,
    pub frequently_forwarded: bool,
}

/// Channel-specific part of a message.
#[derive(Clone, Debug, Default)]
pub enum Payload {
    #[default]
    Generic,
    Email(EmailContent),
    Sms(SmsContent),
    Mms(MmsContent),
    WhatsApp(WhatsAppContent),
}

impl Payload {
    pub fn body(&self) -> Option<&str> {
        match self {
            Payload::Generic => None,
            Payload::Email(m) => Some(&m.body),
            Payload::Sms(m) => m.body.as_deref(),
            Payload::Mms(m) => m.body.as_deref(),
            Payload::WhatsApp(m) => m.body.as_deref(),
        }
    }

    pub fn attachments(&self) -> &[Attachment] {
        match self {
            Payload::Email(m) => &m.attachments,
            Payload::Mms(m) => &m.attachments,
            Payload::WhatsApp(m) => &m.attachments,
            Payload::Generic | Payload::Sms(_) => &[],
        }
    }
}

/// One logical communication, sent or received.
#[derive(Clone, Debug, Default)]
pub struct Message {
    pub id: Option<String>,
    pub reply_id: Option<String>,
    pub date: Option<DateTime<Utc>>,
    /// Channel-native response, kept for diagnostics.
    pub raw: Value,
    pub payload: Payload,
    status: MessageStatus,
    error: Option<String>,
    service: Option<ServiceRef>,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    /// Error text; only present when the status is `error`.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn advance(&mut self, next: MessageStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Move the message to `error`, recording the cause.
    pub fn fail(&mut self, error: impl fmt::Display) -> Result<()> {
        self.advance(MessageStatus::Error)?;
        self.error = Some(error.to_string());
        Ok(())
    }

    /// Apply a status callback addressed to this message.
    ///
    /// Returns `Ok(false)` when the update is for another message id.
    pub fn apply_status(&mut self, update: &StatusUpdate) -> Result<bool> {
        if self.id.as_deref() != Some(update.message_id.as_str()) {
            return Ok(false);
        }
        self.advance(update.status)?;
        Ok(true)
    }

    /// Inbound messages are always `received`, whatever the driver produced.
    pub(crate) fn mark_received(&mut self) {
        self.status = MessageStatus::Received;
        self.error = None;
    }

    pub fn service(&self) -> Option<Arc<dyn Endpoint>> {
        self.service.as_ref().and_then(ServiceRef::upgrade)
    }

    pub fn service_ref(&self) -> Option<&ServiceRef> {
        self.service.as_ref()
    }

    pub fn set_service(&mut self, service: ServiceRef) {
        self.service = Some(service);
    }

    pub(crate) fn set_service_if_missing(&mut self, service: ServiceRef) {
        if self.service.is_none() {
            self.service = Some(service);
        }
    }

    /// Reply through the endpoint this message came from.
    pub async fn reply(&self, body: &str) -> Result<Option<Message>> {
        let endpoint = self.service().ok_or(Error::NoService)?;
        endpoint.send(self.reply_fields(body)).await
    }

    /// Forward the text body to another recipient.
    pub async fn forward(&self, to: &str) -> Result<Option<Message>> {
        let endpoint = self.service().ok_or(Error::NoService)?;
        endpoint.send(self.forward_fields(to)).await
    }

    pub fn reply_fields(&self, body: &str) -> Fields {
        let mut fields = Fields::new();
        match &self.payload {
            Payload::Email(m) => {
                let to = m.reply_to.clone().or_else(|| m.from.clone());
                fields.insert("to".into(), Value::from(to.into_iter().collect::<Vec<_>>()));
                fields.insert("subject".into(), Value::from(prefixed("Re:", &m.subject)));
                fields.insert("body".into(), Value::from(body));
            }
            Payload::Sms(SmsContent { to, from, .. })
            | Payload::Mms(MmsContent { to, from, .. })
            | Payload::WhatsApp(WhatsAppContent { to, from, .. }) => {
                insert_opt(&mut fields, "to", from.as_deref());
                insert_opt(&mut fields, "from", to.as_deref());
                fields.insert("body".into(), Value::from(body));
            }
            Payload::Generic => {
                fields.insert("body".into(), Value::from(body));
            }
        }
        insert_opt(&mut fields, "reply_id", self.id.as_deref());
        fields
    }

    pub fn forward_fields(&self, to: &str) -> Fields {
        let mut fields = Fields::new();
        match &self.payload {
            Payload::Email(m) => {
                fields.insert("to".into(), Value::from(vec![to.to_string()]));
                fields.insert("subject".into(), Value::from(prefixed("Fwd:", &m.subject)));
            }
            _ => {
                fields.insert("to".into(), Value::from(to));
            }
        }
        insert_opt(&mut fields, "body", self.payload.body());
        fields
    }

    /// Send fields describing this message as it stands. Attachments are
    /// not included; see `Service::send_message`.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        match &self.payload {
            Payload::Email(m) => {
                fields.insert("to".into(), Value::from(m.to.clone()));
                fields.insert("subject".into(), Value::from(m.subject.as_str()));
                fields.insert("body".into(), Value::from(m.body.as_str()));
                insert_opt(&mut fields, "html_body", m.html_body.as_deref());
                insert_opt(&mut fields, "amp_html_body", m.amp_html_body.as_deref());
                if !m.cc.is_empty() {
                    fields.insert("cc".into(), Value::from(m.cc.clone()));
                }
                if !m.bcc.is_empty() {
                    fields.insert("bcc".into(), Value::from(m.bcc.clone()));
                }
                insert_opt(&mut fields, "reply_to", m.reply_to.as_deref());
                insert_opt(&mut fields, "from", m.from.as_deref());
                if !m.headers.is_empty() {
                    let headers = m
                        .headers
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                        .collect();
                    fields.insert("headers".into(), Value::Object(headers));
                }
            }
            Payload::Sms(SmsContent { to, body, from })
            | Payload::Mms(MmsContent { to, body, from, .. })
            | Payload::WhatsApp(WhatsAppContent { to, body, from, .. }) => {
                insert_opt(&mut fields, "to", to.as_deref());
                insert_opt(&mut fields, "body", body.as_deref());
                insert_opt(&mut fields, "from", from.as_deref());
            }
            Payload::Generic => {}
        }
        insert_opt(&mut fields, "reply_id", self.reply_id.as_deref());
        fields
    }
}

fn prefixed(prefix: &str, subject: &str) -> String {
    if subject
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    {
        subject.to_string()
    } else {
        format!("{prefix} {subject}")
    }
}

fn insert_opt(fields: &mut Fields, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), Value::from(value));
    }
}

/// Delivery status reported by a channel for a previously sent message.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    pub message_id: String,
    pub status: MessageStatus,
    pub raw: Value,
}

/// Framework-agnostic view of an inbound HTTP callback.
#[derive(Clone, Debug, Default)]
pub struct WebhookRequest {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub form: Fields,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn form_str(&self, key: &str) -> Option<&str> {
        self.form.get(key).and_then(Value::as_str)
    }
}
