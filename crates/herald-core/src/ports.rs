use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;

use crate::{
    messaging::{
        types::{Fields, Message, StatusUpdate, WebhookRequest},
        Attachment,
    },
    Error, Result,
};

/// Lazy, pull-driven sequence of messages.
pub type MessageStream<'a> = BoxStream<'a, Result<Message>>;

/// Turns an attachment into a URL the channel can fetch (MMS, WhatsApp).
pub type MediaHelper = Arc<dyn Fn(&Attachment) -> Result<String> + Send + Sync>;

/// Capabilities of a driver (or of an aggregate of drivers).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub can_send: bool,
    pub can_receive: bool,
    pub receive_webhook: bool,
    pub status_callback: bool,
}

impl Capabilities {
    pub const fn send_only() -> Self {
        Self {
            can_send: true,
            can_receive: false,
            receive_webhook: false,
            status_callback: false,
        }
    }

    pub const fn receive_only() -> Self {
        Self {
            can_send: false,
            can_receive: true,
            receive_webhook: false,
            status_callback: false,
        }
    }

    pub const fn duplex() -> Self {
        Self {
            can_send: true,
            can_receive: true,
            receive_webhook: false,
            status_callback: false,
        }
    }

    /// Union of two capability sets.
    pub fn merge(self, other: Self) -> Self {
        Self {
            can_send: self.can_send || other.can_send,
            can_receive: self.can_receive || other.can_receive,
            receive_webhook: self.receive_webhook || other.receive_webhook,
            status_callback: self.status_callback || other.status_callback,
        }
    }
}

/// Stream that fails once with `err`.
pub fn failed_stream(err: Error) -> MessageStream<'static> {
    stream::once(async move { Err(err) }).boxed()
}

/// Channel driver contract.
///
/// Implementors provide the primitive operations only; `Service` wraps them
/// with session handling, events and suppression. Every operation a driver
/// leaves unimplemented fails with the matching capability error.
#[async_trait]
pub trait Driver: Send {
    /// Channel type, e.g. `"smtp"` or `"twilio_sms"`.
    fn kind(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Must tolerate being called on a session that was never opened.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send(&mut self, _fields: &Fields) -> Result<Message> {
        Err(Error::send_capability(self.kind()))
    }

    /// Pull at most `limit` messages.
    ///
    /// The stream must not borrow the driver: clone whatever client handle it
    /// needs so the service stays usable while the caller iterates.
    fn receive(&mut self, _limit: usize, _options: &Fields) -> MessageStream<'static> {
        failed_stream(Error::receive_capability(self.kind()))
    }

    fn receive_webhook(&mut self, _request: &WebhookRequest) -> MessageStream<'static> {
        failed_stream(Error::receive_capability(self.kind()))
    }

    async fn status_callback(&mut self, _request: &WebhookRequest) -> Result<StatusUpdate> {
        Err(Error::receive_capability(self.kind()))
    }
}

#[async_trait]
impl<D: Driver + ?Sized> Driver for Box<D> {
    fn kind(&self) -> &str {
        (**self).kind()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    async fn send(&mut self, fields: &Fields) -> Result<Message> {
        (**self).send(fields).await
    }

    fn receive(&mut self, limit: usize, options: &Fields) -> MessageStream<'static> {
        (**self).receive(limit, options)
    }

    fn receive_webhook(&mut self, request: &WebhookRequest) -> MessageStream<'static> {
        (**self).receive_webhook(request)
    }

    async fn status_callback(&mut self, request: &WebhookRequest) -> Result<StatusUpdate> {
        (**self).status_callback(request).await
    }
}

/// A driver that can be built from a flat option map.
pub trait Configurable: Driver + Sized + 'static {
    /// Default registration name.
    const NAME: &'static str;

    type Options: DeserializeOwned;

    fn new(options: Self::Options) -> Result<Self>;

    fn from_options(options: Fields) -> Result<Self> {
        let options = serde_json::from_value(serde_json::Value::Object(options))
            .map_err(|e| Error::config(format!("{}: {e}", Self::NAME)))?;
        Self::new(options)
    }
}

/// Anything exposing the public messaging contract.
///
/// Implemented by `Service` and by `ServiceManager`, so managers can be
/// nested or used wherever a single service is expected.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn is_open(&self) -> bool;

    fn is_suppressed(&self) -> bool;

    /// Set the suppression flag, returning the previous value.
    fn set_suppressed(&self, suppressed: bool) -> bool;

    /// Hold sends while an outbox captures them, returning the previous
    /// value. Unlike suppression, a hold is not forwarded to members as
    /// caller suppression, so captured sends replay once it is lifted.
    fn set_held(&self, held: bool) -> bool {
        self.set_suppressed(held)
    }

    /// Install (or clear) the helper used by `generate_media_urls`.
    fn set_media_helper(&self, helper: Option<MediaHelper>);

    /// Run the send pipeline. `suppress` forces suppression for this call
    /// only (used when an enclosing manager is suppressed).
    async fn dispatch(&self, fields: Fields, suppress: bool) -> Result<Option<Message>>;

    async fn send(&self, fields: Fields) -> Result<Option<Message>> {
        self.dispatch(fields, false).await
    }

    fn receive(&self, limit: usize, options: Fields) -> MessageStream<'_>;

    async fn close(&self) -> Result<()>;
}
