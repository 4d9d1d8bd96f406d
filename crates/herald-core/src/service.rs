//! Service pipeline: wraps a driver's primitive operations.
//!
//! Each public operation is a fixed sequence of steps:
//! - `open`: skip if opened -> driver open -> mark opened -> `SessionOpened`
//! - `close`: driver close -> `SessionClosed` -> mark closed
//! - `send`: `BeforeSend` -> suppression check -> capability check -> lazy open
//!   -> driver send -> `AfterSend`
//! - `receive`: lazy open -> driver pull -> force `received` -> `ReceiveMessage` -> yield

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    events::{Event, EventBus, Intercept},
    messaging::{
        types::{Fields, Message, MessageStatus, ServiceRef, StatusUpdate, WebhookRequest},
        Attachment,
    },
    outbox::Outbox,
    ports::{Capabilities, Driver, Endpoint, MediaHelper, MessageStream},
    Error, Result,
};

/// One configured channel endpoint.
pub struct Service {
    name: String,
    kind: String,
    capabilities: Capabilities,
    driver: Mutex<Box<dyn Driver>>,
    opened: AtomicBool,
    suppressed: AtomicBool,
    media_helper: RwLock<Option<MediaHelper>>,
    events: Arc<EventBus>,
    this: Weak<Service>,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        driver: impl Driver + 'static,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Self::from_boxed(name, Box::new(driver), events)
    }

    pub fn from_boxed(
        name: impl Into<String>,
        driver: Box<dyn Driver>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let name = name.into();
        let kind = driver.kind().to_string();
        let capabilities = driver.capabilities();
        Arc::new_cyclic(|this| Self {
            name,
            kind,
            capabilities,
            driver: Mutex::new(driver),
            opened: AtomicBool::new(false),
            suppressed: AtomicBool::new(false),
            media_helper: RwLock::new(None),
            events,
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Acquire)
    }

    pub fn set_suppressed(&self, suppressed: bool) -> bool {
        self.suppressed.swap(suppressed, Ordering::AcqRel)
    }

    /// Register the function that turns attachments into fetchable URLs.
    pub fn media_helper<F>(&self, helper: F)
    where
        F: Fn(&Attachment) -> Result<String> + Send + Sync + 'static,
    {
        self.set_media_helper(Some(Arc::new(helper)));
    }

    pub fn set_media_helper(&self, helper: Option<MediaHelper>) {
        *self.media_helper.write() = helper;
    }

    /// URLs for `attachments`, in order, for channels that only take media
    /// by URL.
    pub fn generate_media_urls(&self, attachments: &[Attachment]) -> Result<Vec<String>> {
        let helper = self
            .media_helper
            .read()
            .clone()
            .ok_or_else(|| Error::NoMediaHelper(self.name.clone()))?;
        attachments.iter().map(|attachment| helper(attachment)).collect()
    }

    /// Strong handle to this service, while anything still owns it.
    pub fn handle(&self) -> Option<Arc<Service>> {
        self.this.upgrade()
    }

    fn back_ref(&self) -> ServiceRef {
        let weak: Weak<dyn Endpoint> = self.this.clone();
        ServiceRef::new(weak)
    }

    pub async fn open(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        self.open_locked(&mut driver).await
    }

    async fn open_locked(&self, driver: &mut Box<dyn Driver>) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        driver.open().await?;
        self.opened.store(true, Ordering::Release);
        self.events.publish(&Event::SessionOpened { service: self });
        debug!(service = %self.name, "opened session");
        Ok(())
    }

    /// Close the session. The driver is always asked to clean up, even when
    /// no session was opened.
    pub async fn close(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        driver.close().await?;
        if self.opened.load(Ordering::Acquire) {
            self.events.publish(&Event::SessionClosed { service: self });
            self.opened.store(false, Ordering::Release);
            debug!(service = %self.name, "closed session");
        }
        Ok(())
    }

    /// Open, run `scope`, then close whatever the scope returned.
    pub async fn session<F, Fut, T>(&self, scope: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.open().await?;
        let out = scope().await;
        let closed = self.close().await;
        let value = out?;
        closed?;
        Ok(value)
    }

    /// Send a message. Returns `Ok(None)` when the send was suppressed or
    /// captured before reaching the driver.
    pub async fn send(&self, fields: Fields) -> Result<Option<Message>> {
        self.dispatch_send(fields, false).await
    }

    /// Send a prepared message through this service.
    ///
    /// Attachments travel as a `media_url` list built by the media helper;
    /// a message with attachments fails with `NoMediaHelper` when none is
    /// registered.
    pub async fn send_message(&self, message: &Message) -> Result<Option<Message>> {
        let mut fields = message.to_fields();
        let attachments = message.payload.attachments();
        if !attachments.is_empty() {
            let urls = self.generate_media_urls(attachments)?;
            fields.insert("media_url".into(), Value::from(urls));
        }
        self.send(fields).await
    }

    async fn dispatch_send(&self, fields: Fields, suppress: bool) -> Result<Option<Message>> {
        let intercept = Intercept::default();
        self.events.publish(&Event::BeforeSend {
            service: self,
            fields: &fields,
            suppressed: suppress,
            intercept: &intercept,
        });

        if suppress || self.is_suppressed() {
            debug!(service = %self.name, "send suppressed");
            return Ok(None);
        }
        if intercept.is_claimed() {
            debug!(service = %self.name, "send intercepted");
            return Ok(None);
        }
        if !self.capabilities.can_send {
            return Err(Error::send_capability(&self.name));
        }

        let mut message = {
            let mut driver = self.driver.lock().await;
            self.open_locked(&mut driver).await?;
            driver.send(&fields).await?
        };
        if message.status() == MessageStatus::Draft {
            message.advance(MessageStatus::Sent)?;
        }
        message.set_service_if_missing(self.back_ref());

        self.events.publish(&Event::AfterSend {
            service: self,
            message: &message,
        });
        info!(
            service = %self.name,
            id = message.id.as_deref().unwrap_or("-"),
            status = %message.status(),
            "sent message"
        );
        Ok(Some(message))
    }

    /// Pull up to `limit` messages from the driver.
    ///
    /// Observers see each message through `ReceiveMessage` before the caller
    /// gets it. Nothing is buffered between calls.
    pub fn receive(&self, limit: usize, options: Fields) -> MessageStream<'_> {
        Box::pin(try_stream! {
            let mut inner = {
                let mut driver = self.driver.lock().await;
                self.open_locked(&mut driver).await?;
                driver.receive(limit, &options)
            };
            let mut count = 0usize;
            while count < limit {
                match inner.next().await {
                    Some(item) => {
                        let mut message = item?;
                        self.accept_inbound(&mut message);
                        count += 1;
                        yield message;
                    }
                    None => break,
                }
            }
            info!(service = %self.name, count, "received messages");
        })
    }

    /// Parse messages delivered to a webhook.
    pub fn receive_webhook<'a>(&'a self, request: &'a WebhookRequest) -> MessageStream<'a> {
        Box::pin(try_stream! {
            let mut inner = self.driver.lock().await.receive_webhook(request);
            let mut count = 0usize;
            while let Some(item) = inner.next().await {
                let mut message = item?;
                self.accept_inbound(&mut message);
                count += 1;
                yield message;
            }
            info!(service = %self.name, count, "received messages from webhook");
        })
    }

    fn accept_inbound(&self, message: &mut Message) {
        message.mark_received();
        message.set_service_if_missing(self.back_ref());
        self.events.publish(&Event::ReceiveMessage {
            service: self,
            message,
        });
    }

    pub async fn status_callback(&self, request: &WebhookRequest) -> Result<StatusUpdate> {
        let update = self.driver.lock().await.status_callback(request).await?;
        self.events.publish(&Event::StatusCallback {
            service: self,
            update: &update,
        });
        info!(
            service = %self.name,
            id = %update.message_id,
            status = %update.status,
            "received message status"
        );
        Ok(update)
    }

    /// Suppress outgoing messages until the guard is dropped.
    pub fn suppressed(&self) -> Suppressed<'_> {
        Suppressed::new(self)
    }

    /// Start capturing sends; see [`Outbox`].
    pub fn outbox(&self) -> Outbox {
        let target: Weak<dyn Endpoint> = self.this.clone();
        Outbox::capture(target, self.events.clone())
    }

    /// Run `scope` with an outbox: released if it returns `Ok`, discarded
    /// (and the error returned untouched) if it returns `Err`.
    pub async fn with_outbox<F, Fut, T>(&self, scope: F) -> Result<T>
    where
        F: FnOnce(Outbox) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        crate::outbox::run_scope(self.outbox(), scope).await
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("opened", &self.is_open())
            .field("suppressed", &self.is_suppressed())
            .finish()
    }
}

#[async_trait]
impl Endpoint for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn is_open(&self) -> bool {
        Service::is_open(self)
    }

    fn is_suppressed(&self) -> bool {
        Service::is_suppressed(self)
    }

    fn set_suppressed(&self, suppressed: bool) -> bool {
        Service::set_suppressed(self, suppressed)
    }

    fn set_media_helper(&self, helper: Option<MediaHelper>) {
        Service::set_media_helper(self, helper)
    }

    async fn dispatch(&self, fields: Fields, suppress: bool) -> Result<Option<Message>> {
        self.dispatch_send(fields, suppress).await
    }

    fn receive(&self, limit: usize, options: Fields) -> MessageStream<'_> {
        Service::receive(self, limit, options)
    }

    async fn close(&self) -> Result<()> {
        Service::close(self).await
    }
}

/// Scoped suppression toggle; restores the prior value on drop.
pub struct Suppressed<'a> {
    target: &'a dyn Endpoint,
    prior: bool,
}

impl<'a> Suppressed<'a> {
    pub fn new(target: &'a dyn Endpoint) -> Self {
        let prior = target.set_suppressed(true);
        Self { target, prior }
    }
}

impl Drop for Suppressed<'_> {
    fn drop(&mut self) {
        self.target.set_suppressed(self.prior);
    }
}
