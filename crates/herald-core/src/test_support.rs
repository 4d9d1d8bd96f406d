//! Fakes shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    events::{Event, EventBus, EventKind},
    messaging::types::{
        Fields, Message, MessageStatus, Payload, SmsContent, StatusUpdate, WebhookRequest,
    },
    ports::{Capabilities, Configurable, Driver, MessageStream},
    service::Service,
    Error, Result,
};

#[derive(Default)]
struct Log {
    ops: Vec<String>,
    sent: Vec<Fields>,
}

/// Call log, shareable between several fake drivers.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Log>>);

impl Calls {
    fn push(&self, op: String) {
        self.0.lock().unwrap().ops.push(op);
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().ops.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.0.lock().unwrap().ops.iter().filter(|o| *o == op).count()
    }

    /// Fields of every send that reached a driver, in order.
    pub fn sent(&self) -> Vec<Fields> {
        self.0.lock().unwrap().sent.clone()
    }

    /// `to` field of every send that reached a driver, in order.
    pub fn sent_to(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|f| f.get("to").and_then(Value::as_str).unwrap_or_default().to_string())
            .collect()
    }
}

pub struct FakeDriver {
    label: Option<String>,
    caps: Capabilities,
    calls: Calls,
    inbox: usize,
    fail_open: bool,
    fail_send: bool,
    fail_close: bool,
    next_id: usize,
}

impl FakeDriver {
    fn with_caps(caps: Capabilities) -> Self {
        Self {
            label: None,
            caps,
            calls: Calls::default(),
            inbox: 0,
            fail_open: false,
            fail_send: false,
            fail_close: false,
            next_id: 0,
        }
    }

    pub fn bare() -> Self {
        Self::with_caps(Capabilities::default())
    }

    pub fn duplex() -> Self {
        Self::with_caps(Capabilities::duplex())
    }

    pub fn send_only() -> Self {
        Self::with_caps(Capabilities::send_only())
    }

    pub fn receive_only() -> Self {
        Self::with_caps(Capabilities::receive_only())
    }

    /// Log into `calls` as `"{label}:{op}"`.
    pub fn shared(mut self, label: &str, calls: &Calls) -> Self {
        self.label = Some(label.to_string());
        self.calls = calls.clone();
        self
    }

    pub fn with_inbox(mut self, count: usize) -> Self {
        self.inbox = count;
        self
    }

    pub fn with_webhook(mut self) -> Self {
        self.caps.receive_webhook = true;
        self.caps.status_callback = true;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_send(mut self) -> Self {
        self.fail_send = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }

    fn log(&self, op: &str) {
        match &self.label {
            Some(label) => self.calls.push(format!("{label}:{op}")),
            None => self.calls.push(op.to_string()),
        }
    }

    fn inbox_stream(&self, limit: usize) -> MessageStream<'static> {
        let prefix = self.label.clone().unwrap_or_else(|| "fake".to_string());
        let messages: Vec<Result<Message>> = (0..self.inbox.min(limit))
            .map(|i| {
                let mut m = inbound(i);
                m.id = Some(format!("{prefix}-{i}"));
                Ok(m)
            })
            .collect();
        stream::iter(messages).boxed()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn kind(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn open(&mut self) -> Result<()> {
        self.log("open");
        if self.fail_open {
            return Err(Error::connect(std::io::Error::other("connection refused")));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.log("close");
        if self.fail_close {
            return Err(Error::connect(std::io::Error::other("broken pipe")));
        }
        Ok(())
    }

    async fn send(&mut self, fields: &Fields) -> Result<Message> {
        if !self.caps.can_send {
            return Err(Error::send_capability(self.kind()));
        }
        self.log("send");
        if self.fail_send {
            return Err(Error::timeout(std::io::Error::other("timed out")));
        }
        self.calls.0.lock().unwrap().sent.push(fields.clone());
        self.next_id += 1;
        let to = fields.get("to").and_then(Value::as_str).map(str::to_string);
        Ok(Message::new(Payload::Sms(SmsContent {
            to,
            body: fields.get("body").and_then(Value::as_str).map(str::to_string),
            from: None,
        }))
        .with_id(format!("sent-{}", self.next_id)))
    }

    fn receive(&mut self, limit: usize, _options: &Fields) -> MessageStream<'static> {
        if !self.caps.can_receive {
            return crate::ports::failed_stream(Error::receive_capability(self.kind()));
        }
        self.log("receive");
        self.inbox_stream(limit)
    }

    fn receive_webhook(&mut self, _request: &WebhookRequest) -> MessageStream<'static> {
        self.log("webhook");
        self.inbox_stream(usize::MAX)
    }

    async fn status_callback(&mut self, _request: &WebhookRequest) -> Result<StatusUpdate> {
        self.log("status");
        Ok(StatusUpdate {
            message_id: "sent-1".to_string(),
            status: MessageStatus::Delivered,
            raw: Value::Null,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FakeOptions {
    #[serde(default)]
    pub inbox: usize,
    #[serde(default)]
    pub receive_only: bool,
}

impl Configurable for FakeDriver {
    const NAME: &'static str = "fake";

    type Options = FakeOptions;

    fn new(options: FakeOptions) -> Result<Self> {
        let driver = if options.receive_only {
            FakeDriver::receive_only()
        } else {
            FakeDriver::duplex()
        };
        Ok(driver.with_inbox(options.inbox))
    }
}

pub fn inbound(i: usize) -> Message {
    Message::new(Payload::Sms(SmsContent {
        to: Some("+2000".to_string()),
        from: Some("+1000".to_string()),
        body: Some(format!("msg {i}")),
    }))
    .with_id(format!("in-{i}"))
}

pub fn fields(pairs: &[(&str, &str)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect()
}

pub fn service(name: &str, driver: FakeDriver) -> Arc<Service> {
    Service::new(name, driver, Arc::new(EventBus::new()))
}

pub fn service_on(bus: &Arc<EventBus>, name: &str, driver: FakeDriver) -> Arc<Service> {
    Service::new(name, driver, bus.clone())
}

#[derive(Clone, Default)]
pub struct Recorded(Arc<Mutex<Vec<(EventKind, Option<String>)>>>);

impl Recorded {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.0.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.0.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn after_send_ids(&self) -> Vec<String> {
        self.ids(EventKind::AfterSend)
    }

    /// Message ids carried by `ReceiveMessage`, in publish order.
    pub fn received_ids(&self) -> Vec<String> {
        self.ids(EventKind::ReceiveMessage)
    }

    fn ids(&self, kind: EventKind) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .filter_map(|(_, id)| id.clone())
            .collect()
    }
}

/// Record every event published on `bus`.
pub fn record_events(bus: &Arc<EventBus>) -> Recorded {
    let recorded = Recorded::default();
    for kind in [
        EventKind::BeforeSend,
        EventKind::AfterSend,
        EventKind::SessionOpened,
        EventKind::SessionClosed,
        EventKind::ReceiveMessage,
        EventKind::StatusCallback,
        EventKind::ServiceRegistered,
        EventKind::ServiceUnregistered,
    ] {
        let sink = recorded.clone();
        bus.subscribe(kind, move |event| {
            let id = match event {
                Event::AfterSend { message, .. } | Event::ReceiveMessage { message, .. } => {
                    message.id.clone()
                }
                _ => None,
            };
            sink.0.lock().unwrap().push((event.kind(), id));
        });
    }
    recorded
}
