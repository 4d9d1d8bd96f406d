//! Capture scope for outgoing messages.
//!
//! While an outbox is capturing, every `BeforeSend` on its bus is recorded and
//! intercepted, and the owning endpoint is held (see `Endpoint::set_held`).
//! The batch is then either released (replayed, oldest first) or discarded.
//! The outcome is decided exactly once.

use std::{
    fmt,
    future::Future,
    mem,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    events::{Event, EventBus, EventKind, SubscriptionId},
    messaging::types::{Fields, Message},
    ports::Endpoint,
    service::Service,
    Result,
};

struct Captured {
    service: Arc<Service>,
    fields: Fields,
    /// Suppression the caller forced at capture time; replay keeps it.
    suppress: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Capturing,
    Released,
    Discarded,
}

struct State {
    stage: Stage,
    subscription: Option<SubscriptionId>,
    prior_suppressed: bool,
}

struct Inner {
    target: Weak<dyn Endpoint>,
    bus: Arc<EventBus>,
    buffer: Arc<Mutex<Vec<Captured>>>,
    state: Mutex<State>,
}

impl Inner {
    /// Stop capturing and restore suppression. Returns `false` if the
    /// outcome was already decided.
    fn finish(&self, outcome: Stage) -> bool {
        let mut state = self.state.lock();
        if state.stage != Stage::Capturing {
            return false;
        }
        state.stage = outcome;
        if let Some(id) = state.subscription.take() {
            self.bus.unsubscribe(id);
        }
        if let Some(target) = self.target.upgrade() {
            target.set_held(state.prior_suppressed);
        }
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.finish(Stage::Discarded) {
            let count = mem::take(&mut *self.buffer.lock()).len();
            if count > 0 {
                warn!(count, "outbox dropped without release, discarded messages");
            }
        }
    }
}

/// Handle to a capturing outbox. Clones share the same batch.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<Inner>,
}

impl Outbox {
    /// Start capturing on `bus`, suppressing `target` until the outcome is
    /// decided.
    pub fn capture(target: Weak<dyn Endpoint>, bus: Arc<EventBus>) -> Self {
        let buffer: Arc<Mutex<Vec<Captured>>> = Arc::default();
        let sink = Arc::clone(&buffer);
        let subscription = bus.subscribe(EventKind::BeforeSend, move |event| {
            let Event::BeforeSend {
                service,
                fields,
                suppressed,
                intercept,
            } = event
            else {
                return;
            };
            let Some(service) = service.handle() else {
                return;
            };
            intercept.claim();
            debug!(service = %service.name(), "enqueued a message in outbox");
            sink.lock().push(Captured {
                service,
                fields: (*fields).clone(),
                suppress: *suppressed,
            });
        });

        let prior_suppressed = target
            .upgrade()
            .map(|t| t.set_held(true))
            .unwrap_or(false);

        Self {
            inner: Arc::new(Inner {
                target,
                bus,
                buffer,
                state: Mutex::new(State {
                    stage: Stage::Capturing,
                    subscription: Some(subscription),
                    prior_suppressed,
                }),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.state.lock().stage == Stage::Capturing
    }

    /// Captured sends, oldest first, as `(service name, fields)`.
    pub fn pending(&self) -> Vec<(String, Fields)> {
        self.inner
            .buffer
            .lock()
            .iter()
            .map(|c| (c.service.name().to_string(), c.fields.clone()))
            .collect()
    }

    /// Drop every captured send. Nothing in the batch is ever sent.
    ///
    /// Returns the number of discarded sends; zero if the outcome was already
    /// decided.
    pub fn discard(&self) -> usize {
        if !self.inner.finish(Stage::Discarded) {
            return 0;
        }
        let count = mem::take(&mut *self.inner.buffer.lock()).len();
        debug!(count, "discarded messages from outbox");
        count
    }

    /// Replay captured sends through their services, oldest first.
    ///
    /// Capture ends and suppression is restored before the replay, so the
    /// replayed sends are ordinary sends; `BeforeSend` stays muted while they
    /// run. A send whose caller had forced suppression (a suppressed manager)
    /// replays suppressed and never reaches its driver. The first failing
    /// send stops the replay and its error is returned; the rest of the batch
    /// is dropped.
    pub async fn release(&self) -> Result<Vec<Message>> {
        if !self.inner.finish(Stage::Released) {
            return Ok(Vec::new());
        }
        let batch = mem::take(&mut *self.inner.buffer.lock());
        let count = batch.len();

        let _mute = self.inner.bus.muted(EventKind::BeforeSend);
        let mut sent = Vec::with_capacity(count);
        let mut queue = batch.into_iter();
        while let Some(Captured {
            service,
            fields,
            suppress,
        }) = queue.next()
        {
            match service.dispatch(fields, suppress).await {
                Ok(Some(message)) => sent.push(message),
                Ok(None) => {}
                Err(err) => {
                    let dropped = queue.len();
                    if dropped > 0 {
                        warn!(
                            dropped,
                            service = %service.name(),
                            "outbox replay failed, dropping the rest"
                        );
                    }
                    return Err(err);
                }
            }
        }
        debug!(count, "released messages from outbox");
        Ok(sent)
    }
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("pending", &self.len())
            .field("capturing", &self.is_capturing())
            .finish()
    }
}

/// Run `scope`; release on `Ok`, discard and re-raise on `Err`.
pub(crate) async fn run_scope<F, Fut, T>(outbox: Outbox, scope: F) -> Result<T>
where
    F: FnOnce(Outbox) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match scope(outbox.clone()).await {
        Ok(value) => {
            outbox.release().await?;
            Ok(value)
        }
        Err(err) => {
            outbox.discard();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_support::{fields, record_events, service_on, FakeDriver},
        Error,
    };

    #[tokio::test]
    async fn sends_are_held_until_scope_exit() {
        let bus = Arc::new(EventBus::new());
        let driver = FakeDriver::duplex();
        let calls = driver.calls();
        let svc = service_on(&bus, "a", driver);

        let inner_calls = calls.clone();
        let svc2 = svc.clone();
        svc.with_outbox(|outbox| async move {
            svc2.send(fields(&[("to", "1")])).await?;
            svc2.send(fields(&[("to", "2")])).await?;
            assert_eq!(outbox.len(), 2);
            assert!(inner_calls.all().is_empty());
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(calls.sent_to(), vec!["1", "2"]);
        assert!(!svc.is_suppressed());
        assert_eq!(bus.subscriber_count(EventKind::BeforeSend), 0);
    }

    #[tokio::test]
    async fn error_in_scope_discards_everything() {
        let bus = Arc::new(EventBus::new());
        let driver = FakeDriver::duplex();
        let calls = driver.calls();
        let svc = service_on(&bus, "a", driver);

        let svc2 = svc.clone();
        let err = svc
            .with_outbox(|_outbox| async move {
                svc2.send(fields(&[("to", "1")])).await?;
                Err::<(), _>(Error::config("abort"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config(ref m) if m == "abort"));
        assert!(calls.all().is_empty());
        assert!(!svc.is_suppressed());
    }

    #[tokio::test]
    async fn explicit_discard_is_final() {
        let bus = Arc::new(EventBus::new());
        let driver = FakeDriver::duplex();
        let calls = driver.calls();
        let svc = service_on(&bus, "a", driver);

        let svc2 = svc.clone();
        svc.with_outbox(|outbox| async move {
            svc2.send(fields(&[("to", "1")])).await?;
            assert_eq!(outbox.discard(), 1);
            assert_eq!(outbox.discard(), 0);
            Ok(())
        })
        .await
        .unwrap();

        assert!(calls.sent_to().is_empty());
    }

    #[tokio::test]
    async fn explicit_release_sends_once_and_ends_capture() {
        let bus = Arc::new(EventBus::new());
        let driver = FakeDriver::duplex();
        let calls = driver.calls();
        let svc = service_on(&bus, "a", driver);

        let svc2 = svc.clone();
        let inner_calls = calls.clone();
        svc.with_outbox(|outbox| async move {
            svc2.send(fields(&[("to", "1")])).await?;
            let released = outbox.release().await?;
            assert_eq!(released.len(), 1);
            assert_eq!(inner_calls.sent_to(), vec!["1"]);
            assert!(!outbox.is_capturing());
            svc2.send(fields(&[("to", "2")])).await?;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(calls.sent_to(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn replay_is_not_recaptured_or_republished() {
        let bus = Arc::new(EventBus::new());
        let svc = service_on(&bus, "a", FakeDriver::duplex());
        let events = record_events(&bus);

        let outbox = svc.outbox();
        svc.send(fields(&[("to", "1")])).await.unwrap();
        let released = outbox.release().await.unwrap();

        assert_eq!(released.len(), 1);
        assert_eq!(events.count(EventKind::BeforeSend), 1);
        assert_eq!(events.count(EventKind::AfterSend), 1);
        assert!(outbox.is_empty());
        assert!(!bus.is_muted(EventKind::BeforeSend));
    }

    #[tokio::test]
    async fn captures_sends_from_other_services_on_the_bus() {
        let bus = Arc::new(EventBus::new());
        let a = service_on(&bus, "a", FakeDriver::duplex());
        let driver_b = FakeDriver::duplex();
        let calls_b = driver_b.calls();
        let b = service_on(&bus, "b", driver_b);

        let outbox = a.outbox();
        assert!(b.send(fields(&[("to", "9")])).await.unwrap().is_none());
        assert!(calls_b.all().is_empty());
        assert_eq!(outbox.pending()[0].0, "b");

        outbox.release().await.unwrap();
        assert_eq!(calls_b.sent_to(), vec!["9"]);
    }

    #[tokio::test]
    async fn forced_suppression_survives_capture_and_replay() {
        let bus = Arc::new(EventBus::new());
        let a = service_on(&bus, "a", FakeDriver::duplex());
        let driver_b = FakeDriver::duplex();
        let calls_b = driver_b.calls();
        let b = service_on(&bus, "b", driver_b);

        let outbox = a.outbox();
        assert!(b.dispatch(fields(&[("to", "quiet")]), true).await.unwrap().is_none());
        b.send(fields(&[("to", "loud")])).await.unwrap();
        assert_eq!(outbox.len(), 2);

        let released = outbox.release().await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(calls_b.sent_to(), vec!["loud"]);
    }

    #[tokio::test]
    async fn dropping_undecided_outbox_discards_and_restores() {
        let bus = Arc::new(EventBus::new());
        let driver = FakeDriver::duplex();
        let calls = driver.calls();
        let svc = service_on(&bus, "a", driver);

        {
            let _outbox = svc.outbox();
            svc.send(fields(&[("to", "1")])).await.unwrap();
            assert!(svc.is_suppressed());
        }

        assert!(!svc.is_suppressed());
        assert_eq!(bus.subscriber_count(EventKind::BeforeSend), 0);
        svc.send(fields(&[("to", "2")])).await.unwrap();
        assert_eq!(calls.sent_to(), vec!["2"]);
    }

    #[tokio::test]
    async fn failed_replay_stops_and_reports() {
        let bus = Arc::new(EventBus::new());
        let svc = service_on(&bus, "a", FakeDriver::duplex().failing_send());
        let outbox = svc.outbox();
        svc.send(fields(&[("to", "1")])).await.unwrap();
        svc.send(fields(&[("to", "2")])).await.unwrap();
        assert!(matches!(outbox.release().await, Err(Error::Timeout(_))));
        assert!(outbox.is_empty());
    }
}
