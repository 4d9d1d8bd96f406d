//! Named registry of endpoints with send routing and receive fan-out.
//!
//! The manager never re-implements the per-service pipeline: it resolves which
//! member(s) to use and calls their own `dispatch` / `receive`, so events,
//! suppression and lazy sessions still happen at the service level.

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
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    catalog::DriverCatalog,
    config::{Config, ServiceConfig},
    events::{Event, EventBus},
    messaging::{
        types::{Fields, Message, ServiceRef},
        Attachment,
    },
    outbox::Outbox,
    ports::{Capabilities, Configurable, Driver, Endpoint, MediaHelper, MessageStream},
    service::{Service, Suppressed},
    Error, Result,
};

/// Option key consumed by the manager rather than passed to drivers.
pub const SUPPRESS_OPTION: &str = "suppress";

/// Picks a member name for a send, or `None` to fall back to the default.
pub type Selector = Arc<dyn Fn(&Fields) -> Option<String> + Send + Sync>;

type Members = Vec<(String, Arc<dyn Endpoint>)>;

pub struct ServiceManager {
    name: String,
    members: RwLock<Members>,
    selector: RwLock<Option<Selector>>,
    media_helper: RwLock<Option<MediaHelper>>,
    suppressed: AtomicBool,
    held: AtomicBool,
    events: Arc<EventBus>,
    this: Weak<ServiceManager>,
}

impl ServiceManager {
    /// Manager on the process-wide event bus.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_events(name, EventBus::global())
    }

    pub fn with_events(name: impl Into<String>, events: Arc<EventBus>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this| Self {
            name,
            members: RwLock::new(Vec::new()),
            selector: RwLock::new(None),
            media_helper: RwLock::new(None),
            suppressed: AtomicBool::new(false),
            held: AtomicBool::new(false),
            events,
            this: this.clone(),
        })
    }

    /// Build a manager and register every service listed in `config`.
    pub fn from_config(
        name: impl Into<String>,
        config: &Config,
        catalog: &DriverCatalog,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        let manager = Self::with_events(name, events);
        for service in &config.services {
            manager.register_config(service, catalog, config.suppress_all)?;
        }
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// True while suppressed or held by an outbox.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Acquire) || self.is_held()
    }

    pub fn set_suppressed(&self, suppressed: bool) -> bool {
        self.suppressed.swap(suppressed, Ordering::AcqRel)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Register the media helper for this manager and every member, present
    /// and future.
    pub fn media_helper<F>(&self, helper: F)
    where
        F: Fn(&Attachment) -> Result<String> + Send + Sync + 'static,
    {
        self.set_media_helper(Some(Arc::new(helper)));
    }

    pub fn set_media_helper(&self, helper: Option<MediaHelper>) {
        *self.media_helper.write() = helper.clone();
        for (_, member) in self.snapshot() {
            member.set_media_helper(helper.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.read().iter().any(|(n, _)| n == name)
    }

    /// Member names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.members.read().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Endpoint>> {
        self.members
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| Arc::clone(e))
    }

    fn snapshot(&self) -> Members {
        self.members.read().clone()
    }

    fn back_ref(&self) -> ServiceRef {
        let weak: Weak<dyn Endpoint> = self.this.clone();
        ServiceRef::new(weak)
    }

    /// Construct `D` from `options` and register it, by default under
    /// `D::NAME`.
    ///
    /// A boolean `suppress` key in `options` starts the service suppressed and
    /// is not passed to the driver.
    pub fn register<D: Configurable>(
        &self,
        name: Option<&str>,
        mut options: Fields,
        overwrite: bool,
    ) -> Result<Arc<Service>> {
        let name = name.unwrap_or(D::NAME);
        self.check_free(name, overwrite)?;
        let suppress = take_suppress(&mut options);
        let driver = D::from_options(options)?;
        self.install(name, Box::new(driver), suppress, overwrite)
    }

    /// Register an already constructed driver.
    pub fn register_driver(
        &self,
        name: &str,
        driver: impl Driver + 'static,
        overwrite: bool,
    ) -> Result<Arc<Service>> {
        self.check_free(name, overwrite)?;
        self.install(name, Box::new(driver), false, overwrite)
    }

    fn register_config(
        &self,
        config: &ServiceConfig,
        catalog: &DriverCatalog,
        suppress_all: bool,
    ) -> Result<Arc<Service>> {
        let name = config.name.as_deref().unwrap_or(&config.kind);
        self.check_free(name, false)?;
        let mut options = config.options.clone();
        let suppress = take_suppress(&mut options) || suppress_all;
        let driver = catalog.build(&config.kind, options)?;
        self.install(name, driver, suppress, false)
    }

    fn install(
        &self,
        name: &str,
        driver: Box<dyn Driver>,
        suppress: bool,
        overwrite: bool,
    ) -> Result<Arc<Service>> {
        let service = Service::from_boxed(name, driver, self.events.clone());
        if suppress {
            service.set_suppressed(true);
        }
        self.attach(name, service.clone(), overwrite)?;
        Ok(service)
    }

    fn check_free(&self, name: &str, overwrite: bool) -> Result<()> {
        if !overwrite && self.contains(name) {
            return Err(Error::NameExists(name.to_string()));
        }
        Ok(())
    }

    /// Register any endpoint, including another manager.
    ///
    /// Overwriting keeps the original registration position.
    pub fn attach(&self, name: &str, endpoint: Arc<dyn Endpoint>, overwrite: bool) -> Result<()> {
        self.check_free(name, overwrite)?;
        if let Some(helper) = self.media_helper.read().clone() {
            endpoint.set_media_helper(Some(helper));
        }
        {
            let mut members = self.members.write();
            match members.iter_mut().find(|(n, _)| n == name) {
                Some(_) if !overwrite => return Err(Error::NameExists(name.to_string())),
                Some(slot) => slot.1 = Arc::clone(&endpoint),
                None => members.push((name.to_string(), Arc::clone(&endpoint))),
            }
        }

        self.events.publish(&Event::ServiceRegistered {
            manager: &self.name,
            name,
            service: &endpoint,
        });
        info!(manager = %self.name, service = %name, "registered a service");
        Ok(())
    }

    /// Remove the member registered as `name`.
    pub fn unregister(
        &self,
        name: &str,
        ignore_missing: bool,
    ) -> Result<Option<Arc<dyn Endpoint>>> {
        let removed = {
            let mut members = self.members.write();
            members
                .iter()
                .position(|(n, _)| n == name)
                .map(|pos| members.remove(pos))
        };
        self.finish_unregister(removed, name, ignore_missing)
    }

    /// Remove the member that is `instance`, whatever its name.
    pub fn unregister_instance(
        &self,
        instance: &dyn Endpoint,
        ignore_missing: bool,
    ) -> Result<Option<Arc<dyn Endpoint>>> {
        let removed = {
            let mut members = self.members.write();
            members
                .iter()
                .position(|(_, e)| std::ptr::addr_eq(Arc::as_ptr(e), instance))
                .map(|pos| members.remove(pos))
        };
        self.finish_unregister(removed, instance.name(), ignore_missing)
    }

    fn finish_unregister(
        &self,
        removed: Option<(String, Arc<dyn Endpoint>)>,
        missing: &str,
        ignore_missing: bool,
    ) -> Result<Option<Arc<dyn Endpoint>>> {
        let Some((name, endpoint)) = removed else {
            if ignore_missing {
                return Ok(None);
            }
            return Err(Error::not_registered(missing));
        };

        self.events.publish(&Event::ServiceUnregistered {
            manager: &self.name,
            name: &name,
            service: &endpoint,
        });
        info!(manager = %self.name, service = %name, "unregistered a service");
        Ok(Some(endpoint))
    }

    /// Check that a member (or, without `name`, any member) exists and has
    /// the requested capabilities.
    pub fn ensure_service(&self, name: Option<&str>, receive: bool, send: bool) -> Result<()> {
        if let Some(name) = name {
            let endpoint = self.get(name).ok_or_else(|| Error::not_registered(name))?;
            let caps = endpoint.capabilities();
            if receive && !caps.can_receive {
                return Err(Error::receive_capability(name));
            }
            if send && !caps.can_send {
                return Err(Error::send_capability(name));
            }
            return Ok(());
        }

        if self.is_empty() {
            return Err(Error::NotRegistered(None));
        }
        let caps = self.capabilities();
        if receive && !caps.can_receive {
            return Err(Error::ReceiveCapability(None));
        }
        if send && !caps.can_send {
            return Err(Error::SendCapability(None));
        }
        Ok(())
    }

    /// Install the routing selector consulted when `send` has no `via`.
    pub fn via<F>(&self, selector: F)
    where
        F: Fn(&Fields) -> Option<String> + Send + Sync + 'static,
    {
        *self.selector.write() = Some(Arc::new(selector));
    }

    pub fn clear_via(&self) {
        *self.selector.write() = None;
    }

    fn resolve_sender(&self, via: Option<&str>, fields: &Fields) -> Result<Arc<dyn Endpoint>> {
        let chosen = match via {
            Some(name) => Some(name.to_string()),
            None => {
                let selector = self.selector.read().clone();
                selector.and_then(|select| select(fields))
            }
        };

        if let Some(name) = chosen {
            return self.get(&name).ok_or(Error::NotRegistered(Some(name)));
        }

        self.members
            .read()
            .iter()
            .find(|(_, e)| e.capabilities().can_send)
            .map(|(_, e)| Arc::clone(e))
            .ok_or(Error::SendCapability(None))
    }

    /// Send through `via`, the selector's choice, or the first send-capable
    /// member, in that order.
    pub async fn send(&self, via: Option<&str>, fields: Fields) -> Result<Option<Message>> {
        self.dispatch_send(via, fields, false).await
    }

    async fn dispatch_send(
        &self,
        via: Option<&str>,
        fields: Fields,
        suppress: bool,
    ) -> Result<Option<Message>> {
        let target = self.resolve_sender(via, &fields)?;
        // An outbox hold is not forwarded: the member's `BeforeSend` is what
        // the outbox captures.
        let forced = suppress || self.suppressed.load(Ordering::Acquire);
        target.dispatch(fields, forced).await
    }

    fn receive_targets(&self, via: Option<&str>) -> Result<Vec<(String, Arc<dyn Endpoint>)>> {
        if let Some(name) = via {
            let endpoint = self.get(name).ok_or_else(|| Error::not_registered(name))?;
            return Ok(vec![(name.to_string(), endpoint)]);
        }

        let mut targets: Members = self
            .snapshot()
            .into_iter()
            .filter(|(_, e)| e.capabilities().can_receive)
            .collect();
        if targets.is_empty() {
            return Err(Error::ReceiveCapability(None));
        }
        // Fresh order per call so one slow channel cannot starve the others.
        targets.shuffle(&mut rand::thread_rng());
        Ok(targets)
    }

    /// Receive up to `limit` messages in total.
    ///
    /// Without `via`, every receive-capable member is drained in turn, in a
    /// random order. Messages from members that cannot send are re-pointed
    /// at the manager so replies route through it.
    pub fn receive<'a>(
        &'a self,
        limit: usize,
        via: Option<&'a str>,
        options: Fields,
    ) -> MessageStream<'a> {
        let targets = self.receive_targets(via);
        Box::pin(try_stream! {
            let targets = targets?;
            let mut remaining = limit;
            let mut received = 0usize;
            for (name, member) in targets {
                if remaining == 0 {
                    break;
                }
                let reroute = !member.capabilities().can_send;
                let mut inner = member.receive(remaining, options.clone());
                while remaining > 0 {
                    match inner.next().await {
                        Some(item) => {
                            let mut message = item?;
                            if reroute {
                                message.set_service(self.back_ref());
                            }
                            remaining -= 1;
                            received += 1;
                            yield message;
                        }
                        None => break,
                    }
                }
                tracing::debug!(manager = %self.name, service = %name, "drained service");
            }
            info!(manager = %self.name, count = received, "received messages");
        })
    }

    /// Close every open member.
    ///
    /// Best effort: a failing member does not stop the others. All failures
    /// are reported together as `CloseFailed`.
    pub async fn close(&self) -> Result<()> {
        let mut failures = Vec::new();
        for (name, member) in self.snapshot() {
            if !member.is_open() {
                continue;
            }
            if let Err(err) = member.close().await {
                warn!(
                    manager = %self.name,
                    service = %name,
                    error = %err,
                    "failed to close service"
                );
                failures.push((name, err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::CloseFailed { failures })
        }
    }

    /// Suppress sends routed through this manager until the guard is dropped.
    pub fn suppressed(&self) -> Suppressed<'_> {
        Suppressed::new(self)
    }

    pub fn outbox(&self) -> Outbox {
        let target: Weak<dyn Endpoint> = self.this.clone();
        Outbox::capture(target, self.events.clone())
    }

    pub async fn with_outbox<F, Fut, T>(&self, scope: F) -> Result<T>
    where
        F: FnOnce(Outbox) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        crate::outbox::run_scope(self.outbox(), scope).await
    }
}

fn take_suppress(options: &mut Fields) -> bool {
    match options.remove(SUPPRESS_OPTION) {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => {
            matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        }
        _ => false,
    }
}

impl fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceManager")
            .field("name", &self.name)
            .field("services", &self.names())
            .field("suppressed", &self.is_suppressed())
            .field("held", &self.is_held())
            .finish()
    }
}

#[async_trait]
impl Endpoint for ServiceManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.members
            .read()
            .iter()
            .fold(Capabilities::default(), |caps, (_, e)| caps.merge(e.capabilities()))
    }

    fn is_open(&self) -> bool {
        self.members.read().iter().any(|(_, e)| e.is_open())
    }

    fn is_suppressed(&self) -> bool {
        ServiceManager::is_suppressed(self)
    }

    fn set_suppressed(&self, suppressed: bool) -> bool {
        ServiceManager::set_suppressed(self, suppressed)
    }

    fn set_held(&self, held: bool) -> bool {
        self.held.swap(held, Ordering::AcqRel)
    }

    fn set_media_helper(&self, helper: Option<MediaHelper>) {
        ServiceManager::set_media_helper(self, helper)
    }

    async fn dispatch(&self, fields: Fields, suppress: bool) -> Result<Option<Message>> {
        self.dispatch_send(None, fields, suppress).await
    }

    fn receive(&self, limit: usize, options: Fields) -> MessageStream<'_> {
        ServiceManager::receive(self, limit, None, options)
    }

    async fn close(&self) -> Result<()> {
        ServiceManager::close(self).await
    }
}
