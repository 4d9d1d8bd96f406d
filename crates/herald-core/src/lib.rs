//! Uniform messaging core: one `send` / `receive` surface in front of many
//! channel drivers.
//!
//! Drivers only implement primitive operations (see [`ports::Driver`]).
//! [`Service`] wraps them with lazy sessions, events, suppression and capability
//! checks; [`ServiceManager`] routes and fans out across named services.

pub mod catalog;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod manager;
pub mod messaging;
pub mod outbox;
pub mod ports;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use catalog::DriverCatalog;
pub use errors::{Error, Result};
pub use events::{Event, EventBus, EventKind};
pub use manager::ServiceManager;
pub use messaging::{
    types::{Fields, Message, MessageStatus, Payload},
    Attachment,
};
pub use outbox::Outbox;
pub use ports::{Capabilities, Configurable, Driver, Endpoint, MediaHelper, MessageStream};
pub use service::Service;
