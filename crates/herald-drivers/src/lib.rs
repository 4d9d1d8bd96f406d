//! Built-in drivers and driver decorators.
//!
//! Real channel clients (SMTP, IMAP, carrier APIs) live outside this crate and
//! plug into the core the same way these do.

pub mod misc;
pub mod sms;

use herald_core::DriverCatalog;

pub use misc::{LogDriver, NullDriver, ReceiveFn, SendFn};
pub use sms::{BodyLimit, Otp, SMS_MAX_BODY};

/// Catalog with every driver that can be built from options alone.
pub fn builtin_catalog() -> DriverCatalog {
    let mut catalog = DriverCatalog::new();
    catalog.register::<NullDriver>().register::<LogDriver>();
    catalog
}
