//! Channel-agnostic message model.

pub mod attachment;
pub mod types;

pub use attachment::Attachment;
