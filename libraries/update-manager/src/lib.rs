//! Device side of a pull-based firmware update.
//!
//! The [`UpdateEngine`] asks the initiator for the image one batch of
//! fragments at a time, checks and caches them, writes them to the image
//! flash area, and hands a verified image to the bootloader. A record on a
//! separate flash slot lets the engine report the outcome of a session that
//! was cut short by a reset.

#![cfg_attr(not(test), no_std)]

pub use crate::config::{Config, ConfigError, DeviceIdentity, TargetInfo};
pub use crate::engine::{Progress, TimerPurpose, UpdateEngine};
pub use crate::error::Error;
pub use crate::event::{Event, EventChannel, EventReceiver, EventSender, EVENT_QUEUE_SIZE};
pub use crate::persist::{Phase, PersistedRecord};
pub use crate::platform::{BootOutcome, Outbound, Platform, RetryTimer, Transport};
pub use crate::reset_reason::ResetReason;
pub use crate::session::{Origin, SecurityClass, State};
pub use wire_protocols;

// Must come first, the logging macros are textually scoped
mod fmt;

pub mod activation;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod integrity;
pub mod persist;
pub mod platform;
pub mod request;
pub mod reset_reason;
pub mod session;

#[cfg(test)]
mod mock;
