//! Channel registry.
//!
//! A channel is a named broadcast topic with its own permission list, rate
//! limits, subscriber cap, and history retention. The registry is populated
//! with a fixed bootstrap set at gateway start and is read-mostly afterwards.

pub mod registry;

pub use registry::{Channel, ChannelRegistry, RegistryError};
