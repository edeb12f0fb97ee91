//! Mail Relay: durable templated-email delivery queue.

pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod mail;
pub mod queue;
pub mod render;
pub mod store;
