//! Hookrelay core library: holds the upstream notification stream open and fans each
//! event out to configured webhooks, shared by the CLI.

pub mod bridge;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod payload;
pub mod template;

pub use bridge::Bridge;
pub use config::{Config, Destination, Settings};
pub use event::InboundEvent;
