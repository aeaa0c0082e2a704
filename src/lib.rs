pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod events;
pub mod http_api;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod resolved;
pub mod service;
#[cfg(unix)]
pub mod socket;
