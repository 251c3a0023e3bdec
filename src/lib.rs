//! Offline resilience agent for the family-care client.
//!
//! Sits between the foreground client and the backend: classifies requests,
//! serves them from a tiered cache when the network fails, queues emergency
//! and health mutations for ordered delivery, dispatches push notifications,
//! and installs new asset versions in two phases.

pub mod agent;
pub mod cache;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod net;
pub mod notify;
pub mod sync;

pub use agent::{Agent, AgentHandle};
pub use config::Config;
pub use event::{EmergencyOutcome, ForegroundEvent, Message};
