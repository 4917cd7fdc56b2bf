//! wamux: multi-tenant WhatsApp session manager.
//!
//! A long-running service holding many concurrent authenticated WhatsApp
//! sessions, with a uniform operational surface and three layers on top:
//!
//! - **Session manager:** lifecycle, ownership, per-session event dispatch,
//!   and the policy gate governing auto-reply and webhook delivery
//! - **Bulk engine:** cancellable in-memory fan-out jobs with rate pacing
//! - **Job queue:** durable, priority-ordered execution with a worker pool,
//!   scheduling and bounded retries
//! - **Auto-reply engine:** rule matching with priorities, per-contact daily
//!   caps, delayed dispatch and attempt logging
//!
//! The WhatsApp protocol stack itself is an external collaborator consumed
//! through the [`wa::WaClient`] capability trait.

pub mod autoreply;
pub mod bulk;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod media;
pub mod queue;
pub mod session;
pub mod template;
pub mod wa;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Result, WamuxError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
