//! Transactional outbox relay
//!
//! Guarantees that a domain write and its event publish become visible
//! together: the event row is inserted in the same database transaction as
//! the business change, and a background drainer publishes whatever the
//! immediate post-commit attempt did not.
//!
//! The three moving parts:
//!
//! - [`enqueue::Enqueuer`]: inserts a pending row inside the caller's
//!   transaction (or skips the insert on the direct bypass) and hands back a
//!   single-shot [`enqueue::PublishTicket`] to fire after commit.
//! - [`drainer::Drainer`]: per-partition workers that sweep pending rows on
//!   an interval and publish them with retry.
//! - [`router::Router`]: subscribes topics to handlers and acks only after a
//!   handler succeeds.

pub mod config;
pub mod db;
pub mod drainer;
pub mod enqueue;
pub mod error;
pub mod idempotency;
pub mod models;
pub mod router;
pub mod store;
