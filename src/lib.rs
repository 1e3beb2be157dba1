//! # gateway-events
//!
//! Durable event bus and task queue for the desktop gateway.
//!
//! Events are persisted before dispatch (Postgres in production, an
//! in-memory store for tests), delivered to subscribers with retry and
//! backoff, and drive a bounded-concurrency task queue whose results are
//! cached and announced as lifecycle events.

pub mod bus;
pub mod config;
pub mod error;
pub mod integration;
pub mod model;
pub mod queue;
pub mod store;
pub mod system;
pub mod telemetry;
