//! Near-real-time monitor for a government electronic-auction portal.
//!
//! Watches one auction ("cotización") per process: a collector produces
//! normalized per-line-item observations (live session, direct HTTP polling
//! over captured cookies, or deterministic replay), the engine persists them,
//! derives the bidder's margins against loaded cost data, raises alerts when
//! the leading offer moves, and a security policy throttles or halts the
//! collector under sustained error.

pub mod alerts;
pub mod collector;
pub mod config;
pub mod engine;
pub mod events;
pub mod metrics;
pub mod money;
pub mod scenario;
pub mod security;
pub mod storage;
pub mod wire;
