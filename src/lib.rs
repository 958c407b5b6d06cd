//! Cross-venue prediction market arbitrage detection engine.
//!
//! The data plane continuously ingests markets, quotes and order books from
//! multiple venues, proposes cross-venue market equivalences, and scans
//! confirmed pairs for executable arbitrage after fees and slippage.
//!
//! ## Architecture
//!
//! - **Venue adapters** normalize each venue's REST and push feeds into one
//!   common shape and track per-venue health
//! - **Concurrency gates** bound in-flight requests and pace calls per venue
//! - **A short-TTL cache** is the sole source of "latest order book" for the
//!   detector hot path
//! - **The orchestrator** owns adapter lifecycles, full syncs, targeted
//!   refreshes and write-through to cache and store
//! - **The matcher** proposes cross-venue pairs from question text, dates,
//!   categories and resolution rules
//! - **The detector** simulates fills on both legs and emits opportunities
//!   with profit and confidence breakdowns

pub mod cache;
pub mod config;
pub mod detector;
pub mod events;
pub mod fees;
pub mod gate;
pub mod ingest;
pub mod logging;
pub mod matcher;
pub mod metrics;
pub mod retry;
pub mod status;
pub mod store;
pub mod types;
pub mod venue;
