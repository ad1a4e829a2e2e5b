//! Migration-run orchestration core.
//!
//! A fixed nine-stage pipeline drives each run: ingest through reporting,
//! with a risk gate before migration that can hold the run for a human
//! override. Progress is recorded in a per-session append-only transition
//! log that backs both the pull (snapshot) and push (WebSocket) transports,
//! and a deterministic verdict engine reduces the validation evidence to
//! SAFE, RISKY, or BLOCKED.

pub mod config;
pub mod controller;
pub mod errors;
pub mod executor;
pub mod gate;
pub mod models;
pub mod server;
pub mod stage;
pub mod store;
pub mod verdict;
