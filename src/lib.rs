//! Asynchronous video generation pipeline.
//!
//! Jobs are accepted over HTTP, charged against a credit ledger, and handed
//! to a leased queue. Dispatch workers pick a video provider, submit the job,
//! poll it to a terminal state, refund credits on failure, and push progress
//! to WebSocket subscribers through an in-process notification hub.

pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
