//! HTTP surface of the studio job service.
//!
//! Handlers validate a request, hand the work to a background job and
//! answer immediately. Job outcomes reach callers through webhooks.

pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod routes;
pub mod state;
