//! Domain building blocks shared by every studio crate.
//!
//! Nothing in here talks to the network or the database. The modules cover
//! the pieces the jobs and handlers agree on: error types, retry/backoff,
//! webhook signing, object-key conventions, dataset focus data, the training
//! toolkit job description, and inbound request validation.

pub mod dataset;
pub mod error;
pub mod hashing;
pub mod jobs;
pub mod keys;
pub mod retry;
pub mod signing;
pub mod training_config;
