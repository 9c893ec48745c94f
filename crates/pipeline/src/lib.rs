//! Background jobs and the pieces they are assembled from.
//!
//! Each job owns its inputs, talks to storage, the database and external
//! services through trait objects, and reports its outcome to a webhook.
//! Handlers start jobs through [`spawner::JobSpawner`] and return
//! immediately.

pub mod dataset;
pub mod error;
pub mod generation;
pub mod hosted;
pub mod lora_cache;
pub mod spawner;
pub mod trainer;
pub mod training;
pub mod watermark;

#[cfg(test)]
pub(crate) mod testing;

pub use error::JobError;
