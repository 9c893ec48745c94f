//! Clients for the third-party services jobs hand work to: the
//! S3-compatible object store and the hosted LoRA training provider.

pub mod memory;
pub mod replicate;
pub mod s3;
pub mod storage;

pub use memory::MemoryStore;
pub use replicate::{ReplicateClient, ReplicateError, TrainingTarget};
pub use s3::{R2Config, S3Store};
pub use storage::{ObjectInfo, ObjectStore, PutOptions, StorageError};
