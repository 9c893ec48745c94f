//! Outbound notifications for studio jobs.
//!
//! - [`delivery::webhook`]: signed webhook POSTs with bounded retry. Delivery
//!   never fails the job that triggered it.
//! - [`payload`]: the JSON bodies sent when jobs finish.

pub mod delivery;
pub mod payload;

pub use delivery::webhook::{DeliveryOutcome, WebhookDelivery, WebhookError};
pub use payload::{AppNotification, GenerationCallback, TrainingCallback};
