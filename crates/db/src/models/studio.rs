//! Studio rows.
//!
//! Studios are created and mostly owned by the web application. Jobs only
//! flip the status, attach weights, and read the row back (minus
//! `metadata`) for notifications, so the row itself stays an opaque JSON
//! object.

use serde::{Deserialize, Serialize};

/// Status written once local training has uploaded its weights.
pub const STATUS_COMPLETED: &str = "COMPLETED";

/// Column excluded from studio snapshots sent to the application.
pub const PRIVATE_COLUMN: &str = "metadata";

/// Weights attached to a studio after hosted training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudioWeights {
    /// Object key in the weights bucket.
    pub weights: String,
    /// Training id assigned by the hosted provider.
    pub provider_id: String,
}

/// A studio row as JSON, without [`PRIVATE_COLUMN`].
pub type StudioSnapshot = serde_json::Value;
