//! Farming position document schema
//!
//! A position is created by the deposit subsystem and deactivated on full
//! withdrawal; between those events the accrual core owns its watermark.
//! `version` is the optimistic-concurrency counter: every watermark advance
//! is a compare-and-swap on `(position_id, version)`.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::{Amount, Currency, OwnerId, Rate};

/// Collection name for farming positions
pub const POSITION_COLLECTION: &str = "farming_positions";

/// Farming position stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FarmingPositionDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Stable position identifier (UUID string)
    pub position_id: String,

    /// Owning user
    pub owner_id: OwnerId,

    /// Currency this position accrues
    pub currency: Currency,

    /// Deposited principal, never negative
    pub principal: Amount,

    /// Daily yield rate for this position's package
    pub daily_rate: Rate,

    /// Watermark: yield has been credited up to this instant.
    /// Monotonically non-decreasing.
    pub last_accrual_at: DateTime,

    /// Whether the position currently accrues
    #[serde(default)]
    pub active: bool,

    /// Optimistic-concurrency version, bumped on every watermark advance
    #[serde(default)]
    pub version: i64,
}

impl Default for FarmingPositionDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            position_id: String::new(),
            owner_id: 0,
            currency: Currency::Uni,
            principal: Amount::ZERO,
            daily_rate: Rate::from_ppm(0),
            last_accrual_at: DateTime::now(),
            active: false,
            version: 0,
        }
    }
}

impl IntoIndexes for FarmingPositionDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Unique index on position_id
            (
                doc! { "position_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("position_id_unique".to_string())
                        .build(),
                ),
            ),
            // Eligibility scan: active positions per currency ordered by watermark
            (
                doc! { "currency": 1, "active": 1, "last_accrual_at": 1 },
                Some(
                    IndexOptions::builder()
                        .name("eligibility_index".to_string())
                        .build(),
                ),
            ),
            // Owner lookup
            (
                doc! { "owner_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("owner_id_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for FarmingPositionDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
