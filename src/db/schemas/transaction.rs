//! Ledger transaction document schema
//!
//! Transactions are immutable once written; corrections are new offsetting
//! entries. The unique index on `(related_position_id, epoch_key)` is the
//! idempotency anchor for the whole engine: a duplicate insert for the same
//! elapsed window is rejected by the database, not by application logic.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::{Amount, Currency, OwnerId, TxKind};

/// Collection name for ledger transactions
pub const TRANSACTION_COLLECTION: &str = "transactions";

/// Ledger transaction stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TransactionDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Stable transaction identifier (UUID string)
    pub tx_id: String,

    /// Credited (or debited) user
    pub owner_id: OwnerId,

    /// Transaction kind, closed set
    pub kind: TxKind,

    pub currency: Currency,

    /// Signed amount in nano-units; accruals and commissions are positive
    pub amount: Amount,

    /// Position this accrual belongs to; None for commissions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_position_id: Option<String>,

    /// For commissions: the user whose accrual triggered the credit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_owner_id: Option<OwnerId>,

    /// For commissions: referral level (1..=20)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,

    /// Deterministic idempotency key:
    /// accruals `"{position_id}:{watermark_before_millis}"`,
    /// commissions `"{origin_tx_id}:L{level}"`.
    pub epoch_key: String,

    /// For accruals: set once the commission walk runs to completion.
    /// Absent or false means the reconciliation feed still owns this
    /// transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_settled: Option<bool>,

    pub created_at: DateTime,
}

impl Default for TransactionDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            tx_id: String::new(),
            owner_id: 0,
            kind: TxKind::Adjustment,
            currency: Currency::Uni,
            amount: Amount::ZERO,
            related_position_id: None,
            source_owner_id: None,
            level: None,
            epoch_key: String::new(),
            distribution_settled: None,
            created_at: DateTime::now(),
        }
    }
}

impl IntoIndexes for TransactionDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // The idempotency anchor
            (
                doc! { "related_position_id": 1, "epoch_key": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("epoch_key_unique".to_string())
                        .build(),
                ),
            ),
            // Per-owner history, newest first
            (
                doc! { "owner_id": 1, "created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("owner_history_index".to_string())
                        .build(),
                ),
            ),
            // Reconciliation feed scans recent accruals by kind
            (
                doc! { "kind": 1, "created_at": -1 },
                Some(
                    IndexOptions::builder()
                        .name("kind_created_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for TransactionDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
