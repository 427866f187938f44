//! Balance document schema
//!
//! One document per `(owner_id, currency)`, the single source of truth for
//! a user's balance. Mutated only with `$inc` alongside a transaction
//! insert; never updated without a matching ledger entry.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::{Amount, Currency, OwnerId};

/// Collection name for balances
pub const BALANCE_COLLECTION: &str = "balances";

/// Balance stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BalanceDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    pub owner_id: OwnerId,

    pub currency: Currency,

    /// Current balance in nano-units; invariant: never negative
    pub amount: Amount,
}

impl Default for BalanceDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            owner_id: 0,
            currency: Currency::Uni,
            amount: Amount::ZERO,
        }
    }
}

impl IntoIndexes for BalanceDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "owner_id": 1, "currency": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("owner_currency_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for BalanceDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
