//! Referral edge document schema
//!
//! `child -> parent`, one parent per child, written once by the
//! registration subsystem. Read-only to the accrual core. The structure is
//! weakly validated upstream, so consumers must not assume it is acyclic.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::OwnerId;

/// Collection name for referral edges
pub const REFERRAL_COLLECTION: &str = "referral_edges";

/// Referral edge stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ReferralEdgeDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// The referred user
    pub child_id: OwnerId,

    /// The referrer; None marks a tree root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<OwnerId>,
}

impl IntoIndexes for ReferralEdgeDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "child_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("child_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for ReferralEdgeDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
