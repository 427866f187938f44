//! Scheduler state documents: per-track cycle state and leases
//!
//! `TrackStateDoc` persists the last successful cycle so a restarted
//! scheduler can decide whether a catch-up cycle is due. `TrackLeaseDoc`
//! is the cluster-wide mutual-exclusion record: acquisition is a single
//! conditional upsert on `(track, expires_at)`.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for track cycle state
pub const TRACK_STATE_COLLECTION: &str = "track_state";

/// Collection name for track leases
pub const TRACK_LEASE_COLLECTION: &str = "track_leases";

/// Persisted cycle state for one accrual track
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrackStateDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Track name ("uni", "ton_boost")
    pub track: String,

    /// When the last successful cycle completed
    pub last_cycle_at: DateTime,

    /// The intended tick time of that cycle (drift-corrected base)
    pub last_intended_at: DateTime,

    /// Total cycles completed on this track
    #[serde(default)]
    pub cycles_run: i64,
}

impl Default for TrackStateDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            track: String::new(),
            last_cycle_at: DateTime::now(),
            last_intended_at: DateTime::now(),
            cycles_run: 0,
        }
    }
}

impl IntoIndexes for TrackStateDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "track": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("track_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for TrackStateDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Lease record for the single-runner guarantee
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrackLeaseDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Track name, one lease per track
    pub track: String,

    /// Instance id of the current holder
    pub holder: String,

    /// Lease expiry; a lease past this instant is free for the taking
    pub expires_at: DateTime,
}

impl Default for TrackLeaseDoc {
    fn default() -> Self {
        Self {
            _id: None,
            metadata: Metadata::default(),
            track: String::new(),
            holder: String::new(),
            expires_at: DateTime::now(),
        }
    }
}

impl IntoIndexes for TrackLeaseDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "track": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("track_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for TrackLeaseDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
