//! Explicit deletes and delete-marker placement.

use crate::adapter::{PrecommitCandidate, TransactionAdapter};
use crate::error::{MetabaseError, MetabaseResult};
use crate::models::{Object, ObjectStatus};
use crate::precommit::PrecommitDeletedObject;
use crate::Metabase;
use time::OffsetDateTime;
use uuid::Uuid;
use vantage_core::{EncryptedUserData, EncryptionParameters, ObjectLocation, Retention};

/// Arguments for deleting the last committed object at a location.
#[derive(Clone, Debug)]
pub struct DeleteObjectLastCommitted {
    pub location: ObjectLocation,
    /// Versioned buckets hide the key behind a delete marker instead of
    /// removing data.
    pub versioned: bool,
}

/// Result of a delete: either a new marker or the removed rows.
#[derive(Clone, Debug, Default)]
pub struct DeleteObjectResult {
    /// The delete marker placed by a versioned delete.
    pub marker: Option<Object>,
    /// Objects removed by an unversioned delete.
    pub removed: Vec<PrecommitDeletedObject>,
    /// Segments removed together with the objects.
    pub deleted_segment_count: u64,
}

impl Metabase {
    /// Delete the last committed object at a location. With `versioned` a
    /// delete marker is inserted above all existing versions; without it the
    /// unversioned slot is cleared together with its segments. The operation
    /// is idempotent: deleting an empty location returns an empty result.
    pub async fn delete_object_last_committed(
        &self,
        opts: DeleteObjectLastCommitted,
    ) -> MetabaseResult<DeleteObjectResult> {
        opts.location.verify()?;

        self.choose_adapter(opts.location.project_id)
            .delete_object_last_committed(&opts)
            .await
    }
}

/// Transaction body shared by both adapters.
pub(crate) async fn delete_object_last_committed_tx(
    tx: &mut dyn TransactionAdapter,
    opts: &DeleteObjectLastCommitted,
) -> MetabaseResult<DeleteObjectResult> {
    let now = OffsetDateTime::now_utc();
    let candidates = tx.query_objects_at_location(&opts.location).await?;
    let highest_version = candidates.first().map(|c| c.version).unwrap_or(0);

    if opts.versioned {
        let version = highest_version + 1;
        let stream_id = Uuid::new_v4();
        let status = ObjectStatus::DeleteMarkerVersioned;
        let created_at = tx
            .insert_delete_marker(&opts.location, version, stream_id, status)
            .await?;

        return Ok(DeleteObjectResult {
            marker: Some(Object {
                project_id: opts.location.project_id,
                bucket_name: opts.location.bucket_name.clone(),
                object_key: opts.location.object_key.clone(),
                version,
                stream_id,
                created_at,
                expires_at: None,
                status,
                segment_count: 0,
                encrypted_user_data: EncryptedUserData::default(),
                total_plain_size: 0,
                total_encrypted_size: 0,
                fixed_segment_size: 0,
                encryption: EncryptionParameters::default(),
                zombie_deletion_deadline: None,
                retention: Retention::None,
                legal_hold: false,
            }),
            ..Default::default()
        });
    }

    let doomed: Vec<&PrecommitCandidate> = candidates
        .iter()
        .filter(|c| c.status.is_unversioned())
        .collect();

    if doomed.is_empty() {
        return Ok(DeleteObjectResult::default());
    }

    for candidate in &doomed {
        let expired = candidate.expires_at.is_some_and(|at| at <= now);
        if expired {
            continue;
        }
        if candidate.legal_hold {
            return Err(MetabaseError::ObjectLock(
                "object is protected by a legal hold".into(),
            ));
        }
        if candidate.retention.active(now) {
            return Err(MetabaseError::ObjectLock(
                "object is protected by an active retention period".into(),
            ));
        }
    }

    let versions: Vec<_> = doomed.iter().map(|c| c.version).collect();
    let streams: Vec<_> = doomed.iter().map(|c| c.stream_id).collect();

    tx.delete_objects_by_versions(&opts.location, &versions).await?;
    let deleted_segment_count = tx.delete_segments_by_streams(&streams).await?;

    Ok(DeleteObjectResult {
        marker: None,
        removed: doomed
            .iter()
            .map(|c| PrecommitDeletedObject {
                version: c.version,
                stream_id: c.stream_id,
                status: c.status,
            })
            .collect(),
        deleted_segment_count,
    })
}
