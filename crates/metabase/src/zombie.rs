//! Zombie cleanup: pending objects whose deadline passed.

use crate::adapter::TransactionAdapter;
use crate::error::MetabaseResult;
use crate::metrics;
use crate::Metabase;
use time::OffsetDateTime;
use uuid::Uuid;

/// Arguments for one zombie-deletion sweep. Invoked by an external scheduler.
#[derive(Clone, Debug)]
pub struct DeleteZombieObjects {
    /// Only pending objects whose deadline is strictly before this are
    /// removed.
    pub deadline_before: OffsetDateTime,
    /// Rows per deletion batch; 0 uses the default.
    pub batch_size: usize,
}

const DEFAULT_ZOMBIE_BATCH_SIZE: usize = 100;

/// Counts removed by a sweep.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZombieDeletionResult {
    pub deleted_objects: u64,
    pub deleted_segments: u64,
}

impl Metabase {
    /// Delete pending objects past their zombie deadline, with their
    /// segments, in bounded batches across every adapter. Idempotent.
    pub async fn delete_zombie_objects(
        &self,
        mut opts: DeleteZombieObjects,
    ) -> MetabaseResult<ZombieDeletionResult> {
        if opts.batch_size == 0 {
            opts.batch_size = DEFAULT_ZOMBIE_BATCH_SIZE;
        }

        let mut total = ZombieDeletionResult::default();
        for adapter in self.adapters() {
            let result = adapter.delete_zombie_objects(&opts).await?;
            total.deleted_objects += result.deleted_objects;
            total.deleted_segments += result.deleted_segments;
        }

        if total.deleted_objects > 0 {
            tracing::info!(
                deleted_objects = total.deleted_objects,
                deleted_segments = total.deleted_segments,
                "zombie deletion sweep finished"
            );
        }
        metrics::ZOMBIE_DELETED_OBJECTS.inc_by(total.deleted_objects);
        metrics::ZOMBIE_DELETED_SEGMENTS.inc_by(total.deleted_segments);
        Ok(total)
    }
}

/// One bounded deletion batch inside an open transaction. Returns the counts
/// and whether a full batch was found (more work may remain).
pub(crate) async fn delete_zombie_batch_tx(
    tx: &mut dyn TransactionAdapter,
    deadline: OffsetDateTime,
    batch_size: usize,
) -> MetabaseResult<(ZombieDeletionResult, bool)> {
    let candidates = tx.find_zombie_objects(deadline, batch_size).await?;
    if candidates.is_empty() {
        return Ok((ZombieDeletionResult::default(), false));
    }

    let mut deleted_objects = 0u64;
    for candidate in &candidates {
        deleted_objects += tx.delete_zombie_object(candidate).await?;
    }

    let streams: Vec<Uuid> = candidates.iter().map(|c| c.stream_id).collect();
    let deleted_segments = tx.delete_segments_by_streams(&streams).await?;

    Ok((
        ZombieDeletionResult {
            deleted_objects,
            deleted_segments,
        },
        candidates.len() == batch_size,
    ))
}
