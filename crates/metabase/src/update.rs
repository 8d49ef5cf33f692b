//! Segment repair and retention updates.

use crate::adapter::{ObjectLockInfo, TransactionAdapter};
use crate::error::{MetabaseError, MetabaseResult};
use crate::metrics;
use crate::Metabase;
use time::OffsetDateTime;
use uuid::Uuid;
use vantage_core::{
    AliasPieces, ObjectLocation, Pieces, RedundancyScheme, Retention, SegmentPosition, Version,
};

/// Arguments for replacing a remote segment's piece set after repair.
#[derive(Clone, Debug)]
pub struct UpdateSegmentPieces {
    /// Adapter expected to own the stream. When unset, all adapters are
    /// checked until the segment is found.
    pub adapter_name: Option<String>,

    pub stream_id: Uuid,
    pub position: SegmentPosition,

    pub old_pieces: Pieces,

    pub new_redundancy: RedundancyScheme,
    pub new_pieces: Pieces,

    /// New repair timestamp to stamp, when set.
    pub new_repaired_at: Option<OffsetDateTime>,
}

impl Metabase {
    /// Replace a segment's piece set. The update only applies if the stored
    /// set still equals `old_pieces`; a lost race fails with `value-changed`
    /// and leaves the row untouched.
    pub async fn update_segment_pieces(&self, opts: UpdateSegmentPieces) -> MetabaseResult<()> {
        if opts.stream_id.is_nil() {
            return Err(MetabaseError::InvalidRequest("StreamID missing".into()));
        }
        opts.old_pieces.verify()?;
        if opts.new_redundancy.is_zero() {
            return Err(MetabaseError::InvalidRequest("NewRedundancy zero".into()));
        }
        // Repair may leave fewer pieces than optimal shares, but never fewer
        // than repair shares.
        if opts.new_pieces.len() < opts.new_redundancy.repair_shares as usize {
            return Err(MetabaseError::InvalidRequest(
                "number of new pieces is less than new redundancy repair shares value".into(),
            ));
        }
        opts.new_pieces.verify()?;

        let old_pieces = self.alias_cache().ensure_pieces_to_aliases(&opts.old_pieces).await?;
        let new_pieces = self.alias_cache().ensure_pieces_to_aliases(&opts.new_pieces).await?;

        let mut result_pieces: Option<AliasPieces> = None;
        for adapter in self.adapters() {
            if let Some(name) = &opts.adapter_name {
                if name != adapter.name() {
                    continue;
                }
            }
            match adapter
                .update_segment_pieces(&opts, &old_pieces, &new_pieces)
                .await
            {
                Ok(pieces) => {
                    result_pieces = Some(pieces);
                    break;
                }
                Err(MetabaseError::SegmentNotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }

        let result_pieces =
            result_pieces.ok_or_else(|| MetabaseError::SegmentNotFound("segment missing".into()))?;

        if result_pieces != new_pieces {
            return Err(MetabaseError::ValueChanged(
                "segment piece set was changed".into(),
            ));
        }

        metrics::SEGMENT_UPDATE.inc();
        Ok(())
    }
}

/// Arguments for setting the retention of an exact object version.
#[derive(Clone, Debug)]
pub struct SetObjectExactVersionRetention {
    pub location: ObjectLocation,
    pub version: Version,
    pub retention: Retention,
}

/// Arguments for setting the retention of the newest committed version.
#[derive(Clone, Debug)]
pub struct SetObjectLastCommittedRetention {
    pub location: ObjectLocation,
    pub retention: Retention,
}

impl Metabase {
    /// Set the retention configuration of an exact object version.
    pub async fn set_object_exact_version_retention(
        &self,
        opts: SetObjectExactVersionRetention,
    ) -> MetabaseResult<()> {
        opts.location.verify()?;
        opts.retention.verify()?;

        self.choose_adapter(opts.location.project_id)
            .set_object_exact_version_retention(&opts)
            .await
    }

    /// Set the retention configuration of the most recently committed version
    /// at a location.
    pub async fn set_object_last_committed_retention(
        &self,
        opts: SetObjectLastCommittedRetention,
    ) -> MetabaseResult<()> {
        opts.location.verify()?;
        opts.retention.verify()?;

        self.choose_adapter(opts.location.project_id)
            .set_object_last_committed_retention(&opts)
            .await
    }
}

/// Transaction body for the exact-version retention update.
pub(crate) async fn set_exact_version_retention_tx(
    tx: &mut dyn TransactionAdapter,
    opts: &SetObjectExactVersionRetention,
) -> MetabaseResult<()> {
    let info = tx
        .object_lock_info_exact(&opts.location, opts.version)
        .await?
        .ok_or_else(|| MetabaseError::ObjectNotFound("object missing".into()))?;

    verify_retention_update(&info, &opts.retention, true)?;

    apply_retention(tx, &opts.location, opts.version, &opts.retention, info.legal_hold).await
}

/// Transaction body for the last-committed retention update: resolve the
/// newest committed version, then update it.
pub(crate) async fn set_last_committed_retention_tx(
    tx: &mut dyn TransactionAdapter,
    opts: &SetObjectLastCommittedRetention,
) -> MetabaseResult<()> {
    let (version, info) = tx
        .object_lock_info_last_committed(&opts.location)
        .await?
        .ok_or_else(|| MetabaseError::ObjectNotFound("object missing".into()))?;

    // The query only returns committed rows; no status check needed here.
    verify_retention_update(&info, &opts.retention, false)?;

    apply_retention(tx, &opts.location, version, &opts.retention, info.legal_hold).await
}

async fn apply_retention(
    tx: &mut dyn TransactionAdapter,
    location: &ObjectLocation,
    version: Version,
    retention: &Retention,
    legal_hold: bool,
) -> MetabaseResult<()> {
    let affected = tx
        .update_retention(location, version, retention, legal_hold)
        .await?;
    if affected == 0 {
        return Err(MetabaseError::ObjectNotFound("object missing".into()));
    }
    Ok(())
}

fn verify_retention_update(
    info: &ObjectLockInfo,
    new_retention: &Retention,
    check_status: bool,
) -> MetabaseResult<()> {
    if check_status && !info.status.is_committed() {
        return Err(MetabaseError::ObjectStatus(
            "Object Lock settings must only be placed on committed objects".into(),
        ));
    }
    if info.expires_at.is_some() {
        return Err(MetabaseError::ObjectExpiration(
            "Object Lock settings must not be placed on an object with an expiration date".into(),
        ));
    }
    info.retention.verify()?;

    if info.retention.active(OffsetDateTime::now_utc()) {
        if !new_retention.enabled() {
            return Err(MetabaseError::ObjectLock(
                "an active retention configuration cannot be removed".into(),
            ));
        }
        let current = info.retention.retain_until().expect("active retention has a timestamp");
        let requested = new_retention.retain_until().expect("enabled retention has a timestamp");
        if requested <= current {
            return Err(MetabaseError::ObjectLock(
                "retention period cannot be shortened".into(),
            ));
        }
    }

    Ok(())
}
