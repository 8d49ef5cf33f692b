//! Object and segment lifecycle: begin, segment commits, object commits.

use crate::adapter::{
    InlineSegmentRow, ObjectCommitInfo, SegmentForCommit, SegmentOffsetUpdate, TransactionAdapter,
};
use crate::error::{MetabaseError, MetabaseResult};
use crate::metrics;
use crate::models::{IfNoneMatch, Object, ObjectStatus};
use crate::precommit::{PrecommitConstraint, PrecommitConstraintResult, precommit_constraint};
use crate::Metabase;
use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;
use vantage_core::{
    EncryptedUserData, EncryptionParameters, MetabaseConfig, ObjectStream, PieceId, Pieces,
    RedundancyScheme, Retention, SegmentPosition, CipherSuite, NEXT_VERSION,
};

/// Arguments for starting an object upload with automatic version assignment.
#[derive(Clone, Debug)]
pub struct BeginObjectNextVersion {
    pub stream: ObjectStream,

    pub expires_at: Option<OffsetDateTime>,
    pub zombie_deletion_deadline: Option<OffsetDateTime>,

    pub encrypted_user_data: EncryptedUserData,
    pub encryption: EncryptionParameters,

    pub retention: Retention,
    pub legal_hold: bool,

    /// Commit-batching hint for backends with deferred commits.
    pub max_commit_delay: Option<Duration>,
}

impl BeginObjectNextVersion {
    fn verify(&self) -> MetabaseResult<()> {
        self.stream.verify()?;
        if self.stream.version != NEXT_VERSION {
            return Err(MetabaseError::InvalidRequest(
                "Version should be the next-version sentinel".into(),
            ));
        }
        self.encrypted_user_data.verify()?;
        self.retention.verify()?;
        verify_expiry_and_lock(self.expires_at, &self.retention, self.legal_hold)
    }
}

/// Arguments for starting an object upload with a caller-chosen version.
///
/// Intended only for tests; production uploads always use automatic version
/// assignment.
#[derive(Clone, Debug)]
pub struct BeginObjectExactVersion {
    pub stream: ObjectStream,

    pub expires_at: Option<OffsetDateTime>,
    pub zombie_deletion_deadline: Option<OffsetDateTime>,

    pub encrypted_user_data: EncryptedUserData,
    pub encryption: EncryptionParameters,

    pub retention: Retention,
    pub legal_hold: bool,
}

impl BeginObjectExactVersion {
    fn verify(&self) -> MetabaseResult<()> {
        self.stream.verify()?;
        if self.stream.version == NEXT_VERSION {
            return Err(MetabaseError::InvalidRequest(
                "Version should not be the next-version sentinel".into(),
            ));
        }
        self.encrypted_user_data.verify()?;
        self.retention.verify()?;
        verify_expiry_and_lock(self.expires_at, &self.retention, self.legal_hold)
    }
}

/// Arguments for checking whether a segment upload may start.
#[derive(Clone, Debug)]
pub struct BeginSegment {
    pub stream: ObjectStream,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,
    pub pieces: Pieces,
    /// Skip the pending-parent check when the caller already performed it.
    pub object_exists_checked: bool,
}

/// Arguments for committing a remote segment.
#[derive(Clone, Debug)]
pub struct CommitSegment {
    pub stream: ObjectStream,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,

    pub expires_at: Option<OffsetDateTime>,

    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,

    /// Offset in the original data stream.
    pub plain_offset: i64,
    /// Size before encryption.
    pub plain_size: i32,
    /// Segment size after encryption.
    pub encrypted_size: i32,

    pub encrypted_etag: Option<Vec<u8>>,

    pub redundancy: RedundancyScheme,
    pub pieces: Pieces,

    pub placement: i32,

    pub max_commit_delay: Option<Duration>,
}

impl CommitSegment {
    fn verify(&self) -> MetabaseResult<()> {
        self.stream.verify()?;
        self.pieces.verify()?;
        if self.root_piece_id.is_zero() {
            return Err(MetabaseError::InvalidRequest("RootPieceID missing".into()));
        }
        if self.encrypted_key.is_empty() {
            return Err(MetabaseError::InvalidRequest("EncryptedKey missing".into()));
        }
        if self.encrypted_key_nonce.is_empty() {
            return Err(MetabaseError::InvalidRequest(
                "EncryptedKeyNonce missing".into(),
            ));
        }
        if self.encrypted_size <= 0 {
            return Err(MetabaseError::InvalidRequest(
                "EncryptedSize negative or zero".into(),
            ));
        }
        if self.plain_offset < 0 {
            return Err(MetabaseError::InvalidRequest("PlainOffset negative".into()));
        }
        if self.redundancy.is_zero() {
            return Err(MetabaseError::InvalidRequest("Redundancy zero".into()));
        }
        if self.pieces.len() < self.redundancy.optimal_shares as usize {
            return Err(MetabaseError::InvalidRequest(
                "number of pieces is less than redundancy optimal shares value".into(),
            ));
        }
        Ok(())
    }
}

/// Arguments for committing an inline segment.
#[derive(Clone, Debug)]
pub struct CommitInlineSegment {
    pub stream: ObjectStream,
    pub position: SegmentPosition,

    pub expires_at: Option<OffsetDateTime>,

    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,

    pub plain_offset: i64,
    pub plain_size: i32,
    pub encrypted_etag: Option<Vec<u8>>,

    pub inline_data: Vec<u8>,

    pub max_commit_delay: Option<Duration>,
}

impl CommitInlineSegment {
    fn verify(&self) -> MetabaseResult<()> {
        if self.encrypted_key.is_empty() {
            return Err(MetabaseError::InvalidRequest("EncryptedKey missing".into()));
        }
        if self.encrypted_key_nonce.is_empty() {
            return Err(MetabaseError::InvalidRequest(
                "EncryptedKeyNonce missing".into(),
            ));
        }
        if self.plain_offset < 0 {
            return Err(MetabaseError::InvalidRequest("PlainOffset negative".into()));
        }
        Ok(())
    }
}

/// Arguments for committing an object.
#[derive(Clone, Debug)]
pub struct CommitObject {
    pub stream: ObjectStream,

    pub encryption: EncryptionParameters,

    /// Replace any metadata set at begin time with the fields below.
    pub override_encrypted_metadata: bool,
    pub encrypted_user_data: EncryptedUserData,

    /// Refuse the commit if it would delete a prior version.
    pub disallow_delete: bool,

    /// Whether the object is allowed to keep multiple versions.
    pub versioned: bool,

    pub max_commit_delay: Option<Duration>,

    /// Conditional write: fail when a committed object already exists.
    pub if_none_match: IfNoneMatch,
}

impl CommitObject {
    fn verify(&self) -> MetabaseResult<()> {
        self.stream.verify()?;
        if self.encryption.cipher_suite != CipherSuite::Unspecified && self.encryption.block_size <= 0
        {
            return Err(MetabaseError::InvalidRequest(
                "Encryption.BlockSize is negative or zero".into(),
            ));
        }
        if self.override_encrypted_metadata {
            self.encrypted_user_data.verify()?;
        }
        self.if_none_match.verify()
    }
}

/// Payload of the single segment of an inline object commit.
#[derive(Clone, Debug)]
pub struct InlineSegmentData {
    pub position: SegmentPosition,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub plain_size: i32,
    pub encrypted_etag: Option<Vec<u8>>,
    pub inline_data: Vec<u8>,
}

/// Arguments for the one-shot commit of a small inline object.
#[derive(Clone, Debug)]
pub struct CommitInlineObject {
    pub stream: ObjectStream,
    pub segment: InlineSegmentData,

    pub expires_at: Option<OffsetDateTime>,

    pub encrypted_user_data: EncryptedUserData,
    pub encryption: EncryptionParameters,

    pub retention: Retention,
    pub legal_hold: bool,

    pub disallow_delete: bool,
    pub versioned: bool,

    pub if_none_match: IfNoneMatch,
}

impl CommitInlineObject {
    fn verify(&self) -> MetabaseResult<()> {
        self.stream.verify()?;
        if self.segment.encrypted_key.is_empty() {
            return Err(MetabaseError::InvalidRequest("EncryptedKey missing".into()));
        }
        if self.segment.encrypted_key_nonce.is_empty() {
            return Err(MetabaseError::InvalidRequest(
                "EncryptedKeyNonce missing".into(),
            ));
        }
        if self.encryption.cipher_suite != CipherSuite::Unspecified && self.encryption.block_size <= 0
        {
            return Err(MetabaseError::InvalidRequest(
                "Encryption.BlockSize is negative or zero".into(),
            ));
        }
        self.encrypted_user_data.verify()?;
        self.retention.verify()?;
        verify_expiry_and_lock(self.expires_at, &self.retention, self.legal_hold)?;
        self.if_none_match.verify()
    }
}

fn verify_expiry_and_lock(
    expires_at: Option<OffsetDateTime>,
    retention: &Retention,
    legal_hold: bool,
) -> MetabaseResult<()> {
    if expires_at.is_some() {
        if retention.enabled() {
            return Err(MetabaseError::ObjectExpiration(
                "ExpiresAt must not be set if Retention is set".into(),
            ));
        }
        if legal_hold {
            return Err(MetabaseError::ObjectExpiration(
                "ExpiresAt must not be set if LegalHold is set".into(),
            ));
        }
    }
    Ok(())
}

impl Metabase {
    /// Add a pending object with an automatically assigned version:
    /// `max(version at location) + 1`, or 1 for an empty location.
    pub async fn begin_object_next_version(
        &self,
        mut opts: BeginObjectNextVersion,
    ) -> MetabaseResult<Object> {
        opts.verify()?;

        if opts.zombie_deletion_deadline.is_none() {
            opts.zombie_deletion_deadline =
                Some(OffsetDateTime::now_utc() + self.config().zombie_deletion_period());
        }

        let object = self
            .choose_adapter(opts.stream.project_id)
            .begin_object_next_version(&opts)
            .await?;

        metrics::OBJECT_BEGIN.inc();
        Ok(object)
    }

    /// Add a pending object with a caller-chosen version. Testing only; a
    /// duplicate version fails with `object-already-exists`.
    pub async fn testing_begin_object_exact_version(
        &self,
        mut opts: BeginObjectExactVersion,
    ) -> MetabaseResult<Object> {
        opts.verify()?;

        if opts.zombie_deletion_deadline.is_none() {
            opts.zombie_deletion_deadline =
                Some(OffsetDateTime::now_utc() + self.config().zombie_deletion_period());
        }

        let object = self
            .choose_adapter(opts.stream.project_id)
            .begin_object_exact_version(&opts)
            .await?;

        metrics::OBJECT_BEGIN.inc();
        Ok(object)
    }

    /// Verify that a new segment upload can start under a pending object.
    /// Performs no writes.
    pub async fn begin_segment(&self, opts: BeginSegment) -> MetabaseResult<()> {
        opts.stream.verify()?;
        opts.pieces.verify()?;
        if opts.root_piece_id.is_zero() {
            return Err(MetabaseError::InvalidRequest("RootPieceID missing".into()));
        }

        if !opts.object_exists_checked {
            let exists = self
                .choose_adapter(opts.stream.project_id)
                .pending_object_exists(&opts)
                .await?;
            if !exists {
                return Err(MetabaseError::PendingObjectMissing);
            }
        }

        metrics::SEGMENT_BEGIN.inc();
        Ok(())
    }

    /// Commit a remote segment under its pending parent. Repeating the call
    /// with the same position fully overwrites the row.
    pub async fn commit_segment(&self, opts: CommitSegment) -> MetabaseResult<()> {
        opts.verify()?;

        let alias_pieces = self.alias_cache().ensure_pieces_to_aliases(&opts.pieces).await?;

        self.choose_adapter(opts.stream.project_id)
            .commit_pending_segment(&opts, &alias_pieces)
            .await?;

        metrics::SEGMENT_COMMIT.inc();
        metrics::SEGMENT_COMMIT_ENCRYPTED_SIZE.observe(opts.encrypted_size as f64);
        Ok(())
    }

    /// Commit an inline segment under its pending parent.
    pub async fn commit_inline_segment(&self, opts: CommitInlineSegment) -> MetabaseResult<()> {
        opts.stream.verify()?;
        opts.verify()?;

        self.choose_adapter(opts.stream.project_id)
            .commit_inline_segment(&opts)
            .await?;

        metrics::SEGMENT_COMMIT.inc();
        metrics::SEGMENT_COMMIT_ENCRYPTED_SIZE.observe(opts.inline_data.len() as f64);
        Ok(())
    }

    /// Promote a pending object to committed, sealing its totals. Any prior
    /// committed object occupying the unversioned slot is deleted first.
    pub async fn commit_object(&self, opts: CommitObject) -> MetabaseResult<Object> {
        opts.verify()?;

        let (object, precommit) = self
            .choose_adapter(opts.stream.project_id)
            .commit_object(&opts, self.config())
            .await?;

        precommit.submit_metrics();
        metrics::OBJECT_COMMIT.inc();
        metrics::OBJECT_COMMIT_SEGMENTS.observe(object.segment_count as f64);
        metrics::OBJECT_COMMIT_ENCRYPTED_SIZE.observe(object.total_encrypted_size as f64);
        Ok(object)
    }

    /// One-shot commit of a small object stored inline, with no prior
    /// pending row.
    pub async fn commit_inline_object(&self, opts: CommitInlineObject) -> MetabaseResult<Object> {
        opts.verify()?;

        let (object, precommit) = self
            .choose_adapter(opts.stream.project_id)
            .commit_inline_object(&opts)
            .await?;

        precommit.submit_metrics();
        metrics::OBJECT_COMMIT.inc();
        metrics::OBJECT_COMMIT_SEGMENTS.observe(object.segment_count as f64);
        metrics::OBJECT_COMMIT_ENCRYPTED_SIZE.observe(object.total_encrypted_size as f64);
        Ok(object)
    }
}

/// The commit-object transaction body, shared by both adapters. The adapter
/// owns the transaction and may re-enter this function on a retriable
/// failure.
pub(crate) async fn commit_object_tx(
    tx: &mut dyn TransactionAdapter,
    opts: &CommitObject,
    config: &MetabaseConfig,
) -> MetabaseResult<(Object, PrecommitConstraintResult)> {
    let segments = tx.fetch_segments_for_commit(opts.stream.stream_id).await?;

    validate_parts(&segments, config)?;

    let (final_segments, offset_updates) = assign_plain_offsets(&segments);
    tx.update_segment_offsets(opts.stream.stream_id, &offset_updates)
        .await?;

    let fixed_segment_size = fixed_segment_size(&final_segments);
    let total_plain_size: i64 = final_segments.iter().map(|s| s.plain_size as i64).sum();
    let total_encrypted_size: i64 = final_segments
        .iter()
        .map(|s| s.encrypted_size as i64)
        .sum();

    let precommit = precommit_constraint(
        tx,
        &PrecommitConstraint {
            location: opts.stream.location(),
            versioned: opts.versioned,
            disallow_delete: opts.disallow_delete,
            check_existence: opts.if_none_match.all(),
        },
    )
    .await?;

    let mut next_version = opts.stream.version;
    if next_version < precommit.highest_version {
        next_version = precommit.highest_version + 1;
    }

    let object = tx
        .finalize_object_commit(
            opts,
            &ObjectCommitInfo {
                next_status: ObjectStatus::committed(opts.versioned),
                next_version,
                segment_count: final_segments.len() as i32,
                total_plain_size,
                total_encrypted_size,
                fixed_segment_size,
            },
        )
        .await?;

    Ok((object, precommit))
}

/// The commit-inline-object transaction body, shared by both adapters.
pub(crate) async fn commit_inline_object_tx(
    tx: &mut dyn TransactionAdapter,
    opts: &CommitInlineObject,
) -> MetabaseResult<(Object, PrecommitConstraintResult)> {
    let precommit = precommit_constraint(
        tx,
        &PrecommitConstraint {
            location: opts.stream.location(),
            versioned: opts.versioned,
            disallow_delete: opts.disallow_delete,
            check_existence: opts.if_none_match.all(),
        },
    )
    .await?;

    let encrypted_size = opts.segment.inline_data.len() as i32;

    let mut object = Object {
        project_id: opts.stream.project_id,
        bucket_name: opts.stream.bucket_name.clone(),
        object_key: opts.stream.object_key.clone(),
        version: precommit.highest_version + 1,
        stream_id: opts.stream.stream_id,
        created_at: OffsetDateTime::UNIX_EPOCH,
        expires_at: opts.expires_at,
        status: ObjectStatus::committed(opts.versioned),
        segment_count: 1,
        encrypted_user_data: opts.encrypted_user_data.clone(),
        total_plain_size: opts.segment.plain_size as i64,
        total_encrypted_size: encrypted_size as i64,
        fixed_segment_size: opts.segment.plain_size,
        encryption: opts.encryption,
        zombie_deletion_deadline: None,
        retention: opts.retention,
        legal_hold: opts.legal_hold,
    };

    object.created_at = tx.insert_committed_object(&object).await?;

    // An inline segment with zero bytes is still recorded.
    tx.insert_inline_segment(&InlineSegmentRow {
        stream_id: opts.stream.stream_id,
        position: opts.segment.position,
        expires_at: opts.expires_at,
        encrypted_key_nonce: opts.segment.encrypted_key_nonce.clone(),
        encrypted_key: opts.segment.encrypted_key.clone(),
        encrypted_size,
        encrypted_etag: opts.segment.encrypted_etag.clone(),
        plain_size: opts.segment.plain_size,
        plain_offset: 0,
        inline_data: opts.segment.inline_data.clone(),
    })
    .await?;

    Ok((object, precommit))
}

fn validate_parts(segments: &[SegmentForCommit], config: &MetabaseConfig) -> MetabaseResult<()> {
    let mut part_sizes: BTreeMap<u32, i64> = BTreeMap::new();
    for segment in segments {
        *part_sizes.entry(segment.position.part).or_default() += segment.plain_size as i64;
    }

    if part_sizes.len() > config.max_number_of_parts {
        return Err(MetabaseError::PreconditionFailed(format!(
            "exceeded maximum number of parts: {}",
            config.max_number_of_parts
        )));
    }

    let last_part = part_sizes.keys().next_back().copied().unwrap_or(0);
    for (&part, &size) in &part_sizes {
        // The last part has no minimum size.
        if part == last_part {
            continue;
        }
        if size < config.min_part_size {
            return Err(MetabaseError::PreconditionFailed(format!(
                "size of part number {part} is below minimum threshold, got: {size}, min: {}",
                config.min_part_size
            )));
        }
    }

    Ok(())
}

/// Recompute plain offsets as the running sum of plain sizes in position
/// order, returning the final segment states and the rewrites needed.
fn assign_plain_offsets(
    segments: &[SegmentForCommit],
) -> (Vec<SegmentForCommit>, Vec<SegmentOffsetUpdate>) {
    let mut finals = segments.to_vec();
    let mut updates = Vec::new();
    let mut offset: i64 = 0;
    for segment in &mut finals {
        if segment.plain_offset != offset {
            updates.push(SegmentOffsetUpdate {
                position: segment.position,
                plain_offset: offset,
            });
            segment.plain_offset = offset;
        }
        offset += segment.plain_size as i64;
    }
    (finals, updates)
}

/// The common plain size of all but the last segment, when positions form a
/// contiguous (part 0, index i) run; -1 otherwise.
fn fixed_segment_size(segments: &[SegmentForCommit]) -> i32 {
    if segments.is_empty() {
        return 0;
    }
    let fixed = segments[0].plain_size;
    for (i, segment) in segments.iter().enumerate() {
        if segment.position.part != 0 || segment.position.index != i as u32 {
            return -1;
        }
        if i < segments.len() - 1 && segment.plain_size != fixed {
            return -1;
        }
    }
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(part: u32, index: u32, plain_size: i32, plain_offset: i64) -> SegmentForCommit {
        SegmentForCommit {
            position: SegmentPosition::new(part, index),
            encrypted_size: plain_size + 16,
            plain_offset,
            plain_size,
        }
    }

    #[test]
    fn offsets_form_contiguous_cover() {
        let segments = vec![
            segment(0, 0, 100, 0),
            segment(0, 1, 50, 999), // wrong stored offset
            segment(1, 0, 25, 0),
        ];
        let (finals, updates) = assign_plain_offsets(&segments);
        assert_eq!(finals[0].plain_offset, 0);
        assert_eq!(finals[1].plain_offset, 100);
        assert_eq!(finals[2].plain_offset, 150);
        // Only the two wrong offsets get rewritten.
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].position, SegmentPosition::new(0, 1));
        assert_eq!(updates[1].position, SegmentPosition::new(1, 0));
    }

    #[test]
    fn fixed_size_for_uniform_single_part() {
        let segments = vec![
            segment(0, 0, 100, 0),
            segment(0, 1, 100, 100),
            segment(0, 2, 40, 200), // last may be shorter
        ];
        assert_eq!(fixed_segment_size(&segments), 100);
    }

    #[test]
    fn fixed_size_is_negative_for_multipart_or_varying() {
        assert_eq!(fixed_segment_size(&[]), 0);
        assert_eq!(
            fixed_segment_size(&[segment(0, 0, 100, 0), segment(1, 0, 100, 100)]),
            -1
        );
        assert_eq!(
            fixed_segment_size(&[
                segment(0, 0, 100, 0),
                segment(0, 1, 60, 100),
                segment(0, 2, 100, 160)
            ]),
            -1
        );
        // A gap in indexes disqualifies a fixed size.
        assert_eq!(
            fixed_segment_size(&[segment(0, 0, 100, 0), segment(0, 2, 100, 100)]),
            -1
        );
    }

    #[test]
    fn parts_below_minimum_are_rejected() {
        let config = MetabaseConfig {
            min_part_size: 100,
            ..Default::default()
        };
        // Non-terminal part 0 is too small.
        let segments = vec![segment(0, 0, 10, 0), segment(1, 0, 10, 10)];
        assert!(validate_parts(&segments, &config).is_err());

        // A single part has no minimum.
        let single = vec![segment(0, 0, 10, 0)];
        assert!(validate_parts(&single, &config).is_ok());
    }

    #[test]
    fn too_many_parts_are_rejected() {
        let config = MetabaseConfig {
            max_number_of_parts: 2,
            min_part_size: 1,
            ..Default::default()
        };
        let segments = vec![
            segment(0, 0, 10, 0),
            segment(1, 0, 10, 10),
            segment(2, 0, 10, 20),
        ];
        assert!(validate_parts(&segments, &config).is_err());
    }
}
