//! Backend adapter contracts.
//!
//! Each backend implements [`Adapter`] for whole operations and
//! [`TransactionAdapter`] for the row-level steps composed inside a single
//! transaction. The two concrete adapters differ in transactional flavor:
//! PostgreSQL runs interactive transactions committed explicitly, CockroachDB
//! re-enters the transaction body when the backend reports a retriable
//! serialization failure. Operation bodies therefore must not expose state
//! from failed attempts; the shared logic above the adapters never observes a
//! retry.

use crate::commit::{
    BeginObjectExactVersion, BeginObjectNextVersion, BeginSegment, CommitInlineObject,
    CommitInlineSegment, CommitObject, CommitSegment,
};
use crate::delete::{DeleteObjectLastCommitted, DeleteObjectResult};
use crate::error::MetabaseResult;
use crate::list::{ListObjects, ListObjectsResult};
use crate::models::{Object, ObjectStatus};
use crate::precommit::PrecommitConstraintResult;
use crate::update::{
    SetObjectExactVersionRetention, SetObjectLastCommittedRetention, UpdateSegmentPieces,
};
use crate::zombie::{DeleteZombieObjects, ZombieDeletionResult};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;
use vantage_core::{
    AliasPieces, MetabaseConfig, NodeAlias, NodeId, ObjectLocation, Retention, SegmentPosition,
    Version,
};

/// Per-backend implementation of metabase operations.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable adapter name, used for routing diagnostics and adapter scans.
    fn name(&self) -> &'static str;

    /// Apply the schema.
    async fn migrate(&self) -> MetabaseResult<()>;

    /// Check backend connectivity.
    async fn health_check(&self) -> MetabaseResult<()>;

    async fn begin_object_next_version(
        &self,
        opts: &BeginObjectNextVersion,
    ) -> MetabaseResult<Object>;

    async fn begin_object_exact_version(
        &self,
        opts: &BeginObjectExactVersion,
    ) -> MetabaseResult<Object>;

    /// Whether a pending object matching the stream exists.
    async fn pending_object_exists(&self, opts: &BeginSegment) -> MetabaseResult<bool>;

    /// Upsert a remote segment under its pending parent object.
    async fn commit_pending_segment(
        &self,
        opts: &CommitSegment,
        alias_pieces: &AliasPieces,
    ) -> MetabaseResult<()>;

    /// Upsert an inline segment under its pending parent object.
    async fn commit_inline_segment(&self, opts: &CommitInlineSegment) -> MetabaseResult<()>;

    /// Promote a pending object to committed within one transaction.
    async fn commit_object(
        &self,
        opts: &CommitObject,
        config: &MetabaseConfig,
    ) -> MetabaseResult<(Object, PrecommitConstraintResult)>;

    /// Insert a small committed object and its single inline segment in one
    /// transaction, with no prior pending row.
    async fn commit_inline_object(
        &self,
        opts: &CommitInlineObject,
    ) -> MetabaseResult<(Object, PrecommitConstraintResult)>;

    /// Conditionally replace a remote segment's piece set, returning the
    /// post-update stored set.
    async fn update_segment_pieces(
        &self,
        opts: &UpdateSegmentPieces,
        old_pieces: &AliasPieces,
        new_pieces: &AliasPieces,
    ) -> MetabaseResult<AliasPieces>;

    async fn set_object_exact_version_retention(
        &self,
        opts: &SetObjectExactVersionRetention,
    ) -> MetabaseResult<()>;

    async fn set_object_last_committed_retention(
        &self,
        opts: &SetObjectLastCommittedRetention,
    ) -> MetabaseResult<()>;

    async fn delete_object_last_committed(
        &self,
        opts: &DeleteObjectLastCommitted,
    ) -> MetabaseResult<DeleteObjectResult>;

    /// Remove pending objects whose zombie deadline passed, in bounded
    /// batches.
    async fn delete_zombie_objects(
        &self,
        opts: &DeleteZombieObjects,
    ) -> MetabaseResult<ZombieDeletionResult>;

    async fn list_objects(&self, opts: &ListObjects) -> MetabaseResult<ListObjectsResult>;

    /// Allocate aliases for any unseen node ids.
    async fn ensure_node_aliases(&self, nodes: &[NodeId]) -> MetabaseResult<()>;

    /// All persisted node-alias pairs.
    async fn list_node_aliases(&self) -> MetabaseResult<Vec<(NodeId, NodeAlias)>>;
}

/// Row-level operations available inside one open transaction.
#[async_trait]
pub trait TransactionAdapter: Send {
    /// All segments of a stream, ordered by position.
    async fn fetch_segments_for_commit(
        &mut self,
        stream_id: Uuid,
    ) -> MetabaseResult<Vec<SegmentForCommit>>;

    /// Rewrite plain offsets for the given positions.
    async fn update_segment_offsets(
        &mut self,
        stream_id: Uuid,
        updates: &[SegmentOffsetUpdate],
    ) -> MetabaseResult<()>;

    /// Transition the pending row into its committed form, sealing totals.
    async fn finalize_object_commit(
        &mut self,
        opts: &CommitObject,
        info: &ObjectCommitInfo,
    ) -> MetabaseResult<Object>;

    /// Insert a fully formed committed object row, returning its creation
    /// time.
    async fn insert_committed_object(&mut self, object: &Object) -> MetabaseResult<OffsetDateTime>;

    /// Insert an inline segment row.
    async fn insert_inline_segment(&mut self, segment: &InlineSegmentRow) -> MetabaseResult<()>;

    /// Every object row at a location, newest version first.
    async fn query_objects_at_location(
        &mut self,
        location: &ObjectLocation,
    ) -> MetabaseResult<Vec<PrecommitCandidate>>;

    async fn delete_objects_by_versions(
        &mut self,
        location: &ObjectLocation,
        versions: &[Version],
    ) -> MetabaseResult<u64>;

    async fn delete_segments_by_streams(&mut self, stream_ids: &[Uuid]) -> MetabaseResult<u64>;

    /// Insert a delete-marker row, returning its creation time.
    async fn insert_delete_marker(
        &mut self,
        location: &ObjectLocation,
        version: Version,
        stream_id: Uuid,
        status: ObjectStatus,
    ) -> MetabaseResult<OffsetDateTime>;

    /// Lock-relevant state of an exact object version.
    async fn object_lock_info_exact(
        &mut self,
        location: &ObjectLocation,
        version: Version,
    ) -> MetabaseResult<Option<ObjectLockInfo>>;

    /// Lock-relevant state of the newest committed version at a location.
    async fn object_lock_info_last_committed(
        &mut self,
        location: &ObjectLocation,
    ) -> MetabaseResult<Option<(Version, ObjectLockInfo)>>;

    /// Overwrite retention state, preserving the legal-hold flag passed in.
    async fn update_retention(
        &mut self,
        location: &ObjectLocation,
        version: Version,
        retention: &Retention,
        legal_hold: bool,
    ) -> MetabaseResult<u64>;

    /// Pending objects whose zombie deadline passed, up to `batch_size`.
    async fn find_zombie_objects(
        &mut self,
        deadline: OffsetDateTime,
        batch_size: usize,
    ) -> MetabaseResult<Vec<ZombieCandidate>>;

    /// Delete one zombie object row (still pending), returning rows removed.
    async fn delete_zombie_object(&mut self, candidate: &ZombieCandidate) -> MetabaseResult<u64>;
}

/// Segment fields needed while sealing a commit.
#[derive(Clone, Copy, Debug)]
pub struct SegmentForCommit {
    pub position: SegmentPosition,
    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
}

/// A plain-offset rewrite for one segment.
#[derive(Clone, Copy, Debug)]
pub struct SegmentOffsetUpdate {
    pub position: SegmentPosition,
    pub plain_offset: i64,
}

/// Computed values sealed onto the object at commit time.
#[derive(Clone, Copy, Debug)]
pub struct ObjectCommitInfo {
    pub next_status: ObjectStatus,
    pub next_version: Version,
    pub segment_count: i32,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    pub fixed_segment_size: i32,
}

/// Object state examined by the precommit constraint evaluator.
#[derive(Clone, Debug)]
pub struct PrecommitCandidate {
    pub version: Version,
    pub status: ObjectStatus,
    pub stream_id: Uuid,
    pub expires_at: Option<OffsetDateTime>,
    pub retention: Retention,
    pub legal_hold: bool,
}

/// Lock-relevant state read before a retention update.
#[derive(Clone, Debug)]
pub struct ObjectLockInfo {
    pub status: ObjectStatus,
    pub expires_at: Option<OffsetDateTime>,
    pub retention: Retention,
    pub legal_hold: bool,
}

/// An inline segment row to insert.
#[derive(Clone, Debug)]
pub struct InlineSegmentRow {
    pub stream_id: Uuid,
    pub position: SegmentPosition,
    pub expires_at: Option<OffsetDateTime>,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub encrypted_size: i32,
    pub encrypted_etag: Option<Vec<u8>>,
    pub plain_size: i32,
    pub plain_offset: i64,
    pub inline_data: Vec<u8>,
}

/// A pending object past its zombie deadline.
#[derive(Clone, Debug)]
pub struct ZombieCandidate {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: Vec<u8>,
    pub version: Version,
    pub stream_id: Uuid,
}
