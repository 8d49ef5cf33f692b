//! CockroachDB adapter: closure-scoped transactions with client-side retry.
//!
//! CockroachDB runs every transaction at serializable isolation and reports
//! contention as SQLSTATE 40001. The adapter re-enters the transaction body
//! on such failures, so bodies must not expose state from failed attempts;
//! callers above the adapter never observe a retry.

use crate::adapter::{
    Adapter, InlineSegmentRow, ObjectCommitInfo, ObjectLockInfo, PrecommitCandidate,
    SegmentForCommit, SegmentOffsetUpdate, TransactionAdapter, ZombieCandidate,
};
use crate::commit::{
    self, BeginObjectExactVersion, BeginObjectNextVersion, BeginSegment, CommitInlineObject,
    CommitInlineSegment, CommitObject, CommitSegment,
};
use crate::delete::{self, DeleteObjectLastCommitted, DeleteObjectResult};
use crate::error::{MetabaseError, MetabaseResult, SERIALIZATION_FAILURE, sql_state};
use crate::list::{self, ListObjects, ListObjectsResult};
use crate::models::{Object, ObjectStatus};
use crate::postgres::schema_statements;
use crate::precommit::PrecommitConstraintResult;
use crate::statements::{self, decode_lock, decode_user_data};
use crate::update::{
    self, SetObjectExactVersionRetention, SetObjectLastCommittedRetention, UpdateSegmentPieces,
};
use crate::zombie::{self, DeleteZombieObjects, ZombieDeletionResult};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;
use vantage_core::{
    AliasPieces, MetabaseConfig, NodeAlias, NodeId, ObjectLocation, Retention, Version,
};

/// CockroachDB schema (embedded).
const COCKROACH_SCHEMA: &str = include_str!("cockroach_schema.sql");

const MAX_TX_RETRIES: u32 = 5;

fn sqlx_retriable(err: &sqlx::Error) -> bool {
    sql_state(err).as_deref() == Some(SERIALIZATION_FAILURE)
}

fn error_retriable(err: &MetabaseError) -> bool {
    matches!(err, MetabaseError::Database(db) if sqlx_retriable(db))
}

/// Run a transaction body, re-entering it on retriable serialization
/// failures. The body must not leak observable state from failed attempts.
macro_rules! retry_tx {
    ($self:expr, $tag:expr, $txa:ident, $body:expr) => {{
        let mut attempt = 0u32;
        loop {
            let mut $txa = CockroachTransaction {
                tx: $self.pool.begin().await?,
            };
            match $body {
                Ok(value) => match $txa.tx.commit().await {
                    Ok(()) => break Ok(value),
                    Err(err) if sqlx_retriable(&err) && attempt < MAX_TX_RETRIES => {
                        attempt += 1;
                        tracing::warn!(tag = $tag, attempt, "retrying transaction after commit contention");
                    }
                    Err(err) => break Err(MetabaseError::from(err)),
                },
                Err(err) => {
                    let _ = $txa.tx.rollback().await;
                    if error_retriable(&err) && attempt < MAX_TX_RETRIES {
                        attempt += 1;
                        tracing::warn!(tag = $tag, attempt, "retrying transaction");
                    } else {
                        break Err(err);
                    }
                }
            }
        }
    }};
}

/// Metabase adapter backed by CockroachDB.
pub struct CockroachAdapter {
    pool: PgPool,
}

impl CockroachAdapter {
    /// Connect from a connection URL and apply the schema.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        max_commit_delay_ms: Option<u64>,
    ) -> MetabaseResult<Self> {
        let opts = PgConnectOptions::from_str(url).map_err(sqlx::Error::from)?;

        if max_commit_delay_ms.is_some() {
            // The hint is part of the adapter contract; this backend has no
            // deferred-commit batching to apply it to.
            tracing::debug!("max_commit_delay hint has no effect on cockroach");
        }

        tracing::info!(max_connections, "connecting metabase cockroach adapter");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let adapter = Self { pool };
        adapter.migrate().await?;
        Ok(adapter)
    }

    /// Wrap an existing pool. The caller is responsible for `migrate()`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Adapter for CockroachAdapter {
    fn name(&self) -> &'static str {
        "cockroach"
    }

    async fn migrate(&self) -> MetabaseResult<()> {
        for statement in schema_statements(COCKROACH_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("cockroach metabase schema applied");
        Ok(())
    }

    async fn health_check(&self) -> MetabaseResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin_object_next_version(
        &self,
        opts: &BeginObjectNextVersion,
    ) -> MetabaseResult<Object> {
        let mut conn = self.pool.acquire().await?;
        statements::begin_object_next_version(&mut conn, opts).await
    }

    async fn begin_object_exact_version(
        &self,
        opts: &BeginObjectExactVersion,
    ) -> MetabaseResult<Object> {
        let mut conn = self.pool.acquire().await?;
        statements::begin_object_exact_version(&mut conn, opts).await
    }

    async fn pending_object_exists(&self, opts: &BeginSegment) -> MetabaseResult<bool> {
        let mut conn = self.pool.acquire().await?;
        statements::pending_object_exists(&mut conn, opts).await
    }

    async fn commit_pending_segment(
        &self,
        opts: &CommitSegment,
        alias_pieces: &AliasPieces,
    ) -> MetabaseResult<()> {
        let result = sqlx::query(
            r#"
            UPSERT INTO segments (
                stream_id, position, expires_at,
                root_piece_id, encrypted_key_nonce, encrypted_key,
                encrypted_size, plain_offset, plain_size, encrypted_etag,
                redundancy, remote_alias_pieces, placement,
                -- clear the column in case it was an inline segment before
                inline_data
            ) VALUES (
                (
                    SELECT stream_id
                    FROM objects
                    WHERE (project_id, bucket_name, object_key, version, stream_id) = ($1, $2, $3, $4, $5)
                        AND status = $6
                ),
                $7, $8,
                $9, $10, $11,
                $12, $13, $14, $15,
                $16, $17, $18,
                NULL
            )
            "#,
        )
        .bind(opts.stream.project_id)
        .bind(opts.stream.bucket_name.as_str())
        .bind(opts.stream.object_key.as_bytes())
        .bind(opts.stream.version)
        .bind(opts.stream.stream_id)
        .bind(ObjectStatus::Pending.to_db())
        .bind(opts.position.encode())
        .bind(opts.expires_at)
        .bind(opts.root_piece_id.as_bytes().as_slice())
        .bind(opts.encrypted_key_nonce.as_slice())
        .bind(opts.encrypted_key.as_slice())
        .bind(opts.encrypted_size)
        .bind(opts.plain_offset)
        .bind(opts.plain_size)
        .bind(opts.encrypted_etag.as_deref())
        .bind(opts.redundancy.pack().map_err(MetabaseError::from)?)
        .bind(alias_pieces.encode())
        .bind(opts.placement)
        .execute(&self.pool)
        .await;

        result
            .map(|_| ())
            .map_err(statements::translate_pending_parent_error)
    }

    async fn commit_inline_segment(&self, opts: &CommitInlineSegment) -> MetabaseResult<()> {
        let result = sqlx::query(
            r#"
            UPSERT INTO segments (
                stream_id, position, expires_at,
                root_piece_id, encrypted_key_nonce, encrypted_key,
                encrypted_size, plain_offset, plain_size, encrypted_etag,
                inline_data,
                -- clear the columns in case it was a remote segment before
                redundancy, remote_alias_pieces
            ) VALUES (
                (
                    SELECT stream_id
                    FROM objects
                    WHERE (project_id, bucket_name, object_key, version, stream_id) = ($1, $2, $3, $4, $5)
                        AND status = $6
                ),
                $7, $8,
                $9, $10, $11,
                $12, $13, $14, $15,
                $16,
                0, NULL
            )
            "#,
        )
        .bind(opts.stream.project_id)
        .bind(opts.stream.bucket_name.as_str())
        .bind(opts.stream.object_key.as_bytes())
        .bind(opts.stream.version)
        .bind(opts.stream.stream_id)
        .bind(ObjectStatus::Pending.to_db())
        .bind(opts.position.encode())
        .bind(opts.expires_at)
        .bind(vantage_core::PieceId::ZERO.as_bytes().as_slice())
        .bind(opts.encrypted_key_nonce.as_slice())
        .bind(opts.encrypted_key.as_slice())
        .bind(opts.inline_data.len() as i32)
        .bind(opts.plain_offset)
        .bind(opts.plain_size)
        .bind(opts.encrypted_etag.as_deref())
        .bind(opts.inline_data.as_slice())
        .execute(&self.pool)
        .await;

        result
            .map(|_| ())
            .map_err(statements::translate_pending_parent_error)
    }

    async fn commit_object(
        &self,
        opts: &CommitObject,
        config: &MetabaseConfig,
    ) -> MetabaseResult<(Object, PrecommitConstraintResult)> {
        retry_tx!(
            self,
            "commit-object",
            txa,
            commit::commit_object_tx(&mut txa, opts, config).await
        )
    }

    async fn commit_inline_object(
        &self,
        opts: &CommitInlineObject,
    ) -> MetabaseResult<(Object, PrecommitConstraintResult)> {
        retry_tx!(
            self,
            "commit-inline-object",
            txa,
            commit::commit_inline_object_tx(&mut txa, opts).await
        )
    }

    async fn update_segment_pieces(
        &self,
        opts: &UpdateSegmentPieces,
        old_pieces: &AliasPieces,
        new_pieces: &AliasPieces,
    ) -> MetabaseResult<AliasPieces> {
        let mut conn = self.pool.acquire().await?;
        statements::update_segment_pieces(&mut conn, opts, old_pieces, new_pieces).await
    }

    async fn set_object_exact_version_retention(
        &self,
        opts: &SetObjectExactVersionRetention,
    ) -> MetabaseResult<()> {
        retry_tx!(
            self,
            "set-exact-version-retention",
            txa,
            update::set_exact_version_retention_tx(&mut txa, opts).await
        )
    }

    async fn set_object_last_committed_retention(
        &self,
        opts: &SetObjectLastCommittedRetention,
    ) -> MetabaseResult<()> {
        retry_tx!(
            self,
            "set-last-committed-retention",
            txa,
            update::set_last_committed_retention_tx(&mut txa, opts).await
        )
    }

    async fn delete_object_last_committed(
        &self,
        opts: &DeleteObjectLastCommitted,
    ) -> MetabaseResult<DeleteObjectResult> {
        retry_tx!(
            self,
            "delete-object-last-committed",
            txa,
            delete::delete_object_last_committed_tx(&mut txa, opts).await
        )
    }

    async fn delete_zombie_objects(
        &self,
        opts: &DeleteZombieObjects,
    ) -> MetabaseResult<ZombieDeletionResult> {
        let mut total = ZombieDeletionResult::default();
        loop {
            let (batch, more): (ZombieDeletionResult, bool) = retry_tx!(
                self,
                "delete-zombie-objects",
                txa,
                zombie::delete_zombie_batch_tx(&mut txa, opts.deadline_before, opts.batch_size)
                    .await
            )?;
            total.deleted_objects += batch.deleted_objects;
            total.deleted_segments += batch.deleted_segments;
            if !more {
                return Ok(total);
            }
        }
    }

    async fn list_objects(&self, opts: &ListObjects) -> MetabaseResult<ListObjectsResult> {
        list::list_objects(&self.pool, opts).await
    }

    async fn ensure_node_aliases(&self, nodes: &[NodeId]) -> MetabaseResult<()> {
        let mut conn = self.pool.acquire().await?;
        statements::ensure_node_aliases(&mut conn, nodes).await
    }

    async fn list_node_aliases(&self) -> MetabaseResult<Vec<(NodeId, NodeAlias)>> {
        let mut conn = self.pool.acquire().await?;
        statements::list_node_aliases(&mut conn).await
    }
}

/// One attempt of a CockroachDB read-write transaction.
pub(crate) struct CockroachTransaction {
    pub(crate) tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TransactionAdapter for CockroachTransaction {
    async fn fetch_segments_for_commit(
        &mut self,
        stream_id: Uuid,
    ) -> MetabaseResult<Vec<SegmentForCommit>> {
        statements::fetch_segments_for_commit(&mut self.tx, stream_id).await
    }

    async fn update_segment_offsets(
        &mut self,
        stream_id: Uuid,
        updates: &[SegmentOffsetUpdate],
    ) -> MetabaseResult<()> {
        statements::update_segment_offsets(&mut self.tx, stream_id, updates).await
    }

    async fn finalize_object_commit(
        &mut self,
        opts: &CommitObject,
        info: &ObjectCommitInfo,
    ) -> MetabaseResult<Object> {
        // The status+version transition rewrites part of the primary key,
        // which cannot be mutated in place: replace the row, carrying the old
        // row's fields forward through the delete's RETURNING clause.
        let row = sqlx::query(
            r#"
            DELETE FROM objects
            WHERE (project_id, bucket_name, object_key, version, stream_id) = ($1, $2, $3, $4, $5)
                AND status = $6
            RETURNING
                created_at, expires_at,
                encrypted_metadata, encrypted_metadata_encrypted_key, encrypted_metadata_nonce, encrypted_etag,
                encryption,
                retention_mode, retain_until
            "#,
        )
        .bind(opts.stream.project_id)
        .bind(opts.stream.bucket_name.as_str())
        .bind(opts.stream.object_key.as_bytes())
        .bind(opts.stream.version)
        .bind(opts.stream.stream_id)
        .bind(ObjectStatus::Pending.to_db())
        .fetch_optional(&mut *self.tx)
        .await?;

        let row = row.ok_or_else(|| {
            MetabaseError::ObjectNotFound(
                "object with specified version and pending status is missing".into(),
            )
        })?;

        let created_at: OffsetDateTime = row.try_get(0)?;
        let expires_at: Option<OffsetDateTime> = row.try_get(1)?;
        let old_user_data = decode_user_data(&row, 2)?;
        let old_encryption = statements::decode_encryption(row.try_get(6)?)?;
        let (retention, legal_hold) = decode_lock(&row, 7, 8)?;

        retention
            .verify()
            .map_err(|err| MetabaseError::Internal(err.to_string()))?;
        if expires_at.is_some() && (legal_hold || retention.enabled()) {
            return Err(MetabaseError::Internal(
                "object expiration must not be set if Object Lock configuration is set".into(),
            ));
        }

        let encryption = if old_encryption.is_zero() && !opts.encryption.is_zero() {
            opts.encryption
        } else if old_encryption.is_zero() && opts.encryption.is_zero() {
            return Err(MetabaseError::InvalidRequest("Encryption is missing".into()));
        } else {
            old_encryption
        };

        let encrypted_user_data = if opts.override_encrypted_metadata {
            opts.encrypted_user_data.clone()
        } else {
            old_user_data
        };

        let object = Object {
            project_id: opts.stream.project_id,
            bucket_name: opts.stream.bucket_name.clone(),
            object_key: opts.stream.object_key.clone(),
            version: info.next_version,
            stream_id: opts.stream.stream_id,
            created_at,
            expires_at,
            status: info.next_status,
            segment_count: info.segment_count,
            encrypted_user_data,
            total_plain_size: info.total_plain_size,
            total_encrypted_size: info.total_encrypted_size,
            fixed_segment_size: info.fixed_segment_size,
            encryption,
            zombie_deletion_deadline: None,
            retention,
            legal_hold,
        };

        statements::insert_committed_object(&mut self.tx, &object, Some(created_at)).await?;
        Ok(object)
    }

    async fn insert_committed_object(&mut self, object: &Object) -> MetabaseResult<OffsetDateTime> {
        statements::insert_committed_object(&mut self.tx, object, None).await
    }

    async fn insert_inline_segment(&mut self, segment: &InlineSegmentRow) -> MetabaseResult<()> {
        statements::insert_inline_segment(&mut self.tx, segment).await
    }

    async fn query_objects_at_location(
        &mut self,
        location: &ObjectLocation,
    ) -> MetabaseResult<Vec<PrecommitCandidate>> {
        statements::query_objects_at_location(&mut self.tx, location).await
    }

    async fn delete_objects_by_versions(
        &mut self,
        location: &ObjectLocation,
        versions: &[Version],
    ) -> MetabaseResult<u64> {
        statements::delete_objects_by_versions(&mut self.tx, location, versions).await
    }

    async fn delete_segments_by_streams(&mut self, stream_ids: &[Uuid]) -> MetabaseResult<u64> {
        statements::delete_segments_by_streams(&mut self.tx, stream_ids).await
    }

    async fn insert_delete_marker(
        &mut self,
        location: &ObjectLocation,
        version: Version,
        stream_id: Uuid,
        status: ObjectStatus,
    ) -> MetabaseResult<OffsetDateTime> {
        statements::insert_delete_marker(&mut self.tx, location, version, stream_id, status).await
    }

    async fn object_lock_info_exact(
        &mut self,
        location: &ObjectLocation,
        version: Version,
    ) -> MetabaseResult<Option<ObjectLockInfo>> {
        statements::object_lock_info_exact(&mut self.tx, location, version).await
    }

    async fn object_lock_info_last_committed(
        &mut self,
        location: &ObjectLocation,
    ) -> MetabaseResult<Option<(Version, ObjectLockInfo)>> {
        statements::object_lock_info_last_committed(&mut self.tx, location).await
    }

    async fn update_retention(
        &mut self,
        location: &ObjectLocation,
        version: Version,
        retention: &Retention,
        legal_hold: bool,
    ) -> MetabaseResult<u64> {
        statements::update_retention(&mut self.tx, location, version, retention, legal_hold).await
    }

    async fn find_zombie_objects(
        &mut self,
        deadline: OffsetDateTime,
        batch_size: usize,
    ) -> MetabaseResult<Vec<ZombieCandidate>> {
        statements::find_zombie_objects(&mut self.tx, deadline, batch_size).await
    }

    async fn delete_zombie_object(&mut self, candidate: &ZombieCandidate) -> MetabaseResult<u64> {
        statements::delete_zombie_object(&mut self.tx, candidate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cockroach_schema_parses_into_statements() {
        let statements = schema_statements(COCKROACH_SCHEMA);
        assert!(statements.iter().any(|s| s.contains("CREATE SEQUENCE")));
        assert!(statements.iter().all(|s| s.contains("CREATE")));
    }
}
