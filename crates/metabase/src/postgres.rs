//! PostgreSQL adapter: interactive multi-statement transactions.

use crate::adapter::{
    Adapter, InlineSegmentRow, ObjectCommitInfo, ObjectLockInfo, PrecommitCandidate,
    SegmentForCommit, SegmentOffsetUpdate, TransactionAdapter, ZombieCandidate,
};
use crate::commit::{
    self, BeginObjectExactVersion, BeginObjectNextVersion, BeginSegment, CommitInlineObject,
    CommitInlineSegment, CommitObject, CommitSegment,
};
use crate::delete::{self, DeleteObjectLastCommitted, DeleteObjectResult};
use crate::error::{MetabaseError, MetabaseResult, NOT_NULL_VIOLATION, sql_state};
use crate::list::{self, ListObjects, ListObjectsResult};
use crate::models::{Object, ObjectStatus};
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

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// Split an embedded schema into single statements; the driver prepares one
/// statement at a time.
pub(crate) fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Run a transaction body, committing on success and rolling back on error.
macro_rules! in_tx {
    ($self:expr, $txa:ident, $body:expr) => {{
        let mut $txa = PostgresTransaction {
            tx: $self.pool.begin().await?,
        };
        match $body {
            Ok(value) => {
                $txa.tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = $txa.tx.rollback().await;
                Err(err)
            }
        }
    }};
}

/// Metabase adapter backed by PostgreSQL.
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    /// Connect from a connection URL and apply the schema.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetabaseResult<Self> {
        let mut opts = PgConnectOptions::from_str(url).map_err(sqlx::Error::from)?;
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
        }

        tracing::info!(max_connections, "connecting metabase postgres adapter");
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
impl Adapter for PostgresAdapter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn migrate(&self) -> MetabaseResult<()> {
        for statement in schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("postgres metabase schema applied");
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
        // The pending-parent subquery makes "exists and is pending" and
        // "commit the segment" one atomic statement: a missing parent yields
        // a not-null violation on stream_id.
        let result = sqlx::query(
            r#"
            INSERT INTO segments (
                stream_id, position, expires_at,
                root_piece_id, encrypted_key_nonce, encrypted_key,
                encrypted_size, plain_offset, plain_size, encrypted_etag,
                redundancy, remote_alias_pieces, placement
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
                $16, $17, $18
            )
            ON CONFLICT (stream_id, position)
            DO UPDATE SET
                expires_at = $8,
                root_piece_id = $9, encrypted_key_nonce = $10, encrypted_key = $11,
                encrypted_size = $12, plain_offset = $13, plain_size = $14, encrypted_etag = $15,
                redundancy = $16,
                remote_alias_pieces = $17,
                placement = $18,
                -- clear the column in case it was an inline segment before
                inline_data = NULL
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
            INSERT INTO segments (
                stream_id, position, expires_at,
                root_piece_id, encrypted_key_nonce, encrypted_key,
                encrypted_size, plain_offset, plain_size, encrypted_etag,
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
                $16
            )
            ON CONFLICT (stream_id, position)
            DO UPDATE SET
                expires_at = $8,
                root_piece_id = $9, encrypted_key_nonce = $10, encrypted_key = $11,
                encrypted_size = $12, plain_offset = $13, plain_size = $14, encrypted_etag = $15,
                inline_data = $16,
                -- clear the columns in case it was a remote segment before
                redundancy = 0, remote_alias_pieces = NULL
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
        in_tx!(self, txa, commit::commit_object_tx(&mut txa, opts, config).await)
    }

    async fn commit_inline_object(
        &self,
        opts: &CommitInlineObject,
    ) -> MetabaseResult<(Object, PrecommitConstraintResult)> {
        in_tx!(self, txa, commit::commit_inline_object_tx(&mut txa, opts).await)
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
        in_tx!(self, txa, update::set_exact_version_retention_tx(&mut txa, opts).await)
    }

    async fn set_object_last_committed_retention(
        &self,
        opts: &SetObjectLastCommittedRetention,
    ) -> MetabaseResult<()> {
        in_tx!(self, txa, update::set_last_committed_retention_tx(&mut txa, opts).await)
    }

    async fn delete_object_last_committed(
        &self,
        opts: &DeleteObjectLastCommitted,
    ) -> MetabaseResult<DeleteObjectResult> {
        in_tx!(self, txa, delete::delete_object_last_committed_tx(&mut txa, opts).await)
    }

    async fn delete_zombie_objects(
        &self,
        opts: &DeleteZombieObjects,
    ) -> MetabaseResult<ZombieDeletionResult> {
        let mut total = ZombieDeletionResult::default();
        loop {
            let (batch, more): (ZombieDeletionResult, bool) = in_tx!(
                self,
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

/// One open PostgreSQL transaction.
pub(crate) struct PostgresTransaction {
    pub(crate) tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl TransactionAdapter for PostgresTransaction {
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
        let metadata_columns = if opts.override_encrypted_metadata {
            r#",
                encrypted_metadata_nonce         = $13,
                encrypted_metadata               = $14,
                encrypted_metadata_encrypted_key = $15,
                encrypted_etag                   = $16"#
        } else {
            ""
        };

        let sql = format!(
            r#"
            UPDATE objects SET
                version = $7,
                status = $8,
                segment_count = $9,
                total_plain_size = $10,
                total_encrypted_size = $11,
                fixed_segment_size = $12,
                zombie_deletion_deadline = NULL,
                encryption = CASE
                    WHEN objects.encryption = 0 AND $6 <> 0 THEN $6
                    WHEN objects.encryption = 0 AND $6 = 0 THEN NULL
                    ELSE objects.encryption
                END{metadata_columns}
            WHERE (project_id, bucket_name, object_key, version, stream_id) = ($1, $2, $3, $4, $5)
                AND status = {pending}
            RETURNING
                created_at, expires_at,
                encrypted_metadata, encrypted_metadata_encrypted_key, encrypted_metadata_nonce, encrypted_etag,
                encryption,
                retention_mode, retain_until
            "#,
            pending = ObjectStatus::Pending.to_db(),
        );

        let mut query = sqlx::query(&sql)
            .bind(opts.stream.project_id)
            .bind(opts.stream.bucket_name.as_str())
            .bind(opts.stream.object_key.as_bytes())
            .bind(opts.stream.version)
            .bind(opts.stream.stream_id)
            .bind(opts.encryption.pack())
            .bind(info.next_version)
            .bind(info.next_status.to_db())
            .bind(info.segment_count)
            .bind(info.total_plain_size)
            .bind(info.total_encrypted_size)
            .bind(info.fixed_segment_size);
        if opts.override_encrypted_metadata {
            query = query
                .bind(opts.encrypted_user_data.encrypted_metadata_nonce.as_deref())
                .bind(opts.encrypted_user_data.encrypted_metadata.as_deref())
                .bind(
                    opts.encrypted_user_data
                        .encrypted_metadata_encrypted_key
                        .as_deref(),
                )
                .bind(opts.encrypted_user_data.encrypted_etag.as_deref());
        }

        let row = match query.fetch_optional(&mut *self.tx).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                return Err(MetabaseError::ObjectNotFound(
                    "object with specified version and pending status is missing".into(),
                ));
            }
            Err(err) => {
                if sql_state(&err).as_deref() == Some(NOT_NULL_VIOLATION) {
                    return Err(MetabaseError::InvalidRequest("Encryption is missing".into()));
                }
                return Err(err.into());
            }
        };

        let created_at: OffsetDateTime = row.try_get(0)?;
        let expires_at: Option<OffsetDateTime> = row.try_get(1)?;
        let encrypted_user_data = decode_user_data(&row, 2)?;
        let encryption = statements::decode_encryption(row.try_get(6)?)?;
        let (retention, legal_hold) = decode_lock(&row, 7, 8)?;

        retention.verify().map_err(|err| MetabaseError::Internal(err.to_string()))?;
        if expires_at.is_some() && (legal_hold || retention.enabled()) {
            return Err(MetabaseError::Internal(
                "object expiration must not be set if Object Lock configuration is set".into(),
            ));
        }

        Ok(Object {
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
        })
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
