//! SQL statements shared by both adapters.
//!
//! Both backends speak the PostgreSQL wire protocol, so everything that does
//! not depend on dialect-specific conflict handling or primary-key rewriting
//! lives here as plain functions over a connection. Adapter-specific
//! statements (UPSERT, DELETE-then-INSERT commit) stay in the adapter
//! modules.

use crate::adapter::{
    InlineSegmentRow, ObjectLockInfo, PrecommitCandidate, SegmentForCommit, SegmentOffsetUpdate,
    ZombieCandidate,
};
use crate::commit::{BeginObjectExactVersion, BeginObjectNextVersion, BeginSegment};
use crate::error::{
    MetabaseError, MetabaseResult, NOT_NULL_VIOLATION, UNIQUE_VIOLATION, sql_state,
};
use crate::models::{Object, ObjectStatus};
use crate::update::UpdateSegmentPieces;
use sqlx::postgres::PgConnection;
use sqlx::Row;
use time::OffsetDateTime;
use uuid::Uuid;
use vantage_core::retention::{pack_lock_mode, unpack_lock_mode};
use vantage_core::{
    AliasPieces, EncryptedUserData, EncryptionParameters, NodeAlias, NodeId, ObjectLocation,
    Retention, SegmentPosition, Version,
};

pub(crate) async fn begin_object_next_version(
    conn: &mut PgConnection,
    opts: &BeginObjectNextVersion,
) -> MetabaseResult<Object> {
    let row = sqlx::query(
        r#"
        INSERT INTO objects (
            project_id, bucket_name, object_key, version, stream_id,
            expires_at, encryption,
            zombie_deletion_deadline,
            encrypted_metadata, encrypted_metadata_nonce, encrypted_metadata_encrypted_key, encrypted_etag,
            retention_mode, retain_until
        ) VALUES (
            $1, $2, $3,
            coalesce((
                SELECT version + 1
                FROM objects
                WHERE (project_id, bucket_name, object_key) = ($1, $2, $3)
                ORDER BY version DESC
                LIMIT 1
            ), 1),
            $4, $5, $6,
            $7,
            $8, $9, $10, $11,
            $12, $13
        )
        RETURNING status, version, created_at
        "#,
    )
    .bind(opts.stream.project_id)
    .bind(opts.stream.bucket_name.as_str())
    .bind(opts.stream.object_key.as_bytes())
    .bind(opts.stream.stream_id)
    .bind(opts.expires_at)
    .bind(opts.encryption.pack())
    .bind(opts.zombie_deletion_deadline)
    .bind(opts.encrypted_user_data.encrypted_metadata.as_deref())
    .bind(opts.encrypted_user_data.encrypted_metadata_nonce.as_deref())
    .bind(
        opts.encrypted_user_data
            .encrypted_metadata_encrypted_key
            .as_deref(),
    )
    .bind(opts.encrypted_user_data.encrypted_etag.as_deref())
    .bind(pack_lock_mode(&opts.retention, opts.legal_hold))
    .bind(opts.retention.retain_until())
    .fetch_one(conn)
    .await?;

    let status = ObjectStatus::from_db(row.try_get::<i16, _>(0)?)?;
    let version: Version = row.try_get(1)?;
    let created_at: OffsetDateTime = row.try_get(2)?;

    Ok(Object {
        project_id: opts.stream.project_id,
        bucket_name: opts.stream.bucket_name.clone(),
        object_key: opts.stream.object_key.clone(),
        version,
        stream_id: opts.stream.stream_id,
        created_at,
        expires_at: opts.expires_at,
        status,
        segment_count: 0,
        encrypted_user_data: opts.encrypted_user_data.clone(),
        total_plain_size: 0,
        total_encrypted_size: 0,
        fixed_segment_size: 0,
        encryption: opts.encryption,
        zombie_deletion_deadline: opts.zombie_deletion_deadline,
        retention: opts.retention,
        legal_hold: opts.legal_hold,
    })
}

pub(crate) async fn begin_object_exact_version(
    conn: &mut PgConnection,
    opts: &BeginObjectExactVersion,
) -> MetabaseResult<Object> {
    let result = sqlx::query(
        r#"
        INSERT INTO objects (
            project_id, bucket_name, object_key, version, stream_id,
            expires_at, encryption,
            zombie_deletion_deadline,
            encrypted_metadata, encrypted_metadata_nonce, encrypted_metadata_encrypted_key, encrypted_etag,
            retention_mode, retain_until
        ) VALUES (
            $1, $2, $3, $4, $5,
            $6, $7,
            $8,
            $9, $10, $11, $12,
            $13, $14
        )
        RETURNING status, created_at
        "#,
    )
    .bind(opts.stream.project_id)
    .bind(opts.stream.bucket_name.as_str())
    .bind(opts.stream.object_key.as_bytes())
    .bind(opts.stream.version)
    .bind(opts.stream.stream_id)
    .bind(opts.expires_at)
    .bind(opts.encryption.pack())
    .bind(opts.zombie_deletion_deadline)
    .bind(opts.encrypted_user_data.encrypted_metadata.as_deref())
    .bind(opts.encrypted_user_data.encrypted_metadata_nonce.as_deref())
    .bind(
        opts.encrypted_user_data
            .encrypted_metadata_encrypted_key
            .as_deref(),
    )
    .bind(opts.encrypted_user_data.encrypted_etag.as_deref())
    .bind(pack_lock_mode(&opts.retention, opts.legal_hold))
    .bind(opts.retention.retain_until())
    .fetch_one(conn)
    .await;

    let row = match result {
        Ok(row) => row,
        Err(err) => {
            if sql_state(&err).as_deref() == Some(UNIQUE_VIOLATION) {
                return Err(MetabaseError::ObjectAlreadyExists);
            }
            return Err(err.into());
        }
    };

    let status = ObjectStatus::from_db(row.try_get::<i16, _>(0)?)?;
    let created_at: OffsetDateTime = row.try_get(1)?;

    Ok(Object {
        project_id: opts.stream.project_id,
        bucket_name: opts.stream.bucket_name.clone(),
        object_key: opts.stream.object_key.clone(),
        version: opts.stream.version,
        stream_id: opts.stream.stream_id,
        created_at,
        expires_at: opts.expires_at,
        status,
        segment_count: 0,
        encrypted_user_data: opts.encrypted_user_data.clone(),
        total_plain_size: 0,
        total_encrypted_size: 0,
        fixed_segment_size: 0,
        encryption: opts.encryption,
        zombie_deletion_deadline: opts.zombie_deletion_deadline,
        retention: opts.retention,
        legal_hold: opts.legal_hold,
    })
}

pub(crate) async fn pending_object_exists(
    conn: &mut PgConnection,
    opts: &BeginSegment,
) -> MetabaseResult<bool> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM objects
            WHERE (project_id, bucket_name, object_key, version, stream_id) = ($1, $2, $3, $4, $5)
                AND status = $6
        )
        "#,
    )
    .bind(opts.stream.project_id)
    .bind(opts.stream.bucket_name.as_str())
    .bind(opts.stream.object_key.as_bytes())
    .bind(opts.stream.version)
    .bind(opts.stream.stream_id)
    .bind(ObjectStatus::Pending.to_db())
    .fetch_one(conn)
    .await?;
    Ok(exists)
}

pub(crate) async fn fetch_segments_for_commit(
    conn: &mut PgConnection,
    stream_id: Uuid,
) -> MetabaseResult<Vec<SegmentForCommit>> {
    let rows = sqlx::query(
        r#"
        SELECT position, encrypted_size, plain_offset, plain_size
        FROM segments
        WHERE stream_id = $1
        ORDER BY position
        "#,
    )
    .bind(stream_id)
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(SegmentForCommit {
                position: SegmentPosition::decode(row.try_get(0)?),
                encrypted_size: row.try_get(1)?,
                plain_offset: row.try_get(2)?,
                plain_size: row.try_get(3)?,
            })
        })
        .collect()
}

pub(crate) async fn update_segment_offsets(
    conn: &mut PgConnection,
    stream_id: Uuid,
    updates: &[SegmentOffsetUpdate],
) -> MetabaseResult<()> {
    for update in updates {
        sqlx::query(
            r#"
            UPDATE segments SET plain_offset = $3
            WHERE stream_id = $1 AND position = $2
            "#,
        )
        .bind(stream_id)
        .bind(update.position.encode())
        .bind(update.plain_offset)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub(crate) async fn query_objects_at_location(
    conn: &mut PgConnection,
    location: &ObjectLocation,
) -> MetabaseResult<Vec<PrecommitCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT version, status, stream_id, expires_at, retention_mode, retain_until
        FROM objects
        WHERE (project_id, bucket_name, object_key) = ($1, $2, $3)
        ORDER BY version DESC
        "#,
    )
    .bind(location.project_id)
    .bind(location.bucket_name.as_str())
    .bind(location.object_key.as_bytes())
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .map(|row| {
            let (retention, legal_hold) = decode_lock(&row, 4, 5)?;
            Ok(PrecommitCandidate {
                version: row.try_get(0)?,
                status: ObjectStatus::from_db(row.try_get::<i16, _>(1)?)?,
                stream_id: row.try_get(2)?,
                expires_at: row.try_get(3)?,
                retention,
                legal_hold,
            })
        })
        .collect()
}

pub(crate) async fn delete_objects_by_versions(
    conn: &mut PgConnection,
    location: &ObjectLocation,
    versions: &[Version],
) -> MetabaseResult<u64> {
    if versions.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query(
        r#"
        DELETE FROM objects
        WHERE (project_id, bucket_name, object_key) = ($1, $2, $3) AND version = ANY($4)
        "#,
    )
    .bind(location.project_id)
    .bind(location.bucket_name.as_str())
    .bind(location.object_key.as_bytes())
    .bind(versions)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_segments_by_streams(
    conn: &mut PgConnection,
    stream_ids: &[Uuid],
) -> MetabaseResult<u64> {
    if stream_ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query("DELETE FROM segments WHERE stream_id = ANY($1)")
        .bind(stream_ids)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn insert_delete_marker(
    conn: &mut PgConnection,
    location: &ObjectLocation,
    version: Version,
    stream_id: Uuid,
    status: ObjectStatus,
) -> MetabaseResult<OffsetDateTime> {
    let created_at: OffsetDateTime = sqlx::query_scalar(
        r#"
        INSERT INTO objects (project_id, bucket_name, object_key, version, stream_id, status)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING created_at
        "#,
    )
    .bind(location.project_id)
    .bind(location.bucket_name.as_str())
    .bind(location.object_key.as_bytes())
    .bind(version)
    .bind(stream_id)
    .bind(status.to_db())
    .fetch_one(conn)
    .await?;
    Ok(created_at)
}

pub(crate) async fn object_lock_info_exact(
    conn: &mut PgConnection,
    location: &ObjectLocation,
    version: Version,
) -> MetabaseResult<Option<ObjectLockInfo>> {
    let row = sqlx::query(
        r#"
        SELECT status, expires_at, retention_mode, retain_until
        FROM objects
        WHERE (project_id, bucket_name, object_key, version) = ($1, $2, $3, $4)
        "#,
    )
    .bind(location.project_id)
    .bind(location.bucket_name.as_str())
    .bind(location.object_key.as_bytes())
    .bind(version)
    .fetch_optional(conn)
    .await?;

    row.map(|row| {
        let (retention, legal_hold) = decode_lock(&row, 2, 3)?;
        Ok(ObjectLockInfo {
            status: ObjectStatus::from_db(row.try_get::<i16, _>(0)?)?,
            expires_at: row.try_get(1)?,
            retention,
            legal_hold,
        })
    })
    .transpose()
}

pub(crate) async fn object_lock_info_last_committed(
    conn: &mut PgConnection,
    location: &ObjectLocation,
) -> MetabaseResult<Option<(Version, ObjectLockInfo)>> {
    let row = sqlx::query(
        r#"
        SELECT version, status, expires_at, retention_mode, retain_until
        FROM objects
        WHERE (project_id, bucket_name, object_key) = ($1, $2, $3) AND status IN ($4, $5)
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(location.project_id)
    .bind(location.bucket_name.as_str())
    .bind(location.object_key.as_bytes())
    .bind(ObjectStatus::CommittedUnversioned.to_db())
    .bind(ObjectStatus::CommittedVersioned.to_db())
    .fetch_optional(conn)
    .await?;

    row.map(|row| {
        let (retention, legal_hold) = decode_lock(&row, 3, 4)?;
        Ok((
            row.try_get(0)?,
            ObjectLockInfo {
                status: ObjectStatus::from_db(row.try_get::<i16, _>(1)?)?,
                expires_at: row.try_get(2)?,
                retention,
                legal_hold,
            },
        ))
    })
    .transpose()
}

pub(crate) async fn update_retention(
    conn: &mut PgConnection,
    location: &ObjectLocation,
    version: Version,
    retention: &Retention,
    legal_hold: bool,
) -> MetabaseResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE objects
        SET retention_mode = $5, retain_until = $6
        WHERE (project_id, bucket_name, object_key, version) = ($1, $2, $3, $4)
        "#,
    )
    .bind(location.project_id)
    .bind(location.bucket_name.as_str())
    .bind(location.object_key.as_bytes())
    .bind(version)
    .bind(pack_lock_mode(retention, legal_hold))
    .bind(retention.retain_until())
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn update_segment_pieces(
    conn: &mut PgConnection,
    opts: &UpdateSegmentPieces,
    old_pieces: &AliasPieces,
    new_pieces: &AliasPieces,
) -> MetabaseResult<AliasPieces> {
    let update_repaired_at = opts.new_repaired_at.is_some();
    let result = sqlx::query(
        r#"
        UPDATE segments SET
            remote_alias_pieces = CASE
                WHEN remote_alias_pieces = $3 THEN $4
                ELSE remote_alias_pieces
            END,
            redundancy = CASE
                WHEN remote_alias_pieces = $3 THEN $5
                ELSE redundancy
            END,
            repaired_at = CASE
                WHEN remote_alias_pieces = $3 AND $7 = true THEN $6
                ELSE repaired_at
            END
        WHERE stream_id = $1 AND position = $2
        RETURNING remote_alias_pieces
        "#,
    )
    .bind(opts.stream_id)
    .bind(opts.position.encode())
    .bind(old_pieces.encode())
    .bind(new_pieces.encode())
    .bind(opts.new_redundancy.pack().map_err(MetabaseError::from)?)
    .bind(opts.new_repaired_at)
    .bind(update_repaired_at)
    .fetch_optional(conn)
    .await?;

    let row = result.ok_or_else(|| MetabaseError::SegmentNotFound("segment missing".into()))?;
    let stored: Option<Vec<u8>> = row.try_get(0)?;
    match stored {
        Some(bytes) => Ok(AliasPieces::decode(&bytes)?),
        None => Ok(AliasPieces::default()),
    }
}

/// Insert a committed object row. A `created_at` of `None` lets the database
/// assign the creation time; the commit transition passes the old row's.
pub(crate) async fn insert_committed_object(
    conn: &mut PgConnection,
    object: &Object,
    created_at: Option<OffsetDateTime>,
) -> MetabaseResult<OffsetDateTime> {
    let created_at: OffsetDateTime = sqlx::query_scalar(
        r#"
        INSERT INTO objects (
            project_id, bucket_name, object_key, version, stream_id,
            created_at, status, segment_count, expires_at, encryption,
            total_plain_size, total_encrypted_size, fixed_segment_size,
            zombie_deletion_deadline,
            encrypted_metadata, encrypted_metadata_nonce, encrypted_metadata_encrypted_key, encrypted_etag,
            retention_mode, retain_until
        ) VALUES (
            $1, $2, $3, $4, $5,
            coalesce($6, now()), $7, $8, $9, $10,
            $11, $12, $13,
            NULL,
            $14, $15, $16, $17,
            $18, $19
        )
        RETURNING created_at
        "#,
    )
    .bind(object.project_id)
    .bind(object.bucket_name.as_str())
    .bind(object.object_key.as_bytes())
    .bind(object.version)
    .bind(object.stream_id)
    .bind(created_at)
    .bind(object.status.to_db())
    .bind(object.segment_count)
    .bind(object.expires_at)
    .bind(object.encryption.pack())
    .bind(object.total_plain_size)
    .bind(object.total_encrypted_size)
    .bind(object.fixed_segment_size)
    .bind(object.encrypted_user_data.encrypted_metadata.as_deref())
    .bind(object.encrypted_user_data.encrypted_metadata_nonce.as_deref())
    .bind(
        object
            .encrypted_user_data
            .encrypted_metadata_encrypted_key
            .as_deref(),
    )
    .bind(object.encrypted_user_data.encrypted_etag.as_deref())
    .bind(pack_lock_mode(&object.retention, object.legal_hold))
    .bind(object.retention.retain_until())
    .fetch_one(conn)
    .await?;
    Ok(created_at)
}

pub(crate) async fn insert_inline_segment(
    conn: &mut PgConnection,
    segment: &InlineSegmentRow,
) -> MetabaseResult<()> {
    sqlx::query(
        r#"
        INSERT INTO segments (
            stream_id, position, expires_at,
            root_piece_id, encrypted_key_nonce, encrypted_key,
            encrypted_size, encrypted_etag, plain_size, plain_offset,
            inline_data
        ) VALUES (
            $1, $2, $3,
            $4, $5, $6,
            $7, $8, $9, $10,
            $11
        )
        "#,
    )
    .bind(segment.stream_id)
    .bind(segment.position.encode())
    .bind(segment.expires_at)
    .bind(vantage_core::PieceId::ZERO.as_bytes().as_slice())
    .bind(segment.encrypted_key_nonce.as_slice())
    .bind(segment.encrypted_key.as_slice())
    .bind(segment.encrypted_size)
    .bind(segment.encrypted_etag.as_deref())
    .bind(segment.plain_size)
    .bind(segment.plain_offset)
    .bind(segment.inline_data.as_slice())
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn ensure_node_aliases(
    conn: &mut PgConnection,
    nodes: &[NodeId],
) -> MetabaseResult<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    let ids: Vec<Vec<u8>> = nodes.iter().map(|id| id.as_bytes().to_vec()).collect();
    sqlx::query(
        r#"
        INSERT INTO node_aliases (node_id)
        SELECT unnest($1::BYTEA[])
        ON CONFLICT (node_id) DO NOTHING
        "#,
    )
    .bind(ids)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn list_node_aliases(
    conn: &mut PgConnection,
) -> MetabaseResult<Vec<(NodeId, NodeAlias)>> {
    let rows = sqlx::query("SELECT node_id, node_alias FROM node_aliases")
        .fetch_all(conn)
        .await?;
    rows.into_iter()
        .map(|row| {
            let id_bytes: Vec<u8> = row.try_get(0)?;
            let alias: i32 = row.try_get(1)?;
            let node = NodeId::from_bytes(&id_bytes).map_err(MetabaseError::from)?;
            Ok((node, alias as NodeAlias))
        })
        .collect()
}

pub(crate) async fn find_zombie_objects(
    conn: &mut PgConnection,
    deadline: OffsetDateTime,
    batch_size: usize,
) -> MetabaseResult<Vec<ZombieCandidate>> {
    let rows = sqlx::query(
        r#"
        SELECT project_id, bucket_name, object_key, version, stream_id
        FROM objects
        WHERE status = $1
            AND zombie_deletion_deadline IS NOT NULL
            AND zombie_deletion_deadline < $2
        ORDER BY zombie_deletion_deadline
        LIMIT $3
        "#,
    )
    .bind(ObjectStatus::Pending.to_db())
    .bind(deadline)
    .bind(batch_size as i64)
    .fetch_all(conn)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(ZombieCandidate {
                project_id: row.try_get(0)?,
                bucket_name: row.try_get(1)?,
                object_key: row.try_get(2)?,
                version: row.try_get(3)?,
                stream_id: row.try_get(4)?,
            })
        })
        .collect()
}

pub(crate) async fn delete_zombie_object(
    conn: &mut PgConnection,
    candidate: &ZombieCandidate,
) -> MetabaseResult<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM objects
        WHERE (project_id, bucket_name, object_key, version) = ($1, $2, $3, $4)
            AND status = $5 AND stream_id = $6
        "#,
    )
    .bind(candidate.project_id)
    .bind(candidate.bucket_name.as_str())
    .bind(candidate.object_key.as_slice())
    .bind(candidate.version)
    .bind(ObjectStatus::Pending.to_db())
    .bind(candidate.stream_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Translate a not-null violation from the pending-parent subquery into the
/// typed missing-parent error.
pub(crate) fn translate_pending_parent_error(err: sqlx::Error) -> MetabaseError {
    if sql_state(&err).as_deref() == Some(NOT_NULL_VIOLATION) {
        MetabaseError::PendingObjectMissing
    } else {
        err.into()
    }
}

pub(crate) fn decode_lock(
    row: &sqlx::postgres::PgRow,
    mode_index: usize,
    until_index: usize,
) -> MetabaseResult<(Retention, bool)> {
    let mode: i16 = row.try_get(mode_index)?;
    let until: Option<OffsetDateTime> = row.try_get(until_index)?;
    unpack_lock_mode(mode, until).map_err(MetabaseError::from)
}

/// Decode the packed encryption column.
pub(crate) fn decode_encryption(value: i64) -> MetabaseResult<EncryptionParameters> {
    EncryptionParameters::unpack(value).map_err(MetabaseError::from)
}

/// Decode the four custom-metadata columns starting at `index`.
pub(crate) fn decode_user_data(
    row: &sqlx::postgres::PgRow,
    index: usize,
) -> MetabaseResult<EncryptedUserData> {
    Ok(EncryptedUserData {
        encrypted_metadata: row.try_get(index)?,
        encrypted_metadata_encrypted_key: row.try_get(index + 1)?,
        encrypted_metadata_nonce: row.try_get(index + 2)?,
        encrypted_etag: row.try_get(index + 3)?,
    })
}
