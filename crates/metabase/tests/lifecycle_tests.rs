//! Object and segment lifecycle integration tests against PostgreSQL.

mod common;

use common::fixtures::*;
use common::postgres_or_skip;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use vantage_core::{ObjectKey, SegmentPosition};
use vantage_metabase::{
    BeginSegment, CommitInlineObject, DeleteObjectLastCommitted, DeleteZombieObjects,
    IfNoneMatch, InlineSegmentData, ListObjects, ObjectStatus,
};

#[tokio::test]
async fn begin_commit_and_list_single_object() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let mut stream = stream(project_id, "b1", "k");
    let pending = metabase
        .begin_object_next_version(begin_opts(stream.clone()))
        .await
        .expect("begin failed");
    assert_eq!(pending.version, 1);
    assert!(pending.status.is_pending());
    assert!(pending.zombie_deletion_deadline.is_some());
    stream.version = pending.version;

    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 100, 0))
        .await
        .expect("first segment failed");
    metabase
        .commit_segment(remote_segment(&stream, 0, 1, 50, 100))
        .await
        .expect("second segment failed");

    let committed = metabase
        .commit_object(commit_opts(&stream, false))
        .await
        .expect("commit failed");
    assert_eq!(committed.version, 1);
    assert_eq!(committed.status, ObjectStatus::CommittedUnversioned);
    assert_eq!(committed.segment_count, 2);
    assert_eq!(committed.total_plain_size, 150);
    assert_eq!(committed.total_encrypted_size, 116 + 66);
    assert_eq!(committed.fixed_segment_size, 100);
    assert!(committed.zombie_deletion_deadline.is_none());

    let listing = metabase
        .list_objects(ListObjects {
            project_id,
            bucket_name: "b1".into(),
            recursive: true,
            limit: 10,
            include_system_metadata: true,
            ..Default::default()
        })
        .await
        .expect("listing failed");
    assert!(!listing.more);
    assert_eq!(listing.objects.len(), 1);
    let entry = &listing.objects[0];
    assert_eq!(entry.object_key, ObjectKey::from("k"));
    assert_eq!(entry.version, 1);
    assert_eq!(entry.segment_count, 2);
    assert_eq!(entry.total_plain_size, 150);
    assert!(entry.is_latest);
}

#[tokio::test]
async fn versioned_commit_keeps_prior_versions() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    create_committed_object(metabase, project_id, "b1", "k", false).await;

    // Second version: a small inline segment committed as versioned.
    let mut stream = stream(project_id, "b1", "k");
    let pending = metabase
        .begin_object_next_version(begin_opts(stream.clone()))
        .await
        .expect("begin failed");
    assert_eq!(pending.version, 2);
    stream.version = pending.version;

    metabase
        .commit_inline_segment(inline_segment(&stream, vec![0xAB; 10]))
        .await
        .expect("inline segment failed");
    let committed = metabase
        .commit_object(commit_opts(&stream, true))
        .await
        .expect("versioned commit failed");
    assert_eq!(committed.version, 2);
    assert_eq!(committed.status, ObjectStatus::CommittedVersioned);
    assert_eq!(committed.total_plain_size, 10);

    let listing = metabase
        .list_objects(ListObjects {
            project_id,
            bucket_name: "b1".into(),
            recursive: true,
            all_versions: true,
            limit: 10,
            ..Default::default()
        })
        .await
        .expect("listing failed");
    assert_eq!(listing.objects.len(), 2);
    // Versions are listed newest first; only the newest is latest.
    assert_eq!(listing.objects[0].version, 2);
    assert!(listing.objects[0].is_latest);
    assert_eq!(listing.objects[1].version, 1);
    assert!(!listing.objects[1].is_latest);
}

#[tokio::test]
async fn delete_marker_hides_all_versions() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    create_committed_object(metabase, project_id, "b1", "k", false).await;
    create_committed_object(metabase, project_id, "b1", "k", true).await;

    let deleted = metabase
        .delete_object_last_committed(DeleteObjectLastCommitted {
            location: location(project_id, "b1", "k"),
            versioned: true,
        })
        .await
        .expect("delete failed");
    let marker = deleted.marker.expect("marker missing");
    assert_eq!(marker.status, ObjectStatus::DeleteMarkerVersioned);
    assert_eq!(marker.version, 3);

    let latest_only = metabase
        .list_objects(ListObjects {
            project_id,
            bucket_name: "b1".into(),
            recursive: true,
            limit: 10,
            ..Default::default()
        })
        .await
        .expect("listing failed");
    assert!(latest_only.objects.is_empty());

    let all_versions = metabase
        .list_objects(ListObjects {
            project_id,
            bucket_name: "b1".into(),
            recursive: true,
            all_versions: true,
            limit: 10,
            ..Default::default()
        })
        .await
        .expect("listing failed");
    assert_eq!(all_versions.objects.len(), 3);
    assert!(all_versions.objects[0].status.is_delete_marker());
    assert_eq!(all_versions.objects[1].version, 2);
    assert_eq!(all_versions.objects[2].version, 1);
}

#[tokio::test]
async fn unversioned_commit_replaces_prior_object() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let first = create_committed_object(metabase, project_id, "b1", "k", false).await;
    let second = create_committed_object(metabase, project_id, "b1", "k", false).await;
    assert!(second.version > first.version);

    // Exactly one committed row remains at the location.
    let committed_rows: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM objects WHERE project_id = $1 AND status = $2",
    )
    .bind(project_id)
    .bind(ObjectStatus::CommittedUnversioned.to_db())
    .fetch_one(harness.pool())
    .await
    .unwrap();
    assert_eq!(committed_rows, 1);

    // The replaced object's segments are gone with it.
    let orphaned: i64 = sqlx::query_scalar("SELECT count(*) FROM segments WHERE stream_id = $1")
        .bind(first.stream_id)
        .fetch_one(harness.pool())
        .await
        .unwrap();
    assert_eq!(orphaned, 0);
}

#[tokio::test]
async fn commit_rewrites_plain_offsets() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let mut stream = stream(project_id, "b1", "offsets");
    let pending = metabase
        .begin_object_next_version(begin_opts(stream.clone()))
        .await
        .unwrap();
    stream.version = pending.version;

    // Both segments claim offset zero; the commit reassigns the running sum.
    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 100, 0))
        .await
        .unwrap();
    metabase
        .commit_segment(remote_segment(&stream, 0, 1, 50, 0))
        .await
        .unwrap();
    metabase.commit_object(commit_opts(&stream, false)).await.unwrap();

    let offsets: Vec<i64> = sqlx::query_scalar(
        "SELECT plain_offset FROM segments WHERE stream_id = $1 ORDER BY position",
    )
    .bind(stream.stream_id)
    .fetch_all(harness.pool())
    .await
    .unwrap();
    assert_eq!(offsets, vec![0, 100]);
}

#[tokio::test]
async fn commit_segment_is_an_upsert() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let mut stream = stream(project_id, "b1", "upsert");
    let pending = metabase
        .begin_object_next_version(begin_opts(stream.clone()))
        .await
        .unwrap();
    stream.version = pending.version;

    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 100, 0))
        .await
        .unwrap();
    // Same position again: the row is replaced, not duplicated.
    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 100, 0))
        .await
        .unwrap();

    let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM segments WHERE stream_id = $1")
        .bind(stream.stream_id)
        .fetch_one(harness.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // An inline upsert over the remote row clears the remote fields.
    metabase
        .commit_inline_segment(inline_segment(&stream, vec![1, 2, 3]))
        .await
        .unwrap();
    let (redundancy, alias_pieces): (i64, Option<Vec<u8>>) = sqlx::query_as(
        "SELECT redundancy, remote_alias_pieces FROM segments WHERE stream_id = $1",
    )
    .bind(stream.stream_id)
    .fetch_one(harness.pool())
    .await
    .unwrap();
    assert_eq!(redundancy, 0);
    assert!(alias_pieces.is_none());
}

#[tokio::test]
async fn commit_requires_pending_parent() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let mut stream = stream(project_id, "b1", "k");
    let pending = metabase
        .begin_object_next_version(begin_opts(stream.clone()))
        .await
        .unwrap();
    stream.version = pending.version;
    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 100, 0))
        .await
        .unwrap();
    metabase.commit_object(commit_opts(&stream, false)).await.unwrap();

    // Re-committing the same stream finds no pending row.
    let err = metabase
        .commit_object(commit_opts(&stream, false))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "object-not-found");

    // Segment commits against a committed parent fail the same way the
    // begin-segment check does.
    let err = metabase
        .commit_segment(remote_segment(&stream, 0, 1, 100, 100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "pending-object-missing");

    let err = metabase
        .begin_segment(BeginSegment {
            stream: stream.clone(),
            position: SegmentPosition::new(0, 1),
            root_piece_id: piece_id(7),
            pieces: pieces(&[1, 2, 3]),
            object_exists_checked: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "pending-object-missing");
}

#[tokio::test]
async fn conditional_commit_conflicts_and_preserves_pending_row() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    create_committed_object(metabase, project_id, "b1", "k", false).await;

    let mut stream = stream(project_id, "b1", "k");
    let pending = metabase
        .begin_object_next_version(begin_opts(stream.clone()))
        .await
        .unwrap();
    stream.version = pending.version;
    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 100, 0))
        .await
        .unwrap();

    let mut opts = commit_opts(&stream, false);
    opts.if_none_match = IfNoneMatch(vec!["*".into()]);
    let err = metabase.commit_object(opts).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");

    // The pending row is untouched by the failed commit.
    let pending_rows: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM objects WHERE project_id = $1 AND status = $2",
    )
    .bind(project_id)
    .bind(ObjectStatus::Pending.to_db())
    .fetch_one(harness.pool())
    .await
    .unwrap();
    assert_eq!(pending_rows, 1);
}

#[tokio::test]
async fn disallow_delete_refuses_unversioned_overwrite() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    create_committed_object(metabase, project_id, "b1", "k", false).await;

    let mut stream = stream(project_id, "b1", "k");
    let pending = metabase
        .begin_object_next_version(begin_opts(stream.clone()))
        .await
        .unwrap();
    stream.version = pending.version;
    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 100, 0))
        .await
        .unwrap();

    let mut opts = commit_opts(&stream, false);
    opts.disallow_delete = true;
    let err = metabase.commit_object(opts).await.unwrap_err();
    assert_eq!(err.kind(), "precondition-failed");
}

#[tokio::test]
async fn commit_inline_object_one_shot() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let stream = stream(project_id, "b1", "small");
    let object = metabase
        .commit_inline_object(CommitInlineObject {
            stream: stream.clone(),
            segment: InlineSegmentData {
                position: SegmentPosition::new(0, 0),
                encrypted_key_nonce: vec![1; 24],
                encrypted_key: vec![2; 32],
                plain_size: 5,
                encrypted_etag: None,
                inline_data: vec![9; 5],
            },
            expires_at: None,
            encrypted_user_data: Default::default(),
            encryption: encryption(),
            retention: Default::default(),
            legal_hold: false,
            disallow_delete: false,
            versioned: false,
            if_none_match: Default::default(),
        })
        .await
        .expect("inline commit failed");
    assert_eq!(object.version, 1);
    assert_eq!(object.segment_count, 1);
    assert_eq!(object.total_plain_size, 5);
    assert_eq!(object.status, ObjectStatus::CommittedUnversioned);

    let (inline_data, plain_offset): (Option<Vec<u8>>, i64) = sqlx::query_as(
        "SELECT inline_data, plain_offset FROM segments WHERE stream_id = $1",
    )
    .bind(stream.stream_id)
    .fetch_one(harness.pool())
    .await
    .unwrap();
    assert_eq!(inline_data.as_deref(), Some(&[9u8; 5][..]));
    assert_eq!(plain_offset, 0);
}

#[tokio::test]
async fn exact_version_begin_rejects_duplicates() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let mut stream = stream(project_id, "b1", "exact");
    stream.version = 7;

    let opts = vantage_metabase::BeginObjectExactVersion {
        stream: stream.clone(),
        expires_at: None,
        zombie_deletion_deadline: None,
        encrypted_user_data: Default::default(),
        encryption: encryption(),
        retention: Default::default(),
        legal_hold: false,
    };
    let object = metabase
        .testing_begin_object_exact_version(opts.clone())
        .await
        .expect("exact begin failed");
    assert_eq!(object.version, 7);

    let mut duplicate = opts;
    duplicate.stream.stream_id = Uuid::new_v4();
    let err = metabase
        .testing_begin_object_exact_version(duplicate)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "object-already-exists");
}

#[tokio::test]
async fn zombie_cleanup_removes_expired_pending_objects() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let mut stream = stream(project_id, "b1", "zombie");
    let mut opts = begin_opts(stream.clone());
    opts.zombie_deletion_deadline = Some(OffsetDateTime::now_utc() - Duration::hours(1));
    let pending = metabase.begin_object_next_version(opts).await.unwrap();
    stream.version = pending.version;
    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 100, 0))
        .await
        .unwrap();

    let result = metabase
        .delete_zombie_objects(DeleteZombieObjects {
            deadline_before: OffsetDateTime::now_utc(),
            batch_size: 10,
        })
        .await
        .expect("zombie sweep failed");
    assert_eq!(result.deleted_objects, 1);
    assert_eq!(result.deleted_segments, 1);

    // Idempotent: a second sweep finds nothing.
    let again = metabase
        .delete_zombie_objects(DeleteZombieObjects {
            deadline_before: OffsetDateTime::now_utc(),
            batch_size: 10,
        })
        .await
        .unwrap();
    assert_eq!(again.deleted_objects, 0);

    let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM objects WHERE project_id = $1")
        .bind(project_id)
        .fetch_one(harness.pool())
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn alias_cache_roundtrip() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let cache = harness.metabase.alias_cache();

    let original = pieces(&[11, 12, 13]);
    let aliased = cache.ensure_pieces_to_aliases(&original).await.unwrap();
    assert_eq!(aliased.len(), original.len());

    let roundtripped = cache.aliases_to_pieces(&aliased).await.unwrap();
    assert_eq!(roundtripped, original);

    // Stable mapping: the same nodes resolve to the same aliases again.
    let again = cache.ensure_pieces_to_aliases(&original).await.unwrap();
    assert_eq!(again, aliased);
}

#[tokio::test]
async fn begin_rejects_expiry_with_lock() {
    let Some(harness) = postgres_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let mut opts = begin_opts(stream(project_id, "b1", "locked"));
    opts.expires_at = Some(OffsetDateTime::now_utc() + Duration::days(1));
    opts.legal_hold = true;
    let err = metabase.begin_object_next_version(opts).await.unwrap_err();
    assert_eq!(err.kind(), "object-expiration");

    let err = metabase
        .commit_object(commit_opts(&stream(project_id, "b1", "nothing"), false))
        .await
        .unwrap_err();
    // Committing a stream that was never begun has no pending row.
    assert_eq!(err.kind(), "object-not-found");
}
