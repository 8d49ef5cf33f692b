//! CockroachDB adapter integration tests.
//!
//! The commit path on this backend replaces the pending row (the version is
//! part of the primary key), so the lifecycle tests here focus on field
//! carry-over across that transition.

mod common;

use common::cockroach_or_skip;
use common::fixtures::*;
use uuid::Uuid;
use vantage_metabase::{ListObjects, ObjectStatus};

#[tokio::test]
async fn commit_replaces_row_and_carries_fields_forward() {
    let Some(harness) = cockroach_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    let mut stream = stream(project_id, "b1", "k");
    let mut begin = begin_opts(stream.clone());
    begin.encrypted_user_data = vantage_core::EncryptedUserData {
        encrypted_metadata: Some(b"meta".to_vec()),
        encrypted_metadata_nonce: Some(b"nonce".to_vec()),
        encrypted_metadata_encrypted_key: Some(b"key".to_vec()),
        encrypted_etag: None,
    };
    let pending = metabase
        .begin_object_next_version(begin)
        .await
        .expect("begin failed");
    assert_eq!(pending.version, 1);
    stream.version = pending.version;

    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 100, 0))
        .await
        .expect("segment failed");

    let committed = metabase
        .commit_object(commit_opts(&stream, false))
        .await
        .expect("commit failed");
    assert_eq!(committed.status, ObjectStatus::CommittedUnversioned);
    assert_eq!(committed.created_at, pending.created_at);
    // Metadata set at begin time survives the delete-then-insert transition.
    assert_eq!(
        committed.encrypted_user_data.encrypted_metadata.as_deref(),
        Some(&b"meta"[..])
    );

    // Exactly one row remains, now committed.
    let (rows, status): (i64, i16) = sqlx::query_as(
        "SELECT count(*), min(status) FROM objects WHERE project_id = $1",
    )
    .bind(project_id)
    .fetch_one(harness.pool())
    .await
    .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(status, ObjectStatus::CommittedUnversioned.to_db());
}

#[tokio::test]
async fn versioned_history_and_listing_work_on_cockroach() {
    let Some(harness) = cockroach_or_skip().await else {
        return;
    };
    let metabase = &harness.metabase;
    let project_id = Uuid::new_v4();

    create_committed_object(metabase, project_id, "b1", "k", true).await;
    create_committed_object(metabase, project_id, "b1", "k", true).await;

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
        .unwrap();
    let versions: Vec<i64> = listing.objects.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![2, 1]);
    assert!(listing.objects[0].is_latest);
    assert!(!listing.objects[1].is_latest);
}

#[tokio::test]
async fn alias_allocation_stays_within_32_bits() {
    let Some(harness) = cockroach_or_skip().await else {
        return;
    };
    let cache = harness.metabase.alias_cache();

    let aliased = cache
        .ensure_pieces_to_aliases(&pieces(&[21, 22, 23]))
        .await
        .unwrap();
    // Sequence-allocated aliases start small; they must fit the 4-byte wire
    // encoding.
    assert!(aliased.0.iter().all(|piece| piece.alias < 1_000_000));

    let roundtripped = cache.aliases_to_pieces(&aliased).await.unwrap();
    assert_eq!(roundtripped, pieces(&[21, 22, 23]));
}
