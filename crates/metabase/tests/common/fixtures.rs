//! Builders for objects, segments, and piece sets used across tests.

#![allow(dead_code)]

use uuid::Uuid;
use vantage_core::{
    BucketName, CipherSuite, EncryptionParameters, NodeId, ObjectKey, ObjectLocation,
    ObjectStream, Piece, PieceId, Pieces, RedundancyScheme, SegmentPosition, NEXT_VERSION,
};
use vantage_metabase::{
    BeginObjectNextVersion, CommitInlineSegment, CommitObject, CommitSegment, Metabase, Object,
};

pub fn encryption() -> EncryptionParameters {
    EncryptionParameters {
        cipher_suite: CipherSuite::AesGcm,
        block_size: 7424,
    }
}

pub fn redundancy() -> RedundancyScheme {
    RedundancyScheme {
        algorithm: 1,
        share_size: 256,
        required_shares: 1,
        repair_shares: 2,
        optimal_shares: 3,
        total_shares: 4,
    }
}

pub fn node(fill: u8) -> NodeId {
    NodeId::new([fill; 32])
}

/// A piece set over the given node fills, numbered from zero.
pub fn pieces(fills: &[u8]) -> Pieces {
    fills
        .iter()
        .enumerate()
        .map(|(number, &fill)| Piece {
            number: number as u16,
            node: node(fill),
        })
        .collect()
}

pub fn piece_id(fill: u8) -> PieceId {
    PieceId::new([fill; 32])
}

pub fn stream(project_id: Uuid, bucket: &str, key: &str) -> ObjectStream {
    ObjectStream {
        project_id,
        bucket_name: BucketName::from(bucket),
        object_key: ObjectKey::from(key),
        version: NEXT_VERSION,
        stream_id: Uuid::new_v4(),
    }
}

pub fn location(project_id: Uuid, bucket: &str, key: &str) -> ObjectLocation {
    ObjectLocation {
        project_id,
        bucket_name: BucketName::from(bucket),
        object_key: ObjectKey::from(key),
    }
}

pub fn begin_opts(stream: ObjectStream) -> BeginObjectNextVersion {
    BeginObjectNextVersion {
        stream,
        expires_at: None,
        zombie_deletion_deadline: None,
        encrypted_user_data: Default::default(),
        encryption: encryption(),
        retention: Default::default(),
        legal_hold: false,
        max_commit_delay: None,
    }
}

pub fn remote_segment(
    stream: &ObjectStream,
    part: u32,
    index: u32,
    plain_size: i32,
    plain_offset: i64,
) -> CommitSegment {
    CommitSegment {
        stream: stream.clone(),
        position: SegmentPosition::new(part, index),
        root_piece_id: piece_id(7),
        expires_at: None,
        encrypted_key_nonce: vec![1; 24],
        encrypted_key: vec![2; 32],
        plain_offset,
        plain_size,
        encrypted_size: plain_size + 16,
        encrypted_etag: None,
        redundancy: redundancy(),
        pieces: pieces(&[1, 2, 3]),
        placement: 0,
        max_commit_delay: None,
    }
}

pub fn inline_segment(stream: &ObjectStream, data: Vec<u8>) -> CommitInlineSegment {
    let plain_size = data.len() as i32;
    CommitInlineSegment {
        stream: stream.clone(),
        position: SegmentPosition::new(0, 0),
        expires_at: None,
        encrypted_key_nonce: vec![1; 24],
        encrypted_key: vec![2; 32],
        plain_offset: 0,
        plain_size,
        encrypted_etag: None,
        inline_data: data,
        max_commit_delay: None,
    }
}

pub fn commit_opts(stream: &ObjectStream, versioned: bool) -> CommitObject {
    CommitObject {
        stream: stream.clone(),
        encryption: encryption(),
        override_encrypted_metadata: false,
        encrypted_user_data: Default::default(),
        disallow_delete: false,
        versioned,
        max_commit_delay: None,
        if_none_match: Default::default(),
    }
}

/// Begin, upload one remote segment, and commit an object at the location.
pub async fn create_committed_object(
    metabase: &Metabase,
    project_id: Uuid,
    bucket: &str,
    key: &str,
    versioned: bool,
) -> Object {
    let mut stream = stream(project_id, bucket, key);
    let pending = metabase
        .begin_object_next_version(begin_opts(stream.clone()))
        .await
        .expect("begin failed");
    stream.version = pending.version;

    metabase
        .commit_segment(remote_segment(&stream, 0, 0, 256, 0))
        .await
        .expect("segment commit failed");

    metabase
        .commit_object(commit_opts(&stream, versioned))
        .await
        .expect("object commit failed")
}
