//! Object and segment models mapping to the metabase schema.

use crate::error::{MetabaseError, MetabaseResult};
use time::OffsetDateTime;
use uuid::Uuid;
use vantage_core::{
    AliasPieces, BucketName, EncryptedUserData, EncryptionParameters, ObjectKey, PieceId,
    RedundancyScheme, Retention, SegmentPosition, Version,
};

/// Status of an object row.
///
/// "Committed" in prose means either of the two committed variants. `Prefix`
/// is synthetic: it never hits the database and only appears in listing
/// results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
pub enum ObjectStatus {
    Pending = 1,
    CommittedUnversioned = 3,
    CommittedVersioned = 4,
    DeleteMarkerVersioned = 5,
    DeleteMarkerUnversioned = 6,
    Prefix = 7,
}

impl ObjectStatus {
    /// The committed status matching the versioning flag.
    pub fn committed(versioned: bool) -> Self {
        if versioned {
            ObjectStatus::CommittedVersioned
        } else {
            ObjectStatus::CommittedUnversioned
        }
    }

    /// The delete-marker status matching the versioning flag.
    pub fn delete_marker(versioned: bool) -> Self {
        if versioned {
            ObjectStatus::DeleteMarkerVersioned
        } else {
            ObjectStatus::DeleteMarkerUnversioned
        }
    }

    pub fn is_pending(self) -> bool {
        self == ObjectStatus::Pending
    }

    pub fn is_committed(self) -> bool {
        matches!(
            self,
            ObjectStatus::CommittedUnversioned | ObjectStatus::CommittedVersioned
        )
    }

    pub fn is_delete_marker(self) -> bool {
        matches!(
            self,
            ObjectStatus::DeleteMarkerVersioned | ObjectStatus::DeleteMarkerUnversioned
        )
    }

    /// Whether this status occupies the single unversioned slot at a location.
    pub fn is_unversioned(self) -> bool {
        matches!(
            self,
            ObjectStatus::CommittedUnversioned | ObjectStatus::DeleteMarkerUnversioned
        )
    }

    /// The database representation.
    pub fn to_db(self) -> i16 {
        self as i16
    }

    /// Decode the database representation.
    pub fn from_db(value: i16) -> MetabaseResult<Self> {
        match value {
            1 => Ok(ObjectStatus::Pending),
            3 => Ok(ObjectStatus::CommittedUnversioned),
            4 => Ok(ObjectStatus::CommittedVersioned),
            5 => Ok(ObjectStatus::DeleteMarkerVersioned),
            6 => Ok(ObjectStatus::DeleteMarkerUnversioned),
            other => Err(MetabaseError::Internal(format!(
                "unexpected object status {other} in database"
            ))),
        }
    }
}

/// A fully materialized object row.
#[derive(Clone, Debug)]
pub struct Object {
    pub project_id: Uuid,
    pub bucket_name: BucketName,
    pub object_key: ObjectKey,
    pub version: Version,
    pub stream_id: Uuid,

    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,

    pub status: ObjectStatus,
    pub segment_count: i32,

    pub encrypted_user_data: EncryptedUserData,

    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    /// Common segment size, or -1 when segments vary in size or position.
    pub fixed_segment_size: i32,

    pub encryption: EncryptionParameters,

    /// Deadline for zombie cleanup; set exactly while the object is pending.
    pub zombie_deletion_deadline: Option<OffsetDateTime>,

    pub retention: Retention,
    pub legal_hold: bool,
}

/// A single segment row.
#[derive(Clone, Debug)]
pub struct Segment {
    pub stream_id: Uuid,
    pub position: SegmentPosition,

    pub created_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub repaired_at: Option<OffsetDateTime>,

    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,

    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,
    pub encrypted_etag: Option<Vec<u8>>,

    pub redundancy: RedundancyScheme,
    /// Piece set of a remote segment; `None` for inline segments.
    pub alias_pieces: Option<AliasPieces>,
    /// Payload of an inline segment; `None` for remote segments.
    pub inline_data: Option<Vec<u8>>,

    pub placement: i32,
}

impl Segment {
    /// Whether the segment stores its payload inline.
    pub fn is_inline(&self) -> bool {
        self.inline_data.is_some()
    }
}

/// A single listing result: either an object version or a collapsed prefix.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    pub is_prefix: bool,
    /// Key relative to the listing prefix. For prefix entries this ends with
    /// the delimiter.
    pub object_key: ObjectKey,
    pub version: Version,
    pub stream_id: Uuid,
    pub status: ObjectStatus,
    pub encryption: EncryptionParameters,
    /// True for the newest committed version of a key in a non-pending
    /// listing.
    pub is_latest: bool,

    // System metadata, populated when requested.
    pub created_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,
    pub segment_count: i32,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    pub fixed_segment_size: i32,

    // Custom metadata, populated when requested.
    pub encrypted_user_data: EncryptedUserData,
}

impl ObjectEntry {
    /// A synthetic prefix entry.
    pub fn prefix(object_key: ObjectKey) -> Self {
        ObjectEntry {
            is_prefix: true,
            object_key,
            version: 0,
            stream_id: Uuid::nil(),
            status: ObjectStatus::Prefix,
            encryption: EncryptionParameters::default(),
            is_latest: false,
            created_at: None,
            expires_at: None,
            segment_count: 0,
            total_plain_size: 0,
            total_encrypted_size: 0,
            fixed_segment_size: 0,
            encrypted_user_data: EncryptedUserData::default(),
        }
    }
}

/// Conditional-write header for commit operations. Only `*` is supported:
/// the commit fails if any committed object already occupies the location.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IfNoneMatch(pub Vec<String>);

impl IfNoneMatch {
    /// Validate the condition list.
    pub fn verify(&self) -> MetabaseResult<()> {
        match self.0.as_slice() {
            [] => Ok(()),
            [value] if value == "*" => Ok(()),
            _ => Err(MetabaseError::InvalidRequest(
                "IfNoneMatch only supports a single '*' value".into(),
            )),
        }
    }

    /// Whether the `*` condition is present.
    pub fn all(&self) -> bool {
        self.0.iter().any(|value| value == "*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            ObjectStatus::Pending,
            ObjectStatus::CommittedUnversioned,
            ObjectStatus::CommittedVersioned,
            ObjectStatus::DeleteMarkerVersioned,
            ObjectStatus::DeleteMarkerUnversioned,
        ] {
            assert_eq!(ObjectStatus::from_db(status.to_db()).unwrap(), status);
        }
        // Prefix never round-trips through the database.
        assert!(ObjectStatus::from_db(ObjectStatus::Prefix.to_db()).is_err());
        assert!(ObjectStatus::from_db(2).is_err());
    }

    #[test]
    fn status_predicates() {
        assert!(ObjectStatus::committed(true).is_committed());
        assert!(!ObjectStatus::committed(true).is_unversioned());
        assert!(ObjectStatus::committed(false).is_unversioned());
        assert!(ObjectStatus::delete_marker(false).is_delete_marker());
        assert!(ObjectStatus::delete_marker(false).is_unversioned());
        assert!(!ObjectStatus::delete_marker(true).is_unversioned());
    }

    #[test]
    fn if_none_match_star() {
        assert!(IfNoneMatch::default().verify().is_ok());
        assert!(!IfNoneMatch::default().all());

        let star = IfNoneMatch(vec!["*".into()]);
        assert!(star.verify().is_ok());
        assert!(star.all());

        let etag = IfNoneMatch(vec!["\"abc\"".into()]);
        assert!(etag.verify().is_err());
    }
}
