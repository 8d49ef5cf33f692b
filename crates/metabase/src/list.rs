//! Paginated object listing with version and prefix collapsing.
//!
//! The engine issues batched range queries bounded by a cursor and requeries
//! with a skip-ahead cursor when it lands inside a long run of collapsed
//! versions or prefixes. It is deliberately an explicit loop with named
//! state, not a generator: the requery transitions and the bounded safety
//! counter are the essence of the algorithm.

use crate::error::{MetabaseError, MetabaseResult};
use crate::models::{ObjectEntry, ObjectStatus};
use crate::statements::decode_encryption;
use crate::Metabase;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;
use vantage_core::{
    BucketName, EncryptedUserData, ObjectKey, Version, DELIMITER_NEXT, MAX_VERSION,
};

/// A cursor into a listing: the last seen (key, version).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectsCursor {
    pub key: ObjectKey,
    pub version: Version,
}

/// Tuning parameters for a single listing call. Zero fields fall back to the
/// configured defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListObjectsParams {
    /// Same-key versions to skip before requerying.
    pub version_skip_requery: usize,
    /// Same-prefix entries to skip before requerying.
    pub prefix_skip_requery: usize,
    /// Extra rows per batch for non-recursive listings.
    pub query_extra_for_non_recursive: usize,
    /// Floor on the batch size.
    pub min_batch_size: usize,
}

/// Arguments for listing objects.
///
/// Committed listings iterate versions in descending order so the latest
/// version of a key is visited first; pending and unversioned listings
/// iterate ascending.
#[derive(Clone, Debug, Default)]
pub struct ListObjects {
    pub project_id: Uuid,
    pub bucket_name: BucketName,
    pub recursive: bool,
    pub limit: usize,
    pub prefix: ObjectKey,
    pub cursor: ListObjectsCursor,
    pub pending: bool,
    pub all_versions: bool,
    pub unversioned: bool,
    pub include_custom_metadata: bool,
    pub include_system_metadata: bool,
    pub params: ListObjectsParams,
}

impl ListObjects {
    fn verify(&self) -> MetabaseResult<()> {
        if self.project_id.is_nil() {
            return Err(MetabaseError::InvalidRequest("ProjectID missing".into()));
        }
        if self.bucket_name.is_empty() {
            return Err(MetabaseError::InvalidRequest("BucketName missing".into()));
        }
        Ok(())
    }

    /// Whether versions are iterated in ascending order.
    pub fn version_ascending(&self) -> bool {
        self.pending || self.unversioned
    }

    /// The version a fresh key scan starts from.
    pub fn first_version(&self) -> Version {
        if self.version_ascending() { 0 } else { MAX_VERSION }
    }

    fn last_version(&self) -> Version {
        if self.version_ascending() { MAX_VERSION } else { 0 }
    }

    /// Upper key bound for a prefixed listing.
    fn stop_key(&self) -> Option<ObjectKey> {
        if self.prefix.is_empty() {
            return None;
        }
        let limit = self.prefix.prefix_limit();
        (!limit.is_empty()).then_some(limit)
    }

    /// The effective starting cursor: clamps a cursor outside the prefix and
    /// rewinds to the first version of the cursor key so `is_latest` can be
    /// computed while skipping rows at or before the cursor.
    pub(crate) fn start_cursor(&self) -> ListObjectsCursor {
        if !self.cursor.key.starts_with(&self.prefix) {
            if self.cursor.key < self.prefix {
                // Before the prefix: start from the prefix itself.
                return ListObjectsCursor {
                    key: self.prefix.clone(),
                    version: self.first_version(),
                };
            }
            // After the prefix: the query will simply return nothing.
            return ListObjectsCursor {
                key: self.cursor.key.clone(),
                version: self.first_version(),
            };
        }

        if !self.recursive {
            // A cursor pointing inside a collapsed prefix skips past it.
            let key_without_prefix = self.cursor.key.strip_prefix(&self.prefix);
            if let Some(delimiter) = key_without_prefix.first_delimiter() {
                let cut = delimiter + self.prefix.len();
                return ListObjectsCursor {
                    key: self.cursor.key.truncated(cut).with_suffix_byte(DELIMITER_NEXT),
                    version: self.first_version(),
                };
            }
        }

        ListObjectsCursor {
            key: self.cursor.key.clone(),
            version: self.first_version(),
        }
    }
}

/// Result of listing objects.
#[derive(Clone, Debug, Default)]
pub struct ListObjectsResult {
    pub objects: Vec<ObjectEntry>,
    pub more: bool,
}

impl Metabase {
    /// List entries under a (project, bucket, optional prefix), paginated.
    pub async fn list_objects(&self, mut opts: ListObjects) -> MetabaseResult<ListObjectsResult> {
        opts.verify()?;

        let defaults = &self.config().list;
        if opts.limit == 0 || opts.limit > defaults.max_limit {
            opts.limit = defaults.max_limit;
        }
        ensure_range(&mut opts.params.version_skip_requery, defaults.version_skip_requery);
        ensure_range(&mut opts.params.prefix_skip_requery, defaults.prefix_skip_requery);
        ensure_range(&mut opts.params.min_batch_size, defaults.min_batch_size);
        ensure_range(
            &mut opts.params.query_extra_for_non_recursive,
            defaults.query_extra_for_non_recursive,
        );

        self.choose_adapter(opts.project_id).list_objects(&opts).await
    }
}

fn ensure_range(value: &mut usize, default: usize) {
    if *value == 0 {
        *value = default;
    }
    *value = (*value).clamp(1, 100_000);
}

/// Snapshot of the most recently visited row.
#[derive(Default)]
struct LastEntry {
    set: bool,
    object_key: ObjectKey,
    version: Version,
    is_prefix: bool,
}

/// Run the listing loop against a backend pool. Shared by both adapters.
pub(crate) async fn list_objects(
    pool: &PgPool,
    opts: &ListObjects,
) -> MetabaseResult<ListObjectsResult> {
    let params = &opts.params;

    // Safety net for an invalid implementation: roughly one query per entry,
    // widened whenever a delete marker is consumed without being emitted.
    let mut requery_limit = opts.limit + 10;

    // One extra entry decides the `more` flag.
    let extra_entries_for_more = 1;
    let mut batch_size = opts.limit + extra_entries_for_more;

    // When starting from a cursor the scan rewinds to the first version of
    // the cursor key to compute `is_latest`, so a few rows before the cursor
    // get scanned and skipped. Query a few extra as a guess.
    let extra_entries_for_is_latest = 3;
    if opts.cursor != ListObjectsCursor::default() {
        batch_size += extra_entries_for_is_latest;
    }

    // Non-recursive listings usually skip over rows inside prefixes.
    if !opts.recursive {
        batch_size += params.query_extra_for_non_recursive;
    }

    if batch_size < params.min_batch_size {
        batch_size = params.min_batch_size;
    }

    let mut last_entry = LastEntry::default();
    let mut skip_prefix_count = 0usize;
    let mut skip_version_count = 0usize;

    let mut cursor = opts.start_cursor();
    let mut result = ListObjectsResult::default();

    let stop_key = opts.stop_key();
    let sql = build_batch_query(opts, stop_key.is_some());

    let mut repeat = 0;
    while repeat < requery_limit {
        repeat += 1;

        let mut query = sqlx::query(&sql)
            .bind(opts.project_id)
            .bind(opts.bucket_name.as_str())
            .bind(cursor.key.as_bytes().to_vec())
            .bind(cursor.version)
            .bind(batch_size as i64);
        if let Some(stop) = &stop_key {
            query = query
                .bind(opts.prefix.len() as i32 + 1)
                .bind(stop.as_bytes().to_vec());
        } else if !opts.prefix.is_empty() {
            query = query.bind(opts.prefix.len() as i32 + 1);
        }
        let rows = query.fetch_all(pool).await?;

        let mut found_delete_marker = false;
        let mut scanned_count = 0usize;
        let mut skip_ahead = false;

        'read_entries: for row in &rows {
            let mut entry = scan_entry(row, opts)?;
            scanned_count += 1;

            // A duplicate prefix entry, which only happens when collapsing.
            let skip_prefix = last_entry.set
                && last_entry.is_prefix
                && entry.is_prefix
                && last_entry.object_key == entry.object_key;
            let same_entry =
                last_entry.is_prefix == entry.is_prefix && last_entry.object_key == entry.object_key;
            // Another version of an already emitted key.
            let skip_version = last_entry.set && !opts.all_versions && same_entry;

            // When the cursor landed mid-versions, the rewound scan revisits
            // entries at or past the cursor; they must not be emitted again.
            let mut skip_cursor_double_check = false;
            if entry_key_matches_cursor(&opts.prefix, &entry.object_key, &opts.cursor.key) {
                skip_cursor_double_check = if opts.version_ascending() {
                    entry.version <= opts.cursor.version
                } else {
                    entry.version >= opts.cursor.version
                };
            }

            if !opts.pending && !entry.is_prefix {
                entry.is_latest = !same_entry || !last_entry.set;
            }

            last_entry = LastEntry {
                set: true,
                object_key: entry.object_key.clone(),
                version: entry.version,
                is_prefix: entry.is_prefix,
            };

            if skip_prefix || skip_version || skip_cursor_double_check {
                if skip_prefix {
                    skip_prefix_count += 1;
                }
                if skip_version {
                    skip_version_count += 1;
                }

                if skip_prefix_count >= params.prefix_skip_requery
                    || skip_version_count >= params.version_skip_requery
                {
                    // Landed inside a long run of repeated items; requery
                    // with a skip-ahead cursor instead of walking them all.
                    skip_ahead = true;
                    skip_prefix_count = 0;
                    skip_version_count = 0;
                    break 'read_entries;
                }

                continue;
            }

            skip_prefix_count = 0;
            skip_version_count = 0;

            // Delete markers are consumed, not emitted, in latest-only
            // listings. They still update `last_entry` so every version
            // behind the marker is elided.
            if !opts.all_versions && entry.status.is_delete_marker() {
                found_delete_marker = true;
                continue;
            }

            result.objects.push(entry);
            if result.objects.len() >= opts.limit + 1 {
                result.more = true;
                result.objects.truncate(opts.limit);
                return Ok(result);
            }
        }

        if found_delete_marker {
            // The safety bound cannot be pre-computed for listings crossing
            // many delete markers; widen it as they are encountered.
            requery_limit += 1;
        }

        if scanned_count == 0 {
            result.more = false;
            return Ok(result);
        }
        if !skip_ahead && scanned_count < batch_size {
            result.more = false;
            return Ok(result);
        }

        if last_entry.is_prefix {
            // Skip past every key sharing the collapsed prefix.
            let collapsed = last_entry.object_key.truncated(last_entry.object_key.len() - 1);
            cursor.key = opts
                .prefix
                .join(&collapsed)
                .with_suffix_byte(DELIMITER_NEXT);
            cursor.version = opts.first_version();
        } else if opts.all_versions {
            // Continue where the batch left off.
            cursor.key = opts.prefix.join(&last_entry.object_key);
            cursor.version = last_entry.version;
        } else {
            // Jump to the next key.
            cursor.key = opts.prefix.join(&last_entry.object_key);
            cursor.version = opts.last_version();
        }
    }

    Err(MetabaseError::Internal("too many requeries".into()))
}

fn entry_key_matches_cursor(prefix: &ObjectKey, entry_key: &ObjectKey, cursor_key: &ObjectKey) -> bool {
    prefix.len() + entry_key.len() == cursor_key.len()
        && cursor_key.as_bytes()[..prefix.len()] == *prefix.as_bytes()
        && cursor_key.as_bytes()[prefix.len()..] == *entry_key.as_bytes()
}

fn build_batch_query(opts: &ListObjects, has_stop_key: bool) -> String {
    let key_expr = if opts.prefix.is_empty() {
        "object_key"
    } else {
        "substring(object_key from $6) AS object_key_suffix"
    };

    let mut selected = format!("{key_expr}, version, stream_id, status, encryption");
    if opts.include_system_metadata {
        selected.push_str(
            ", created_at, expires_at, segment_count, total_plain_size, total_encrypted_size, fixed_segment_size",
        );
    }
    if opts.include_custom_metadata {
        selected.push_str(
            ", encrypted_metadata_nonce, encrypted_metadata, encrypted_metadata_encrypted_key, encrypted_etag",
        );
    }

    let boundary = if opts.version_ascending() {
        "(object_key > $3 OR (object_key = $3 AND version > $4))"
    } else {
        "(object_key > $3 OR (object_key = $3 AND version < $4))"
    };

    let stop_condition = if has_stop_key { "AND object_key < $7" } else { "" };

    let status_condition = if opts.pending {
        format!("status = {}", ObjectStatus::Pending.to_db())
    } else {
        format!("status <> {}", ObjectStatus::Pending.to_db())
    };

    let order = if opts.version_ascending() {
        "object_key ASC, version ASC"
    } else {
        "object_key ASC, version DESC"
    };

    format!(
        r#"
        SELECT {selected}
        FROM objects
        WHERE project_id = $1 AND bucket_name = $2
            AND {boundary}
            {stop_condition}
            AND {status_condition}
            AND (expires_at IS NULL OR expires_at > now())
        ORDER BY {order}
        LIMIT $5
        "#
    )
}

fn scan_entry(row: &PgRow, opts: &ListObjects) -> MetabaseResult<ObjectEntry> {
    let key_bytes: Vec<u8> = row.try_get(0)?;
    let mut entry = ObjectEntry {
        is_prefix: false,
        object_key: ObjectKey::new(key_bytes),
        version: row.try_get(1)?,
        stream_id: row.try_get(2)?,
        status: ObjectStatus::from_db(row.try_get::<i16, _>(3)?)?,
        encryption: decode_encryption(row.try_get(4)?)?,
        is_latest: false,
        created_at: None,
        expires_at: None,
        segment_count: 0,
        total_plain_size: 0,
        total_encrypted_size: 0,
        fixed_segment_size: 0,
        encrypted_user_data: EncryptedUserData::default(),
    };

    let mut index = 5;
    if opts.include_system_metadata {
        entry.created_at = Some(row.try_get(index)?);
        entry.expires_at = row.try_get(index + 1)?;
        entry.segment_count = row.try_get(index + 2)?;
        entry.total_plain_size = row.try_get(index + 3)?;
        entry.total_encrypted_size = row.try_get(index + 4)?;
        entry.fixed_segment_size = row.try_get(index + 5)?;
        index += 6;
    }
    if opts.include_custom_metadata {
        entry.encrypted_user_data = EncryptedUserData {
            encrypted_metadata_nonce: row.try_get(index)?,
            encrypted_metadata: row.try_get(index + 1)?,
            encrypted_metadata_encrypted_key: row.try_get(index + 2)?,
            encrypted_etag: row.try_get(index + 3)?,
        };
    }

    if !opts.recursive {
        if let Some(delimiter) = entry.object_key.first_delimiter() {
            return Ok(ObjectEntry::prefix(entry.object_key.truncated(delimiter + 1)));
        }
    }

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(prefix: &str, cursor_key: &str, recursive: bool) -> ListObjects {
        ListObjects {
            project_id: Uuid::new_v4(),
            bucket_name: BucketName::from("bucket"),
            prefix: ObjectKey::from(prefix),
            cursor: ListObjectsCursor {
                key: ObjectKey::from(cursor_key),
                version: 5,
            },
            recursive,
            limit: 10,
            ..Default::default()
        }
    }

    #[test]
    fn start_cursor_before_prefix_starts_at_prefix() {
        let opts = listing("b/", "a", true);
        let cursor = opts.start_cursor();
        assert_eq!(cursor.key, ObjectKey::from("b/"));
        assert_eq!(cursor.version, MAX_VERSION);
    }

    #[test]
    fn start_cursor_rewinds_to_first_version() {
        let opts = listing("", "key", true);
        let cursor = opts.start_cursor();
        assert_eq!(cursor.key, ObjectKey::from("key"));
        // Descending listings rewind to the newest version of the key.
        assert_eq!(cursor.version, MAX_VERSION);
    }

    #[test]
    fn start_cursor_skips_collapsed_prefix() {
        let opts = listing("a/", "a/x/deep/key", false);
        let cursor = opts.start_cursor();
        assert_eq!(cursor.key, ObjectKey::from("a/x0"));
    }

    #[test]
    fn start_cursor_keeps_recursive_cursor() {
        let opts = listing("a/", "a/x/deep/key", true);
        let cursor = opts.start_cursor();
        assert_eq!(cursor.key, ObjectKey::from("a/x/deep/key"));
    }

    #[test]
    fn cursor_match_requires_exact_concatenation() {
        let prefix = ObjectKey::from("a/");
        assert!(entry_key_matches_cursor(
            &prefix,
            &ObjectKey::from("x"),
            &ObjectKey::from("a/x")
        ));
        assert!(!entry_key_matches_cursor(
            &prefix,
            &ObjectKey::from("x"),
            &ObjectKey::from("a/xy")
        ));
        assert!(!entry_key_matches_cursor(
            &prefix,
            &ObjectKey::from("y"),
            &ObjectKey::from("a/x")
        ));
    }

    #[test]
    fn ascending_for_pending_and_unversioned_only() {
        let mut opts = listing("", "", true);
        assert!(!opts.version_ascending());
        opts.pending = true;
        assert!(opts.version_ascending());
        opts.pending = false;
        opts.unversioned = true;
        assert!(opts.version_ascending());
    }
}
