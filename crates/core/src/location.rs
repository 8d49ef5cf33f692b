//! Object locations, keys, and versions.

use crate::error::{Error, Result};
use crate::{DELIMITER, NEXT_VERSION};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Object version number within a (project, bucket, key) scope.
///
/// Versions are assigned starting at 1; [`crate::NEXT_VERSION`] (0) is the
/// sentinel requesting automatic assignment.
pub type Version = i64;

/// Bucket name within a project.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketName(String);

impl BucketName {
    /// Create a bucket name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The bucket name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the name is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for BucketName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BucketName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object key within a bucket.
///
/// Keys are raw byte strings ordered lexicographically; they are not required
/// to be valid UTF-8.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(Vec<u8>);

impl ObjectKey {
    /// Create a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the key starts with `prefix`.
    pub fn starts_with(&self, prefix: &ObjectKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Concatenate two keys.
    pub fn join(&self, suffix: &ObjectKey) -> ObjectKey {
        let mut out = Vec::with_capacity(self.0.len() + suffix.0.len());
        out.extend_from_slice(&self.0);
        out.extend_from_slice(&suffix.0);
        ObjectKey(out)
    }

    /// The key without the leading `prefix`. Panics if `prefix` is not a prefix.
    pub fn strip_prefix(&self, prefix: &ObjectKey) -> ObjectKey {
        ObjectKey(self.0[prefix.len()..].to_vec())
    }

    /// Truncate to the first `len` bytes.
    pub fn truncated(&self, len: usize) -> ObjectKey {
        ObjectKey(self.0[..len].to_vec())
    }

    /// Append a single byte.
    pub fn with_suffix_byte(&self, b: u8) -> ObjectKey {
        let mut out = self.0.clone();
        out.push(b);
        ObjectKey(out)
    }

    /// Position of the first delimiter byte, if any.
    pub fn first_delimiter(&self) -> Option<usize> {
        self.0.iter().position(|&b| b == DELIMITER)
    }

    /// The lexicographically smallest key strictly greater than every key
    /// sharing this key as a prefix. Returns an empty key for an empty input
    /// (no upper bound).
    pub fn prefix_limit(&self) -> ObjectKey {
        if self.0.is_empty() {
            return ObjectKey::default();
        }
        let mut out = self.0.clone();
        while let Some(&last) = out.last() {
            if last != 0xFF {
                *out.last_mut().expect("non-empty") = last + 1;
                return ObjectKey(out);
            }
            out.pop();
        }
        // A key of all 0xFF bytes has no finite limit.
        ObjectKey::default()
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for ObjectKey {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<&[u8]> for ObjectKey {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// The location of an object: (project, bucket, key).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub project_id: Uuid,
    pub bucket_name: BucketName,
    pub object_key: ObjectKey,
}

impl ObjectLocation {
    /// Validate that all components are present.
    pub fn verify(&self) -> Result<()> {
        if self.project_id.is_nil() {
            return Err(Error::InvalidArgument("ProjectID missing".into()));
        }
        if self.bucket_name.is_empty() {
            return Err(Error::InvalidArgument("BucketName missing".into()));
        }
        if self.object_key.is_empty() {
            return Err(Error::InvalidArgument("ObjectKey missing".into()));
        }
        Ok(())
    }
}

/// The full identity of an object version and its data stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectStream {
    pub project_id: Uuid,
    pub bucket_name: BucketName,
    pub object_key: ObjectKey,
    pub version: Version,
    pub stream_id: Uuid,
}

impl ObjectStream {
    /// Validate identity fields. The version may be the next-version sentinel.
    pub fn verify(&self) -> Result<()> {
        if self.project_id.is_nil() {
            return Err(Error::InvalidArgument("ProjectID missing".into()));
        }
        if self.bucket_name.is_empty() {
            return Err(Error::InvalidArgument("BucketName missing".into()));
        }
        if self.object_key.is_empty() {
            return Err(Error::InvalidArgument("ObjectKey missing".into()));
        }
        if self.version < NEXT_VERSION {
            return Err(Error::InvalidArgument("Version invalid".into()));
        }
        if self.stream_id.is_nil() {
            return Err(Error::InvalidArgument("StreamID missing".into()));
        }
        Ok(())
    }

    /// The object location, dropping version and stream identity.
    pub fn location(&self) -> ObjectLocation {
        ObjectLocation {
            project_id: self.project_id,
            bucket_name: self.bucket_name.clone(),
            object_key: self.object_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_limit_increments_last_byte() {
        let key = ObjectKey::from("a/");
        assert_eq!(key.prefix_limit(), ObjectKey::from("a0"));
    }

    #[test]
    fn prefix_limit_carries_over_max_bytes() {
        let key = ObjectKey::new(vec![b'a', 0xFF, 0xFF]);
        assert_eq!(key.prefix_limit(), ObjectKey::from("b"));
    }

    #[test]
    fn prefix_limit_of_empty_is_unbounded() {
        assert!(ObjectKey::default().prefix_limit().is_empty());
    }

    #[test]
    fn stream_verify_rejects_missing_fields() {
        let stream = ObjectStream {
            project_id: Uuid::new_v4(),
            bucket_name: BucketName::from("bucket"),
            object_key: ObjectKey::default(),
            version: 1,
            stream_id: Uuid::new_v4(),
        };
        assert!(stream.verify().is_err());
    }

    #[test]
    fn key_ordering_is_bytewise() {
        assert!(ObjectKey::from("a/") < ObjectKey::from("a0"));
        assert!(ObjectKey::from("a0") < ObjectKey::from("b"));
    }
}
