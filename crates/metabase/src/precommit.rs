//! Precommit constraint evaluation.
//!
//! Before a commit may install a new object at a location, the precommit
//! evaluator decides, inside the open transaction, what has to be deleted or
//! superseded first and which version the commit may take.

use crate::adapter::{PrecommitCandidate, TransactionAdapter};
use crate::error::{MetabaseError, MetabaseResult};
use crate::metrics;
use crate::models::ObjectStatus;
use time::OffsetDateTime;
use uuid::Uuid;
use vantage_core::{ObjectLocation, Version};

/// Arguments for evaluating the precommit constraint at a location.
#[derive(Clone, Debug)]
pub struct PrecommitConstraint {
    pub location: ObjectLocation,
    /// Keep prior versions; only report the highest version.
    pub versioned: bool,
    /// Refuse the commit if it would delete any live row.
    pub disallow_delete: bool,
    /// Conditional-write semantics: fail if any committed object exists.
    pub check_existence: bool,
}

/// An object removed by the precommit step.
#[derive(Clone, Debug)]
pub struct PrecommitDeletedObject {
    pub version: Version,
    pub stream_id: Uuid,
    pub status: ObjectStatus,
}

/// Outcome of the precommit evaluation.
#[derive(Clone, Debug, Default)]
pub struct PrecommitConstraintResult {
    /// The highest version currently at the location, 0 when empty.
    pub highest_version: Version,
    /// Live objects deleted to make room for the commit.
    pub deleted_objects: Vec<PrecommitDeletedObject>,
    /// Segments orphaned by those deletions.
    pub deleted_segment_count: u64,
}

impl PrecommitConstraintResult {
    pub(crate) fn submit_metrics(&self) {
        if !self.deleted_objects.is_empty() {
            metrics::PRECOMMIT_DELETED_OBJECTS.inc_by(self.deleted_objects.len() as u64);
        }
        if self.deleted_segment_count > 0 {
            metrics::PRECOMMIT_DELETED_SEGMENTS.inc_by(self.deleted_segment_count);
        }
    }
}

/// Evaluate the precommit constraint inside `tx`.
///
/// Unversioned commits clear the unversioned slot at the location: committed
/// and delete-marker rows without version semantics are removed together with
/// their segments. Pending rows are left alone; they are handled by their own
/// precommit when committed. Rows already past their expiry are removed
/// silently and never count as conflicts or trigger lock checks.
pub(crate) async fn precommit_constraint(
    tx: &mut dyn TransactionAdapter,
    opts: &PrecommitConstraint,
) -> MetabaseResult<PrecommitConstraintResult> {
    let now = OffsetDateTime::now_utc();
    let candidates = tx.query_objects_at_location(&opts.location).await?;

    let highest_version = candidates.first().map(|c| c.version).unwrap_or(0);

    if opts.check_existence {
        let committed_exists = candidates
            .iter()
            .any(|c| c.status.is_committed() && !is_expired(c, now));
        if committed_exists {
            return Err(MetabaseError::Conflict(
                "object already exists at the location".into(),
            ));
        }
    }

    if opts.versioned {
        return Ok(PrecommitConstraintResult {
            highest_version,
            ..Default::default()
        });
    }

    let mut live: Vec<&PrecommitCandidate> = Vec::new();
    let mut expired: Vec<&PrecommitCandidate> = Vec::new();
    for candidate in candidates.iter().filter(|c| c.status.is_unversioned()) {
        if is_expired(candidate, now) {
            expired.push(candidate);
        } else {
            live.push(candidate);
        }
    }

    if !live.is_empty() {
        if opts.disallow_delete {
            return Err(MetabaseError::PreconditionFailed("no deletes allowed".into()));
        }
        for candidate in &live {
            if candidate.legal_hold {
                return Err(MetabaseError::ObjectLock(
                    "object is protected by a legal hold".into(),
                ));
            }
            if candidate.retention.active(now) {
                return Err(MetabaseError::ObjectLock(
                    "object is protected by an active retention period".into(),
                ));
            }
        }
    }

    let doomed: Vec<&PrecommitCandidate> = live.iter().chain(expired.iter()).copied().collect();
    if doomed.is_empty() {
        return Ok(PrecommitConstraintResult {
            highest_version,
            ..Default::default()
        });
    }

    let versions: Vec<Version> = doomed.iter().map(|c| c.version).collect();
    let streams: Vec<Uuid> = doomed.iter().map(|c| c.stream_id).collect();

    tx.delete_objects_by_versions(&opts.location, &versions).await?;
    let deleted_segment_count = tx.delete_segments_by_streams(&streams).await?;

    Ok(PrecommitConstraintResult {
        highest_version,
        deleted_objects: live
            .iter()
            .map(|c| PrecommitDeletedObject {
                version: c.version,
                stream_id: c.stream_id,
                status: c.status,
            })
            .collect(),
        deleted_segment_count,
    })
}

fn is_expired(candidate: &PrecommitCandidate, now: OffsetDateTime) -> bool {
    candidate.expires_at.is_some_and(|at| at <= now)
}
