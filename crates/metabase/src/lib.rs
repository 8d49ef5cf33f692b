//! Authoritative object and segment metadata engine.
//!
//! The metabase tracks objects, their versions, and the erasure-coded
//! segments composing them, with S3-compatible semantics: versioning, delete
//! markers, object lock, and multipart assembly. It is a library fronted by
//! the [`Metabase`] facade, which routes every request by project id to one
//! of two backing adapters:
//! - [`PostgresAdapter`]: interactive multi-statement transactions.
//! - [`CockroachAdapter`]: closure-scoped transactions retried on
//!   serialization failures.
//!
//! Shared logic (validation, invariant checks, the listing state machine,
//! the precommit constraint evaluator, alias translation) lives above the
//! adapters. Which adapter hosts a given project is configuration input.

pub mod adapter;
pub mod alias;
pub mod cockroach;
pub mod commit;
pub mod delete;
pub mod error;
pub mod list;
pub mod metrics;
pub mod models;
pub mod postgres;
pub mod precommit;
mod statements;
pub mod update;
pub mod zombie;

pub use adapter::{Adapter, TransactionAdapter};
pub use alias::NodeAliasCache;
pub use cockroach::CockroachAdapter;
pub use commit::{
    BeginObjectExactVersion, BeginObjectNextVersion, BeginSegment, CommitInlineObject,
    CommitInlineSegment, CommitObject, CommitSegment, InlineSegmentData,
};
pub use delete::{DeleteObjectLastCommitted, DeleteObjectResult};
pub use error::{MetabaseError, MetabaseResult};
pub use list::{ListObjects, ListObjectsCursor, ListObjectsParams, ListObjectsResult};
pub use models::{IfNoneMatch, Object, ObjectEntry, ObjectStatus, Segment};
pub use postgres::PostgresAdapter;
pub use precommit::{PrecommitConstraint, PrecommitConstraintResult, PrecommitDeletedObject};
pub use update::{
    SetObjectExactVersionRetention, SetObjectLastCommittedRetention, UpdateSegmentPieces,
};
pub use zombie::{DeleteZombieObjects, ZombieDeletionResult};

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use vantage_core::{AdapterConfig, MetabaseConfig};

/// The metabase facade: routes operations to adapters by project id.
///
/// Operations are safe to call concurrently from many tasks. Dropping an
/// in-flight operation cancels it; open transactions roll back, and partial
/// segment writes of a cancelled commit stay attached to the pending object
/// until a retry overwrites them or zombie cleanup reclaims them.
pub struct Metabase {
    adapters: Vec<Arc<dyn Adapter>>,
    routes: HashMap<Uuid, usize>,
    alias_cache: NodeAliasCache,
    config: MetabaseConfig,
}

impl Metabase {
    /// Assemble a metabase over already-connected adapters. The first
    /// adapter is the default route and backs the node-alias table.
    pub fn new(adapters: Vec<Arc<dyn Adapter>>, config: MetabaseConfig) -> MetabaseResult<Self> {
        if adapters.is_empty() {
            return Err(MetabaseError::InvalidRequest(
                "at least one adapter is required".into(),
            ));
        }

        let mut routes = HashMap::new();
        for route in &config.project_routes {
            if route.adapter >= adapters.len() {
                return Err(MetabaseError::InvalidRequest(format!(
                    "project {} routed to unknown adapter {}",
                    route.project_id, route.adapter
                )));
            }
            routes.insert(route.project_id, route.adapter);
        }

        let alias_cache = NodeAliasCache::new(adapters[0].clone());
        metrics::register_metrics();

        Ok(Self {
            adapters,
            routes,
            alias_cache,
            config,
        })
    }

    /// Connect every configured adapter and assemble the metabase.
    pub async fn from_config(config: MetabaseConfig) -> MetabaseResult<Self> {
        let mut adapters: Vec<Arc<dyn Adapter>> = Vec::with_capacity(config.adapters.len());
        for adapter_config in &config.adapters {
            let adapter: Arc<dyn Adapter> = match adapter_config {
                AdapterConfig::Postgres {
                    url,
                    max_connections,
                    statement_timeout_ms,
                } => Arc::new(
                    PostgresAdapter::from_url(url, *max_connections, *statement_timeout_ms).await?,
                ),
                AdapterConfig::Cockroach {
                    url,
                    max_connections,
                    max_commit_delay_ms,
                } => Arc::new(
                    CockroachAdapter::from_url(url, *max_connections, *max_commit_delay_ms).await?,
                ),
            };
            adapters.push(adapter);
        }
        Self::new(adapters, config)
    }

    /// The adapter hosting a project.
    pub fn choose_adapter(&self, project_id: Uuid) -> &dyn Adapter {
        let index = self.routes.get(&project_id).copied().unwrap_or(0);
        self.adapters[index].as_ref()
    }

    /// All adapters, default first.
    pub fn adapters(&self) -> &[Arc<dyn Adapter>] {
        &self.adapters
    }

    /// The shared node-alias cache.
    pub fn alias_cache(&self) -> &NodeAliasCache {
        &self.alias_cache
    }

    /// The active configuration.
    pub fn config(&self) -> &MetabaseConfig {
        &self.config
    }

    /// Check connectivity of every adapter.
    pub async fn health_check(&self) -> MetabaseResult<()> {
        for adapter in &self.adapters {
            adapter.health_check().await?;
        }
        Ok(())
    }
}
