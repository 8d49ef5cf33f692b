//! Configuration types for the metabase.

use serde::{Deserialize, Serialize};
use time::Duration;
use uuid::Uuid;

/// Metabase configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetabaseConfig {
    /// Backend adapters, in priority order. The first adapter is the default
    /// route and hosts the node-alias table.
    pub adapters: Vec<AdapterConfig>,
    /// Projects pinned to a specific adapter. Unlisted projects use the
    /// default adapter. This mapping is an input; the metabase never chooses
    /// placements itself.
    #[serde(default)]
    pub project_routes: Vec<ProjectRoute>,
    /// Maximum number of multipart parts in a single object.
    #[serde(default = "default_max_number_of_parts")]
    pub max_number_of_parts: usize,
    /// Minimum size of every part except the last, in bytes.
    #[serde(default = "default_min_part_size")]
    pub min_part_size: i64,
    /// How long a pending object may exist before zombie cleanup, in seconds.
    #[serde(default = "default_zombie_deletion_period_secs")]
    pub zombie_deletion_period_secs: u64,
    /// Listing tuning knobs.
    #[serde(default)]
    pub list: ListConfig,
}

impl MetabaseConfig {
    /// The default zombie deletion deadline offset.
    pub fn zombie_deletion_period(&self) -> Duration {
        let secs = i64::try_from(self.zombie_deletion_period_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }
}

impl Default for MetabaseConfig {
    fn default() -> Self {
        Self {
            adapters: Vec::new(),
            project_routes: Vec::new(),
            max_number_of_parts: default_max_number_of_parts(),
            min_part_size: default_min_part_size(),
            zombie_deletion_period_secs: default_zombie_deletion_period_secs(),
            list: ListConfig::default(),
        }
    }
}

/// Connection settings for a single backend adapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterConfig {
    /// PostgreSQL: interactive multi-statement transactions.
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout in milliseconds.
        statement_timeout_ms: Option<u64>,
    },
    /// CockroachDB: closure-scoped transactions retried on serialization
    /// failure.
    Cockroach {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Commit-batching hint in milliseconds, forwarded to backends that
        /// support deferred commits.
        max_commit_delay_ms: Option<u64>,
    },
}

/// Pins a project to an adapter index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectRoute {
    pub project_id: Uuid,
    pub adapter: usize,
}

/// Tuning parameters for the object listing engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListConfig {
    /// Hard cap on the listing limit; out-of-range requests clamp to this.
    #[serde(default = "default_max_list_limit")]
    pub max_limit: usize,
    /// How many same-key versions to skip before requerying with a new cursor.
    #[serde(default = "default_skip_requery")]
    pub version_skip_requery: usize,
    /// How many same-prefix entries to skip before requerying.
    #[serde(default = "default_skip_requery")]
    pub prefix_skip_requery: usize,
    /// Extra rows per batch for non-recursive listings, to amortize prefix
    /// collapsing.
    #[serde(default = "default_query_extra_for_non_recursive")]
    pub query_extra_for_non_recursive: usize,
    /// Floor on the per-batch row count.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            max_limit: default_max_list_limit(),
            version_skip_requery: default_skip_requery(),
            prefix_skip_requery: default_skip_requery(),
            query_extra_for_non_recursive: default_query_extra_for_non_recursive(),
            min_batch_size: default_min_batch_size(),
        }
    }
}

fn default_max_number_of_parts() -> usize {
    10_000
}

fn default_min_part_size() -> i64 {
    5 * 1024 * 1024
}

fn default_zombie_deletion_period_secs() -> u64 {
    86_400 // 24 hours
}

fn default_max_connections() -> u32 {
    10
}

fn default_max_list_limit() -> usize {
    1000
}

fn default_skip_requery() -> usize {
    1000
}

fn default_query_extra_for_non_recursive() -> usize {
    10
}

fn default_min_batch_size() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = MetabaseConfig::default();
        assert_eq!(config.max_number_of_parts, 10_000);
        assert_eq!(config.min_part_size, 5 * 1024 * 1024);
        assert_eq!(config.zombie_deletion_period(), Duration::hours(24));
        assert_eq!(config.list.max_limit, 1000);
    }

    #[test]
    fn adapter_config_deserializes_tagged() {
        let toml = r#"
            type = "postgres"
            url = "postgres://localhost/metabase"
        "#;
        let config: AdapterConfig = toml::from_str(toml).unwrap();
        match config {
            AdapterConfig::Postgres {
                max_connections, ..
            } => assert_eq!(max_connections, 10),
            _ => panic!("expected postgres adapter"),
        }
    }
}
