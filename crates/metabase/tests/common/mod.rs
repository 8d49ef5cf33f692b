//! Shared harness for metabase integration tests.
//!
//! Tests run against real backends in containers. Container-start failures
//! (Docker unavailable) cause a skip; schema or connection errors still
//! panic so real regressions are not silently swallowed. Set
//! `SKIP_POSTGRES_TESTS=1` or `SKIP_COCKROACH_TESTS=1` to skip explicitly.

pub mod fixtures;

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::cockroach_db::CockroachDb;
use testcontainers_modules::postgres::Postgres;
use vantage_core::MetabaseConfig;
use vantage_metabase::{Adapter, CockroachAdapter, Metabase, PostgresAdapter};

/// Stable prefix for container startup failures; tests use it to decide
/// whether to skip due to unavailable Docker.
pub const CONTAINER_START_ERR_PREFIX: &str = "container-start:";

/// A metabase over a PostgreSQL testcontainer.
#[allow(dead_code)]
pub struct PostgresTestMetabase {
    pub metabase: Metabase,
    pool: PgPool,
    _container: ContainerAsync<Postgres>,
}

impl PostgresTestMetabase {
    #[allow(dead_code)]
    pub async fn new() -> Result<Self, String> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| format!("{CONTAINER_START_ERR_PREFIX} failed to start postgres: {e}"))?;

        let host = container.get_host().await.map_err(|e| e.to_string())?;
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .map_err(|e| e.to_string())?;
        let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| e.to_string())?;

        let adapter = PostgresAdapter::from_pool(pool.clone());
        adapter.migrate().await.map_err(|e| e.to_string())?;

        let metabase = Metabase::new(
            vec![Arc::new(adapter) as Arc<dyn Adapter>],
            MetabaseConfig::default(),
        )
        .map_err(|e| e.to_string())?;

        Ok(Self {
            metabase,
            pool,
            _container: container,
        })
    }

    /// Raw pool for invariant queries against the schema.
    #[allow(dead_code)]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Start a PostgreSQL-backed metabase, or skip when Docker is unavailable.
#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<PostgresTestMetabase> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestMetabase::new().await {
        Ok(harness) => Some(harness),
        Err(msg) if msg.starts_with(CONTAINER_START_ERR_PREFIX) => {
            eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
            None
        }
        Err(msg) => panic!("PostgreSQL test setup failed: {msg}"),
    }
}

/// A metabase over a single-node CockroachDB testcontainer.
#[allow(dead_code)]
pub struct CockroachTestMetabase {
    pub metabase: Metabase,
    pool: PgPool,
    _container: ContainerAsync<CockroachDb>,
}

impl CockroachTestMetabase {
    #[allow(dead_code)]
    pub async fn new() -> Result<Self, String> {
        let container = CockroachDb::default()
            .start()
            .await
            .map_err(|e| format!("{CONTAINER_START_ERR_PREFIX} failed to start cockroach: {e}"))?;

        let host = container.get_host().await.map_err(|e| e.to_string())?;
        let port = container
            .get_host_port_ipv4(26257)
            .await
            .map_err(|e| e.to_string())?;
        let url = format!("postgres://root@{host}:{port}/defaultdb?sslmode=disable");

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| e.to_string())?;

        let adapter = CockroachAdapter::from_pool(pool.clone());
        adapter.migrate().await.map_err(|e| e.to_string())?;

        let metabase = Metabase::new(
            vec![Arc::new(adapter) as Arc<dyn Adapter>],
            MetabaseConfig::default(),
        )
        .map_err(|e| e.to_string())?;

        Ok(Self {
            metabase,
            pool,
            _container: container,
        })
    }

    #[allow(dead_code)]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Start a CockroachDB-backed metabase, or skip when Docker is unavailable.
#[allow(dead_code)]
pub async fn cockroach_or_skip() -> Option<CockroachTestMetabase> {
    if std::env::var("SKIP_COCKROACH_TESTS").is_ok() {
        return None;
    }
    match CockroachTestMetabase::new().await {
        Ok(harness) => Some(harness),
        Err(msg) if msg.starts_with(CONTAINER_START_ERR_PREFIX) => {
            eprintln!("Skipping CockroachDB test (Docker unavailable): {msg}");
            None
        }
        Err(msg) => panic!("CockroachDB test setup failed: {msg}"),
    }
}
