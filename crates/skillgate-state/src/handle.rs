//! SurrealDB connection handle for the aggregate layer.
//!
//! Supports in-memory (`mem://`) connections for tests and embedded
//! `surrealkv://` storage on disk. Any other URL accepted by
//! `surrealdb::engine::any` is passed through.

use std::path::Path;

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StateError;
use crate::Result;

const NAMESPACE: &str = "skillgate";
const DATABASE: &str = "main";

/// Cloneable handle to one SurrealDB database.
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// In-memory database with the schema applied.
    #[instrument(skip_all)]
    pub async fn setup_db() -> Result<Self> {
        Self::connect("mem://").await
    }

    /// Embedded on-disk database under `dir`.
    pub async fn setup_local(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Self::connect(&format!("surrealkv://{}", dir.display())).await
    }

    /// Connect to `url`, select the namespace and apply the schema.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str) -> Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;
        info!("SurrealDB connected ({})", url);
        Ok(handle)
    }

    pub fn db(&self) -> &Surreal<Any> {
        &self.db
    }

    /// Define aggregate tables and indexes. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<()> {
        debug!("Initializing aggregate schema");
        let sql = r#"
            DEFINE TABLE IF NOT EXISTS aggregate_summaries SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_summary_stream
                ON TABLE aggregate_summaries COLUMNS skill_id, version UNIQUE;

            DEFINE TABLE IF NOT EXISTS aggregate_buckets SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_bucket_stream
                ON TABLE aggregate_buckets COLUMNS skill_id, version, bucket_start UNIQUE;
        "#;
        self.db
            .query(sql)
            .await
            .map_err(|e| StateError::SchemaSetup(e.to_string()))?
            .check()
            .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
        Ok(())
    }

    /// Cheap round trip used by health checks.
    pub async fn health_check(&self) -> Result<()> {
        self.db.query("RETURN true").await?.check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_setup_is_healthy() {
        let handle = SurrealHandle::setup_db().await.unwrap();
        handle.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let handle = SurrealHandle::setup_db().await.unwrap();
        handle.init_schema().await.unwrap();
        handle.init_schema().await.unwrap();
    }
}
