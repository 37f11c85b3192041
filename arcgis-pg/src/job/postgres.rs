//! Suivi des jobs dans PostgreSQL
//!
//! Tables `_arcgis_import_jobs` et `_arcgis_imported_layers`, créées à la
//! demande dans le schéma configuré.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use tracing::debug;

use arcgis::naming::quote_ident;

use super::{ImportMode, ImportedLayer, JobRecord, JobStore, LayerUpdateStatus, RunStatus};
use crate::config::ImportConfig;
use crate::error::JobStoreError;
use crate::export::TableRef;

pub const JOBS_TABLE: &str = "_arcgis_import_jobs";
pub const LAYERS_TABLE: &str = "_arcgis_imported_layers";

fn db_error(e: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Database(e.to_string())
}

/// Jobs persistés dans la base destination
pub struct PgJobStore {
    pool: Pool,
    schema: String,
}

impl PgJobStore {
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(name))
    }

    /// Crée les tables de suivi si nécessaire
    pub async fn ensure_tables(&self) -> Result<(), JobStoreError> {
        let client = self.pool.get().await.map_err(db_error)?;

        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {jobs} (
                id BIGSERIAL PRIMARY KEY,
                url TEXT NOT NULL,
                config TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                last_message TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS {layers} (
                id BIGSERIAL PRIMARY KEY,
                url TEXT NOT NULL,
                schema_name TEXT,
                name TEXT NOT NULL,
                last_update_status TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (url, name)
            );
            "#,
            jobs = self.table(JOBS_TABLE),
            layers = self.table(LAYERS_TABLE),
        );

        client.batch_execute(&sql).await.map_err(db_error)?;
        debug!(schema = %self.schema, "Job tables ready");
        Ok(())
    }
}

fn job_from_row(row: &Row) -> Result<JobRecord, JobStoreError> {
    let config: String = row.get("config");
    let mode: String = row.get("mode");
    let status: String = row.get("status");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Ok(JobRecord {
        id: row.get("id"),
        url: row.get("url"),
        config: serde_json::from_str(&config)
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?,
        mode: ImportMode::parse(&mode)
            .ok_or_else(|| JobStoreError::Serialization(format!("unknown mode {}", mode)))?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| JobStoreError::Serialization(format!("unknown status {}", status)))?,
        last_message: row.get("last_message"),
        created_at,
        updated_at,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(
        &self,
        url: &str,
        config: &ImportConfig,
        mode: ImportMode,
    ) -> Result<i64, JobStoreError> {
        let config =
            serde_json::to_string(config).map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        let client = self.pool.get().await.map_err(db_error)?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO {} (url, config, mode) VALUES ($1, $2, $3) RETURNING id",
                    self.table(JOBS_TABLE)
                ),
                &[&url, &config, &mode.as_str()],
            )
            .await
            .map_err(db_error)?;
        Ok(row.get(0))
    }

    async fn get(&self, id: i64) -> Result<Option<JobRecord>, JobStoreError> {
        let client = self.pool.get().await.map_err(db_error)?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT id, url, config, mode, status, last_message, created_at, updated_at \
                     FROM {} WHERE id = $1",
                    self.table(JOBS_TABLE)
                ),
                &[&id],
            )
            .await
            .map_err(db_error)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim(&self, id: i64) -> Result<bool, JobStoreError> {
        let client = self.pool.get().await.map_err(db_error)?;
        let updated = client
            .execute(
                &format!(
                    "UPDATE {} SET status = $2, updated_at = NOW() WHERE id = $1 AND status = $3",
                    self.table(JOBS_TABLE)
                ),
                &[
                    &id,
                    &RunStatus::InProgress.as_str(),
                    &RunStatus::Pending.as_str(),
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(updated == 1)
    }

    async fn update_status(
        &self,
        id: i64,
        message: &str,
        status: RunStatus,
    ) -> Result<(), JobStoreError> {
        let client = self.pool.get().await.map_err(db_error)?;
        let row = client
            .query_opt(
                &format!("SELECT status FROM {} WHERE id = $1", self.table(JOBS_TABLE)),
                &[&id],
            )
            .await
            .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(());
        };
        let current: String = row.get(0);
        let current = RunStatus::parse(&current)
            .ok_or_else(|| JobStoreError::Serialization(format!("unknown status {}", current)))?;
        current.check_transition(status)?;

        client
            .execute(
                &format!(
                    "UPDATE {} SET status = $2, last_message = $3, updated_at = NOW() WHERE id = $1",
                    self.table(JOBS_TABLE)
                ),
                &[&id, &status.as_str(), &message],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn track_layer(&self, url: &str, table: &TableRef) -> Result<(), JobStoreError> {
        let client = self.pool.get().await.map_err(db_error)?;
        client
            .execute(
                &format!(
                    "INSERT INTO {} (url, schema_name, name) VALUES ($1, $2, $3) \
                     ON CONFLICT (url, name) DO NOTHING",
                    self.table(LAYERS_TABLE)
                ),
                &[&url, &table.schema, &table.name],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn imported_layers(&self) -> Result<Vec<ImportedLayer>, JobStoreError> {
        let client = self.pool.get().await.map_err(db_error)?;
        let rows = client
            .query(
                &format!(
                    "SELECT id, url, schema_name, name, last_update_status FROM {} ORDER BY id",
                    self.table(LAYERS_TABLE)
                ),
                &[],
            )
            .await
            .map_err(db_error)?;

        Ok(rows
            .iter()
            .map(|row| {
                let schema: Option<String> = row.get("schema_name");
                let name: String = row.get("name");
                let status: Option<String> = row.get("last_update_status");
                ImportedLayer {
                    id: row.get("id"),
                    url: row.get("url"),
                    table: TableRef::new(schema.as_deref(), &name),
                    last_update_status: status.as_deref().and_then(LayerUpdateStatus::parse),
                }
            })
            .collect())
    }

    async fn set_layer_status(
        &self,
        id: i64,
        status: LayerUpdateStatus,
    ) -> Result<(), JobStoreError> {
        let client = self.pool.get().await.map_err(db_error)?;
        client
            .execute(
                &format!(
                    "UPDATE {} SET last_update_status = $2, updated_at = NOW() WHERE id = $1",
                    self.table(LAYERS_TABLE)
                ),
                &[&id, &status.as_str()],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }
}
