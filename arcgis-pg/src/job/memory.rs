//! Suivi des jobs en mémoire (tests, CLI sans base de suivi)

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{ImportMode, ImportedLayer, JobRecord, JobStore, LayerUpdateStatus, RunStatus};
use crate::config::ImportConfig;
use crate::error::JobStoreError;
use crate::export::TableRef;

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<i64, JobRecord>,
    layers: BTreeMap<i64, ImportedLayer>,
    next_job: i64,
    next_layer: i64,
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, JobStoreError> {
        self.state
            .lock()
            .map_err(|_| JobStoreError::Database("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        url: &str,
        config: &ImportConfig,
        mode: ImportMode,
    ) -> Result<i64, JobStoreError> {
        let mut state = self.lock()?;
        state.next_job += 1;
        let id = state.next_job;
        let now = Utc::now();
        state.jobs.insert(
            id,
            JobRecord {
                id,
                url: url.to_string(),
                config: config.clone(),
                mode,
                status: RunStatus::Pending,
                last_message: String::new(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn claim(&self, id: i64) -> Result<bool, JobStoreError> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == RunStatus::Pending => {
                job.status = RunStatus::InProgress;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_status(
        &self,
        id: i64,
        message: &str,
        status: RunStatus,
    ) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(());
        };
        job.status.check_transition(status)?;
        job.status = status;
        job.last_message = message.to_string();
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn track_layer(&self, url: &str, table: &TableRef) -> Result<(), JobStoreError> {
        let mut state = self.lock()?;
        if state
            .layers
            .values()
            .any(|l| l.url == url && l.table == *table)
        {
            return Ok(());
        }
        state.next_layer += 1;
        let id = state.next_layer;
        state.layers.insert(
            id,
            ImportedLayer {
                id,
                url: url.to_string(),
                table: table.clone(),
                last_update_status: None,
            },
        );
        Ok(())
    }

    async fn imported_layers(&self) -> Result<Vec<ImportedLayer>, JobStoreError> {
        Ok(self.lock()?.layers.values().cloned().collect())
    }

    async fn set_layer_status(
        &self,
        id: i64,
        status: LayerUpdateStatus,
    ) -> Result<(), JobStoreError> {
        if let Some(layer) = self.lock()?.layers.get_mut(&id) {
            layer.last_update_status = Some(status);
        }
        Ok(())
    }
}
