//! Suivi des imports : état d'exécution, jobs et couches importées
//!
//! Un import passe par `Pending → InProgress → {Finished, Failed}`. Chaque
//! changement (message, compteurs, statut) est notifié à un
//! [`RunObserver`] optionnel, typiquement l'enregistrement du job.

pub mod memory;
pub mod postgres;
pub mod service;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use service::ImportService;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ImportConfig;
use crate::error::JobStoreError;
use crate::export::TableRef;

/// Statut d'un import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    InProgress,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "FINISHED" => Some(Self::Finished),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Transitions permises ; rester dans le même statut est toujours permis
    pub fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Finished)
                | (Self::InProgress, Self::Failed)
        ) || self == next
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Vérifie une transition
    pub fn check_transition(self, next: Self) -> Result<(), JobStoreError> {
        if self.can_become(next) {
            Ok(())
        } else {
            Err(JobStoreError::IllegalTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode d'import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Création de la table et chargement complet
    Full,
    /// Remplacement des lignes d'une table existante
    Reload,
    /// Ajout des features plus récentes que le contenu de la table
    Append,
}

impl ImportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Reload => "reload",
            Self::Append => "append",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(Self::Full),
            "reload" => Some(Self::Reload),
            "append" => Some(Self::Append),
            _ => None,
        }
    }
}

impl std::fmt::Display for ImportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// État d'une exécution d'import
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportRun {
    pub status: RunStatus,
    pub processed: u64,
    pub created: u64,
    pub failed: u64,
    pub total: Option<u64>,
    pub last_message: String,
}

impl Default for ImportRun {
    fn default() -> Self {
        Self {
            status: RunStatus::Pending,
            processed: 0,
            created: 0,
            failed: 0,
            total: None,
            last_message: String::new(),
        }
    }
}

impl ImportRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<(), JobStoreError> {
        self.status.check_transition(next)?;
        self.status = next;
        Ok(())
    }

    /// Met à jour les compteurs, qui ne décroissent jamais
    pub fn record_progress(&mut self, processed: u64, created: u64, failed: u64, total: Option<u64>) {
        self.processed = self.processed.max(processed);
        self.created = self.created.max(created);
        self.failed = self.failed.max(failed);
        if total.is_some() {
            self.total = total;
        }
    }

    /// Message de progression du chargement
    pub fn progress_message(&self) -> String {
        let total = self
            .total
            .map_or_else(|| "unknown".to_string(), |t| t.to_string());
        format!(
            "Features: Processed {} of {}, Created {}, Failed {}",
            self.processed, total, self.created, self.failed
        )
    }
}

/// Destinataire des changements d'état d'un import
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn on_update(&self, run: &ImportRun);
}

/// Observateur qui trace l'avancement dans les logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

#[async_trait]
impl RunObserver for LogObserver {
    async fn on_update(&self, run: &ImportRun) {
        info!(status = %run.status, "{}", run.last_message);
    }
}

/// Observateur qui recopie l'état dans l'enregistrement d'un job
pub struct JobStatusObserver {
    jobs: Arc<dyn JobStore>,
    job_id: i64,
}

impl JobStatusObserver {
    pub fn new(jobs: Arc<dyn JobStore>, job_id: i64) -> Self {
        Self { jobs, job_id }
    }
}

#[async_trait]
impl RunObserver for JobStatusObserver {
    async fn on_update(&self, run: &ImportRun) {
        if let Err(e) = self
            .jobs
            .update_status(self.job_id, &run.last_message, run.status)
            .await
        {
            warn!(job = self.job_id, error = %e, "Failed to update job status");
        }
    }
}

/// État d'une exécution et observateur optionnel
pub struct RunTracker<'a> {
    run: ImportRun,
    observer: Option<&'a dyn RunObserver>,
}

impl<'a> RunTracker<'a> {
    pub fn new(observer: Option<&'a dyn RunObserver>) -> Self {
        Self {
            run: ImportRun::new(),
            observer,
        }
    }

    pub fn run(&self) -> &ImportRun {
        &self.run
    }

    async fn notify(&self) {
        if let Some(observer) = self.observer {
            observer.on_update(&self.run).await;
        }
    }

    pub async fn start(&mut self) -> Result<(), JobStoreError> {
        self.run.transition(RunStatus::InProgress)?;
        self.run.last_message = "Import started".to_string();
        self.notify().await;
        Ok(())
    }

    pub async fn message(&mut self, message: impl Into<String>) {
        self.run.last_message = message.into();
        self.notify().await;
    }

    pub async fn progress(&mut self, processed: u64, created: u64, failed: u64, total: Option<u64>) {
        self.run.record_progress(processed, created, failed, total);
        self.run.last_message = self.run.progress_message();
        self.notify().await;
    }

    pub async fn finish(&mut self, message: impl Into<String>) -> Result<(), JobStoreError> {
        self.run.transition(RunStatus::Finished)?;
        self.run.last_message = message.into();
        self.notify().await;
        Ok(())
    }

    /// Termine en échec ; sans effet si l'exécution est déjà terminée
    pub async fn fail(&mut self, message: impl Into<String>) {
        if self.run.status.is_terminal() {
            return;
        }
        if self.run.status == RunStatus::Pending {
            self.run.status = RunStatus::InProgress;
        }
        self.run.status = RunStatus::Failed;
        self.run.last_message = message.into();
        self.notify().await;
    }
}

/// Enregistrement d'un job d'import
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub url: String,
    pub config: ImportConfig,
    pub mode: ImportMode,
    pub status: RunStatus,
    pub last_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Résultat de la dernière mise à jour planifiée d'une couche
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerUpdateStatus {
    Succeeded,
    Failed,
}

impl LayerUpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Succeeded" => Some(Self::Succeeded),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Couche importée, rechargée périodiquement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportedLayer {
    pub id: i64,
    pub url: String,
    pub table: TableRef,
    pub last_update_status: Option<LayerUpdateStatus>,
}

/// Persistance des jobs et des couches importées
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(
        &self,
        url: &str,
        config: &ImportConfig,
        mode: ImportMode,
    ) -> Result<i64, JobStoreError>;

    async fn get(&self, id: i64) -> Result<Option<JobRecord>, JobStoreError>;

    /// Passe un job de `Pending` à `InProgress` ; `false` si un autre
    /// appel l'a déjà pris
    async fn claim(&self, id: i64) -> Result<bool, JobStoreError>;

    /// Met à jour statut et message ; sans effet si le job n'existe pas
    async fn update_status(
        &self,
        id: i64,
        message: &str,
        status: RunStatus,
    ) -> Result<(), JobStoreError>;

    /// Enregistre une couche importée (ignorée si déjà suivie)
    async fn track_layer(&self, url: &str, table: &TableRef) -> Result<(), JobStoreError>;

    async fn imported_layers(&self) -> Result<Vec<ImportedLayer>, JobStoreError>;

    async fn set_layer_status(
        &self,
        id: i64,
        status: LayerUpdateStatus,
    ) -> Result<(), JobStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(RunStatus::Pending.can_become(RunStatus::InProgress));
        assert!(RunStatus::InProgress.can_become(RunStatus::Finished));
        assert!(RunStatus::InProgress.can_become(RunStatus::Failed));
        assert!(RunStatus::InProgress.can_become(RunStatus::InProgress));
        assert!(!RunStatus::Pending.can_become(RunStatus::Finished));
        assert!(!RunStatus::Finished.can_become(RunStatus::InProgress));
        assert!(!RunStatus::Failed.can_become(RunStatus::Finished));
    }

    #[test]
    fn test_status_roundtrip_names() {
        for status in [
            RunStatus::Pending,
            RunStatus::InProgress,
            RunStatus::Finished,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            serde_json::to_string(&RunStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut run = ImportRun::new();
        run.record_progress(3, 2, 1, Some(10));
        run.record_progress(2, 1, 1, None);
        assert_eq!((run.processed, run.created, run.failed), (3, 2, 1));
        assert_eq!(
            run.progress_message(),
            "Features: Processed 3 of 10, Created 2, Failed 1"
        );
    }

    #[tokio::test]
    async fn test_tracker_lifecycle() {
        let mut tracker = RunTracker::new(None);
        assert!(tracker.finish("done").await.is_err());
        tracker.start().await.unwrap();
        tracker.finish("done").await.unwrap();
        tracker.fail("too late").await;
        assert_eq!(tracker.run().status, RunStatus::Finished);
        assert_eq!(tracker.run().last_message, "done");
    }
}
