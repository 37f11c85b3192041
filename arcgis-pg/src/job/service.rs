//! Service d'import : création et exécution des jobs, rechargement des
//! couches suivies

use std::sync::Arc;

use arcgis::LayerService;
use tracing::{info, warn};

use super::{ImportMode, JobStatusObserver, JobStore, LayerUpdateStatus, RunStatus};
use crate::config::ImportConfig;
use crate::error::{ImportError, StructuralError};
use crate::export::StoreProvider;
use crate::import::Importer;
use crate::publish::Publisher;
use crate::report::ImportReport;

pub struct ImportService<S: StoreProvider> {
    service: Arc<dyn LayerService>,
    stores: S,
    jobs: Arc<dyn JobStore>,
    publisher: Arc<dyn Publisher>,
}

impl<S: StoreProvider> ImportService<S> {
    pub fn new(
        service: Arc<dyn LayerService>,
        stores: S,
        jobs: Arc<dyn JobStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            service,
            stores,
            jobs,
            publisher,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Enregistre un job `Pending` après avoir vérifié que l'URL décrit
    /// bien une couche. Pour un import complet, le nom de table enregistré
    /// est déjà suffixé si la table existe.
    pub async fn create_import_job(
        &self,
        url: &str,
        config: &ImportConfig,
        mode: ImportMode,
    ) -> Result<i64, ImportError> {
        config.validate()?;
        let descriptor = self.service.describe(url).await?;

        let config = match mode {
            ImportMode::Full => {
                let mut store = self.stores.acquire().await?;
                config.resolve(&descriptor, store.as_mut()).await?
            }
            ImportMode::Reload | ImportMode::Append => {
                if config.table_name.is_none() {
                    return Err(StructuralError::InvalidConfig(format!(
                        "{} mode requires a table name",
                        mode
                    ))
                    .into());
                }
                if mode == ImportMode::Append && config.update_field.is_none() {
                    return Err(StructuralError::InvalidConfig(
                        "append mode requires an update field".to_string(),
                    )
                    .into());
                }
                config.clone()
            }
        };

        let id = self.jobs.create(url, &config, mode).await?;
        info!(job = id, url = %url, mode = %mode, "Import job created");
        Ok(id)
    }

    /// Exécute un job `Pending` ; `None` si le job a déjà été pris
    pub async fn run_import_job(&self, id: i64) -> Result<Option<ImportReport>, ImportError> {
        let job = self.jobs.get(id).await?.ok_or(ImportError::JobNotFound(id))?;

        if job.status != RunStatus::Pending || !self.jobs.claim(id).await? {
            warn!(job = id, status = %job.status, "Job already taken, skipping");
            return Ok(None);
        }

        let mut store = match self.stores.acquire().await {
            Ok(store) => store,
            Err(e) => {
                self.jobs
                    .update_status(id, &e.to_string(), RunStatus::Failed)
                    .await?;
                return Err(e.into());
            }
        };

        let observer = JobStatusObserver::new(Arc::clone(&self.jobs), id);
        let importer = Importer::new(self.service.as_ref(), self.publisher.as_ref())
            .with_observer(&observer);
        let report = importer
            .run(store.as_mut(), job.mode, &job.url, &job.config)
            .await;

        if job.mode == ImportMode::Full && report.is_success() {
            // Une table temporaire disparaît avec la connexion
            if let Some(table) = report.table.as_ref().filter(|t| !t.is_temporary()) {
                self.jobs.track_layer(&job.url, table).await?;
            }
        }

        Ok(Some(report))
    }

    /// Recharge chaque couche suivie et enregistre le résultat
    pub async fn refresh_imported_layers(&self) -> Result<Vec<ImportReport>, ImportError> {
        let layers = self.jobs.imported_layers().await?;
        info!(count = layers.len(), "Refreshing imported layers");

        let mut reports = Vec::with_capacity(layers.len());
        for layer in layers {
            let config = ImportConfig {
                table_name: Some(layer.table.name.clone()),
                schema: layer.table.schema.clone(),
                launder_names: true,
                ..ImportConfig::default()
            };

            let outcome = match self
                .create_import_job(&layer.url, &config, ImportMode::Reload)
                .await
            {
                Ok(id) => self.run_import_job(id).await,
                Err(e) => Err(e),
            };

            let status = match &outcome {
                Ok(Some(report)) if report.is_success() => LayerUpdateStatus::Succeeded,
                Ok(_) => LayerUpdateStatus::Failed,
                Err(e) => {
                    warn!(url = %layer.url, table = %layer.table, error = %e, "Layer refresh failed");
                    LayerUpdateStatus::Failed
                }
            };
            self.jobs.set_layer_status(layer.id, status).await?;

            if let Ok(Some(report)) = outcome {
                reports.push(report);
            }
        }
        Ok(reports)
    }
}
