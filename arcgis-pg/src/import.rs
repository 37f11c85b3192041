//! Orchestration des imports
//!
//! Trois modes partagent la même boucle de chargement :
//! - chargement complet : création de la table puis chargement, la table
//!   est supprimée si l'import échoue
//! - rechargement : suppression des lignes existantes puis chargement dans
//!   la même transaction
//! - ajout : seules les features plus récentes que le contenu de la table
//!   sont chargées
//!
//! Les erreurs de niveau import terminent l'exécution en `Failed` ; un
//! rapport est toujours renvoyé.

use std::sync::Arc;
use std::time::Instant;

use arcgis::{
    map_geometry_type, ColumnSpec, CoordTransform, DestinationGeometryKind, FeatureStream,
    LayerService, RemoteLayerDescriptor, SchemaError, StreamOptions, TypeMapper,
};
use tracing::{error, info, warn};

use crate::config::ImportConfig;
use crate::error::{ImportError, StructuralError};
use crate::export::reproject::reprojector_for;
use crate::export::{
    DestinationStore, GeometryColumnSpec, LoadTransaction, TableInfo, TableRef, TableSpec,
};
use crate::job::{ImportMode, RunObserver, RunTracker};
use crate::loader::{load_all, GeometryContext, RecordBuilder};
use crate::publish::Publisher;
use crate::report::ImportReport;

/// SRID utilisé quand la référence spatiale source n'a pas de code EPSG
pub const DEFAULT_SRID: u32 = 4326;

/// Clause de filtre du mode ajout à partir du maximum de la colonne de mise
/// à jour ; `None` si la table est vide.
///
/// Seuls les 19 premiers caractères sont gardés (le fuseau est tronqué) et
/// le séparateur `T` est remplacé par une espace.
pub fn build_append_filter(update_field: &str, latest: Option<&str>) -> Option<String> {
    let latest = latest.map(str::trim).filter(|v| !v.is_empty())?;
    let truncated: String = latest.chars().take(19).collect();
    Some(format!(
        "{} > DATE '{}'",
        update_field,
        truncated.replace('T', " ")
    ))
}

/// Colonnes à créer pour un chargement complet
pub fn table_columns(
    mapper: &TypeMapper,
    config: &ImportConfig,
) -> Result<Vec<ColumnSpec>, SchemaError> {
    let mut columns = mapper.columns()?;
    for column in &mut columns {
        column.name = config.column_name(&column.source);
    }
    Ok(columns)
}

/// Géométrie à écrire et référence spatiale à demander au service
#[derive(Debug, Clone)]
struct GeometryPlan {
    context: GeometryContext,
    out_sr: Option<u32>,
}

impl GeometryPlan {
    /// Chargement complet : la table prend la référence spatiale de la source
    fn for_source(
        descriptor: &RemoteLayerDescriptor,
        config: &ImportConfig,
    ) -> Result<Option<Self>, ImportError> {
        if !descriptor.is_feature_layer() {
            return Ok(None);
        }
        let kind = map_geometry_type(descriptor.geometry_type.as_deref())?;
        let srid = descriptor
            .spatial_reference
            .epsg()
            .unwrap_or(DEFAULT_SRID);
        Self::towards(descriptor, config, kind, srid).map(Some)
    }

    /// Rechargement et ajout : les géométries suivent la colonne existante
    fn for_destination(
        descriptor: &RemoteLayerDescriptor,
        config: &ImportConfig,
        table: &TableInfo,
    ) -> Result<Option<Self>, ImportError> {
        if !descriptor.is_feature_layer() {
            return Ok(None);
        }
        let column = table
            .geometry
            .as_ref()
            .ok_or_else(|| StructuralError::ColumnNotFound {
                table: table.table.to_string(),
                column: config.geometry_column.clone(),
            })?;
        let kind = match column.kind {
            Some(kind) => kind,
            None => map_geometry_type(descriptor.geometry_type.as_deref())?,
        };
        let srid = column
            .srid
            .or_else(|| descriptor.spatial_reference.epsg())
            .unwrap_or(DEFAULT_SRID);
        Self::towards(descriptor, config, kind, srid).map(Some)
    }

    fn towards(
        descriptor: &RemoteLayerDescriptor,
        config: &ImportConfig,
        kind: DestinationGeometryKind,
        srid: u32,
    ) -> Result<Self, ImportError> {
        if config.client_side_reprojection {
            let transform = reprojector_for(&descriptor.spatial_reference, srid)?
                .map(|r| Arc::new(r) as Arc<dyn CoordTransform>);
            Ok(Self {
                context: GeometryContext {
                    kind,
                    srid,
                    transform,
                },
                out_sr: None,
            })
        } else {
            Ok(Self {
                context: GeometryContext {
                    kind,
                    srid,
                    transform: None,
                },
                out_sr: Some(srid),
            })
        }
    }
}

/// Orchestrateur d'imports
pub struct Importer<'a> {
    service: &'a dyn LayerService,
    publisher: &'a dyn Publisher,
    observer: Option<&'a dyn RunObserver>,
}

impl<'a> Importer<'a> {
    pub fn new(service: &'a dyn LayerService, publisher: &'a dyn Publisher) -> Self {
        Self {
            service,
            publisher,
            observer: None,
        }
    }

    /// Notifie chaque changement d'état à `observer`
    pub fn with_observer(mut self, observer: &'a dyn RunObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn full_load<D: DestinationStore + ?Sized>(
        &self,
        store: &mut D,
        url: &str,
        config: &ImportConfig,
    ) -> ImportReport {
        self.run(store, ImportMode::Full, url, config).await
    }

    pub async fn reload<D: DestinationStore + ?Sized>(
        &self,
        store: &mut D,
        url: &str,
        config: &ImportConfig,
    ) -> ImportReport {
        self.run(store, ImportMode::Reload, url, config).await
    }

    pub async fn append<D: DestinationStore + ?Sized>(
        &self,
        store: &mut D,
        url: &str,
        config: &ImportConfig,
    ) -> ImportReport {
        self.run(store, ImportMode::Append, url, config).await
    }

    /// Exécute un import ; l'issue est portée par le rapport
    pub async fn run<D: DestinationStore + ?Sized>(
        &self,
        store: &mut D,
        mode: ImportMode,
        url: &str,
        config: &ImportConfig,
    ) -> ImportReport {
        let started = Instant::now();
        let mut tracker = RunTracker::new(self.observer);
        let mut report = ImportReport::new(url, mode);

        info!(url = %url, mode = %mode, "Starting import");

        let result = match tracker.start().await {
            Ok(()) => match mode {
                ImportMode::Full => {
                    self.run_full_load(store, url, config, &mut tracker, &mut report)
                        .await
                }
                ImportMode::Reload => {
                    self.run_reload(store, url, config, &mut tracker, &mut report)
                        .await
                }
                ImportMode::Append => {
                    self.run_append(store, url, config, &mut tracker, &mut report)
                        .await
                }
            },
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(mut message) => {
                if report.truncated {
                    message = format!(
                        "{} (truncated after {} features)",
                        message, report.processed
                    );
                }
                if let Err(e) = tracker.finish(message).await {
                    error!(error = %e, "Cannot mark import as finished");
                }
            }
            Err(e) => {
                error!(url = %url, mode = %mode, error = %e, "Import failed");
                if !report.errors.contains(&e.to_string()) {
                    report.errors.push(e.to_string());
                }
                tracker.fail(e.to_string()).await;
            }
        }

        report.complete(tracker.run(), started.elapsed());
        info!(summary = %report.summary(), "Import complete");
        report
    }

    async fn run_full_load<D: DestinationStore + ?Sized>(
        &self,
        store: &mut D,
        url: &str,
        config: &ImportConfig,
        tracker: &mut RunTracker<'_>,
        report: &mut ImportReport,
    ) -> Result<String, ImportError> {
        let descriptor = self.service.describe(url).await?;
        let config = config.resolve(&descriptor, store).await?;
        let table = config.table_ref()?;
        report.table = Some(table.clone());

        let mapper = TypeMapper::new(&descriptor, config.mapper_options());
        let columns = table_columns(&mapper, &config)?;
        let plan = GeometryPlan::for_source(&descriptor, &config)?;

        let spec = TableSpec {
            table: table.clone(),
            overwrite: config.overwrite,
            temporary: config.temporary,
            owner: config.owner.clone(),
            geometry: plan.as_ref().map(|p| GeometryColumnSpec {
                name: config.geometry_column.clone(),
                kind: p.context.kind,
                srid: p.context.srid,
            }),
            columns,
        };

        let info = store.create_table(&spec).await?;
        tracker.message("DB table created").await;

        let loaded = self
            .load_table(
                &mut *store,
                info,
                &descriptor,
                &mapper,
                &config,
                plan,
                None,
                false,
                tracker,
                report,
            )
            .await;

        if let Err(e) = loaded {
            drop_created_table(store, &table).await;
            return Err(e);
        }
        tracker.message("Data imported into DB table").await;

        tracker.message("Publishing layer").await;
        let layer = self.publisher.publish(&table, &config).await?;
        let message = format!(
            "your layer title is {} and url is {}",
            layer.title, layer.url
        );
        report.published = Some(layer);
        Ok(message)
    }

    async fn run_reload<D: DestinationStore + ?Sized>(
        &self,
        store: &mut D,
        url: &str,
        config: &ImportConfig,
        tracker: &mut RunTracker<'_>,
        report: &mut ImportReport,
    ) -> Result<String, ImportError> {
        let descriptor = self.service.describe(url).await?;
        let config = config.with_default_name(&descriptor);
        let table = config.table_ref()?;
        report.table = Some(table.clone());

        let info = store.open_table(&table).await?;
        let mapper = TypeMapper::new(&descriptor, config.mapper_options());
        let plan = GeometryPlan::for_destination(&descriptor, &config, &info)?;

        self.load_table(
            store,
            info,
            &descriptor,
            &mapper,
            &config,
            plan,
            None,
            true,
            tracker,
            report,
        )
        .await?;

        self.invalidate_cache(&table).await;
        Ok("Data imported into DB table".to_string())
    }

    async fn run_append<D: DestinationStore + ?Sized>(
        &self,
        store: &mut D,
        url: &str,
        config: &ImportConfig,
        tracker: &mut RunTracker<'_>,
        report: &mut ImportReport,
    ) -> Result<String, ImportError> {
        let descriptor = self.service.describe(url).await?;
        let config = config.with_default_name(&descriptor);
        let table = config.table_ref()?;
        report.table = Some(table.clone());

        let update_field = config.update_field.as_deref().ok_or_else(|| {
            StructuralError::InvalidConfig("append mode requires an update field".to_string())
        })?;

        let info = store.open_table(&table).await?;
        let latest = store
            .max_value(&info, &config.column_name(update_field))
            .await?;
        let filter = build_append_filter(update_field, latest.as_deref());
        match &filter {
            Some(filter) => info!(table = %table, filter = %filter, "Appending newer features"),
            None => info!(table = %table, "Table is empty, appending every feature"),
        }
        report.filter = filter.clone();

        let mapper = TypeMapper::new(&descriptor, config.mapper_options());
        let plan = GeometryPlan::for_destination(&descriptor, &config, &info)?;

        self.load_table(
            store,
            info,
            &descriptor,
            &mapper,
            &config,
            plan,
            filter.as_deref(),
            false,
            tracker,
            report,
        )
        .await?;

        self.invalidate_cache(&table).await;
        Ok("Data imported into DB table".to_string())
    }

    /// Charge le flux dans `info` au sein d'une transaction ; en cas
    /// d'erreur la transaction est annulée
    #[allow(clippy::too_many_arguments)]
    async fn load_table<D: DestinationStore + ?Sized>(
        &self,
        store: &mut D,
        info: TableInfo,
        descriptor: &RemoteLayerDescriptor,
        mapper: &TypeMapper,
        config: &ImportConfig,
        plan: Option<GeometryPlan>,
        filter: Option<&str>,
        replace_rows: bool,
        tracker: &mut RunTracker<'_>,
        report: &mut ImportReport,
    ) -> Result<(), ImportError> {
        let options = StreamOptions::for_layer(descriptor, config.page_size, config.max_retries);
        let mut stream = FeatureStream::new(self.service.pages(descriptor), options);
        if let Some(out_sr) = plan.as_ref().and_then(|p| p.out_sr) {
            stream.set_out_sr(out_sr)?;
        }
        if let Some(filter) = filter {
            stream.set_filter(filter)?;
        }

        let builder = RecordBuilder::new(
            descriptor,
            mapper,
            &info,
            config,
            plan.map(|p| p.context),
        );

        let mut tx = LoadTransaction::begin(store, info).await?;

        if replace_rows {
            if let Err(e) = tx.delete_all().await {
                let outcome = tx.rollback(&e.to_string()).await;
                report.record_outcome(&outcome);
                return Err(e.into());
            }
        }

        tracker.message("Starting loading data into db table").await;
        let load = load_all(&mut tx, &mut stream, &builder, tracker).await;
        report.record_load(&load);

        if let Some(failure) = load.fetch_failure {
            if config.strict {
                let outcome = tx.rollback(&failure.to_string()).await;
                report.record_outcome(&outcome);
                return Err(failure.into());
            }
            warn!(
                processed = load.processed,
                error = %failure,
                "Feature stream stopped early, keeping loaded features"
            );
        }

        let outcome = tx.commit().await?;
        report.record_outcome(&outcome);
        Ok(())
    }

    async fn invalidate_cache(&self, table: &TableRef) {
        if let Err(e) = self.publisher.invalidate_cache(&table.to_string()).await {
            warn!(table = %table, error = %e, "Failed to invalidate render cache");
        }
    }
}

async fn drop_created_table<D: DestinationStore + ?Sized>(store: &mut D, table: &TableRef) {
    match store.drop_table(table).await {
        Ok(()) => info!(table = %table, "Dropped partially imported table"),
        Err(e) => error!(table = %table, error = %e, "Failed to drop partially imported table"),
    }
}
