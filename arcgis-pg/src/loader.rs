//! Chargement des features dans une table
//!
//! Chaque feature est traduite (géométrie, valeurs de domaine) puis écrite
//! dans la transaction ouverte. Une erreur sur une feature est comptée et
//! n'interrompt jamais le chargement.

use std::borrow::Cow;
use std::sync::Arc;

use arcgis::{
    translate, CoordTransform, DestinationGeometryKind, FeatureStream, FetchError, RawFeature,
    RemoteLayerDescriptor, TypeMapper,
};
use serde_json::Value;
use tracing::debug;

use crate::config::ImportConfig;
use crate::error::FieldWriteError;
use crate::export::{
    is_truthy, timestamp_from_millis, ColumnKind, DestinationColumn, DestinationRecord,
    DestinationStore, FieldValue, GeometryValue, LoadTransaction, TableInfo,
};
use crate::job::RunTracker;

/// Géométrie attendue par la colonne destination
#[derive(Clone)]
pub struct GeometryContext {
    pub kind: DestinationGeometryKind,
    pub srid: u32,
    /// Reprojection côté client, si le service ne reprojette pas
    pub transform: Option<Arc<dyn CoordTransform>>,
}

impl std::fmt::Debug for GeometryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeometryContext")
            .field("kind", &self.kind)
            .field("srid", &self.srid)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// Type ArcGIS des champs date (millisecondes depuis l'epoch)
const DATE_FIELD_TYPE: &str = "esriFieldTypeDate";

#[derive(Debug, Clone)]
struct Binding {
    source: String,
    column: DestinationColumn,
    /// Date distante écrite dans une colonne texte
    date_as_text: bool,
}

/// Date ArcGIS rendue en texte `YYYY-MM-DD HH:MM:SS` (UTC)
fn date_text(value: &Value) -> Option<Value> {
    if !is_truthy(value) {
        return None;
    }
    timestamp_from_millis(value)
        .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
}

/// Construction des enregistrements destination d'une couche
#[derive(Debug)]
pub struct RecordBuilder<'m> {
    mapper: &'m TypeMapper,
    bindings: Vec<Binding>,
    geometry: Option<GeometryContext>,
}

impl<'m> RecordBuilder<'m> {
    /// Associe chaque champ distant à la colonne existante de même nom
    pub fn new(
        descriptor: &RemoteLayerDescriptor,
        mapper: &'m TypeMapper,
        table: &TableInfo,
        config: &ImportConfig,
        geometry: Option<GeometryContext>,
    ) -> Self {
        let bindings = descriptor
            .fields
            .iter()
            .filter_map(|field| {
                let column = table.column(&config.column_name(&field.name))?;
                Some(Binding {
                    source: field.name.clone(),
                    date_as_text: field.remote_type == DATE_FIELD_TYPE
                        && column.kind == ColumnKind::Text,
                    column: column.clone(),
                })
            })
            .collect();

        Self {
            mapper,
            bindings,
            geometry,
        }
    }

    /// Colonnes alimentées, dans l'ordre des champs
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.column.name.as_str())
    }

    pub fn build(&self, feature: &RawFeature) -> Result<DestinationRecord, FieldWriteError> {
        let geometry = match &self.geometry {
            Some(ctx) => Some(GeometryValue {
                geometry: translate(
                    feature.geometry.as_ref(),
                    ctx.kind,
                    ctx.transform.as_deref(),
                )?,
                srid: ctx.srid,
            }),
            None => None,
        };

        let subtype = self.mapper.subtype_code(&feature.properties);
        let mut values = Vec::with_capacity(self.bindings.len());

        for binding in &self.bindings {
            let Some(raw) = feature.properties.get(&binding.source) else {
                continue;
            };
            let mut value = self.mapper.substitute(&binding.source, raw, subtype.as_ref());
            if binding.date_as_text {
                if let Some(text) = date_text(&value) {
                    value = Cow::Owned(text);
                }
            }
            if let Some(typed) = FieldValue::from_json(&binding.column, &value)? {
                values.push((binding.column.name.clone(), typed));
            }
        }

        Ok(DestinationRecord { geometry, values })
    }
}

/// Bilan d'un chargement
#[derive(Debug)]
pub struct LoadReport {
    pub processed: u64,
    pub created: u64,
    pub failed: u64,
    pub total: Option<u64>,
    /// Erreur ayant interrompu le flux avant sa fin
    pub fetch_failure: Option<FetchError>,
}

impl LoadReport {
    pub fn truncated(&self) -> bool {
        self.fetch_failure.is_some()
    }
}

/// Charge toutes les features du flux dans la transaction
pub async fn load_all<D: DestinationStore + ?Sized>(
    tx: &mut LoadTransaction<'_, D>,
    stream: &mut FeatureStream,
    builder: &RecordBuilder<'_>,
    tracker: &mut RunTracker<'_>,
) -> LoadReport {
    let total = stream.total_count().await;
    let mut processed = 0u64;

    while let Some(feature) = stream.next().await {
        processed += 1;

        match builder.build(&feature) {
            Ok(record) => {
                if let Err(e) = tx.insert(&record).await {
                    debug!(feature = processed, error = %e, "Feature rejected by destination");
                }
            }
            Err(e) => {
                debug!(feature = processed, error = %e, "Feature skipped");
                tx.record_failure(e.to_string());
            }
        }

        tracker
            .progress(processed, tx.created(), tx.failed(), total)
            .await;
    }
    stream.close();

    LoadReport {
        processed,
        created: tx.created(),
        failed: tx.failed(),
        total,
        fetch_failure: stream.take_failure(),
    }
}
