//! Découverte du schéma d'une couche ArcGIS (`{url}?f=json`)
//!
//! Deux conventions coexistent pour les sous-types :
//! - services de carte : `subtypeField` et `subtypes[].code`
//! - services d'entités : `typeIdField` et `types[].id`
//!
//! Les deux sont ramenées à la même [`RemoteLayerDescriptor`].

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SchemaError;
use crate::mapping::is_mapped_field_type;
use crate::naming::launder;
use crate::types::{
    Domain, DomainCode, FieldDescriptor, LayerKind, MetadataDialect, RemoteLayerDescriptor,
    SpatialReference, SubtypeTable,
};

/// Champs de mesure recalculés par la base destination
pub const IGNORED_FIELDS: &[&str] = &[
    "SHAPE_Length",
    "SHAPE_Area",
    "SHAPE.LEN",
    "Shape.STLength()",
    "Shape.STArea()",
];

/// `maxRecordCount` quand le service ne le déclare pas
pub const DEFAULT_MAX_RECORD_COUNT: u32 = 1000;

/// Métadonnées brutes d'une couche
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerMetadata {
    #[serde(rename = "type")]
    pub layer_type: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub fields: Option<Vec<FieldMetadata>>,
    pub geometry_type: Option<String>,
    pub extent: Option<ExtentMetadata>,
    pub spatial_reference: Option<SpatialReferenceMetadata>,
    pub object_id_field: Option<String>,
    pub max_record_count: Option<u32>,
    pub advanced_query_capabilities: Option<AdvancedQueryCapabilities>,
    pub supports_pagination: Option<bool>,
    #[serde(alias = "subtypeFieldName")]
    pub subtype_field: Option<String>,
    pub subtypes: Option<Vec<SubtypeMetadata>>,
    pub type_id_field: Option<String>,
    pub types: Option<Vec<TypeMetadata>>,
}

#[derive(Debug, Deserialize)]
pub struct FieldMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub alias: Option<String>,
    pub length: Option<u32>,
    pub nullable: Option<bool>,
    pub domain: Option<DomainMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainMetadata {
    #[serde(rename = "type")]
    pub domain_type: String,
    pub name: Option<String>,
    #[serde(default)]
    pub coded_values: Vec<CodedValueMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CodedValueMetadata {
    pub name: Value,
    pub code: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtentMetadata {
    pub spatial_reference: Option<SpatialReferenceMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialReferenceMetadata {
    pub wkid: Option<u32>,
    pub latest_wkid: Option<u32>,
    pub wkt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedQueryCapabilities {
    pub supports_pagination: Option<bool>,
}

/// Sous-type (convention service de carte)
#[derive(Debug, Deserialize)]
pub struct SubtypeMetadata {
    pub code: Value,
    #[serde(default)]
    pub domains: HashMap<String, DomainMetadata>,
}

/// Type d'entité (convention service d'entités)
#[derive(Debug, Deserialize)]
pub struct TypeMetadata {
    pub id: Value,
    #[serde(default)]
    pub domains: HashMap<String, DomainMetadata>,
}

impl DomainMetadata {
    /// Convertit en [`Domain`] si c'est un domaine à valeurs codées
    fn coded(&self) -> Option<Domain> {
        if self.domain_type != "codedValue" {
            return None;
        }
        let values = self
            .coded_values
            .iter()
            .filter_map(|cv| {
                let code = DomainCode::from_json(&cv.code)?;
                let label = match &cv.name {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((code, label))
            })
            .collect();
        Some(Domain {
            name: self.name.clone(),
            values,
        })
    }
}

/// Construit le descripteur à partir de la réponse JSON du service
pub fn parse_descriptor(url: &str, body: &Value) -> Result<RemoteLayerDescriptor, SchemaError> {
    if let Some(error) = body.get("error") {
        return Err(SchemaError::Service {
            url: url.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }

    let meta: LayerMetadata =
        serde_json::from_value(body.clone()).map_err(|e| SchemaError::InvalidJson {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let kind = meta
        .layer_type
        .as_deref()
        .and_then(LayerKind::from_declared)
        .ok_or_else(|| SchemaError::UnsupportedLayerKind {
            url: url.to_string(),
            kind: meta.layer_type.clone(),
        })?;

    let geometry_type = match kind {
        LayerKind::FeatureLayer => Some(
            meta.geometry_type
                .clone()
                .ok_or(SchemaError::UnmappedGeometryType(None))?,
        ),
        LayerKind::Table => None,
    };

    let fields = discover_fields(meta.fields.as_deref().unwrap_or_default());
    let (dialect, subtype_field, subtypes) = parse_subtypes(&meta);

    let supports_pagination = meta
        .advanced_query_capabilities
        .as_ref()
        .and_then(|c| c.supports_pagination)
        .or(meta.supports_pagination)
        .unwrap_or(false);

    let descriptor = RemoteLayerDescriptor {
        url: url.trim_end_matches('/').to_string(),
        name: meta.name.clone().unwrap_or_else(|| layer_id_from_url(url)),
        kind,
        fields,
        geometry_type,
        spatial_reference: resolve_spatial_reference(&meta),
        object_id_field: meta.object_id_field.clone(),
        max_record_count: meta
            .max_record_count
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_MAX_RECORD_COUNT),
        supports_pagination,
        dialect,
        subtype_field,
        subtypes,
    };

    debug!(
        name = %descriptor.name,
        fields = descriptor.fields.len(),
        geometry = ?descriptor.geometry_type,
        srs = ?descriptor.spatial_reference,
        "Parsed layer metadata"
    );

    Ok(descriptor)
}

/// Sélectionne les champs importables : type connu, hors champs de mesure,
/// dédupliqués par nom normalisé (le premier gagne).
fn discover_fields(fields: &[FieldMetadata]) -> Vec<FieldDescriptor> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut result = Vec::with_capacity(fields.len());

    for field in fields {
        if !is_mapped_field_type(&field.field_type) || IGNORED_FIELDS.contains(&field.name.as_str())
        {
            continue;
        }
        if !seen.insert(launder(&field.name)) {
            warn!(field = %field.name, "Skipping field colliding with an earlier column name");
            continue;
        }
        result.push(FieldDescriptor {
            name: field.name.clone(),
            remote_type: field.field_type.clone(),
            alias: field.alias.clone(),
            nullable: field.nullable.unwrap_or(true),
            max_length: field.length,
            domain: field.domain.as_ref().and_then(DomainMetadata::coded),
        });
    }

    result
}

/// Détecte la convention et construit la table des sous-types
fn parse_subtypes(meta: &LayerMetadata) -> (MetadataDialect, Option<String>, SubtypeTable) {
    let dialect = if meta.subtype_field.is_some() || meta.subtypes.is_some() {
        MetadataDialect::MapService
    } else {
        MetadataDialect::FeatureService
    };

    let (field, entries): (Option<&String>, Vec<(&Value, &HashMap<String, DomainMetadata>)>) =
        match dialect {
            MetadataDialect::MapService => (
                meta.subtype_field.as_ref(),
                meta.subtypes
                    .iter()
                    .flatten()
                    .map(|s| (&s.code, &s.domains))
                    .collect(),
            ),
            MetadataDialect::FeatureService => (
                meta.type_id_field.as_ref(),
                meta.types
                    .iter()
                    .flatten()
                    .map(|t| (&t.id, &t.domains))
                    .collect(),
            ),
        };

    let Some(field) = field.filter(|f| !f.trim().is_empty()) else {
        return (dialect, None, SubtypeTable::new());
    };

    let mut table = SubtypeTable::new();
    for (code, domains) in entries {
        let Some(code) = DomainCode::from_json(code) else {
            warn!(code = %code, "Skipping subtype with a non scalar code");
            continue;
        };
        let coded: HashMap<String, Domain> = domains
            .iter()
            .filter_map(|(name, domain)| domain.coded().map(|d| (name.clone(), d)))
            .filter(|(_, d)| !d.is_empty())
            .collect();
        table.insert(code, coded);
    }

    (dialect, Some(field.clone()), table)
}

/// `latestWkid` avant `wkid`, alias Web Mercator ramenés à 3857, puis WKT,
/// sinon EPSG:4326.
fn resolve_spatial_reference(meta: &LayerMetadata) -> SpatialReference {
    let candidates = [
        meta.extent
            .as_ref()
            .and_then(|e| e.spatial_reference.as_ref()),
        meta.spatial_reference.as_ref(),
    ];

    for srs in candidates.into_iter().flatten() {
        if let Some(code) = srs.latest_wkid.or(srs.wkid) {
            return SpatialReference::Epsg(normalize_wkid(code));
        }
        if let Some(wkt) = srs.wkt.as_ref().filter(|w| !w.is_empty()) {
            return SpatialReference::Wkt(wkt.clone());
        }
    }

    SpatialReference::default()
}

fn normalize_wkid(code: u32) -> u32 {
    match code {
        102100 | 102113 | 900913 => 3857,
        other => other,
    }
}

fn layer_id_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let mut parts = trimmed.rsplit('/');
    let id = parts.next().unwrap_or_default();
    let service = parts.nth(1).unwrap_or_default();
    format!("{service}_{id}")
}
