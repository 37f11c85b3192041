//! Types de données pour le crate arcgis

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::naming::launder;

/// Type de couche déclaré par le service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LayerKind {
    /// Couche géographique ("Feature Layer")
    FeatureLayer,
    /// Table attributaire sans géométrie ("Table")
    Table,
}

impl LayerKind {
    /// Interprète la valeur `type` des métadonnées
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared {
            "Feature Layer" => Some(Self::FeatureLayer),
            "Table" => Some(Self::Table),
            _ => None,
        }
    }
}

/// Convention de métadonnées utilisée par le service pour les sous-types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetadataDialect {
    /// `subtypeField` + `subtypes[].code`
    MapService,
    /// `typeIdField` + `types[].id`
    FeatureService,
}

/// Référence spatiale de la couche source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SpatialReference {
    /// Code d'autorité EPSG
    Epsg(u32),
    /// Définition WKT brute
    Wkt(String),
}

impl SpatialReference {
    /// Code EPSG si connu
    pub fn epsg(&self) -> Option<u32> {
        match self {
            Self::Epsg(code) => Some(*code),
            Self::Wkt(_) => None,
        }
    }
}

impl Default for SpatialReference {
    fn default() -> Self {
        Self::Epsg(4326)
    }
}

/// Code stocké dans un domaine ou un champ de sous-type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum DomainCode {
    Int(i64),
    Text(String),
}

impl DomainCode {
    /// Convertit une valeur JSON en code (entiers, flottants entiers, chaînes)
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| f as i64)
                })
                .map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

/// Domaine de valeurs codées : code stocké → libellé
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Domain {
    pub name: Option<String>,
    pub values: HashMap<DomainCode, String>,
}

impl Domain {
    /// Libellé associé à une valeur brute, si le code existe
    pub fn label(&self, raw: &Value) -> Option<&str> {
        DomainCode::from_json(raw)
            .and_then(|code| self.values.get(&code))
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Description d'un champ distant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub remote_type: String,
    pub alias: Option<String>,
    pub nullable: bool,
    pub max_length: Option<u32>,
    /// Domaine à valeurs codées (les domaines d'intervalle sont ignorés)
    pub domain: Option<Domain>,
}

impl FieldDescriptor {
    /// Nom de colonne destination (règles de nommage PostgreSQL)
    pub fn column_name(&self) -> String {
        launder(&self.name)
    }
}

/// Domaines par sous-type : code de sous-type → champ → domaine
pub type SubtypeTable = HashMap<DomainCode, HashMap<String, Domain>>;

/// Instantané immuable du schéma d'une couche distante
#[derive(Debug, Clone, Serialize)]
pub struct RemoteLayerDescriptor {
    /// URL de la couche (sans paramètres)
    pub url: String,
    /// Nom déclaré de la couche
    pub name: String,
    pub kind: LayerKind,
    /// Champs importables, dans l'ordre du service
    pub fields: Vec<FieldDescriptor>,
    /// Type de géométrie distant, renseigné ssi `kind == FeatureLayer`
    pub geometry_type: Option<String>,
    pub spatial_reference: SpatialReference,
    pub object_id_field: Option<String>,
    pub max_record_count: u32,
    pub supports_pagination: bool,
    pub dialect: MetadataDialect,
    pub subtype_field: Option<String>,
    pub subtypes: SubtypeTable,
}

impl RemoteLayerDescriptor {
    pub fn is_feature_layer(&self) -> bool {
        self.kind == LayerKind::FeatureLayer
    }

    /// Nom de table par défaut : nom de couche normalisé en minuscules
    pub fn layer_name(&self) -> String {
        launder(&self.name.to_lowercase())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Champs portant un domaine propre à au moins un sous-type
    pub fn subtype_fields(&self) -> BTreeSet<&str> {
        self.subtypes
            .values()
            .flat_map(|fields| fields.keys().map(String::as_str))
            .collect()
    }
}

/// Géométrie telle que livrée par le service
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum GeometryPayload {
    /// Polygone ArcGIS (anneaux)
    Rings { rings: Vec<Vec<Vec<f64>>> },
    /// Polyligne ArcGIS (chemins)
    Paths { paths: Vec<Vec<Vec<f64>>> },
    /// Multipoint ArcGIS
    Points { points: Vec<Vec<f64>> },
    /// Enveloppe ArcGIS
    Envelope {
        xmin: f64,
        ymin: f64,
        xmax: f64,
        ymax: f64,
    },
    /// Point ArcGIS
    Point { x: f64, y: f64 },
    /// Géométrie GeoJSON (`type` + `coordinates`)
    GeoJson(geojson::Geometry),
    /// Forme non reconnue (courbes, points vides...)
    Other(Value),
}

/// Un enregistrement distant, transitoire
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawFeature {
    #[serde(default)]
    pub geometry: Option<GeometryPayload>,
    #[serde(
        default,
        rename = "attributes",
        alias = "properties",
        deserialize_with = "null_as_empty"
    )]
    pub properties: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}
