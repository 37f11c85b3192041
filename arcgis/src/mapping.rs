//! Correspondance des types distants vers les types destination
//!
//! Le mapper est construit une fois par import à partir du descripteur. Il
//! fournit la déclaration des colonnes et la substitution des valeurs codées
//! (domaines de champ et domaines de sous-type).

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SchemaError;
use crate::types::{Domain, DomainCode, FieldDescriptor, RemoteLayerDescriptor, SubtypeTable};

/// Capacité des colonnes texte : les longueurs déclarées par les services ne
/// sont pas fiables.
pub const TEXT_CAPACITY: u32 = 10_485_760;

/// Type de colonne destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Int64,
    Int16,
    Float64,
    Float32,
    Text(u32),
    Binary,
}

/// Type de géométrie destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationGeometryKind {
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
    Curve,
    CircularString,
}

impl DestinationGeometryKind {
    /// Nom du type pour `geometry(<type>, <srid>)`
    pub fn postgis_name(self) -> &'static str {
        match self {
            Self::Point => "POINT",
            Self::MultiPoint => "MULTIPOINT",
            Self::LineString => "LINESTRING",
            Self::MultiLineString => "MULTILINESTRING",
            Self::Polygon => "POLYGON",
            Self::MultiPolygon => "MULTIPOLYGON",
            Self::Curve => "COMPOUNDCURVE",
            Self::CircularString => "CIRCULARSTRING",
        }
    }

    /// Inverse de [`Self::postgis_name`] (insensible à la casse)
    pub fn from_postgis_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "POINT" => Some(Self::Point),
            "MULTIPOINT" => Some(Self::MultiPoint),
            "LINESTRING" => Some(Self::LineString),
            "MULTILINESTRING" => Some(Self::MultiLineString),
            "POLYGON" => Some(Self::Polygon),
            "MULTIPOLYGON" => Some(Self::MultiPolygon),
            "COMPOUNDCURVE" => Some(Self::Curve),
            "CIRCULARSTRING" => Some(Self::CircularString),
            _ => None,
        }
    }
}

impl std::fmt::Display for DestinationGeometryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.postgis_name())
    }
}

/// Déclaration d'une colonne destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    /// Nom de colonne normalisé
    pub name: String,
    /// Nom du champ distant
    pub source: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub precision: Option<u8>,
}

/// Options du mapper
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperOptions {
    /// Rendre nullables les colonnes double (non nullables par défaut)
    pub nullable_double: bool,
}

/// Type destination nominal d'un type de champ distant
pub fn field_type_for(remote_type: &str) -> Option<ColumnType> {
    match remote_type {
        "esriFieldTypeInteger" => Some(ColumnType::Int64),
        "esriFieldTypeSmallInteger" => Some(ColumnType::Int16),
        "esriFieldTypeDouble" => Some(ColumnType::Float64),
        "esriFieldTypeSingle" => Some(ColumnType::Float32),
        "esriFieldTypeString" | "esriFieldTypeDate" => Some(ColumnType::Text(TEXT_CAPACITY)),
        "esriFieldTypeBlob" | "esriFieldTypeXML" => Some(ColumnType::Binary),
        _ => None,
    }
}

/// Le type distant est-il importable
pub fn is_mapped_field_type(remote_type: &str) -> bool {
    field_type_for(remote_type).is_some()
}

/// Type de géométrie destination d'un type de géométrie distant
pub fn map_geometry_type(tag: Option<&str>) -> Result<DestinationGeometryKind, SchemaError> {
    let kind = match tag {
        Some("esriGeometryPolygon") => DestinationGeometryKind::MultiPolygon,
        Some("esriGeometryPoint") => DestinationGeometryKind::Point,
        Some("esriGeometryMultipoint") => DestinationGeometryKind::MultiPoint,
        Some("esriGeometryPolyline" | "esriGeometryLine" | "esriGeometryPath") => {
            DestinationGeometryKind::LineString
        }
        Some("esriGeometryEnvelope" | "esriGeometryRing") => DestinationGeometryKind::Polygon,
        Some("esriGeometryCircularArc") => DestinationGeometryKind::Curve,
        Some("esriGeometryEllipticArc") => DestinationGeometryKind::CircularString,
        other => return Err(SchemaError::UnmappedGeometryType(other.map(str::to_string))),
    };
    Ok(kind)
}

/// Mapper de types et de valeurs pour une couche
#[derive(Debug, Clone)]
pub struct TypeMapper {
    fields: Vec<FieldDescriptor>,
    field_domains: HashMap<String, Domain>,
    subtype_field: Option<String>,
    subtypes: SubtypeTable,
    subtype_fields: BTreeSet<String>,
    options: MapperOptions,
}

impl TypeMapper {
    pub fn new(descriptor: &RemoteLayerDescriptor, options: MapperOptions) -> Self {
        let field_domains = descriptor
            .fields
            .iter()
            .filter_map(|f| f.domain.clone().map(|d| (f.name.clone(), d)))
            .collect();
        let subtype_fields = descriptor
            .subtype_fields()
            .into_iter()
            .map(str::to_string)
            .collect();

        Self {
            fields: descriptor.fields.clone(),
            field_domains,
            subtype_field: descriptor.subtype_field.clone(),
            subtypes: descriptor.subtypes.clone(),
            subtype_fields,
            options,
        }
    }

    /// Déclaration de colonne d'un champ (fonction pure)
    pub fn map_field_type(&self, field: &FieldDescriptor) -> Result<ColumnSpec, SchemaError> {
        let nominal =
            field_type_for(&field.remote_type).ok_or_else(|| SchemaError::UnmappedFieldType {
                field: field.name.clone(),
                remote_type: field.remote_type.clone(),
            })?;

        // Le libellé du domaine est stocké, pas le code
        let column_type = if self.is_coded(&field.name) {
            ColumnType::Text(TEXT_CAPACITY)
        } else {
            nominal
        };

        let nullable = column_type != ColumnType::Float64 || self.options.nullable_double;
        let precision = (column_type == ColumnType::Int64).then_some(64);

        Ok(ColumnSpec {
            name: field.column_name(),
            source: field.name.clone(),
            column_type,
            nullable,
            precision,
        })
    }

    /// Déclarations de toutes les colonnes importables
    pub fn columns(&self) -> Result<Vec<ColumnSpec>, SchemaError> {
        self.fields.iter().map(|f| self.map_field_type(f)).collect()
    }

    fn is_coded(&self, field: &str) -> bool {
        self.field_domains.contains_key(field) || self.subtype_fields.contains(field)
    }

    /// Code de sous-type d'une feature, si la couche en déclare
    pub fn subtype_code(&self, properties: &Map<String, Value>) -> Option<DomainCode> {
        let field = self.subtype_field.as_ref()?;
        properties.get(field).and_then(DomainCode::from_json)
    }

    /// Domaine applicable : celui du sous-type s'il existe, sinon celui du champ
    pub fn domain_for(&self, field: &str, subtype: Option<&DomainCode>) -> Option<&Domain> {
        subtype
            .and_then(|code| self.subtypes.get(code))
            .and_then(|domains| domains.get(field))
            .or_else(|| self.field_domains.get(field))
    }

    /// Remplace un code par son libellé ; un code inconnu est conservé tel quel
    pub fn substitute<'a>(
        &self,
        field: &str,
        raw: &'a Value,
        subtype: Option<&DomainCode>,
    ) -> Cow<'a, Value> {
        match self.domain_for(field, subtype).and_then(|d| d.label(raw)) {
            Some(label) => Cow::Owned(Value::String(label.to_string())),
            None => Cow::Borrowed(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_descriptor;
    use serde_json::json;

    fn descriptor() -> RemoteLayerDescriptor {
        parse_descriptor(
            "https://example.com/arcgis/rest/services/Water/MapServer/3",
            &json!({
                "type": "Feature Layer",
                "name": "Pipes",
                "geometryType": "esriGeometryPolyline",
                "subtypeField": "CODE",
                "subtypes": [
                    {"code": 5, "domains": {
                        "MATERIAL": {"type": "codedValue", "codedValues": [{"name": "Steel", "code": 1}]}
                    }},
                    {"code": 6, "domains": {
                        "STATUS": {"type": "codedValue", "codedValues": [{"name": "Retired", "code": 1}]}
                    }}
                ],
                "fields": [
                    {"name": "CODE", "type": "esriFieldTypeInteger"},
                    {"name": "MATERIAL", "type": "esriFieldTypeSmallInteger"},
                    {"name": "STATUS", "type": "esriFieldTypeInteger", "domain": {
                        "type": "codedValue",
                        "codedValues": [{"name": "Active", "code": 1}, {"name": "Closed", "code": 2}]}},
                    {"name": "LENGTH", "type": "esriFieldTypeDouble"},
                    {"name": "RATIO", "type": "esriFieldTypeSingle"},
                    {"name": "INSTALLED", "type": "esriFieldTypeDate"},
                    {"name": "Notes", "type": "esriFieldTypeString", "length": 50},
                    {"name": "PHOTO", "type": "esriFieldTypeBlob"}
                ]
            }),
        )
        .unwrap()
    }

    fn spec<'a>(columns: &'a [ColumnSpec], name: &str) -> &'a ColumnSpec {
        columns.iter().find(|c| c.name == name).unwrap()
    }

    #[test]
    fn test_column_types() {
        let mapper = TypeMapper::new(&descriptor(), MapperOptions::default());
        let columns = mapper.columns().unwrap();

        let code = spec(&columns, "code");
        assert_eq!(code.column_type, ColumnType::Int64);
        assert_eq!(code.precision, Some(64));
        assert!(code.nullable);

        assert_eq!(spec(&columns, "ratio").column_type, ColumnType::Float32);
        assert_eq!(
            spec(&columns, "installed").column_type,
            ColumnType::Text(TEXT_CAPACITY)
        );
        assert_eq!(
            spec(&columns, "notes").column_type,
            ColumnType::Text(TEXT_CAPACITY)
        );
        assert_eq!(spec(&columns, "photo").column_type, ColumnType::Binary);
    }

    #[test]
    fn test_coded_fields_are_text() {
        let mapper = TypeMapper::new(&descriptor(), MapperOptions::default());
        let columns = mapper.columns().unwrap();

        // Domaine de champ
        assert_eq!(
            spec(&columns, "status").column_type,
            ColumnType::Text(TEXT_CAPACITY)
        );
        // Domaine de sous-type uniquement
        assert_eq!(
            spec(&columns, "material").column_type,
            ColumnType::Text(TEXT_CAPACITY)
        );
    }

    #[test]
    fn test_double_nullability_is_configurable() {
        let strict = TypeMapper::new(&descriptor(), MapperOptions::default());
        assert!(!spec(&strict.columns().unwrap(), "length").nullable);

        let relaxed = TypeMapper::new(
            &descriptor(),
            MapperOptions {
                nullable_double: true,
            },
        );
        assert!(spec(&relaxed.columns().unwrap(), "length").nullable);
    }

    #[test]
    fn test_map_field_type_is_pure() {
        let descriptor = descriptor();
        let mapper = TypeMapper::new(&descriptor, MapperOptions::default());
        for field in &descriptor.fields {
            assert_eq!(
                mapper.map_field_type(field).unwrap(),
                mapper.map_field_type(field).unwrap()
            );
        }
    }

    #[test]
    fn test_geometry_types() {
        use DestinationGeometryKind::*;
        let cases = [
            ("esriGeometryPolygon", MultiPolygon),
            ("esriGeometryPoint", Point),
            ("esriGeometryMultipoint", MultiPoint),
            ("esriGeometryPolyline", LineString),
            ("esriGeometryLine", LineString),
            ("esriGeometryPath", LineString),
            ("esriGeometryEnvelope", Polygon),
            ("esriGeometryRing", Polygon),
            ("esriGeometryCircularArc", Curve),
            ("esriGeometryEllipticArc", CircularString),
        ];
        for (tag, expected) in cases {
            assert_eq!(map_geometry_type(Some(tag)).unwrap(), expected, "{tag}");
        }

        assert!(map_geometry_type(None).is_err());
        assert!(map_geometry_type(Some("esriGeometryBag")).is_err());
    }

    #[test]
    fn test_field_domain_substitution() {
        let mapper = TypeMapper::new(&descriptor(), MapperOptions::default());

        let active = json!(1);
        assert_eq!(
            mapper.substitute("STATUS", &active, None).into_owned(),
            json!("Active")
        );

        let unknown = json!(99);
        assert_eq!(
            mapper.substitute("STATUS", &unknown, None).into_owned(),
            json!(99)
        );

        let plain = json!("x");
        assert_eq!(mapper.substitute("Notes", &plain, None).into_owned(), json!("x"));
    }

    #[test]
    fn test_subtype_domain_takes_precedence() {
        let mapper = TypeMapper::new(&descriptor(), MapperOptions::default());
        let properties = json!({"CODE": 5, "MATERIAL": 1})
            .as_object()
            .cloned()
            .unwrap();

        let code = mapper.subtype_code(&properties);
        assert_eq!(code, Some(DomainCode::Int(5)));
        assert_eq!(
            mapper
                .substitute("MATERIAL", &json!(1), code.as_ref())
                .into_owned(),
            json!("Steel")
        );

        // Le sous-type 6 redéfinit le sens de STATUS = 1
        let retired = DomainCode::Int(6);
        assert_eq!(
            mapper
                .substitute("STATUS", &json!(1), Some(&retired))
                .into_owned(),
            json!("Retired")
        );
        // Sous-type 5 sans surcharge : domaine du champ
        assert_eq!(
            mapper
                .substitute("STATUS", &json!(2), code.as_ref())
                .into_owned(),
            json!("Closed")
        );
    }

    #[test]
    fn test_unknown_subtype_falls_back_to_field_domain() {
        let mapper = TypeMapper::new(&descriptor(), MapperOptions::default());
        let missing = DomainCode::Int(42);
        assert_eq!(
            mapper
                .substitute("STATUS", &json!(1), Some(&missing))
                .into_owned(),
            json!("Active")
        );
        assert_eq!(
            mapper
                .substitute("MATERIAL", &json!(1), Some(&missing))
                .into_owned(),
            json!(1)
        );
    }
}
