//! Destination des imports (PostgreSQL/PostGIS, mémoire)
//!
//! Un [`DestinationStore`] représente une connexion unique : les tables
//! temporaires et la transaction en cours lui sont attachées.

pub mod memory;
pub mod pool;
pub mod postgres;
pub mod reproject;
pub mod transaction;

pub use memory::{MemoryDatabase, MemoryStore};
pub use postgres::PgStore;
pub use reproject::Reprojector;
pub use transaction::LoadTransaction;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use geo::Geometry;
use serde::Serialize;
use serde_json::Value;

use arcgis::naming::quote_ident;
use arcgis::{ColumnSpec, ColumnType, DestinationGeometryKind};

use crate::error::{FieldWriteError, StructuralError, TransactionError};

/// Colonne clé ajoutée à chaque table créée
pub const FID_COLUMN: &str = "ogc_fid";

/// Schéma des tables temporaires de la connexion
pub const TEMP_SCHEMA: &str = "pg_temp";

/// Nom de table, éventuellement qualifié par un schéma
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Table temporaire de la connexion ; le nom ne passe jamais par le
    /// `search_path`
    pub fn temporary(name: &str) -> Self {
        Self::new(Some(TEMP_SCHEMA), name)
    }

    pub fn is_temporary(&self) -> bool {
        self.schema.as_deref() == Some(TEMP_SCHEMA)
    }

    /// Nom SQL échappé (`"schema"."table"`)
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Type d'une colonne existante de la destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColumnKind {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Text,
    Binary,
    Timestamp,
    Date,
    Boolean,
    /// Type non géré nativement, écrit sous forme texte avec conversion SQL
    Other(String),
}

impl From<ColumnType> for ColumnKind {
    fn from(value: ColumnType) -> Self {
        match value {
            ColumnType::Int64 => Self::BigInt,
            ColumnType::Int16 => Self::SmallInt,
            ColumnType::Float64 => Self::Double,
            ColumnType::Float32 => Self::Real,
            ColumnType::Text(_) => Self::Text,
            ColumnType::Binary => Self::Binary,
        }
    }
}

impl ColumnKind {
    /// Interprète un nom de type PostgreSQL, sans modificateur (`format_type`)
    pub fn from_pg(data_type: &str) -> Self {
        match data_type {
            "smallint" => Self::SmallInt,
            "integer" => Self::Integer,
            "bigint" => Self::BigInt,
            "real" => Self::Real,
            "double precision" => Self::Double,
            "text" | "character varying" | "character" => Self::Text,
            "bytea" => Self::Binary,
            "timestamp without time zone" | "timestamp with time zone" => Self::Timestamp,
            "date" => Self::Date,
            "boolean" => Self::Boolean,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_datetime(&self) -> bool {
        matches!(self, Self::Timestamp | Self::Date)
    }
}

/// Déclaration SQL d'une colonne créée par l'import
pub fn column_sql(spec: &ColumnSpec) -> String {
    let sql_type = match spec.column_type {
        ColumnType::Int64 => "BIGINT".to_string(),
        ColumnType::Int16 => "SMALLINT".to_string(),
        ColumnType::Float64 => "DOUBLE PRECISION".to_string(),
        ColumnType::Float32 => "REAL".to_string(),
        ColumnType::Text(capacity) => format!("VARCHAR({})", capacity),
        ColumnType::Binary => "BYTEA".to_string(),
    };
    let null = if spec.nullable { "" } else { " NOT NULL" };
    format!("{} {}{}", quote_ident(&spec.name), sql_type, null)
}

/// Colonne géométrique à créer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeometryColumnSpec {
    pub name: String,
    pub kind: DestinationGeometryKind,
    pub srid: u32,
}

/// Description d'une table à créer
#[derive(Debug, Clone, Serialize)]
pub struct TableSpec {
    pub table: TableRef,
    pub overwrite: bool,
    pub temporary: bool,
    pub owner: Option<String>,
    pub geometry: Option<GeometryColumnSpec>,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    /// Table réellement créée : une table temporaire vit dans `pg_temp`
    pub fn target(&self) -> TableRef {
        if self.temporary {
            TableRef::temporary(&self.table.name)
        } else {
            self.table.clone()
        }
    }
}

/// Colonne d'une table destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

/// Colonne géométrique d'une table destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeometryColumnInfo {
    pub name: String,
    /// `None` pour une colonne `geometry` générique
    pub kind: Option<DestinationGeometryKind>,
    pub srid: Option<u32>,
}

/// Table ouverte ou créée
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub table: TableRef,
    /// Clé primaire mono-colonne, exclue de `columns`
    pub fid: Option<String>,
    pub columns: Vec<DestinationColumn>,
    pub geometry: Option<GeometryColumnInfo>,
}

impl TableInfo {
    /// Structure d'une table telle que créée à partir de `spec`
    pub fn from_spec(spec: &TableSpec) -> Self {
        Self {
            table: spec.target(),
            fid: Some(FID_COLUMN.to_string()),
            columns: spec
                .columns
                .iter()
                .map(|c| DestinationColumn {
                    name: c.name.clone(),
                    kind: c.column_type.into(),
                    nullable: c.nullable,
                })
                .collect(),
            geometry: spec.geometry.as_ref().map(|g| GeometryColumnInfo {
                name: g.name.clone(),
                kind: Some(g.kind),
                srid: Some(g.srid),
            }),
        }
    }

    pub fn column(&self, name: &str) -> Option<&DestinationColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn srid(&self) -> Option<u32> {
        self.geometry.as_ref().and_then(|g| g.srid)
    }
}

/// Valeur typée prête à être écrite
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Binary(Vec<u8>),
    Bool(bool),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

/// Valeur « vraie » : ni null, ni chaîne vide, ni zéro, ni faux, ni
/// collection vide. Seules ces valeurs sont écrites.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Millisecondes depuis l'époque → horodatage sans fuseau
pub fn timestamp_from_millis(value: &Value) -> Option<NaiveDateTime> {
    let millis = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        _ => return None,
    };
    let secs = millis.div_euclid(1000);
    let nanos = (millis.rem_euclid(1000) * 1_000_000) as u32;
    DateTime::from_timestamp(secs, nanos).map(|dt| dt.naive_utc())
}

fn parse_timestamp_text(text: &str) -> Option<NaiveDateTime> {
    const FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FieldValue {
    /// Convertit une valeur JSON pour une colonne ; `Ok(None)` quand la
    /// valeur n'est pas à écrire
    pub fn from_json(
        column: &DestinationColumn,
        value: &Value,
    ) -> Result<Option<Self>, FieldWriteError> {
        if !is_truthy(value) {
            return Ok(None);
        }

        let mismatch = || FieldWriteError::Conversion {
            column: column.name.clone(),
            expected: format!("{:?}", column.kind),
            value: value.to_string(),
        };

        let converted = match &column.kind {
            ColumnKind::SmallInt => as_integer(value)
                .and_then(|i| i16::try_from(i).ok())
                .map(Self::Int16),
            ColumnKind::Integer => as_integer(value)
                .and_then(|i| i32::try_from(i).ok())
                .map(Self::Int32),
            ColumnKind::BigInt => as_integer(value).map(Self::Int64),
            ColumnKind::Real => as_float(value).map(|f| Self::Float32(f as f32)),
            ColumnKind::Double => as_float(value).map(Self::Float64),
            ColumnKind::Text | ColumnKind::Other(_) => Some(Self::Text(as_text(value))),
            ColumnKind::Binary => match value {
                Value::String(s) => Some(Self::Binary(s.as_bytes().to_vec())),
                Value::Array(items) => items
                    .iter()
                    .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(Self::Binary),
                _ => None,
            },
            ColumnKind::Timestamp => timestamp_from_millis(value)
                .or_else(|| value.as_str().and_then(parse_timestamp_text))
                .map(Self::Timestamp),
            ColumnKind::Date => timestamp_from_millis(value)
                .or_else(|| value.as_str().and_then(parse_timestamp_text))
                .map(|dt| Self::Date(dt.date())),
            ColumnKind::Boolean => match value {
                Value::Bool(b) => Some(Self::Bool(*b)),
                other => as_integer(other).map(|i| Self::Bool(i != 0)),
            },
        };

        converted.map(Some).ok_or_else(mismatch)
    }
}

/// Géométrie à écrire avec son SRID
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryValue {
    pub geometry: Geometry,
    pub srid: u32,
}

/// Enregistrement prêt pour la destination
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DestinationRecord {
    pub geometry: Option<GeometryValue>,
    pub values: Vec<(String, FieldValue)>,
}

/// Destination d'un import, liée à une connexion
#[async_trait]
pub trait DestinationStore: Send {
    async fn table_exists(&mut self, table: &TableRef) -> Result<bool, StructuralError>;

    /// Crée la table (la remplace si `overwrite`)
    async fn create_table(&mut self, spec: &TableSpec) -> Result<TableInfo, StructuralError>;

    /// Lit la structure d'une table existante
    async fn open_table(&mut self, table: &TableRef) -> Result<TableInfo, StructuralError>;

    async fn drop_table(&mut self, table: &TableRef) -> Result<(), StructuralError>;

    async fn begin(&mut self) -> Result<(), TransactionError>;

    async fn commit(&mut self) -> Result<(), TransactionError>;

    async fn rollback(&mut self) -> Result<(), TransactionError>;

    /// Écrit un enregistrement ; un échec n'interrompt pas la transaction
    async fn insert(
        &mut self,
        table: &TableInfo,
        record: &DestinationRecord,
    ) -> Result<(), FieldWriteError>;

    /// Identifiants (`ogc_fid`) des lignes de la table
    async fn row_ids(&mut self, table: &TableInfo) -> Result<Vec<i64>, StructuralError>;

    async fn delete_row(&mut self, table: &TableInfo, id: i64) -> Result<(), StructuralError>;

    /// Maximum d'une colonne, sous forme texte ; `None` si la table est vide
    async fn max_value(
        &mut self,
        table: &TableInfo,
        column: &str,
    ) -> Result<Option<String>, StructuralError>;

    async fn count_rows(&mut self, table: &TableInfo) -> Result<u64, StructuralError>;
}

/// Source de connexions : chaque import obtient sa propre connexion
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn DestinationStore>, StructuralError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(kind: ColumnKind) -> DestinationColumn {
        DestinationColumn {
            name: "c".to_string(),
            kind,
            nullable: true,
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!("0")));
        assert!(is_truthy(&json!(-1)));
        assert!(is_truthy(&json!(true)));
    }

    #[test]
    fn test_falsy_values_are_skipped() {
        let col = column(ColumnKind::BigInt);
        assert_eq!(FieldValue::from_json(&col, &json!(0)).unwrap(), None);
        assert_eq!(
            FieldValue::from_json(&col, &json!(42)).unwrap(),
            Some(FieldValue::Int64(42))
        );
    }

    #[test]
    fn test_timestamp_from_millis() {
        let col = column(ColumnKind::Timestamp);
        let value = FieldValue::from_json(&col, &json!(1_704_067_200_000i64)).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(value, Some(FieldValue::Timestamp(expected)));

        let date = column(ColumnKind::Date);
        assert_eq!(
            FieldValue::from_json(&date, &json!(1_704_067_200_000i64)).unwrap(),
            Some(FieldValue::Date(expected.date()))
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            FieldValue::from_json(&column(ColumnKind::SmallInt), &json!("12")).unwrap(),
            Some(FieldValue::Int16(12))
        );
        assert!(FieldValue::from_json(&column(ColumnKind::SmallInt), &json!(100_000)).is_err());
        assert_eq!(
            FieldValue::from_json(&column(ColumnKind::Text), &json!(3.5)).unwrap(),
            Some(FieldValue::Text("3.5".to_string()))
        );
        assert_eq!(
            FieldValue::from_json(&column(ColumnKind::Double), &json!(2)).unwrap(),
            Some(FieldValue::Float64(2.0))
        );
        assert!(FieldValue::from_json(&column(ColumnKind::Double), &json!("abc")).is_err());
    }

    #[test]
    fn test_column_sql() {
        let spec = ColumnSpec {
            name: "length".to_string(),
            source: "LENGTH".to_string(),
            column_type: ColumnType::Float64,
            nullable: false,
            precision: None,
        };
        assert_eq!(column_sql(&spec), "\"length\" DOUBLE PRECISION NOT NULL");
    }

    #[test]
    fn test_table_ref() {
        let table = TableRef::new(Some("public"), "pipes");
        assert_eq!(table.qualified(), "\"public\".\"pipes\"");
        assert_eq!(table.to_string(), "public.pipes");
    }

    #[test]
    fn test_column_kind_from_pg() {
        assert_eq!(ColumnKind::from_pg("character varying"), ColumnKind::Text);
        assert_eq!(
            ColumnKind::from_pg("timestamp without time zone"),
            ColumnKind::Timestamp
        );
        assert_eq!(
            ColumnKind::from_pg("numeric"),
            ColumnKind::Other("numeric".to_string())
        );
    }
}
