//! Destination en mémoire
//!
//! Reproduit le comportement de PostgreSQL utile aux imports : tables
//! temporaires propres à la connexion (schéma `pg_temp`), transaction avec
//! retour arrière des seules tables modifiées, séquences non annulées,
//! contraintes `NOT NULL` et type de la colonne géométrique.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use arcgis::geometry::kind_name;

use super::{
    DestinationRecord, DestinationStore, FieldValue, GeometryValue, StoreProvider, TableInfo,
    TableRef, TableSpec,
};
use crate::error::{FieldWriteError, StructuralError, TransactionError};

/// Ligne stockée
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRow {
    pub id: i64,
    pub geometry: Option<GeometryValue>,
    pub values: HashMap<String, FieldValue>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    info: TableInfo,
    rows: Vec<MemoryRow>,
    next_id: i64,
}

impl MemoryTable {
    fn new(info: TableInfo) -> Self {
        Self {
            info,
            rows: Vec::new(),
            next_id: 1,
        }
    }
}

type Tables = HashMap<TableRef, MemoryTable>;

/// Base partagée entre les connexions
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nouvelle connexion sur la base
    pub fn connect(&self) -> MemoryStore {
        MemoryStore {
            database: self.clone(),
            temporary: Tables::new(),
            saved: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // Un test ayant paniqué ne doit pas bloquer les autres
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lignes validées d'une table
    pub fn rows(&self, table: &TableRef) -> Vec<MemoryRow> {
        self.lock()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &TableRef) -> bool {
        self.lock().contains_key(table)
    }

    /// Structure d'une table validée
    pub fn table_info(&self, table: &TableRef) -> Option<TableInfo> {
        self.lock().get(table).map(|t| t.info.clone())
    }

    /// Crée une table directement (préparation de tests)
    pub fn insert_table(&self, info: TableInfo) {
        self.lock()
            .insert(info.table.clone(), MemoryTable::new(info));
    }

    /// Ajoute une ligne directement (préparation de tests)
    pub fn insert_row(&self, table: &TableRef, values: HashMap<String, FieldValue>) {
        if let Some(t) = self.lock().get_mut(table) {
            let id = t.next_id;
            t.next_id += 1;
            t.rows.push(MemoryRow {
                id,
                geometry: None,
                values,
            });
        }
    }
}

/// Lignes des tables touchées par la transaction, avant leur première
/// modification
type SavedRows = HashMap<TableRef, Vec<MemoryRow>>;

/// Connexion à une [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemoryStore {
    database: MemoryDatabase,
    temporary: Tables,
    saved: Option<SavedRows>,
}

impl MemoryStore {
    /// Applique `f` à la table, qu'elle soit temporaire ou partagée
    fn with_table<T>(
        &mut self,
        table: &TableRef,
        f: impl FnOnce(&mut MemoryTable) -> T,
    ) -> Option<T> {
        if table.is_temporary() {
            let t = self.temporary.get_mut(table)?;
            save_rows(&mut self.saved, table, t);
            return Some(f(t));
        }
        let mut tables = self.database.lock();
        let t = tables.get_mut(table)?;
        save_rows(&mut self.saved, table, t);
        Some(f(t))
    }
}

fn save_rows(saved: &mut Option<SavedRows>, table: &TableRef, t: &MemoryTable) {
    if let Some(saved) = saved {
        saved
            .entry(table.clone())
            .or_insert_with(|| t.rows.clone());
    }
}

fn check_record(table: &TableInfo, record: &DestinationRecord) -> Result<(), FieldWriteError> {
    for (name, _) in &record.values {
        if table.column(name).is_none() {
            return Err(FieldWriteError::Rejected(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                name, table.table
            )));
        }
    }

    for column in table.columns.iter().filter(|c| !c.nullable) {
        if !record.values.iter().any(|(name, _)| *name == column.name) {
            return Err(FieldWriteError::Rejected(format!(
                "null value in column \"{}\" violates not-null constraint",
                column.name
            )));
        }
    }

    match (&table.geometry, &record.geometry) {
        (None, Some(_)) => Err(FieldWriteError::Rejected(format!(
            "table {} has no geometry column",
            table.table
        ))),
        (Some(column), Some(value)) => {
            if let Some(kind) = column.kind {
                let found = kind_name(&value.geometry);
                if found != kind.postgis_name() {
                    return Err(FieldWriteError::Rejected(format!(
                        "Geometry type ({}) does not match column type ({})",
                        found, kind
                    )));
                }
            }
            match column.srid {
                Some(srid) if srid != value.srid => Err(FieldWriteError::Rejected(format!(
                    "Geometry SRID ({}) does not match column SRID ({})",
                    value.srid, srid
                ))),
                _ => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn table_exists(&mut self, table: &TableRef) -> Result<bool, StructuralError> {
        if table.is_temporary() {
            return Ok(self.temporary.contains_key(table));
        }
        Ok(self.database.has_table(table))
    }

    async fn create_table(&mut self, spec: &TableSpec) -> Result<TableInfo, StructuralError> {
        let target = spec.target();
        if self.table_exists(&target).await? {
            if !spec.overwrite {
                return Err(StructuralError::TableExists(target.to_string()));
            }
            self.drop_table(&target).await?;
        }

        let info = TableInfo::from_spec(spec);
        let table = MemoryTable::new(info.clone());
        if spec.temporary {
            self.temporary.insert(info.table.clone(), table);
        } else {
            self.database.lock().insert(info.table.clone(), table);
        }
        Ok(info)
    }

    async fn open_table(&mut self, table: &TableRef) -> Result<TableInfo, StructuralError> {
        self.with_table(table, |t| t.info.clone())
            .ok_or_else(|| StructuralError::TableNotFound(table.to_string()))
    }

    async fn drop_table(&mut self, table: &TableRef) -> Result<(), StructuralError> {
        if table.is_temporary() {
            self.temporary.remove(table);
        } else {
            self.database.lock().remove(table);
        }
        if let Some(saved) = &mut self.saved {
            saved.remove(table);
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), TransactionError> {
        if self.saved.is_some() {
            return Err(TransactionError::AlreadyOpen);
        }
        self.saved = Some(SavedRows::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransactionError> {
        self.saved
            .take()
            .map(|_| ())
            .ok_or(TransactionError::NotOpen)
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        let saved = self.saved.take().ok_or(TransactionError::NotOpen)?;
        for (table, rows) in saved {
            // La séquence `next_id` n'est pas annulée
            self.with_table(&table, |t| t.rows = rows);
        }
        Ok(())
    }

    async fn insert(
        &mut self,
        table: &TableInfo,
        record: &DestinationRecord,
    ) -> Result<(), FieldWriteError> {
        check_record(table, record)?;

        let stored = self.with_table(&table.table, |t| {
            let id = t.next_id;
            t.next_id += 1;
            t.rows.push(MemoryRow {
                id,
                geometry: record.geometry.clone(),
                values: record.values.iter().cloned().collect(),
            });
        });

        stored.ok_or_else(|| {
            FieldWriteError::Rejected(format!("relation \"{}\" does not exist", table.table))
        })
    }

    async fn row_ids(&mut self, table: &TableInfo) -> Result<Vec<i64>, StructuralError> {
        self.with_table(&table.table, |t| t.rows.iter().map(|r| r.id).collect())
            .ok_or_else(|| StructuralError::TableNotFound(table.table.to_string()))
    }

    async fn delete_row(&mut self, table: &TableInfo, id: i64) -> Result<(), StructuralError> {
        self.with_table(&table.table, |t| t.rows.retain(|r| r.id != id))
            .ok_or_else(|| StructuralError::TableNotFound(table.table.to_string()))
    }

    async fn max_value(
        &mut self,
        table: &TableInfo,
        column: &str,
    ) -> Result<Option<String>, StructuralError> {
        if table.column(column).is_none() {
            return Err(StructuralError::ColumnNotFound {
                table: table.table.to_string(),
                column: column.to_string(),
            });
        }

        let values = self
            .with_table(&table.table, |t| {
                t.rows
                    .iter()
                    .filter_map(|r| r.values.get(column).cloned())
                    .collect::<Vec<_>>()
            })
            .ok_or_else(|| StructuralError::TableNotFound(table.table.to_string()))?;

        Ok(values
            .into_iter()
            .reduce(|a, b| if compare(&b, &a).is_gt() { b } else { a })
            .map(|v| render(&v)))
    }

    async fn count_rows(&mut self, table: &TableInfo) -> Result<u64, StructuralError> {
        self.with_table(&table.table, |t| t.rows.len() as u64)
            .ok_or_else(|| StructuralError::TableNotFound(table.table.to_string()))
    }
}

fn compare(a: &FieldValue, b: &FieldValue) -> std::cmp::Ordering {
    use FieldValue::*;
    match (a, b) {
        (Int16(a), Int16(b)) => a.cmp(b),
        (Int32(a), Int32(b)) => a.cmp(b),
        (Int64(a), Int64(b)) => a.cmp(b),
        (Float32(a), Float32(b)) => a.total_cmp(b),
        (Float64(a), Float64(b)) => a.total_cmp(b),
        (Timestamp(a), Timestamp(b)) => a.cmp(b),
        (Date(a), Date(b)) => a.cmp(b),
        (Bool(a), Bool(b)) => a.cmp(b),
        _ => render(a).cmp(&render(b)),
    }
}

/// Rendu texte équivalent à `max(col)::text` côté PostgreSQL
fn render(value: &FieldValue) -> String {
    match value {
        FieldValue::Int16(v) => v.to_string(),
        FieldValue::Int32(v) => v.to_string(),
        FieldValue::Int64(v) => v.to_string(),
        FieldValue::Float32(v) => v.to_string(),
        FieldValue::Float64(v) => v.to_string(),
        FieldValue::Text(v) => v.clone(),
        FieldValue::Binary(v) => String::from_utf8_lossy(v).into_owned(),
        FieldValue::Bool(v) => v.to_string(),
        FieldValue::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S").to_string(),
        FieldValue::Date(v) => v.format("%Y-%m-%d").to_string(),
    }
}

#[async_trait]
impl StoreProvider for MemoryDatabase {
    async fn acquire(&self) -> Result<Box<dyn DestinationStore>, StructuralError> {
        Ok(Box::new(self.connect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ColumnKind, GeometryColumnSpec};
    use arcgis::{ColumnSpec, ColumnType, DestinationGeometryKind};
    use geo::{Geometry, Point};

    fn spec(temporary: bool) -> TableSpec {
        TableSpec {
            table: TableRef::new(Some("public"), "pipes"),
            overwrite: false,
            temporary,
            owner: None,
            geometry: Some(GeometryColumnSpec {
                name: "geom".to_string(),
                kind: DestinationGeometryKind::Point,
                srid: 4326,
            }),
            columns: vec![
                ColumnSpec {
                    name: "name".to_string(),
                    source: "NAME".to_string(),
                    column_type: ColumnType::Text(10),
                    nullable: true,
                    precision: None,
                },
                ColumnSpec {
                    name: "length".to_string(),
                    source: "LENGTH".to_string(),
                    column_type: ColumnType::Float64,
                    nullable: false,
                    precision: None,
                },
            ],
        }
    }

    fn record(length: Option<f64>) -> DestinationRecord {
        let mut values = vec![("name".to_string(), FieldValue::Text("a".to_string()))];
        if let Some(l) = length {
            values.push(("length".to_string(), FieldValue::Float64(l)));
        }
        DestinationRecord {
            geometry: Some(GeometryValue {
                geometry: Geometry::Point(Point::new(1.0, 2.0)),
                srid: 4326,
            }),
            values,
        }
    }

    #[tokio::test]
    async fn test_create_insert_commit() {
        let db = MemoryDatabase::new();
        let mut store = db.connect();
        let info = store.create_table(&spec(false)).await.unwrap();
        assert_eq!(info.column("length").unwrap().kind, ColumnKind::Double);

        store.begin().await.unwrap();
        store.insert(&info, &record(Some(3.0))).await.unwrap();
        // Colonne NOT NULL absente
        assert!(store.insert(&info, &record(None)).await.is_err());
        store.commit().await.unwrap();

        let rows = db.rows(&info.table);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1);
        assert!(store.create_table(&spec(false)).await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_restores_rows() {
        let db = MemoryDatabase::new();
        let mut store = db.connect();
        let info = store.create_table(&spec(false)).await.unwrap();

        store.begin().await.unwrap();
        store.insert(&info, &record(Some(1.0))).await.unwrap();
        store.rollback().await.unwrap();

        assert!(db.rows(&info.table).is_empty());
        assert!(matches!(
            store.commit().await,
            Err(TransactionError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_temporary_tables_are_connection_scoped() {
        let db = MemoryDatabase::new();
        let mut store = db.connect();
        let info = store.create_table(&spec(true)).await.unwrap();

        assert_eq!(info.table, TableRef::temporary("pipes"));
        assert!(store.table_exists(&info.table).await.unwrap());
        assert!(!store.table_exists(&TableRef::new(Some("public"), "pipes")).await.unwrap());
        assert!(!db.connect().table_exists(&info.table).await.unwrap());
    }

    #[tokio::test]
    async fn test_temporary_overwrite_keeps_permanent_table() {
        let db = MemoryDatabase::new();
        let mut store = db.connect();
        let permanent = store.create_table(&spec(false)).await.unwrap();
        store.insert(&permanent, &record(Some(1.0))).await.unwrap();

        let mut temp = spec(true);
        temp.overwrite = true;
        let info = store.create_table(&temp).await.unwrap();
        store.insert(&info, &record(Some(2.0))).await.unwrap();

        assert_eq!(db.rows(&permanent.table).len(), 1);
        assert_eq!(store.count_rows(&info).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rollback_only_restores_touched_table() {
        let db = MemoryDatabase::new();
        let mut first = db.connect();
        let mut second = db.connect();
        let pipes = first.create_table(&spec(false)).await.unwrap();
        let mut other = spec(false);
        other.table = TableRef::new(Some("public"), "valves");
        let valves = second.create_table(&other).await.unwrap();

        first.begin().await.unwrap();
        first.insert(&pipes, &record(Some(1.0))).await.unwrap();

        // Une autre connexion valide sur une autre table pendant ce temps
        second.begin().await.unwrap();
        second.insert(&valves, &record(Some(2.0))).await.unwrap();
        second.commit().await.unwrap();

        first.rollback().await.unwrap();

        assert!(db.rows(&pipes.table).is_empty());
        assert_eq!(db.rows(&valves.table).len(), 1);

        // Comme une séquence PostgreSQL, l'identifiant consommé est perdu
        first.insert(&pipes, &record(Some(3.0))).await.unwrap();
        assert_eq!(db.rows(&pipes.table)[0].id, 2);
    }

    #[tokio::test]
    async fn test_geometry_type_is_enforced() {
        let db = MemoryDatabase::new();
        let mut store = db.connect();
        let info = store.create_table(&spec(false)).await.unwrap();

        let mut bad = record(Some(1.0));
        bad.geometry = Some(GeometryValue {
            geometry: Geometry::MultiPoint(vec![Point::new(1.0, 2.0)].into()),
            srid: 4326,
        });
        assert!(store.insert(&info, &bad).await.is_err());
    }

    #[tokio::test]
    async fn test_max_value_and_delete() {
        let db = MemoryDatabase::new();
        let mut store = db.connect();
        let info = store.create_table(&spec(false)).await.unwrap();

        assert_eq!(store.max_value(&info, "length").await.unwrap(), None);
        for l in [2.5, 7.0, 3.0] {
            store.insert(&info, &record(Some(l))).await.unwrap();
        }
        assert_eq!(
            store.max_value(&info, "length").await.unwrap(),
            Some("7".to_string())
        );
        assert!(store.max_value(&info, "missing").await.is_err());

        for id in store.row_ids(&info).await.unwrap() {
            store.delete_row(&info, id).await.unwrap();
        }
        assert_eq!(store.count_rows(&info).await.unwrap(), 0);

        // La séquence n'est pas réinitialisée
        store.insert(&info, &record(Some(1.0))).await.unwrap();
        assert_eq!(db.rows(&info.table)[0].id, 4);
    }
}
