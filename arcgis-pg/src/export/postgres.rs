//! Destination PostgreSQL/PostGIS
//!
//! Une instance de [`PgStore`] détient une connexion du pool pendant tout
//! l'import. Les géométries sont écrites en EWKT (`SRID=...;WKT`) et chaque
//! insertion est isolée par un point de sauvegarde pour qu'un rejet ne
//! compromette pas la transaction.

use async_trait::async_trait;
use deadpool_postgres::Object;
use geozero::wkt::WktWriter;
use geozero::GeozeroGeometry;
use tokio_postgres::types::ToSql;
use tracing::{debug, info};

use arcgis::naming::quote_ident;
use arcgis::DestinationGeometryKind;

use super::{
    column_sql, ColumnKind, DestinationColumn, DestinationRecord, DestinationStore, FieldValue,
    GeometryColumnInfo, GeometryValue, TableInfo, TableRef, TableSpec, FID_COLUMN,
};
use crate::error::{FieldWriteError, StructuralError, TransactionError};

const SAVEPOINT: &str = "arcgis_feature";

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Connexion PostgreSQL utilisée comme destination
pub struct PgStore {
    client: Object,
    in_transaction: bool,
}

impl PgStore {
    pub fn new(client: Object) -> Self {
        Self {
            client,
            in_transaction: false,
        }
    }

    async fn execute(&self, operation: &str, sql: &str) -> Result<(), StructuralError> {
        debug!(sql = %sql, "Executing");
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| StructuralError::database(operation, pg_message(&e)))
    }

    async fn transaction_command(
        &self,
        operation: &'static str,
        sql: &str,
    ) -> Result<(), TransactionError> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| TransactionError::Database {
                operation,
                message: pg_message(&e),
            })
    }

    async fn primary_key(&self, table: &TableRef) -> Result<Option<String>, StructuralError> {
        let rows = self
            .client
            .query(
                r#"
                SELECT a.attname::text
                FROM pg_index i
                JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                WHERE i.indrelid = to_regclass($1::text) AND i.indisprimary
                "#,
                &[&table.qualified()],
            )
            .await
            .map_err(|e| StructuralError::database("read primary key", pg_message(&e)))?;

        Ok(match rows.as_slice() {
            [row] => Some(row.get(0)),
            _ => None,
        })
    }
}

/// Message d'erreur PostgreSQL sans le préfixe générique du driver
fn pg_message(error: &tokio_postgres::Error) -> String {
    match error.as_db_error() {
        Some(db) => db.message().to_string(),
        None => error.to_string(),
    }
}

/// Nom SQL d'une table ; les tables temporaires ne sont jamais qualifiées
/// Requête de création de table
pub fn create_table_sql(spec: &TableSpec) -> String {
    let mut columns = vec![format!("{} SERIAL PRIMARY KEY", quote_ident(FID_COLUMN))];
    columns.extend(spec.columns.iter().map(column_sql));
    if let Some(geometry) = &spec.geometry {
        columns.push(format!(
            "{} geometry({}, {})",
            quote_ident(&geometry.name),
            geometry.kind.postgis_name(),
            geometry.srid
        ));
    }

    format!(
        "CREATE {}TABLE {} (\n    {}\n)",
        if spec.temporary { "TEMPORARY " } else { "" },
        spec.target().qualified(),
        columns.join(",\n    ")
    )
}

/// Type de base sans modificateur : `character varying(10)` → `character varying`
fn base_type(formatted: &str) -> String {
    let mut depth = 0usize;
    let stripped: String = formatted
        .chars()
        .filter(|c| match c {
            '(' => {
                depth += 1;
                false
            }
            ')' => {
                depth = depth.saturating_sub(1);
                false
            }
            _ => depth == 0,
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Type géométrique déclaré par `postgis_typmod_type` (`MultiPolygonZ`...)
fn geometry_kind(typmod_type: &str) -> Option<DestinationGeometryKind> {
    DestinationGeometryKind::from_postgis_name(typmod_type.trim_end_matches(['Z', 'M']))
}

/// Requête et paramètres d'insertion d'un enregistrement
pub fn insert_sql(
    table: &TableInfo,
    record: &DestinationRecord,
) -> Result<(String, Vec<SqlParam>), FieldWriteError> {
    let mut columns = Vec::with_capacity(record.values.len() + 1);
    let mut placeholders = Vec::with_capacity(record.values.len() + 1);
    let mut params: Vec<SqlParam> = Vec::with_capacity(record.values.len() + 1);

    for (name, value) in &record.values {
        let column = table
            .column(name)
            .ok_or_else(|| FieldWriteError::Rejected(format!("unknown column {}", name)))?;
        params.push(to_param(value));
        columns.push(quote_ident(name));
        placeholders.push(placeholder(params.len(), column));
    }

    if let (Some(column), Some(geometry)) = (&table.geometry, &record.geometry) {
        params.push(Box::new(to_ewkt(geometry)?));
        columns.push(quote_ident(&column.name));
        placeholders.push(format!("ST_GeomFromEWKT(${})", params.len()));
    }

    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table.table.qualified())
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.table.qualified(),
            columns.join(", "),
            placeholders.join(", ")
        )
    };
    Ok((sql, params))
}

fn placeholder(index: usize, column: &DestinationColumn) -> String {
    match &column.kind {
        ColumnKind::Timestamp => format!("${}::timestamp", index),
        ColumnKind::Other(pg_type) => format!("${}::text::{}", index, pg_type),
        _ => format!("${}", index),
    }
}

fn to_param(value: &FieldValue) -> SqlParam {
    match value.clone() {
        FieldValue::Int16(v) => Box::new(v),
        FieldValue::Int32(v) => Box::new(v),
        FieldValue::Int64(v) => Box::new(v),
        FieldValue::Float32(v) => Box::new(v),
        FieldValue::Float64(v) => Box::new(v),
        FieldValue::Text(v) => Box::new(v),
        FieldValue::Binary(v) => Box::new(v),
        FieldValue::Bool(v) => Box::new(v),
        FieldValue::Timestamp(v) => Box::new(v),
        FieldValue::Date(v) => Box::new(v),
    }
}

/// Géométrie au format EWKT
pub fn to_ewkt(value: &GeometryValue) -> Result<String, FieldWriteError> {
    let mut wkt_buf: Vec<u8> = Vec::new();
    let mut writer = WktWriter::new(&mut wkt_buf);
    value
        .geometry
        .process_geom(&mut writer)
        .map_err(|e| FieldWriteError::Rejected(format!("WKT encoding failed: {}", e)))?;
    let wkt = String::from_utf8_lossy(&wkt_buf);
    Ok(format!("SRID={};{}", value.srid, wkt))
}

#[async_trait]
impl DestinationStore for PgStore {
    async fn table_exists(&mut self, table: &TableRef) -> Result<bool, StructuralError> {
        let row = self
            .client
            .query_one(
                "SELECT to_regclass($1::text) IS NOT NULL",
                &[&table.qualified()],
            )
            .await
            .map_err(|e| StructuralError::database("check table", pg_message(&e)))?;
        Ok(row.get(0))
    }

    async fn create_table(&mut self, spec: &TableSpec) -> Result<TableInfo, StructuralError> {
        let table = spec.target();
        if self.table_exists(&table).await? {
            if !spec.overwrite {
                return Err(StructuralError::TableExists(table.to_string()));
            }
            self.drop_table(&table).await?;
        }

        self.execute("create table", &create_table_sql(spec)).await?;

        if let Some(owner) = &spec.owner {
            self.execute(
                "set table owner",
                &format!(
                    "ALTER TABLE {} OWNER TO {}",
                    table.qualified(),
                    quote_ident(owner)
                ),
            )
            .await?;
        }

        info!(table = %table, temporary = spec.temporary, "Created table");
        Ok(TableInfo::from_spec(spec))
    }

    async fn open_table(&mut self, table: &TableRef) -> Result<TableInfo, StructuralError> {
        let rows = self
            .client
            .query(
                r#"
                SELECT a.attname::text,
                       format_type(a.atttypid, a.atttypmod),
                       NOT a.attnotnull,
                       t.typname::text = 'geometry',
                       CASE WHEN t.typname = 'geometry' AND a.atttypmod > 0
                            THEN postgis_typmod_type(a.atttypmod) END,
                       CASE WHEN t.typname = 'geometry' AND a.atttypmod > 0
                            THEN postgis_typmod_srid(a.atttypmod) END
                FROM pg_attribute a
                JOIN pg_type t ON t.oid = a.atttypid
                WHERE a.attrelid = to_regclass($1::text)
                  AND a.attnum > 0
                  AND NOT a.attisdropped
                ORDER BY a.attnum
                "#,
                &[&table.qualified()],
            )
            .await
            .map_err(|e| StructuralError::database("read table structure", pg_message(&e)))?;

        if rows.is_empty() {
            return Err(StructuralError::TableNotFound(table.to_string()));
        }

        let fid = self.primary_key(table).await?;
        let mut columns = Vec::new();
        let mut geometry = None;

        for row in &rows {
            let name: String = row.get(0);
            let formatted: String = row.get(1);
            let nullable: bool = row.get(2);
            let is_geometry: bool = row.get(3);

            if Some(&name) == fid.as_ref() {
                continue;
            }
            if is_geometry {
                if geometry.is_none() {
                    let typmod_type: Option<String> = row.get(4);
                    let srid: Option<i32> = row.get(5);
                    geometry = Some(GeometryColumnInfo {
                        name,
                        kind: typmod_type.as_deref().and_then(geometry_kind),
                        srid: srid.filter(|s| *s > 0).map(|s| s as u32),
                    });
                }
                continue;
            }

            columns.push(DestinationColumn {
                name,
                kind: ColumnKind::from_pg(&base_type(&formatted)),
                nullable,
            });
        }

        debug!(
            table = %table,
            columns = columns.len(),
            geometry = ?geometry,
            "Opened table"
        );

        Ok(TableInfo {
            table: table.clone(),
            fid,
            columns,
            geometry,
        })
    }

    async fn drop_table(&mut self, table: &TableRef) -> Result<(), StructuralError> {
        if table.schema.is_none() {
            return Err(StructuralError::InvalidConfig(format!(
                "refusing to drop unqualified table {}",
                table
            )));
        }
        self.execute(
            "drop table",
            &format!("DROP TABLE IF EXISTS {} CASCADE", table.qualified()),
        )
        .await?;
        info!(table = %table, "Dropped table");
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), TransactionError> {
        if self.in_transaction {
            return Err(TransactionError::AlreadyOpen);
        }
        self.transaction_command("begin", "BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransactionError> {
        if !self.in_transaction {
            return Err(TransactionError::NotOpen);
        }
        self.in_transaction = false;
        self.transaction_command("commit", "COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        if !self.in_transaction {
            return Err(TransactionError::NotOpen);
        }
        self.in_transaction = false;
        self.transaction_command("rollback", "ROLLBACK").await
    }

    async fn insert(
        &mut self,
        table: &TableInfo,
        record: &DestinationRecord,
    ) -> Result<(), FieldWriteError> {
        let (sql, params) = insert_sql(table, record)?;
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rejected = |e: tokio_postgres::Error| FieldWriteError::Rejected(pg_message(&e));

        if !self.in_transaction {
            self.client.execute(&sql, &refs).await.map_err(rejected)?;
            return Ok(());
        }

        self.client
            .batch_execute(&format!("SAVEPOINT {}", SAVEPOINT))
            .await
            .map_err(rejected)?;

        match self.client.execute(&sql, &refs).await {
            Ok(_) => {
                self.client
                    .batch_execute(&format!("RELEASE SAVEPOINT {}", SAVEPOINT))
                    .await
                    .map_err(rejected)?;
                Ok(())
            }
            Err(e) => {
                self.client
                    .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT))
                    .await
                    .map_err(rejected)?;
                Err(rejected(e))
            }
        }
    }

    async fn row_ids(&mut self, table: &TableInfo) -> Result<Vec<i64>, StructuralError> {
        let fid = table.fid.as_ref().ok_or_else(|| StructuralError::ColumnNotFound {
            table: table.table.to_string(),
            column: "primary key".to_string(),
        })?;

        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {fid}::bigint FROM {} ORDER BY {fid}",
                    table.table.qualified(),
                    fid = quote_ident(fid)
                ),
                &[],
            )
            .await
            .map_err(|e| StructuralError::database("list rows", pg_message(&e)))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn delete_row(&mut self, table: &TableInfo, id: i64) -> Result<(), StructuralError> {
        let fid = table.fid.as_ref().ok_or_else(|| StructuralError::ColumnNotFound {
            table: table.table.to_string(),
            column: "primary key".to_string(),
        })?;

        self.client
            .execute(
                &format!(
                    "DELETE FROM {} WHERE {} = $1::bigint",
                    table.table.qualified(),
                    quote_ident(fid)
                ),
                &[&id],
            )
            .await
            .map_err(|e| StructuralError::database("delete row", pg_message(&e)))?;
        Ok(())
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

        let row = self
            .client
            .query_one(
                &format!(
                    "SELECT max({})::text FROM {}",
                    quote_ident(column),
                    table.table.qualified()
                ),
                &[],
            )
            .await
            .map_err(|e| StructuralError::database("read max value", pg_message(&e)))?;
        Ok(row.get(0))
    }

    async fn count_rows(&mut self, table: &TableInfo) -> Result<u64, StructuralError> {
        let row = self
            .client
            .query_one(
                &format!("SELECT count(*) FROM {}", table.table.qualified()),
                &[],
            )
            .await
            .map_err(|e| StructuralError::database("count rows", pg_message(&e)))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::GeometryColumnSpec;
    use arcgis::{ColumnSpec, ColumnType};
    use geo::{Geometry, LineString, MultiLineString};

    fn spec(temporary: bool) -> TableSpec {
        TableSpec {
            table: TableRef::new(Some("public"), "pipes"),
            overwrite: true,
            temporary,
            owner: None,
            geometry: Some(GeometryColumnSpec {
                name: "geom".to_string(),
                kind: DestinationGeometryKind::MultiLineString,
                srid: 2154,
            }),
            columns: vec![ColumnSpec {
                name: "status".to_string(),
                source: "STATUS".to_string(),
                column_type: ColumnType::Text(10_485_760),
                nullable: true,
                precision: None,
            }],
        }
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql(&spec(false));
        assert!(sql.starts_with("CREATE TABLE \"public\".\"pipes\""));
        assert!(sql.contains("\"ogc_fid\" SERIAL PRIMARY KEY"));
        assert!(sql.contains("\"status\" VARCHAR(10485760)"));
        assert!(sql.contains("\"geom\" geometry(MULTILINESTRING, 2154)"));

        let temp = create_table_sql(&spec(true));
        assert!(temp.starts_with("CREATE TEMPORARY TABLE \"pg_temp\".\"pipes\""));
        assert_eq!(TableInfo::from_spec(&spec(true)).table, TableRef::temporary("pipes"));
    }

    #[test]
    fn test_insert_sql() {
        let mut info = TableInfo::from_spec(&spec(false));
        info.columns.push(DestinationColumn {
            name: "updated".to_string(),
            kind: ColumnKind::Timestamp,
            nullable: true,
        });
        info.columns.push(DestinationColumn {
            name: "amount".to_string(),
            kind: ColumnKind::Other("numeric".to_string()),
            nullable: true,
        });

        let record = DestinationRecord {
            geometry: Some(GeometryValue {
                geometry: Geometry::MultiLineString(MultiLineString::new(vec![
                    LineString::from(vec![(0.0, 0.0), (1.0, 1.0)]),
                ])),
                srid: 2154,
            }),
            values: vec![
                ("status".to_string(), FieldValue::Text("Active".to_string())),
                (
                    "updated".to_string(),
                    FieldValue::Timestamp(
                        chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
                            .unwrap()
                            .and_hms_opt(0, 0, 0)
                            .unwrap(),
                    ),
                ),
                ("amount".to_string(), FieldValue::Text("12.5".to_string())),
            ],
        };

        let (sql, params) = insert_sql(&info, &record).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"pipes\" (\"status\", \"updated\", \"amount\", \"geom\") \
             VALUES ($1, $2::timestamp, $3::text::numeric, ST_GeomFromEWKT($4))"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_insert_sql_unknown_column() {
        let info = TableInfo::from_spec(&spec(false));
        let record = DestinationRecord {
            geometry: None,
            values: vec![("missing".to_string(), FieldValue::Int64(1))],
        };
        assert!(insert_sql(&info, &record).is_err());
    }

    #[test]
    fn test_ewkt() {
        let value = GeometryValue {
            geometry: Geometry::Point(geo::Point::new(1.5, 2.0)),
            srid: 4326,
        };
        assert_eq!(to_ewkt(&value).unwrap(), "SRID=4326;POINT(1.5 2)");
    }

    #[test]
    fn test_base_type() {
        assert_eq!(base_type("character varying(10485760)"), "character varying");
        assert_eq!(
            base_type("timestamp(3) without time zone"),
            "timestamp without time zone"
        );
        assert_eq!(base_type("double precision"), "double precision");
    }

    #[test]
    fn test_geometry_kind() {
        assert_eq!(
            geometry_kind("MultiPolygon"),
            Some(DestinationGeometryKind::MultiPolygon)
        );
        assert_eq!(geometry_kind("PointZM"), Some(DestinationGeometryKind::Point));
        assert_eq!(geometry_kind("Geometry"), None);
    }
}
