//! Transaction de chargement d'une table
//!
//! Garantit le retour arrière explicite en cas d'erreur fatale et tient le
//! compte des features écrites et rejetées.

use serde::Serialize;
use tracing::{error, info};

use super::{DestinationRecord, DestinationStore, TableInfo, TableRef};
use crate::error::{FieldWriteError, StructuralError, TransactionError};

/// Nombre maximal de messages d'erreur conservés dans le bilan
const MAX_KEPT_ERRORS: usize = 100;

/// Issue d'une transaction de chargement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadStatus {
    Committed,
    RolledBack,
}

/// Bilan d'une transaction de chargement
#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub table: TableRef,
    pub created: u64,
    pub failed: u64,
    pub deleted: u64,
    /// Premiers messages d'erreur des features rejetées
    pub errors: Vec<String>,
    pub status: LoadStatus,
}

/// Transaction ouverte sur une table destination
pub struct LoadTransaction<'a, D: DestinationStore + ?Sized> {
    store: &'a mut D,
    table: TableInfo,
    created: u64,
    failed: u64,
    deleted: u64,
    errors: Vec<String>,
}

impl<'a, D: DestinationStore + ?Sized> LoadTransaction<'a, D> {
    /// Démarre la transaction sur la connexion de `store`
    pub async fn begin(store: &'a mut D, table: TableInfo) -> Result<Self, TransactionError> {
        store.begin().await?;
        info!(table = %table.table, "Starting load transaction");

        Ok(Self {
            store,
            table,
            created: 0,
            failed: 0,
            deleted: 0,
            errors: Vec::new(),
        })
    }

    /// Écrit un enregistrement ; un rejet est compté en échec
    pub async fn insert(&mut self, record: &DestinationRecord) -> Result<(), FieldWriteError> {
        match self.store.insert(&self.table, record).await {
            Ok(()) => {
                self.created += 1;
                Ok(())
            }
            Err(e) => {
                self.record_failure(e.to_string());
                Err(e)
            }
        }
    }

    /// Enregistre une feature rejetée avant écriture
    pub fn record_failure(&mut self, reason: String) {
        self.failed += 1;
        if self.errors.len() < MAX_KEPT_ERRORS {
            self.errors.push(reason);
        }
    }

    /// Supprime toutes les lignes une à une (annulable avec la transaction).
    /// La séquence des identifiants n'est pas réinitialisée.
    pub async fn delete_all(&mut self) -> Result<u64, StructuralError> {
        let ids = self.store.row_ids(&self.table).await?;
        for id in &ids {
            self.store.delete_row(&self.table, *id).await?;
        }
        self.deleted += ids.len() as u64;
        info!(table = %self.table.table, rows = ids.len(), "Deleted existing rows");
        Ok(ids.len() as u64)
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Valide la transaction
    pub async fn commit(self) -> Result<LoadOutcome, TransactionError> {
        self.store.commit().await?;

        info!(
            table = %self.table.table,
            created = self.created,
            failed = self.failed,
            "Load transaction committed"
        );

        Ok(LoadOutcome {
            table: self.table.table,
            created: self.created,
            failed: self.failed,
            deleted: self.deleted,
            errors: self.errors,
            status: LoadStatus::Committed,
        })
    }

    /// Annule la transaction ; rien de ce qui a été écrit n'est conservé
    pub async fn rollback(self, reason: &str) -> LoadOutcome {
        error!(
            table = %self.table.table,
            reason = %reason,
            attempted = self.created + self.failed,
            "Rolling back load transaction"
        );

        if let Err(e) = self.store.rollback().await {
            error!(error = %e, "Explicit rollback failed");
        }

        let mut errors = self.errors;
        errors.insert(0, reason.to_string());

        LoadOutcome {
            table: self.table.table,
            created: 0,
            failed: self.failed,
            deleted: 0,
            errors,
            status: LoadStatus::RolledBack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{FieldValue, MemoryDatabase, TableSpec};
    use arcgis::{ColumnSpec, ColumnType};

    fn spec() -> TableSpec {
        TableSpec {
            table: TableRef::new(Some("public"), "roads"),
            overwrite: false,
            temporary: false,
            owner: None,
            geometry: None,
            columns: vec![ColumnSpec {
                name: "name".to_string(),
                source: "NAME".to_string(),
                column_type: ColumnType::Text(254),
                nullable: true,
                precision: None,
            }],
        }
    }

    fn record(name: &str) -> DestinationRecord {
        DestinationRecord {
            geometry: None,
            values: vec![("name".to_string(), FieldValue::Text(name.to_string()))],
        }
    }

    #[tokio::test]
    async fn test_commit_counts() {
        let db = MemoryDatabase::new();
        let mut store = db.connect();
        let info = store.create_table(&spec()).await.unwrap();

        let mut tx = LoadTransaction::begin(&mut store, info).await.unwrap();
        tx.insert(&record("a")).await.unwrap();
        tx.insert(&record("b")).await.unwrap();
        let bad = DestinationRecord {
            geometry: None,
            values: vec![("missing".to_string(), FieldValue::Int64(1))],
        };
        assert!(tx.insert(&bad).await.is_err());
        tx.record_failure("No geometry information".to_string());

        let outcome = tx.commit().await.unwrap();
        assert_eq!(outcome.status, LoadStatus::Committed);
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.failed, 2);
        assert_eq!(db.rows(&spec().table).len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_rows() {
        let db = MemoryDatabase::new();
        let mut store = db.connect();
        let info = store.create_table(&spec()).await.unwrap();

        let mut tx = LoadTransaction::begin(&mut store, info).await.unwrap();
        tx.insert(&record("a")).await.unwrap();
        let outcome = tx.rollback("stream failed").await;

        assert_eq!(outcome.status, LoadStatus::RolledBack);
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.errors[0], "stream failed");
        assert!(db.rows(&spec().table).is_empty());
    }

    #[tokio::test]
    async fn test_delete_all_keeps_sequence() {
        let db = MemoryDatabase::new();
        let mut store = db.connect();
        let info = store.create_table(&spec()).await.unwrap();

        let mut tx = LoadTransaction::begin(&mut store, info.clone()).await.unwrap();
        tx.insert(&record("a")).await.unwrap();
        tx.insert(&record("b")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = LoadTransaction::begin(&mut store, info).await.unwrap();
        assert_eq!(tx.delete_all().await.unwrap(), 2);
        tx.insert(&record("c")).await.unwrap();
        let outcome = tx.commit().await.unwrap();
        assert_eq!(outcome.deleted, 2);

        let rows = db.rows(&spec().table);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 3);
        assert_eq!(
            rows[0].values.get("name"),
            Some(&FieldValue::Text("c".to_string()))
        );
    }
}
