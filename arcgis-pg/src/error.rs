//! Types d'erreurs côté destination

use thiserror::Error;

use arcgis::{FetchError, GeometryError, SchemaError, StreamStateError};

/// Erreurs de structure (table, colonnes, configuration) : fatales pour l'import
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("Table {0} already exists")]
    TableExists(String),

    #[error("Table {0} does not exist")]
    TableNotFound(String),

    #[error("Column {column} does not exist in {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("Database error during {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Invalid import configuration: {0}")]
    InvalidConfig(String),

    #[error("Reprojection unavailable: {0}")]
    Reprojection(String),
}

impl StructuralError {
    pub fn database(operation: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.into(),
            message: error.to_string(),
        }
    }
}

/// Erreurs de transaction : l'import est annulé
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("No open transaction")]
    NotOpen,

    #[error("A transaction is already open on this connection")]
    AlreadyOpen,

    #[error("Failed to {operation} transaction: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },
}

/// Erreurs d'écriture d'une feature (comptée en échec, l'import continue)
#[derive(Debug, Error)]
pub enum FieldWriteError {
    #[error("Value {value} does not fit column {column} ({expected})")]
    Conversion {
        column: String,
        expected: String,
        value: String,
    },

    #[error("Insert rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// Erreurs du suivi des jobs
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Job store database error: {0}")]
    Database(String),

    #[error("Invalid job record: {0}")]
    Serialization(String),

    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

/// Échec du collaborateur de publication
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PublishError(pub String);

/// Erreur de niveau import (regroupe toutes les causes fatales)
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    StreamState(#[from] StreamStateError),

    #[error(transparent)]
    Job(#[from] JobStoreError),

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Publishing failed: {0}")]
    Publish(#[from] PublishError),
}
