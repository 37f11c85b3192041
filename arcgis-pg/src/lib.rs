//! # arcgis-pg
//!
//! Import de couches ArcGIS REST vers PostGIS.
//!
//! ## Features
//!
//! - Chargement complet dans une nouvelle table (domaines, sous-types, SRS)
//! - Rechargement transactionnel d'une table existante
//! - Ajout incrémental à partir d'un champ de date
//! - Jobs d'import persistés et rechargement des couches suivies
//!
//! ## Usage CLI
//!
//! ```bash
//! # Décrire une couche
//! arcgis-pg describe https://example.com/arcgis/rest/services/Water/MapServer/0
//!
//! # Import complet puis ajouts
//! arcgis-pg import https://example.com/arcgis/rest/services/Water/MapServer/0 --table pipes
//! arcgis-pg append https://example.com/arcgis/rest/services/Water/MapServer/0 --table pipes --update-field EDITDATE
//!
//! # Recharger toutes les couches importées
//! arcgis-pg refresh
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod import;
pub mod job;
pub mod loader;
pub mod publish;
pub mod report;

pub use config::ImportConfig;
pub use error::{ImportError, StructuralError};
pub use export::pool::{create_pool, DatabaseConfig};
pub use export::{DestinationStore, MemoryDatabase, StoreProvider};
pub use import::Importer;
pub use job::{ImportMode, ImportService, JobStore, MemoryJobStore, PgJobStore, RunStatus};
pub use publish::{NoopPublisher, Publisher};
pub use report::ImportReport;
