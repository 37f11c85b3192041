//! # arcgis
//!
//! Client pour les couches d'entités ArcGIS REST (MapServer / FeatureServer).
//!
//! ## Features
//!
//! - Découverte du schéma d'une couche (champs, domaines, sous-types, SRS)
//! - Correspondance des types ArcGIS vers les types PostgreSQL / PostGIS
//! - Flux paginé de features avec nouvelles tentatives
//! - Conversion des géométries ArcGIS JSON et GeoJSON vers les types `geo`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use arcgis::{ArcGisClient, ClientConfig, FeatureStream, LayerService, StreamOptions};
//!
//! let client = ArcGisClient::new(ClientConfig::default())?;
//! let descriptor = client.describe(url).await?;
//! let options = StreamOptions::for_layer(&descriptor, 1000, 3);
//! let mut stream = FeatureStream::new(client.pages(&descriptor), options);
//!
//! while let Some(feature) = stream.next().await {
//!     println!("{:?}", feature.properties);
//! }
//! ```

pub mod client;
pub mod error;
pub mod geometry;
pub mod mapping;
pub mod naming;
pub mod schema;
pub mod stream;
pub mod types;

pub use client::{ArcGisClient, ClientConfig, LayerService};
pub use error::{FetchError, GeometryError, SchemaError, StreamStateError};
pub use geometry::{translate, CoordTransform};
pub use mapping::{
    map_geometry_type, ColumnSpec, ColumnType, DestinationGeometryKind, MapperOptions, TypeMapper,
};
pub use stream::{FeatureStream, Page, PageRequest, PageSource, PageWindow, StreamOptions};
pub use types::{
    Domain, DomainCode, FieldDescriptor, GeometryPayload, LayerKind, RawFeature,
    RemoteLayerDescriptor, SpatialReference,
};
