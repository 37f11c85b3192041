//! Types d'erreurs pour le crate arcgis

use thiserror::Error;

/// Erreurs de découverte du schéma distant (fatales, avant toute écriture)
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Service injoignable ou réponse HTTP en erreur
    #[error("Layer endpoint unreachable ({url}): {reason}")]
    Unreachable { url: String, reason: String },

    /// La réponse n'est pas du JSON exploitable
    #[error("Layer metadata is not valid JSON ({url}): {reason}")]
    InvalidJson { url: String, reason: String },

    /// Le service a renvoyé un corps d'erreur ArcGIS
    #[error("Service error {code} for {url}: {message}")]
    Service {
        url: String,
        code: i64,
        message: String,
    },

    /// Le type déclaré n'est ni "Feature Layer" ni "Table"
    #[error("This URL {url} is not a feature layer (declared type: {kind:?})")]
    UnsupportedLayerKind { url: String, kind: Option<String> },

    /// Aucun type de géométrie exploitable
    #[error("No geometry type: {0:?}")]
    UnmappedGeometryType(Option<String>),

    /// Type de champ distant inconnu de la table de correspondance
    #[error("Field '{field}' has an unmapped type '{remote_type}'")]
    UnmappedFieldType { field: String, remote_type: String },
}

/// Erreurs de récupération des pages de features
#[derive(Debug, Error)]
pub enum FetchError {
    /// Erreur réseau (connexion, timeout)
    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Délai de réponse dépassé
    #[error("Request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// Statut HTTP en erreur
    #[error("HTTP {status} for {url}: {message}")]
    Http {
        url: String,
        status: u16,
        message: String,
    },

    /// Corps d'erreur ArcGIS dans une réponse 200
    #[error("Service error {code}: {message}")]
    Service { code: i64, message: String },

    /// Page illisible
    #[error("Invalid page payload: {0}")]
    Decode(String),

    /// Client HTTP impossible à construire
    #[error("HTTP client build failed: {0}")]
    ClientBuild(String),

    /// Toutes les tentatives ont échoué
    #[error("Page fetch failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    /// Indique si une nouvelle tentative a un sens
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            // Code 400 (clause where invalide...) : inutile de réessayer
            Self::Service { code, .. } => *code == 429 || *code >= 500,
            Self::Decode(_) | Self::ClientBuild(_) | Self::RetriesExhausted { .. } => false,
        }
    }
}

/// Erreur d'utilisation du flux (erreur de l'appelant, pas des données)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamStateError {
    /// Paramètres de requête modifiés après la première page
    #[error("query parameters are fixed once iteration has started ({0})")]
    AlreadyStarted(&'static str),
}

/// Erreurs de construction de géométrie (par feature, non fatales)
#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    /// Feature d'une couche géographique sans géométrie
    #[error("No geometry information")]
    Missing,

    /// Géométrie sans coordonnées exploitables
    #[error("Empty geometry")]
    Empty,

    /// Position avec moins de deux ordonnées
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// Charge utile GeoJSON non convertible
    #[error("Unsupported geometry payload: {0}")]
    Unsupported(String),

    /// Échec de la transformation de coordonnées
    #[error("Coordinate transformation failed: {0}")]
    Transform(String),

    /// Conversion impossible vers le type attendu
    #[error("Cannot coerce {found} to {expected}")]
    Incompatible { found: String, expected: String },

    /// Géométrie invalide après coercition
    #[error("Invalid geometry after coercion: {0}")]
    Invalid(String),
}
