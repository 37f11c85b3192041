//! Configuration d'un import
//!
//! Une [`ImportConfig`] est construite par [`ImportConfigBuilder`] ou lue
//! depuis un fichier JSON, puis résolue (nom de table par défaut, collisions)
//! avant le premier usage. Elle est persistée telle quelle dans les jobs.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use arcgis::naming::launder;
use arcgis::{MapperOptions, RemoteLayerDescriptor};

use crate::error::StructuralError;
use crate::export::{DestinationStore, TableRef};

/// Nom de la colonne géométrique par défaut
pub const DEFAULT_GEOMETRY_COLUMN: &str = "geom";

/// Schéma par défaut des tables créées
pub const DEFAULT_SCHEMA: &str = "public";

/// Nombre maximal de suffixes essayés pour éviter une collision de nom
const MAX_NAME_SUFFIX: u32 = 1000;

/// Options d'un import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Nom de la table destination (dérivé du nom de couche si absent)
    pub table_name: Option<String>,
    pub overwrite: bool,
    pub temporary: bool,
    /// Normaliser les noms de colonnes (minuscules, `_`)
    pub launder_names: bool,
    pub geometry_column: String,
    pub schema: Option<String>,
    pub owner: Option<String>,
    /// Champ de date distant utilisé par le mode ajout
    pub update_field: Option<String>,
    /// Annule l'import si le flux s'interrompt
    pub strict: bool,
    pub page_size: u32,
    pub max_retries: u32,
    /// Reprojeter côté client plutôt que par `outSR`
    pub client_side_reprojection: bool,
    /// Autorise NULL dans les colonnes double précision
    pub nullable_double: bool,
    /// Permissions transmises telles quelles à la publication
    pub permissions: Option<Value>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            table_name: None,
            overwrite: false,
            temporary: false,
            launder_names: true,
            geometry_column: DEFAULT_GEOMETRY_COLUMN.to_string(),
            schema: Some(DEFAULT_SCHEMA.to_string()),
            owner: None,
            update_field: None,
            strict: false,
            page_size: 1000,
            max_retries: 3,
            client_side_reprojection: false,
            nullable_double: false,
            permissions: None,
        }
    }
}

impl ImportConfig {
    pub fn builder() -> ImportConfigBuilder {
        ImportConfigBuilder::default()
    }

    /// Charge une configuration depuis un fichier JSON
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse import config JSON")?;
        config.validate().context("Invalid import config")?;
        Ok(config)
    }

    /// Vérifie la cohérence des options
    pub fn validate(&self) -> Result<(), StructuralError> {
        if self.page_size == 0 {
            return Err(StructuralError::InvalidConfig(
                "page size must be greater than zero".to_string(),
            ));
        }
        if self.geometry_column.trim().is_empty() {
            return Err(StructuralError::InvalidConfig(
                "geometry column name is empty".to_string(),
            ));
        }
        if let Some(name) = &self.table_name {
            if name.trim().is_empty() {
                return Err(StructuralError::InvalidConfig("table name is empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn mapper_options(&self) -> MapperOptions {
        MapperOptions {
            nullable_double: self.nullable_double,
        }
    }

    /// Nom de colonne destination d'un champ distant
    pub fn column_name(&self, field: &str) -> String {
        if self.launder_names {
            launder(field)
        } else {
            field.to_string()
        }
    }

    /// Table destination, toujours qualifiée : `pg_temp` pour une table
    /// temporaire, sinon le schéma demandé (`public` par défaut)
    pub fn table_ref(&self) -> Result<TableRef, StructuralError> {
        let name = self
            .table_name
            .as_deref()
            .ok_or_else(|| StructuralError::InvalidConfig("no table name".to_string()))?;
        if self.temporary {
            return Ok(TableRef::temporary(name));
        }
        let schema = self.schema.as_deref().unwrap_or(DEFAULT_SCHEMA);
        Ok(TableRef::new(Some(schema), name))
    }

    /// Configuration avec le nom par défaut (nom de couche) si aucun n'est donné
    pub fn with_default_name(&self, descriptor: &RemoteLayerDescriptor) -> Self {
        let mut resolved = self.clone();
        let name = match &self.table_name {
            Some(name) if self.launder_names => launder(name),
            Some(name) => name.clone(),
            None => descriptor.layer_name(),
        };
        resolved.table_name = Some(name);
        resolved
    }

    /// Résout le nom de table avant un import complet : nom par défaut, puis
    /// suffixe `_1`, `_2`... si la table existe et que l'écrasement n'est
    /// pas demandé
    pub async fn resolve<D: DestinationStore + ?Sized>(
        &self,
        descriptor: &RemoteLayerDescriptor,
        store: &mut D,
    ) -> Result<Self, StructuralError> {
        self.validate()?;
        let mut resolved = self.with_default_name(descriptor);
        if resolved.overwrite {
            return Ok(resolved);
        }

        let base = resolved.table_ref()?;
        if !store.table_exists(&base).await? {
            return Ok(resolved);
        }

        for suffix in 1..=MAX_NAME_SUFFIX {
            let candidate = format!("{}_{}", base.name, suffix);
            let table = TableRef::new(base.schema.as_deref(), &candidate);
            if !store.table_exists(&table).await? {
                info!(requested = %base, resolved = %table, "Table name already used");
                resolved.table_name = Some(candidate);
                return Ok(resolved);
            }
        }

        Err(StructuralError::TableExists(base.to_string()))
    }
}

/// Construction d'une [`ImportConfig`]
#[derive(Debug, Clone, Default)]
pub struct ImportConfigBuilder {
    config: ImportConfig,
}

impl ImportConfigBuilder {
    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.config.table_name = Some(name.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.config.overwrite = overwrite;
        self
    }

    pub fn temporary(mut self, temporary: bool) -> Self {
        self.config.temporary = temporary;
        self
    }

    pub fn launder_names(mut self, launder: bool) -> Self {
        self.config.launder_names = launder;
        self
    }

    pub fn geometry_column(mut self, name: impl Into<String>) -> Self {
        self.config.geometry_column = name.into();
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.config.schema = Some(schema.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.config.owner = Some(owner.into());
        self
    }

    pub fn update_field(mut self, field: impl Into<String>) -> Self {
        self.config.update_field = Some(field.into());
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn client_side_reprojection(mut self, enabled: bool) -> Self {
        self.config.client_side_reprojection = enabled;
        self
    }

    pub fn nullable_double(mut self, nullable: bool) -> Self {
        self.config.nullable_double = nullable;
        self
    }

    pub fn permissions(mut self, permissions: Value) -> Self {
        self.config.permissions = Some(permissions);
        self
    }

    pub fn build(self) -> Result<ImportConfig, StructuralError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
