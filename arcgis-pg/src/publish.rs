//! Publication des tables importées
//!
//! Le serveur cartographique est une boîte noire : l'import demande la
//! publication d'une table après un chargement complet, et l'invalidation
//! du cache de rendu après un rechargement ou un ajout.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::ImportConfig;
use crate::error::PublishError;
use crate::export::TableRef;

/// Couche publiée
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedLayer {
    pub name: String,
    pub title: String,
    pub url: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        table: &TableRef,
        config: &ImportConfig,
    ) -> Result<PublishedLayer, PublishError>;

    async fn invalidate_cache(&self, layer: &str) -> Result<(), PublishError>;
}

/// Publication sans serveur : décrit la table comme une couche
#[derive(Debug, Clone)]
pub struct NoopPublisher {
    site_url: String,
}

impl NoopPublisher {
    pub fn new(site_url: impl Into<String>) -> Self {
        Self {
            site_url: site_url.into(),
        }
    }
}

impl Default for NoopPublisher {
    fn default() -> Self {
        Self::new("http://localhost")
    }
}

/// Titre lisible dérivé d'un nom de table (`water_mains` → `Water Mains`)
pub fn title_from_name(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Publisher for NoopPublisher {
    async fn publish(
        &self,
        table: &TableRef,
        _config: &ImportConfig,
    ) -> Result<PublishedLayer, PublishError> {
        let name = table.to_string();
        let url = format!(
            "{}/layers/{}",
            self.site_url.trim_end_matches('/'),
            name.replace('.', ":")
        );
        Ok(PublishedLayer {
            title: title_from_name(&table.name),
            name,
            url,
        })
    }

    async fn invalidate_cache(&self, layer: &str) -> Result<(), PublishError> {
        debug!(layer = %layer, "No render cache to invalidate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_from_name() {
        assert_eq!(title_from_name("water_mains"), "Water Mains");
        assert_eq!(title_from_name("roads_2"), "Roads 2");
    }

    #[tokio::test]
    async fn test_noop_publish() {
        let publisher = NoopPublisher::new("https://maps.example.com/");
        let layer = publisher
            .publish(&TableRef::new(Some("public"), "pipes"), &ImportConfig::default())
            .await
            .unwrap();
        assert_eq!(layer.name, "public.pipes");
        assert_eq!(layer.title, "Pipes");
        assert_eq!(layer.url, "https://maps.example.com/layers/public:pipes");
    }
}
