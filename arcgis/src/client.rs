//! Client HTTP pour les services ArcGIS REST

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::error::{FetchError, SchemaError};
use crate::schema::parse_descriptor;
use crate::stream::{Page, PageRequest, PageSource, PageWindow};
use crate::types::{RawFeature, RemoteLayerDescriptor};

/// Configuration du client HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Jeton ArcGIS (`token=`) pour les services protégés
    pub token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            user_agent: format!("arcgis-pg/{}", env!("CARGO_PKG_VERSION")),
            token: None,
        }
    }
}

/// Accès à une couche distante : description et pages
#[async_trait]
pub trait LayerService: Send + Sync {
    async fn describe(&self, url: &str) -> Result<RemoteLayerDescriptor, SchemaError>;

    /// Source de pages pour la couche décrite
    fn pages(&self, descriptor: &RemoteLayerDescriptor) -> Arc<dyn PageSource>;
}

/// Client reqwest partagé entre les couches
#[derive(Debug, Clone)]
pub struct ArcGisClient {
    http: Client,
    config: ClientConfig,
}

impl ArcGisClient {
    pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("f", "json".to_string())];
        if let Some(token) = &self.config.token {
            params.push(("token", token.clone()));
        }
        params
    }
}

/// URL de couche sans paramètres ni `/` final
pub fn normalize_layer_url(url: &str) -> Result<String, SchemaError> {
    let mut parsed = Url::parse(url.trim()).map_err(|e| SchemaError::Unreachable {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[async_trait]
impl LayerService for ArcGisClient {
    async fn describe(&self, url: &str) -> Result<RemoteLayerDescriptor, SchemaError> {
        let url = normalize_layer_url(url)?;
        info!(url = %url, "Fetching layer metadata");

        let unreachable = |e: reqwest::Error| SchemaError::Unreachable {
            url: url.clone(),
            reason: e.to_string(),
        };

        let response = self
            .http
            .get(&url)
            .query(&self.base_params())
            .send()
            .await
            .map_err(unreachable)?
            .error_for_status()
            .map_err(unreachable)?;

        let body: Value = response.json().await.map_err(|e| SchemaError::InvalidJson {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        parse_descriptor(&url, &body)
    }

    fn pages(&self, descriptor: &RemoteLayerDescriptor) -> Arc<dyn PageSource> {
        Arc::new(HttpPageSource {
            http: self.http.clone(),
            query_url: format!("{}/query", descriptor.url),
            base_params: self.base_params(),
            timeout_secs: self.config.timeout_secs,
        })
    }
}

/// Pages servies par l'opération `query` de la couche
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    http: Client,
    query_url: String,
    base_params: Vec<(&'static str, String)>,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    features: Vec<RawFeature>,
    #[serde(default)]
    exceeded_transfer_limit: bool,
    count: Option<u64>,
    object_ids: Option<Vec<i64>>,
}

impl HttpPageSource {
    /// Paramètres de formulaire d'une requête de page
    pub fn page_params(&self, request: &PageRequest) -> Vec<(&'static str, String)> {
        let mut params = self.base_params.clone();
        params.push(("where", request.where_clause.clone()));
        params.push(("outFields", "*".to_string()));
        params.push(("returnGeometry", "true".to_string()));
        if let Some(sr) = request.out_sr {
            params.push(("outSR", sr.to_string()));
        }

        match &request.window {
            PageWindow::Offset { offset, count } => {
                params.push(("resultOffset", offset.to_string()));
                params.push(("resultRecordCount", count.to_string()));
                if let Some(order_by) = &request.order_by {
                    params.push(("orderByFields", order_by.clone()));
                }
            }
            PageWindow::ObjectIds(ids) => {
                let ids: Vec<String> = ids.iter().map(i64::to_string).collect();
                params.push(("objectIds", ids.join(",")));
            }
        }
        params
    }

    async fn query(&self, params: &[(&'static str, String)]) -> Result<QueryResponse, FetchError> {
        let response = self
            .http
            .post(&self.query_url)
            .form(params)
            .send()
            .await
            .map_err(|e| self.convert_reqwest_error(&e))?
            .error_for_status()
            .map_err(|e| self.convert_reqwest_error(&e))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        // Les erreurs ArcGIS arrivent avec un statut 200
        if let Some(error) = body.get("error") {
            return Err(FetchError::Service {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        serde_json::from_value(body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    fn convert_reqwest_error(&self, error: &reqwest::Error) -> FetchError {
        if error.is_timeout() {
            return FetchError::Timeout {
                url: self.query_url.clone(),
                timeout_secs: self.timeout_secs,
            };
        }

        if let Some(status) = error.status() {
            return FetchError::Http {
                url: self.query_url.clone(),
                status: status.as_u16(),
                message: error.to_string(),
            };
        }

        FetchError::Network {
            url: self.query_url.clone(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let response = self.query(&self.page_params(request)).await?;
        Ok(Page {
            features: response.features,
            exceeded_transfer_limit: response.exceeded_transfer_limit,
        })
    }

    async fn count(&self, where_clause: &str) -> Result<u64, FetchError> {
        let mut params = self.base_params.clone();
        params.push(("where", where_clause.to_string()));
        params.push(("returnCountOnly", "true".to_string()));

        let response = self.query(&params).await?;
        debug!(count = ?response.count, "Feature count");
        response
            .count
            .ok_or_else(|| FetchError::Decode("missing count".to_string()))
    }

    async fn object_ids(&self, where_clause: &str) -> Result<Vec<i64>, FetchError> {
        let mut params = self.base_params.clone();
        params.push(("where", where_clause.to_string()));
        params.push(("returnIdsOnly", "true".to_string()));

        let response = self.query(&params).await?;
        Ok(response.object_ids.unwrap_or_default())
    }
}
