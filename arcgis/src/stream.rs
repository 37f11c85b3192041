//! Curseur paginé sur les features d'une couche
//!
//! Le flux est paresseux, fini et non redémarrable. Chaque page est demandée
//! au [`PageSource`] avec un nombre borné de nouvelles tentatives ; une fois
//! les tentatives épuisées, l'erreur est conservée et le flux se termine.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::{FetchError, StreamStateError};
use crate::types::{RawFeature, RemoteLayerDescriptor};

/// Filtre par défaut : toutes les features
pub const WHERE_ALL: &str = "1=1";

/// Fenêtre demandée pour une page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageWindow {
    /// `resultOffset` / `resultRecordCount`
    Offset { offset: u64, count: u32 },
    /// Lot d'identifiants (`objectIds=`)
    ObjectIds(Vec<i64>),
}

/// Requête d'une page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub where_clause: String,
    pub out_sr: Option<u32>,
    pub order_by: Option<String>,
    pub window: PageWindow,
}

/// Page renvoyée par le service
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub features: Vec<RawFeature>,
    /// Le service signale qu'il reste des features au-delà de la page
    pub exceeded_transfer_limit: bool,
}

/// Source des pages (HTTP en production, en mémoire dans les tests)
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError>;

    /// Nombre de features correspondant au filtre
    async fn count(&self, where_clause: &str) -> Result<u64, FetchError>;

    /// Identifiants correspondant au filtre, triés
    async fn object_ids(&self, where_clause: &str) -> Result<Vec<i64>, FetchError>;
}

/// Stratégie de pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingStrategy {
    Offset,
    ObjectIds,
}

/// Paramètres du flux
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub page_size: u32,
    pub max_retries: u32,
    /// Délai de base, multiplié par le numéro de tentative
    pub retry_delay: Duration,
    pub paging: PagingStrategy,
    pub order_by: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            paging: PagingStrategy::Offset,
            order_by: None,
        }
    }
}

impl StreamOptions {
    /// Options adaptées aux capacités de la couche
    pub fn for_layer(descriptor: &RemoteLayerDescriptor, page_size: u32, max_retries: u32) -> Self {
        let page_size = page_size.clamp(1, descriptor.max_record_count.max(1));
        let paging = if descriptor.supports_pagination || descriptor.object_id_field.is_none() {
            PagingStrategy::Offset
        } else {
            PagingStrategy::ObjectIds
        };

        Self {
            page_size,
            max_retries,
            paging,
            order_by: descriptor.object_id_field.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
enum Cursor {
    NotStarted,
    Offset { next: u64 },
    ObjectIds { remaining: VecDeque<i64> },
    Exhausted,
}

/// Flux de features
pub struct FeatureStream {
    source: Arc<dyn PageSource>,
    options: StreamOptions,
    where_clause: String,
    out_sr: Option<u32>,
    cursor: Cursor,
    buffer: VecDeque<RawFeature>,
    total: Option<u64>,
    count_attempted: bool,
    yielded: u64,
    failure: Option<FetchError>,
}

impl std::fmt::Debug for FeatureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStream")
            .field("options", &self.options)
            .field("where_clause", &self.where_clause)
            .field("out_sr", &self.out_sr)
            .field("cursor", &self.cursor)
            .field("yielded", &self.yielded)
            .finish()
    }
}

impl FeatureStream {
    pub fn new(source: Arc<dyn PageSource>, options: StreamOptions) -> Self {
        Self {
            source,
            options,
            where_clause: WHERE_ALL.to_string(),
            out_sr: None,
            cursor: Cursor::NotStarted,
            buffer: VecDeque::new(),
            total: None,
            count_attempted: false,
            yielded: 0,
            failure: None,
        }
    }

    fn ensure_not_started(&self, what: &'static str) -> Result<(), StreamStateError> {
        match self.cursor {
            Cursor::NotStarted => Ok(()),
            _ => Err(StreamStateError::AlreadyStarted(what)),
        }
    }

    /// Référence spatiale de sortie demandée au service
    pub fn set_out_sr(&mut self, srid: u32) -> Result<(), StreamStateError> {
        self.ensure_not_started("outSR")?;
        self.out_sr = Some(srid);
        Ok(())
    }

    /// Clause `where` de la requête
    pub fn set_filter(&mut self, where_clause: impl Into<String>) -> Result<(), StreamStateError> {
        self.ensure_not_started("where")?;
        self.where_clause = where_clause.into();
        Ok(())
    }

    pub fn out_sr(&self) -> Option<u32> {
        self.out_sr
    }

    pub fn filter(&self) -> &str {
        &self.where_clause
    }

    /// Nombre de features déjà produites
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    /// Erreur ayant interrompu le flux, le cas échéant
    pub fn failure(&self) -> Option<&FetchError> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<FetchError> {
        self.failure.take()
    }

    /// Nombre total estimé, pour la progression uniquement
    pub async fn total_count(&mut self) -> Option<u64> {
        if self.total.is_none() && !self.count_attempted {
            self.count_attempted = true;
            match self.source.count(&self.where_clause).await {
                Ok(count) => self.total = Some(count),
                Err(e) => warn!(error = %e, "Feature count unavailable"),
            }
        }
        self.total
    }

    /// Libère le tampon ; les appels suivants à `next` renvoient `None`
    pub fn close(&mut self) {
        self.buffer.clear();
        self.cursor = Cursor::Exhausted;
    }

    /// Feature suivante, `None` en fin de flux (normale ou sur erreur)
    pub async fn next(&mut self) -> Option<RawFeature> {
        loop {
            if let Some(feature) = self.buffer.pop_front() {
                self.yielded += 1;
                return Some(feature);
            }

            let step = match std::mem::replace(&mut self.cursor, Cursor::Exhausted) {
                Cursor::Exhausted => return None,
                Cursor::NotStarted => self.start().await,
                Cursor::Offset { next } => self.fetch_offset(next).await,
                Cursor::ObjectIds { remaining } => self.fetch_ids(remaining).await,
            };

            match step {
                Ok(cursor) => self.cursor = cursor,
                Err(e) => {
                    error!(
                        error = %e,
                        yielded = self.yielded,
                        "Feature stream stopped early"
                    );
                    self.failure = Some(e);
                    self.cursor = Cursor::Exhausted;
                }
            }
        }
    }

    async fn start(&mut self) -> Result<Cursor, FetchError> {
        match self.options.paging {
            PagingStrategy::Offset => Ok(Cursor::Offset { next: 0 }),
            PagingStrategy::ObjectIds => {
                let source = Arc::clone(&self.source);
                let where_clause = self.where_clause.clone();
                let mut ids = with_retry(&self.options, "object ids", || {
                    source.object_ids(&where_clause)
                })
                .await?;
                ids.sort_unstable();

                if self.total.is_none() {
                    self.total = Some(ids.len() as u64);
                }
                debug!(count = ids.len(), "Object id batching");
                Ok(Cursor::ObjectIds {
                    remaining: ids.into(),
                })
            }
        }
    }

    async fn fetch_offset(&mut self, offset: u64) -> Result<Cursor, FetchError> {
        let request = self.request(PageWindow::Offset {
            offset,
            count: self.options.page_size,
        });
        let page = self.fetch(&request).await?;
        let received = page.features.len() as u64;

        let finished = received == 0
            || (!page.exceeded_transfer_limit && received < u64::from(self.options.page_size));
        self.buffer.extend(page.features);

        if finished {
            Ok(Cursor::Exhausted)
        } else {
            Ok(Cursor::Offset {
                next: offset + received,
            })
        }
    }

    async fn fetch_ids(&mut self, mut remaining: VecDeque<i64>) -> Result<Cursor, FetchError> {
        if remaining.is_empty() {
            return Ok(Cursor::Exhausted);
        }

        let batch_len = remaining.len().min(self.options.page_size as usize);
        let batch: Vec<i64> = remaining.drain(..batch_len).collect();
        let request = self.request(PageWindow::ObjectIds(batch));
        let page = self.fetch(&request).await?;
        self.buffer.extend(page.features);

        if remaining.is_empty() {
            Ok(Cursor::Exhausted)
        } else {
            Ok(Cursor::ObjectIds { remaining })
        }
    }

    fn request(&self, window: PageWindow) -> PageRequest {
        PageRequest {
            where_clause: self.where_clause.clone(),
            out_sr: self.out_sr,
            order_by: self.options.order_by.clone(),
            window,
        }
    }

    async fn fetch(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let source = Arc::clone(&self.source);
        let page = with_retry(&self.options, "page", || source.fetch_page(request)).await?;
        debug!(
            features = page.features.len(),
            exceeded = page.exceeded_transfer_limit,
            "Fetched page"
        );
        Ok(page)
    }
}

/// Appelle `call` jusqu'à `max_retries + 1` fois, avec un délai linéaire
/// entre les tentatives. Les erreurs non transitoires sont renvoyées telles
/// quelles.
async fn with_retry<T, F, Fut>(
    options: &StreamOptions,
    what: &str,
    mut call: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = options.max_retries + 1;
    let mut attempt = 1;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= attempts => {
                return Err(FetchError::RetriesExhausted {
                    attempts,
                    last: Box::new(e),
                })
            }
            Err(e) => {
                warn!(attempt, max = attempts, error = %e, "Retrying {}", what);
                tokio::time::sleep(options.retry_delay * attempt).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn feature(id: i64) -> RawFeature {
        serde_json::from_value(json!({
            "attributes": {"OBJECTID": id},
            "geometry": {"x": id, "y": 0}
        }))
        .unwrap()
    }

    /// Source en mémoire avec erreurs programmables
    struct FakeSource {
        features: Vec<RawFeature>,
        /// Nombre d'échecs transitoires par page avant succès
        transient_failures: u32,
        /// Page (par offset) qui échoue toujours
        broken_offset: Option<u64>,
        /// Corps d'erreur ArcGIS renvoyé à chaque appel
        service_error: Option<i64>,
        calls: AtomicU32,
        requests: Mutex<Vec<PageRequest>>,
    }

    impl FakeSource {
        fn new(count: i64) -> Self {
            Self {
                features: (1..=count).map(feature).collect(),
                transient_failures: 0,
                broken_offset: None,
                service_error: None,
                calls: AtomicU32::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for FakeSource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
            self.requests.lock().unwrap().push(request.clone());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(code) = self.service_error {
                return Err(FetchError::Service {
                    code,
                    message: "Unable to complete operation.".to_string(),
                });
            }
            if call < self.transient_failures {
                return Err(FetchError::Http {
                    url: "fake".to_string(),
                    status: 503,
                    message: "busy".to_string(),
                });
            }

            match &request.window {
                PageWindow::Offset { offset, count } => {
                    if Some(*offset) == self.broken_offset {
                        return Err(FetchError::Network {
                            url: "fake".to_string(),
                            message: "connection reset".to_string(),
                        });
                    }
                    let features: Vec<RawFeature> = self
                        .features
                        .iter()
                        .skip(*offset as usize)
                        .take(*count as usize)
                        .cloned()
                        .collect();
                    let exceeded = (*offset as usize + features.len()) < self.features.len();
                    Ok(Page {
                        features,
                        exceeded_transfer_limit: exceeded,
                    })
                }
                PageWindow::ObjectIds(ids) => Ok(Page {
                    features: ids.iter().map(|id| feature(*id)).collect(),
                    exceeded_transfer_limit: false,
                }),
            }
        }

        async fn count(&self, _where_clause: &str) -> Result<u64, FetchError> {
            Ok(self.features.len() as u64)
        }

        async fn object_ids(&self, _where_clause: &str) -> Result<Vec<i64>, FetchError> {
            Ok((1..=self.features.len() as i64).rev().collect())
        }
    }

    fn options(page_size: u32) -> StreamOptions {
        StreamOptions {
            page_size,
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            ..StreamOptions::default()
        }
    }

    async fn drain(stream: &mut FeatureStream) -> Vec<i64> {
        let mut ids = Vec::new();
        while let Some(f) = stream.next().await {
            ids.push(f.properties["OBJECTID"].as_i64().unwrap());
        }
        ids
    }

    #[tokio::test]
    async fn test_offset_paging() {
        let source = Arc::new(FakeSource::new(5));
        let mut stream = FeatureStream::new(source.clone(), options(2));

        assert_eq!(stream.total_count().await, Some(5));
        assert_eq!(drain(&mut stream).await, vec![1, 2, 3, 4, 5]);
        assert!(stream.failure().is_none());
        assert_eq!(stream.yielded(), 5);
        assert!(stream.next().await.is_none());

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(
            requests[2].window,
            PageWindow::Offset {
                offset: 4,
                count: 2
            }
        );
    }

    #[tokio::test]
    async fn test_empty_layer() {
        let source = Arc::new(FakeSource::new(0));
        let mut stream = FeatureStream::new(source, options(10));
        assert!(stream.next().await.is_none());
        assert!(stream.failure().is_none());
    }

    #[tokio::test]
    async fn test_object_id_batching() {
        let source = Arc::new(FakeSource::new(5));
        let mut stream = FeatureStream::new(
            source.clone(),
            StreamOptions {
                paging: PagingStrategy::ObjectIds,
                ..options(2)
            },
        );

        assert_eq!(drain(&mut stream).await, vec![1, 2, 3, 4, 5]);
        let requests = source.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].window, PageWindow::ObjectIds(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mut source = FakeSource::new(3);
        source.transient_failures = 2;
        let mut stream = FeatureStream::new(Arc::new(source), options(10));

        assert_eq!(drain(&mut stream).await, vec![1, 2, 3]);
        assert!(stream.failure().is_none());
    }

    #[tokio::test]
    async fn test_exhausted_retries_end_stream() {
        let mut source = FakeSource::new(5);
        source.broken_offset = Some(2);
        let mut stream = FeatureStream::new(Arc::new(source), options(2));

        // Les features déjà produites restent valides
        assert_eq!(drain(&mut stream).await, vec![1, 2]);
        match stream.failure() {
            Some(FetchError::RetriesExhausted { attempts, .. }) => assert_eq!(*attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_query_is_not_retried() {
        let mut source = FakeSource::new(3);
        source.service_error = Some(400);
        let source = Arc::new(source);
        let mut stream = FeatureStream::new(source.clone(), options(2));

        assert!(drain(&mut stream).await.is_empty());
        assert!(matches!(
            stream.failure(),
            Some(FetchError::Service { code: 400, .. })
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_service_overload_is_retried() {
        let mut source = FakeSource::new(3);
        source.service_error = Some(503);
        let source = Arc::new(source);
        let mut stream = FeatureStream::new(source.clone(), options(2));

        assert!(drain(&mut stream).await.is_empty());
        assert!(matches!(
            stream.failure(),
            Some(FetchError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_parameters_fixed_after_start() {
        let source = Arc::new(FakeSource::new(3));
        let mut stream = FeatureStream::new(source.clone(), options(10));
        stream.set_out_sr(3857).unwrap();
        stream.set_filter("UPDATED > DATE '2024-01-01 00:00:00'").unwrap();

        assert!(stream.next().await.is_some());
        assert_eq!(
            stream.set_out_sr(4326),
            Err(StreamStateError::AlreadyStarted("outSR"))
        );
        assert_eq!(
            stream.set_filter("1=1"),
            Err(StreamStateError::AlreadyStarted("where"))
        );

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests[0].out_sr, Some(3857));
        assert_eq!(
            requests[0].where_clause,
            "UPDATED > DATE '2024-01-01 00:00:00'"
        );
    }

    #[tokio::test]
    async fn test_close() {
        let source = Arc::new(FakeSource::new(3));
        let mut stream = FeatureStream::new(source, options(10));
        assert!(stream.next().await.is_some());
        stream.close();
        assert!(stream.next().await.is_none());
    }
}
