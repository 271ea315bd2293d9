//! # Dispatch Handler
//!
//! Ties the [`Router`], [`HealthTracker`], per-provider [`KeyPool`]s, the
//! [`SignatureCache`], and the registered [`ProviderAdapter`]s together for
//! one request: it rewrites outbound thinking signatures, asks the router to
//! race healthy candidates, acquires a key for whichever candidate actually
//! gets tried, sends the request, reports the outcome back to the health
//! tracker and key pool, and — for streaming — captures new signatures as
//! they fly past.
//!
//! This struct is deliberately free of any HTTP-framework type: the gateway
//! crate's axum handlers own the socket and call into this one.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, ProviderError};
use crate::health::{HealthTracker, Outcome};
use crate::key_pool::{FailureKind, KeyPool};
use crate::models::{ContentBlock, ContentDelta, MessageContent, MessagesRequest, MessagesResponse, StreamEvent};
use crate::providers::{EventStream, OutboundRequest, ProviderAdapter};
use crate::routing::{ProviderInfo, Router};
use crate::signature_cache::SignatureCache;

/// One backend registered with the dispatch handler: its routing metadata,
/// adapter, and (when the provider rotates credentials) key pool. Providers
/// whose auth isn't a rotating pool — Bedrock's SigV4 identity, Vertex's
/// service account, Ollama's no-op — carry `key_pool: None`.
pub struct ProviderEntry {
    pub info: ProviderInfo,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub key_pool: Option<Arc<KeyPool>>,
}

pub struct DispatchRequest<'a> {
    pub body: MessagesRequest,
    pub raw_body: &'a [u8],
    pub ingress_bearer: Option<&'a str>,
    pub request_id: &'a str,
}

pub struct DispatchOutcome<T> {
    pub provider: String,
    pub value: T,
}

pub struct DispatchHandler {
    router: Arc<Router>,
    health: Arc<HealthTracker>,
    providers: Arc<HashMap<String, ProviderEntry>>,
    signatures: Arc<SignatureCache>,
}

impl DispatchHandler {
    pub fn new(
        router: Router,
        health: Arc<HealthTracker>,
        providers: Vec<ProviderEntry>,
        signatures: SignatureCache,
    ) -> Self {
        let providers = providers.into_iter().map(|p| (p.info.name.clone(), p)).collect();
        Self {
            router: Arc::new(router),
            health,
            providers: Arc::new(providers),
            signatures: Arc::new(signatures),
        }
    }

    /// Every model any registered adapter claims to serve, deduplicated, for
    /// `GET /v1/models`.
    pub fn models(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .providers
            .values()
            .flat_map(|p| p.adapter.list_models().to_vec())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Providers worth racing for `model`: those that either explicitly list
    /// it, or rewrite it to something else under their model mapping. Falls
    /// back to every registered provider when none match, since adapters for
    /// backends with very large catalogs (Bedrock, Vertex) don't enumerate
    /// every servable model.
    fn candidate_infos(&self, model: &str) -> Vec<ProviderInfo> {
        let filtered: Vec<ProviderInfo> = self
            .providers
            .values()
            .filter(|p| {
                p.adapter.list_models().iter().any(|m| m == model) || p.adapter.map_model(model) != model
            })
            .map(|p| p.info.clone())
            .collect();

        if filtered.is_empty() {
            self.providers.values().map(|p| p.info.clone()).collect()
        } else {
            filtered
        }
    }

    async fn rewrite_outbound_signatures(&self, model: &str, body: &mut MessagesRequest) {
        for message in body.messages.iter_mut() {
            let MessageContent::Blocks(blocks) = &mut message.content else {
                continue;
            };
            for block in blocks.iter_mut() {
                if let ContentBlock::Thinking { thinking, signature } = block {
                    if let Ok(Some(cached)) = self.signatures.get(model, thinking).await {
                        *signature = Some(cached);
                    }
                }
            }
        }
    }

    async fn capture_response_signatures(&self, model: &str, response: &MessagesResponse) {
        for block in &response.content {
            if let ContentBlock::Thinking {
                thinking,
                signature: Some(sig),
            } = block
            {
                let _ = self.signatures.set(model, thinking, sig).await;
            }
        }
    }

    /// Non-streaming request. Rewrites thinking signatures, races healthy
    /// providers per [`Router::select_with_retry`], and records the outcome.
    pub async fn dispatch(&self, mut req: DispatchRequest<'_>) -> Result<DispatchOutcome<MessagesResponse>, CoreError> {
        let model = req.body.model.clone();
        self.rewrite_outbound_signatures(&model, &mut req.body).await;

        let infos = self.candidate_infos(&model);
        let cancel = CancellationToken::new();

        let body = Arc::new(req.body);
        let raw_body = Arc::new(req.raw_body.to_vec());
        let ingress_bearer = req.ingress_bearer.map(|s| s.to_string());
        let request_id = req.request_id.to_string();

        let providers = Arc::clone(&self.providers);
        let health = Arc::clone(&self.health);
        let router = Arc::clone(&self.router);

        let try_provider = move |info: ProviderInfo, _token: CancellationToken| {
            let providers = Arc::clone(&providers);
            let health = Arc::clone(&health);
            let router = Arc::clone(&router);
            let body = Arc::clone(&body);
            let raw_body = Arc::clone(&raw_body);
            let ingress_bearer = ingress_bearer.clone();
            let request_id = request_id.clone();
            async move {
                router.acquire_slot(&info.name);
                let result = attempt_send(&providers, &info.name, &body, &raw_body, ingress_bearer.as_deref(), &request_id).await;
                router.release_slot(&info.name);

                let outcome = match &result {
                    Ok(_) => Outcome::Success,
                    Err(e) => Outcome::from_provider_error(e),
                };
                health.record(&info.name, outcome).await;
                result
            }
        };

        let (provider, response) = self.router.select_with_retry(&infos, &cancel, try_provider).await?;
        self.capture_response_signatures(&model, &response).await;
        Ok(DispatchOutcome {
            provider: provider.name,
            value: response,
        })
    }

    /// Streaming request. Identical provider selection, but captures
    /// thinking signatures incrementally as deltas flow through rather than
    /// from one complete response.
    pub async fn dispatch_stream(&self, mut req: DispatchRequest<'_>) -> Result<DispatchOutcome<EventStream>, CoreError> {
        let model = req.body.model.clone();
        self.rewrite_outbound_signatures(&model, &mut req.body).await;

        let infos = self.candidate_infos(&model);
        let cancel = CancellationToken::new();

        let body = Arc::new(req.body);
        let raw_body = Arc::new(req.raw_body.to_vec());
        let ingress_bearer = req.ingress_bearer.map(|s| s.to_string());
        let request_id = req.request_id.to_string();

        let providers = Arc::clone(&self.providers);
        let health = Arc::clone(&self.health);
        let router = Arc::clone(&self.router);

        let try_provider = move |info: ProviderInfo, _token: CancellationToken| {
            let providers = Arc::clone(&providers);
            let health = Arc::clone(&health);
            let router = Arc::clone(&router);
            let body = Arc::clone(&body);
            let raw_body = Arc::clone(&raw_body);
            let ingress_bearer = ingress_bearer.clone();
            let request_id = request_id.clone();
            async move {
                router.acquire_slot(&info.name);
                let result =
                    attempt_send_stream(&providers, &info.name, &body, &raw_body, ingress_bearer.as_deref(), &request_id).await;
                router.release_slot(&info.name);

                // A stream that opened successfully counts as a success for
                // health purposes; mid-stream failures surface to the client
                // as stream errors rather than triggering a fresh race,
                // since the SSE response has already started.
                let outcome = match &result {
                    Ok(_) => Outcome::Success,
                    Err(e) => Outcome::from_provider_error(e),
                };
                health.record(&info.name, outcome).await;
                result
            }
        };

        let (provider, stream) = self.router.select_with_retry(&infos, &cancel, try_provider).await?;
        let wrapped = capture_stream_signatures(stream, model, Arc::clone(&self.signatures));
        Ok(DispatchOutcome {
            provider: provider.name,
            value: wrapped,
        })
    }
}

async fn attempt_send(
    providers: &HashMap<String, ProviderEntry>,
    provider_name: &str,
    body: &MessagesRequest,
    raw_body: &[u8],
    ingress_bearer: Option<&str>,
    request_id: &str,
) -> Result<MessagesResponse, ProviderError> {
    let entry = providers.get(provider_name).ok_or_else(|| ProviderError::Configuration {
        message: format!("no adapter registered for provider '{provider_name}'"),
    })?;

    let acquired = match &entry.key_pool {
        Some(pool) => Some(pool.acquire().map_err(|e| pool_exhaustion_to_provider_error(e))?),
        None => None,
    };

    let outbound = OutboundRequest {
        body,
        raw_body,
        credential: acquired.as_ref().map(|(_, material)| material.as_str()),
        ingress_bearer,
        request_id,
    };

    let result = entry.adapter.send(outbound).await;
    report_and_release(entry, acquired.as_ref(), &result);
    result.map(|(response, _headers)| response)
}

async fn attempt_send_stream(
    providers: &HashMap<String, ProviderEntry>,
    provider_name: &str,
    body: &MessagesRequest,
    raw_body: &[u8],
    ingress_bearer: Option<&str>,
    request_id: &str,
) -> Result<EventStream, ProviderError> {
    let entry = providers.get(provider_name).ok_or_else(|| ProviderError::Configuration {
        message: format!("no adapter registered for provider '{provider_name}'"),
    })?;

    let acquired = match &entry.key_pool {
        Some(pool) => Some(pool.acquire().map_err(|e| pool_exhaustion_to_provider_error(e))?),
        None => None,
    };

    let outbound = OutboundRequest {
        body,
        raw_body,
        credential: acquired.as_ref().map(|(_, material)| material.as_str()),
        ingress_bearer,
        request_id,
    };

    let result = entry.adapter.send_stream(outbound).await;
    report_and_release(entry, acquired.as_ref(), &result);
    result.map(|(stream, _headers)| stream)
}

fn pool_exhaustion_to_provider_error(e: CoreError) -> ProviderError {
    match e {
        CoreError::KeyPoolExhausted { .. } => ProviderError::RateLimit,
        other => ProviderError::Configuration { message: other.to_string() },
    }
}

fn report_and_release<T>(
    entry: &ProviderEntry,
    acquired: Option<&(String, String)>,
    result: &Result<(T, HeaderMap), ProviderError>,
) {
    let Some((key_id, _)) = acquired else {
        return;
    };
    let Some(pool) = &entry.key_pool else {
        return;
    };

    match result {
        Ok((_, headers)) => pool.report_upstream(key_id, headers),
        Err(ProviderError::InvalidCredential) => pool.report_failure(key_id, FailureKind::Unauthorized),
        Err(ProviderError::RateLimit) => pool.report_failure(key_id, FailureKind::RateLimited),
        Err(_) => {}
    }
    pool.release(key_id);
}

/// Wrap an adapter's event stream so `thinking`/`signature` deltas are
/// accumulated and written to the signature cache as they pass through,
/// without buffering or delaying delivery to the client.
fn capture_stream_signatures(inner: EventStream, model: String, signatures: Arc<SignatureCache>) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        let mut thinking_by_index: HashMap<usize, String> = HashMap::new();

        while let Some(item) = inner.next().await {
            if let Ok(event) = &item {
                match event {
                    StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentDelta::ThinkingDelta { thinking },
                    } => {
                        thinking_by_index.entry(*index).or_default().push_str(thinking);
                    }
                    StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentDelta::SignatureDelta { signature },
                    } => {
                        if let Some(text) = thinking_by_index.get(index) {
                            let _ = signatures.set(&model, text, signature).await;
                        }
                    }
                    _ => {}
                }
            }
            yield item;
        }
    })
}
