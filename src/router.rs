//! Request router: resolves a model name to a catalog descriptor, composes
//! the effective recipe options, acquires a pooled backend slot and proxies
//! the request, translating errors into the client-facing taxonomy.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::catalog::{ModelCatalog, ModelDescriptor};
use crate::error::ServeError;
use crate::pool::{BackendSlotPool, SlotHandle, SlotSnapshot};
use crate::recipe::{ModelClass, RawOptions, RecipeOptions};

/// Latency histogram bucket upper bounds, in milliseconds.
const LATENCY_BUCKETS_MS: [u64; 8] = [50, 100, 250, 500, 1000, 2500, 10000, 60000];

#[derive(Default)]
struct ModelStats {
    requests: u64,
    latency_counts: [u64; LATENCY_BUCKETS_MS.len() + 1],
    latency_total_ms: u64,
}

impl ModelStats {
    fn record(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|&le| ms <= le)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_counts[bucket] += 1;
        self.latency_total_ms += ms;
    }

    fn to_json(&self) -> Value {
        let mut buckets = serde_json::Map::new();
        for (i, &le) in LATENCY_BUCKETS_MS.iter().enumerate() {
            buckets.insert(format!("le_{le}ms"), json!(self.latency_counts[i]));
        }
        buckets.insert(
            "le_inf".to_string(),
            json!(self.latency_counts[LATENCY_BUCKETS_MS.len()]),
        );
        json!({
            "requests": self.requests,
            "latency_total_ms": self.latency_total_ms,
            "latency_buckets": buckets,
        })
    }
}

/// Result of a proxied request: either a complete JSON body, or an open
/// streaming response with the slot handle that must outlive it.
pub enum Forwarded {
    Json(Value),
    Stream {
        response: reqwest::Response,
        handle: SlotHandle,
    },
}

pub struct Router {
    catalog: Arc<ModelCatalog>,
    pool: Arc<BackendSlotPool>,
    server_options: RawOptions,
    acquire_deadline: Duration,
    started_at: Instant,
    /// Loopback proxy client; backend traffic never goes through an HTTP
    /// proxy and generation may legitimately run for minutes.
    http: reqwest::Client,
    requests: AtomicU64,
    per_model: StdMutex<BTreeMap<String, ModelStats>>,
}

impl Router {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        pool: Arc<BackendSlotPool>,
        server_options: RawOptions,
        acquire_deadline: Duration,
    ) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .expect("proxy http client");
        Arc::new(Self {
            catalog,
            pool,
            server_options,
            acquire_deadline,
            started_at: Instant::now(),
            http,
            requests: AtomicU64::new(0),
            per_model: StdMutex::new(BTreeMap::new()),
        })
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn pool(&self) -> &Arc<BackendSlotPool> {
        &self.pool
    }

    /// Look up `name` and verify its class matches the operation.
    pub fn resolve(
        &self,
        name: &str,
        expected: ModelClass,
    ) -> Result<ModelDescriptor, ServeError> {
        let descriptor = self.catalog.lookup(name)?;
        if descriptor.class != expected {
            return Err(ServeError::WrongClass {
                model: name.to_string(),
                class: descriptor.class,
            });
        }
        Ok(descriptor)
    }

    /// Layered option merge: request over model descriptor over server
    /// config (recipe defaults apply at read time).
    fn compose_options(
        &self,
        descriptor: &ModelDescriptor,
        request_options: Option<&Value>,
    ) -> RecipeOptions {
        let recipe = descriptor.recipe;
        let request = request_options
            .map(|v| RecipeOptions::from_json(recipe, v))
            .unwrap_or_else(|| RecipeOptions::empty(recipe));
        request
            .inherit(&RecipeOptions::new(recipe, &descriptor.recipe_options))
            .inherit(&RecipeOptions::new(recipe, &self.server_options))
    }

    async fn acquire(
        &self,
        descriptor: &ModelDescriptor,
        request_options: Option<&Value>,
    ) -> Result<SlotHandle, ServeError> {
        let options = self.compose_options(descriptor, request_options);
        let deadline = tokio::time::Instant::now() + self.acquire_deadline;
        self.pool.acquire(descriptor, &options, deadline).await
    }

    /// Proxy a JSON request to the slot's backend, streaming or buffered.
    /// For streaming responses, event frames are relayed to the caller as
    /// they arrive; the returned handle keeps the slot checked out until the
    /// stream is dropped.
    pub async fn dispatch(
        &self,
        expected: ModelClass,
        backend_path: &str,
        model_name: &str,
        mut body: Value,
        stream: bool,
    ) -> Result<Forwarded, ServeError> {
        let descriptor = self.resolve(model_name, expected)?;
        // Load options may ride in the request body; they configure the
        // backend launch and are stripped before forwarding.
        let request_options = extract_request_options(&descriptor, &mut body);
        let handle = self.acquire(&descriptor, request_options.as_ref()).await?;
        self.count_request(model_name);

        let url = format!("http://127.0.0.1:{}{}", handle.port(), backend_path);
        debug!(model = %model_name, url = %url, stream, "Forwarding request");
        let start = Instant::now();

        let response = match self.http.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => return Err(self.backend_failure(&handle, e).await),
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(model = %model_name, %status, "Backend rejected request: {text}");
            return Err(ServeError::Internal(format!(
                "backend returned HTTP {status}: {text}"
            )));
        }

        self.record_latency(model_name, start.elapsed());

        if stream {
            Ok(Forwarded::Stream { response, handle })
        } else {
            let body: Value = response
                .json()
                .await
                .map_err(|e| ServeError::Internal(format!("invalid backend response: {e}")))?;
            Ok(Forwarded::Json(body))
        }
    }

    /// Proxy an opaque (non-JSON) request body to the backend, preserving
    /// the content type.  Used for the audio endpoints, whose multipart
    /// bodies pass through unmodified.
    pub async fn dispatch_raw(
        &self,
        expected: ModelClass,
        backend_path: &str,
        model_name: &str,
        content_type: Option<String>,
        body: reqwest::Body,
    ) -> Result<Forwarded, ServeError> {
        let descriptor = self.resolve(model_name, expected)?;
        let handle = self.acquire(&descriptor, None).await?;
        self.count_request(model_name);

        let url = format!("http://127.0.0.1:{}{}", handle.port(), backend_path);
        let start = Instant::now();
        let mut request = self.http.post(&url).body(body);
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.backend_failure(&handle, e).await),
        };
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ServeError::Internal(format!(
                "backend returned HTTP {status}: {text}"
            )));
        }
        self.record_latency(model_name, start.elapsed());
        let body: Value = response
            .json()
            .await
            .map_err(|e| ServeError::Internal(format!("invalid backend response: {e}")))?;
        Ok(Forwarded::Json(body))
    }

    /// Classify a proxy failure: a dead backend is `BackendGone` (and the
    /// slot is unlinked); anything else is internal.
    async fn backend_failure(&self, handle: &SlotHandle, err: reqwest::Error) -> ServeError {
        let name = handle.descriptor().name.clone();
        let alive = match handle.backend() {
            Some(backend) => backend.is_alive().await,
            None => false,
        };
        if alive {
            ServeError::Internal(format!("backend request failed: {err}"))
        } else {
            warn!(model = %name, "Backend died mid-request");
            handle.mark_dead();
            ServeError::BackendGone(name)
        }
    }

    fn count_request(&self, model: &str) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut per_model = self.per_model.lock().expect("stats lock");
        per_model.entry(model.to_string()).or_default().requests += 1;
    }

    fn record_latency(&self, model: &str, elapsed: Duration) {
        let mut per_model = self.per_model.lock().expect("stats lock");
        per_model
            .entry(model.to_string())
            .or_default()
            .record(elapsed);
    }

    pub fn list_running(&self) -> Vec<SlotSnapshot> {
        self.pool.list()
    }

    pub fn stats(&self) -> Value {
        let loads_by_model = self.pool.loads_by_model();
        let per_model = self.per_model.lock().expect("stats lock");
        let mut models: serde_json::Map<String, Value> = per_model
            .iter()
            .map(|(name, stats)| (name.clone(), stats.to_json()))
            .collect();
        for (name, loads) in loads_by_model {
            models
                .entry(name)
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .expect("model stats object")
                .insert("loads".to_string(), json!(loads));
        }
        json!({
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "requests": self.requests.load(Ordering::SeqCst),
            "loads": self.pool.loads(),
            "evictions": self.pool.evictions(),
            "models": models,
        })
    }

    pub async fn unload(&self, name: &str) {
        self.pool.unload(name).await;
    }

    /// Delete a model from the catalog; refused while a live slot serves it.
    pub fn delete_model(&self, name: &str) -> Result<(), ServeError> {
        if self.pool.is_loaded(name) {
            return Err(ServeError::InvalidRequest(format!(
                "model '{name}' is loaded; unload it before deleting"
            )));
        }
        self.catalog.delete(name)
    }

    /// Quiesce: drain and stop every slot.  Called once the frontend has
    /// stopped accepting requests.
    pub async fn shutdown(&self) {
        self.pool.unload_all().await;
    }
}

/// Pull recognized load options out of a request body.  Returns the extracted
/// bag and removes the keys so the backend never sees them.
fn extract_request_options(descriptor: &ModelDescriptor, body: &mut Value) -> Option<Value> {
    let map = body.as_object_mut()?;
    let mut extracted = serde_json::Map::new();
    for key in descriptor.recipe.option_keys() {
        if let Some(value) = map.remove(*key) {
            extracted.insert((*key).to_string(), value);
        }
    }
    if extracted.is_empty() {
        None
    } else {
        Some(Value::Object(extracted))
    }
}
