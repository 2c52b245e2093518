//! Model catalog: the registry of known models and their cached files.
//!
//! Descriptors are immutable once registered; the catalog persists to
//! `catalog.json` under the cache root on every mutation and is reloaded at
//! startup.  Local installs are copied into a content-addressed directory
//! under `models/`; pulls stream from the checkpoint store with progress
//! events.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::{is_under, ServerConfig};
use crate::error::ServeError;
use crate::recipe::{ModelClass, RawOptions, Recipe};

pub const KNOWN_LABELS: [&str; 4] = ["reasoning", "vision", "embeddings", "reranking"];

/// Where a model's weights live: already cached on disk, or still a remote
/// checkpoint reference awaiting a pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelLocation {
    Path(PathBuf),
    Checkpoint(String),
}

impl ModelLocation {
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            ModelLocation::Path(p) => Some(p),
            ModelLocation::Checkpoint(_) => None,
        }
    }
}

/// Identity of an installable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub class: ModelClass,
    pub recipe: Recipe,
    pub location: ModelLocation,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj_path: Option<PathBuf>,
    #[serde(default)]
    pub recipe_options: RawOptions,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub size_bytes: u64,
}

impl ModelDescriptor {
    /// Enforce the label/class coherence rules.  Called before any
    /// registration; a failing descriptor never mutates the catalog.
    pub fn validate(&self) -> Result<(), ServeError> {
        for label in &self.labels {
            if !KNOWN_LABELS.contains(&label.as_str()) {
                return Err(ServeError::InvalidRequest(format!(
                    "unknown label '{label}' on model '{}'",
                    self.name
                )));
            }
        }
        let has = |l: &str| self.labels.contains(l);
        if (self.class == ModelClass::Embedding) != has("embeddings") {
            return Err(ServeError::InvalidRequest(format!(
                "model '{}': class 'embedding' and label 'embeddings' must agree",
                self.name
            )));
        }
        if (self.class == ModelClass::Reranking) != has("reranking") {
            return Err(ServeError::InvalidRequest(format!(
                "model '{}': class 'reranking' and label 'reranking' must agree",
                self.name
            )));
        }
        if has("vision") && self.mmproj_path.is_none() {
            return Err(ServeError::InvalidRequest(format!(
                "model '{}' is labeled 'vision' but has no mmproj file",
                self.name
            )));
        }
        Ok(())
    }
}

/// Derive the model class implied by a recipe and label set.
pub fn class_for(recipe: Recipe, labels: &BTreeSet<String>) -> ModelClass {
    if labels.contains("embeddings") {
        ModelClass::Embedding
    } else if labels.contains("reranking") {
        ModelClass::Reranking
    } else if recipe == Recipe::WhisperCpp {
        ModelClass::Audio
    } else {
        ModelClass::Llm
    }
}

/// One progress frame of a pull.  The sequence terminates with a frame whose
/// status is `success` or `error: ...`.
#[derive(Debug, Clone, Serialize)]
pub struct PullEvent {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl PullEvent {
    fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            completed: None,
            total: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == "success" || self.status.starts_with("error")
    }
}

struct BuiltinModel {
    name: &'static str,
    checkpoint: &'static str,
    recipe: Recipe,
    labels: &'static [&'static str],
}

/// Models known to the server out of the box.  They appear in listings with a
/// checkpoint location and become loadable once pulled.
const BUILTIN_MODELS: &[BuiltinModel] = &[
    BuiltinModel {
        name: "Qwen2.5-0.5B-Instruct-GGUF",
        checkpoint: "Qwen/Qwen2.5-0.5B-Instruct-GGUF:qwen2.5-0.5b-instruct-q4_k_m.gguf",
        recipe: Recipe::LlamaCpp,
        labels: &[],
    },
    BuiltinModel {
        name: "Llama-3.2-1B-Instruct-GGUF",
        checkpoint: "unsloth/Llama-3.2-1B-Instruct-GGUF:Llama-3.2-1B-Instruct-Q4_K_M.gguf",
        recipe: Recipe::LlamaCpp,
        labels: &[],
    },
    BuiltinModel {
        name: "DeepSeek-R1-Distill-Qwen-7B-GGUF",
        checkpoint: "unsloth/DeepSeek-R1-Distill-Qwen-7B-GGUF:DeepSeek-R1-Distill-Qwen-7B-Q4_K_M.gguf",
        recipe: Recipe::LlamaCpp,
        labels: &["reasoning"],
    },
    BuiltinModel {
        name: "nomic-embed-text-v1.5-GGUF",
        checkpoint: "nomic-ai/nomic-embed-text-v1.5-GGUF:nomic-embed-text-v1.5.Q4_K_M.gguf",
        recipe: Recipe::LlamaCpp,
        labels: &["embeddings"],
    },
    BuiltinModel {
        name: "bge-reranker-v2-m3-GGUF",
        checkpoint: "gpustack/bge-reranker-v2-m3-GGUF:bge-reranker-v2-m3-Q4_K_M.gguf",
        recipe: Recipe::LlamaCpp,
        labels: &["reranking"],
    },
    BuiltinModel {
        name: "whisper-base",
        checkpoint: "ggerganov/whisper.cpp:ggml-base.bin",
        recipe: Recipe::WhisperCpp,
        labels: &[],
    },
];

pub struct ModelCatalog {
    models_dir: PathBuf,
    catalog_path: PathBuf,
    entries: Mutex<BTreeMap<String, ModelDescriptor>>,
    /// Pull client; honors the process HTTP proxy environment.
    http: reqwest::Client,
}

impl ModelCatalog {
    pub fn load(config: &ServerConfig) -> anyhow::Result<Arc<Self>> {
        let catalog_path = config.catalog_path();
        let mut entries: BTreeMap<String, ModelDescriptor> = BTreeMap::new();

        if catalog_path.exists() {
            let raw = std::fs::read_to_string(&catalog_path)?;
            let stored: Vec<ModelDescriptor> = serde_json::from_str(&raw)?;
            for descriptor in stored {
                entries.insert(descriptor.name.clone(), descriptor);
            }
            info!(count = entries.len(), "Catalog loaded");
        }

        for builtin in BUILTIN_MODELS {
            if entries.contains_key(builtin.name) {
                continue;
            }
            let labels: BTreeSet<String> =
                builtin.labels.iter().map(|l| l.to_string()).collect();
            entries.insert(
                builtin.name.to_string(),
                ModelDescriptor {
                    name: builtin.name.to_string(),
                    class: class_for(builtin.recipe, &labels),
                    recipe: builtin.recipe,
                    location: ModelLocation::Checkpoint(builtin.checkpoint.to_string()),
                    labels,
                    mmproj_path: None,
                    recipe_options: RawOptions::new(),
                    registered_at: Utc::now(),
                    size_bytes: 0,
                },
            );
        }

        std::fs::create_dir_all(config.models_dir())?;

        let catalog = Arc::new(Self {
            models_dir: config.models_dir(),
            catalog_path,
            entries: Mutex::new(entries),
            http: reqwest::Client::new(),
        });
        catalog.save()?;
        Ok(catalog)
    }

    fn save(&self) -> anyhow::Result<()> {
        let entries = self.entries.lock().expect("catalog lock");
        let ordered: Vec<&ModelDescriptor> = entries.values().collect();
        let json = serde_json::to_string_pretty(&ordered)?;
        std::fs::write(&self.catalog_path, json)?;
        Ok(())
    }

    /// Register a descriptor.  Idempotent by name: a re-register with the
    /// same recipe and class returns the existing entry unchanged; any other
    /// difference is a conflict.
    pub fn register(&self, descriptor: ModelDescriptor) -> Result<ModelDescriptor, ServeError> {
        descriptor.validate()?;
        {
            let mut entries = self.entries.lock().expect("catalog lock");
            if let Some(existing) = entries.get(&descriptor.name) {
                if existing.recipe != descriptor.recipe || existing.class != descriptor.class {
                    return Err(ServeError::ConflictingDescriptor(descriptor.name));
                }
                // Pulls overwrite a checkpoint placeholder with the cached
                // location; anything else keeps the original entry.
                if existing.location.local_path().is_some() {
                    return Ok(existing.clone());
                }
            }
            entries.insert(descriptor.name.clone(), descriptor.clone());
        }
        self.save().map_err(ServeError::internal)?;
        info!(model = %descriptor.name, recipe = %descriptor.recipe, "Model registered");
        Ok(descriptor)
    }

    pub fn lookup(&self, name: &str) -> Result<ModelDescriptor, ServeError> {
        self.entries
            .lock()
            .expect("catalog lock")
            .get(name)
            .cloned()
            .ok_or_else(|| ServeError::UnknownModel(name.to_string()))
    }

    /// All descriptors, ordered by name.
    pub fn list(&self) -> Vec<ModelDescriptor> {
        self.entries
            .lock()
            .expect("catalog lock")
            .values()
            .cloned()
            .collect()
    }

    /// Remove a catalog entry and its cached files.  Liveness against the
    /// slot pool is the router's responsibility; the catalog only refuses
    /// unknown names and never deletes files outside its managed cache.
    pub fn delete(&self, name: &str) -> Result<(), ServeError> {
        let removed = {
            let mut entries = self.entries.lock().expect("catalog lock");
            entries
                .remove(name)
                .ok_or_else(|| ServeError::UnknownModel(name.to_string()))?
        };
        self.save().map_err(ServeError::internal)?;

        if let Some(path) = removed.location.local_path() {
            // Cached trees live at models/<sha>/...; drop the whole tree.
            let cache_entry = path
                .ancestors()
                .find(|p| p.parent() == Some(self.models_dir.as_path()));
            if let Some(entry) = cache_entry {
                if is_under(entry, &self.models_dir) {
                    if let Err(e) = std::fs::remove_dir_all(entry) {
                        warn!(model = %name, "Failed to remove cached files: {e}");
                    }
                }
            }
        }
        info!(model = %name, "Model deleted");
        Ok(())
    }

    /// Copy a local model tree into the cache and register it.  `recipe` is
    /// required (it cannot be inferred from a bare path); vision models must
    /// supply `mmproj`.  No catalog mutation happens on any failure.
    pub async fn install_local(
        &self,
        name: &str,
        source: &Path,
        recipe: Recipe,
        labels: BTreeSet<String>,
        mmproj: Option<PathBuf>,
    ) -> Result<ModelDescriptor, ServeError> {
        if labels.contains("vision") && mmproj.is_none() {
            return Err(ServeError::InvalidRequest(format!(
                "model '{name}' is labeled 'vision'; an mmproj file is required"
            )));
        }
        if !source.exists() {
            return Err(ServeError::InvalidRequest(format!(
                "local model path {} does not exist",
                source.display()
            )));
        }

        let class = class_for(recipe, &labels);
        let descriptor = ModelDescriptor {
            name: name.to_string(),
            class,
            recipe,
            location: ModelLocation::Checkpoint(String::new()),
            labels,
            mmproj_path: mmproj.clone(),
            recipe_options: RawOptions::new(),
            registered_at: Utc::now(),
            size_bytes: 0,
        };
        // Catch label errors before the copy; nothing is cached on failure.
        descriptor.validate()?;

        let dest = self.models_dir.join(cache_key(name, source));
        let source = source.to_path_buf();
        let mmproj_src = mmproj.clone();
        let copy_dest = dest.clone();
        let copied = tokio::task::spawn_blocking(move || {
            copy_into_cache(&source, mmproj_src.as_deref(), &copy_dest)
        })
        .await
        .map_err(ServeError::internal)?;

        let (location, mmproj_path, size_bytes) = match copied {
            Ok(v) => v,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dest);
                return Err(ServeError::InvalidRequest(format!(
                    "failed to install local model: {e}"
                )));
            }
        };

        self.register(ModelDescriptor {
            location: ModelLocation::Path(location),
            mmproj_path,
            size_bytes,
            ..descriptor
        })
    }

    /// Pull a model from the checkpoint store.  Returns a lazy stream of
    /// progress events terminating in `success` or `error: ...`; on success
    /// the model is registered before the terminal event is emitted.
    pub fn pull(
        self: &Arc<Self>,
        name: String,
        checkpoint: String,
        recipe: Recipe,
        labels: BTreeSet<String>,
    ) -> ReceiverStream<PullEvent> {
        let (tx, rx) = mpsc::channel::<PullEvent>(32);
        let catalog = Arc::clone(self);

        tokio::spawn(async move {
            let _ = tx
                .send(PullEvent::status(format!("pulling {checkpoint}")))
                .await;
            match catalog
                .download_and_register(&name, &checkpoint, recipe, labels, &tx)
                .await
            {
                Ok(()) => {
                    let _ = tx.send(PullEvent::status("success")).await;
                }
                Err(e) => {
                    warn!(model = %name, "Pull failed: {e}");
                    let _ = tx.send(PullEvent::status(format!("error: {e}"))).await;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    async fn download_and_register(
        &self,
        name: &str,
        checkpoint: &str,
        recipe: Recipe,
        labels: BTreeSet<String>,
        tx: &mpsc::Sender<PullEvent>,
    ) -> anyhow::Result<()> {
        let (url, file_name) = checkpoint_url(checkpoint)?;
        let dest_dir = self.models_dir.join(cache_key(name, Path::new(checkpoint)));
        let dest = dest_dir.join(&file_name);
        let partial = dest_dir.join(format!("{file_name}.partial"));

        if dest.exists() {
            debug!(model = %name, "Checkpoint already cached");
        } else {
            tokio::fs::create_dir_all(&dest_dir).await?;
            let result = self.stream_to_file(&url, &partial, tx).await;
            if let Err(e) = result {
                // Keep the cache free of partial downloads.
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
            tokio::fs::rename(&partial, &dest).await?;
        }

        let size_bytes = tokio::fs::metadata(&dest).await.map(|m| m.len()).unwrap_or(0);
        let class = class_for(recipe, &labels);
        self.register(ModelDescriptor {
            name: name.to_string(),
            class,
            recipe,
            location: ModelLocation::Path(dest),
            labels,
            mmproj_path: None,
            recipe_options: RawOptions::new(),
            registered_at: Utc::now(),
            size_bytes,
        })
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(())
    }

    async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        tx: &mpsc::Sender<PullEvent>,
    ) -> anyhow::Result<()> {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("checkpoint store returned HTTP {} for {url}", resp.status());
        }
        let total = resp.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut completed: u64 = 0;
        let mut last_report: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            completed += chunk.len() as u64;
            // Progress frames are throttled to every 8 MiB.
            if completed - last_report >= 8 * 1024 * 1024 {
                last_report = completed;
                let _ = tx
                    .send(PullEvent {
                        status: "downloading".to_string(),
                        completed: Some(completed),
                        total,
                    })
                    .await;
            }
        }
        file.flush().await?;
        let _ = tx
            .send(PullEvent {
                status: "downloading".to_string(),
                completed: Some(completed),
                total,
            })
            .await;
        Ok(())
    }

    /// Register every `*.gguf` file found in `dir` as a llama.cpp LLM.
    pub fn scan_extra_dir(&self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), "Cannot scan extra models dir: {e}");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("gguf") {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let descriptor = ModelDescriptor {
                name: name.clone(),
                class: ModelClass::Llm,
                recipe: Recipe::LlamaCpp,
                location: ModelLocation::Path(path),
                labels: BTreeSet::new(),
                mmproj_path: None,
                recipe_options: RawOptions::new(),
                registered_at: Utc::now(),
                size_bytes,
            };
            match self.register(descriptor) {
                Ok(_) => debug!(model = %name, "Discovered local model"),
                Err(e) => warn!(model = %name, "Skipping discovered model: {e}"),
            }
        }
    }
}

/// Stable cache directory name for a model: sha256 over the registered name
/// and the source identity.
fn cache_key(name: &str, source: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\0");
    hasher.update(source.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Resolve `org/model:variant` to a download URL and target file name.  A
/// variant without an extension is treated as a GGUF quantization name.
fn checkpoint_url(checkpoint: &str) -> anyhow::Result<(String, String)> {
    let (repo, variant) = checkpoint
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("checkpoint '{checkpoint}' is missing a ':variant'"))?;
    if repo.split('/').count() != 2 {
        anyhow::bail!("checkpoint '{checkpoint}' is not of the form org/model:variant");
    }
    let file_name = if variant.contains('.') {
        variant.to_string()
    } else {
        format!("{variant}.gguf")
    };
    let base = std::env::var("MODELD_CHECKPOINT_BASE")
        .unwrap_or_else(|_| "https://huggingface.co".to_string());
    let url = format!("{base}/{repo}/resolve/main/{file_name}");
    Ok((url, file_name))
}

/// Blocking copy of a model file or tree (and optional mmproj) into `dest`.
/// Returns the primary weights location, the cached mmproj path and the
/// total byte count.
fn copy_into_cache(
    source: &Path,
    mmproj: Option<&Path>,
    dest: &Path,
) -> anyhow::Result<(PathBuf, Option<PathBuf>, u64)> {
    std::fs::create_dir_all(dest)?;
    let mut total: u64 = 0;

    let primary = if source.is_dir() {
        total += copy_tree(source, dest)?;
        dest.to_path_buf()
    } else {
        let file_name = source
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("source path has no file name"))?;
        let target = dest.join(file_name);
        total += std::fs::copy(source, &target)?;
        target
    };

    let mmproj_path = match mmproj {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("mmproj path has no file name"))?;
            let target = dest.join(file_name);
            total += std::fs::copy(path, &target)?;
            Some(target)
        }
        None => None,
    };

    Ok((primary, mmproj_path, total))
}

fn copy_tree(source: &Path, dest: &Path) -> anyhow::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            total += copy_tree(&entry.path(), &target)?;
        } else {
            total += std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(total)
}
