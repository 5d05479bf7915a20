//! Indexing and query orchestration.
//!
//! `SearchService` owns the published snapshot of the index. Writers build
//! a private copy, persist it, and only then swap it in, so a failed run
//! never changes what searches see.

use super::provider::{self, EmbeddingProvider, RetryPolicy};
use crate::core::config::{Config, IndexSettings};
use crate::core::error::{Error, Result};
use crate::indexing::chunker::{self, Fragment};
use crate::indexing::loader::{self, Document};
use crate::storage::snapshot;
use crate::storage::vectors::VectorStore;
use futures::stream::{self, StreamExt, TryStreamExt};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Results returned when the caller does not ask for a specific count
pub const DEFAULT_LIMIT: usize = 5;

/// A ranked fragment as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub content: String,
    pub source: String,
    pub score: f32,
}

/// Outcome of an indexing run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    /// Documents loaded from the corpus
    pub documents: usize,
    /// Fragments produced by the chunker
    pub fragments: usize,
    /// Fragments sent to the embedding provider
    pub embedded: usize,
    /// Fragments whose stored vector was still valid
    pub reused: usize,
    /// Stored fragments dropped because their text or file is gone
    pub removed: usize,
}

/// Summary of the published index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub fragments: usize,
    pub sources: usize,
    pub model: Option<String>,
    pub dimensions: Option<usize>,
    pub generation: u64,
}

/// Serialisable search outcome that never fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchResponse {
    Hits(Vec<SearchHit>),
    Error { error: String },
}

/// Serialisable index outcome that never fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexResponse {
    Report(IndexReport),
    Error { error: String },
}

pub struct SearchService {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    settings: IndexSettings,
    policy: RetryPolicy,
    location: PathBuf,
    snapshot: RwLock<Option<Arc<VectorStore>>>,
    loading: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<()>,
}

impl SearchService {
    /// Service over the index directory of `config`
    pub fn open(config: &Config, provider: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self> {
        Self::with_location(&config.index_dir, config.settings.clone(), provider)
    }

    /// Service over an explicit index location.
    ///
    /// Passing `None` for the provider yields a degraded service: both
    /// indexing and searching report [`Error::ProviderUnavailable`].
    pub fn with_location(
        location: &Path,
        settings: IndexSettings,
        provider: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        settings.validate()?;
        if provider.is_none() {
            debug!("No embedding provider configured; search and indexing are unavailable");
        }
        Ok(Self {
            provider,
            policy: settings.retry_policy(),
            settings,
            location: location.to_path_buf(),
            snapshot: RwLock::new(None),
            loading: tokio::sync::Mutex::new(()),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// True when no embedding provider is available
    pub fn is_degraded(&self) -> bool {
        self.provider.is_none()
    }

    fn provider(&self) -> Result<&Arc<dyn EmbeddingProvider>> {
        self.provider.as_ref().ok_or_else(|| {
            Error::ProviderUnavailable("no embedding provider configured".to_string())
        })
    }

    /// The published snapshot, reloaded whenever `CURRENT` has moved past
    /// the cached generation.
    ///
    /// Only one load runs at a time; callers that queued behind it pick up
    /// its result instead of opening the database again.
    async fn current(&self) -> Result<Option<Arc<VectorStore>>> {
        let Some(generation) = snapshot::current_generation(&self.location)? else {
            return Ok(None);
        };
        if let Some(store) = self.cached(generation) {
            return Ok(Some(store));
        }

        let _loading = self.loading.lock().await;
        if let Some(store) = self.cached(generation) {
            return Ok(Some(store));
        }

        let location = self.location.clone();
        let store = tokio::task::spawn_blocking(move || VectorStore::load(&location))
            .await
            .map_err(|e| Error::Database(format!("Index load task failed: {}", e)))??;
        debug!(
            "Loaded index generation {} with {} fragments",
            store.generation(),
            store.len()
        );
        Ok(Some(self.publish(store)))
    }

    /// Cached snapshot, if it is at least as new as `generation`
    fn cached(&self, generation: u64) -> Option<Arc<VectorStore>> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|store| store.generation() >= generation)
            .map(Arc::clone)
    }

    /// Swap in `store` unless a newer generation is already cached
    fn publish(&self, store: VectorStore) -> Arc<VectorStore> {
        let store = Arc::new(store);
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(cached) if cached.generation() > store.generation() => Arc::clone(cached),
            _ => {
                *guard = Some(Arc::clone(&store));
                store
            }
        }
    }

    /// Index every matching document under `root`
    pub async fn index(&self, root: &Path) -> Result<IndexReport> {
        self.index_with(root, false).await
    }

    /// Bring the index up to date with `root`; safe to repeat
    pub async fn reindex(&self, root: &Path) -> Result<IndexReport> {
        self.index_with(root, false).await
    }

    /// Index `root`, re-embedding every fragment when `force` is set.
    ///
    /// Fragments of loaded documents replace what was stored for them, and
    /// stored sources under `root` that no longer exist are dropped. The
    /// new snapshot becomes visible only after it has been persisted.
    pub async fn index_with(&self, root: &Path, force: bool) -> Result<IndexReport> {
        let provider = Arc::clone(self.provider()?);
        let _writer = self.writer.lock().await;

        let root = loader::resolve_root(root)?;
        info!("Indexing {}", root.display());

        let mut documents = loader::load(&root, &self.settings.glob).await?;
        documents.sort_by(|a, b| a.path.cmp(&b.path));
        let chunked = self.chunk_all(documents).await?;

        let mut store = match self.current().await {
            Ok(Some(current)) => (*current).clone(),
            Ok(None) => VectorStore::empty(&self.location),
            Err(e) if force => {
                warn!("Unreadable index at {}, rebuilding: {}", self.location.display(), e);
                VectorStore::empty(&self.location)
            }
            Err(e) => return Err(e),
        };

        let model_changed = store.model().is_some_and(|m| m != provider.model_name())
            || store.dimensions().is_some_and(|d| d != provider.dimensions());
        if model_changed {
            info!(
                "Embedding model changed to {}; rebuilding the index",
                provider.model_name()
            );
            store.clear();
        }
        let reuse = !force && !model_changed;

        let mut report = IndexReport {
            documents: chunked.len(),
            ..IndexReport::default()
        };

        let loaded: HashSet<&str> = chunked.iter().map(|(source, _)| source.as_str()).collect();
        report.removed += store.retain_sources(|source| {
            !Path::new(source).starts_with(&root) || loaded.contains(source)
        });

        let mut ready = Vec::new();
        let mut pending = Vec::new();
        {
            let stored = store.fragments_by_source();
            for (source, fragments) in &chunked {
                if let Some(old) = stored.get(source.as_str()) {
                    let new_ids: HashSet<&str> = fragments.iter().map(|f| f.id.as_str()).collect();
                    report.removed += old
                        .iter()
                        .filter(|f| !new_ids.contains(f.id.as_str()))
                        .count();
                }

                for fragment in fragments {
                    let mut fragment = fragment.clone();
                    if reuse {
                        if let Some(old) = store.get(&fragment.id) {
                            if old.content_hash == fragment.content_hash {
                                fragment.vector = old.vector.clone();
                            }
                        }
                    }
                    if fragment.vector.is_some() {
                        ready.push(fragment);
                    } else {
                        pending.push(fragment);
                    }
                }
            }
        }
        report.fragments = ready.len() + pending.len();
        report.reused = ready.len();
        report.embedded = pending.len();

        let texts: Vec<String> = pending.iter().map(|f| f.text.clone()).collect();
        let vectors = self.embed_all(provider.as_ref(), texts).await?;
        for (fragment, vector) in pending.iter_mut().zip(vectors) {
            fragment.vector = Some(vector);
        }

        store.retain_sources(|source| !loaded.contains(source));
        store.add(ready)?;
        store.add(pending)?;
        store.set_model(provider.model_name());

        let store = tokio::task::spawn_blocking(move || -> Result<VectorStore> {
            store.persist()?;
            Ok(store)
        })
        .await
        .map_err(|e| Error::PersistenceFailure(format!("Persist task failed: {}", e)))??;

        info!(
            "Indexed {} documents into {} fragments ({} embedded, {} reused, {} removed)",
            report.documents, report.fragments, report.embedded, report.reused, report.removed
        );
        self.publish(store);
        Ok(report)
    }

    async fn chunk_all(&self, documents: Vec<Document>) -> Result<Vec<(String, Vec<Fragment>)>> {
        let max_size = self.settings.max_chunk_size;
        let overlap = self.settings.chunk_overlap;
        tokio::task::spawn_blocking(move || {
            documents
                .par_iter()
                .map(|doc| (doc.source(), chunker::split(doc, max_size, overlap)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("Chunking task failed: {}", e))))
    }

    /// Embed texts in batches with bounded concurrency, keeping input order
    async fn embed_all(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batches: Vec<Vec<String>> = texts
            .chunks(self.settings.batch_size)
            .map(|batch| batch.to_vec())
            .collect();
        debug!("Embedding {} fragments in {} batches", texts.len(), batches.len());

        let policy = &self.policy;
        let results: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|batch| async move {
                provider::embed_batch_with_retry(provider, &batch, policy).await
            })
            .buffered(self.settings.max_concurrent_batches)
            .try_collect()
            .await?;

        Ok(results.into_iter().flatten().collect())
    }

    /// Up to `k` fragments most similar to `query`, best first
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        let provider = self.provider()?;
        let store = self
            .current()
            .await?
            .ok_or_else(|| Error::IndexNotFound(self.location.clone()))?;
        if k == 0 || store.is_empty() {
            return Ok(Vec::new());
        }

        let vector = provider::embed_query_with_retry(provider.as_ref(), query, &self.policy).await?;
        let results = store.search(&vector, k)?;
        debug!("Query matched {} fragments", results.len());

        Ok(results
            .into_iter()
            .filter_map(|result| {
                store.get(&result.fragment_id).map(|fragment| SearchHit {
                    content: fragment.text.clone(),
                    source: fragment.source_path.clone(),
                    score: result.score,
                })
            })
            .collect())
    }

    /// Like [`search`](Self::search), with failures folded into the payload
    pub async fn search_response(&self, query: &str, k: usize) -> SearchResponse {
        match self.search(query, k).await {
            Ok(hits) => SearchResponse::Hits(hits),
            Err(e) => {
                warn!("Search failed: {}", e);
                SearchResponse::Error {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Like [`reindex`](Self::reindex), with failures folded into the payload
    pub async fn index_response(&self, root: &Path) -> IndexResponse {
        match self.reindex(root).await {
            Ok(report) => IndexResponse::Report(report),
            Err(e) => {
                warn!("Indexing failed: {}", e);
                IndexResponse::Error {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Statistics of the published index, if one exists
    pub async fn stats(&self) -> Option<IndexStats> {
        match self.current().await {
            Ok(store) => store.map(|store| IndexStats {
                fragments: store.len(),
                sources: store.source_count(),
                model: store.model().map(str::to_string),
                dimensions: store.dimensions(),
                generation: store.generation(),
            }),
            Err(e) => {
                warn!("Failed to read index: {}", e);
                None
            }
        }
    }
}
