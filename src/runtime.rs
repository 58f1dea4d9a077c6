use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::embed::{Embedder, HttpEmbedder};
use crate::store::QdrantStore;

/// Process-wide owner of external-client caches: embedding clients keyed by
/// model name, store adapters keyed by collection name. Collection creation
/// serializes on its own mutex so concurrent first-touchers of a new
/// collection wait on creation only, not on cache reads.
pub struct Initializer {
    config: Config,
    embedders: Mutex<HashMap<String, Arc<HttpEmbedder>>>,
    stores: Mutex<HashMap<String, Arc<QdrantStore>>>,
    ready: Mutex<HashSet<String>>,
}

impl Initializer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            embedders: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            ready: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self, model: &str) -> Arc<HttpEmbedder> {
        let mut cache = self.embedders.lock().unwrap();
        cache
            .entry(model.to_string())
            .or_insert_with(|| {
                Arc::new(HttpEmbedder::new(
                    &self.config.embed_base_url,
                    model,
                    &self.config.embed_api_key,
                    self.config.embed_batch,
                ))
            })
            .clone()
    }

    fn new_store(&self, collection: &str) -> QdrantStore {
        QdrantStore::new(
            &self.config.vector_url,
            &self.config.vector_api_key,
            collection,
            self.config.upsert_batch,
            self.config.vector_timeout,
        )
    }

    /// Create the collection lazily on first use. The vector dimension
    /// comes from configuration, or from embedding a short fixed string
    /// when not configured.
    pub fn ensure_collection(&self, collection: &str, model: &str) -> Result<()> {
        let mut ready = self.ready.lock().unwrap();
        if ready.contains(collection) {
            return Ok(());
        }

        let store = self.new_store(collection);
        if store.collection_exists()? {
            ready.insert(collection.to_string());
            return Ok(());
        }

        let dim = match self.config.dim {
            Some(dim) => dim,
            None => {
                info!(model, "vector dimension not configured; probing embedding service");
                let probe = self.embedder(model).embed(&["dimension probe".to_string()])?;
                probe.first().map(|v| v.len()).context("empty probe embedding")?
            }
        };
        store.create_collection(dim)?;
        ready.insert(collection.to_string());
        info!(collection, dim, "created collection");
        Ok(())
    }

    pub fn ensure_default_collection(&self) -> Result<()> {
        self.ensure_collection(&self.config.collection(), &self.config.embed_model)
    }

    pub fn store(&self, collection: &str, model: &str) -> Result<Arc<QdrantStore>> {
        self.ensure_collection(collection, model)?;
        let mut cache = self.stores.lock().unwrap();
        Ok(cache.entry(collection.to_string()).or_insert_with(|| Arc::new(self.new_store(collection))).clone())
    }

    /// Resolve both clients a run needs.
    pub fn clients(
        &self,
        collection: &str,
        model: &str,
    ) -> Result<(Arc<HttpEmbedder>, Arc<QdrantStore>)> {
        let embedder = self.embedder(model);
        let store = self.store(collection, model)?;
        Ok((embedder, store))
    }
}
