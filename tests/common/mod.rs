#![allow(dead_code)]

use async_trait::async_trait;
use docvec::{EmbeddingProvider, Error, IndexSettings, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DIMENSIONS: usize = 256;

/// Deterministic bag-of-words embedder: each lowercase word is hashed into
/// one of `DIMENSIONS` buckets and the counts are L2-normalised.
pub struct HashEmbedder {
    name: String,
    pub calls: AtomicUsize,
    pub texts: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::named("hash-bow")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        }
    }

    pub fn embed(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; DIMENSIONS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let digest = Sha256::digest(word.to_lowercase().as_bytes());
            let bucket = u16::from_le_bytes([digest[0], digest[1]]) as usize % DIMENSIONS;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::embed(t)).collect())
    }
}

/// Provider whose every call fails
pub struct BrokenEmbedder;

#[async_trait]
impl EmbeddingProvider for BrokenEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::Provider("embedding backend is down".to_string()))
    }
}

/// Small fragments and no retry delays, so tests stay fast
pub fn test_settings() -> IndexSettings {
    IndexSettings {
        max_chunk_size: 200,
        chunk_overlap: 40,
        batch_size: 4,
        max_concurrent_batches: 2,
        max_retries: 0,
        retry_backoff_ms: 1,
        ..IndexSettings::default()
    }
}

pub fn write_corpus(root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root.join("engineering"))?;
    std::fs::create_dir_all(root.join("kitchen"))?;
    std::fs::write(
        root.join("engineering/branch-protection.md"),
        "# Branch protection\n\n\
         Branch protection rules require pull request reviews before merging \
         into the main branch. Enable branch protection on every repository.\n",
    )?;
    std::fs::write(
        root.join("engineering/deployments.md"),
        "# Deployments\n\n\
         Production deployments run from tagged releases. Each deployment is \
         announced in the operations channel and rolled out gradually across \
         regions while dashboards are watched for errors.\n\n\
         Rollbacks use the previous release tag and never skip the canary stage.\n",
    )?;
    std::fs::write(
        root.join("kitchen/bread.md"),
        "# Sourdough\n\n\
         Feed the starter the night before baking. Mix flour, water and salt, \
         then let the dough rest for an hour before folding.\n",
    )?;
    std::fs::write(root.join("kitchen/notes.txt"), "branch protection in a text file")?;
    Ok(())
}
