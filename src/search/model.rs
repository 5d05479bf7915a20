use super::provider::EmbeddingProvider;
use crate::core::config::Config;
use crate::core::error::{Error, Result};
use async_trait::async_trait;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use hf_hub::api::sync::Api;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::info;

/// Default embedding model (small, strong, good for semantic search)
/// https://huggingface.co/BAAI/bge-small-en-v1.5
pub const DEFAULT_MODEL: &str = "BAAI/bge-small-en-v1.5";

/// Longest token sequence the BERT encoder accepts
const MAX_SEQUENCE_LENGTH: usize = 512;

const WEIGHTS_FILE: &str = "model.safetensors";
const MODEL_CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";

struct Inner {
    model: Mutex<BertModel>,
    tokenizer: Mutex<Tokenizer>,
    device: Device,
}

/// Local BGE embedding model run with candle.
///
/// Passages are embedded with a `passage: ` prefix and queries with
/// `query: `, using CLS pooling and L2 normalisation.
#[derive(Clone)]
pub struct BgeEmbedder {
    inner: Arc<Inner>,
    dimensions: usize,
}

impl BgeEmbedder {
    /// Load the model from the models directory, downloading it on first use
    pub fn init(config: &Config) -> Result<Self> {
        let models_dir = &config.models_dir;
        std::fs::create_dir_all(models_dir)?;

        let weights_path = models_dir.join(WEIGHTS_FILE);
        let config_path = models_dir.join(MODEL_CONFIG_FILE);
        let tokenizer_path = models_dir.join(TOKENIZER_FILE);

        if !(weights_path.exists() && config_path.exists() && tokenizer_path.exists()) {
            Self::download(models_dir)?;
        }
        Self::load(&weights_path, &config_path, &tokenizer_path)
    }

    /// Whether the model files are already cached
    pub fn is_cached(config: &Config) -> bool {
        [WEIGHTS_FILE, MODEL_CONFIG_FILE, TOKENIZER_FILE]
            .iter()
            .all(|file| config.models_dir.join(file).exists())
    }

    /// Download model from HuggingFace Hub
    fn download(models_dir: &Path) -> Result<()> {
        info!("Downloading embedding model {} from HuggingFace Hub", DEFAULT_MODEL);

        let api = Api::new()?;
        let repo = api.model(DEFAULT_MODEL.to_string());

        for file in [MODEL_CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE] {
            info!("  fetching {}", file);
            let cached = repo.get(file)?;
            std::fs::copy(&cached, models_dir.join(file))?;
        }

        info!("Model downloaded to {}", models_dir.display());
        Ok(())
    }

    fn load(weights_path: &Path, config_path: &Path, tokenizer_path: &Path) -> Result<Self> {
        let config_content = std::fs::read_to_string(config_path)?;
        let bert_config: BertConfig = serde_json::from_str(&config_content)
            .map_err(|e| Error::Model(format!("Failed to parse config: {}", e)))?;
        let dimensions: usize = serde_json::from_str::<serde_json::Value>(&config_content)
            .ok()
            .and_then(|v| v.get("hidden_size").and_then(|h| h.as_u64()))
            .map(|h| h as usize)
            .ok_or_else(|| Error::Model("Model config has no hidden_size".to_string()))?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| Error::Tokenizer(format!("Failed to load tokenizer: {}", e)))?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_SEQUENCE_LENGTH,
                ..Default::default()
            }))
            .map_err(|e| Error::Tokenizer(format!("Failed to configure truncation: {}", e)))?;

        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);

        // Load model weights using memory mapping
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)
                .map_err(|e| Error::Model(format!("Failed to load weights: {}", e)))?
        };
        let model = BertModel::load(vb, &bert_config)
            .map_err(|e| Error::Model(format!("Failed to load model: {}", e)))?;

        info!("Loaded embedding model {} ({} dimensions)", DEFAULT_MODEL, dimensions);

        Ok(Self {
            inner: Arc::new(Inner {
                model: Mutex::new(model),
                tokenizer: Mutex::new(tokenizer),
                device,
            }),
            dimensions,
        })
    }

    /// Run the encoder on a blocking thread
    async fn embed_prefixed(&self, prefix: &'static str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inner = Arc::clone(&self.inner);
        let prefixed: Vec<String> = texts.iter().map(|t| format!("{}{}", prefix, t)).collect();
        tokio::task::spawn_blocking(move || inner.embed(prefixed))
            .await
            .map_err(|e| Error::Provider(format!("Embedding task failed: {}", e)))?
    }
}

impl Inner {
    fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self
            .model
            .lock()
            .map_err(|e| Error::Model(format!("Failed to lock model: {}", e)))?;
        let tokenizer = self
            .tokenizer
            .lock()
            .map_err(|e| Error::Model(format!("Failed to lock tokenizer: {}", e)))?;

        let tokens = tokenizer
            .encode_batch(texts, true)
            .map_err(|e| Error::Tokenizer(format!("Tokenization failed: {}", e)))?;

        let token_ids = tokens
            .iter()
            .map(|t| Tensor::new(t.get_ids(), &self.device).map_err(Error::Candle))
            .collect::<Result<Vec<Tensor>>>()?;
        let token_ids = Tensor::stack(&token_ids, 0)?;
        let token_type_ids = token_ids.zeros_like()?;

        let embeddings = model.forward(&token_ids, &token_type_ids)?;

        // CLS pooling: [batch, seq, hidden] -> [batch, hidden]
        let pooled = embeddings.narrow(1, 0, 1)?.squeeze(1)?;
        let normalized = normalize_l2(&pooled)?;

        Ok(normalized.to_vec2()?)
    }
}

fn normalize_l2(v: &Tensor) -> Result<Tensor> {
    Ok(v.broadcast_div(&v.sqr()?.sum_keepdim(1)?.sqrt()?)?)
}

#[async_trait]
impl EmbeddingProvider for BgeEmbedder {
    fn model_name(&self) -> &str {
        DEFAULT_MODEL
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_prefixed("passage: ", texts).await
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_prefixed("query: ", &[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Provider("model returned no vector for query".to_string()))
    }
}
