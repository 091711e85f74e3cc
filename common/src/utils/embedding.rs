use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackendKind},
};

/// Turns text into dense vectors comparable with the stored chunk embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError>;
}

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: EmbeddingModel,
        dimension: usize,
    },
}

impl EmbeddingProvider {
    /// Builds the backend named in configuration. FastEmbed weights are loaded on a blocking thread.
    pub async fn from_config(
        config: &AppConfig,
        openai_client: Arc<Client<OpenAIConfig>>,
    ) -> Result<Self, AppError> {
        let provider = match config.embedding_backend {
            EmbeddingBackendKind::OpenAI => Self::new_openai(
                openai_client,
                config
                    .embedding_model
                    .clone()
                    .unwrap_or_else(|| "text-embedding-3-small".to_string()),
                config.embedding_dimensions,
            ),
            EmbeddingBackendKind::FastEmbed => {
                Self::new_fastembed(config.embedding_model.clone(), config.fastembed_cache_dir.clone())
                    .await?
            }
            EmbeddingBackendKind::Hashed => Self::new_hashed(config.embedding_dimensions as usize),
        };

        info!(
            backend = provider.backend_label(),
            dimension = provider.dimension(),
            "Embedding provider ready"
        );
        Ok(provider)
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => *dimension,
            EmbeddingInner::FastEmbed { dimension, .. } => *dimension,
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub fn model_code(&self) -> Option<String> {
        match &self.inner {
            EmbeddingInner::FastEmbed { model_name, .. } => Some(model_name.to_string()),
            EmbeddingInner::OpenAI { model, .. } => Some(model.clone()),
            EmbeddingInner::Hashed { .. } => None,
        }
    }

    pub fn new_openai(client: Arc<Client<OpenAIConfig>>, model: String, dimensions: u32) -> Self {
        Self {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        }
    }

    pub async fn new_fastembed(
        model_override: Option<String>,
        cache_dir: Option<String>,
    ) -> Result<Self, AppError> {
        let model_name = match model_override {
            Some(code) => EmbeddingModel::from_str(&code).map_err(|err| {
                AppError::Validation(format!("unknown fastembed model '{code}': {err}"))
            })?,
            None => EmbeddingModel::default(),
        };

        let mut options =
            TextInitOptions::new(model_name.clone()).with_show_download_progress(false);
        if let Some(dir) = cache_dir {
            options.cache_dir = PathBuf::from(dir);
        }

        let model_for_task = model_name.clone();
        let (model, dimension) = tokio::task::spawn_blocking(move || {
            let model = TextEmbedding::try_new(options).map_err(|err| {
                AppError::InternalError(format!("initialising fastembed text model: {err}"))
            })?;
            let info = EmbeddingModel::get_model_info(&model_for_task).ok_or_else(|| {
                AppError::InternalError(format!("fastembed metadata missing for {model_for_task}"))
            })?;
            Ok::<_, AppError>((model, info.dim))
        })
        .await??;

        Ok(Self {
            inner: EmbeddingInner::FastEmbed {
                model: Arc::new(Mutex::new(model)),
                model_name,
                dimension,
            },
        })
    }

    pub fn new_hashed(dimension: usize) -> Self {
        Self {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(vec![text.to_owned()]).await?;
        if vectors.is_empty() {
            return Err(AppError::LLMParsing(format!(
                "{} backend returned no embedding",
                self.backend_label()
            )));
        }
        Ok(vectors.swap_remove(0))
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect()),
            EmbeddingInner::FastEmbed { model, .. } => {
                let mut guard = model.lock().await;
                guard.embed(texts, None).map_err(|err| {
                    AppError::InternalError(format!("fastembed embedding failed: {err}"))
                })
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts)
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;
                let mut data = response.data;
                data.sort_by_key(|item| item.index);
                let embeddings: Vec<Vec<f32>> =
                    data.into_iter().map(|item| item.embedding).collect();

                debug!(count = embeddings.len(), "OpenAI embeddings received");
                Ok(embeddings)
            }
        }
    }
}

/// Bag-of-words feature hashing, L2 normalized. Deterministic and offline.
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];

    for token in tokens(text) {
        let idx = bucket(&token, dim);
        vector[idx] += 1.0;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}
