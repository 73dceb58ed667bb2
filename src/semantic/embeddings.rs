//! Embedding providers.
//!
//! [`EmbeddingProvider`] is the seam the reconciler and the query path depend
//! on; [`ClipEmbedder`] implements it with fastembed's CLIP ViT-B/32 image
//! and text models, which share one embedding space.

use fastembed::{ImageEmbedding, ImageInitOptions, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Mutex;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Unsupported or corrupt image: {0}")]
    InvalidImage(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Turns images and text into vectors of one fixed dimension.
pub trait EmbeddingProvider: Send + Sync {
    /// Identity of the model; snapshots are keyed by it.
    fn model_name(&self) -> &str;

    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// SHA256 hash of the model name for snapshot identification.
    fn model_id_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.model_name().as_bytes());
        hasher.finalize().into()
    }
}

/// Uses a Mutex per model because fastembed's embed() requires &mut self.
pub struct ClipEmbedder {
    image_model: Mutex<ImageEmbedding>,
    text_model: Mutex<TextEmbedding>,
    model_name: String,
}

impl ClipEmbedder {
    /// Load (downloading on first use) the image and text halves of the model.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let (image_enum, text_enum) = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!("Loading image model '{model_name}'");
        let image_model = ImageEmbedding::try_new(
            ImageInitOptions::new(image_enum)
                .with_cache_dir(models_dir.clone())
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        log::info!("Loading text model '{model_name}'");
        let text_model = TextEmbedding::try_new(
            InitOptions::new(text_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        Ok(Self {
            image_model: Mutex::new(image_model),
            text_model: Mutex::new(text_model),
            model_name: model_name.to_string(),
        })
    }

    fn parse_model_name(
        name: &str,
    ) -> Result<(fastembed::ImageEmbeddingModel, fastembed::EmbeddingModel), EmbeddingError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "vit-b/32" | "clipvitb32" => Ok((
                fastembed::ImageEmbeddingModel::ClipVitB32,
                fastembed::EmbeddingModel::ClipVitB32,
            )),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: clip-vit-b-32",
                name
            ))),
        }
    }
}

impl EmbeddingProvider for ClipEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        // reject non-images before they reach the model
        image::guess_format(bytes).map_err(|e| EmbeddingError::InvalidImage(e.to_string()))?;

        let mut model = self.image_model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed_bytes(&[bytes], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.text_model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}
