//! Zero-shot classification: how well an image matches each of a set of
//! free-text labels, as a probability distribution over the labels.

use serde::Serialize;

use crate::semantic::embeddings::{EmbeddingError, EmbeddingProvider};

/// CLIP's learned logit scale.
const LOGIT_SCALE: f32 = 100.0;

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("at least one label is required")]
    NoLabels,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("label '{label}' embeds to {got} dimensions, the image to {expected}")]
    DimensionMismatch {
        label: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    /// Share of the softmax over all labels, in `[0, 1]`.
    pub probability: f32,
}

/// Score `labels` against the image, keeping the labels' order. Blank labels
/// are dropped.
pub fn classify(
    embedder: &dyn EmbeddingProvider,
    image: &[u8],
    labels: &[String],
) -> Result<Vec<LabelScore>, ClassifyError> {
    let labels: Vec<&str> = labels
        .iter()
        .map(|label| label.trim())
        .filter(|label| !label.is_empty())
        .collect();
    if labels.is_empty() {
        return Err(ClassifyError::NoLabels);
    }

    let image = normalized(embedder.embed_image(image)?);

    let mut logits = Vec::with_capacity(labels.len());
    for label in &labels {
        let text = normalized(embedder.embed_text(label)?);
        if text.len() != image.len() {
            return Err(ClassifyError::DimensionMismatch {
                label: label.to_string(),
                expected: image.len(),
                got: text.len(),
            });
        }
        let cosine: f32 = image.iter().zip(&text).map(|(a, b)| a * b).sum();
        logits.push(LOGIT_SCALE * cosine);
    }

    let probabilities = softmax(&logits);
    log::debug!("classified against {} labels: {probabilities:?}", labels.len());

    Ok(labels
        .into_iter()
        .zip(probabilities)
        .map(|(label, probability)| LabelScore {
            label: label.to_string(),
            probability,
        })
        .collect())
}

/// Unit-length copy; a zero vector stays zero.
fn normalized(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
    vector
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|x| x / sum).collect()
}
