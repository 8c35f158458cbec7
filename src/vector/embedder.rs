//! Embedding backend for the vector mirror
//!
//! Two backends: a local ONNX model via fastembed (behind the
//! `local-embeddings` feature) and a no-op used when the feature is off or
//! the model fails to load. The no-op keeps the mirror API alive in
//! degraded form - sync calls do nothing, searches return empty.

/// Embedding vector type. ~1.5KB per 384-dim vector.
pub type Embedding = Vec<f32>;

pub enum EmbeddingBackend {
    /// Mirror disabled: FTS/structured search only.
    NoOp,
    #[cfg(feature = "local-embeddings")]
    Local(fastembed::TextEmbedding),
}

impl EmbeddingBackend {
    /// Build the local backend when compiled in, falling back to NoOp when
    /// the model cannot load. Model load failure is Degraded, not fatal.
    pub fn init() -> Self {
        #[cfg(feature = "local-embeddings")]
        {
            match fastembed::TextEmbedding::try_new(Default::default()) {
                Ok(model) => return Self::Local(model),
                Err(e) => {
                    tracing::warn!("Embedding model load failed, mirror degraded: {}", e);
                }
            }
        }
        Self::NoOp
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Embed a batch of texts. The NoOp backend returns an empty batch.
    pub fn embed(&mut self, texts: Vec<String>) -> anyhow::Result<Vec<Embedding>> {
        match self {
            Self::NoOp => Ok(Vec::new()),
            #[cfg(feature = "local-embeddings")]
            Self::Local(model) => {
                let embeddings = model
                    .embed(texts, None)
                    .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;
                Ok(embeddings)
            }
        }
    }
}

/// Serialize an embedding as little-endian f32 bytes for BLOB storage.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Deserialize a BLOB back into an embedding.
pub fn blob_to_embedding(blob: &[u8]) -> Embedding {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors. Zero for mismatched dimensions
/// or zero-magnitude inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let embedding = vec![0.5f32, -1.25, 3.0];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_embedding(&blob), embedding);
    }

    #[test]
    fn cosine_basics() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0];
        let c = vec![0.0, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn noop_backend_embeds_nothing() {
        let mut backend = EmbeddingBackend::NoOp;
        assert!(!backend.is_enabled());
        assert!(backend.embed(vec!["x".into()]).unwrap().is_empty());
    }
}
