//! Feature-hashing embedder.
//!
//! Each lowercase alphanumeric token (and each adjacent token pair) is
//! hashed into one of `dims` buckets with a hash-derived sign, and the
//! result is scaled to unit length. Texts sharing vocabulary land close
//! together, which is enough for local use and tests without a model.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use docrag_core::capabilities::EmbeddingBackend;
use docrag_core::embedding::normalize;
use docrag_core::Result;

pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(model: Option<&str>, dims: usize) -> Self {
        Self {
            model: model.unwrap_or("feature-hash").to_string(),
            dims: dims.max(1),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut vec = vec![0.0f32; self.dims];
        for token in &tokens {
            self.add_feature(&mut vec, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut vec, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        normalize(&mut vec);
        vec
    }

    fn add_feature(&self, vec: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[index] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingBackend for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docrag_core::embedding::cosine_similarity;

    #[test]
    fn test_deterministic_and_unit_length() {
        let e = HashEmbedder::new(None, 64);
        let a = e.embed_one("The quick brown fox");
        assert_eq!(a, e.embed_one("the QUICK brown fox!"));
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let e = HashEmbedder::new(None, 256);
        let doc = e.embed_one("rust borrow checker ownership rules");
        let near = e.embed_one("ownership rules of the borrow checker");
        let far = e.embed_one("banana bread recipe with walnuts");
        assert!(cosine_similarity(&doc, &near) > cosine_similarity(&doc, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let e = HashEmbedder::new(Some("custom"), 8);
        assert_eq!(e.model_name(), "custom");
        assert!(e.embed_one("  ...  ").iter().all(|x| *x == 0.0));
    }
}
