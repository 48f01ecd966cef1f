//! Embedding capability and vector math.
//!
//! The navigator only needs two operations: embed a short text and compare
//! vectors by cosine similarity. Production embedders live behind the
//! model-string router of the cognitive stack; tests use the deterministic
//! [`KeywordEmbedder`].

use async_trait::async_trait;

use ruche_domain::error::Result;

/// Text-embedding capability consumed by re-localization scoring.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Cosine similarity between two vectors.
///
/// Returns a value in `[-1.0, 1.0]`. Returns `0.0` for mismatched lengths
/// or zero-magnitude inputs (avoiding division by zero).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        tracing::warn!(
            len_a = a.len(),
            len_b = b.len(),
            "cosine_similarity: mismatched vector lengths, returning 0.0"
        );
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KeywordEmbedder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const KEYWORD_DIMS: usize = 64;

/// Deterministic bag-of-words embedder: each lowercase word hashes into one
/// of 64 dimensions. Similar word sets produce similar vectors, which is
/// enough for navigator and re-localization tests without a model call.
#[derive(Debug, Default, Clone)]
pub struct KeywordEmbedder;

impl KeywordEmbedder {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; KEYWORD_DIMS];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut h: u64 = 0xcbf2_9ce4_8422_2325;
            for b in word.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x1000_0000_01b3);
            }
            v[(h % KEYWORD_DIMS as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![0.5, 0.2, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn mismatched_lengths_score_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn zero_magnitude_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn keyword_embedder_is_deterministic() {
        let e = KeywordEmbedder;
        assert_eq!(e.embed_sync("return my order"), e.embed_sync("return my order"));
    }

    #[test]
    fn similar_texts_score_higher() {
        let e = KeywordEmbedder;
        let base = e.embed_sync("I want to return my order");
        let close = e.embed_sync("return order please");
        let far = e.embed_sync("weather forecast tomorrow sunny");
        assert!(
            cosine_similarity(&base, &close) > cosine_similarity(&base, &far),
            "related text should outscore unrelated text"
        );
    }
}
