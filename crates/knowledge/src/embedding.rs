//! Text embedding backends.
//!
//! The knowledge base treats embedding as an external call that can fail at
//! any time; every caller degrades instead of propagating [`EmbedError`].

use keepsake::tokenize;

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("nothing to embed")]
    EmptyInput,
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
    #[error("embedding backend returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
}

/// Text → fixed-length vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Embed several texts at once. Backends with a native batch call
    /// should override this.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

/// Words that carry no topic and would otherwise dominate short notes.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "at", "be", "by", "for", "from", "i", "in", "is", "it", "me", "my",
    "of", "on", "or", "our", "the", "to", "was", "we", "with",
];

/// Deterministic, offline bag-of-words embedder.
///
/// Each token is hashed (FNV-1a) into one of `dimension` buckets with a
/// hash-derived sign; the vector is L2-normalised. Texts sharing vocabulary
/// land close together, which is exactly what the synonym annotations on
/// stored content rely on.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSION: usize = 384;

    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSION)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut v = vec![0.0f32; self.dimension];
        let mut any = false;
        for token in tokenize(text) {
            if STOP_WORDS.contains(&token.as_str()) {
                continue;
            }
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
            any = true;
        }
        if !any {
            return Err(EmbedError::EmptyInput);
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return Err(EmbedError::EmptyInput);
        }
        v.iter_mut().for_each(|x| *x /= norm);
        Ok(v)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

/// Local sentence embeddings via fastembed (all-MiniLM-L6-v2, 384 dims).
#[cfg(feature = "fastembed")]
pub struct FastEmbedder {
    model: fastembed::TextEmbedding,
}

#[cfg(feature = "fastembed")]
impl FastEmbedder {
    /// Load the model, downloading weights on first use.
    pub fn new() -> Result<Self, EmbedError> {
        let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2);
        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| EmbedError::Unavailable(format!("all-MiniLM-L6-v2: {e}")))?;
        Ok(Self { model })
    }
}

#[cfg(feature = "fastembed")]
impl Embedder for FastEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::EmptyInput);
        }
        let mut out = self.embed_batch(&[text.to_string()])?;
        out.pop().ok_or(EmbedError::CountMismatch {
            expected: 1,
            got: 0,
        })
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self
            .model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
        if vectors.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                expected: texts.len(),
                got: vectors.len(),
            });
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        384
    }

    fn name(&self) -> &str {
        "fastembed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn hashing_is_deterministic_and_normalised() {
        let e = HashingEmbedder::default();
        let a = e.embed("Buy milk and eggs").unwrap();
        let b = e.embed("buy MILK and eggs!").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HashingEmbedder::DEFAULT_DIMENSION);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let e = HashingEmbedder::default();
        let q = e.embed("dentist appointment").unwrap();
        let near = e.embed("dentist appointment on friday").unwrap();
        let far = e.embed("oil change for the car").unwrap();
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[test]
    fn stop_words_only_is_empty_input() {
        let e = HashingEmbedder::default();
        assert!(matches!(e.embed("the and of"), Err(EmbedError::EmptyInput)));
        assert!(matches!(e.embed(""), Err(EmbedError::EmptyInput)));
    }

    #[test]
    fn default_batch_embeds_each_text() {
        let e = HashingEmbedder::new(16);
        let out = e.embed_batch(&["one".into(), "two".into()]).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|v| v.len() == 16));
    }
}
