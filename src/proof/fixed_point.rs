//! Fixed-point encoding of embeddings for the arithmetic circuit.
//!
//! The circuit works on integers, so every component is multiplied by the scale and truncated
//! towards zero. This is the only place where the conversion happens.

use crate::message::Embedding;

/// Scales `value` and truncates it towards zero.
pub fn to_fixed(value: f64, scale: u64) -> i64 {
    (value * scale as f64).trunc() as i64
}

pub fn embedding_to_fixed(embedding: &Embedding, scale: u64) -> Vec<i64> {
    embedding.0.iter().map(|v| to_fixed(*v, scale)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncates_towards_zero() {
        assert_eq!(to_fixed(0.7, 1_000_000), 700_000);
        assert_eq!(to_fixed(0.123_456_789, 1_000_000), 123_456);
        assert_eq!(to_fixed(-0.123_456_789, 1_000_000), -123_456);
        assert_eq!(to_fixed(0.5, 1), 0);
    }

    #[test]
    fn test_embedding_to_fixed() {
        let embedding = Embedding(vec![0.25, -0.031_25, 1.]);
        assert_eq!(embedding_to_fixed(&embedding, 1000), vec![250, -31, 1000]);
    }
}
