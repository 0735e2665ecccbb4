// =============================================================================
// Text Encoder — deterministic hash embedding with fallback tracking
// =============================================================================
//
// Only the built-in `hash-v1` encoder ships with this build: SHA-256 of the
// text seeds a counter-mode expansion into the configured number of f32
// lanes, followed by L2 normalisation.  The output is byte-for-byte
// deterministic for a fixed (model, dimension) configuration.
//
// Configuring any other model name selects the same hash encoder as a
// fallback and marks the encoder degraded; the store reports that
// transition exactly once.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};

/// Name of the only embedding model embedded in this build.
pub const NATIVE_MODEL: &str = "hash-v1";

pub struct Encoder {
    model: String,
    dimension: usize,
    /// True when the configured model is not available and the hash
    /// fallback serves in its place.
    fallback: bool,
    /// Set once the fallback transition has been reported.
    fallback_reported: AtomicBool,
}

impl Encoder {
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        let model = model.into();
        let fallback = model != NATIVE_MODEL;
        Self {
            model,
            dimension,
            fallback,
            fallback_reported: AtomicBool::new(false),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the configured model is unavailable and the hash encoder is
    /// serving as a fallback.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Returns true exactly once, on the first call after a fallback
    /// encoder was selected. Drives the one-event-per-transition rule.
    pub fn take_fallback_transition(&self) -> bool {
        self.fallback && !self.fallback_reported.swap(true, Ordering::SeqCst)
    }

    /// Encode `text` into a unit-length vector of the configured dimension.
    pub fn encode(&self, text: &str) -> Vec<f32> {
        let seed = Sha256::digest(text.as_bytes());

        let mut lanes: Vec<f32> = Vec::with_capacity(self.dimension);
        let mut counter: u32 = 0;
        while lanes.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(counter.to_le_bytes());
            let block = hasher.finalize();

            for chunk in block.chunks_exact(4) {
                if lanes.len() == self.dimension {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                lanes.push(raw as f32 / u32::MAX as f32);
            }
            counter += 1;
        }

        // L2-normalise so cosine similarity reduces to a dot product.
        let norm: f32 = lanes.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for lane in &mut lanes {
                *lane /= norm;
            }
        }

        lanes
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .field("fallback", &self.fallback)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_deterministic() {
        let encoder = Encoder::new(NATIVE_MODEL, 384);
        let a = encoder.encode("penny stock momentum breakout");
        let b = encoder.encode("penny stock momentum breakout");
        assert_eq!(a, b);
    }

    #[test]
    fn encode_respects_dimension() {
        for dim in [1, 8, 384, 768] {
            let encoder = Encoder::new(NATIVE_MODEL, dim);
            assert_eq!(encoder.encode("anything").len(), dim);
        }
    }

    #[test]
    fn encode_is_unit_length() {
        let encoder = Encoder::new(NATIVE_MODEL, 384);
        let v = encoder.encode("normalisation check");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn different_texts_differ() {
        let encoder = Encoder::new(NATIVE_MODEL, 64);
        assert_ne!(encoder.encode("alpha"), encoder.encode("beta"));
    }

    #[test]
    fn native_model_is_not_fallback() {
        let encoder = Encoder::new(NATIVE_MODEL, 16);
        assert!(!encoder.is_fallback());
        assert!(!encoder.take_fallback_transition());
    }

    #[test]
    fn unknown_model_reports_fallback_exactly_once() {
        let encoder = Encoder::new("all-MiniLM-L6-v2", 16);
        assert!(encoder.is_fallback());
        assert!(encoder.take_fallback_transition());
        assert!(!encoder.take_fallback_transition());
    }
}
