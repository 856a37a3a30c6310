use std::path::Path;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{ColloquyError, Result};

/// Text → backbone token ids.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Exclusive upper bound on the ids this tokenizer emits.
    fn vocab_size(&self) -> usize;
}

/// Hugging Face `tokenizer.json`, shipped next to the checkpoint.
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| ColloquyError::ProcessingError(format!("Failed to load tokenizer: {}", e)))?;
        debug!(
            "✓ Tokenizer loaded from {} ({} entries)",
            path.display(),
            inner.get_vocab_size(true)
        );
        Ok(Self { inner })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ColloquyError::ProcessingError(format!("Tokenization failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// One id per UTF-8 byte. Needs no files, so it backs tests and checkpoints
/// trained on raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn vocab_size(&self) -> usize {
        256
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_tokenizer() {
        let ids = ByteTokenizer.encode("Hi é").unwrap();
        assert_eq!(ids, vec![72, 105, 32, 0xC3, 0xA9]);
        assert!(ids.iter().all(|&id| (id as usize) < ByteTokenizer.vocab_size()));
    }

    #[test]
    fn test_missing_tokenizer_file() {
        let err = HfTokenizer::from_file(Path::new("/nonexistent/tokenizer.json"));
        assert!(matches!(err, Err(ColloquyError::ProcessingError(_))));
    }
}
