use crate::error::EngineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: 500,
            overlap: 50,
        }
    }
}

impl ChunkingConfig {
    pub fn new(size: usize, overlap: usize) -> Result<Self, EngineError> {
        let config = Self { size, overlap };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.size == 0 {
            return Err(EngineError::InvalidChunkConfig(
                "chunk size must be at least one word".to_string(),
            ));
        }
        if self.overlap >= self.size {
            return Err(EngineError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk size {}",
                self.overlap, self.size
            )));
        }
        Ok(())
    }

    /// Distance in words between the starts of consecutive chunks.
    pub fn stride(&self) -> usize {
        self.size.saturating_sub(self.overlap)
    }

    pub fn expected_chunks(&self, word_count: usize) -> Result<usize, EngineError> {
        self.validate()?;
        Ok(word_count.div_ceil(self.stride()))
    }
}

// The tail window may repeat words already covered by its predecessor.
pub fn chunk_words(text: &str, config: ChunkingConfig) -> Result<Vec<String>, EngineError> {
    config.validate()?;

    let words = text.split_whitespace().collect::<Vec<_>>();
    let chunks = (0..words.len())
        .step_by(config.stride())
        .map(|start| {
            let end = (start + config.size).min(words.len());
            words[start..end].join(" ")
        })
        .collect();

    Ok(chunks)
}

pub fn chunk_key(document_id: &str, version: u32, sequence_index: usize) -> String {
    format!("{document_id}_{version}_{sequence_index}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_on_word_boundaries_without_overlap() {
        let config = ChunkingConfig::new(2, 0).unwrap();
        let chunks = chunk_words("hello world foo bar", config).unwrap();
        assert_eq!(chunks, vec!["hello world", "foo bar"]);
    }

    #[test]
    fn overlapping_windows_repeat_trailing_words() {
        let config = ChunkingConfig::new(3, 1).unwrap();
        let chunks = chunk_words("a b c d e f", config).unwrap();
        assert_eq!(chunks, vec!["a b c", "c d e", "e f"]);
    }

    #[test]
    fn empty_and_blank_text_yield_no_chunks() {
        let config = ChunkingConfig::default();
        assert!(chunk_words("", config).unwrap().is_empty());
        assert!(chunk_words(" \n\t ", config).unwrap().is_empty());
    }

    #[test]
    fn overlap_equal_to_size_fails_fast() {
        let result = chunk_words("a b c", ChunkingConfig { size: 2, overlap: 2 });
        assert!(matches!(result, Err(EngineError::InvalidChunkConfig(_))));
        assert!(ChunkingConfig::new(0, 0).is_err());
    }

    #[test]
    fn expected_chunks_rejects_a_zero_stride() {
        let config = ChunkingConfig { size: 3, overlap: 3 };
        assert_eq!(config.stride(), 0);
        assert!(matches!(
            config.expected_chunks(10),
            Err(EngineError::InvalidChunkConfig(_))
        ));

        let oversized = ChunkingConfig { size: 2, overlap: 5 };
        assert_eq!(oversized.stride(), 0);
        assert!(oversized.expected_chunks(10).is_err());
        assert_eq!(ChunkingConfig::new(3, 1).unwrap().expected_chunks(5).unwrap(), 3);
    }

    #[test]
    fn chunk_keys_separate_versions() {
        assert_ne!(chunk_key("doc", 1, 0), chunk_key("doc", 2, 0));
        assert_eq!(chunk_key("doc", 3, 7), "doc_3_7");
    }

    proptest! {
        #[test]
        fn chunking_is_deterministic(text in "[a-z ]{0,400}", size in 1usize..20, overlap in 0usize..20) {
            prop_assume!(overlap < size);
            let config = ChunkingConfig { size, overlap };
            let first = chunk_words(&text, config).unwrap();
            let second = chunk_words(&text, config).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn chunk_count_follows_stride(words in prop::collection::vec("[a-z]{1,8}", 0..300), size in 1usize..40, overlap in 0usize..40) {
            prop_assume!(overlap < size);
            let config = ChunkingConfig { size, overlap };
            let text = words.join(" ");
            let chunks = chunk_words(&text, config).unwrap();

            prop_assert_eq!(chunks.len(), config.expected_chunks(words.len()).unwrap());
            for (index, chunk) in chunks.iter().enumerate() {
                let chunk_words = chunk.split(' ').collect::<Vec<_>>();
                prop_assert!(chunk_words.len() <= size);
                prop_assert_eq!(chunk_words[0], words[index * config.stride()].as_str());
            }
        }
    }
}
