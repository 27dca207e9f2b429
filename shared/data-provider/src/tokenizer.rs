use crate::DataError;

use anyhow::{anyhow, Result};
use std::path::Path;
use tokenizers::Tokenizer;

/// Text <-> token id conversion shared read-only by readers and units.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, false)
            .map_err(|e| anyhow!("failed to encode {text:?}: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self)
            .decode(ids, true)
            .map_err(|e| anyhow!("failed to decode {ids:?}: {e}"))
    }
}

/// Loads a `tokenizer.json`.
pub fn load_tokenizer(path: impl AsRef<Path>) -> Result<Tokenizer, DataError> {
    let path = path.as_ref();
    Tokenizer::from_file(path).map_err(|e| DataError::Tokenizer {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Maps every UTF-8 byte to its own id. Needs no vocabulary file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes = ids
            .iter()
            .map(|&id| u8::try_from(id).map_err(|_| anyhow!("token id {id} is not a byte")))
            .collect::<Result<Vec<u8>>>()?;
        Ok(String::from_utf8(bytes)?)
    }
}
