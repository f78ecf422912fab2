//! Payload encoding for everything written to a storage backend
//!
//! Values are serialized as JSON and optionally compressed with zlib.
//! Decoding sniffs the payload, so stores holding a mix of plain and
//! compressed entries stay readable after the compression setting changes.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use markup_storage::{StorageBackend, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("compression error: {0}")]
    Compression(#[from] io::Error),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// How payloads are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadCodec {
    #[default]
    Plain,
    Deflate,
}

impl PayloadCodec {
    pub fn encode(self, json: &[u8]) -> CodecResult<Vec<u8>> {
        match self {
            PayloadCodec::Plain => Ok(json.to_vec()),
            PayloadCodec::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(json)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Decode a payload written by any codec
    pub fn decode(data: &[u8]) -> CodecResult<Vec<u8>> {
        if looks_like_json(data) {
            return Ok(data.to_vec());
        }
        let mut json = Vec::new();
        ZlibDecoder::new(data).read_to_end(&mut json)?;
        Ok(json)
    }
}

fn looks_like_json(data: &[u8]) -> bool {
    matches!(data.iter().find(|b| !b.is_ascii_whitespace()), Some(b'{') | Some(b'[') | None)
}

/// Typed view over a raw backend
pub struct CodecStore {
    backend: Arc<dyn StorageBackend>,
    codec: RwLock<PayloadCodec>,
}

impl std::fmt::Debug for CodecStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecStore")
            .field("backend", &self.backend.kind())
            .field("codec", &self.codec())
            .finish()
    }
}

impl CodecStore {
    pub fn new(backend: Arc<dyn StorageBackend>, codec: PayloadCodec) -> Self {
        Self { backend, codec: RwLock::new(codec) }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn codec(&self) -> PayloadCodec {
        *self.codec.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the codec used for subsequent writes
    pub fn set_codec(&self, codec: PayloadCodec) {
        *self.codec.write().unwrap_or_else(PoisonError::into_inner) = codec;
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> CodecResult<()> {
        let json = serde_json::to_vec(value)?;
        let payload = self.codec().encode(&json)?;
        self.backend.save(key, &payload)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> CodecResult<Option<T>> {
        let Some(payload) = self.backend.load(key)? else {
            return Ok(None);
        };
        let json = PayloadCodec::decode(&payload)?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    pub fn remove(&self, key: &str) -> CodecResult<()> {
        Ok(self.backend.delete(key)?)
    }

    /// Keys starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> CodecResult<Vec<String>> {
        Ok(self.backend.list()?.into_iter().filter(|k| k.starts_with(prefix)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use markup_storage::MemoryStore;
    use std::collections::BTreeMap;

    fn sample() -> BTreeMap<String, Vec<u32>> {
        let mut map = BTreeMap::new();
        map.insert("records".to_owned(), (0..200).collect());
        map
    }

    #[test]
    fn test_deflate_is_smaller_and_decodes() {
        let json = serde_json::to_vec(&sample()).unwrap();
        let compressed = PayloadCodec::Deflate.encode(&json).unwrap();
        assert!(compressed.len() < json.len());
        assert_eq!(PayloadCodec::decode(&compressed).unwrap(), json);
    }

    #[test]
    fn test_plain_passes_through() {
        let json = br#"{"a":1}"#;
        assert_eq!(PayloadCodec::Plain.encode(json).unwrap(), json.to_vec());
        assert_eq!(PayloadCodec::decode(b"  {\"a\":1}").unwrap(), b"  {\"a\":1}".to_vec());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(PayloadCodec::decode(b"not a payload").is_err());
    }

    #[test]
    fn test_store_reads_entries_written_with_either_codec() {
        let store = CodecStore::new(Arc::new(MemoryStore::new()), PayloadCodec::Plain);
        store.put("session-plain", &sample()).unwrap();

        store.set_codec(PayloadCodec::Deflate);
        store.put("session-deflate", &sample()).unwrap();

        let plain: Option<BTreeMap<String, Vec<u32>>> = store.get("session-plain").unwrap();
        let deflated: Option<BTreeMap<String, Vec<u32>>> = store.get("session-deflate").unwrap();
        assert_eq!(plain, Some(sample()));
        assert_eq!(deflated, Some(sample()));
        assert_eq!(store.keys_with_prefix("session-").unwrap().len(), 2);
    }

    #[test]
    fn test_missing_key_is_none() {
        let store = CodecStore::new(Arc::new(MemoryStore::new()), PayloadCodec::Plain);
        let value: Option<u32> = store.get("nothing").unwrap();
        assert_eq!(value, None);
    }
}
