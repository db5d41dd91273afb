/*
    binary_stream.rs - Binary payloads over a session stream

    A binary stream is a single session stream of typed items:

        {"type": "start", "mimeType": M, "fileName": F?, "totalSizeBytes": N?}
        {"type": "chunk", "chunk": <hex>}
        {"type": "end"}

    It is finished once an end item follows the start item. Large payloads
    are split into chunks so that transport pieces stay within the
    recommended transaction size.
*/

use super::errors::{ContentError, ContentResult};
use super::session_stream::SessionStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BinaryItem {
    Start(BinaryStreamInfo),
    Chunk { chunk: String },
    End,
}

impl BinaryItem {
    pub fn chunk(bytes: &[u8]) -> Self {
        BinaryItem::Chunk {
            chunk: hex::encode(bytes),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryStreamInfo {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size_bytes: Option<u64>,
}

/// Decoded payload
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryChunks {
    pub info: BinaryStreamInfo,
    pub chunks: Vec<Vec<u8>>,
    pub finished: bool,
}

impl BinaryChunks {
    pub fn total_len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn concat(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinaryStream {
    stream: SessionStream,
}

impl BinaryStream {
    pub fn new(stream: SessionStream) -> Self {
        BinaryStream { stream }
    }

    pub fn stream(&self) -> &SessionStream {
        &self.stream
    }

    fn items(&self) -> ContentResult<Vec<BinaryItem>> {
        let Some(raw) = self.stream.single_stream()? else {
            return Ok(Vec::new());
        };
        raw.iter()
            .map(|item| {
                serde_json::from_value(item.value.clone())
                    .map_err(|e| ContentError::InvalidChange(e.to_string()))
            })
            .collect()
    }

    /// Metadata from the start item
    pub fn info(&self) -> ContentResult<Option<BinaryStreamInfo>> {
        Ok(match self.items()?.into_iter().next() {
            Some(BinaryItem::Start(info)) => Some(info),
            _ => None,
        })
    }

    pub fn is_finished(&self) -> ContentResult<bool> {
        let items = self.items()?;
        Ok(matches!(items.first(), Some(BinaryItem::Start(_)))
            && items.iter().skip(1).any(|item| matches!(item, BinaryItem::End)))
    }

    /// Chunks after the start item, up to the end item
    ///
    /// Returns None when nothing was started, or when the stream is not
    /// finished and `allow_unfinished` is false.
    pub fn get_binary_chunks(&self, allow_unfinished: bool) -> ContentResult<Option<BinaryChunks>> {
        let mut items = self.items()?.into_iter();
        let Some(BinaryItem::Start(info)) = items.next() else {
            return Ok(None);
        };

        let mut chunks = Vec::new();
        let mut finished = false;
        for item in items {
            match item {
                BinaryItem::Chunk { chunk } => chunks.push(
                    hex::decode(&chunk).map_err(|e| ContentError::InvalidChange(e.to_string()))?,
                ),
                BinaryItem::End => {
                    finished = true;
                    break;
                }
                BinaryItem::Start(_) => {
                    return Err(ContentError::InvalidChange("second start item".into()))
                }
            }
        }

        if !finished && !allow_unfinished {
            return Ok(None);
        }
        Ok(Some(BinaryChunks {
            info,
            chunks,
            finished,
        }))
    }
}
