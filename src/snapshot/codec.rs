//! Chunk compression for transfer between generator and applier

use bytes::Bytes;

use super::ChunkData;
use crate::error::Result;

/// A chunk as it travels down the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub index: u32,
    pub rows: u64,
    pub original_len: u64,
    pub compressed: bool,
    pub payload: Bytes,
}

impl EncodedChunk {
    pub fn wire_len(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// LZ4 chunk codec. Payloads that do not shrink are sent as-is.
#[derive(Debug, Clone, Copy)]
pub struct ChunkCodec {
    enabled: bool,
}

impl ChunkCodec {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn encode(&self, chunk: ChunkData) -> EncodedChunk {
        let original_len = chunk.payload.len() as u64;
        if self.enabled {
            let packed = lz4_flex::compress_prepend_size(&chunk.payload);
            if (packed.len() as u64) < original_len {
                return EncodedChunk {
                    index: chunk.index,
                    rows: chunk.rows,
                    original_len,
                    compressed: true,
                    payload: Bytes::from(packed),
                };
            }
        }
        EncodedChunk {
            index: chunk.index,
            rows: chunk.rows,
            original_len,
            compressed: false,
            payload: chunk.payload,
        }
    }

    pub fn decode(&self, chunk: &EncodedChunk) -> Result<ChunkData> {
        let payload = if chunk.compressed {
            Bytes::from(lz4_flex::decompress_size_prepended(&chunk.payload)?)
        } else {
            chunk.payload.clone()
        };
        Ok(ChunkData {
            index: chunk.index,
            rows: chunk.rows,
            payload,
        })
    }
}

/// Render a compression ratio for display
pub fn format_ratio(ratio: Option<f64>) -> String {
    match ratio {
        Some(r) => format!("{:.2}", r),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(payload: &[u8]) -> ChunkData {
        ChunkData {
            index: 7,
            rows: 3,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_repetitive_payload_shrinks() {
        let codec = ChunkCodec::new(true);
        let text = "42\tpending\t2024-05-01 00:00:00+00\n".repeat(200);
        let encoded = codec.encode(chunk(text.as_bytes()));
        assert!(encoded.compressed);
        assert!(encoded.wire_len() < encoded.original_len);

        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded.payload.as_ref(), text.as_bytes());
        assert_eq!(decoded.index, 7);
        assert_eq!(decoded.rows, 3);
    }

    #[test]
    fn test_incompressible_payload_sent_raw() {
        let codec = ChunkCodec::new(true);
        let encoded = codec.encode(chunk(b"a\n"));
        assert!(!encoded.compressed);
        assert_eq!(encoded.wire_len(), 2);
    }

    #[test]
    fn test_disabled_codec_passes_through() {
        let codec = ChunkCodec::new(false);
        let text = "x".repeat(1000);
        let encoded = codec.encode(chunk(text.as_bytes()));
        assert!(!encoded.compressed);
        assert_eq!(encoded.wire_len(), 1000);
    }

    #[test]
    fn test_format_ratio() {
        assert_eq!(format_ratio(Some(0.4213)), "0.42");
        assert_eq!(format_ratio(None), "N/A");
    }
}
