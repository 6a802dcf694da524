//! Chunk protocol: splitting large payloads and reading chunk headers back.

use std::sync::Arc;

use crate::bus::{BusError, Result};
use crate::envelope::{
    Envelope, MessageHeaders, CHUNK_COUNT_HEADER, CHUNK_HEADERS, CHUNK_ID_HEADER,
    CHUNK_INDEX_HEADER, CHUNK_LAST_HEADER, MESSAGE_ID_HEADER,
};

/// Chunk headers of one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub id: String,
    pub index: usize,
    pub count: Option<usize>,
    pub last: bool,
}

impl ChunkInfo {
    /// Read chunk headers. `Ok(None)` when the envelope is not a chunk.
    pub fn from_headers(headers: &MessageHeaders) -> Result<Option<Self>> {
        let Some(id) = headers.get(CHUNK_ID_HEADER) else {
            return Ok(None);
        };
        let index = headers.get_parsed::<usize>(CHUNK_INDEX_HEADER).ok_or_else(|| {
            BusError::SequenceProtocol {
                sequence: id.to_string(),
                message: "missing or malformed chunk index".into(),
            }
        })?;
        let count = match headers.get(CHUNK_COUNT_HEADER) {
            Some(raw) => Some(raw.parse::<usize>().map_err(|_| BusError::SequenceProtocol {
                sequence: id.to_string(),
                message: format!("malformed chunk count '{}'", raw),
            })?),
            None => None,
        };
        let last = headers
            .get(CHUNK_LAST_HEADER)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Ok(Some(Self {
            id: id.to_string(),
            index,
            count,
            last,
        }))
    }
}

/// Split a serialized payload into chunk envelopes addressed to `endpoint`.
///
/// Every chunk keeps the message headers plus the chunk headers; the chunk id
/// is the message id.
pub fn split_into_chunks(
    endpoint: &Arc<str>,
    headers: &MessageHeaders,
    payload: &[u8],
    chunk_size: usize,
) -> Vec<Envelope> {
    let chunk_size = chunk_size.max(1);
    let count = payload.len().div_ceil(chunk_size).max(1);
    let chunk_id = headers.get(MESSAGE_ID_HEADER).unwrap_or_default().to_string();

    let mut chunks: Vec<&[u8]> = payload.chunks(chunk_size).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, part)| {
            let mut chunk_headers = headers
                .clone()
                .with(CHUNK_ID_HEADER, chunk_id.as_str())
                .with(CHUNK_INDEX_HEADER, index.to_string())
                .with(CHUNK_COUNT_HEADER, count.to_string());
            if index + 1 == count {
                chunk_headers.insert(CHUNK_LAST_HEADER, "true");
            }
            Envelope::outbound(Arc::clone(endpoint), chunk_headers, Some(part.to_vec()))
        })
        .collect()
}

/// Join ordered chunk envelopes into one logical envelope covering every
/// chunk offset.
pub(crate) fn reassemble(endpoint: Arc<str>, chunks: &[Envelope]) -> Envelope {
    let mut headers = chunks
        .first()
        .map(|c| c.headers().clone())
        .unwrap_or_default();
    for name in CHUNK_HEADERS {
        headers.remove(name);
    }

    let mut payload = Vec::with_capacity(chunks.iter().filter_map(Envelope::payload).map(<[u8]>::len).sum());
    let mut offsets = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if let Some(part) = chunk.payload() {
            payload.extend_from_slice(part);
        }
        offsets.extend(chunk.offsets());
    }

    Envelope::reassembled(endpoint, headers, payload, offsets)
}
