//! Agent payload handling: content-encoding decompression and cheap
//! event-kind discrimination.

use super::batch::BatchError;
use flate2::read::{GzDecoder, ZlibDecoder};
use std::io::Read;

const TRANSACTION_KEY: &[u8] = b"transaction";

/// A raw agent submission as received on the intake endpoint.
///
/// The body is kept opaque; it is decompressed and split into ND-JSON lines
/// only when it is drained into the batch.
#[derive(Debug, Clone, Default)]
pub struct AgentPayload {
    /// Raw request body, possibly compressed.
    pub data: Vec<u8>,
    /// Value of the `Content-Encoding` request header; empty means identity.
    pub content_encoding: String,
}

/// Decompresses `data` according to `content_encoding`.
///
/// Accepted encodings are `gzip`, `deflate` and the empty string (identity).
pub(crate) fn uncompressed(data: &[u8], content_encoding: &str) -> Result<Vec<u8>, BatchError> {
    match content_encoding {
        "" => Ok(data.to_vec()),
        "gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(BatchError::Decompress)?;
            Ok(out)
        }
        "deflate" => {
            let mut out = Vec::new();
            ZlibDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(BatchError::Decompress)?;
            Ok(out)
        }
        other => Err(BatchError::InvalidEncoding(other.to_string())),
    }
}

/// Reports whether an ND-JSON line is a transaction event.
///
/// The first quoted key of the object is compared byte-wise against
/// `transaction`; nothing else is parsed. Malformed input yields `false`.
pub(crate) fn is_transaction_event(body: &[u8]) -> bool {
    let Some(pos) = body.iter().position(|&b| b == b'"' || b == b'\'') else {
        return false;
    };
    body[pos + 1..].starts_with(TRANSACTION_KEY)
}

/// Splits `haystack` at the first newline, returning the part before it and
/// the part after. Without a newline the second half is empty.
pub(crate) fn cut_line(haystack: &[u8]) -> (&[u8], &[u8]) {
    match haystack.iter().position(|&b| b == b'\n') {
        Some(idx) => (&haystack[..idx], &haystack[idx + 1..]),
        None => (haystack, &[]),
    }
}
