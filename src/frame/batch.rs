//! Payload encoding for a batch of confidential transactions.
//!
//! ```text
//! count: u32
//! repeat count times:
//!     len: u32
//!     bytes: [u8; len]
//! ```
//!
//! Used both for peer relay frames and for the engine's streamed batches.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::engine::types::ConfidentialTransaction;
use crate::error::FrameError;

/// Encode a batch into a frame payload.
pub fn encode(txs: &[ConfidentialTransaction], buf: &mut BytesMut) {
    let body: usize = txs.iter().map(|tx| 4 + tx.len()).sum();
    buf.reserve(4 + body);
    buf.put_u32(txs.len() as u32);
    for tx in txs {
        buf.put_u32(tx.len() as u32);
        buf.put_slice(tx.as_bytes());
    }
}

/// Decode a frame payload into a batch. Transactions share the payload's
/// allocation; no bytes are copied.
pub fn decode(mut payload: Bytes) -> Result<Vec<ConfidentialTransaction>, FrameError> {
    if payload.remaining() < 4 {
        return Err(FrameError::MalformedBatch("missing count"));
    }
    let count = payload.get_u32() as usize;

    // Each entry needs at least its length prefix.
    if count > payload.remaining() / 4 {
        return Err(FrameError::MalformedBatch("count exceeds payload"));
    }

    let mut txs = Vec::with_capacity(count);
    for _ in 0..count {
        if payload.remaining() < 4 {
            return Err(FrameError::MalformedBatch("truncated length prefix"));
        }
        let len = payload.get_u32() as usize;
        if payload.remaining() < len {
            return Err(FrameError::MalformedBatch("truncated transaction"));
        }
        txs.push(ConfidentialTransaction::new(payload.split_to(len)));
    }

    if payload.has_remaining() {
        return Err(FrameError::MalformedBatch("trailing bytes"));
    }
    Ok(txs)
}
