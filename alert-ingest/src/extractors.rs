//! Request body reading for the webhook handler.
//!
//! Bodies are streamed with a per-chunk timeout so a stalled client cannot
//! hold a worker slot, and the size ceiling is enforced on the bytes actually
//! received as well as after gzip inflation.

use std::io::Read;
use std::time::Duration;

use axum::body::Body;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use futures::StreamExt;
use tracing::warn;

use crate::api::WebhookError;

const METRIC_BODY_READ_TIMEOUT: &str = "webhook_body_read_timeout_total";
const METRIC_BODY_SIZE: &str = "webhook_body_size_bytes";

const GZIP_MAGIC_NUMBERS: [u8; 3] = [0x1f, 0x8b, 8];
const INITIAL_BUFFER_BYTES: usize = 256 * 1024;

/// Extract body bytes from a streaming Body with a per-chunk timeout.
///
/// If no data arrives within `chunk_timeout`, returns
/// `WebhookError::BodyReadTimeout`. Exceeding `payload_size_limit` returns
/// `WebhookError::PayloadTooLarge` without reading further.
pub async fn extract_body_with_timeout(
    body: Body,
    payload_size_limit: usize,
    chunk_timeout: Duration,
    path: &str,
) -> Result<Bytes, WebhookError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::with_capacity(payload_size_limit.min(INITIAL_BUFFER_BYTES));

    loop {
        let chunk = match tokio::time::timeout(chunk_timeout, stream.next()).await {
            Ok(chunk) => chunk,
            Err(_elapsed) => {
                metrics::counter!(METRIC_BODY_READ_TIMEOUT, "path" => path.to_string())
                    .increment(1);
                warn!(
                    path = path,
                    bytes_received = buf.len(),
                    timeout_ms = chunk_timeout.as_millis() as u64,
                    "client stopped sending the request body"
                );
                return Err(WebhookError::BodyReadTimeout);
            }
        };

        match chunk {
            Some(Ok(chunk)) => {
                if buf.len() + chunk.len() > payload_size_limit {
                    return Err(WebhookError::PayloadTooLarge {
                        limit: payload_size_limit,
                    });
                }
                buf.put(chunk);
            }
            Some(Err(e)) => {
                return Err(WebhookError::RequestDecodingError(format!(
                    "error reading request body: {e}"
                )));
            }
            None => break,
        }
    }

    metrics::histogram!(METRIC_BODY_SIZE).record(buf.len() as f64);
    Ok(buf.freeze())
}

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC_NUMBERS)
}

/// Inflate a gzip body, passing anything else through untouched. The
/// inflated size counts against the same ceiling as the raw body.
pub fn inflate_if_gzip(bytes: Bytes, limit: usize) -> Result<Bytes, WebhookError> {
    if !is_gzip(&bytes) {
        return Ok(bytes);
    }

    let mut inflated = Vec::new();
    // Read one byte past the limit to tell "exactly at" from "over"
    let ceiling = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    GzDecoder::new(bytes.as_ref())
        .take(ceiling)
        .read_to_end(&mut inflated)
        .map_err(|e| WebhookError::RequestDecodingError(format!("invalid gzip body: {e}")))?;

    if inflated.len() > limit {
        return Err(WebhookError::PayloadTooLarge { limit });
    }
    Ok(Bytes::from(inflated))
}
