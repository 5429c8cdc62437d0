//! Bounded body ingestion.

use bytes::{Buf, BufMut};
use futures_util::{Stream, StreamExt};

use crate::error_handling::types::CaptureError;

/// Collects the body, failing as soon as more than `limit` bytes arrived.
///
/// `declared` is the `Content-Length`, if any; an oversized declaration is
/// refused before anything is read.
pub async fn read_limited<S, B>(
    body: S,
    limit: usize,
    declared: Option<u64>,
) -> Result<Vec<u8>, CaptureError>
where
    S: Stream<Item = Result<B, warp::Error>> + Send,
    B: Buf + Send,
{
    if let Some(len) = declared {
        if len > limit as u64 {
            return Err(CaptureError::PayloadTooLarge {
                current: len,
                max: limit as u64,
            });
        }
    }

    futures_util::pin_mut!(body);
    let mut buf: Vec<u8> = Vec::with_capacity(declared.unwrap_or(0) as usize);
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| CaptureError::BodyReadFailed(e.to_string()))?;
        let current = buf.len() + chunk.remaining();
        if current > limit {
            return Err(CaptureError::PayloadTooLarge {
                current: current as u64,
                max: limit as u64,
            });
        }
        buf.put(chunk);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, warp::Error>> + Send {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_reads_whole_body() {
        let body = read_limited(chunks(&["foo", "=", "bar"]), 7, None).await.unwrap();
        assert_eq!(body, b"foo=bar");
    }

    #[tokio::test]
    async fn test_empty_body() {
        let body = read_limited(chunks(&[]), 7, Some(0)).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_streamed_overflow() {
        let err = read_limited(chunks(&["foo", "=", "bar!"]), 7, None).await.unwrap_err();
        assert!(matches!(err, CaptureError::PayloadTooLarge { current: 8, max: 7 }));
    }

    #[tokio::test]
    async fn test_rejects_declared_overflow() {
        let err = read_limited(chunks(&["x"]), 7, Some(100)).await.unwrap_err();
        assert!(matches!(err, CaptureError::PayloadTooLarge { current: 100, max: 7 }));
    }
}
