// Chunked resumable uploads.
//
// Providers speak slightly different resumable protocols, but the chunk loop is
// the same everywhere: fixed-size chunks, strictly in offset order, each with a
// `Content-Range` header, and the last response carries the file identity. The
// adapters only implement `UploadSession`; this module owns the loop, the
// per-chunk timeout and the bounded retry budget.

use async_trait::async_trait;
use std::time::Duration;

use super::provider::{ProviderAdapter, UploadTarget};
use super::storage_error::GatewayError;
use super::storage_models::{StorageConnection, StoragePointer};

pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Inclusive byte range of one chunk within the whole payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ChunkRange {
    /// Value for the `Content-Range` request header.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }

    pub fn is_last(&self) -> bool {
        self.end + 1 == self.total
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Provider accepted the chunk and wants more.
    Incomplete,
    /// Provider finalized the file.
    Complete(StoragePointer),
}

/// One open provider-side upload session.
#[async_trait]
pub trait UploadSession: Send + Sync {
    async fn put_chunk(&self, range: ChunkRange, chunk: &[u8])
        -> Result<ChunkOutcome, GatewayError>;

    /// Best-effort abort of the provider-side session.
    async fn cancel(&self) -> Result<(), GatewayError>;
}

/// Bounded retry with exponential backoff, applied per chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per chunk, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    pub chunk_size: usize,
    pub chunk_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Drives resumable uploads for any provider.
pub struct ChunkedUploader {
    settings: UploadSettings,
}

impl ChunkedUploader {
    pub fn new(settings: UploadSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Opens a session on `adapter` and streams `payload` into it.
    ///
    /// Either returns the pointer of the finished file or fails as a whole;
    /// on failure the session is cancelled best-effort.
    pub async fn resumable_upload(
        &self,
        adapter: &dyn ProviderAdapter,
        connection: &StorageConnection,
        access_token: &str,
        target: &UploadTarget,
        payload: &[u8],
    ) -> Result<StoragePointer, GatewayError> {
        if payload.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "refusing to upload an empty document".to_string(),
            ));
        }

        let session = adapter
            .open_upload_session(connection, access_token, target)
            .await
            .map_err(as_upload_failure)?;

        tracing::debug!(
            connection_id = %connection.id,
            folder_id = %target.folder_id,
            bytes = payload.len(),
            "Opened resumable upload session"
        );

        self.upload_chunks(session.as_ref(), payload).await
    }

    /// Sends every chunk of `payload` through an already open session.
    pub async fn upload_chunks(
        &self,
        session: &dyn UploadSession,
        payload: &[u8],
    ) -> Result<StoragePointer, GatewayError> {
        if payload.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "refusing to upload an empty document".to_string(),
            ));
        }

        match self.send_all(session, payload).await {
            Ok(pointer) => Ok(pointer),
            Err(e) => {
                if let Err(cancel_err) = session.cancel().await {
                    tracing::warn!("Failed to cancel upload session: {}", cancel_err);
                }
                Err(as_upload_failure(e))
            }
        }
    }

    async fn send_all(
        &self,
        session: &dyn UploadSession,
        payload: &[u8],
    ) -> Result<StoragePointer, GatewayError> {
        let total = payload.len() as u64;
        let chunk_size = self.settings.chunk_size.max(1);

        for (index, chunk) in payload.chunks(chunk_size).enumerate() {
            let start = (index * chunk_size) as u64;
            let range = ChunkRange {
                start,
                end: start + chunk.len() as u64 - 1,
                total,
            };

            match self.send_chunk(session, range, chunk).await? {
                ChunkOutcome::Complete(pointer) if range.is_last() => return Ok(pointer),
                ChunkOutcome::Complete(_) => {
                    return Err(GatewayError::UploadFailed(format!(
                        "provider finalized the file early at {}",
                        range.content_range()
                    )))
                }
                ChunkOutcome::Incomplete if range.is_last() => {
                    return Err(GatewayError::UploadFailed(
                        "provider did not confirm the final chunk".to_string(),
                    ))
                }
                ChunkOutcome::Incomplete => {}
            }
        }

        Err(GatewayError::UploadFailed(
            "upload ended without a final chunk".to_string(),
        ))
    }

    /// One chunk, with the per-chunk timeout and the retry budget.
    async fn send_chunk(
        &self,
        session: &dyn UploadSession,
        range: ChunkRange,
        chunk: &[u8],
    ) -> Result<ChunkOutcome, GatewayError> {
        let retry = self.settings.retry;
        let mut attempt = 1;

        loop {
            let result =
                tokio::time::timeout(self.settings.chunk_timeout, session.put_chunk(range, chunk))
                    .await
                    .unwrap_or_else(|_| {
                        Err(GatewayError::ProviderUnavailable(format!(
                            "chunk {} timed out",
                            range.content_range()
                        )))
                    });

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(GatewayError::ProviderUnavailable(reason)) if attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        range = %range.content_range(),
                        attempt,
                        "Chunk upload failed ({}), retrying in {:?}",
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Upload errors collapse into `UploadFailed`, except `AuthExpired` which the
/// caller must still be able to tell apart.
fn as_upload_failure(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::AuthExpired(_) | GatewayError::UploadFailed(_) => err,
        GatewayError::InvalidRequest(_) => err,
        other => GatewayError::UploadFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::test_support::{sample_pointer, RecordingSession};

    fn uploader(chunk_size: usize, max_attempts: u32) -> ChunkedUploader {
        ChunkedUploader::new(UploadSettings {
            chunk_size,
            chunk_timeout: Duration::from_millis(200),
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
            },
        })
    }

    #[test]
    fn test_content_range_header() {
        let range = ChunkRange {
            start: 0,
            end: 5_242_879,
            total: 12_000_000,
        };
        assert_eq!(range.content_range(), "bytes 0-5242879/12000000");
        assert!(!range.is_last());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_chunks_are_sequential_and_cover_payload() {
        let session = RecordingSession::new(sample_pointer("done"));
        let payload = vec![7u8; 12];

        let pointer = uploader(5, 1)
            .upload_chunks(&session, &payload)
            .await
            .unwrap();

        assert_eq!(pointer.file_id, "done");
        let ranges = session.ranges();
        // ceil(12 / 5) = 3 requests
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].content_range(), "bytes 0-4/12");
        assert_eq!(ranges[1].content_range(), "bytes 5-9/12");
        assert_eq!(ranges[2].content_range(), "bytes 10-11/12");
        assert!(ranges.windows(2).all(|w| w[0].start < w[1].start));
        assert!(!session.was_cancelled());
    }

    #[tokio::test]
    async fn test_exact_multiple_of_chunk_size() {
        let session = RecordingSession::new(sample_pointer("done"));
        uploader(5, 1)
            .upload_chunks(&session, &[1u8; 10])
            .await
            .unwrap();
        assert_eq!(session.ranges().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_chunk_stops_upload_and_cancels() {
        let session = RecordingSession::new(sample_pointer("done")).failing_at(1);

        let err = uploader(5, 2)
            .upload_chunks(&session, &[0u8; 12])
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UploadFailed(_)));
        let starts: Vec<u64> = session.ranges().iter().map(|r| r.start).collect();
        // chunk 1 tried twice, chunk 2 never sent
        assert_eq!(starts, vec![0, 5, 5]);
        assert!(session.was_cancelled());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let session = RecordingSession::new(sample_pointer("done")).transient_failures(1);

        let pointer = uploader(5, 3)
            .upload_chunks(&session, &[0u8; 7])
            .await
            .unwrap();

        assert_eq!(pointer.file_id, "done");
        let starts: Vec<u64> = session.ranges().iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0, 0, 5]);
    }

    #[tokio::test]
    async fn test_chunk_timeout_fails_upload() {
        let session =
            RecordingSession::new(sample_pointer("done")).delayed(Duration::from_millis(500));

        let err = uploader(5, 1)
            .upload_chunks(&session, &[0u8; 3])
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::UploadFailed(_)));
        assert!(session.was_cancelled());
    }

    #[tokio::test]
    async fn test_auth_expired_is_not_flattened() {
        let session = RecordingSession::new(sample_pointer("done")).auth_expired();

        let err = uploader(5, 3)
            .upload_chunks(&session, &[0u8; 3])
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::AuthExpired(_)));
    }

    #[tokio::test]
    async fn test_empty_payload_is_rejected() {
        let session = RecordingSession::new(sample_pointer("done"));
        let err = uploader(5, 1).upload_chunks(&session, &[]).await.unwrap_err();

        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert!(session.ranges().is_empty());
    }
}
