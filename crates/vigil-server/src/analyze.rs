use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::Stream;
use serde_json::Value;

/// Boxed asynchronous byte stream carrying an uploaded payload.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// One uploaded video waiting to be analyzed.
pub struct UploadRequest {
    pub platform: String,
    pub filename: Option<String>,
    pub payload: ByteStream,
}

/// Transcript-only analysis input. Skips upload handling entirely.
#[derive(Debug, Clone)]
pub struct TranscriptRequest {
    pub platform: String,
    pub transcript: String,
}

/// Capability the HTTP surface delegates to. Implemented by the analysis
/// pipeline; the router only ever sees validated JSON report bodies.
#[async_trait]
pub trait AnalysisProvider: Send + Sync + 'static {
    async fn analyze_upload(&self, request: UploadRequest) -> Result<Value, AnalyzeError>;
    async fn analyze_transcript(&self, request: TranscriptRequest) -> Result<Value, AnalyzeError>;
}

#[derive(Debug, Clone)]
pub struct AnalyzeError {
    pub kind: AnalyzeErrorKind,
    pub message: String,
    pub field: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AnalyzeErrorKind {
    /// Client-supplied input was missing or unusable.
    InvalidParameter,
    /// The pipeline failed; the message is safe to surface as `detail`.
    Failed,
}

impl AnalyzeError {
    pub fn invalid_param(field: impl Into<String>, message: impl Into<String>) -> Self {
        AnalyzeError {
            kind: AnalyzeErrorKind::InvalidParameter,
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        AnalyzeError {
            kind: AnalyzeErrorKind::Failed,
            message: message.into(),
            field: None,
        }
    }
}

impl fmt::Display for AnalyzeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AnalyzeError {}
