//! Remote multimodal inference.
//!
//! The orchestrator owns one analyze call end to end: upload the media asset,
//! drive its readiness lifecycle (`Pending -> Ready | Failed`) with a bounded
//! poll, submit the composed prompt, and hand back raw model text. It talks to
//! the capability through the `MediaTransport` trait so the poll loop is
//! testable without real sleeps or network.
//!
//! No retries happen here beyond the readiness poll; a whole-call retry is a
//! caller decision and this design makes none.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::io::ReaderStream;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const API_KEY_HEADER: &str = "x-goog-api-key";
const UPLOAD_SESSION_HEADER: &str = "x-goog-upload-url";
const ERROR_BODY_PREVIEW_BYTES: usize = 512;

// The analyzer must be able to *describe* violating material it is asked to
// report on, so generation runs with the blocking thresholds disabled.
const PERMISSIVE_SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("missing GOOGLE_AI_API_KEY or GEMINI_API_KEY environment variable")]
    MissingApiKey,
    #[error("failed to read media for upload: {0}")]
    MediaIo(String),
    #[error("media upload failed: {0}")]
    Upload(String),
    #[error("remote asset `{id}` failed processing upstream")]
    AssetFailed { id: String },
    #[error("remote asset `{id}` was not ready within {waited_secs}s")]
    AssetTimeout { id: String, waited_secs: u64 },
    #[error("model returned an empty response")]
    EmptyResponse,
    #[error("inference quota exceeded; please retry in a minute")]
    QuotaExhausted,
    #[error("upstream inference error: {0}")]
    Upstream(String),
}

/// Readiness lifecycle of media inside the remote capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    Pending,
    Ready,
    Failed,
}

/// Handle to media uploaded into the remote capability. Owned by a single
/// analyze call; never reused across calls, never persisted.
#[derive(Debug, Clone)]
pub struct RemoteAsset {
    pub id: String,
    pub uri: String,
    pub mime_type: String,
    pub state: AssetState,
}

pub struct GenerationInput<'a> {
    pub prompt: &'a str,
    pub asset: Option<&'a RemoteAsset>,
}

/// Wire-level operations against the remote capability.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn upload_media(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteAsset, InferenceError>;

    async fn asset_state(&self, asset: &RemoteAsset) -> Result<AssetState, InferenceError>;

    async fn generate(&self, input: GenerationInput<'_>) -> Result<String, InferenceError>;
}

/// Media to attach to one generation call.
pub struct MediaInput<'a> {
    pub path: &'a Path,
    pub mime_type: &'a str,
    pub display_name: &'a str,
}

#[derive(Clone, bon::Builder)]
pub struct InferenceOrchestrator {
    transport: Arc<dyn MediaTransport>,
    #[builder(default = Duration::from_secs(2))]
    poll_interval: Duration,
    #[builder(default = Duration::from_secs(300))]
    max_wait: Duration,
}

impl InferenceOrchestrator {
    /// Run one inference call: optional upload + readiness wait, then
    /// generation. Returns the raw model text; an empty response is a failure
    /// because a well-formed analysis is never empty.
    pub async fn analyze(
        &self,
        prompt: &str,
        media: Option<MediaInput<'_>>,
    ) -> Result<String, InferenceError> {
        let asset = match media {
            Some(input) => Some(self.upload_and_await_ready(input).await?),
            None => None,
        };

        let raw = self
            .transport
            .generate(GenerationInput {
                prompt,
                asset: asset.as_ref(),
            })
            .await?;

        if raw.trim().is_empty() {
            return Err(InferenceError::EmptyResponse);
        }
        Ok(raw)
    }

    async fn upload_and_await_ready(
        &self,
        input: MediaInput<'_>,
    ) -> Result<RemoteAsset, InferenceError> {
        let mut asset = self
            .transport
            .upload_media(input.path, input.mime_type, input.display_name)
            .await?;
        tracing::info!(asset = %asset.id, "media uploaded; awaiting readiness");

        let deadline = tokio::time::Instant::now() + self.max_wait;
        loop {
            match asset.state {
                AssetState::Ready => {
                    tracing::debug!(asset = %asset.id, "remote asset ready");
                    return Ok(asset);
                }
                AssetState::Failed => {
                    return Err(InferenceError::AssetFailed { id: asset.id });
                }
                AssetState::Pending => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(InferenceError::AssetTimeout {
                    id: asset.id,
                    waited_secs: self.max_wait.as_secs(),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
            asset.state = self.transport.asset_state(&asset).await?;
        }
    }
}

/// Gemini Files + generateContent transport over plain HTTP.
pub struct GeminiTransport {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiTransport {
    pub fn from_env(
        model: impl Into<String>,
        base_url: impl Into<String>,
        generate_timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let api_key = std::env::var("GOOGLE_AI_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| InferenceError::MissingApiKey)?;

        // The generation call gets a hard transport ceiling instead of an
        // unbounded wait.
        let http = Client::builder()
            .timeout(generate_timeout)
            .build()
            .map_err(|e| InferenceError::Upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl MediaTransport for GeminiTransport {
    async fn upload_media(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteAsset, InferenceError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| InferenceError::MediaIo(e.to_string()))?
            .len();

        // Resumable upload: open a session, then stream the bytes in one
        // upload+finalize request so the payload is never buffered.
        let start = self
            .http
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size)
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await
            .map_err(|e| transport_error("upload start", e))?;
        let start = check_status("upload start", start).await?;

        let session_url = start
            .headers()
            .get(UPLOAD_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                InferenceError::Upload("upload session response missing session URL".to_string())
            })?;

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| InferenceError::MediaIo(e.to_string()))?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let finished = self
            .http
            .post(session_url)
            .header(API_KEY_HEADER, &self.api_key)
            .header("Content-Length", size)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("upload finalize", e))?;
        let finished = check_status("upload finalize", finished).await?;

        let payload: Value = finished
            .json()
            .await
            .map_err(|e| InferenceError::Upload(format!("unreadable upload response: {e}")))?;
        let file_info = &payload["file"];
        let id = file_info["name"]
            .as_str()
            .ok_or_else(|| InferenceError::Upload("upload response missing file name".to_string()))?
            .to_string();
        let uri = file_info["uri"]
            .as_str()
            .ok_or_else(|| InferenceError::Upload("upload response missing file URI".to_string()))?
            .to_string();
        let state = parse_file_state(file_info["state"].as_str());

        Ok(RemoteAsset {
            id,
            uri,
            mime_type: mime_type.to_string(),
            state,
        })
    }

    async fn asset_state(&self, asset: &RemoteAsset) -> Result<AssetState, InferenceError> {
        let response = self
            .http
            .get(format!("{}/v1beta/{}", self.base_url, asset.id))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| transport_error("asset poll", e))?;
        let response = check_status("asset poll", response).await?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| InferenceError::Upstream(format!("unreadable asset state: {e}")))?;
        Ok(parse_file_state(payload["state"].as_str()))
    }

    async fn generate(&self, input: GenerationInput<'_>) -> Result<String, InferenceError> {
        let mut parts = vec![json!({ "text": input.prompt })];
        if let Some(asset) = input.asset {
            parts.push(json!({
                "file_data": {
                    "file_uri": asset.uri,
                    "mime_type": asset.mime_type,
                }
            }));
        }

        let safety_settings: Vec<Value> = PERMISSIVE_SAFETY_CATEGORIES
            .iter()
            .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
            .collect();

        let body = json!({
            "contents": [{ "parts": parts }],
            "safetySettings": safety_settings,
            "generationConfig": { "responseMimeType": "application/json" },
        });

        let response = self
            .http
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("generation", e))?;
        let response = check_status("generation", response).await?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| InferenceError::Upstream(format!("unreadable generation response: {e}")))?;

        Ok(extract_text(&payload))
    }
}

fn extract_text(payload: &Value) -> String {
    let mut out = String::new();
    if let Some(parts) = payload["candidates"][0]["content"]["parts"].as_array() {
        for part in parts {
            if let Some(text) = part["text"].as_str() {
                out.push_str(text);
            }
        }
    }
    out
}

fn parse_file_state(state: Option<&str>) -> AssetState {
    match state {
        Some("ACTIVE") => AssetState::Ready,
        Some("FAILED") => AssetState::Failed,
        _ => AssetState::Pending,
    }
}

fn transport_error(stage: &str, error: reqwest::Error) -> InferenceError {
    if error.is_timeout() {
        InferenceError::Upstream(format!("{stage} timed out: {error}"))
    } else {
        InferenceError::Upstream(format!("{stage} request failed: {error}"))
    }
}

/// Classify a non-success status: quota exhaustion is surfaced distinctly so
/// callers can advise "retry later" instead of a generic failure.
async fn check_status(
    stage: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, InferenceError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(InferenceError::QuotaExhausted);
    }
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_PREVIEW_BYTES {
            let mut end = ERROR_BODY_PREVIEW_BYTES;
            while end > 0 && !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        return Err(InferenceError::Upstream(format!(
            "{stage} returned {status}: {body}"
        )));
    }
    Ok(response)
}
