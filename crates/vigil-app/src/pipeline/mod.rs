//! End-to-end analysis orchestration.
//!
//! The pipeline walks one request through admission-independent stages:
//! fingerprint, cache lookup, policy retrieval, inference, validation, cache
//! store. Any stage may fail; on every failure path the scratch upload file
//! is removed (RAII on the fingerprint handle) and nothing partial reaches
//! the result cache. The cache write happens only after validation succeeds.

pub mod report;
pub mod validate;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use vigil_server::{
    AnalysisProvider, AnalyzeError, ByteStream, TranscriptRequest, UploadRequest,
};

use crate::services::cache::{CacheKey, ResultCache};
use crate::services::fingerprint::{ContentFingerprinter, FingerprintError, digest_bytes};
use crate::services::inference::{InferenceError, InferenceOrchestrator, MediaInput};
use crate::services::retrieval::PolicyRetriever;
use self::report::AnalysisReport;
use self::validate::{ReportParseError, parse_report};

const POLICY_QUESTION: &str = "What are the core community guidelines and safety policies?";
const DEFAULT_DISPLAY_NAME: &str = "upload.mp4";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    MalformedResponse(#[from] ReportParseError),
    #[error("failed to encode analysis report: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct AnalysisPipeline {
    fingerprinter: ContentFingerprinter,
    cache: Arc<dyn ResultCache>,
    retriever: Arc<PolicyRetriever>,
    inference: InferenceOrchestrator,
    cache_ttl: Duration,
}

impl AnalysisPipeline {
    pub fn new(
        fingerprinter: ContentFingerprinter,
        cache: Arc<dyn ResultCache>,
        retriever: Arc<PolicyRetriever>,
        inference: InferenceOrchestrator,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            fingerprinter,
            cache,
            retriever,
            inference,
            cache_ttl,
        }
    }

    async fn run_upload_analysis(
        &self,
        platform: &str,
        filename: Option<&str>,
        payload: ByteStream,
    ) -> Result<Value, PipelineError> {
        let upload = self.fingerprinter.fingerprint(filename, payload).await?;
        tracing::info!(
            platform,
            digest = %upload.digest,
            size_bytes = upload.size_bytes,
            "upload fingerprinted"
        );

        let key = CacheKey::new(platform, upload.digest.clone());
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }

        let context = self.retriever.query(platform, POLICY_QUESTION).await;
        let prompt = compose_video_prompt(platform, &context);
        let display_name = filename.unwrap_or(DEFAULT_DISPLAY_NAME);

        let raw = self
            .inference
            .analyze(
                &prompt,
                Some(MediaInput {
                    path: upload.path(),
                    mime_type: mime_for(filename),
                    display_name,
                }),
            )
            .await?;

        self.validate_and_store(&key, &raw).await
    }

    async fn run_transcript_analysis(
        &self,
        platform: &str,
        transcript: &str,
    ) -> Result<Value, PipelineError> {
        let key = CacheKey::new(platform, digest_bytes(transcript.as_bytes()));
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit);
        }

        let context = self.retriever.query(platform, POLICY_QUESTION).await;
        let prompt = compose_transcript_prompt(platform, &context, transcript);
        let raw = self.inference.analyze(&prompt, None).await?;

        self.validate_and_store(&key, &raw).await
    }

    async fn validate_and_store(
        &self,
        key: &CacheKey,
        raw: &str,
    ) -> Result<Value, PipelineError> {
        let report = match parse_report(raw) {
            Ok(report) => report,
            Err(error) => {
                tracing::warn!(
                    reason = %error.reason,
                    raw = %error.raw,
                    "model response failed validation"
                );
                return Err(error.into());
            }
        };

        let value = serde_json::to_value(&report)?;
        self.cache.put(key, &value, self.cache_ttl).await;
        Ok(value)
    }
}

#[async_trait]
impl AnalysisProvider for AnalysisPipeline {
    async fn analyze_upload(&self, request: UploadRequest) -> Result<Value, AnalyzeError> {
        self.run_upload_analysis(
            &request.platform,
            request.filename.as_deref(),
            request.payload,
        )
        .await
        .map_err(to_analyze_error)
    }

    async fn analyze_transcript(
        &self,
        request: TranscriptRequest,
    ) -> Result<Value, AnalyzeError> {
        self.run_transcript_analysis(&request.platform, &request.transcript)
            .await
            .map_err(to_analyze_error)
    }
}

fn to_analyze_error(error: PipelineError) -> AnalyzeError {
    tracing::error!(error = %error, "analysis pipeline failed");
    AnalyzeError::failed(error.to_string())
}

fn compose_video_prompt(platform: &str, context: &str) -> String {
    let schema = AnalysisReport::schema();
    format!(
        "You are a content compliance expert for {platform}.\n\
         Analyze this video for policy violations based on the following specific policy context:\n\n\
         --- RELEVANT POLICY CONTEXT ---\n\
         {context}\n\
         --- END OF CONTEXT ---\n\n\
         CRITICAL INSTRUCTION: You MUST analyze both the AUDIO (transcript) and the VISUALS (frames).\n\
         Look specifically for:\n\
         - Weapons (guns, knives)\n\
         - Drugs or paraphernalia\n\
         - Violence or physical altercations\n\
         - Text on screen that violates policy\n\n\
         Respond with strict JSON only, conforming to this schema:\n{schema}"
    )
}

fn compose_transcript_prompt(platform: &str, context: &str, transcript: &str) -> String {
    let schema = AnalysisReport::schema();
    format!(
        "You are a content compliance expert for {platform}.\n\
         Analyze this video transcript for policy violations based on the following specific policy context:\n\n\
         --- RELEVANT POLICY CONTEXT ---\n\
         {context}\n\
         --- END OF CONTEXT ---\n\n\
         --- TRANSCRIPT ---\n\
         {transcript}\n\
         --- END OF TRANSCRIPT ---\n\n\
         Respond with strict JSON only, conforming to this schema:\n{schema}"
    )
}

fn mime_for(filename: Option<&str>) -> &'static str {
    let ext = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        _ => "video/mp4",
    }
}
