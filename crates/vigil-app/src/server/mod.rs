//! Server wiring: construct the pipeline's components and hand them to the
//! HTTP surface. Every process-wide handle (inference transport, result
//! cache, policy retriever) is built here and injected; nothing lives in
//! ambient module state.

use std::sync::Arc;

use vigil_server::{AdmissionController, DynAnalysisProvider};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::pipeline::AnalysisPipeline;
use crate::services::cache;
use crate::services::fingerprint::ContentFingerprinter;
use crate::services::inference::{GeminiTransport, InferenceOrchestrator};
use crate::services::retrieval::PolicyRetriever;

pub async fn serve(config: AppConfig) -> Result<(), AppError> {
    let provider = build_provider(&config).await?;
    let admission = Arc::new(
        AdmissionController::connect(&config.server.admission, config.redis.url.as_deref()).await,
    );

    vigil_server::serve(config.server, provider, admission).await?;
    Ok(())
}

pub async fn build_provider(config: &AppConfig) -> Result<DynAnalysisProvider, AppError> {
    let transport = GeminiTransport::from_env(
        &config.inference.model,
        &config.inference.base_url,
        config.inference.generate_timeout(),
    )?;
    let inference = InferenceOrchestrator::builder()
        .transport(Arc::new(transport))
        .poll_interval(config.inference.poll_interval())
        .max_wait(config.inference.max_wait())
        .build();

    let cache = cache::connect(config.redis.url.as_deref()).await;
    let retriever = Arc::new(PolicyRetriever::new(
        &config.retrieval.docs_dir,
        config.retrieval.top_k,
        config.retrieval.max_context_bytes,
    ));
    let fingerprinter = ContentFingerprinter::new(&config.storage.scratch_dir);

    let pipeline = AnalysisPipeline::new(
        fingerprinter,
        cache,
        retriever,
        inference,
        config.cache.ttl(),
    );

    tracing::info!(
        model = %config.inference.model,
        docs_dir = %config.retrieval.docs_dir.display(),
        "analysis pipeline constructed"
    );

    Ok(Arc::new(pipeline))
}
