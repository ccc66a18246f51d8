//! Orchestration layer for IO-bound pipeline services.
//!
//! Modules exposed here coordinate external systems (scratch storage, the
//! result cache, the policy snippet store, remote inference). Pure transforms
//! such as report validation live under `crate::pipeline` so concurrency and
//! resource accounting stay localized.

pub mod cache;
pub mod fingerprint;
pub mod inference;
pub mod retrieval;

pub use cache::{CacheKey, DEFAULT_RESULT_TTL, MemoryResultCache, RedisResultCache, ResultCache};
pub use fingerprint::{ContentFingerprinter, FingerprintError, UploadFingerprint, digest_bytes};
pub use inference::{
    AssetState, DEFAULT_BASE_URL, DEFAULT_MODEL, GeminiTransport, GenerationInput, InferenceError,
    InferenceOrchestrator, MediaInput, MediaTransport, RemoteAsset,
};
pub use retrieval::PolicyRetriever;
