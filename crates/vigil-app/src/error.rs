//! Application-level error type shared across the binary and services.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::pipeline::PipelineError;
use crate::services::inference::InferenceError;
use vigil_server::ServerError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
