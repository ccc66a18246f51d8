pub mod admission;
pub mod analyze;
pub mod config;
mod server;

pub use admission::{AdmissionController, AdmissionRejection};
pub use analyze::*;
pub use config::*;
pub use server::{DynAnalysisProvider, ServerError, build_router, serve};
