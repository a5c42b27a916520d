pub mod config;
pub mod documents;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod policy;
pub mod sanitize;
pub mod service;
pub mod streaming;
pub mod tasks;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use service::{AppState, build_router};
pub use workflow::ConsultationPipeline;
