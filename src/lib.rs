pub mod config;
pub mod models;
pub mod providers;
pub mod services;

pub use config::AppConfig;
pub use models::{ChatDocument, Conversation, Exchange, Template, TemplateVariable};
pub use providers::{InferenceProvider, OllamaProvider};
pub use services::commands::CommandProcessor;
pub use services::store::SharedStore;
pub use services::worker::{ChatWorker, WorkerError, WorkerRegistry};

use tracing_subscriber::EnvFilter;

/// Install the default tracing subscriber, filtered by `RUST_LOG`.
/// Meant to be called once from the embedding binary's main.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
