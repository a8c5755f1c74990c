pub mod ollama;
pub mod traits;
pub mod types;

pub use ollama::OllamaProvider;
pub use traits::InferenceProvider;
pub use types::{
    ChatMessage, ChatRequest, ChatRole, ModelCapabilities, ProviderError, StreamEvent,
};
