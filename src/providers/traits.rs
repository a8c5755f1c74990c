use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{ChatRequest, ModelCapabilities, ProviderError, StreamEvent};

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Probe what a model supports before chatting with it.
    async fn capabilities(&self, model: &str) -> Result<ModelCapabilities, ProviderError>;

    /// Stream a chat completion, sending each content delta through `tx`.
    /// Terminates the stream with `StreamEvent::Done` on success; transport
    /// or server failures are returned (the caller turns them into an
    /// `Error` event if the stream is already being consumed).
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;
}
