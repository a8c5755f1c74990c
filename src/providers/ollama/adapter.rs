use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;

use super::models::*;
use super::stream::parse_ndjson_stream;
use crate::providers::traits::InferenceProvider;
use crate::providers::types::{ChatRequest, ModelCapabilities, ProviderError, StreamEvent};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn build_messages(request: &ChatRequest) -> Vec<OllamaMessage> {
        request
            .messages
            .iter()
            .map(|m| OllamaMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
                images: if m.images.is_empty() {
                    None
                } else {
                    Some(m.images.clone())
                },
            })
            .collect()
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<OllamaErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error);
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }
}

#[async_trait]
impl InferenceProvider for OllamaProvider {
    async fn capabilities(&self, model: &str) -> Result<ModelCapabilities, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("/api/show"))
            .json(&OllamaShowRequest {
                model: model.to_string(),
            })
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        let show: OllamaShowResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(ModelCapabilities {
            thinking: show.capabilities.iter().any(|c| c == "thinking"),
        })
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let chat_request = OllamaChatRequest {
            model: request.model.clone(),
            messages: Self::build_messages(&request),
            stream: true,
            think: request.think.then_some(true),
        };

        let response = self
            .client
            .post(self.endpoint("/api/chat"))
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        parse_ndjson_stream(response, tx).await;

        Ok(())
    }
}
