use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::Exchange;
use crate::providers::traits::InferenceProvider;
use crate::providers::types::{ChatRequest, StreamEvent};
use crate::services::commands::{fenced, CommandProcessor};
use crate::services::conversation::assemble_messages;
use crate::services::store::SharedStore;
use crate::services::templates;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("conversation '{0}' already has a worker")]
    Busy(String),
}

/// Live workers keyed by conversation id. Registry membership is the
/// authoritative "busy" signal: collaborators must refuse conversation
/// edits, deletes, and second workers while an entry exists.
#[derive(Default)]
pub struct WorkerRegistry {
    entries: Mutex<HashMap<String, CancellationToken>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(conversation_id)
    }

    /// Ask a running worker to stop. Cancellation is cooperative: the entry
    /// stays until the worker actually exits, so the conversation reads as
    /// busy until then.
    pub fn stop(&self, conversation_id: &str) -> bool {
        match self.entries.lock().unwrap().get(conversation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn register(&self, conversation_id: &str) -> Option<CancellationToken> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(conversation_id) {
            return None;
        }
        let token = CancellationToken::new();
        entries.insert(conversation_id.to_string(), token.clone());
        Some(token)
    }

    fn remove(&self, conversation_id: &str) {
        self.entries.lock().unwrap().remove(conversation_id);
    }
}

enum TurnOutcome {
    Continue,
    /// The conversation was deleted out from under us.
    ConversationGone,
}

/// Background task answering one conversation's queued prompts in order.
pub struct ChatWorker {
    store: SharedStore,
    provider: Arc<dyn InferenceProvider>,
    registry: Arc<WorkerRegistry>,
    processor: CommandProcessor,
    conversation_id: String,
    cancel: CancellationToken,
    queue: VecDeque<String>,
}

impl ChatWorker {
    /// Register and start a worker for `conversation_id`. Refuses to start
    /// while another worker holds the conversation.
    pub fn spawn(
        store: SharedStore,
        provider: Arc<dyn InferenceProvider>,
        registry: Arc<WorkerRegistry>,
        conversation_id: String,
        prompts: Vec<String>,
    ) -> Result<JoinHandle<()>, WorkerError> {
        let cancel = registry
            .register(&conversation_id)
            .ok_or_else(|| WorkerError::Busy(conversation_id.clone()))?;

        let worker = ChatWorker {
            store,
            provider,
            registry,
            processor: CommandProcessor::new(),
            conversation_id,
            cancel,
            queue: prompts.into(),
        };
        Ok(tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        tracing::debug!(conversation = %self.conversation_id, "worker started");

        while let Some(prompt) = self.queue.pop_front() {
            if self.cancel.is_cancelled() {
                tracing::debug!(conversation = %self.conversation_id, "worker stopped");
                break;
            }
            match self.run_turn(prompt).await {
                Ok(TurnOutcome::Continue) => {}
                Ok(TurnOutcome::ConversationGone) => {
                    tracing::warn!(
                        conversation = %self.conversation_id,
                        "conversation deleted while its worker was running"
                    );
                    break;
                }
                Err(err) => {
                    tracing::warn!(conversation = %self.conversation_id, "turn failed: {err}");
                    self.record_error(&err.to_string()).await;
                }
            }
        }

        self.store.persist().await;
        self.registry.remove(&self.conversation_id);
        tracing::debug!(conversation = %self.conversation_id, "worker finished");
    }

    async fn run_turn(&mut self, prompt: String) -> anyhow::Result<TurnOutcome> {
        // Record the exchange and snapshot what the turn needs, then let go
        // of the store before doing any I/O.
        let (model, exchanges, available_templates) = {
            let mut guard = self.store.acquire().await;
            let Some(conversation) = guard.conversation_mut(&self.conversation_id) else {
                return Ok(TurnOutcome::ConversationGone);
            };
            conversation.exchanges.push(Exchange::new(&prompt));
            conversation.updated_at = Utc::now();
            let model = conversation.model.clone();
            let exchanges = conversation.exchanges.clone();
            (model, exchanges, guard.templates.clone())
        };

        let turn = assemble_messages(&self.processor, &exchanges).await?;

        if let Some(help) = turn.flags.help {
            self.write_model(fenced(&help)).await;
            return Ok(TurnOutcome::Continue);
        }

        if turn.flags.show {
            self.write_model(turn.expanded_prompt).await;
            return Ok(TurnOutcome::Continue);
        }

        if let Some(run) = turn.flags.template_run {
            let template = templates::resolve(&available_templates, &run.name)?;
            let rendered = templates::bind(template, &run.variables)?;
            for prompt in rendered.prompts.iter().rev() {
                self.queue.push_front(prompt.clone());
            }
            self.write_model(format!("Now executing template '{}'", rendered.title))
                .await;
            return Ok(TurnOutcome::Continue);
        }

        let capabilities = self.provider.capabilities(&model).await?;
        let request = ChatRequest {
            model,
            messages: turn.messages,
            think: capabilities.thinking,
        };
        self.stream_response(request).await
    }

    async fn stream_response(&self, request: ChatRequest) -> anyhow::Result<TurnOutcome> {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        let provider = self.provider.clone();

        let stream_handle = tokio::spawn(async move {
            if let Err(e) = provider.stream_chat(request, tx.clone()).await {
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            }
        });

        loop {
            tokio::select! {
                // Stop signal wins over a delta that is already waiting
                biased;

                _ = self.cancel.cancelled() => {
                    stream_handle.abort();
                    return Ok(TurnOutcome::Continue);
                }
                event = rx.recv() => {
                    match event {
                        Some(StreamEvent::Token(token)) => {
                            let mut guard = self.store.acquire().await;
                            match guard.conversation_mut(&self.conversation_id) {
                                Some(conversation) => {
                                    if let Some(exchange) = conversation.exchanges.last_mut() {
                                        exchange.model.push_str(&token);
                                    }
                                }
                                None => {
                                    stream_handle.abort();
                                    return Ok(TurnOutcome::ConversationGone);
                                }
                            }
                        }
                        Some(StreamEvent::Done) | None => return Ok(TurnOutcome::Continue),
                        Some(StreamEvent::Error(error)) => anyhow::bail!(error),
                    }
                }
            }
        }
    }

    /// Replace the in-progress exchange's response text.
    async fn write_model(&self, text: String) {
        let mut guard = self.store.acquire().await;
        if let Some(conversation) = guard.conversation_mut(&self.conversation_id) {
            if let Some(exchange) = conversation.exchanges.last_mut() {
                exchange.model = text;
            }
        }
    }

    /// Failures surface inline in the conversation, never to the caller.
    async fn record_error(&self, message: &str) {
        let mut guard = self.store.acquire().await;
        if let Some(conversation) = guard.conversation_mut(&self.conversation_id) {
            if let Some(exchange) = conversation.exchanges.last_mut() {
                if !exchange.model.is_empty() {
                    exchange.model.push('\n');
                }
                exchange.model.push_str(&format!("ERROR: {message}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use crate::models::{Template, TemplateVariable};
    use crate::providers::types::{ModelCapabilities, ProviderError};
    use crate::services::commands::top_help;

    struct ScriptedProvider {
        deltas: Vec<&'static str>,
        fail: bool,
        calls: AtomicUsize,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(deltas: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                deltas,
                fail: false,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                deltas: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl InferenceProvider for ScriptedProvider {
        async fn capabilities(&self, _model: &str) -> Result<ModelCapabilities, ProviderError> {
            Ok(ModelCapabilities::default())
        }

        async fn stream_chat(
            &self,
            request: ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            if self.fail {
                return Err(ProviderError::RequestFailed(
                    "HTTP 404: model not found".to_string(),
                ));
            }
            for delta in &self.deltas {
                let _ = tx.send(StreamEvent::Token(delta.to_string())).await;
            }
            let _ = tx.send(StreamEvent::Done).await;
            Ok(())
        }
    }

    /// Sends one delta, then holds the rest of the stream behind a gate.
    struct GatedProvider {
        gate: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl GatedProvider {
        fn new() -> (Arc<Self>, oneshot::Sender<()>) {
            let (tx, rx) = oneshot::channel();
            (
                Arc::new(Self {
                    gate: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl InferenceProvider for GatedProvider {
        async fn capabilities(&self, _model: &str) -> Result<ModelCapabilities, ProviderError> {
            Ok(ModelCapabilities::default())
        }

        async fn stream_chat(
            &self,
            _request: ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            let _ = tx.send(StreamEvent::Token("A".to_string())).await;
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let _ = tx.send(StreamEvent::Token("B".to_string())).await;
            let _ = tx.send(StreamEvent::Done).await;
            Ok(())
        }
    }

    async fn seed_conversation(store: &SharedStore) -> String {
        let mut guard = store.acquire().await;
        guard.model = Some("test-model".to_string());
        guard.start_conversation("test-model", "seed prompt")
    }

    async fn last_model(store: &SharedStore, id: &str) -> String {
        let guard = store.acquire().await;
        let conversation = guard.conversation(id).expect("conversation exists");
        conversation
            .exchanges
            .last()
            .map(|e| e.model.clone())
            .unwrap_or_default()
    }

    async fn wait_for_model(store: &SharedStore, id: &str, expected: &str) {
        for _ in 0..200 {
            if last_model(store, id).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("model never became {expected:?}");
    }

    #[tokio::test]
    async fn test_help_turn_never_calls_the_backend() {
        let store = SharedStore::in_memory();
        let id = seed_conversation(&store).await;
        let provider = ScriptedProvider::new(vec![]);
        let registry = Arc::new(WorkerRegistry::new());

        let handle = ChatWorker::spawn(
            store.clone(),
            provider.clone(),
            registry.clone(),
            id.clone(),
            vec!["/?".to_string()],
        )
        .unwrap();
        handle.await.unwrap();

        assert_eq!(last_model(&store, &id).await, fenced(top_help()));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(!registry.is_busy(&id));
    }

    #[tokio::test]
    async fn test_streaming_turn_accumulates_deltas() {
        let store = SharedStore::in_memory();
        let id = seed_conversation(&store).await;
        let provider = ScriptedProvider::new(vec!["Hel", "lo", "!"]);
        let registry = Arc::new(WorkerRegistry::new());

        let handle = ChatWorker::spawn(
            store.clone(),
            provider.clone(),
            registry.clone(),
            id.clone(),
            vec!["say hello".to_string()],
        )
        .unwrap();
        handle.await.unwrap();

        assert_eq!(last_model(&store, &id).await, "Hello!");
        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "test-model");
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].content, "say hello");
    }

    #[tokio::test]
    async fn test_show_turn_echoes_expanded_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "file body\n").unwrap();

        let store = SharedStore::in_memory();
        let id = seed_conversation(&store).await;
        let provider = ScriptedProvider::new(vec![]);
        let registry = Arc::new(WorkerRegistry::new());

        let handle = ChatWorker::spawn(
            store.clone(),
            provider.clone(),
            registry.clone(),
            id.clone(),
            vec![format!("/file {} -n", path.display())],
        )
        .unwrap();
        handle.await.unwrap();

        let model = last_model(&store, &id).await;
        assert!(model.contains("file body"));
        assert!(model.starts_with("**"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_template_turn_queues_rendered_prompts() {
        let store = SharedStore::in_memory();
        let id = seed_conversation(&store).await;
        {
            let mut guard = store.acquire().await;
            guard.templates.push(Template {
                id: "tpl-1".to_string(),
                name: Some("greet".to_string()),
                title: "Hi {{n}}".to_string(),
                prompts: vec!["Say hi to {{n}}".to_string()],
                variables: vec![TemplateVariable {
                    name: "n".to_string(),
                    label: None,
                }],
            });
        }

        let provider = ScriptedProvider::new(vec!["Hi Bob!"]);
        let registry = Arc::new(WorkerRegistry::new());

        let handle = ChatWorker::spawn(
            store.clone(),
            provider.clone(),
            registry.clone(),
            id.clone(),
            vec!["/do greet -v n Bob".to_string()],
        )
        .unwrap();
        handle.await.unwrap();

        let guard = store.acquire().await;
        let conversation = guard.conversation(&id).unwrap();
        assert_eq!(conversation.exchanges.len(), 2);
        assert_eq!(
            conversation.exchanges[0].model,
            "Now executing template 'Hi Bob'"
        );
        assert_eq!(conversation.exchanges[1].user, "Say hi to Bob");
        assert_eq!(conversation.exchanges[1].model, "Hi Bob!");
        drop(guard);

        // The /do exchange is a control directive, not chat content
        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].content, "Say hi to Bob");
    }

    #[tokio::test]
    async fn test_unknown_template_surfaces_inline() {
        let store = SharedStore::in_memory();
        let id = seed_conversation(&store).await;
        let provider = ScriptedProvider::new(vec![]);
        let registry = Arc::new(WorkerRegistry::new());

        let handle = ChatWorker::spawn(
            store.clone(),
            provider,
            registry,
            id.clone(),
            vec!["/do nope".to_string()],
        )
        .unwrap();
        handle.await.unwrap();

        let model = last_model(&store, &id).await;
        assert!(model.starts_with("ERROR:"));
        assert!(model.contains("unknown template"));
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_inline() {
        let store = SharedStore::in_memory();
        let id = seed_conversation(&store).await;
        let provider = ScriptedProvider::failing();
        let registry = Arc::new(WorkerRegistry::new());

        let handle = ChatWorker::spawn(
            store.clone(),
            provider,
            registry.clone(),
            id.clone(),
            vec!["hi".to_string()],
        )
        .unwrap();
        handle.await.unwrap();

        let model = last_model(&store, &id).await;
        assert!(model.contains("ERROR:"));
        assert!(model.contains("404"));
        assert!(!registry.is_busy(&id));
    }

    #[tokio::test]
    async fn test_drains_queued_prompts_in_order() {
        let store = SharedStore::in_memory();
        let id = seed_conversation(&store).await;
        let provider = ScriptedProvider::new(vec!["ok"]);
        let registry = Arc::new(WorkerRegistry::new());

        let handle = ChatWorker::spawn(
            store.clone(),
            provider.clone(),
            registry,
            id.clone(),
            vec!["one".to_string(), "two".to_string()],
        )
        .unwrap();
        handle.await.unwrap();

        let guard = store.acquire().await;
        let conversation = guard.conversation(&id).unwrap();
        assert_eq!(conversation.exchanges.len(), 2);
        assert_eq!(conversation.exchanges[0].user, "one");
        assert_eq!(conversation.exchanges[1].user, "two");
        drop(guard);

        // The second request carries the whole history
        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_stop_applies_no_delta_sent_after_the_signal() {
        let store = SharedStore::in_memory();
        let id = seed_conversation(&store).await;
        let (provider, gate) = GatedProvider::new();
        let registry = Arc::new(WorkerRegistry::new());

        let handle = ChatWorker::spawn(
            store.clone(),
            provider,
            registry.clone(),
            id.clone(),
            vec!["hi".to_string()],
        )
        .unwrap();

        wait_for_model(&store, &id, "A").await;
        assert!(registry.is_busy(&id));
        assert!(registry.stop(&id));
        let _ = gate.send(());
        handle.await.unwrap();

        assert_eq!(last_model(&store, &id).await, "A");
        assert!(!registry.is_busy(&id));
    }

    #[tokio::test]
    async fn test_second_worker_is_refused_while_busy() {
        let store = SharedStore::in_memory();
        let id = seed_conversation(&store).await;
        let (provider, gate) = GatedProvider::new();
        let registry = Arc::new(WorkerRegistry::new());

        let handle = ChatWorker::spawn(
            store.clone(),
            provider.clone(),
            registry.clone(),
            id.clone(),
            vec!["hi".to_string()],
        )
        .unwrap();
        wait_for_model(&store, &id, "A").await;

        let second = ChatWorker::spawn(
            store.clone(),
            provider,
            registry.clone(),
            id.clone(),
            vec!["again".to_string()],
        );
        assert!(matches!(second, Err(WorkerError::Busy(_))));

        let _ = gate.send(());
        handle.await.unwrap();
        assert!(!registry.is_busy(&id));
    }
}
