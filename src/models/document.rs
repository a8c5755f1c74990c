use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Conversation, Template};
use crate::services::conversation::truncate_title;

/// The whole persisted state of the application: the active model plus
/// every conversation and template. Serialized as a single JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub templates: Vec<Template>,
}

impl ChatDocument {
    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn conversation_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    pub fn remove_conversation(&mut self, id: &str) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != id);
        self.conversations.len() != before
    }

    /// Create a conversation titled after its first prompt and return its id.
    /// The prompt itself is not enqueued here; starting the worker is the
    /// caller's move.
    pub fn start_conversation(&mut self, model: &str, first_prompt: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.conversations.insert(
            0,
            Conversation {
                id: id.clone(),
                model: model.to_string(),
                title: truncate_title(first_prompt),
                exchanges: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        );
        id
    }
}
