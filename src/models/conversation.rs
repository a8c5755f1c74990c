use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One user prompt and the (possibly still streaming) response to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub user: String,
    pub model: String,
}

impl Exchange {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub model: String,
    pub title: String,
    pub exchanges: Vec<Exchange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
