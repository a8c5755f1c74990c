pub mod conversation;
pub mod document;
pub mod template;

pub use conversation::{Conversation, Exchange};
pub use document::ChatDocument;
pub use template::{Template, TemplateVariable};
