use crate::models::Exchange;
use crate::providers::types::ChatMessage;
use crate::services::commands::{CommandError, CommandProcessor, PromptFlags};

/// Derive a conversation title from its first prompt.
pub fn truncate_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= 50 {
        first_line.to_string()
    } else {
        let head: String = first_line.chars().take(47).collect();
        format!("{head}...")
    }
}

/// Everything one turn needs after re-expanding the conversation history:
/// the message list for the backend, plus the last exchange's expanded text
/// and flags, which decide how the turn proceeds.
pub struct AssembledTurn {
    pub messages: Vec<ChatMessage>,
    pub expanded_prompt: String,
    pub flags: PromptFlags,
}

/// Rebuild the full message list from every exchange. Each user text is
/// re-expanded; exchanges carrying a `/do` directive are control messages
/// and are left out entirely.
pub async fn assemble_messages(
    processor: &CommandProcessor,
    exchanges: &[Exchange],
) -> Result<AssembledTurn, CommandError> {
    let mut messages = Vec::new();
    let mut expanded_prompt = String::new();
    let mut last_flags = PromptFlags::default();

    let count = exchanges.len();
    for (index, exchange) in exchanges.iter().enumerate() {
        let (expanded, flags) = processor.expand(&exchange.user).await?;

        if flags.template_run.is_none() {
            let mut message = ChatMessage::user(expanded.clone());
            message.images = flags.images.clone();
            messages.push(message);
            if !exchange.model.is_empty() {
                messages.push(ChatMessage::assistant(exchange.model.clone()));
            }
        }

        if index + 1 == count {
            expanded_prompt = expanded;
            last_flags = flags;
        }
    }

    Ok(AssembledTurn {
        messages,
        expanded_prompt,
        flags: last_flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::ChatRole;

    #[test]
    fn test_truncate_title_short_text_unchanged() {
        assert_eq!(truncate_title("hello there"), "hello there");
    }

    #[test]
    fn test_truncate_title_uses_first_line() {
        assert_eq!(truncate_title("first line\nsecond line"), "first line");
    }

    #[test]
    fn test_truncate_title_long_text_gets_ellipsis() {
        let long = "a".repeat(60);
        let title = truncate_title(&long);
        assert_eq!(title.chars().count(), 50);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_truncate_title_is_char_boundary_safe() {
        let long = "é".repeat(60);
        let title = truncate_title(&long);
        assert_eq!(title.chars().count(), 50);
    }

    #[tokio::test]
    async fn test_assemble_includes_prior_responses() {
        let exchanges = vec![
            Exchange {
                user: "first question".to_string(),
                model: "first answer".to_string(),
            },
            Exchange::new("second question"),
        ];

        let turn = assemble_messages(&CommandProcessor::new(), &exchanges)
            .await
            .unwrap();
        let roles: Vec<ChatRole> = turn.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::User, ChatRole::Assistant, ChatRole::User]
        );
        assert_eq!(turn.expanded_prompt, "second question");
    }

    #[tokio::test]
    async fn test_assemble_excludes_template_run_exchanges() {
        let exchanges = vec![
            Exchange {
                user: "/do greet -v n Bob".to_string(),
                model: "Now executing template 'greet'".to_string(),
            },
            Exchange {
                user: "Say hi to Bob".to_string(),
                model: "Hi Bob!".to_string(),
            },
            Exchange::new("thanks"),
        ];

        let turn = assemble_messages(&CommandProcessor::new(), &exchanges)
            .await
            .unwrap();
        assert_eq!(turn.messages.len(), 3);
        assert_eq!(turn.messages[0].content, "Say hi to Bob");
    }
}
