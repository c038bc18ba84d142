//! Prompt context construction
//!
//! The context for a turn is: the rendered system template, the session's
//! memory prompt, its pinned messages, then history messages from the
//! clear-context boundary to the end. History is trimmed to the token budget from the oldest side; the newest
//! user message is always kept.

use super::config::ChatConfig;
use super::types::{ChatMessage, ChatSession};
use crate::protocol::{RequestMessage, Role};
use chrono::{DateTime, Utc};

/// Rough token count: ASCII letters are a quarter token, other ASCII half a
/// token, anything else one and a half. Monotonic in the input length.
pub fn estimate_tokens(text: &str) -> usize {
    let total: f64 = text
        .chars()
        .map(|c| match c as u32 {
            65..=122 => 0.25,
            0..=127 => 0.5,
            _ => 1.5,
        })
        .sum();
    total.ceil() as usize
}

fn message_tokens(message: &RequestMessage) -> usize {
    estimate_tokens(&message.content)
}

/// Substitute `{{provider}}`, `{{model}}` and `{{time}}`
pub fn render_template(template: &str, config: &ChatConfig, now: DateTime<Utc>) -> String {
    template
        .replace("{{provider}}", &config.provider)
        .replace("{{model}}", &config.model)
        .replace("{{time}}", &now.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

/// Messages to send for one turn, plus what was left out
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub messages: Vec<RequestMessage>,
    pub estimated_tokens: usize,
    /// History messages evicted by the budget or the history cap
    pub evicted: usize,
}

pub fn build_prompt_context(
    session: &ChatSession,
    config: &ChatConfig,
    now: DateTime<Utc>,
) -> PromptContext {
    let mut prefix = Vec::new();
    if config.enable_system_prompt && !config.system_template.trim().is_empty() {
        prefix.push(RequestMessage::new(
            Role::System,
            render_template(&config.system_template, config, now),
        ));
    }
    if !session.memory_prompt.trim().is_empty() {
        prefix.push(RequestMessage::new(
            Role::System,
            format!(
                "This is a summary of the chat history as a recap: {}",
                session.memory_prompt
            ),
        ));
    }
    prefix.extend(session.pinned.iter().map(ChatMessage::to_request));

    let history: Vec<&ChatMessage> = session.messages[session.context_start()..]
        .iter()
        .filter(|m| m.counts_as_context())
        .collect();
    let newest_user = history.iter().rposition(|m| m.role == Role::User);

    let mut used: usize = prefix.iter().map(message_tokens).sum();
    let mut kept = vec![false; history.len()];
    let mut kept_count = 0;
    if let Some(index) = newest_user {
        used += estimate_tokens(&history[index].content);
        kept[index] = true;
        kept_count += 1;
    }

    // newest first; stop at the first message that does not fit so the kept
    // history stays contiguous
    for (index, message) in history.iter().enumerate().rev() {
        if kept[index] {
            continue;
        }
        if kept_count >= config.history_message_count {
            break;
        }
        let tokens = estimate_tokens(&message.content);
        if used + tokens > config.max_context_tokens {
            break;
        }
        used += tokens;
        kept[index] = true;
        kept_count += 1;
    }

    let evicted = history.len() - kept_count;
    let mut messages = prefix;
    messages.extend(
        history
            .iter()
            .zip(kept)
            .filter(|(_, keep)| *keep)
            .map(|(m, _)| m.to_request()),
    );

    PromptContext {
        messages,
        estimated_tokens: used,
        evicted,
    }
}
