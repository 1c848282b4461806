//! Context window assembly.
//!
//! Decides, for every user turn, exactly which prior messages are sent to
//! the completion endpoint. The window has a fixed shape: stable context
//! first, recency-bounded detail last, never interleaved.
//!
//! 1. synthesized system prompt (only when the bot pins no context prompts)
//! 2. long-term memory recap (when enabled and a summary exists)
//! 3. the bot's pinned context prompts, verbatim and in order
//! 4. recent history, newest-backward under the token budget
//!
//! The `clear_context_index` floor always wins: messages below it are never
//! part of a window, regardless of memory settings.

use crate::llm;
use crate::session::{ChatMessage, ChatSession, ModelConfig, Role};

/// Template applied to plain user input when the bot supplies none.
pub const DEFAULT_INPUT_TEMPLATE: &str = "{{input}}";

const DEFAULT_SYSTEM_TEMPLATE: &str = include_str!("../assets/prompts/system_prompt.md");

const SOURCE_SUMMARIZE_INSTRUCTION: &str =
    "Summarize the following text briefly in 200 words or less:";

// ---------------------------------------------------------------------------
// Template substitution
// ---------------------------------------------------------------------------

fn fill(template: &str, input: &str, model: &str, lang: &str) -> String {
    let mut output = template.to_string();

    // The input placeholder must exist so the user's text is never dropped.
    if !output.contains("{{input}}") {
        output.push_str("\n{{input}}");
    }

    output
        .replace("{{model}}", model)
        .replace("{{time}}", &chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string())
        .replace("{{lang}}", lang)
        .replace("{{input}}", input)
}

/// Render user input through the bot's input template.
pub fn fill_template(input: &str, config: &ModelConfig, lang: &str) -> String {
    let template = config.template.as_deref().unwrap_or(DEFAULT_INPUT_TEMPLATE);
    fill(template, input, &config.model, lang)
}

/// Synthesize the default assistant persona when the bot pins no context.
fn system_prompt(config: &ModelConfig, lang: &str) -> ChatMessage {
    ChatMessage::system(fill(DEFAULT_SYSTEM_TEMPLATE, "", &config.model, lang))
}

/// Single synthetic system message carrying the rolling summary.
pub fn memory_prompt(memory_summary: &str) -> ChatMessage {
    ChatMessage::new(
        Role::Memory,
        format!(
            "This is a summary of the chat history as a recap: {}",
            memory_summary
        ),
    )
}

// ---------------------------------------------------------------------------
// Window assembly
// ---------------------------------------------------------------------------

/// Produce the ordered message window for the next turn.
///
/// The newest message is always collected, even when its own cost exceeds
/// the budget: a submitted turn never ships empty.
pub fn assemble_window(session: &ChatSession, config: &ModelConfig, lang: &str) -> Vec<ChatMessage> {
    let clear_idx = session.clear_context_index.unwrap_or(0);
    let total = session.messages.len();

    let context_prompts = session.bot.context.clone();

    // The default persona only applies when the user pinned no context.
    let inject_system = context_prompts.is_empty();

    let send_memory = config.send_memory
        && !session.memory_summary.is_empty()
        && session.last_summarized_index > clear_idx;

    // Short-term window by count; widen to the summarized boundary when the
    // recap is included so no messages fall in the gap between tiers.
    let short_term_start = total.saturating_sub(config.history_message_count);
    let window_start = if send_memory {
        session.last_summarized_index.min(short_term_start)
    } else {
        short_term_start
    };
    let context_start = clear_idx.max(window_start).min(total);

    let mut window: Vec<ChatMessage> = Vec::new();
    if inject_system {
        window.push(system_prompt(config, lang));
    }
    if send_memory {
        window.push(memory_prompt(&session.memory_summary));
    }
    window.extend(context_prompts);

    // Budget-limited tail scan, newest backward, skipping failed turns.
    let mut recent: Vec<ChatMessage> = Vec::new();
    let mut token_count = 0usize;
    for msg in session.messages[context_start..].iter().rev() {
        if token_count >= config.max_tokens {
            break;
        }
        if msg.is_error {
            continue;
        }
        token_count += msg.estimated_tokens();
        recent.push(msg.clone());
    }
    recent.reverse();
    window.extend(recent);

    window
}

// ---------------------------------------------------------------------------
// Outbound transformation
// ---------------------------------------------------------------------------

/// Rewrite a session message for transmission.
///
/// Externally-sourced content is wrapped in a summarization instruction so
/// raw fetched payloads never enter the model's direct context; url-role
/// context entries carry already-fetched text and go out as assistant
/// messages; memory markers go out as system messages.
pub fn to_request_message(message: &ChatMessage) -> llm::Message {
    match message.role {
        Role::User => {
            if message.source_detail.is_some() {
                llm::Message::user(format!(
                    "{}\n\n{}",
                    SOURCE_SUMMARIZE_INSTRUCTION, message.content
                ))
            } else {
                llm::Message::user(message.content.clone())
            }
        }
        Role::Assistant => llm::Message::assistant(message.content.clone()),
        Role::Url => llm::Message::assistant(message.content.clone()),
        Role::System | Role::Memory => llm::Message::system(message.content.clone()),
    }
}

/// Map a window onto wire messages.
pub fn to_request_messages(messages: &[ChatMessage]) -> Vec<llm::Message> {
    messages.iter().map(to_request_message).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{BotProfile, ChatSession, MimeKind, SourceDetail};

    fn session_with_turns(count: usize) -> ChatSession {
        let mut session = ChatSession::new(BotProfile::new("helper"));
        for i in 0..count {
            let msg = if i % 2 == 0 {
                ChatMessage::user(format!("question {i}"))
            } else {
                ChatMessage::assistant(format!("answer {i}"))
            };
            session.messages.push(msg);
        }
        session
    }

    fn config() -> ModelConfig {
        ModelConfig {
            history_message_count: 4,
            send_memory: false,
            ..Default::default()
        }
    }

    #[test]
    fn injects_system_prompt_and_recent_tail() {
        let session = session_with_turns(10);
        let window = assemble_window(&session, &config(), "en");

        // Synthesized system prompt plus the last 4 messages.
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].role, Role::System);
        assert!(window[0].content.contains("gpt-4o-mini"));
        assert_eq!(window[1].content, "question 6");
        assert_eq!(window[4].content, "answer 9");
    }

    #[test]
    fn pinned_context_suppresses_system_prompt() {
        let mut session = session_with_turns(2);
        session.bot.context = vec![ChatMessage::system("You are a pirate.")];

        let window = assemble_window(&session, &config(), "en");

        assert_eq!(window[0].content, "You are a pirate.");
        assert!(!window.iter().any(|m| m.content.contains("Current model")));
    }

    #[test]
    fn memory_recap_sits_between_system_and_context() {
        let mut session = session_with_turns(10);
        session.bot.context = vec![ChatMessage::system("pinned")];
        session.memory_summary = "User is a Go developer".to_string();
        session.last_summarized_index = 6;

        let cfg = ModelConfig {
            history_message_count: 4,
            send_memory: true,
            ..Default::default()
        };
        let window = assemble_window(&session, &cfg, "en");

        assert_eq!(window[0].role, Role::Memory);
        assert!(window[0].content.contains("User is a Go developer"));
        assert_eq!(window[1].content, "pinned");
    }

    #[test]
    fn memory_excluded_when_summary_below_clear_floor() {
        let mut session = session_with_turns(10);
        session.memory_summary = "old summary".to_string();
        session.last_summarized_index = 3;
        session.clear_context_index = Some(5);

        let cfg = ModelConfig {
            send_memory: true,
            ..Default::default()
        };
        let window = assemble_window(&session, &cfg, "en");

        assert!(!window.iter().any(|m| m.role == Role::Memory));
    }

    #[test]
    fn memory_widens_window_to_summarized_boundary() {
        let mut session = session_with_turns(10);
        session.memory_summary = "summary".to_string();
        session.last_summarized_index = 2;

        let cfg = ModelConfig {
            history_message_count: 4,
            send_memory: true,
            ..Default::default()
        };
        let window = assemble_window(&session, &cfg, "en");

        // window start = min(2, 10 - 4) = 2 → 8 history messages.
        let history: Vec<_> = window.iter().filter(|m| m.role != Role::Memory && m.role != Role::System).collect();
        assert_eq!(history.len(), 8);
        assert_eq!(history[0].content, "question 2");
    }

    #[test]
    fn clear_floor_always_wins() {
        let mut session = session_with_turns(10);
        session.memory_summary = "summary".to_string();
        session.last_summarized_index = 8;
        session.clear_context_index = Some(7);

        let cfg = ModelConfig {
            history_message_count: 8,
            send_memory: true,
            ..Default::default()
        };
        let window = assemble_window(&session, &cfg, "en");

        // No history message before index 7 may appear.
        let history: Vec<_> = window
            .iter()
            .filter(|m| m.role == Role::User || m.role == Role::Assistant)
            .collect();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "answer 7");
    }

    #[test]
    fn error_messages_are_skipped() {
        let mut session = session_with_turns(4);
        session.messages[2].is_error = true;

        let window = assemble_window(&session, &config(), "en");

        assert!(!window.iter().any(|m| m.content == "question 2"));
        assert!(window.iter().any(|m| m.content == "answer 3"));
    }

    #[test]
    fn budget_exhaustion_still_sends_newest() {
        let mut session = session_with_turns(0);
        session
            .messages
            .push(ChatMessage::user("x".repeat(40_000)));
        session
            .messages
            .push(ChatMessage::assistant("y".repeat(40_000)));

        let cfg = ModelConfig {
            max_tokens: 100,
            history_message_count: 10,
            send_memory: false,
            ..Default::default()
        };
        let window = assemble_window(&session, &cfg, "en");

        let history: Vec<_> = window
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        assert_eq!(history.len(), 1);
        assert!(history[0].content.starts_with('y'));
    }

    #[test]
    fn empty_log_yields_prompts_only() {
        let session = ChatSession::new(BotProfile::new("helper"));
        let window = assemble_window(&session, &config(), "en");
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].role, Role::System);
    }

    #[test]
    fn zero_history_count_yields_prompts_only() {
        let session = session_with_turns(6);
        let cfg = ModelConfig {
            history_message_count: 0,
            send_memory: false,
            ..Default::default()
        };
        let window = assemble_window(&session, &cfg, "en");
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].role, Role::System);
    }

    #[test]
    fn fill_template_substitutes_variables() {
        let cfg = ModelConfig {
            template: Some("[{{model}}/{{lang}}] {{input}}".to_string()),
            ..Default::default()
        };
        let rendered = fill_template("hello", &cfg, "en");
        assert_eq!(rendered, "[gpt-4o-mini/en] hello");
    }

    #[test]
    fn fill_template_appends_missing_input_placeholder() {
        let cfg = ModelConfig {
            template: Some("Be terse.".to_string()),
            ..Default::default()
        };
        let rendered = fill_template("hello", &cfg, "en");
        assert_eq!(rendered, "Be terse.\nhello");
    }

    #[test]
    fn source_messages_become_summarize_instructions() {
        let msg = ChatMessage::user("fetched page text").with_source_detail(SourceDetail {
            url: "https://example.com".to_string(),
            byte_size: 17,
            mime_kind: MimeKind::Html,
        });
        let wire = to_request_message(&msg);
        assert_eq!(wire.role, llm::Role::User);
        assert!(wire.content.starts_with("Summarize the following text"));
        assert!(wire.content.ends_with("fetched page text"));
    }

    #[test]
    fn url_context_entries_are_sent_as_assistant() {
        let msg = ChatMessage::new(Role::Url, "page body");
        let wire = to_request_message(&msg);
        assert_eq!(wire.role, llm::Role::Assistant);
        assert_eq!(wire.content, "page body");
    }

    #[test]
    fn memory_marker_is_sent_as_system() {
        let wire = to_request_message(&memory_prompt("the summary"));
        assert_eq!(wire.role, llm::Role::System);
        assert!(wire.content.contains("the summary"));
    }
}
