// ── Conversation: Prompt Assembly ────────────────────────────────────────────
// Pure composition of `system_preamble + personality + system_prompt_suffix +
// memory_block + history_block + new_user_turn` (spec.md §4.3 step 3). Kept
// provider-agnostic and side-effect free so it can be unit tested without a
// network call.

use crate::atoms::types::{AgentSpec, HistoryEntry, Message, Role};

const SYSTEM_PREAMBLE: &str =
    "You are a conversational agent participating in a Discord channel. \
     Keep replies concise and use Discord markdown where it helps.";

/// Builds the ordered message list an `AiProvider::chat` call receives.
/// Priority order is system → memories → history → new turn, so a provider
/// adapter that must truncate for its context window drops oldest history
/// first (spec.md §4.3).
pub fn build_messages(
    spec: &AgentSpec,
    memory_hits: &[String],
    history: &[HistoryEntry],
    new_turn: &str,
) -> Vec<Message> {
    let mut system = SYSTEM_PREAMBLE.to_string();
    if !spec.personality.is_empty() {
        system.push_str("\n\n");
        system.push_str(&spec.personality);
    }
    if !spec.system_prompt_suffix.is_empty() {
        system.push_str("\n\n");
        system.push_str(&spec.system_prompt_suffix);
    }
    if !memory_hits.is_empty() {
        system.push_str("\n\nRelevant memories:\n");
        for hit in memory_hits {
            system.push_str("- ");
            system.push_str(hit);
            system.push('\n');
        }
    }

    let mut messages = vec![Message { role: Role::System, content: system }];
    for entry in history {
        messages.push(Message { role: entry.role, content: entry.content.clone() });
    }
    messages.push(Message { role: Role::User, content: new_turn.to_string() });
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{AgentKind, BehaviorConfig, LlmConfig, ProviderKind};

    fn spec() -> AgentSpec {
        AgentSpec {
            id: "a1".into(),
            kind: AgentKind::Process,
            display_name: "A1".into(),
            personality: "You are cheerful.".into(),
            system_prompt_suffix: "Never discuss politics.".into(),
            llm: LlmConfig { provider: ProviderKind::Anthropic, model: "claude-sonnet-4-6".into(), extra_params: Default::default() },
            discord_token_ref: "TOKEN_A1".into(),
            behavior: BehaviorConfig::default(),
            resources: None,
            auto_deploy: true,
        }
    }

    #[test]
    fn system_message_carries_personality_and_suffix() {
        let messages = build_messages(&spec(), &[], &[], "hello");
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("cheerful"));
        assert!(messages[0].content.contains("Never discuss politics"));
    }

    #[test]
    fn empty_history_still_replies_to_triggering_message() {
        let messages = build_messages(&spec(), &[], &[], "hello");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages.last().unwrap().content, "hello");
    }

    #[test]
    fn memory_hits_appear_before_history() {
        let history = vec![HistoryEntry {
            role: Role::User,
            content: "earlier".into(),
            author_id: "u1".into(),
            timestamp: chrono::Utc::now(),
        }];
        let messages = build_messages(&spec(), &["remembered fact".to_string()], &history, "now");
        assert!(messages[0].content.contains("remembered fact"));
        assert_eq!(messages[1].content, "earlier");
        assert_eq!(messages[2].content, "now");
    }
}
