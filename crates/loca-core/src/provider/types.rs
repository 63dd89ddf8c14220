//! Backend-agnostic request and response shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use loca_db::models::Agent;

/// Output cap used when neither the request nor the agent sets one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Sampling temperature used when neither the request nor the agent sets one.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Conversation role of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        };
        f.write_str(s)
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: model.into(),
            max_tokens: None,
            temperature: None,
            stream: false,
        }
    }

    /// Request for one turn of `agent`: its persona, then `context`, then
    /// `prompt` as the final user message.
    pub fn for_agent(agent: &Agent, context: Option<String>, prompt: &str) -> Self {
        let mut messages = Vec::with_capacity(3);
        if let Some(persona) = agent.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(Message::system(persona));
        }
        if let Some(context) = context {
            messages.push(Message::system(context));
        }
        messages.push(Message::user(prompt));

        let mut request = Self::new(agent.model.clone(), messages);
        request.max_tokens = agent.max_tokens.and_then(|n| u32::try_from(n).ok());
        request.temperature = agent.temperature;
        request
    }

    /// `max_tokens`, or [`DEFAULT_MAX_TOKENS`].
    pub fn max_tokens_or_default(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    /// `temperature`, or [`DEFAULT_TEMPERATURE`].
    pub fn temperature_or_default(&self) -> f64 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    /// Concatenated content of all system messages, if any.
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// All non-system turns, in order.
    pub fn conversation(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }
}

/// Token counts reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Build usage from the two counts; the total is their sum, capped at
    /// `u64::MAX`.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Recompute the total from its parts when both are known.
    ///
    /// A backend that only reports a total (both parts zero) keeps it.
    pub fn normalized(self) -> Self {
        if self.prompt_tokens == 0 && self.completion_tokens == 0 {
            self
        } else {
            Self::new(self.prompt_tokens, self.completion_tokens)
        }
    }
}

/// A completion result in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_is_sum_of_parts() {
        let usage = Usage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);

        let reported = Usage {
            prompt_tokens: 12,
            completion_tokens: 30,
            total_tokens: 7,
        };
        assert_eq!(reported.normalized().total_tokens, 42);
    }

    #[test]
    fn usage_total_saturates_instead_of_overflowing() {
        let usage = Usage::new(u64::MAX, 5);
        assert_eq!(usage.total_tokens, u64::MAX);

        let reported = Usage {
            prompt_tokens: u64::MAX - 1,
            completion_tokens: 2,
            total_tokens: 0,
        };
        assert_eq!(reported.normalized().total_tokens, u64::MAX);
    }

    #[test]
    fn usage_total_only_is_kept() {
        let reported = Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 9,
        };
        assert_eq!(reported.normalized(), reported);
    }

    #[test]
    fn system_prompt_joins_system_messages() {
        let req = CompletionRequest::new(
            "m",
            vec![
                Message::system("persona"),
                Message::system("Context from previous steps:\na: b"),
                Message::user("go"),
            ],
        );
        assert_eq!(
            req.system_prompt().as_deref(),
            Some("persona\n\nContext from previous steps:\na: b")
        );
        assert_eq!(req.conversation().count(), 1);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let req = CompletionRequest::new("m", vec![Message::user("hi")]);
        assert_eq!(req.max_tokens_or_default(), 4096);
        assert!((req.temperature_or_default() - 0.7).abs() < f64::EPSILON);
        assert!(req.system_prompt().is_none());
    }

    #[test]
    fn for_agent_orders_persona_context_prompt() {
        let now = chrono::Utc::now();
        let agent = Agent {
            id: uuid::Uuid::nil(),
            name: "writer".into(),
            provider: loca_db::models::ProviderKind::Claude,
            api_key: "sk-test".into(),
            base_url: None,
            model: "claude-sonnet-4-5".into(),
            max_tokens: Some(512),
            temperature: None,
            system_prompt: Some("You are terse.".into()),
            status: loca_db::models::AgentStatus::Idle,
            created_at: now,
            updated_at: now,
        };

        let req = CompletionRequest::for_agent(&agent, Some("ctx".into()), "go");
        assert_eq!(
            req.messages,
            vec![
                Message::system("You are terse."),
                Message::system("ctx"),
                Message::user("go"),
            ]
        );
        assert_eq!(req.model, "claude-sonnet-4-5");
        assert_eq!(req.max_tokens, Some(512));
        assert_eq!(req.temperature, None);
        assert!(!req.stream);
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("x")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"x"}"#);
    }
}
