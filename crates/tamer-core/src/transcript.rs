use serde::{Deserialize, Serialize};

/// A message in the conversation sent with every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant { content: String },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System { content } | Self::User { content } | Self::Assistant { content } => {
                content
            }
        }
    }
}

/// Committed conversation history.
///
/// Starts with a single system message. User and assistant turns only enter
/// through [`Transcript::push_exchange`], so a failed request can never leave
/// half a turn behind. The educational pair follows the same rule: once
/// queued it is sent with every request, but it is committed only together
/// with the first successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
    educational_seeded: bool,
    pending_educational: Option<[ChatMessage; 2]>,
}

impl Transcript {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt)],
            educational_seeded: false,
            pending_educational: None,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True once the educational pair is part of the committed history.
    pub fn is_educational_seeded(&self) -> bool {
        self.educational_seeded
    }

    /// Queue the instruction/acknowledgment pair for the slot right after
    /// the system message. Returns false when the pair is already committed
    /// or queued.
    pub fn seed_educational(
        &mut self,
        instruction: impl Into<String>,
        acknowledgment: impl Into<String>,
    ) -> bool {
        if self.educational_seeded || self.pending_educational.is_some() {
            return false;
        }
        self.pending_educational = Some([
            ChatMessage::user(instruction),
            ChatMessage::assistant(acknowledgment),
        ]);
        true
    }

    /// Messages for a request: the committed history, any queued
    /// educational pair, and `user_input`, without committing anything.
    pub fn with_pending_user(&self, user_input: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + 3);
        let at = 1.min(self.messages.len());
        messages.extend(self.messages[..at].iter().cloned());
        if let Some(pair) = &self.pending_educational {
            messages.extend(pair.iter().cloned());
        }
        messages.extend(self.messages[at..].iter().cloned());
        messages.push(ChatMessage::user(user_input));
        messages
    }

    pub fn push_exchange(&mut self, user_input: impl Into<String>, reply: impl Into<String>) {
        if let Some(pair) = self.pending_educational.take() {
            let at = 1.min(self.messages.len());
            self.messages.splice(at..at, pair);
            self.educational_seeded = true;
        }
        self.messages.push(ChatMessage::user(user_input));
        self.messages.push(ChatMessage::assistant(reply));
    }

    /// Drop every exchange, keeping the system message and the educational
    /// pair.
    pub fn reset(&mut self) {
        let keep = if self.educational_seeded { 3 } else { 1 };
        self.messages.truncate(keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_serializes_with_role_tag() {
        let value = serde_json::to_value(ChatMessage::user("hi")).expect("serialize");
        assert_eq!(value, serde_json::json!({"role": "user", "content": "hi"}));
        let back: ChatMessage =
            serde_json::from_value(serde_json::json!({"role": "assistant", "content": "yo"}))
                .expect("deserialize");
        assert_eq!(back, ChatMessage::assistant("yo"));
        assert_eq!(back.role(), "assistant");
    }

    #[test]
    fn pending_user_turn_is_not_committed() {
        let transcript = Transcript::new("sys");
        let request = transcript.with_pending_user("question");
        assert_eq!(request.len(), 2);
        assert_eq!(request[1], ChatMessage::user("question"));
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn educational_pair_is_sent_but_committed_with_first_exchange() {
        let mut transcript = Transcript::new("sys");
        assert!(transcript.seed_educational("number blocks", "ok"));
        assert!(!transcript.seed_educational("number blocks", "ok"));
        assert_eq!(transcript.len(), 1);
        assert!(!transcript.is_educational_seeded());

        let request = transcript.with_pending_user("q1");
        let roles: Vec<&str> = request.iter().map(ChatMessage::role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(request[1].content(), "number blocks");
        assert_eq!(transcript.len(), 1);

        transcript.push_exchange("q1", "a1");
        assert!(transcript.is_educational_seeded());
        assert!(!transcript.seed_educational("number blocks", "ok"));
        let roles: Vec<&str> = transcript.messages().iter().map(ChatMessage::role).collect();
        assert_eq!(
            roles,
            vec!["system", "user", "assistant", "user", "assistant"]
        );
        assert_eq!(transcript.messages()[1].content(), "number blocks");
        assert_eq!(transcript.messages()[3].content(), "q1");
        assert_eq!(transcript.with_pending_user("q2").len(), 6);
    }

    #[test]
    fn reset_keeps_system_and_educational_pair() {
        let mut transcript = Transcript::new("sys");
        transcript.seed_educational("number blocks", "ok");
        transcript.push_exchange("q1", "a1");
        transcript.push_exchange("q2", "a2");
        transcript.reset();
        assert_eq!(transcript.len(), 3);
        assert!(transcript.is_educational_seeded());
    }
}
