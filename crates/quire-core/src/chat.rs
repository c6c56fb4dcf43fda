//! Recap and character chat transcripts.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ChatKind {
    Recap,
    Character,
}

impl ChatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatKind::Recap => "recap",
            ChatKind::Character => "character",
        }
    }
}

/// A conversation is about one chapter (recap) or one character.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChatTarget {
    pub kind: ChatKind,
    pub target_id: String,
}

impl ChatTarget {
    pub fn new(kind: ChatKind, target_id: impl Into<String>) -> Self {
        Self {
            kind,
            target_id: target_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ChatStatus {
    #[default]
    Idle,
    Waiting,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChatSnapshot {
    pub target: ChatTarget,
    pub turns: Vec<ChatTurn>,
    pub status: ChatStatus,
}

/// Outgoing chat call: the new message plus trailing history before it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub request_id: u64,
    pub target: ChatTarget,
    pub message: String,
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Default)]
struct Conversation {
    turns: Vec<ChatTurn>,
    status: ChatStatus,
    in_flight: Option<u64>,
    pending_message: Option<String>,
}

pub struct ChatSessions {
    history_turns: usize,
    conversations: HashMap<ChatTarget, Conversation>,
    request_seq: u64,
}

impl ChatSessions {
    pub fn new(history_turns: usize) -> Self {
        Self {
            history_turns,
            conversations: HashMap::new(),
            request_seq: 0,
        }
    }

    pub fn snapshot(&self, target: &ChatTarget) -> ChatSnapshot {
        let (turns, status) = self
            .conversations
            .get(target)
            .map(|c| (c.turns.clone(), c.status))
            .unwrap_or_default();
        ChatSnapshot {
            target: target.clone(),
            turns,
            status,
        }
    }

    pub fn submit(&mut self, target: ChatTarget, text: &str) -> Option<ChatRequest> {
        let message = text.trim();
        if message.is_empty() {
            return None;
        }
        let conversation = self.conversations.entry(target.clone()).or_default();
        if conversation.in_flight.is_some() {
            warn!(kind = target.kind.as_str(), target = %target.target_id, "Chat reply still pending; ignoring message");
            return None;
        }
        let history = trailing(&conversation.turns, self.history_turns);
        conversation.turns.push(ChatTurn {
            role: ChatRole::User,
            text: message.to_string(),
        });
        self.request_seq = self.request_seq.wrapping_add(1);
        let request_id = self.request_seq;
        conversation.in_flight = Some(request_id);
        conversation.pending_message = Some(message.to_string());
        conversation.status = ChatStatus::Waiting;
        Some(ChatRequest {
            request_id,
            target,
            message: message.to_string(),
            history,
        })
    }

    /// Resend the failed message without appending it again.
    pub fn retry(&mut self, target: &ChatTarget) -> Option<ChatRequest> {
        let conversation = self.conversations.get_mut(target)?;
        if conversation.status != ChatStatus::Failed || conversation.in_flight.is_some() {
            return None;
        }
        let message = conversation.pending_message.clone()?;
        let prior = conversation.turns.len().saturating_sub(1);
        let history = trailing(&conversation.turns[..prior], self.history_turns);
        self.request_seq = self.request_seq.wrapping_add(1);
        let request_id = self.request_seq;
        conversation.in_flight = Some(request_id);
        conversation.status = ChatStatus::Waiting;
        debug!(kind = target.kind.as_str(), target = %target.target_id, request_id, "Retrying chat message");
        Some(ChatRequest {
            request_id,
            target: target.clone(),
            message,
            history,
        })
    }

    /// Apply a reply. Returns the target whose transcript changed, or `None`
    /// for a reply nobody is waiting on.
    pub fn on_reply(&mut self, request_id: u64, result: Result<String, ServiceError>) -> Option<ChatTarget> {
        let (target, conversation) = self
            .conversations
            .iter_mut()
            .find(|(_, c)| c.in_flight == Some(request_id))?;
        conversation.in_flight = None;
        match result {
            Ok(reply) => {
                conversation.turns.push(ChatTurn {
                    role: ChatRole::Assistant,
                    text: reply,
                });
                conversation.pending_message = None;
                conversation.status = ChatStatus::Idle;
            }
            Err(err) => {
                warn!(kind = target.kind.as_str(), target = %target.target_id, "Chat request failed: {err}");
                conversation.status = ChatStatus::Failed;
            }
        }
        Some(target.clone())
    }

    /// Forget a transcript; a reply still in flight for it is dropped.
    pub fn reset(&mut self, target: &ChatTarget) {
        self.conversations.remove(target);
    }
}

fn trailing(turns: &[ChatTurn], limit: usize) -> Vec<ChatTurn> {
    turns[turns.len().saturating_sub(limit)..].to_vec()
}
