//! Wager Chat
//!
//! Group chat keyed by wager id. Pluggable: the server runs with the
//! in-memory relay or with chat disabled, and nothing in the wager flow
//! depends on either.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::core::time::{unix_now, UnixSeconds};
use crate::wager::events::WagerEvent;
use crate::wager::state::WagerId;

/// Longest accepted message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

/// Messages retained per wager.
pub const DEFAULT_HISTORY: usize = 100;

/// Wager conversations retained before the least recently active is dropped.
pub const DEFAULT_MAX_CONVERSATIONS: usize = 1024;

/// Conversation name for a wager.
pub fn conversation_id(wager_id: WagerId) -> String {
    format!("sweatbet-{}", wager_id)
}

/// Chat errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Message is blank.
    #[error("message is empty")]
    EmptyMessage,
    /// Message exceeds [`MAX_MESSAGE_CHARS`].
    #[error("message is too long")]
    TooLong,
}

/// A chat message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Wager conversation.
    pub wager_id: WagerId,
    /// Sender handle or address.
    pub sender: String,
    /// Body.
    pub text: String,
    /// Unix time.
    pub sent_at: UnixSeconds,
}

impl ChatMessage {
    /// Event form.
    pub fn to_event(&self) -> WagerEvent {
        WagerEvent::ChatPosted {
            wager_id: self.wager_id,
            sender: self.sender.clone(),
            text: self.text.clone(),
            sent_at: self.sent_at,
        }
    }
}

/// Chat backend.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    /// Post a message.
    async fn send(&self, wager_id: WagerId, sender: &str, text: &str) -> Result<ChatMessage, ChatError>;

    /// Up to `limit` most recent messages, oldest first.
    async fn recent(&self, wager_id: WagerId, limit: usize) -> Vec<ChatMessage>;
}

fn validate(text: &str) -> Result<&str, ChatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::TooLong);
    }
    Ok(text)
}

/// In-process relay with bounded history per wager and a bounded number of
/// wagers.
pub struct InMemoryChat {
    history: RwLock<BTreeMap<WagerId, VecDeque<ChatMessage>>>,
    capacity: usize,
    max_conversations: usize,
    events: broadcast::Sender<WagerEvent>,
}

impl InMemoryChat {
    /// Relay publishing into `events`.
    pub fn new(events: broadcast::Sender<WagerEvent>) -> Self {
        Self::with_capacity(events, DEFAULT_HISTORY)
    }

    /// Relay keeping `capacity` messages per wager.
    pub fn with_capacity(events: broadcast::Sender<WagerEvent>, capacity: usize) -> Self {
        Self::with_limits(events, capacity, DEFAULT_MAX_CONVERSATIONS)
    }

    /// Relay keeping `capacity` messages for each of at most
    /// `max_conversations` wagers.
    pub fn with_limits(events: broadcast::Sender<WagerEvent>, capacity: usize, max_conversations: usize) -> Self {
        Self {
            history: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
            max_conversations: max_conversations.max(1),
            events,
        }
    }

    /// Number of wagers with retained history.
    pub async fn conversation_count(&self) -> usize {
        self.history.read().await.len()
    }
}

/// Drop the conversation whose latest message is oldest.
fn evict_stalest(history: &mut BTreeMap<WagerId, VecDeque<ChatMessage>>) {
    let stalest = history
        .iter()
        .min_by_key(|(_, log)| log.back().map_or(0, |m| m.sent_at))
        .map(|(id, _)| *id);
    if let Some(id) = stalest {
        history.remove(&id);
        debug!(conversation = %conversation_id(id), "Dropped idle chat history");
    }
}

#[async_trait]
impl ChatChannel for InMemoryChat {
    async fn send(&self, wager_id: WagerId, sender: &str, text: &str) -> Result<ChatMessage, ChatError> {
        let message = ChatMessage {
            wager_id,
            sender: sender.to_string(),
            text: validate(text)?.to_string(),
            sent_at: unix_now(),
        };

        {
            let mut history = self.history.write().await;
            if !history.contains_key(&wager_id) && history.len() >= self.max_conversations {
                evict_stalest(&mut history);
            }
            let log = history.entry(wager_id).or_default();
            if log.len() == self.capacity {
                log.pop_front();
            }
            log.push_back(message.clone());
        }

        debug!(conversation = %conversation_id(wager_id), sender = %sender, "Chat message");
        let _ = self.events.send(message.to_event());
        Ok(message)
    }

    async fn recent(&self, wager_id: WagerId, limit: usize) -> Vec<ChatMessage> {
        let history = self.history.read().await;
        match history.get(&wager_id) {
            Some(log) => log.iter().skip(log.len().saturating_sub(limit)).cloned().collect(),
            None => Vec::new(),
        }
    }
}

/// Accepts and drops messages.
#[derive(Debug, Default)]
pub struct DisabledChat;

#[async_trait]
impl ChatChannel for DisabledChat {
    async fn send(&self, wager_id: WagerId, sender: &str, text: &str) -> Result<ChatMessage, ChatError> {
        Ok(ChatMessage {
            wager_id,
            sender: sender.to_string(),
            text: validate(text)?.to_string(),
            sent_at: unix_now(),
        })
    }

    async fn recent(&self, _wager_id: WagerId, _limit: usize) -> Vec<ChatMessage> {
        Vec::new()
    }
}
