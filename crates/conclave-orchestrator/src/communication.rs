//! In-process message channel between the coordinator and its workers
//!
//! Delivery is synchronous and best-effort: a listener that fails is logged and
//! the remaining listeners still receive the message. The channel keeps the
//! most recent messages as history, dropping the oldest past its limit.

use chrono::{DateTime, Utc};
use conclave_core::fail_open::fail_open_sync;
use conclave_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;
use uuid::Uuid;

/// Messages kept in history unless configured otherwise
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Message kinds understood by the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    TaskAssign,
    TaskCompleted,
    TaskFailed,
    WorkerReady,
    Custom(String),
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskAssign => write!(f, "task:assign"),
            Self::TaskCompleted => write!(f, "task:completed"),
            Self::TaskFailed => write!(f, "task:failed"),
            Self::WorkerReady => write!(f, "worker:ready"),
            Self::Custom(kind) => write!(f, "{}", kind),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        match s {
            "task:assign" => Self::TaskAssign,
            "task:completed" => Self::TaskCompleted,
            "task:failed" => Self::TaskFailed,
            "worker:ready" => Self::WorkerReady,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// A message on the channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Sender id
    pub from: String,
    /// Target id; `*` or a trailing-`*` prefix pattern for broadcasts
    pub to: String,
    pub kind: MessageKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self {
            id: format!("msg-{}", Uuid::new_v4()),
            from: from.into(),
            to: to.into(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Check if this message matches a target id
    pub fn matches_target(&self, target: &str) -> bool {
        if self.to == "*" || self.to == target {
            return true;
        }

        // Handle wildcards like agent-*
        if let Some(prefix) = self.to.strip_suffix('*') {
            return target.starts_with(prefix);
        }

        false
    }

    /// String field from the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Subscriber callback
pub type Listener = dyn Fn(&Message) -> Result<()> + Send + Sync;

struct Registration {
    token: u64,
    subscriber_id: String,
    listener: Arc<Listener>,
}

struct ChannelState {
    registrations: Vec<Registration>,
    next_token: u64,
    history: VecDeque<Message>,
    history_limit: usize,
}

/// Handle returned by [`MessageChannel::subscribe`]
pub struct Subscription {
    token: u64,
    state: Weak<Mutex<ChannelState>>,
}

impl Subscription {
    /// Stop receiving messages; returns false if already unsubscribed
    pub fn unsubscribe(&self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.registrations.len();
        state.registrations.retain(|r| r.token != self.token);
        state.registrations.len() != before
    }
}

/// Routes messages between the coordinator and agents
#[derive(Clone)]
pub struct MessageChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Channel that remembers at most `limit` messages
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                registrations: Vec::new(),
                next_token: 0,
                history: VecDeque::new(),
                history_limit: limit,
            })),
        }
    }

    /// Register a listener for messages addressed to `subscriber_id`
    pub fn subscribe<F>(&self, subscriber_id: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Message) -> Result<()> + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let token = state.next_token;
        state.next_token += 1;
        state.registrations.push(Registration {
            token,
            subscriber_id: subscriber_id.into(),
            listener: Arc::new(listener),
        });

        Subscription {
            token,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Send a message to one target (or a wildcard pattern)
    pub fn send(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageKind,
        payload: Value,
    ) -> Message {
        let message = Message::new(from, to, kind, payload);
        self.deliver(&message);
        message
    }

    /// Send a message to every subscriber except the sender
    pub fn broadcast(&self, from: impl Into<String>, kind: MessageKind, payload: Value) -> Message {
        self.send(from, "*", kind, payload)
    }

    /// Recent messages, oldest first
    pub fn history(&self) -> Vec<Message> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().registrations.len()
    }

    fn deliver(&self, message: &Message) {
        debug!(
            "Routing {} from {} to {}",
            message.kind, message.from, message.to
        );

        // Listeners run outside the lock so they may send in turn
        let listeners: Vec<(String, Arc<Listener>)> = {
            let mut state = self.lock();
            state.history.push_back(message.clone());
            while state.history.len() > state.history_limit {
                state.history.pop_front();
            }
            state
                .registrations
                .iter()
                .filter(|r| {
                    message.matches_target(&r.subscriber_id)
                        && !(message.to == "*" && r.subscriber_id == message.from)
                })
                .map(|r| (r.subscriber_id.clone(), Arc::clone(&r.listener)))
                .collect()
        };

        for (subscriber_id, listener) in listeners {
            fail_open_sync(&format!("message delivery to {}", subscriber_id), || {
                listener(message)
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::ConclaveError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(channel: &MessageChannel, id: &str) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let subscription = channel.subscribe(id, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, subscription)
    }

    #[test]
    fn test_message_wildcard_matching() {
        let message = Message::new("coordinator", "agent-*", MessageKind::WorkerReady, json!({}));
        assert!(message.matches_target("agent-1"));
        assert!(message.matches_target("agent-99"));
        assert!(!message.matches_target("coordinator"));
    }

    #[test]
    fn test_send_reaches_only_target() {
        let channel = MessageChannel::new();
        let (a, _sa) = counter(&channel, "a");
        let (b, _sb) = counter(&channel, "b");

        channel.send("x", "a", MessageKind::TaskAssign, json!({"task_id": "t1"}));

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);
        assert_eq!(channel.history().len(), 1);
    }

    #[test]
    fn test_history_keeps_most_recent() {
        let channel = MessageChannel::with_history_limit(3);
        let (a, _sa) = counter(&channel, "a");

        for n in 0..5 {
            let payload = json!({ "task_id": format!("t{}", n) });
            channel.send("x", "a", MessageKind::TaskAssign, payload);
        }

        assert_eq!(a.load(Ordering::SeqCst), 5);
        let ids: Vec<String> = channel
            .history()
            .iter()
            .filter_map(|m| m.payload_str("task_id").map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["t2", "t3", "t4"]);
    }

    #[test]
    fn test_zero_history_limit_still_delivers() {
        let channel = MessageChannel::with_history_limit(0);
        let (a, _sa) = counter(&channel, "a");

        channel.send("x", "a", MessageKind::WorkerReady, Value::Null);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert!(channel.history().is_empty());
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let channel = MessageChannel::new();
        let (a, _sa) = counter(&channel, "a");
        let (b, _sb) = counter(&channel, "b");

        channel.broadcast("a", MessageKind::Custom("status".into()), Value::Null);

        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let channel = MessageChannel::new();
        let _bad = channel.subscribe("a", |_| Err(ConclaveError::Other("listener broke".into())));
        let (a, _sa) = counter(&channel, "a");

        channel.send("x", "a", MessageKind::WorkerReady, Value::Null);
        assert_eq!(a.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let channel = MessageChannel::new();
        let (a, subscription) = counter(&channel, "a");

        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        assert_eq!(channel.subscriber_count(), 0);

        channel.send("x", "a", MessageKind::WorkerReady, Value::Null);
        assert_eq!(a.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_message_kind_round_trips_through_strings() {
        assert_eq!(MessageKind::from("task:completed"), MessageKind::TaskCompleted);
        assert_eq!(MessageKind::TaskFailed.to_string(), "task:failed");
        assert_eq!(
            MessageKind::from("agent:heartbeat"),
            MessageKind::Custom("agent:heartbeat".into())
        );

        let json = serde_json::to_string(&MessageKind::WorkerReady).unwrap();
        assert_eq!(json, "\"worker:ready\"");
    }
}
