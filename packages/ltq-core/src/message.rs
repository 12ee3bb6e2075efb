use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::error::BrokerError;

/// Unique identifier of a [`Message`], stable across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Ulid);

impl MessageId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get the inner [`Ulid`].
    pub fn inner(&self) -> Ulid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_str(s)?))
    }
}

/// One unit of work travelling through a broker.
///
/// Everything except `ctx` is immutable after `send`; `ctx` is an open
/// string-keyed bag middlewares use to carry state across attempts, and it
/// round-trips through the broker with the rest of the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable id, assigned at creation.
    pub id: MessageId,
    /// `{queue}:{function}` name the consuming worker dispatches on.
    pub task_name: String,
    /// Positional arguments, already serialized.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments, already serialized.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Cross-attempt middleware state.
    #[serde(default)]
    pub ctx: Map<String, Value>,
    /// Creation instant; never refreshed by retries.
    pub created_at: DateTime<Utc>,
    // The exact payload this message was leased with, if it came out of a
    // broker. Ack/nack remove this member from the in-flight set, so ctx
    // mutations made after the lease cannot orphan the entry.
    #[serde(skip)]
    leased_with: Option<String>,
}

impl Message {
    /// Build a fresh message for `task_name`.
    pub fn new(task_name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            id: MessageId::new(),
            task_name: task_name.into(),
            args,
            kwargs,
            ctx: Map::new(),
            created_at: Utc::now(),
            leased_with: None,
        }
    }

    /// Encode the current state of the message into its wire form.
    pub fn encode(&self) -> Result<String, BrokerError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a message from its wire form, remembering the raw payload as
    /// the lease token.
    pub fn decode(raw: &str) -> Result<Self, BrokerError> {
        let mut message: Message = serde_json::from_str(raw)?;
        message.leased_with = Some(raw.to_owned());
        Ok(message)
    }

    /// The payload this message was leased with, if any.
    pub fn leased_with(&self) -> Option<&str> {
        self.leased_with.as_deref()
    }

    /// Seconds elapsed since the message was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// A copy with a fresh id, fresh `created_at` and empty `ctx`, used by
    /// the scheduler to stamp out new instances of a prototype.
    pub fn restamp(&self) -> Self {
        Self {
            id: MessageId::new(),
            task_name: self.task_name.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            ctx: Map::new(),
            created_at: Utc::now(),
            leased_with: None,
        }
    }
}

impl PartialEq for Message {
    // Lease bookkeeping is transport state, not message identity.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.task_name == other.task_name
            && self.args == other.args
            && self.kwargs == other.kwargs
            && self.ctx == other.ctx
            && self.created_at == other.created_at
    }
}

impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_parses_back() {
        let id = MessageId::new();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn round_trips_every_field() {
        let mut message = Message::new(
            "emails:send_email",
            vec![json!("a@b.c"), json!(42)],
            Map::new(),
        );
        message.ctx.insert("tries".into(), json!(3));

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(message, decoded);
        assert_eq!(decoded.ctx["tries"], json!(3));
        assert!(decoded.leased_with().is_some());
    }

    #[test]
    fn restamp_keeps_payload_resets_identity() {
        let mut prototype = Message::new("q:f", vec![json!(1)], Map::new());
        prototype.ctx.insert("tries".into(), json!(9));

        let stamped = prototype.restamp();
        assert_ne!(stamped.id, prototype.id);
        assert_eq!(stamped.args, prototype.args);
        assert!(stamped.ctx.is_empty());
    }
}
