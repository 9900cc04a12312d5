//! Change notifications between clients.
//!
//! Events travel as JSON frames addressed to one or more [Topic]s. Each client
//! holds one [RealtimeConnection] per sign-in, identified by its own session id,
//! and only sees frames for the topics it has joined.

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

mod connection;
mod hub;
pub use connection::*;
pub use hub::*;

use crate::{
    ids::{GroupId, MemoId, SessionId, UserId},
    memo::Memo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    MemoCreate,
    MemoUpdate,
    MemoDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum Topic {
    User(#[serde(with = "crate::wire::as_str")] UserId),
    Group(#[serde(with = "crate::wire::as_str")] GroupId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub kind: EventKind,
    #[serde(with = "crate::wire::as_str")]
    pub memo_id: MemoId,
    /// Full state after the change; absent for deletes.
    #[serde(default)]
    pub memo: Option<Memo>,
    #[serde(with = "crate::wire::as_str")]
    pub sender_id: UserId,
    #[serde(with = "crate::wire::as_str")]
    pub session_id: SessionId,
    #[serde(default, with = "crate::wire::option_as_str")]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub is_private: bool,
}

impl RealtimeEvent {
    /// The sender's own topic, plus the group's for shared memos.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = vec![Topic::User(self.sender_id)];
        if let Some(group) = self.group_id
            && !self.is_private
        {
            topics.push(Topic::Group(group));
        }
        topics
    }
}

/// What goes over the wire: one event, addressed to every topic it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    topics: Vec<Topic>,
    event: RealtimeEvent,
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("realtime channel is not connected")]
    NotConnected,

    #[error("encoding realtime frame")]
    Encode(#[from] serde_json::Error),
}
