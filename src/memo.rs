use std::fmt;

use derive_deref::Deref;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use time::OffsetDateTime;

use crate::ids::{GroupId, MemoId, TempId, UserId};

/// Ordered tag set: insertion order is kept for display, duplicates and blanks are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Tags(Vec<String>);

impl Tags {
    /// Parses a comma separated list like `rust, notes,todo`.
    pub fn parse_list(list: &str) -> Self {
        list.split(',').collect()
    }
}

impl From<Vec<String>> for Tags {
    fn from(raw: Vec<String>) -> Self {
        raw.into_iter().collect()
    }
}

impl From<Tags> for Vec<String> {
    fn from(tags: Tags) -> Self {
        tags.0
    }
}

impl<S: Into<String>> FromIterator<S> for Tags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut tags: Vec<String> = Vec::new();
        for tag in iter {
            let tag = tag.into().trim().to_string();
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Self(tags)
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}

/// Everything a user can edit on a memo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoSnapshot {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default, with = "crate::wire::option_as_str")]
    pub group_id: Option<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memo {
    #[serde(with = "crate::wire::as_str")]
    pub id: MemoId,
    #[serde(flatten)]
    pub snapshot: MemoSnapshot,
    #[serde(with = "crate::wire::as_str")]
    pub author_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Identity of a memo on this client: a draft that has never been stored, or a stored memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoKey {
    Temporary(TempId),
    Persisted(MemoId),
}

impl MemoKey {
    pub fn is_temporary(&self) -> bool {
        matches!(self, MemoKey::Temporary(_))
    }
}

impl fmt::Display for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoKey::Temporary(id) => write!(f, "{id}"),
            MemoKey::Persisted(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Edit,
    Restore,
}

/// Immutable entry of a memo's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoVersion {
    pub memo_id: MemoId,
    pub version: i32,
    pub title: String,
    pub content: String,
    pub tags: Tags,
    pub author_id: UserId,
    pub change_kind: ChangeKind,
    pub created_at: OffsetDateTime,
}
