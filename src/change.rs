use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::memo::{MemoSnapshot, Tags};

/// The save-worthy fields. Privacy and group never show up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Title,
    Content,
    Tags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "lowercase")]
pub enum FieldChange {
    Title(String),
    Content(String),
    Tags(Tags),
}

impl FieldChange {
    pub fn field(&self) -> Field {
        match self {
            FieldChange::Title(_) => Field::Title,
            FieldChange::Content(_) => Field::Content,
            FieldChange::Tags(_) => Field::Tags,
        }
    }

    pub fn apply_to(&self, snapshot: &mut MemoSnapshot) {
        match self {
            FieldChange::Title(title) => snapshot.title = title.clone(),
            FieldChange::Content(content) => snapshot.content = content.clone(),
            FieldChange::Tags(tags) => snapshot.tags = tags.clone(),
        }
    }
}

/// Field-level delta between two snapshots, in `Field` declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(Vec<FieldChange>);

impl ChangeSet {
    /// Compares `previous` against `current` on title, content and tags only.
    pub fn between(previous: &MemoSnapshot, current: &MemoSnapshot) -> Self {
        let mut changes = Vec::new();
        if previous.title != current.title {
            changes.push(FieldChange::Title(current.title.clone()));
        }
        if previous.content != current.content {
            changes.push(FieldChange::Content(current.content.clone()));
        }
        // Sequence comparison: reordering tags is a change.
        if previous.tags != current.tags {
            changes.push(FieldChange::Tags(current.tags.clone()));
        }
        Self(changes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.0.iter()
    }

    pub fn fields(&self) -> Vec<Field> {
        self.0.iter().map(FieldChange::field).collect()
    }

    pub fn apply_to(&self, snapshot: &mut MemoSnapshot) {
        for change in &self.0 {
            change.apply_to(snapshot);
        }
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a FieldChange;
    type IntoIter = std::slice::Iter<'a, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
