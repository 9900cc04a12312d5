use diesel::prelude::*;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use super::{StoreError, schema::*};
use crate::{
    change::ChangeSet,
    ids::{GroupId, MemoId, TempId, UserId},
    memo::{ChangeKind, Memo, MemoKey, MemoSnapshot, MemoVersion, Tags},
    version::VersionDiff,
};

#[derive(Debug, Clone)]
pub enum Command {
    CreateMemo {
        temp_id: TempId,
        draft: MemoSnapshot,
        author: UserId,
    },
    UpdateMemo {
        id: MemoId,
        changes: ChangeSet,
        base_updated_at: OffsetDateTime,
        actor: UserId,
    },
    UpdateSettings {
        id: MemoId,
        is_private: bool,
        group_id: Option<GroupId>,
    },
    DeleteMemo(MemoId),
    LoadMemo(MemoId),
    ListMemos {
        author: UserId,
    },
    ListVersions(MemoId),
    RestoreVersion {
        id: MemoId,
        version: i32,
        actor: UserId,
    },
    DiffVersions {
        id: MemoId,
        from: i32,
        to: i32,
    },
}

impl Command {
    pub fn origin(&self) -> Origin {
        match self {
            Command::CreateMemo { temp_id, .. } => Origin::Create(*temp_id),
            Command::UpdateMemo { id, .. } => Origin::Update(*id),
            Command::UpdateSettings { id, .. } => Origin::Settings(*id),
            Command::DeleteMemo(id) => Origin::Delete(*id),
            Command::LoadMemo(id) => Origin::Load(*id),
            Command::ListMemos { .. } => Origin::List,
            Command::ListVersions(id) => Origin::Versions(*id),
            Command::RestoreVersion { id, .. } => Origin::Restore(*id),
            Command::DiffVersions { id, .. } => Origin::Diff(*id),
        }
    }
}

/// Which command a [Event::Failure] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Create(TempId),
    Update(MemoId),
    Settings(MemoId),
    Delete(MemoId),
    Load(MemoId),
    List,
    Versions(MemoId),
    Restore(MemoId),
    Diff(MemoId),
}

impl Origin {
    pub fn key(&self) -> Option<MemoKey> {
        match *self {
            Origin::Create(temp_id) => Some(MemoKey::Temporary(temp_id)),
            Origin::Update(id)
            | Origin::Settings(id)
            | Origin::Delete(id)
            | Origin::Load(id)
            | Origin::Versions(id)
            | Origin::Restore(id)
            | Origin::Diff(id) => Some(MemoKey::Persisted(id)),
            Origin::List => None,
        }
    }
}

#[derive(Debug)]
pub enum Event {
    MemoCreated {
        temp_id: TempId,
        memo: Memo,
    },
    MemoUpdated {
        memo: Memo,
        changes: ChangeSet,
    },
    SettingsUpdated(Memo),
    MemoDeleted(MemoId),
    MemoLoaded(Memo),
    MemosListed(Vec<Memo>),
    VersionsListed {
        id: MemoId,
        versions: Vec<MemoVersion>,
    },
    VersionRestored {
        memo: Memo,
        version: MemoVersion,
    },
    VersionsDiffed {
        id: MemoId,
        from: i32,
        to: i32,
        diff: VersionDiff,
    },
    Failure {
        origin: Origin,
        error: StoreError,
    },
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(table_name = memo)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MemoRow {
    pub id: String,
    pub title: String,
    pub content: String,
    pub tags: String,
    pub is_private: bool,
    pub group_id: Option<String>,
    pub author_id: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = memo_version)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct VersionRow {
    pub memo_id: String,
    pub version: i32,
    pub title: String,
    pub content: String,
    pub tags: String,
    pub author_id: String,
    pub change_kind: String,
    pub created_at: String,
}

impl TryFrom<&Memo> for MemoRow {
    type Error = StoreError;

    fn try_from(memo: &Memo) -> Result<Self, Self::Error> {
        Ok(Self {
            id: memo.id.to_string(),
            title: memo.snapshot.title.clone(),
            content: memo.snapshot.content.clone(),
            tags: encode_tags(&memo.snapshot.tags),
            is_private: memo.snapshot.is_private,
            group_id: memo.snapshot.group_id.map(|group| group.to_string()),
            author_id: memo.author_id.to_string(),
            created_at: encode_time(memo.created_at)?,
            updated_at: encode_time(memo.updated_at)?,
        })
    }
}

impl TryFrom<MemoRow> for Memo {
    type Error = StoreError;

    fn try_from(row: MemoRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id(&row.id)?,
            snapshot: MemoSnapshot {
                title: row.title,
                content: row.content,
                tags: decode_tags(&row.tags)?,
                is_private: row.is_private,
                group_id: row.group_id.as_deref().map(parse_id).transpose()?,
            },
            author_id: parse_id(&row.author_id)?,
            created_at: decode_time(&row.created_at)?,
            updated_at: decode_time(&row.updated_at)?,
        })
    }
}

impl TryFrom<&MemoVersion> for VersionRow {
    type Error = StoreError;

    fn try_from(version: &MemoVersion) -> Result<Self, Self::Error> {
        Ok(Self {
            memo_id: version.memo_id.to_string(),
            version: version.version,
            title: version.title.clone(),
            content: version.content.clone(),
            tags: encode_tags(&version.tags),
            author_id: version.author_id.to_string(),
            change_kind: version.change_kind.to_string(),
            created_at: encode_time(version.created_at)?,
        })
    }
}

impl TryFrom<VersionRow> for MemoVersion {
    type Error = StoreError;

    fn try_from(row: VersionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            memo_id: parse_id(&row.memo_id)?,
            version: row.version,
            title: row.title,
            content: row.content,
            tags: decode_tags(&row.tags)?,
            author_id: parse_id(&row.author_id)?,
            change_kind: row
                .change_kind
                .parse::<ChangeKind>()
                .map_err(|err| StoreError::Corrupt(format!("change kind {:?}: {err}", row.change_kind)))?,
            created_at: decode_time(&row.created_at)?,
        })
    }
}

// Tags are stored as a JSON array to keep their order.
fn encode_tags(tags: &Tags) -> String {
    serde_json::Value::from(tags.to_vec()).to_string()
}

fn decode_tags(raw: &str) -> Result<Tags, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Corrupt(format!("tags {raw:?}: {err}")))
}

pub(super) fn encode_time(at: OffsetDateTime) -> Result<String, StoreError> {
    at.format(&Rfc3339)
        .map_err(|err| StoreError::Corrupt(format!("timestamp {at}: {err}")))
}

fn decode_time(raw: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| StoreError::Corrupt(format!("timestamp {raw:?}: {err}")))
}

fn parse_id<T>(raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|err| StoreError::Corrupt(format!("id {raw:?}: {err}")))
}
