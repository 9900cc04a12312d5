use diesel::{RunQueryDsl, SqliteConnection, dsl::max, prelude::*};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    change::ChangeSet,
    ids::{GroupId, MemoId, TempId, UserId},
    memo::{ChangeKind, Memo, MemoSnapshot, MemoVersion},
    persist::{
        Command, Event, MemoRow, StoreError, VersionRow,
        schema::{memo, memo_version},
    },
    version::{DiffSide, diff_versions, next_version},
};

type Result<T> = std::result::Result<T, StoreError>;

pub(super) async fn handle(conn: &mut SqliteConnection, cmd: Command) -> Result<Event> {
    match cmd {
        Command::CreateMemo {
            temp_id,
            draft,
            author,
        } => create_memo(conn, temp_id, draft, author).await,
        Command::UpdateMemo {
            id,
            changes,
            base_updated_at,
            actor,
        } => update_memo(conn, id, changes, base_updated_at, actor).await,
        Command::UpdateSettings {
            id,
            is_private,
            group_id,
        } => update_settings(conn, id, is_private, group_id).await,
        Command::DeleteMemo(id) => delete_memo(conn, id).await,
        Command::LoadMemo(id) => Ok(Event::MemoLoaded(load_memo(conn, id)?)),
        Command::ListMemos { author } => list_memos(conn, author).await,
        Command::ListVersions(id) => list_versions(conn, id).await,
        Command::RestoreVersion { id, version, actor } => {
            restore_version(conn, id, version, actor).await
        }
        Command::DiffVersions { id, from, to } => diff(conn, id, from, to).await,
    }
}

async fn create_memo(
    conn: &mut SqliteConnection,
    temp_id: TempId,
    draft: MemoSnapshot,
    author: UserId,
) -> Result<Event> {
    let now = OffsetDateTime::now_utc();
    let memo = Memo {
        id: MemoId::new(),
        snapshot: draft,
        author_id: author,
        created_at: now,
        updated_at: now,
    };
    let row = MemoRow::try_from(&memo)?;
    conn.immediate_transaction(|conn| {
        diesel::insert_into(memo::table).values(&row).execute(conn)?;
        append_version(conn, &memo, author, ChangeKind::Create)?;
        Ok::<_, StoreError>(())
    })?;
    debug!("{temp_id} stored as {}", memo.id);
    Ok(Event::MemoCreated { temp_id, memo })
}

async fn update_memo(
    conn: &mut SqliteConnection,
    id: MemoId,
    changes: ChangeSet,
    base_updated_at: OffsetDateTime,
    actor: UserId,
) -> Result<Event> {
    let memo = conn.immediate_transaction(|conn| {
        let mut memo = load_memo(conn, id)?;
        if memo.updated_at != base_updated_at {
            return Err(StoreError::Conflict {
                id,
                expected: base_updated_at,
                actual: memo.updated_at,
            });
        }
        if changes.is_empty() {
            return Ok(memo);
        }
        changes.apply_to(&mut memo.snapshot);
        memo.updated_at = advance(memo.updated_at);
        write_memo(conn, &memo)?;
        append_version(conn, &memo, actor, ChangeKind::Edit)?;
        Ok(memo)
    })?;
    Ok(Event::MemoUpdated { memo, changes })
}

async fn update_settings(
    conn: &mut SqliteConnection,
    id: MemoId,
    is_private: bool,
    group_id: Option<GroupId>,
) -> Result<Event> {
    let memo = conn.immediate_transaction(|conn| {
        let mut memo = load_memo(conn, id)?;
        memo.snapshot.is_private = is_private;
        memo.snapshot.group_id = group_id;
        memo.updated_at = advance(memo.updated_at);
        write_memo(conn, &memo)?;
        Ok::<_, StoreError>(memo)
    })?;
    Ok(Event::SettingsUpdated(memo))
}

async fn delete_memo(conn: &mut SqliteConnection, id: MemoId) -> Result<Event> {
    let key = id.to_string();
    let deleted = conn.immediate_transaction(|conn| {
        diesel::delete(memo_version::table.filter(memo_version::memo_id.eq(&key))).execute(conn)?;
        let deleted = diesel::delete(memo::table.find(&key)).execute(conn)?;
        Ok::<_, StoreError>(deleted)
    })?;
    if deleted == 0 {
        return Err(StoreError::NotFound(format!("memo {id}")));
    }
    Ok(Event::MemoDeleted(id))
}

async fn list_memos(conn: &mut SqliteConnection, author: UserId) -> Result<Event> {
    let rows = memo::table
        .filter(memo::author_id.eq(author.to_string()))
        .select(MemoRow::as_select())
        .load(conn)?;
    let mut memos = rows
        .into_iter()
        .map(Memo::try_from)
        .collect::<Result<Vec<_>>>()?;
    // Text timestamps with varying fraction digits do not sort lexically.
    memos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(Event::MemosListed(memos))
}

async fn list_versions(conn: &mut SqliteConnection, id: MemoId) -> Result<Event> {
    load_memo(conn, id)?;
    let versions = memo_version::table
        .filter(memo_version::memo_id.eq(id.to_string()))
        .order_by(memo_version::version.desc())
        .select(VersionRow::as_select())
        .load(conn)?
        .into_iter()
        .map(MemoVersion::try_from)
        .collect::<Result<Vec<_>>>()?;
    Ok(Event::VersionsListed { id, versions })
}

async fn restore_version(
    conn: &mut SqliteConnection,
    id: MemoId,
    version: i32,
    actor: UserId,
) -> Result<Event> {
    let (memo, appended) = conn.immediate_transaction(|conn| {
        let mut memo = load_memo(conn, id)?;
        let source = load_version(conn, id, version)?;
        memo.snapshot.title = source.title;
        memo.snapshot.content = source.content;
        memo.snapshot.tags = source.tags;
        memo.updated_at = advance(memo.updated_at);
        write_memo(conn, &memo)?;
        let appended = append_version(conn, &memo, actor, ChangeKind::Restore)?;
        Ok::<_, StoreError>((memo, appended))
    })?;
    debug!("{id} restored from version {version} as version {}", appended.version);
    Ok(Event::VersionRestored {
        memo,
        version: appended,
    })
}

async fn diff(conn: &mut SqliteConnection, id: MemoId, from: i32, to: i32) -> Result<Event> {
    let source = load_version(conn, id, from)?;
    let target = load_version(conn, id, to)?;
    let diff = diff_versions(
        DiffSide {
            title: &source.title,
            content: &source.content,
        },
        DiffSide {
            title: &target.title,
            content: &target.content,
        },
    );
    Ok(Event::VersionsDiffed { id, from, to, diff })
}

fn load_memo(conn: &mut SqliteConnection, id: MemoId) -> Result<Memo> {
    memo::table
        .find(id.to_string())
        .select(MemoRow::as_select())
        .get_result(conn)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("memo {id}")))?
        .try_into()
}

fn load_version(conn: &mut SqliteConnection, id: MemoId, version: i32) -> Result<MemoVersion> {
    memo_version::table
        .find((id.to_string(), version))
        .select(VersionRow::as_select())
        .get_result(conn)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("version {version} of memo {id}")))?
        .try_into()
}

fn write_memo(conn: &mut SqliteConnection, memo: &Memo) -> Result<()> {
    let row = MemoRow::try_from(memo)?;
    diesel::update(memo::table.find(&row.id))
        .set(&row)
        .execute(conn)?;
    Ok(())
}

fn append_version(
    conn: &mut SqliteConnection,
    memo: &Memo,
    author: UserId,
    change_kind: ChangeKind,
) -> Result<MemoVersion> {
    let latest: Option<i32> = memo_version::table
        .filter(memo_version::memo_id.eq(memo.id.to_string()))
        .select(max(memo_version::version))
        .get_result(conn)?;
    let version = MemoVersion {
        memo_id: memo.id,
        version: next_version(latest),
        title: memo.snapshot.title.clone(),
        content: memo.snapshot.content.clone(),
        tags: memo.snapshot.tags.clone(),
        author_id: author,
        change_kind,
        created_at: memo.updated_at,
    };
    diesel::insert_into(memo_version::table)
        .values(VersionRow::try_from(&version)?)
        .execute(conn)?;
    Ok(version)
}

/// Next `updated_at`, strictly after `previous` even if the clock did not move.
fn advance(previous: OffsetDateTime) -> OffsetDateTime {
    OffsetDateTime::now_utc().max(previous + Duration::MICROSECOND)
}
