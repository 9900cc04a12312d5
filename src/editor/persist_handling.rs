use tracing::{debug, info, warn};

use super::{Editor, Notice, open_buffer};
use crate::{
    memo::{Memo, MemoKey},
    persist::{self, ErrorClass, Event, Origin, StoreError},
    realtime::EventKind,
};

pub fn handle(editor: &mut Editor, event: Event) {
    match event {
        Event::MemoCreated { temp_id, memo } => {
            let draft_key = MemoKey::Temporary(temp_id);
            let key = MemoKey::Persisted(memo.id);
            editor.memos.insert(memo.id, memo.clone());
            let Some(mut session) = editor.sessions.remove(&draft_key) else {
                warn!("{temp_id} was stored as {} but nothing tracks it anymore", memo.id);
                return;
            };
            // Re-key buffer and autosave state in one go.
            let buffer = editor
                .open
                .as_mut()
                .filter(|open| open.key == draft_key)
                .map(|open| {
                    open.key = key;
                    &mut open.buffer
                });
            let settings_differ = buffer.as_ref().is_some_and(|buffer| {
                buffer.is_private != memo.snapshot.is_private
                    || buffer.group_id != memo.snapshot.group_id
            });
            session.on_created(&memo, buffer);
            editor.sessions.insert(key, session);
            info!("{temp_id} is now {}", memo.id);

            editor.broadcast(EventKind::MemoCreate, &memo);
            editor.notify(Notice::Created {
                temp_id,
                id: memo.id,
            });
            if settings_differ {
                send_settings(editor, &memo);
            }
            editor.release_if_detached(key);
        }
        Event::MemoUpdated { memo, changes } => {
            let key = MemoKey::Persisted(memo.id);
            if editor
                .memos
                .get(&memo.id)
                .is_none_or(|cached| cached.updated_at < memo.updated_at)
            {
                editor.memos.insert(memo.id, memo.clone());
            }
            let saved_at = match editor.sessions.get_mut(&key) {
                Some(session) => {
                    if !session.on_updated(&memo, open_buffer(&mut editor.open, key)) {
                        debug!("{} already moved past this save", memo.id);
                    }
                    session.last_saved_at()
                }
                None => {
                    debug!("{} saved with nothing tracking it", memo.id);
                    None
                }
            };
            editor.release_if_detached(key);
            editor.broadcast(EventKind::MemoUpdate, &memo);
            editor.notify(Notice::Saved {
                id: memo.id,
                at: saved_at.unwrap_or(memo.updated_at),
                fields: changes.fields(),
            });
        }
        Event::SettingsUpdated(memo) => {
            let key = MemoKey::Persisted(memo.id);
            editor.memos.insert(memo.id, memo.clone());
            if let Some(session) = editor.sessions.get_mut(&key) {
                session.on_settings_saved(&memo);
            }
            editor.broadcast(EventKind::MemoUpdate, &memo);
            editor.notify(Notice::SettingsSaved {
                id: memo.id,
                is_private: memo.snapshot.is_private,
                group_id: memo.snapshot.group_id,
            });
        }
        Event::MemoDeleted(id) => {
            let key = MemoKey::Persisted(id);
            let last_known = editor.memos.remove(&id);
            editor.sessions.remove(&key);
            if editor.open.as_ref().is_some_and(|open| open.key == key) {
                editor.open = None;
            }
            if editor.realtime.is_connected() {
                let (group_id, is_private) = last_known
                    .map(|memo| (memo.snapshot.group_id, memo.snapshot.is_private))
                    .unwrap_or_default();
                if let Err(err) = editor.realtime.publish_delete(id, group_id, is_private) {
                    warn!("Unable to publish delete of {id}: {err}");
                }
            }
            editor.notify(Notice::Deleted(id));
        }
        Event::MemoLoaded(memo) => {
            let key = MemoKey::Persisted(memo.id);
            editor.memos.insert(memo.id, memo.clone());
            if editor.opening == Some(memo.id) {
                editor.opening = None;
                if editor.open.is_none() {
                    editor.open_memo(memo);
                    return;
                }
            }
            let Some(session) = editor.sessions.get_mut(&key) else {
                return;
            };
            match session.absorb_remote(&memo, open_buffer(&mut editor.open, key)) {
                Some(kept) => editor.notify(Notice::Refreshed { id: memo.id, kept }),
                None => debug!("{} reloaded but nothing newer", memo.id),
            }
        }
        Event::MemosListed(memos) => {
            for memo in &memos {
                editor.memos.insert(memo.id, memo.clone());
            }
            editor.notify(Notice::Listed(memos));
        }
        Event::VersionsListed { id, versions } => {
            editor.notify(Notice::Versions { id, versions });
        }
        Event::VersionRestored { memo, version } => {
            let key = MemoKey::Persisted(memo.id);
            editor.memos.insert(memo.id, memo.clone());
            if let Some(session) = editor.sessions.get_mut(&key) {
                session.reset_to(&memo);
            }
            if let Some(buffer) = open_buffer(&mut editor.open, key) {
                *buffer = memo.snapshot.clone();
            }
            editor.broadcast(EventKind::MemoUpdate, &memo);
            editor.notify(Notice::Restored {
                id: memo.id,
                version: version.version,
            });
        }
        Event::VersionsDiffed { id, from, to, diff } => {
            editor.notify(Notice::Diff { id, from, to, diff });
        }
        Event::Failure { origin, error } => handle_failure(editor, origin, error),
    }
}

fn handle_failure(editor: &mut Editor, origin: Origin, error: StoreError) {
    match origin {
        Origin::Create(_) | Origin::Update(_) => {
            let Some(key) = origin.key() else {
                return;
            };
            // Baseline stays: whatever did not make it is part of the next diff.
            if let Some(session) = editor.sessions.get_mut(&key) {
                session.on_failed();
            }
            editor.release_if_detached(key);
            match (error.class(), key) {
                (ErrorClass::Conflict, MemoKey::Persisted(id)) => {
                    warn!("Save of {id} conflicted: {error}");
                    editor.notify(Notice::Conflict(id));
                    editor.send_persist(persist::Command::LoadMemo(id));
                }
                _ => {
                    warn!("Save of {key} failed: {error}");
                    editor.notify(Notice::Failed {
                        key: Some(key),
                        reason: error.to_string(),
                    });
                }
            }
        }
        Origin::Load(id) if editor.opening == Some(id) => {
            editor.opening = None;
            editor.notify(Notice::Failed {
                key: origin.key(),
                reason: error.to_string(),
            });
        }
        _ => editor.notify(Notice::Failed {
            key: origin.key(),
            reason: error.to_string(),
        }),
    }
}

fn send_settings(editor: &mut Editor, memo: &Memo) {
    let Some(open) = editor
        .open
        .as_ref()
        .filter(|open| open.key == MemoKey::Persisted(memo.id))
    else {
        return;
    };
    let command = persist::Command::UpdateSettings {
        id: memo.id,
        is_private: open.buffer.is_private,
        group_id: open.buffer.group_id,
    };
    editor.send_persist(command);
}
