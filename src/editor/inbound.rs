use tracing::{debug, info, warn};

use super::{Editor, Notice, open_buffer};
use crate::{
    ids::{MemoId, UserId},
    memo::MemoKey,
    realtime::{EventKind, RealtimeEvent},
};

/// Folds a change made elsewhere into local state. Never arms an autosave.
pub fn handle(editor: &mut Editor, event: RealtimeEvent) {
    match event.kind {
        EventKind::MemoCreate | EventKind::MemoUpdate => {
            let Some(memo) = event.memo else {
                warn!("{} for {} without memo state", event.kind, event.memo_id);
                return;
            };
            if let Some(cached) = editor.memos.get(&memo.id)
                && cached.updated_at >= memo.updated_at
            {
                debug!("Ignoring stale {} for {}", event.kind, memo.id);
                return;
            }
            editor.memos.insert(memo.id, memo.clone());
            let key = MemoKey::Persisted(memo.id);
            let kept = match editor.sessions.get_mut(&key) {
                Some(session) => session.absorb_remote(&memo, open_buffer(&mut editor.open, key)),
                None => Some(Vec::new()),
            };
            if let Some(kept) = kept {
                editor.notify(Notice::RemoteChange {
                    id: memo.id,
                    kind: event.kind,
                    from: event.sender_id,
                    kept,
                });
            }
        }
        EventKind::MemoDelete => remote_delete(editor, event.memo_id, event.sender_id),
    }
}

fn remote_delete(editor: &mut Editor, id: MemoId, from: UserId) {
    editor.memos.remove(&id);
    let key = MemoKey::Persisted(id);
    let Some(mut session) = editor.sessions.remove(&key) else {
        editor.notify(Notice::RemoteDelete { id, kept_as: None });
        return;
    };
    let Some(open) = editor.open.as_mut().filter(|open| open.key == key) else {
        // Closed but still saving: keep it so the failing save has somewhere to land.
        if session.is_in_flight() {
            editor.sessions.insert(key, session);
        }
        editor.notify(Notice::RemoteDelete { id, kept_as: None });
        return;
    };
    if session.changes(&open.buffer).is_empty() {
        info!("{id} deleted by {from}, closing it");
        editor.open = None;
        editor.notify(Notice::RemoteDelete { id, kept_as: None });
        return;
    }
    let temp_id = session.detach_as_draft();
    open.key = MemoKey::Temporary(temp_id);
    editor.sessions.insert(open.key, session);
    info!("{id} deleted by {from}, unsaved text kept as {temp_id}");
    editor.notify(Notice::RemoteDelete {
        id,
        kept_as: Some(temp_id),
    });
}
