//! Folding remote memo states into local ones without touching the autosave cycle.

use crate::{change::Field, memo::MemoSnapshot};

/// Title, content and tags of `buffer` that still equal `baseline` take the
/// `incoming` value. Returns the fields where local edits differ from `incoming`.
pub fn merge_tracked(
    baseline: &MemoSnapshot,
    buffer: &mut MemoSnapshot,
    incoming: &MemoSnapshot,
) -> Vec<Field> {
    let mut kept = Vec::new();
    if buffer.title == baseline.title {
        buffer.title = incoming.title.clone();
    } else if buffer.title != incoming.title {
        kept.push(Field::Title);
    }
    if buffer.content == baseline.content {
        buffer.content = incoming.content.clone();
    } else if buffer.content != incoming.content {
        kept.push(Field::Content);
    }
    if buffer.tags == baseline.tags {
        buffer.tags = incoming.tags.clone();
    } else if buffer.tags != incoming.tags {
        kept.push(Field::Tags);
    }
    kept
}

/// Three-way merge of `remote` into the local `baseline` and optional editing `buffer`.
///
/// A tracked field the user has not touched locally (buffer equals baseline) takes the
/// remote value. A field with local edits keeps them, the baseline still moves to the
/// remote value so the next diff re-sends the local text against the fresh state.
/// Privacy and group always follow the remote state.
///
/// Returns the fields where local edits were kept over a remote value.
pub fn merge_remote(
    baseline: &mut MemoSnapshot,
    buffer: Option<&mut MemoSnapshot>,
    remote: &MemoSnapshot,
) -> Vec<Field> {
    let mut kept = Vec::new();
    if let Some(buffer) = buffer {
        kept = merge_tracked(baseline, buffer, remote);
        buffer.is_private = remote.is_private;
        buffer.group_id = remote.group_id;
    }
    *baseline = remote.clone();
    kept
}
