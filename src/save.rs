use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    change::{ChangeSet, Field},
    debounce::Debouncer,
    ids::{MemoId, TempId},
    memo::{Memo, MemoKey, MemoSnapshot},
    reconcile,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("a memo needs a title before it can be created")]
    EmptyTitle,
}

/// What the coordinator wants persisted. Exactly one is in flight per memo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveRequest {
    Create {
        temp_id: TempId,
        draft: MemoSnapshot,
    },
    Update {
        id: MemoId,
        changes: ChangeSet,
        base_updated_at: OffsetDateTime,
    },
}

/// Per-memo autosave state, alive while the memo is open or a save for it is in flight.
#[derive(Debug)]
pub struct PendingSave {
    key: MemoKey,
    /// Last state known to be persisted; every diff is taken against it.
    baseline: MemoSnapshot,
    base_updated_at: Option<OffsetDateTime>,
    last_saved_at: Option<OffsetDateTime>,
    debouncer: Debouncer,
}

impl SaveRequest {
    pub fn key(&self) -> MemoKey {
        match self {
            SaveRequest::Create { temp_id, .. } => MemoKey::Temporary(*temp_id),
            SaveRequest::Update { id, .. } => MemoKey::Persisted(*id),
        }
    }
}

impl PendingSave {
    pub fn for_draft(temp_id: TempId, quiet: Duration) -> Self {
        Self {
            key: MemoKey::Temporary(temp_id),
            baseline: MemoSnapshot::default(),
            base_updated_at: None,
            last_saved_at: None,
            debouncer: Debouncer::new(quiet),
        }
    }

    pub fn for_memo(memo: &Memo, quiet: Duration) -> Self {
        Self {
            key: MemoKey::Persisted(memo.id),
            baseline: memo.snapshot.clone(),
            base_updated_at: Some(memo.updated_at),
            last_saved_at: None,
            debouncer: Debouncer::new(quiet),
        }
    }

    pub fn key(&self) -> MemoKey {
        self.key
    }

    #[cfg(test)]
    pub fn baseline(&self) -> &MemoSnapshot {
        &self.baseline
    }

    #[cfg(test)]
    pub fn base_updated_at(&self) -> Option<OffsetDateTime> {
        self.base_updated_at
    }

    pub fn last_saved_at(&self) -> Option<OffsetDateTime> {
        self.last_saved_at
    }

    pub fn is_in_flight(&self) -> bool {
        self.debouncer.is_saving()
    }

    pub fn is_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    pub fn changes(&self, current: &MemoSnapshot) -> ChangeSet {
        ChangeSet::between(&self.baseline, current)
    }

    /// The buffer changed at `now`. Returns whether a save is now armed or queued.
    pub fn on_edit(&mut self, current: &MemoSnapshot, now: Instant) -> bool {
        // While saving, a buffer back at the baseline still differs from what is being stored.
        if self.changes(current).is_empty() && !self.debouncer.is_saving() {
            if self.debouncer.is_pending() {
                debug!("{} is back at its baseline, dropping the armed save", self.key);
                self.debouncer.cancel();
            }
            return false;
        }
        self.debouncer.touch(now);
        true
    }

    /// Fires the armed save if its quiet window has elapsed.
    pub fn poll(&mut self, current: &MemoSnapshot, now: Instant) -> Option<SaveRequest> {
        if !self.debouncer.fire(now) {
            return None;
        }
        self.build_request(current)
    }

    /// Saves right away, skipping the quiet window. Drafts need a title for this.
    pub fn flush(&mut self, current: &MemoSnapshot) -> Result<Option<SaveRequest>, ValidationError> {
        if self.key.is_temporary() && current.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if !self.debouncer.fire_now() {
            debug!("{} already has a save in flight, flush deferred", self.key);
            return Ok(None);
        }
        Ok(self.build_request(current))
    }

    fn build_request(&mut self, current: &MemoSnapshot) -> Option<SaveRequest> {
        let changes = self.changes(current);
        if changes.is_empty() {
            self.debouncer.complete();
            return None;
        }
        let request = match self.key {
            MemoKey::Temporary(temp_id) => SaveRequest::Create {
                temp_id,
                draft: current.clone(),
            },
            MemoKey::Persisted(id) => {
                let Some(base_updated_at) = self.base_updated_at else {
                    warn!("{id} has no concurrency baseline, cannot send an update");
                    self.debouncer.complete();
                    return None;
                };
                SaveRequest::Update {
                    id,
                    changes,
                    base_updated_at,
                }
            }
        };
        Some(request)
    }

    /// The first create succeeded: from here on this state belongs to the permanent id.
    pub fn on_created(&mut self, memo: &Memo, buffer: Option<&mut MemoSnapshot>) {
        self.key = MemoKey::Persisted(memo.id);
        self.settle(memo, buffer);
    }

    /// Returns false for a result older than state already absorbed from elsewhere.
    pub fn on_updated(&mut self, memo: &Memo, buffer: Option<&mut MemoSnapshot>) -> bool {
        if let Some(base) = self.base_updated_at
            && memo.updated_at < base
        {
            debug!("{} save result is older than the known state, not applied", memo.id);
            self.debouncer.complete();
            return false;
        }
        self.settle(memo, buffer);
        true
    }

    // Without edits during the save the buffer picks up the stored values (a memo
    // reopened mid-save shows what was written). With edits it is left alone and
    // the parked re-arm sends whatever differs from the stored state.
    fn settle(&mut self, memo: &Memo, buffer: Option<&mut MemoSnapshot>) {
        if let Some(buffer) = buffer
            && !self.debouncer.has_parked_rearm()
        {
            reconcile::merge_tracked(&self.baseline, buffer, &memo.snapshot);
        }
        self.baseline = memo.snapshot.clone();
        self.base_updated_at = Some(memo.updated_at);
        self.last_saved_at = Some(memo.updated_at);
        self.debouncer.complete();
    }

    /// Conflict or transport failure. The baseline stays, so the next diff still
    /// contains whatever did not make it.
    pub fn on_failed(&mut self) {
        self.debouncer.complete();
    }

    /// Settings changes (privacy, group) are saved elsewhere; keep the baseline in step.
    pub fn on_settings_saved(&mut self, memo: &Memo) {
        self.baseline.is_private = memo.snapshot.is_private;
        self.baseline.group_id = memo.snapshot.group_id;
        self.base_updated_at = Some(memo.updated_at);
    }

    pub fn cancel(&mut self) {
        self.debouncer.cancel();
    }

    /// Replaces the baseline outright, e.g. after a restore.
    pub fn reset_to(&mut self, memo: &Memo) {
        self.debouncer.cancel();
        self.baseline = memo.snapshot.clone();
        self.base_updated_at = Some(memo.updated_at);
    }

    /// Folds a newer remote state into the baseline and, if given, the open buffer.
    /// Never arms a save. Returns the fields where local edits won, or `None` for
    /// stale or echoed states.
    pub fn absorb_remote(
        &mut self,
        remote: &Memo,
        buffer: Option<&mut MemoSnapshot>,
    ) -> Option<Vec<Field>> {
        if let Some(base) = self.base_updated_at
            && remote.updated_at <= base
        {
            return None;
        }
        let kept = reconcile::merge_remote(&mut self.baseline, buffer, &remote.snapshot);
        self.base_updated_at = Some(remote.updated_at);
        Some(kept)
    }

    /// The memo was deleted elsewhere while it still had unsaved text: start over as a draft.
    pub fn detach_as_draft(&mut self) -> TempId {
        let temp_id = TempId::new();
        self.key = MemoKey::Temporary(temp_id);
        self.baseline = MemoSnapshot::default();
        self.base_updated_at = None;
        self.last_saved_at = None;
        self.debouncer.reset();
        temp_id
    }
}
