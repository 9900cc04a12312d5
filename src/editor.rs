use std::{collections::HashMap, fmt, time::Duration};

use color_eyre::Result;
use time::OffsetDateTime;
use tokio::{
    select,
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    action::Action,
    change::Field,
    ids::{GroupId, MemoId, TempId, UserId},
    memo::{Memo, MemoKey, MemoSnapshot, MemoVersion},
    persist::{self, StoreError},
    realtime::{EventKind, RealtimeConnection, RealtimeEvent},
    save::{PendingSave, SaveRequest},
    version::{VersionDiff, VersionQuery, parse_version_number},
};

mod inbound;
mod persist_handling;

/// Non-blocking feedback for the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    SignedIn(UserId),
    SignedOut,
    Opened { key: MemoKey, title: String },
    Closed(MemoKey),
    Created { temp_id: TempId, id: MemoId },
    Saved {
        id: MemoId,
        at: OffsetDateTime,
        fields: Vec<Field>,
    },
    SettingsSaved {
        id: MemoId,
        is_private: bool,
        group_id: Option<GroupId>,
    },
    Deleted(MemoId),
    Conflict(MemoId),
    /// Stored state pulled in after a conflict; `kept` lists fields where local text won.
    Refreshed { id: MemoId, kept: Vec<Field> },
    RemoteChange {
        id: MemoId,
        kind: EventKind,
        from: UserId,
        kept: Vec<Field>,
    },
    RemoteDelete {
        id: MemoId,
        kept_as: Option<TempId>,
    },
    Listed(Vec<Memo>),
    Versions {
        id: MemoId,
        versions: Vec<MemoVersion>,
    },
    Diff {
        id: MemoId,
        from: i32,
        to: i32,
        diff: VersionDiff,
    },
    Restored { id: MemoId, version: i32 },
    Invalid(String),
    Failed {
        key: Option<MemoKey>,
        reason: String,
    },
    Info(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::SignedIn(user) => write!(f, "signed in as {user}"),
            Notice::SignedOut => write!(f, "signed out"),
            Notice::Opened { key, title } => write!(f, "editing {key} {title:?}"),
            Notice::Closed(key) => write!(f, "closed {key}"),
            Notice::Created { temp_id, id } => write!(f, "created {id} (was {temp_id})"),
            Notice::Saved { id, at, fields } => {
                let fields: Vec<String> = fields.iter().map(ToString::to_string).collect();
                write!(f, "saved {} of {id} at {at}", fields.join(", "))
            }
            Notice::SettingsSaved {
                id,
                is_private,
                group_id,
            } => {
                let visibility = if *is_private { "private" } else { "shared" };
                match group_id {
                    Some(group) => write!(f, "{id} is {visibility} in {group}"),
                    None => write!(f, "{id} is {visibility}"),
                }
            }
            Notice::Deleted(id) => write!(f, "deleted {id}"),
            Notice::Conflict(id) => write!(
                f,
                "{id} was changed elsewhere, reloading; your unsaved text is kept"
            ),
            Notice::Refreshed { id, kept } => {
                write!(f, "reloaded {id}")?;
                write_kept(f, kept)
            }
            Notice::RemoteChange {
                id,
                kind,
                from,
                kept,
            } => {
                write!(f, "{kind} on {id} by {from}")?;
                write_kept(f, kept)
            }
            Notice::RemoteDelete { id, kept_as } => match kept_as {
                Some(temp_id) => write!(
                    f,
                    "{id} was deleted elsewhere; unsaved text kept as new draft {temp_id}"
                ),
                None => write!(f, "{id} was deleted elsewhere"),
            },
            Notice::Listed(memos) if memos.is_empty() => write!(f, "no memos yet"),
            Notice::Listed(memos) => {
                for (idx, memo) in memos.iter().enumerate() {
                    if idx > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}  {}  [{}]", memo.id, memo.snapshot.title, memo.snapshot.tags)?;
                }
                Ok(())
            }
            Notice::Versions { id, versions } => {
                write!(f, "history of {id}:")?;
                for version in versions {
                    write!(
                        f,
                        "\n  v{} {} by {} at {}: {}",
                        version.version,
                        version.change_kind,
                        version.author_id,
                        version.created_at,
                        version.title
                    )?;
                }
                Ok(())
            }
            Notice::Diff { id, from, to, diff } => {
                write!(f, "{id} v{from} -> v{to}:")?;
                if diff.is_empty() {
                    return write!(f, " no differences");
                }
                for line in &diff.added {
                    write!(f, "\n  + {line}")?;
                }
                for line in &diff.removed {
                    write!(f, "\n  - {line}")?;
                }
                for modified in &diff.modified {
                    write!(f, "\n  ~ {modified}")?;
                }
                Ok(())
            }
            Notice::Restored { id, version } => write!(f, "restored {id}, now at v{version}"),
            Notice::Invalid(reason) => write!(f, "cannot do that: {reason}"),
            Notice::Failed {
                key: Some(key),
                reason,
            } => write!(f, "{key}: {reason}"),
            Notice::Failed { key: None, reason } => write!(f, "{reason}"),
            Notice::Info(text) => write!(f, "{text}"),
        }
    }
}

fn write_kept(f: &mut fmt::Formatter<'_>, kept: &[Field]) -> fmt::Result {
    if kept.is_empty() {
        return Ok(());
    }
    let kept: Vec<String> = kept.iter().map(ToString::to_string).collect();
    write!(f, " (kept your {})", kept.join(", "))
}

#[derive(Debug)]
struct OpenMemo {
    key: MemoKey,
    buffer: MemoSnapshot,
}

/// The editing surface: one open memo, autosave state per memo, and the memo cache.
pub struct Editor {
    quiet: Duration,
    online: bool,
    user: Option<UserId>,
    open: Option<OpenMemo>,
    /// Requested with `open` but not loaded yet.
    opening: Option<MemoId>,
    /// The open memo's state plus any closed memo whose save is still in flight.
    sessions: HashMap<MemoKey, PendingSave>,
    memos: HashMap<MemoId, Memo>,
    persist_tx: UnboundedSender<persist::Command>,
    realtime: RealtimeConnection,
    notice_tx: UnboundedSender<Notice>,
    should_quit: bool,
}

impl Editor {
    pub fn new(
        quiet: Duration,
        online: bool,
        persist_tx: UnboundedSender<persist::Command>,
        realtime: RealtimeConnection,
        notice_tx: UnboundedSender<Notice>,
    ) -> Self {
        Self {
            quiet,
            online,
            user: None,
            open: None,
            opening: None,
            sessions: HashMap::new(),
            memos: HashMap::new(),
            persist_tx,
            realtime,
            notice_tx,
            should_quit: false,
        }
    }

    pub async fn run(
        mut self,
        mut actions: UnboundedReceiver<Action>,
        mut persisted_rx: UnboundedReceiver<persist::Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let deadline = self.next_deadline();
            select! {
                _ = cancel.cancelled() => {
                    debug!("Editor cancelled");
                    break;
                }
                action = actions.recv() => {
                    let Some(action) = action else {
                        debug!("Input closed, leaving the editor");
                        break;
                    };
                    debug!("{action:?}");
                    self.handle_action(action, Instant::now());
                }
                event = persisted_rx.recv() => {
                    let Some(event) = event else {
                        warn!("Persistence stopped, leaving the editor");
                        break;
                    };
                    debug!("Persisted: {event:?}");
                    self.handle_persisted(event);
                }
                event = self.realtime.recv() => self.handle_inbound(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_due(Instant::now());
                }
            }
            if self.should_quit {
                break;
            }
        }
        self.close();
        self.realtime.sign_out();
        persisted_rx.close();
        Ok(())
    }

    pub fn handle_action(&mut self, action: Action, now: Instant) {
        let Some(user) = self.user else {
            match action {
                Action::Login(user) => self.login(user),
                Action::Quit => self.should_quit = true,
                _ => self.notify(Notice::Invalid("sign in first with `login <user-id>`".into())),
            }
            return;
        };
        match action {
            Action::New => self.open_draft(),
            Action::Open(id) => self.open_stored(id),
            Action::Title(title) => self.edit(now, |buffer| buffer.title = title),
            Action::Body(content) => self.edit(now, |buffer| buffer.content = content),
            Action::Append(text) => self.edit(now, |buffer| {
                if !buffer.content.is_empty() {
                    buffer.content.push('\n');
                }
                buffer.content.push_str(&text);
            }),
            Action::Tags(tags) => self.edit(now, |buffer| buffer.tags = tags),
            Action::Private(is_private) => {
                self.change_settings(|buffer| buffer.is_private = is_private)
            }
            Action::Group(group_id) => {
                if let Some(group) = group_id {
                    self.realtime.join(group);
                }
                self.change_settings(|buffer| buffer.group_id = group_id)
            }
            Action::Join(group) => {
                self.realtime.join(group);
                self.notify(Notice::Info(format!("following {group}")));
            }
            Action::Save => self.save_now(),
            Action::Close => self.close(),
            Action::Delete => self.delete(),
            Action::List => self.send_persist(persist::Command::ListMemos { author: user }),
            Action::Versions => {
                if let Some(id) = self.open_stored_id() {
                    self.send_persist(persist::Command::ListVersions(id));
                }
            }
            Action::Diff { from, to } => match VersionQuery::parse(&from, &to) {
                Ok(query) => {
                    if let Some(id) = self.open_stored_id() {
                        self.send_persist(persist::Command::DiffVersions {
                            id,
                            from: query.from,
                            to: query.to,
                        });
                    }
                }
                Err(err) => self.notify(Notice::Invalid(err.to_string())),
            },
            Action::Restore(raw) => match parse_version_number(&raw) {
                Ok(version) => {
                    if let Some(id) = self.open_stored_id() {
                        self.send_persist(persist::Command::RestoreVersion {
                            id,
                            version,
                            actor: user,
                        });
                    }
                }
                Err(err) => self.notify(Notice::Invalid(err.to_string())),
            },
            Action::Login(other) if other == user => {
                self.notify(Notice::Info(format!("already signed in as {user}")))
            }
            Action::Login(other) => {
                self.logout();
                self.login(other);
            }
            Action::Logout => self.logout(),
            Action::Quit => {
                self.close();
                self.should_quit = true;
            }
        }
    }

    pub fn handle_persisted(&mut self, event: persist::Event) {
        persist_handling::handle(self, event);
    }

    pub fn handle_inbound(&mut self, event: RealtimeEvent) {
        inbound::handle(self, event);
    }

    /// Earliest armed autosave, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions.values().filter_map(PendingSave::deadline).min()
    }

    /// Fires the open memo's autosave if its quiet window is over.
    pub fn fire_due(&mut self, now: Instant) {
        let open_key = self.open.as_ref().map(|open| open.key);
        for (key, session) in self.sessions.iter_mut() {
            if Some(*key) != open_key && session.deadline().is_some_and(|at| at <= now) {
                warn!("{key} has an armed save but is not open - This shouldn't happen");
                session.cancel();
            }
        }
        let Some(open) = &self.open else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&open.key) else {
            return;
        };
        if let Some(request) = session.poll(&open.buffer, now) {
            self.send_save(request);
        }
    }

    fn login(&mut self, user: UserId) {
        self.user = Some(user);
        if self.online {
            self.realtime.sign_in(user);
        }
        info!("Signed in as {user} (realtime session {})", self.realtime.session_id());
        self.notify(Notice::SignedIn(user));
        self.send_persist(persist::Command::ListMemos { author: user });
    }

    fn logout(&mut self) {
        self.close();
        self.realtime.sign_out();
        self.opening = None;
        self.memos.clear();
        if self.user.take().is_some() {
            self.notify(Notice::SignedOut);
        }
    }

    fn open_draft(&mut self) {
        self.close();
        let temp_id = TempId::new();
        let key = MemoKey::Temporary(temp_id);
        self.sessions
            .insert(key, PendingSave::for_draft(temp_id, self.quiet));
        self.open = Some(OpenMemo {
            key,
            buffer: MemoSnapshot::default(),
        });
        self.notify(Notice::Opened {
            key,
            title: String::new(),
        });
    }

    fn open_stored(&mut self, id: MemoId) {
        if self
            .open
            .as_ref()
            .is_some_and(|open| open.key == MemoKey::Persisted(id))
        {
            self.notify(Notice::Info(format!("{id} is already open")));
            return;
        }
        self.close();
        match self.memos.get(&id).cloned() {
            Some(memo) => self.open_memo(memo),
            None => {
                self.opening = Some(id);
                self.send_persist(persist::Command::LoadMemo(id));
            }
        }
    }

    fn open_memo(&mut self, memo: Memo) {
        let key = MemoKey::Persisted(memo.id);
        // A save from an earlier visit may still be running; its result lands here.
        self.sessions
            .entry(key)
            .or_insert_with(|| PendingSave::for_memo(&memo, self.quiet));
        if let Some(group) = memo.snapshot.group_id {
            self.realtime.join(group);
        }
        let title = memo.snapshot.title.clone();
        self.open = Some(OpenMemo {
            key,
            buffer: memo.snapshot,
        });
        self.notify(Notice::Opened { key, title });
    }

    /// Cancels the armed autosave. A save already in flight finishes detached.
    fn close(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(&open.key) {
            session.cancel();
            if session.is_in_flight() {
                debug!("{} closed with a save in flight", open.key);
            } else {
                self.sessions.remove(&open.key);
            }
        }
        self.notify(Notice::Closed(open.key));
    }

    fn edit(&mut self, now: Instant, change: impl FnOnce(&mut MemoSnapshot)) {
        let Some(open) = self.open.as_mut() else {
            self.notify(Notice::Invalid("no memo is open".into()));
            return;
        };
        change(&mut open.buffer);
        if let Some(session) = self.sessions.get_mut(&open.key) {
            session.on_edit(&open.buffer, now);
        }
    }

    // Privacy and group never go through autosave.
    fn change_settings(&mut self, change: impl FnOnce(&mut MemoSnapshot)) {
        let Some(open) = self.open.as_mut() else {
            self.notify(Notice::Invalid("no memo is open".into()));
            return;
        };
        change(&mut open.buffer);
        match open.key {
            MemoKey::Persisted(id) => {
                let command = persist::Command::UpdateSettings {
                    id,
                    is_private: open.buffer.is_private,
                    group_id: open.buffer.group_id,
                };
                self.send_persist(command);
            }
            MemoKey::Temporary(temp_id) => {
                debug!("{temp_id} not stored yet, settings go out with the first create");
            }
        }
    }

    fn save_now(&mut self) {
        let Some(open) = &self.open else {
            self.notify(Notice::Invalid("no memo is open".into()));
            return;
        };
        let Some(session) = self.sessions.get_mut(&open.key) else {
            warn!("{} is open without autosave state", open.key);
            return;
        };
        if session.is_in_flight() {
            self.notify(Notice::Info("a save is already running".into()));
            return;
        }
        match session.flush(&open.buffer) {
            Ok(Some(request)) => self.send_save(request),
            Ok(None) => self.notify(Notice::Info("nothing to save".into())),
            Err(err) => self.notify(Notice::Invalid(err.to_string())),
        }
    }

    fn delete(&mut self) {
        let Some(open) = &self.open else {
            self.notify(Notice::Invalid("no memo is open".into()));
            return;
        };
        match open.key {
            MemoKey::Temporary(_) => {
                self.close();
                self.notify(Notice::Info("draft discarded".into()));
            }
            MemoKey::Persisted(id) => {
                if let Some(session) = self.sessions.get_mut(&open.key) {
                    session.cancel();
                }
                self.send_persist(persist::Command::DeleteMemo(id));
            }
        }
    }

    fn open_stored_id(&self) -> Option<MemoId> {
        let key = self.open.as_ref().map(|open| open.key);
        match key {
            Some(MemoKey::Persisted(id)) => Some(id),
            Some(MemoKey::Temporary(_)) => {
                self.notify(Notice::Invalid("this memo has not been saved yet".into()));
                None
            }
            None => {
                self.notify(Notice::Invalid("no memo is open".into()));
                None
            }
        }
    }

    fn send_save(&mut self, request: SaveRequest) {
        let (key, command) = match (request, self.user) {
            (SaveRequest::Create { temp_id, draft }, Some(author)) => {
                info!("Creating {temp_id}");
                (
                    MemoKey::Temporary(temp_id),
                    persist::Command::CreateMemo {
                        temp_id,
                        draft,
                        author,
                    },
                )
            }
            (
                SaveRequest::Update {
                    id,
                    changes,
                    base_updated_at,
                },
                Some(actor),
            ) => {
                info!("Saving {} of {id}", changes.len());
                (
                    MemoKey::Persisted(id),
                    persist::Command::UpdateMemo {
                        id,
                        changes,
                        base_updated_at,
                        actor,
                    },
                )
            }
            (request, None) => {
                warn!("Dropping save without a signed in user: {request:?}");
                if let Some(session) = self.sessions.get_mut(&request.key()) {
                    session.on_failed();
                }
                return;
            }
        };
        if let Err(err) = self.try_send_persist(command) {
            if let Some(session) = self.sessions.get_mut(&key) {
                session.on_failed();
            }
            self.notify(Notice::Failed {
                key: Some(key),
                reason: err.to_string(),
            });
        }
    }

    fn send_persist(&self, command: persist::Command) {
        if let Err(err) = self.try_send_persist(command) {
            self.notify(Notice::Failed {
                key: None,
                reason: err.to_string(),
            });
        }
    }

    fn try_send_persist(&self, command: persist::Command) -> Result<(), StoreError> {
        self.persist_tx.send(command).map_err(|err| {
            warn!("Unable to send persistence command: {err:?}");
            StoreError::Unavailable
        })
    }

    /// Drops the state of a closed memo once nothing is running for it anymore.
    fn release_if_detached(&mut self, key: MemoKey) {
        if self.open.as_ref().is_some_and(|open| open.key == key) {
            return;
        }
        if self
            .sessions
            .get(&key)
            .is_some_and(|session| !session.is_in_flight() && !session.is_pending())
        {
            debug!("{key} finished saving after it was closed");
            self.sessions.remove(&key);
        }
    }

    fn broadcast(&self, kind: EventKind, memo: &Memo) {
        if !self.realtime.is_connected() {
            return;
        }
        if let Err(err) = self.realtime.publish_memo(kind, memo) {
            warn!("Unable to publish {kind} for {}: {err}", memo.id);
        }
    }

    fn notify(&self, notice: Notice) {
        if let Err(err) = self.notice_tx.send(notice) {
            debug!("Notice dropped, nobody is listening: {err:?}");
        }
    }
}

/// The open buffer, if `key` is the open memo.
fn open_buffer(open: &mut Option<OpenMemo>, key: MemoKey) -> Option<&mut MemoSnapshot> {
    open.as_mut()
        .filter(|open| open.key == key)
        .map(|open| &mut open.buffer)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use time::ext::NumericalDuration;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        change::ChangeSet,
        memo::{ChangeKind, Tags},
        persist::{Command, Event, Origin},
        realtime::{Backoff, RealtimeHub},
    };

    const QUIET: Duration = Duration::from_millis(500);

    struct Harness {
        editor: Editor,
        commands: mpsc::UnboundedReceiver<Command>,
        notices: mpsc::UnboundedReceiver<Notice>,
        user: UserId,
    }

    impl Harness {
        fn new() -> Self {
            let (persist_tx, commands) = mpsc::unbounded_channel();
            let (notice_tx, notices) = mpsc::unbounded_channel();
            let realtime = RealtimeConnection::new(
                RealtimeHub::new(16),
                Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
            );
            let mut harness = Self {
                editor: Editor::new(QUIET, true, persist_tx, realtime, notice_tx),
                commands,
                notices,
                user: UserId::new(),
            };
            harness.act(Action::Login(harness.user), Instant::now());
            harness.commands();
            harness.notices();
            harness
        }

        fn act(&mut self, action: Action, now: Instant) {
            self.editor.handle_action(action, now);
        }

        fn commands(&mut self) -> Vec<Command> {
            std::iter::from_fn(|| self.commands.try_recv().ok()).collect()
        }

        fn notices(&mut self) -> Vec<Notice> {
            std::iter::from_fn(|| self.notices.try_recv().ok()).collect()
        }

        fn stored(&self, title: &str, content: &str) -> Memo {
            Memo {
                id: MemoId::new(),
                snapshot: MemoSnapshot {
                    title: title.into(),
                    content: content.into(),
                    ..Default::default()
                },
                author_id: self.user,
                created_at: OffsetDateTime::UNIX_EPOCH,
                updated_at: OffsetDateTime::UNIX_EPOCH + 10.seconds(),
            }
        }

        fn open(&mut self, memo: &Memo) {
            self.editor
                .handle_persisted(Event::MemosListed(vec![memo.clone()]));
            self.act(Action::Open(memo.id), Instant::now());
            assert!(self.commands().is_empty(), "cached memo opened without a load");
            self.notices();
        }

        fn buffer(&self) -> &MemoSnapshot {
            &self.editor.open.as_ref().expect("a memo to be open").buffer
        }

        fn open_key(&self) -> Option<MemoKey> {
            self.editor.open.as_ref().map(|open| open.key)
        }
    }

    fn saved(memo: &Memo, change: impl FnOnce(&mut MemoSnapshot)) -> Memo {
        let mut memo = memo.clone();
        change(&mut memo.snapshot);
        memo.updated_at += 1.seconds();
        memo
    }

    fn remote(kind: EventKind, memo: &Memo) -> RealtimeEvent {
        RealtimeEvent {
            kind,
            memo_id: memo.id,
            memo: (kind != EventKind::MemoDelete).then(|| memo.clone()),
            sender_id: UserId::new(),
            session_id: crate::ids::SessionId::new(),
            group_id: memo.snapshot.group_id,
            is_private: memo.snapshot.is_private,
        }
    }

    #[test]
    fn test_typing_burst_becomes_one_update() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);

        let t0 = Instant::now();
        h.act(Action::Title("A1".into()), t0);
        h.act(Action::Title("A12".into()), t0 + Duration::from_millis(100));
        h.act(Action::Title("A123".into()), t0 + Duration::from_millis(200));

        h.editor.fire_due(t0 + Duration::from_millis(600));
        assert!(h.commands().is_empty());
        assert_eq!(
            h.editor.next_deadline(),
            Some(t0 + Duration::from_millis(700))
        );

        h.editor.fire_due(t0 + Duration::from_millis(700));
        let commands = h.commands();
        assert_eq!(commands.len(), 1);
        let Command::UpdateMemo {
            id,
            changes,
            base_updated_at,
            actor,
        } = &commands[0]
        else {
            panic!("expected an update, got {commands:?}");
        };
        assert_eq!(*id, memo.id);
        assert_eq!(changes.fields(), vec![Field::Title]);
        assert_eq!(*base_updated_at, memo.updated_at);
        assert_eq!(*actor, h.user);
        assert_eq!(h.editor.next_deadline(), None);
    }

    #[test]
    fn test_new_memo_is_created_then_updated_under_its_permanent_id() {
        let mut h = Harness::new();
        let t0 = Instant::now();
        h.act(Action::New, t0);
        let Some(MemoKey::Temporary(temp_id)) = h.open_key() else {
            panic!("expected a draft");
        };
        h.act(Action::Title("New".into()), t0);
        h.act(Action::Body("Body".into()), t0);
        h.editor.fire_due(t0 + QUIET);

        let commands = h.commands();
        let [Command::CreateMemo {
            temp_id: sent,
            draft,
            author,
        }] = commands.as_slice()
        else {
            panic!("expected a create, got {commands:?}");
        };
        assert_eq!(*sent, temp_id);
        assert_eq!(draft.title, "New");
        assert_eq!(draft.content, "Body");
        assert_eq!(*author, h.user);

        let mut created = h.stored("New", "Body");
        created.snapshot.tags = Tags::default();
        h.editor.handle_persisted(Event::MemoCreated {
            temp_id,
            memo: created.clone(),
        });
        assert_eq!(h.open_key(), Some(MemoKey::Persisted(created.id)));
        assert!(!h.editor.sessions.contains_key(&MemoKey::Temporary(temp_id)));
        assert!(h.notices().contains(&Notice::Created {
            temp_id,
            id: created.id
        }));

        let t1 = t0 + QUIET * 4;
        h.act(Action::Append("more".into()), t1);
        h.editor.fire_due(t1 + QUIET);
        let commands = h.commands();
        let [Command::UpdateMemo { id, changes, .. }] = commands.as_slice() else {
            panic!("expected an update, got {commands:?}");
        };
        assert_eq!(*id, created.id);
        assert_eq!(changes.fields(), vec![Field::Content]);
        assert_eq!(h.buffer().content, "Body\nmore");
    }

    #[test]
    fn test_manual_save_of_untitled_draft_is_refused() {
        let mut h = Harness::new();
        h.act(Action::New, Instant::now());
        h.act(Action::Body("no title yet".into()), Instant::now());
        h.notices();

        h.act(Action::Save, Instant::now());
        assert!(h.commands().is_empty());
        assert!(matches!(h.notices().as_slice(), [Notice::Invalid(_)]));
        assert!(h.open_key().is_some_and(|key| key.is_temporary()));
    }

    #[test]
    fn test_manual_save_skips_the_quiet_window() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);
        h.act(Action::Body("Y".into()), Instant::now());
        h.act(Action::Save, Instant::now());
        assert!(matches!(h.commands().as_slice(), [Command::UpdateMemo { .. }]));
        assert_eq!(h.editor.next_deadline(), None);
    }

    #[test]
    fn test_privacy_change_goes_out_immediately_without_autosave() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);

        h.act(Action::Private(true), Instant::now());
        let commands = h.commands();
        assert!(matches!(
            commands.as_slice(),
            [Command::UpdateSettings { id, is_private: true, group_id: None }] if *id == memo.id
        ));
        assert_eq!(h.editor.next_deadline(), None);
    }

    #[test]
    fn test_edits_during_a_save_wait_for_its_result() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);
        let t0 = Instant::now();

        h.act(Action::Body("X1".into()), t0);
        h.editor.fire_due(t0 + QUIET);
        assert_eq!(h.commands().len(), 1);

        h.act(Action::Body("X12".into()), t0 + QUIET + Duration::from_millis(50));
        h.editor.fire_due(t0 + QUIET * 10);
        assert!(h.commands().is_empty(), "second save while the first is in flight");

        let stored = saved(&memo, |snapshot| snapshot.content = "X1".into());
        h.editor.handle_persisted(Event::MemoUpdated {
            memo: stored.clone(),
            changes: ChangeSet::between(&memo.snapshot, &stored.snapshot),
        });
        assert_eq!(h.buffer().content, "X12");

        let Some(deadline) = h.editor.next_deadline() else {
            panic!("follow-up save to be armed");
        };
        h.editor.fire_due(deadline.max(t0 + QUIET * 10));
        let commands = h.commands();
        let [Command::UpdateMemo {
            base_updated_at, ..
        }] = commands.as_slice()
        else {
            panic!("expected the follow-up update, got {commands:?}");
        };
        assert_eq!(*base_updated_at, stored.updated_at);
    }

    #[test]
    fn test_switching_memos_drops_the_armed_save() {
        let mut h = Harness::new();
        let first = h.stored("first", "");
        let second = h.stored("second", "");
        h.open(&first);
        let t0 = Instant::now();
        h.act(Action::Title("first!".into()), t0);

        h.open(&second);
        h.editor.fire_due(t0 + QUIET * 2);
        assert!(h.commands().is_empty());
        assert!(!h.editor.sessions.contains_key(&MemoKey::Persisted(first.id)));
        assert_eq!(h.open_key(), Some(MemoKey::Persisted(second.id)));
    }

    #[test]
    fn test_save_in_flight_completes_after_close() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);
        let t0 = Instant::now();
        h.act(Action::Title("B".into()), t0);
        h.editor.fire_due(t0 + QUIET);
        h.commands();

        h.act(Action::Close, t0 + QUIET);
        let key = MemoKey::Persisted(memo.id);
        assert!(h.editor.sessions.contains_key(&key));

        let stored = saved(&memo, |snapshot| snapshot.title = "B".into());
        h.editor.handle_persisted(Event::MemoUpdated {
            memo: stored.clone(),
            changes: ChangeSet::between(&memo.snapshot, &stored.snapshot),
        });
        assert!(!h.editor.sessions.contains_key(&key));
        assert_eq!(h.editor.memos.get(&memo.id), Some(&stored));
        assert_eq!(h.open_key(), None);
    }

    #[test]
    fn test_conflict_reloads_and_keeps_unsaved_text() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);
        let t0 = Instant::now();
        h.act(Action::Body("mine".into()), t0);
        h.editor.fire_due(t0 + QUIET);
        h.commands();
        h.notices();

        let theirs = saved(&memo, |snapshot| snapshot.title = "Theirs".into());
        h.editor.handle_persisted(Event::Failure {
            origin: Origin::Update(memo.id),
            error: StoreError::Conflict {
                id: memo.id,
                expected: memo.updated_at,
                actual: theirs.updated_at,
            },
        });
        assert!(h.notices().contains(&Notice::Conflict(memo.id)));
        assert!(matches!(h.commands().as_slice(), [Command::LoadMemo(id)] if *id == memo.id));

        h.editor.handle_persisted(Event::MemoLoaded(theirs.clone()));
        assert_eq!(h.buffer().title, "Theirs");
        assert_eq!(h.buffer().content, "mine");
        assert!(h.notices().contains(&Notice::Refreshed {
            id: memo.id,
            kept: vec![Field::Content]
        }));

        let t1 = t0 + QUIET * 4;
        h.act(Action::Append("again".into()), t1);
        h.editor.fire_due(t1 + QUIET);
        let commands = h.commands();
        let [Command::UpdateMemo {
            changes,
            base_updated_at,
            ..
        }] = commands.as_slice()
        else {
            panic!("expected the retry, got {commands:?}");
        };
        assert_eq!(*base_updated_at, theirs.updated_at);
        assert_eq!(changes.fields(), vec![Field::Content]);
    }

    #[test]
    fn test_remote_update_is_merged_without_arming_a_save() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);

        let newer = saved(&memo, |snapshot| snapshot.content = "from elsewhere".into());
        h.editor
            .handle_inbound(remote(EventKind::MemoUpdate, &newer));
        assert_eq!(h.buffer().content, "from elsewhere");
        assert_eq!(h.editor.next_deadline(), None);
        assert!(h.commands().is_empty());
        assert_eq!(h.notices().len(), 1);

        // Replayed or reordered frames are dropped.
        h.editor
            .handle_inbound(remote(EventKind::MemoUpdate, &memo));
        assert_eq!(h.buffer().content, "from elsewhere");
        assert!(h.notices().is_empty());
    }

    #[test]
    fn test_remote_delete_of_edited_memo_keeps_text_as_draft() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);
        let t0 = Instant::now();
        h.act(Action::Body("unsaved".into()), t0);

        h.editor
            .handle_inbound(remote(EventKind::MemoDelete, &memo));
        let Some(MemoKey::Temporary(temp_id)) = h.open_key() else {
            panic!("expected the buffer to become a draft");
        };
        assert!(h.notices().contains(&Notice::RemoteDelete {
            id: memo.id,
            kept_as: Some(temp_id)
        }));
        assert_eq!(h.editor.next_deadline(), None);

        h.act(Action::Append("!".into()), t0 + QUIET);
        h.editor.fire_due(t0 + QUIET * 2);
        assert!(matches!(
            h.commands().as_slice(),
            [Command::CreateMemo { temp_id: sent, .. }] if *sent == temp_id
        ));
    }

    #[test]
    fn test_remote_delete_of_clean_memo_closes_it() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);
        h.editor
            .handle_inbound(remote(EventKind::MemoDelete, &memo));
        assert_eq!(h.open_key(), None);
        assert!(h.editor.sessions.is_empty());
        assert!(!h.editor.memos.contains_key(&memo.id));
    }

    #[test]
    fn test_restore_replaces_buffer_and_cancels_armed_save() {
        let mut h = Harness::new();
        let memo = h.stored("v3", "third");
        h.open(&memo);
        let t0 = Instant::now();
        h.act(Action::Title("typing".into()), t0);

        h.act(Action::Restore("1".into()), t0);
        assert!(matches!(
            h.commands().as_slice(),
            [Command::RestoreVersion { version: 1, .. }]
        ));

        let restored = saved(&memo, |snapshot| {
            snapshot.title = "v1".into();
            snapshot.content = "first".into();
        });
        h.editor.handle_persisted(Event::VersionRestored {
            memo: restored.clone(),
            version: MemoVersion {
                memo_id: memo.id,
                version: 4,
                title: "v1".into(),
                content: "first".into(),
                tags: Tags::default(),
                author_id: h.user,
                change_kind: ChangeKind::Restore,
                created_at: restored.updated_at,
            },
        });
        assert_eq!(h.buffer(), &restored.snapshot);
        assert_eq!(h.editor.next_deadline(), None);
        h.editor.fire_due(t0 + QUIET * 2);
        assert!(h.commands().is_empty());
    }

    #[test]
    fn test_draft_settings_go_out_with_the_create_and_later_changes_follow_it() {
        let mut h = Harness::new();
        let t0 = Instant::now();
        h.act(Action::New, t0);
        let Some(MemoKey::Temporary(temp_id)) = h.open_key() else {
            panic!("expected a draft");
        };
        h.act(Action::Private(true), t0);
        assert!(h.commands().is_empty());
        assert_eq!(h.editor.next_deadline(), None);

        h.act(Action::Title("New".into()), t0);
        h.editor.fire_due(t0 + QUIET);
        let commands = h.commands();
        let [Command::CreateMemo { draft, .. }] = commands.as_slice() else {
            panic!("expected a create, got {commands:?}");
        };
        assert!(draft.is_private);
        assert_eq!(draft.group_id, None);

        // Moved into a group while the create is still running.
        let group = GroupId::new();
        h.act(Action::Group(Some(group)), t0 + QUIET);
        assert!(h.commands().is_empty());

        let mut created = h.stored("New", "");
        created.snapshot.is_private = true;
        h.editor.handle_persisted(Event::MemoCreated {
            temp_id,
            memo: created.clone(),
        });
        let commands = h.commands();
        assert!(
            matches!(
                commands.as_slice(),
                [Command::UpdateSettings { id, is_private: true, group_id: Some(sent) }]
                    if *id == created.id && *sent == group
            ),
            "expected a settings update, got {commands:?}"
        );
    }

    #[test]
    fn test_save_without_a_user_does_not_leave_the_memo_stuck() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);
        let t0 = Instant::now();
        h.act(Action::Title("B".into()), t0);

        h.editor.user = None;
        h.editor.fire_due(t0 + QUIET);
        assert!(h.commands().is_empty());
        assert!(!h.editor.sessions[&MemoKey::Persisted(memo.id)].is_in_flight());
    }

    #[test]
    fn test_late_save_result_does_not_roll_back_a_newer_remote_state() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);
        h.act(Action::Body("mine".into()), Instant::now());
        h.act(Action::Save, Instant::now());
        assert_eq!(h.commands().len(), 1);

        let ours = saved(&memo, |snapshot| snapshot.content = "mine".into());
        let theirs = saved(&ours, |snapshot| snapshot.title = "theirs".into());
        h.editor
            .handle_inbound(remote(EventKind::MemoUpdate, &theirs));
        h.editor.handle_persisted(Event::MemoUpdated {
            memo: ours.clone(),
            changes: ChangeSet::between(&memo.snapshot, &ours.snapshot),
        });

        assert_eq!(h.editor.memos.get(&memo.id), Some(&theirs));
        assert_eq!(h.buffer().title, "theirs");
        assert_eq!(h.buffer().content, "mine");
        assert!(!h.editor.sessions[&MemoKey::Persisted(memo.id)].is_in_flight());
        assert_eq!(h.editor.next_deadline(), None);
    }

    #[test]
    fn test_non_numeric_versions_are_rejected_before_any_lookup() {
        let mut h = Harness::new();
        let memo = h.stored("A", "X");
        h.open(&memo);
        h.act(
            Action::Diff {
                from: "one".into(),
                to: "2".into(),
            },
            Instant::now(),
        );
        h.act(Action::Restore("latest".into()), Instant::now());
        assert!(h.commands().is_empty());
        let notices = h.notices();
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|notice| matches!(notice, Notice::Invalid(_))));
    }

    #[test]
    fn test_nothing_works_before_sign_in() {
        let (persist_tx, mut commands) = mpsc::unbounded_channel();
        let (notice_tx, mut notices) = mpsc::unbounded_channel();
        let realtime = RealtimeConnection::new(
            RealtimeHub::new(4),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
        );
        let mut editor = Editor::new(QUIET, false, persist_tx, realtime, notice_tx);
        editor.handle_action(Action::New, Instant::now());
        assert!(editor.open.is_none());
        assert!(commands.try_recv().is_err());
        assert!(matches!(notices.try_recv(), Ok(Notice::Invalid(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_saves_after_the_quiet_interval() {
        let (persist_tx, mut commands) = mpsc::unbounded_channel();
        let (persisted_tx, persisted_rx) = mpsc::unbounded_channel();
        let (notice_tx, mut notices) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let realtime = RealtimeConnection::new(
            RealtimeHub::new(4),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
        );
        let editor = Editor::new(QUIET, false, persist_tx, realtime, notice_tx);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(editor.run(action_rx, persisted_rx, cancel.clone()));

        let user = UserId::new();
        action_tx.send(Action::Login(user)).unwrap();
        assert!(matches!(commands.recv().await, Some(Command::ListMemos { .. })));

        let memo = Memo {
            id: MemoId::new(),
            snapshot: MemoSnapshot {
                title: "A".into(),
                ..Default::default()
            },
            author_id: user,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };
        persisted_tx.send(Event::MemosListed(vec![memo.clone()])).unwrap();
        loop {
            match notices.recv().await {
                Some(Notice::Listed(_)) => break,
                Some(_) => continue,
                None => panic!("editor stopped early"),
            }
        }

        let started = Instant::now();
        action_tx.send(Action::Open(memo.id)).unwrap();
        action_tx.send(Action::Title("B".into())).unwrap();
        let Some(Command::UpdateMemo { id, .. }) = commands.recv().await else {
            panic!("expected an autosave");
        };
        assert_eq!(id, memo.id);
        assert!(started.elapsed() >= QUIET);

        cancel.cancel();
        running.await.unwrap().unwrap();
    }
}
