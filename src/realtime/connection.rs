use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{Instant, sleep_until},
};
use tracing::{debug, info, trace, warn};

use super::{Envelope, EventKind, RealtimeError, RealtimeEvent, RealtimeHub, Topic};
use crate::{
    ids::{GroupId, MemoId, SessionId, UserId},
    memo::Memo,
};

/// Reconnect delay: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the upcoming attempt, counting it.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug)]
enum Link {
    Offline,
    Connected(broadcast::Receiver<Arc<str>>),
    Reconnecting { at: Instant },
}

/// One client's channel to the hub. Lives between `sign_in` and `sign_out`; an
/// abnormal close in between is repaired on its own with backoff.
#[derive(Debug)]
pub struct RealtimeConnection {
    hub: RealtimeHub,
    backoff: Backoff,
    session_id: SessionId,
    user: Option<UserId>,
    groups: BTreeSet<GroupId>,
    link: Link,
}

impl RealtimeConnection {
    pub fn new(hub: RealtimeHub, backoff: Backoff) -> Self {
        Self {
            hub,
            backoff,
            session_id: SessionId::new(),
            user: None,
            groups: BTreeSet::new(),
            link: Link::Offline,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected(_))
    }

    /// Opens the channel for `user` under a fresh session.
    pub fn sign_in(&mut self, user: UserId) {
        self.user = Some(user);
        self.session_id = SessionId::new();
        self.groups.clear();
        self.backoff.reset();
        self.connect();
    }

    /// Normal close: nothing is reconnected afterwards.
    pub fn sign_out(&mut self) {
        if let Some(user) = self.user.take() {
            info!("Realtime session {} of {user} closed", self.session_id);
        }
        self.groups.clear();
        self.link = Link::Offline;
    }

    pub fn join(&mut self, group: GroupId) {
        self.groups.insert(group);
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.user
            .map(Topic::User)
            .into_iter()
            .chain(self.groups.iter().copied().map(Topic::Group))
            .collect()
    }

    pub fn publish_memo(&self, kind: EventKind, memo: &Memo) -> Result<usize, RealtimeError> {
        self.publish(
            kind,
            memo.id,
            Some(memo.clone()),
            memo.snapshot.group_id,
            memo.snapshot.is_private,
        )
    }

    pub fn publish_delete(
        &self,
        memo_id: MemoId,
        group_id: Option<GroupId>,
        is_private: bool,
    ) -> Result<usize, RealtimeError> {
        self.publish(EventKind::MemoDelete, memo_id, None, group_id, is_private)
    }

    fn publish(
        &self,
        kind: EventKind,
        memo_id: MemoId,
        memo: Option<Memo>,
        group_id: Option<GroupId>,
        is_private: bool,
    ) -> Result<usize, RealtimeError> {
        let (Some(sender_id), true) = (self.user, self.is_connected()) else {
            return Err(RealtimeError::NotConnected);
        };
        let event = RealtimeEvent {
            kind,
            memo_id,
            memo,
            sender_id,
            session_id: self.session_id,
            group_id,
            is_private,
        };
        let envelope = Envelope {
            topics: event.topics(),
            event,
        };
        let frame: Arc<str> = serde_json::to_string(&envelope)?.into();
        Ok(self.hub.publish(frame))
    }

    /// Next event for one of our topics that did not come from this session.
    ///
    /// Never resolves while signed out. Cancel safe, so it can sit in a `select!`.
    pub async fn recv(&mut self) -> RealtimeEvent {
        loop {
            let received = match &mut self.link {
                Link::Offline => return std::future::pending().await,
                Link::Reconnecting { at } => {
                    let at = *at;
                    sleep_until(at).await;
                    self.connect();
                    continue;
                }
                Link::Connected(rx) => rx.recv().await,
            };
            match received {
                Ok(frame) => {
                    // Only a delivered frame proves the link works again.
                    self.backoff.reset();
                    if let Some(event) = self.accept(&frame) {
                        return event;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    self.backoff.reset();
                    warn!("Realtime subscription lagged behind, {skipped} frames lost");
                }
                Err(RecvError::Closed) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        "Realtime channel closed unexpectedly, reconnect attempt {} in {}",
                        self.backoff.attempt(),
                        humantime::format_duration(delay)
                    );
                    self.link = Link::Reconnecting {
                        at: Instant::now() + delay,
                    };
                }
            }
        }
    }

    fn connect(&mut self) {
        let Some(user) = self.user else {
            self.link = Link::Offline;
            return;
        };
        self.link = Link::Connected(self.hub.subscribe());
        info!("Realtime session {} connected for {user}", self.session_id);
    }

    fn accept(&self, frame: &str) -> Option<RealtimeEvent> {
        let envelope: Envelope = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Dropping undecodable realtime frame: {err}");
                return None;
            }
        };
        if envelope.event.session_id == self.session_id {
            trace!("Dropping echo of our own {}", envelope.event.kind);
            return None;
        }
        let topics = self.topics();
        if !envelope.topics.iter().any(|topic| topics.contains(topic)) {
            return None;
        }
        debug!(
            "Realtime {} for {} from {}",
            envelope.event.kind, envelope.event.memo_id, envelope.event.sender_id
        );
        Some(envelope.event)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use time::OffsetDateTime;
    use tokio::time::timeout;

    use super::*;
    use crate::memo::MemoSnapshot;

    const INITIAL: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(30);

    fn connection(hub: &RealtimeHub, user: UserId) -> RealtimeConnection {
        let mut connection = RealtimeConnection::new(hub.clone(), Backoff::new(INITIAL, MAX));
        connection.sign_in(user);
        connection
    }

    fn memo(author: UserId, group_id: Option<GroupId>) -> Memo {
        Memo {
            id: MemoId::new(),
            snapshot: MemoSnapshot {
                title: "shared".into(),
                group_id,
                ..Default::default()
            },
            author_id: author,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_backoff_doubles_until_capped_and_resets() {
        let mut backoff = Backoff::new(INITIAL, MAX);
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), INITIAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_session_is_filtered_but_other_sessions_of_the_user_are_not() {
        let hub = RealtimeHub::new(16);
        let user = UserId::new();
        let mut laptop = connection(&hub, user);
        let mut phone = connection(&hub, user);

        let memo = memo(user, None);
        laptop.publish_memo(EventKind::MemoUpdate, &memo).unwrap();

        let received = phone.recv().await;
        assert_eq!(received.memo_id, memo.id);
        assert_eq!(received.session_id, laptop.session_id());
        assert!(timeout(Duration::from_secs(5), laptop.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_frames_are_delivered_once_to_members_only() {
        let hub = RealtimeHub::new(16);
        let group = GroupId::new();
        let author = UserId::new();
        let sender = connection(&hub, author);
        let mut member = connection(&hub, UserId::new());
        member.join(group);
        let mut outsider = connection(&hub, UserId::new());

        // Addressed to the author's topic and the group topic.
        sender
            .publish_memo(EventKind::MemoCreate, &memo(author, Some(group)))
            .unwrap();

        assert_eq!(member.recv().await.kind, EventKind::MemoCreate);
        assert!(timeout(Duration::from_secs(5), member.recv()).await.is_err());
        assert!(timeout(Duration::from_secs(5), outsider.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_reconnects_after_backoff() {
        let hub = RealtimeHub::new(16);
        let user = UserId::new();
        let mut client = connection(&hub, user);

        hub.restart();
        assert!(timeout(Duration::from_millis(100), client.recv()).await.is_err());
        assert!(!client.is_connected());

        assert!(timeout(Duration::from_secs(2), client.recv()).await.is_err());
        assert!(client.is_connected());

        let other = connection(&hub, user);
        other
            .publish_delete(MemoId::new(), None, false)
            .unwrap();
        assert_eq!(client.recv().await.kind, EventKind::MemoDelete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_keeps_growing_until_a_frame_arrives() {
        let hub = RealtimeHub::new(16);
        let user = UserId::new();
        let mut client = connection(&hub, user);

        hub.restart();
        assert!(timeout(Duration::from_secs(2), client.recv()).await.is_err());
        assert!(client.is_connected());

        // Reconnected but nothing came through yet, so the next wait doubles.
        hub.restart();
        assert!(timeout(Duration::from_millis(1500), client.recv()).await.is_err());
        assert!(!client.is_connected());
        assert!(timeout(Duration::from_secs(1), client.recv()).await.is_err());
        assert!(client.is_connected());
        assert_eq!(client.backoff.attempt(), 2);

        let other = connection(&hub, user);
        other.publish_delete(MemoId::new(), None, false).unwrap();
        client.recv().await;
        assert_eq!(client.backoff.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_subscriber_skips_lost_frames_and_continues() {
        let hub = RealtimeHub::new(1);
        let user = UserId::new();
        let mut slow = connection(&hub, user);
        let fast = connection(&hub, user);

        let first = memo(user, None);
        let second = memo(user, None);
        fast.publish_memo(EventKind::MemoUpdate, &first).unwrap();
        fast.publish_memo(EventKind::MemoUpdate, &second).unwrap();

        let received = timeout(Duration::from_secs(5), slow.recv())
            .await
            .expect("delivery after the lag");
        assert_eq!(received.memo_id, second.id);
        assert!(slow.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_stops_publishing_and_reconnecting() {
        let hub = RealtimeHub::new(16);
        let user = UserId::new();
        let mut client = connection(&hub, user);
        client.sign_out();

        let err = client
            .publish_memo(EventKind::MemoUpdate, &memo(user, None))
            .unwrap_err();
        assert!(matches!(err, RealtimeError::NotConnected));

        hub.restart();
        assert!(timeout(Duration::from_secs(60), client.recv()).await.is_err());
        assert!(!client.is_connected());
    }
}
