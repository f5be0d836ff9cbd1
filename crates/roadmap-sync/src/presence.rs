//! Who is online.
//!
//! Presence is advisory: no persistence, no conflict resolution. The last
//! broadcast for a user wins, and a user stays listed while any of their
//! sessions is present. Bursts of join/leave (a reconnect storm) are folded
//! into one published snapshot per coalesce window.

use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use roadmap_types::{SessionId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::SharedPresence;

/// What a session broadcasts about itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMember {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Events on a presence channel.
#[derive(Clone, Debug, PartialEq)]
pub enum PresenceEvent {
    /// Full state of the channel; replaces whatever was known.
    Sync(Vec<PresenceMember>),
    Join(PresenceMember),
    Leave(PresenceMember),
}

struct RosterEntry {
    member: PresenceMember,
    sessions: HashSet<SessionId>,
}

/// De-duplicated presence list, in first-seen order.
#[derive(Default)]
pub struct Roster {
    users: IndexMap<UserId, RosterEntry>,
}

impl Roster {
    /// Fold one event in. Returns whether the visible list changed.
    pub fn apply(&mut self, event: PresenceEvent) -> bool {
        match event {
            PresenceEvent::Sync(members) => {
                let before = self.members();
                self.users.clear();
                for member in members {
                    self.join(member);
                }
                self.members() != before
            }
            PresenceEvent::Join(member) => self.join(member),
            PresenceEvent::Leave(member) => self.leave(&member),
        }
    }

    fn join(&mut self, member: PresenceMember) -> bool {
        match self.users.get_mut(&member.user_id) {
            Some(entry) => {
                entry.sessions.insert(member.session_id);
                let changed = entry.member.name != member.name || entry.member.avatar != member.avatar;
                entry.member = member;
                changed
            }
            None => {
                let sessions = HashSet::from([member.session_id]);
                self.users.insert(member.user_id, RosterEntry { member, sessions });
                true
            }
        }
    }

    fn leave(&mut self, member: &PresenceMember) -> bool {
        let Some(entry) = self.users.get_mut(&member.user_id) else {
            return false;
        };
        entry.sessions.remove(&member.session_id);
        if entry.sessions.is_empty() {
            self.users.shift_remove(&member.user_id);
            true
        } else {
            false
        }
    }

    /// One member per user.
    pub fn members(&self) -> Vec<PresenceMember> {
        self.users.values().map(|e| e.member.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.users.contains_key(&user)
    }
}

/// A joined presence channel.
///
/// Dropping the tracker leaves the channel.
pub struct PresenceTracker {
    transport: SharedPresence,
    channel: String,
    session_id: SessionId,
    members_rx: watch::Receiver<Vec<PresenceMember>>,
    task: JoinHandle<()>,
    left: bool,
}

impl PresenceTracker {
    /// Join `channel` as `me` and start folding its events.
    pub async fn join(
        transport: SharedPresence,
        channel: &str,
        me: PresenceMember,
        coalesce: Duration,
    ) -> Result<Self, StoreError> {
        let events = transport.join(channel, me.session_id).await?;
        transport.track(channel, me.clone()).await?;
        let (members_tx, members_rx) = watch::channel(Vec::new());
        let task = tokio::spawn(run_roster(events, members_tx, coalesce));
        debug!(channel, session = %me.session_id, "joined presence channel");
        Ok(Self {
            transport,
            channel: channel.to_string(),
            session_id: me.session_id,
            members_rx,
            task,
            left: false,
        })
    }

    /// Latest published roster.
    pub fn members(&self) -> Vec<PresenceMember> {
        self.members_rx.borrow().clone()
    }

    /// Receiver that changes once per coalesced burst.
    pub fn watch(&self) -> watch::Receiver<Vec<PresenceMember>> {
        self.members_rx.clone()
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Leave the channel and wait for the transport to acknowledge.
    pub async fn leave(mut self) -> Result<(), StoreError> {
        self.left = true;
        self.task.abort();
        self.transport.leave(&self.channel, self.session_id).await
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.task.abort();
        if self.left {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = self.transport.clone();
        let channel = std::mem::take(&mut self.channel);
        let session = self.session_id;
        handle.spawn(async move {
            if let Err(err) = transport.leave(&channel, session).await {
                warn!(channel, error = %err, "presence leave failed");
            }
        });
    }
}

async fn run_roster(
    mut events: mpsc::UnboundedReceiver<PresenceEvent>,
    members_tx: watch::Sender<Vec<PresenceMember>>,
    window: Duration,
) {
    let mut roster = Roster::default();
    loop {
        let Some(first) = events.recv().await else {
            break;
        };
        let mut changed = roster.apply(first);
        let mut closed = false;

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                next = events.recv() => match next {
                    Some(event) => changed |= roster.apply(event),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        if changed {
            debug!(online = roster.len(), "presence roster updated");
            members_tx.send_replace(roster.members());
        }
        if closed {
            break;
        }
    }
}
