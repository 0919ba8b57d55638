//! Channel presence membership.
//!
//! A [`PresenceMap`] holds the convergent view of who is present on a
//! channel, keyed by member key (`clientId:connectionId`). Updates are
//! applied only when they pass the newness comparison against the stored
//! entry, so out-of-order delivery cannot resurrect stale state.
//!
//! The service may deliver the full membership in several `SYNC` parts.
//! While a sync is running every member touched is marked as seen; when the
//! last part arrives anything that was not seen has left.

use ripple_protocol::{ErrorInfo, PresenceAction, PresenceMessage};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Position within a multi-part sync, parsed from `<sequenceId>:<cursor>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub sequence_id: String,
    /// More parts follow.
    pub has_more: bool,
}

impl SyncCursor {
    /// Parse a channel serial carried on a `SYNC` envelope.
    ///
    /// A missing serial means the whole membership fits in one part.
    #[must_use]
    pub fn parse(serial: Option<&str>) -> Self {
        match serial {
            None => Self {
                sequence_id: String::new(),
                has_more: false,
            },
            Some(serial) => match serial.split_once(':') {
                Some((sequence_id, cursor)) => Self {
                    sequence_id: sequence_id.to_string(),
                    has_more: !cursor.is_empty(),
                },
                None => Self {
                    sequence_id: serial.to_string(),
                    has_more: false,
                },
            },
        }
    }
}

/// Membership of one channel.
#[derive(Debug, Default)]
pub struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    seen: HashSet<String>,
    /// Keys first inserted by the running sync.
    inserted_by_sync: HashSet<String>,
    sync_sequence: Option<String>,
    sync_in_progress: bool,
    sync_complete: bool,
}

impl PresenceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress
    }

    #[must_use]
    pub fn sync_complete(&self) -> bool {
        self.sync_complete
    }

    /// Number of present members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, member_key: &str) -> Option<&PresenceMessage> {
        self.members
            .get(member_key)
            .filter(|m| m.action != PresenceAction::Absent)
    }

    /// Snapshot of present members.
    #[must_use]
    pub fn values(&self) -> Vec<PresenceMessage> {
        let mut members: Vec<PresenceMessage> = self
            .members
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.member_key().cmp(&b.member_key()));
        members
    }

    /// Begin a sync sequence.
    ///
    /// A sync started without a sequence id (on attach) adopts the id of
    /// the first `SYNC` part. Starting a different sequence while one is
    /// running discards members the unfinished sequence inserted but never
    /// confirmed.
    pub fn start_sync(&mut self, sequence_id: Option<&str>) {
        let sequence_id = sequence_id.map(str::to_string);
        if self.sync_in_progress {
            if self.sync_sequence == sequence_id {
                return;
            }
            if self.sync_sequence.is_none() {
                self.sync_sequence = sequence_id;
                return;
            }
            for key in self.inserted_by_sync.drain() {
                self.members.remove(&key);
            }
            debug!("Presence sync restarted");
        }

        self.seen.clear();
        self.inserted_by_sync.clear();
        self.sync_sequence = sequence_id;
        self.sync_in_progress = true;
        self.sync_complete = false;
    }

    fn is_newer(&self, key: &str, incoming: &PresenceMessage) -> Result<bool, ErrorInfo> {
        match self.members.get(key) {
            None => Ok(true),
            Some(existing) => incoming.is_newer_than(existing),
        }
    }

    fn mark_seen(&mut self, key: &str) {
        if self.sync_in_progress {
            self.seen.insert(key.to_string());
        }
    }

    /// Apply an `Enter`, `Update` or `Present` from a `PRESENCE` envelope.
    ///
    /// Returns `true` if the map changed and the event should be delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if a non-synthesized id is malformed.
    pub fn put(&mut self, message: &PresenceMessage) -> Result<bool, ErrorInfo> {
        self.apply_present(message, false)
    }

    /// Apply a member carried by a `SYNC` part.
    ///
    /// Members first inserted this way are discarded if a different
    /// sequence replaces the running one.
    ///
    /// # Errors
    ///
    /// Returns an error if a non-synthesized id is malformed.
    pub fn sync_put(&mut self, message: &PresenceMessage) -> Result<bool, ErrorInfo> {
        self.apply_present(message, true)
    }

    fn apply_present(
        &mut self,
        message: &PresenceMessage,
        from_sync: bool,
    ) -> Result<bool, ErrorInfo> {
        let key = message.member_key();
        self.mark_seen(&key);
        if !self.is_newer(&key, message)? {
            trace!(member = %key, "Stale presence update ignored");
            return Ok(false);
        }

        let mut stored = message.clone();
        stored.action = PresenceAction::Present;
        let inserted = self.members.insert(key.clone(), stored).is_none();
        if inserted && from_sync && self.sync_in_progress {
            self.inserted_by_sync.insert(key);
        } else if !from_sync {
            self.inserted_by_sync.remove(&key);
        }
        Ok(true)
    }

    /// Apply a `Leave`.
    ///
    /// Outside a sync the member is deleted and `true` returned. During a
    /// sync a known member is kept as `Absent` until the sync ends, and
    /// `false` returned; the leave is reported by
    /// [`end_sync`](Self::end_sync). A leave that fails newness, or one for
    /// a member never seen during a sync, changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a non-synthesized id is malformed.
    pub fn remove(&mut self, message: &PresenceMessage) -> Result<bool, ErrorInfo> {
        let key = message.member_key();
        if !self.is_newer(&key, message)? {
            trace!(member = %key, "Stale presence leave ignored");
            return Ok(false);
        }

        if self.sync_in_progress {
            if !self.members.contains_key(&key) {
                trace!(member = %key, "Leave for unknown member during sync ignored");
                return Ok(false);
            }
            let mut absent = message.clone();
            absent.action = PresenceAction::Absent;
            self.members.insert(key.clone(), absent);
            self.mark_seen(&key);
            return Ok(false);
        }

        Ok(self.members.remove(&key).is_some())
    }

    /// Finish the running sync.
    ///
    /// Members not seen during the sync, and members that left during it,
    /// are removed. A synthesized `Leave` stamped `now` is returned for
    /// each.
    pub fn end_sync(&mut self, now: i64) -> Vec<PresenceMessage> {
        let mut leaves = Vec::new();
        if self.sync_in_progress {
            let gone: Vec<String> = self
                .members
                .iter()
                .filter(|(key, m)| m.action == PresenceAction::Absent || !self.seen.contains(*key))
                .map(|(key, _)| key.clone())
                .collect();

            for key in gone {
                if let Some(member) = self.members.remove(&key) {
                    leaves.push(member.synthesized_leave(now));
                }
            }
            leaves.sort_by(|a, b| a.member_key().cmp(&b.member_key()));
            debug!(left = leaves.len(), members = self.members.len(), "Presence sync complete");
        }

        self.seen.clear();
        self.inserted_by_sync.clear();
        self.sync_sequence = None;
        self.sync_in_progress = false;
        self.sync_complete = true;
        leaves
    }

    /// Remove every member, returning a synthesized `Leave` for each.
    ///
    /// Used when the channel attaches without presence: nobody is there.
    pub fn leave_all(&mut self, now: i64) -> Vec<PresenceMessage> {
        let mut leaves: Vec<PresenceMessage> = self
            .members
            .drain()
            .filter(|(_, m)| m.action != PresenceAction::Absent)
            .map(|(_, m)| m.synthesized_leave(now))
            .collect();
        leaves.sort_by(|a, b| a.member_key().cmp(&b.member_key()));
        self.end_sync(now);
        leaves
    }

    /// Drop all state without emitting events.
    pub fn clear(&mut self) {
        self.members.clear();
        self.seen.clear();
        self.inserted_by_sync.clear();
        self.sync_sequence = None;
        self.sync_in_progress = false;
        self.sync_complete = false;
    }
}

/// Presence entered by this connection, keyed by client id, re-entered
/// automatically after the channel re-attaches without continuity.
#[derive(Debug, Default)]
pub struct LocalMembers {
    members: HashMap<String, PresenceMessage>,
}

impl LocalMembers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a presence event if it belongs to `connection_id`.
    pub fn apply(&mut self, message: &PresenceMessage, connection_id: Option<&str>) {
        if connection_id != Some(message.connection_id.as_str()) {
            return;
        }
        match message.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                self.members
                    .insert(message.client_id.clone(), message.clone());
            }
            PresenceAction::Leave if !message.is_synthesized() => {
                self.members.remove(&message.client_id);
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn values(&self) -> Vec<PresenceMessage> {
        let mut members: Vec<PresenceMessage> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        members
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}
