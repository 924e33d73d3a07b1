//! Ordered commit of compact state.
//!
//! Memory moves first. Every message event registers a change carrying a
//! snapshot of whatever record it modified; once the event is synced the
//! change is started, and changes are written to the key-value store strictly
//! in registration order. Only the newest snapshot of each released batch is
//! written since it supersedes the older ones.

use crate::context::SecretChatDb;
use crate::Result;
use sechat_core::{ChangeToken, ChangesProcessor, PfsState, SeqNoState};

struct StateChange<H> {
    seq: Option<SeqNoState>,
    pfs: Option<PfsState>,
    hook: H,
}

/// Change tracker of one chat.
pub struct ChangeLog<H> {
    processor: ChangesProcessor<StateChange<H>>,
    seq_changed: bool,
    pfs_changed: bool,
    saved_pfs_message_id: i32,
}

impl<H> ChangeLog<H> {
    /// Tracker for a chat whose saved `PfsState` has `saved_pfs_message_id`.
    pub fn new(saved_pfs_message_id: i32) -> Self {
        Self {
            processor: ChangesProcessor::new(),
            seq_changed: false,
            pfs_changed: false,
            saved_pfs_message_id,
        }
    }

    /// `SeqNoState` moved since the last registered change.
    pub fn mark_seq_changed(&mut self) {
        self.seq_changed = true;
    }

    /// `PfsState` moved since the last registered change.
    pub fn mark_pfs_changed(&mut self) {
        self.pfs_changed = true;
    }

    /// Message id of the newest `PfsState` in the store.
    pub fn saved_pfs_message_id(&self) -> i32 {
        self.saved_pfs_message_id
    }

    /// Number of changes not yet written.
    pub fn pending(&self) -> usize {
        self.processor.len()
    }

    /// Registers a change with the current snapshots.
    ///
    /// `hook` comes back from [`ChangeLog::start`] once the change is written.
    pub fn add(&mut self, seq: &SeqNoState, pfs: &PfsState, hook: H) -> ChangeToken {
        let change = StateChange {
            seq: self.seq_changed.then_some(*seq),
            pfs: self.pfs_changed.then(|| pfs.clone()),
            hook,
        };
        self.seq_changed = false;
        self.pfs_changed = false;
        self.processor.add(change)
    }

    /// Starts a change whose event is synced.
    ///
    /// Writes every change released in order and returns their hooks.
    ///
    /// # Errors
    /// Returns the store error; the chat must close since the released
    /// changes can no longer be written in order.
    pub fn start(&mut self, token: ChangeToken, db: &SecretChatDb) -> Result<Vec<H>> {
        let mut seq = None;
        let mut pfs = None;
        let mut hooks = Vec::new();
        self.processor.finish(token, |change| {
            if change.seq.is_some() {
                seq = change.seq;
            }
            if change.pfs.is_some() {
                pfs = change.pfs;
            }
            hooks.push(change.hook);
        });

        if let Some(seq) = seq {
            tracing::debug!(message_id = seq.message_id, "Saving sequence state");
            db.set_value(&seq)?;
        }
        if let Some(pfs) = pfs {
            tracing::debug!(message_id = pfs.message_id, stage = ?pfs.stage, "Saving pfs state");
            db.set_value(&pfs)?;
            self.saved_pfs_message_id = pfs.message_id;
        }
        Ok(hooks)
    }

    /// Drops every pending change.
    pub fn clear(&mut self) {
        self.processor.clear();
        self.seq_changed = false;
        self.pfs_changed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryKeyValueStore;
    use sechat_core::ChatId;
    use std::sync::Arc;

    fn db() -> SecretChatDb {
        SecretChatDb::new(Arc::new(MemoryKeyValueStore::new()), ChatId(1))
    }

    #[test]
    fn test_changes_written_in_registration_order() {
        let db = db();
        let mut log = ChangeLog::new(0);
        let mut seq = SeqNoState::default();
        let pfs = PfsState::default();

        seq.message_id = 1;
        log.mark_seq_changed();
        let first = log.add(&seq, &pfs, "first");
        seq.message_id = 2;
        log.mark_seq_changed();
        let second = log.add(&seq, &pfs, "second");

        assert!(log.start(second, &db).unwrap().is_empty());
        assert_eq!(db.get_value::<SeqNoState>().unwrap(), None);

        assert_eq!(log.start(first, &db).unwrap(), vec!["first", "second"]);
        assert_eq!(db.get_value::<SeqNoState>().unwrap(), Some(seq));
        assert_eq!(log.pending(), 0);
    }

    #[test]
    fn test_pfs_snapshot_tracks_saved_message_id() {
        let db = db();
        let mut log = ChangeLog::new(0);
        let seq = SeqNoState::default();
        let mut pfs = PfsState::default();

        pfs.message_id = 7;
        log.mark_pfs_changed();
        let token = log.add(&seq, &pfs, ());
        pfs.message_id = 8;

        log.start(token, &db).unwrap();
        assert_eq!(log.saved_pfs_message_id(), 7);
        assert_eq!(db.get_value::<PfsState>().unwrap().map(|p| p.message_id), Some(7));
    }

    #[test]
    fn test_unchanged_records_are_not_written() {
        let db = db();
        let mut log = ChangeLog::new(3);
        let token = log.add(&SeqNoState::default(), &PfsState::default(), ());
        log.start(token, &db).unwrap();
        assert_eq!(db.get_value::<SeqNoState>().unwrap(), None);
        assert_eq!(log.saved_pfs_message_id(), 3);
    }
}
