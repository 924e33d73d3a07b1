//! Forward-secrecy key rotation.
//!
//! ```text
//! initiator                               responder
//! Empty
//!   request_new_key -> SendRequest
//!   -> WaitSendRequest --RequestKey-->    Empty -> SendAccept
//!   -> WaitRequestResponse                (waits until its state is saved)
//!                      <--AcceptKey--     -> WaitSendAccept -> WaitAcceptResponse
//!   SendCommit
//!   (waits until its state is saved)
//!   -> WaitSendCommit --CommitKey-->      swap keys -> Empty
//!   swap keys -> Empty
//! ```
//!
//! Every transition leaves the current key usable. A failed or aborted
//! exchange only discards the staged key.

use crate::state::{PfsStage, PfsState};
use crate::wire::Action;
use crate::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use sechat_crypto::{AuthKey, DhConfig, DhExchange, PrimeCache};

/// When to rotate keys and how long an exchange may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyPolicy {
    /// Rotate after this many messages under one key.
    pub message_threshold: i32,
    /// Rotate once the key is older than this (seconds).
    pub max_key_age: i64,
    /// Abort our request if the peer has not accepted within this (seconds).
    pub exchange_timeout: i64,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            message_threshold: 100,
            max_key_age: 7 * 24 * 60 * 60,
            exchange_timeout: 24 * 60 * 60,
        }
    }
}

fn random_exchange_id() -> i64 {
    loop {
        let id = OsRng.next_u64() as i64;
        if id != 0 {
            return id;
        }
    }
}

impl PfsState {
    /// Whether an automatic rotation is due.
    pub fn needs_rekey(&self, message_id: i32, now: i64, policy: &RekeyPolicy) -> bool {
        self.stage == PfsStage::Empty
            && self.other_auth_key.is_empty()
            && (self.last_message_id + policy.message_threshold < message_id
                || self.last_timestamp + policy.max_key_age < now)
    }

    /// Whether an exchange may start now.
    pub fn can_request_key(&self) -> bool {
        self.stage == PfsStage::Empty && self.other_auth_key.is_empty()
    }

    /// Starts an exchange as initiator.
    ///
    /// The new stage must be saved before anything else happens.
    ///
    /// # Errors
    /// Returns `Error::InvalidState` if an exchange is running or the previous
    /// key is still retained.
    pub fn request_new_key(&mut self, dh_config: &DhConfig, now: i64) -> Result<()> {
        if !self.can_request_key() {
            return Err(Error::InvalidState);
        }
        let mut handshake = DhExchange::new();
        handshake.set_config(dh_config)?;

        self.stage = PfsStage::SendRequest;
        self.handshake = handshake;
        self.exchange_id = random_exchange_id();
        self.exchange_timestamp = now;
        tracing::info!(exchange_id = self.exchange_id, "Requesting new key");
        Ok(())
    }

    /// Returns the next exchange action to send, if one is ready.
    ///
    /// Accept and commit wait until a state with `wait_message_id` is saved
    /// so that the staged key is never announced before it is durable.
    pub fn next_action(&mut self, saved_message_id: i32) -> Option<Action> {
        match self.stage {
            PfsStage::SendRequest => {
                self.stage = PfsStage::WaitSendRequest;
                Some(Action::RequestKey {
                    exchange_id: self.exchange_id,
                    g_a: self.handshake.own_public().to_vec(),
                })
            }
            PfsStage::SendAccept if saved_message_id >= self.wait_message_id => {
                self.stage = PfsStage::WaitSendAccept;
                Some(Action::AcceptKey {
                    exchange_id: self.exchange_id,
                    g_b: self.handshake.own_public().to_vec(),
                    key_fingerprint: self.other_auth_key.fingerprint(),
                })
            }
            PfsStage::SendCommit if saved_message_id >= self.wait_message_id => {
                self.stage = PfsStage::WaitSendCommit;
                Some(Action::CommitKey {
                    exchange_id: self.exchange_id,
                    key_fingerprint: self.other_auth_key.fingerprint(),
                })
            }
            _ => None,
        }
    }

    /// Replay protection shared by every action.
    ///
    /// Returns false for an action that was already processed before a
    /// restart; otherwise records its message id.
    pub fn admit_action(&mut self, message_id: i32, seq_message_id: i32) -> bool {
        if message_id <= self.message_id || message_id < seq_message_id {
            return false;
        }
        self.message_id = message_id;
        true
    }

    /// Applies one of our exchange actions once it is queued for sending.
    ///
    /// # Errors
    /// Returns `Error::InvalidState` if the action does not match the stage.
    pub fn on_outbound_action(&mut self, action: &Action, my_out_seq_no: i32, now: i64) -> Result<()> {
        match action {
            Action::RequestKey { .. } => {
                self.expect_stage(&[PfsStage::WaitSendRequest, PfsStage::SendRequest])?;
                self.stage = PfsStage::WaitRequestResponse;
            }
            Action::AcceptKey { .. } => {
                self.expect_stage(&[PfsStage::WaitSendAccept, PfsStage::SendAccept])?;
                self.stage = PfsStage::WaitAcceptResponse;
                self.handshake = DhExchange::new();
            }
            Action::CommitKey {
                key_fingerprint, ..
            } => {
                self.expect_stage(&[PfsStage::WaitSendCommit, PfsStage::SendCommit])?;
                if self.other_auth_key.fingerprint() != *key_fingerprint {
                    return Err(Error::InvalidState);
                }
                self.commit(my_out_seq_no, now);
            }
            _ => {}
        }
        Ok(())
    }

    /// Applies a peer exchange action.
    ///
    /// Returns an `AbortKey` to send back when the peer's action cannot be
    /// honoured without harming the current key.
    ///
    /// # Errors
    /// Returns a crypto error if the peer's public value fails validation.
    pub fn on_inbound_action(
        &mut self,
        action: &Action,
        dh_config: &DhConfig,
        primes: &PrimeCache,
        my_out_seq_no: i32,
        now: i64,
    ) -> Result<Option<Action>> {
        match action {
            Action::RequestKey { exchange_id, g_a } => {
                self.on_request_key(*exchange_id, g_a, dh_config, primes, now)
            }
            Action::AcceptKey {
                exchange_id,
                g_b,
                key_fingerprint,
            } => self.on_accept_key(*exchange_id, g_b, *key_fingerprint, primes, now),
            Action::AbortKey { exchange_id } => {
                self.on_abort_key(*exchange_id, now);
                Ok(None)
            }
            Action::CommitKey {
                exchange_id,
                key_fingerprint,
            } => {
                self.on_commit_key(*exchange_id, *key_fingerprint, my_out_seq_no, now);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Aborts our request if the peer did not answer in time.
    pub fn abort_if_expired(&mut self, now: i64, policy: &RekeyPolicy) -> Option<Action> {
        if self.stage != PfsStage::WaitRequestResponse
            || self.exchange_timestamp + policy.exchange_timeout >= now
        {
            return None;
        }
        tracing::warn!(exchange_id = self.exchange_id, "Key exchange timed out");
        let exchange_id = self.exchange_id;
        self.abort(now);
        Some(Action::AbortKey { exchange_id })
    }

    /// Drops the previous key once the peer proved it uses the current one.
    pub fn maybe_drop_other_key(&mut self, used_key_id: u64) -> bool {
        if self.can_forget_other_key
            && !self.other_auth_key.is_empty()
            && used_key_id == self.auth_key.id()
        {
            tracing::info!(key_id = used_key_id, "Dropping previous key");
            self.other_auth_key = AuthKey::empty();
            return true;
        }
        false
    }

    fn on_request_key(
        &mut self,
        exchange_id: i64,
        g_a: &[u8],
        dh_config: &DhConfig,
        primes: &PrimeCache,
        now: i64,
    ) -> Result<Option<Action>> {
        if matches!(
            self.stage,
            PfsStage::SendRequest | PfsStage::WaitSendRequest | PfsStage::WaitRequestResponse
        ) {
            if self.exchange_id > exchange_id {
                tracing::info!(exchange_id, "RequestKey: dropping the peer's concurrent request");
                return Ok(None);
            }
            self.stage = PfsStage::Empty;
            self.handshake = DhExchange::new();
            if self.exchange_id == exchange_id {
                tracing::warn!(exchange_id, "RequestKey: aborting both requests");
                return Ok(None);
            }
        }

        if self.stage != PfsStage::Empty || !self.other_auth_key.is_empty() {
            tracing::warn!(exchange_id, stage = ?self.stage, "Unexpected RequestKey");
            return Ok(Some(Action::AbortKey { exchange_id }));
        }

        let mut handshake = DhExchange::new();
        handshake.set_config(dh_config)?;
        handshake.set_peer_public(g_a);
        handshake.run_checks(primes)?;
        let key = handshake.gen_key()?;

        self.stage = PfsStage::SendAccept;
        self.exchange_id = exchange_id;
        self.exchange_timestamp = now;
        self.handshake = handshake;
        self.other_auth_key = key;
        self.can_forget_other_key = false;
        self.wait_message_id = self.message_id;
        Ok(None)
    }

    fn on_accept_key(
        &mut self,
        exchange_id: i64,
        g_b: &[u8],
        key_fingerprint: i64,
        primes: &PrimeCache,
        now: i64,
    ) -> Result<Option<Action>> {
        if self.stage != PfsStage::WaitRequestResponse || self.exchange_id != exchange_id {
            tracing::warn!(exchange_id, stage = ?self.stage, "AcceptKey does not match our request");
            return Ok(Some(Action::AbortKey { exchange_id }));
        }

        self.handshake.set_peer_public(g_b);
        self.handshake.run_checks(primes)?;
        let key = self.handshake.gen_key()?;
        if key.fingerprint() != key_fingerprint {
            tracing::warn!(exchange_id, "AcceptKey: key fingerprint mismatch");
            self.abort(now);
            return Ok(Some(Action::AbortKey { exchange_id }));
        }

        self.stage = PfsStage::SendCommit;
        self.handshake = DhExchange::new();
        self.other_auth_key = key;
        self.can_forget_other_key = false;
        self.wait_message_id = self.message_id;
        Ok(None)
    }

    fn on_abort_key(&mut self, exchange_id: i64, now: i64) {
        if self.exchange_id != exchange_id {
            tracing::info!(exchange_id, "AbortKey for another exchange ignored");
            return;
        }
        match self.stage {
            PfsStage::SendRequest
            | PfsStage::WaitSendRequest
            | PfsStage::WaitRequestResponse
            | PfsStage::SendAccept
            | PfsStage::WaitSendAccept
            | PfsStage::WaitAcceptResponse
            | PfsStage::SendCommit => {
                tracing::info!(exchange_id, "Peer aborted the key exchange");
                self.abort(now);
            }
            PfsStage::Empty | PfsStage::WaitSendCommit => {}
        }
    }

    fn on_commit_key(&mut self, exchange_id: i64, key_fingerprint: i64, my_out_seq_no: i32, now: i64) {
        if self.stage != PfsStage::WaitAcceptResponse
            || self.exchange_id != exchange_id
            || self.other_auth_key.fingerprint() != key_fingerprint
        {
            tracing::warn!(exchange_id, stage = ?self.stage, "Stale CommitKey ignored");
            return;
        }
        self.commit(my_out_seq_no, now);
    }

    fn commit(&mut self, my_out_seq_no: i32, now: i64) {
        core::mem::swap(&mut self.auth_key, &mut self.other_auth_key);
        self.can_forget_other_key = true;
        self.stage = PfsStage::Empty;
        self.handshake = DhExchange::new();
        self.last_message_id = self.message_id;
        self.last_timestamp = now;
        self.last_out_seq_no = my_out_seq_no;
        tracing::info!(
            exchange_id = self.exchange_id,
            key_id = self.auth_key.id(),
            "Key rotated"
        );
    }

    fn abort(&mut self, now: i64) {
        if !self.can_forget_other_key {
            self.other_auth_key = AuthKey::empty();
            self.can_forget_other_key = true;
        }
        self.stage = PfsStage::Empty;
        self.handshake = DhExchange::new();
        self.last_message_id = self.message_id;
        self.last_timestamp = now;
    }

    fn expect_stage(&self, stages: &[PfsStage]) -> Result<()> {
        if stages.contains(&self.stage) {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Side {
        pfs: PfsState,
        message_id: i32,
    }

    impl Side {
        fn new(key: &AuthKey) -> Self {
            Self {
                pfs: PfsState {
                    auth_key: key.clone(),
                    ..PfsState::default()
                },
                message_id: 0,
            }
        }

        fn send(&mut self, action: &Action) {
            self.message_id += 1;
            assert!(self.pfs.admit_action(self.message_id, self.message_id));
            self.pfs.on_outbound_action(action, self.message_id, 0).unwrap();
        }

        fn receive(&mut self, action: &Action, primes: &PrimeCache) -> Option<Action> {
            self.message_id += 1;
            assert!(self.pfs.admit_action(self.message_id, self.message_id));
            self.pfs
                .on_inbound_action(action, &DhConfig::modp_2048(), primes, 0, 0)
                .unwrap()
        }
    }

    fn primes() -> PrimeCache {
        let primes = PrimeCache::new();
        primes.add_good_prime(&DhConfig::modp_2048().prime);
        primes
    }

    fn initial_key() -> AuthKey {
        AuthKey::new(vec![7; 256])
    }

    #[test]
    fn test_full_exchange_rotates_both_sides() {
        let primes = primes();
        let mut a = Side::new(&initial_key());
        let mut b = Side::new(&initial_key());

        a.pfs.request_new_key(&DhConfig::modp_2048(), 0).unwrap();
        let request = a.pfs.next_action(0).unwrap();
        assert_eq!(a.pfs.stage, PfsStage::WaitSendRequest);
        a.send(&request);
        assert_eq!(a.pfs.stage, PfsStage::WaitRequestResponse);

        assert!(b.receive(&request, &primes).is_none());
        assert_eq!(b.pfs.stage, PfsStage::SendAccept);
        assert!(b.pfs.next_action(0).is_none());
        let accept = b.pfs.next_action(b.message_id).unwrap();
        b.send(&accept);
        assert_eq!(b.pfs.stage, PfsStage::WaitAcceptResponse);

        assert!(a.receive(&accept, &primes).is_none());
        assert_eq!(a.pfs.stage, PfsStage::SendCommit);
        let commit = a.pfs.next_action(a.message_id).unwrap();
        a.send(&commit);

        assert!(b.receive(&commit, &primes).is_none());

        assert_eq!(a.pfs.stage, PfsStage::Empty);
        assert_eq!(b.pfs.stage, PfsStage::Empty);
        assert_eq!(a.pfs.auth_key, b.pfs.auth_key);
        assert_ne!(a.pfs.auth_key, initial_key());
        assert_eq!(a.pfs.other_auth_key, initial_key());
        assert!(a.pfs.can_forget_other_key);

        assert!(!b.pfs.maybe_drop_other_key(initial_key().id()));
        assert!(b.pfs.maybe_drop_other_key(b.pfs.auth_key.id()));
        assert!(b.pfs.other_auth_key.is_empty());
    }

    #[test]
    fn test_mismatched_commit_keeps_current_key() {
        let primes = primes();
        let mut a = Side::new(&initial_key());
        let mut b = Side::new(&initial_key());

        a.pfs.request_new_key(&DhConfig::modp_2048(), 0).unwrap();
        let request = a.pfs.next_action(0).unwrap();
        a.send(&request);
        b.receive(&request, &primes);
        let accept = b.pfs.next_action(b.message_id).unwrap();
        b.send(&accept);

        let bogus = Action::CommitKey {
            exchange_id: b.pfs.exchange_id.wrapping_add(1),
            key_fingerprint: b.pfs.other_auth_key.fingerprint(),
        };
        assert!(b.receive(&bogus, &primes).is_none());
        assert_eq!(b.pfs.auth_key, initial_key());
        assert_eq!(b.pfs.stage, PfsStage::WaitAcceptResponse);
    }

    #[test]
    fn test_concurrent_requests_larger_id_wins() {
        let primes = primes();
        let mut a = Side::new(&initial_key());
        let mut b = Side::new(&initial_key());

        a.pfs.request_new_key(&DhConfig::modp_2048(), 0).unwrap();
        b.pfs.request_new_key(&DhConfig::modp_2048(), 0).unwrap();
        a.pfs.exchange_id = 10;
        b.pfs.exchange_id = 20;
        let a_request = a.pfs.next_action(0).unwrap();
        let b_request = b.pfs.next_action(0).unwrap();
        a.send(&a_request);
        b.send(&b_request);

        assert!(b.receive(&a_request, &primes).is_none());
        assert_eq!(b.pfs.stage, PfsStage::WaitRequestResponse);

        assert!(a.receive(&b_request, &primes).is_none());
        assert_eq!(a.pfs.stage, PfsStage::SendAccept);
        assert_eq!(a.pfs.exchange_id, 20);
    }

    #[test]
    fn test_abort_discards_staged_key() {
        let primes = primes();
        let mut a = Side::new(&initial_key());
        let mut b = Side::new(&initial_key());

        a.pfs.request_new_key(&DhConfig::modp_2048(), 0).unwrap();
        let request = a.pfs.next_action(0).unwrap();
        a.send(&request);
        b.receive(&request, &primes);
        assert!(!b.pfs.other_auth_key.is_empty());

        let abort = Action::AbortKey {
            exchange_id: a.pfs.exchange_id,
        };
        assert!(b.receive(&abort, &primes).is_none());
        assert_eq!(b.pfs.stage, PfsStage::Empty);
        assert!(b.pfs.other_auth_key.is_empty());
        assert!(b.pfs.can_forget_other_key);
        assert_eq!(b.pfs.auth_key, initial_key());
    }

    #[test]
    fn test_accept_for_unknown_exchange_is_answered_with_abort() {
        let primes = primes();
        let mut a = Side::new(&initial_key());
        let accept = Action::AcceptKey {
            exchange_id: 5,
            g_b: vec![1; 256],
            key_fingerprint: 0,
        };
        assert_eq!(
            a.receive(&accept, &primes),
            Some(Action::AbortKey { exchange_id: 5 })
        );
        assert_eq!(a.pfs.auth_key, initial_key());
    }

    #[test]
    fn test_request_expires() {
        let policy = RekeyPolicy::default();
        let mut pfs = PfsState {
            auth_key: initial_key(),
            message_id: 9,
            ..PfsState::default()
        };
        pfs.request_new_key(&DhConfig::modp_2048(), 1_000).unwrap();
        pfs.next_action(0);
        pfs.on_outbound_action(
            &Action::RequestKey {
                exchange_id: pfs.exchange_id,
                g_a: Vec::new(),
            },
            1,
            1_000,
        )
        .unwrap();

        assert!(pfs.abort_if_expired(1_000 + policy.exchange_timeout, &policy).is_none());
        let abort = pfs
            .abort_if_expired(1_001 + policy.exchange_timeout, &policy)
            .unwrap();
        assert!(matches!(abort, Action::AbortKey { .. }));
        assert_eq!(pfs.stage, PfsStage::Empty);
        assert_eq!(pfs.last_message_id, 9);
    }

    #[test]
    fn test_replay_protection() {
        let mut pfs = PfsState::default();
        assert!(pfs.admit_action(3, 3));
        assert!(!pfs.admit_action(3, 3));
        assert!(!pfs.admit_action(4, 5));
        assert!(pfs.admit_action(5, 5));
    }

    #[test]
    fn test_rekey_triggers() {
        let policy = RekeyPolicy::default();
        let pfs = PfsState {
            last_timestamp: 1_000,
            ..PfsState::default()
        };
        assert!(!pfs.needs_rekey(100, 1_000, &policy));
        assert!(pfs.needs_rekey(101, 1_000, &policy));
        assert!(pfs.needs_rekey(1, 1_001 + policy.max_key_age, &policy));

        let retaining = PfsState {
            other_auth_key: initial_key(),
            last_timestamp: 1_000,
            ..PfsState::default()
        };
        assert!(!retaining.needs_rekey(500, 1_000, &policy));
    }
}
