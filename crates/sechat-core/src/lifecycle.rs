//! Chat lifecycle: creation, acceptance and discard.
//!
//! The creator moves `Empty -> SendRequest -> WaitRequestResponse -> Ready`;
//! the invited side moves `Empty -> SendAccept -> WaitAcceptResponse -> Ready`.
//! Either side may jump to `Closed` at any time. The transitions here are pure;
//! the engine turns [`HandshakeRequest`]s into RPCs and feeds server envelopes
//! back through [`AuthState::on_update`].

use crate::state::{AuthState, ChatState, PfsState};
use crate::types::{ChatId, UserId};
use crate::{Error, Result};
use sechat_crypto::dh::check_config;
use sechat_crypto::{DhConfig, DhExchange, PrimeCache};

/// Chat envelope pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptedChat {
    /// Chat does not exist.
    Empty {
        /// Chat id.
        id: ChatId,
    },
    /// Request delivered; the peer has not accepted yet.
    Waiting {
        /// Chat id.
        id: ChatId,
        /// Access hash.
        access_hash: i64,
        /// Server date.
        date: i32,
    },
    /// A peer invites us.
    Requested {
        /// Chat id.
        id: ChatId,
        /// Access hash.
        access_hash: i64,
        /// Server date.
        date: i32,
        /// Inviting user.
        admin_id: UserId,
        /// Access hash of the inviting user.
        admin_access_hash: i64,
        /// Creator's public value.
        g_a: Vec<u8>,
        /// Folder to place the chat in.
        folder_id: i32,
    },
    /// Both sides contributed their public values.
    Accepted {
        /// Chat id.
        id: ChatId,
        /// Access hash.
        access_hash: i64,
        /// Server date.
        date: i32,
        /// The other side's public value.
        g_a_or_b: Vec<u8>,
        /// Fingerprint of the derived key.
        key_fingerprint: i64,
    },
    /// Chat discarded by the peer or the server.
    Discarded {
        /// Chat id.
        id: ChatId,
        /// Whether the history was deleted too.
        history_deleted: bool,
    },
}

impl EncryptedChat {
    /// Chat id of the envelope.
    pub fn id(&self) -> ChatId {
        match self {
            EncryptedChat::Empty { id }
            | EncryptedChat::Waiting { id, .. }
            | EncryptedChat::Requested { id, .. }
            | EncryptedChat::Accepted { id, .. }
            | EncryptedChat::Discarded { id, .. } => *id,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            EncryptedChat::Empty { .. } => "Empty",
            EncryptedChat::Waiting { .. } => "Waiting",
            EncryptedChat::Requested { .. } => "Requested",
            EncryptedChat::Accepted { .. } => "Accepted",
            EncryptedChat::Discarded { .. } => "Discarded",
        }
    }
}

/// Handshake message to hand to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRequest {
    /// Invite a user.
    Request {
        /// Invited user.
        user_id: UserId,
        /// Access hash of the invited user.
        user_access_hash: i64,
        /// Random id; becomes the chat id.
        random_id: i32,
        /// Our public value.
        g_a: Vec<u8>,
    },
    /// Accept an invitation.
    Accept {
        /// Chat id.
        chat_id: ChatId,
        /// Access hash of the chat.
        access_hash: i64,
        /// Our public value.
        g_b: Vec<u8>,
        /// Fingerprint of the derived key.
        key_fingerprint: i64,
    },
}

/// Result of applying a create event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The chat was empty and the request is now pending.
    Started,
    /// The request is already underway.
    Resumed,
    /// The chat moved past creation; the create event can be dropped.
    Obsolete,
}

/// Result of applying a server envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The envelope did not match the current state.
    Ignored,
    /// Common info or state changed.
    Updated,
    /// The key is established.
    Ready,
    /// The chat must be closed.
    Discarded {
        /// Whether the history was deleted too.
        history_deleted: bool,
    },
}

/// Chat status reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStatus {
    /// Handshake in progress.
    Waiting,
    /// Messages can be exchanged.
    Active,
    /// Chat discarded.
    Closed,
}

impl AuthState {
    /// Status visible to the application.
    pub fn status(&self) -> ChatStatus {
        match self.state {
            ChatState::Ready => ChatStatus::Active,
            ChatState::Closed => ChatStatus::Closed,
            _ => ChatStatus::Waiting,
        }
    }

    /// Applies a local request to create the chat.
    pub fn apply_create(
        &mut self,
        random_id: i32,
        user_id: UserId,
        user_access_hash: i64,
        now: i32,
    ) -> CreateOutcome {
        match self.state {
            ChatState::Empty => {
                self.id = ChatId(random_id);
                self.user_id = user_id;
                self.user_access_hash = user_access_hash;
                self.random_id = random_id;
                self.state = ChatState::SendRequest;
                self.x = 0;
                self.date = now;
                CreateOutcome::Started
            }
            ChatState::SendRequest | ChatState::WaitRequestResponse => CreateOutcome::Resumed,
            _ => CreateOutcome::Obsolete,
        }
    }

    /// Validates and stores group parameters fetched from the server.
    ///
    /// Before the first public value is drawn the handshake adopts the group.
    ///
    /// # Errors
    /// Returns a crypto error if the prime or generator is unacceptable.
    pub fn set_dh_config(&mut self, config: DhConfig, primes: &PrimeCache) -> Result<()> {
        check_config(config.g, &config.prime, primes)?;
        if !self.handshake.has_config()
            && matches!(
                self.state,
                ChatState::Empty | ChatState::SendRequest | ChatState::SendAccept
            )
        {
            self.handshake.set_config(&config)?;
        }
        self.dh_config = config;
        Ok(())
    }

    /// Advances the handshake and returns the next message for the server.
    ///
    /// On the invited side this derives the key into `pfs.auth_key`.
    pub fn next_request(
        &mut self,
        primes: &PrimeCache,
        pfs: &mut PfsState,
    ) -> Result<Option<HandshakeRequest>> {
        match self.state {
            ChatState::SendRequest if self.handshake.has_config() => {
                self.state = ChatState::WaitRequestResponse;
                Ok(Some(HandshakeRequest::Request {
                    user_id: self.user_id,
                    user_access_hash: self.user_access_hash,
                    random_id: self.random_id,
                    g_a: self.handshake.own_public().to_vec(),
                }))
            }
            ChatState::SendAccept if self.handshake.has_config() => {
                self.derive_key(primes, pfs)?;
                self.state = ChatState::WaitAcceptResponse;
                Ok(Some(HandshakeRequest::Accept {
                    chat_id: self.id,
                    access_hash: self.access_hash,
                    g_b: self.handshake.own_public().to_vec(),
                    key_fingerprint: pfs.auth_key.fingerprint(),
                }))
            }
            _ => Ok(None),
        }
    }

    /// Applies a server envelope.
    ///
    /// # Errors
    /// Returns `Error::ProtocolViolation` for a chat id or key fingerprint
    /// mismatch and a crypto error if the peer's public value is invalid.
    pub fn on_update(
        &mut self,
        update: &EncryptedChat,
        primes: &PrimeCache,
        pfs: &mut PfsState,
        now: i32,
    ) -> Result<UpdateOutcome> {
        match update {
            EncryptedChat::Empty { .. } => Ok(UpdateOutcome::Ignored),
            EncryptedChat::Requested {
                id,
                access_hash,
                admin_id,
                admin_access_hash,
                g_a,
                folder_id,
                ..
            } => {
                if self.state != ChatState::Empty {
                    tracing::info!(chat_id = %self.id, "Unexpected Requested envelope ignored");
                    return Ok(UpdateOutcome::Ignored);
                }
                self.save_common_info(*id, *access_hash)?;
                self.state = ChatState::SendAccept;
                self.x = 1;
                self.user_id = *admin_id;
                self.user_access_hash = *admin_access_hash;
                self.date = now;
                self.handshake.set_peer_public(g_a);
                self.initial_folder_id = *folder_id;
                Ok(UpdateOutcome::Updated)
            }
            EncryptedChat::Waiting {
                id, access_hash, ..
            } => {
                if !self.is_waiting_for_server() {
                    tracing::info!(chat_id = %self.id, "Unexpected Waiting envelope ignored");
                    return Ok(UpdateOutcome::Ignored);
                }
                self.save_common_info(*id, *access_hash)?;
                Ok(UpdateOutcome::Updated)
            }
            EncryptedChat::Accepted {
                id,
                access_hash,
                g_a_or_b,
                key_fingerprint,
                ..
            } => {
                if !self.is_waiting_for_server() {
                    tracing::info!(chat_id = %self.id, "Unexpected Accepted envelope ignored");
                    return Ok(UpdateOutcome::Ignored);
                }
                self.save_common_info(*id, *access_hash)?;
                if self.state == ChatState::WaitRequestResponse {
                    self.handshake.set_peer_public(g_a_or_b);
                    self.derive_key(primes, pfs)?;
                } else if pfs.auth_key.is_empty() {
                    self.derive_key(primes, pfs)?;
                }
                if pfs.auth_key.fingerprint() != *key_fingerprint {
                    return Err(Error::ProtocolViolation("Key fingerprint mismatch".into()));
                }
                self.state = ChatState::Ready;
                self.handshake = DhExchange::new();
                Ok(UpdateOutcome::Ready)
            }
            EncryptedChat::Discarded {
                history_deleted, ..
            } => Ok(UpdateOutcome::Discarded {
                history_deleted: *history_deleted,
            }),
        }
    }

    fn is_waiting_for_server(&self) -> bool {
        matches!(
            self.state,
            ChatState::WaitRequestResponse | ChatState::WaitAcceptResponse
        )
    }

    fn save_common_info(&mut self, id: ChatId, access_hash: i64) -> Result<()> {
        if self.id != id {
            return Err(Error::ProtocolViolation(format!(
                "chat id mismatch: expected {}, got {}",
                self.id, id
            )));
        }
        self.access_hash = access_hash;
        Ok(())
    }

    fn derive_key(&mut self, primes: &PrimeCache, pfs: &mut PfsState) -> Result<()> {
        self.handshake.run_checks(primes)?;
        pfs.auth_key = self.handshake.gen_key()?;
        self.key_hash = pfs.auth_key.key_hash();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primes() -> PrimeCache {
        let primes = PrimeCache::new();
        primes.add_good_prime(&DhConfig::modp_2048().prime);
        primes
    }

    #[test]
    fn test_both_sides_derive_the_same_key() {
        let primes = primes();
        let mut creator = AuthState::default();
        let mut creator_pfs = PfsState::default();
        let mut invited = AuthState {
            id: ChatId(42),
            ..AuthState::default()
        };
        let mut invited_pfs = PfsState::default();

        assert_eq!(
            creator.apply_create(42, UserId(2), 7, 1_000),
            CreateOutcome::Started
        );
        assert!(creator
            .next_request(&primes, &mut creator_pfs)
            .unwrap()
            .is_none());
        creator
            .set_dh_config(DhConfig::modp_2048(), &primes)
            .unwrap();

        let g_a = match creator.next_request(&primes, &mut creator_pfs).unwrap() {
            Some(HandshakeRequest::Request { random_id, g_a, .. }) => {
                assert_eq!(random_id, 42);
                g_a
            }
            other => panic!("unexpected request {:?}", other),
        };
        assert_eq!(creator.state, ChatState::WaitRequestResponse);

        let requested = EncryptedChat::Requested {
            id: ChatId(42),
            access_hash: 99,
            date: 1_001,
            admin_id: UserId(1),
            admin_access_hash: 5,
            g_a: g_a.clone(),
            folder_id: 1,
        };
        assert_eq!(
            invited
                .on_update(&requested, &primes, &mut invited_pfs, 1_001)
                .unwrap(),
            UpdateOutcome::Updated
        );
        assert_eq!(invited.x, 1);
        assert_eq!(invited.initial_folder_id, 1);
        invited
            .set_dh_config(DhConfig::modp_2048(), &primes)
            .unwrap();

        let (g_b, fingerprint) = match invited.next_request(&primes, &mut invited_pfs).unwrap() {
            Some(HandshakeRequest::Accept {
                g_b,
                key_fingerprint,
                access_hash,
                ..
            }) => {
                assert_eq!(access_hash, 99);
                (g_b, key_fingerprint)
            }
            other => panic!("unexpected request {:?}", other),
        };

        let to_creator = EncryptedChat::Accepted {
            id: ChatId(42),
            access_hash: 99,
            date: 1_002,
            g_a_or_b: g_b,
            key_fingerprint: fingerprint,
        };
        assert_eq!(
            creator
                .on_update(&to_creator, &primes, &mut creator_pfs, 1_002)
                .unwrap(),
            UpdateOutcome::Ready
        );

        let to_invited = EncryptedChat::Accepted {
            id: ChatId(42),
            access_hash: 99,
            date: 1_002,
            g_a_or_b: g_a,
            key_fingerprint: fingerprint,
        };
        assert_eq!(
            invited
                .on_update(&to_invited, &primes, &mut invited_pfs, 1_002)
                .unwrap(),
            UpdateOutcome::Ready
        );

        assert_eq!(creator_pfs.auth_key.id(), invited_pfs.auth_key.id());
        assert_eq!(creator.key_hash, invited.key_hash);
        assert_eq!(creator.status(), ChatStatus::Active);
        assert!(!creator.handshake.has_config());
    }

    #[test]
    fn test_fingerprint_mismatch_is_fatal() {
        let primes = primes();
        let mut creator = AuthState::default();
        let mut pfs = PfsState::default();
        creator.apply_create(8, UserId(2), 0, 0);
        creator
            .set_dh_config(DhConfig::modp_2048(), &primes)
            .unwrap();
        creator.next_request(&primes, &mut pfs).unwrap();

        let mut peer = DhExchange::new();
        peer.set_config(&DhConfig::modp_2048()).unwrap();
        let accepted = EncryptedChat::Accepted {
            id: ChatId(8),
            access_hash: 1,
            date: 0,
            g_a_or_b: peer.own_public().to_vec(),
            key_fingerprint: 12345,
        };

        let err = creator
            .on_update(&accepted, &primes, &mut pfs, 0)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(creator.state, ChatState::WaitRequestResponse);
    }

    #[test]
    fn test_unexpected_envelopes_ignored() {
        let primes = primes();
        let mut pfs = PfsState::default();
        let mut state = AuthState {
            id: ChatId(3),
            ..AuthState::default()
        };

        let waiting = EncryptedChat::Waiting {
            id: ChatId(3),
            access_hash: 1,
            date: 0,
        };
        assert_eq!(
            state.on_update(&waiting, &primes, &mut pfs, 0).unwrap(),
            UpdateOutcome::Ignored
        );
        assert_eq!(
            state
                .on_update(&EncryptedChat::Empty { id: ChatId(3) }, &primes, &mut pfs, 0)
                .unwrap(),
            UpdateOutcome::Ignored
        );
        assert_eq!(
            state
                .on_update(
                    &EncryptedChat::Discarded {
                        id: ChatId(3),
                        history_deleted: true
                    },
                    &primes,
                    &mut pfs,
                    0
                )
                .unwrap(),
            UpdateOutcome::Discarded {
                history_deleted: true
            }
        );
    }

    #[test]
    fn test_create_replay_outcomes() {
        let mut state = AuthState::default();
        assert_eq!(state.apply_create(5, UserId(1), 0, 0), CreateOutcome::Started);
        assert_eq!(state.apply_create(5, UserId(1), 0, 0), CreateOutcome::Resumed);
        state.state = ChatState::Ready;
        assert_eq!(state.apply_create(5, UserId(1), 0, 0), CreateOutcome::Obsolete);
    }

    #[test]
    fn test_bad_generator_rejected() {
        let primes = primes();
        let mut state = AuthState::default();
        let mut config = DhConfig::modp_2048();
        config.g = 1;
        assert!(state.set_dh_config(config, &primes).is_err());
        assert!(state.dh_config.is_empty());
    }
}
