//! Durable per-chat records.
//!
//! Each record lives under a stable key in the chat's key-value scope and is
//! rewritten whole. The first byte of every record is its schema version;
//! older versions stay parseable so a log written by a previous release
//! replays cleanly.
//!
//! | Record        | Key            | Version |
//! |---------------|----------------|---------|
//! | `AuthState`   | `"auth_state"` | 2       |
//! | `SeqNoState`  | `"state"`      | 2       |
//! | `ConfigState` | `"config"`     | 2       |
//! | `PfsState`    | `"pfs_state"`  | 2       |

use crate::codec::{Reader, Writer};
use crate::types::{ChatId, UserId};
use crate::wire::LAYER_INITIAL;
use crate::{Error, Result};
use sechat_crypto::dh::DhSnapshot;
use sechat_crypto::{AuthKey, DhConfig, DhExchange};
use zeroize::Zeroizing;

/// A record stored under a fixed key.
pub trait DurableRecord: Sized {
    /// Storage key inside the chat scope.
    const KEY: &'static str;

    /// Serializes the record with its schema version.
    fn store(&self) -> Vec<u8>;

    /// Parses any supported schema version.
    fn parse(data: &[u8]) -> Result<Self>;
}

fn check_version(version: u8, max: u8, record: &str) -> Result<()> {
    if version == 0 || version > max {
        return Err(Error::InvalidFrame(format!(
            "Unsupported {} version: {}",
            record, version
        )));
    }
    Ok(())
}

fn put_auth_key(w: &mut Writer, key: &AuthKey) {
    w.put_bytes(key.key());
}

fn get_auth_key(r: &mut Reader<'_>) -> Result<AuthKey> {
    let key = r.get_bytes()?;
    if key.is_empty() {
        Ok(AuthKey::empty())
    } else {
        Ok(AuthKey::new(key))
    }
}

fn put_handshake(w: &mut Writer, handshake: &DhExchange) {
    let snapshot = handshake.snapshot();
    w.put_i32(snapshot.g);
    w.put_bytes(&snapshot.prime);
    w.put_bytes(&snapshot.private);
    w.put_bytes(&snapshot.own_public);
    w.put_bytes(&snapshot.peer_public);
}

fn get_handshake(r: &mut Reader<'_>) -> Result<DhExchange> {
    Ok(DhExchange::from_snapshot(DhSnapshot {
        g: r.get_i32()?,
        prime: r.get_bytes()?,
        private: Zeroizing::new(r.get_bytes()?),
        own_public: r.get_bytes()?,
        peer_public: r.get_bytes()?,
    }))
}

/// Lifecycle of the initial handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatState {
    /// Nothing happened yet.
    #[default]
    Empty,
    /// We created the chat and must send the request.
    SendRequest,
    /// The peer invited us and we must send the accept.
    SendAccept,
    /// Request sent, waiting for the peer to accept.
    WaitRequestResponse,
    /// Accept sent, waiting for the server to confirm.
    WaitAcceptResponse,
    /// Key established.
    Ready,
    /// Chat discarded.
    Closed,
}

impl ChatState {
    fn to_u8(self) -> u8 {
        match self {
            ChatState::Empty => 0,
            ChatState::SendRequest => 1,
            ChatState::SendAccept => 2,
            ChatState::WaitRequestResponse => 3,
            ChatState::WaitAcceptResponse => 4,
            ChatState::Ready => 5,
            ChatState::Closed => 6,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ChatState::Empty,
            1 => ChatState::SendRequest,
            2 => ChatState::SendAccept,
            3 => ChatState::WaitRequestResponse,
            4 => ChatState::WaitAcceptResponse,
            5 => ChatState::Ready,
            6 => ChatState::Closed,
            other => {
                return Err(Error::InvalidFrame(format!("Unknown chat state {}", other)));
            }
        })
    }

    /// Whether the handshake is still running.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            ChatState::SendRequest
                | ChatState::SendAccept
                | ChatState::WaitRequestResponse
                | ChatState::WaitAcceptResponse
        )
    }
}

/// Identity and handshake state of a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    /// Lifecycle state.
    pub state: ChatState,
    /// 0 if we created the chat, 1 if we accepted it, -1 while unknown.
    pub x: i32,
    /// Key visualization hash.
    pub key_hash: Vec<u8>,
    /// Chat id assigned by the server.
    pub id: ChatId,
    /// Access hash of the chat.
    pub access_hash: i64,
    /// Peer user.
    pub user_id: UserId,
    /// Access hash of the peer user.
    pub user_access_hash: i64,
    /// Random id used to create the chat.
    pub random_id: i32,
    /// Creation date (unix seconds).
    pub date: i32,
    /// Folder the chat was placed in on creation.
    pub initial_folder_id: i32,
    /// Group parameters fetched from the server.
    pub dh_config: DhConfig,
    /// Exchange in flight; only persisted before `Ready`.
    pub handshake: DhExchange,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            state: ChatState::Empty,
            x: -1,
            key_hash: Vec::new(),
            id: ChatId::default(),
            access_hash: 0,
            user_id: UserId::default(),
            user_access_hash: 0,
            random_id: 0,
            date: 0,
            initial_folder_id: 0,
            dh_config: DhConfig::default(),
            handshake: DhExchange::new(),
        }
    }
}

impl AuthState {
    /// Whether we created the chat.
    pub fn is_creator(&self) -> bool {
        self.x == 0
    }
}

impl DurableRecord for AuthState {
    const KEY: &'static str = "auth_state";

    fn store(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(2);
        w.put_u8(self.state.to_u8());
        w.put_i32(self.x);
        w.put_bytes(&self.key_hash);
        w.put_i32(self.id.0);
        w.put_i64(self.access_hash);
        w.put_i64(self.user_id.0);
        w.put_i64(self.user_access_hash);
        w.put_i32(self.random_id);
        w.put_i32(self.date);
        w.put_i32(self.dh_config.version);
        w.put_i32(self.dh_config.g);
        w.put_bytes(&self.dh_config.prime);
        let has_handshake = self.state.is_handshake();
        w.put_bool(has_handshake);
        if has_handshake {
            put_handshake(&mut w, &self.handshake);
        }
        w.put_i32(self.initial_folder_id);
        w.finish()
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let version = r.get_u8()?;
        check_version(version, 2, "auth state")?;

        let mut state = AuthState {
            state: ChatState::from_u8(r.get_u8()?)?,
            x: r.get_i32()?,
            key_hash: r.get_bytes()?,
            id: ChatId(r.get_i32()?),
            access_hash: r.get_i64()?,
            user_id: UserId(r.get_i64()?),
            user_access_hash: r.get_i64()?,
            random_id: r.get_i32()?,
            date: r.get_i32()?,
            dh_config: DhConfig::new(r.get_i32()?, r.get_i32()?, r.get_bytes()?),
            ..AuthState::default()
        };
        if r.get_bool()? {
            state.handshake = get_handshake(&mut r)?;
        }
        if version >= 2 {
            state.initial_folder_id = r.get_i32()?;
        }
        r.finish()?;
        Ok(state)
    }
}

/// Sequence counters of a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqNoState {
    /// Local id of the last message in either direction.
    pub message_id: i32,
    /// Next peer out counter we expect.
    pub my_in_seq_no: i32,
    /// Number of messages we originated.
    pub my_out_seq_no: i32,
    /// How many of our messages the peer has received.
    pub his_in_seq_no: i32,
    /// Peer's layer as of the last admitted message.
    pub his_layer: i32,
    /// End of the last resend range we served.
    pub resend_end_seq_no: i32,
}

impl Default for SeqNoState {
    fn default() -> Self {
        Self {
            message_id: 0,
            my_in_seq_no: 0,
            my_out_seq_no: 0,
            his_in_seq_no: 0,
            his_layer: 0,
            resend_end_seq_no: -1,
        }
    }
}

impl DurableRecord for SeqNoState {
    const KEY: &'static str = "state";

    fn store(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(2);
        w.put_i32(self.message_id);
        w.put_i32(self.my_in_seq_no);
        w.put_i32(self.my_out_seq_no);
        w.put_i32(self.his_in_seq_no);
        w.put_i32(self.his_layer);
        w.put_i32(self.resend_end_seq_no);
        w.finish()
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let version = r.get_u8()?;
        check_version(version, 2, "sequence state")?;

        let mut state = SeqNoState {
            message_id: r.get_i32()?,
            my_in_seq_no: r.get_i32()?,
            my_out_seq_no: r.get_i32()?,
            his_in_seq_no: r.get_i32()?,
            ..SeqNoState::default()
        };
        if version >= 2 {
            state.his_layer = r.get_i32()?;
            state.resend_end_seq_no = r.get_i32()?;
        }
        r.finish()?;
        Ok(state)
    }
}

/// Negotiated layers and message timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigState {
    /// Highest layer the peer announced.
    pub his_layer: i32,
    /// Layer we last announced.
    pub my_layer: i32,
    /// Self-destruct timer in seconds.
    pub ttl: i32,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self {
            his_layer: LAYER_INITIAL,
            my_layer: LAYER_INITIAL,
            ttl: 0,
        }
    }
}

impl DurableRecord for ConfigState {
    const KEY: &'static str = "config";

    fn store(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(2);
        w.put_i32(self.his_layer);
        w.put_i32(self.ttl);
        w.put_i32(self.my_layer);
        w.finish()
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let version = r.get_u8()?;
        check_version(version, 2, "config state")?;

        let mut state = ConfigState {
            his_layer: r.get_i32()?,
            ttl: r.get_i32()?,
            ..ConfigState::default()
        };
        if version >= 2 {
            state.my_layer = r.get_i32()?;
        }
        r.finish()?;
        Ok(state)
    }
}

/// Stage of the forward-secrecy exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PfsStage {
    /// No exchange running.
    #[default]
    Empty,
    /// RequestKey is being handed to the outbound pipeline.
    WaitSendRequest,
    /// RequestKey must be sent.
    SendRequest,
    /// RequestKey sent, waiting for AcceptKey.
    WaitRequestResponse,
    /// AcceptKey is being handed to the outbound pipeline.
    WaitSendAccept,
    /// AcceptKey must be sent once our state is durable.
    SendAccept,
    /// AcceptKey sent, waiting for CommitKey.
    WaitAcceptResponse,
    /// CommitKey is being handed to the outbound pipeline.
    WaitSendCommit,
    /// CommitKey must be sent once our state is durable.
    SendCommit,
}

impl PfsStage {
    fn to_u8(self) -> u8 {
        match self {
            PfsStage::Empty => 0,
            PfsStage::WaitSendRequest => 1,
            PfsStage::SendRequest => 2,
            PfsStage::WaitRequestResponse => 3,
            PfsStage::WaitSendAccept => 4,
            PfsStage::SendAccept => 5,
            PfsStage::WaitAcceptResponse => 6,
            PfsStage::WaitSendCommit => 7,
            PfsStage::SendCommit => 8,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => PfsStage::Empty,
            1 => PfsStage::WaitSendRequest,
            2 => PfsStage::SendRequest,
            3 => PfsStage::WaitRequestResponse,
            4 => PfsStage::WaitSendAccept,
            5 => PfsStage::SendAccept,
            6 => PfsStage::WaitAcceptResponse,
            7 => PfsStage::WaitSendCommit,
            8 => PfsStage::SendCommit,
            other => {
                return Err(Error::InvalidFrame(format!("Unknown PFS stage {}", other)));
            }
        })
    }
}

/// Keys and forward-secrecy exchange state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfsState {
    /// Exchange stage.
    pub stage: PfsStage,
    /// Key used for every outbound packet.
    pub auth_key: AuthKey,
    /// Previous key after a commit, or the staged key during an exchange.
    pub other_auth_key: AuthKey,
    /// Whether `other_auth_key` may be dropped once the peer uses `auth_key`.
    pub can_forget_other_key: bool,
    /// Message id of the last processed action.
    pub message_id: i32,
    /// Our next exchange message waits until a state with this message id is saved.
    pub wait_message_id: i32,
    /// Running exchange.
    pub exchange_id: i64,
    /// Message id at the last completed rotation.
    pub last_message_id: i32,
    /// Time of the last completed rotation (unix seconds).
    pub last_timestamp: i64,
    /// Our out counter at the last completed rotation.
    pub last_out_seq_no: i32,
    /// Time the running exchange was requested (unix seconds).
    pub exchange_timestamp: i64,
    /// DH half of the running exchange.
    pub handshake: DhExchange,
}

impl Default for PfsState {
    fn default() -> Self {
        Self {
            stage: PfsStage::Empty,
            auth_key: AuthKey::empty(),
            other_auth_key: AuthKey::empty(),
            can_forget_other_key: true,
            message_id: 0,
            wait_message_id: 0,
            exchange_id: 0,
            last_message_id: 0,
            last_timestamp: 0,
            last_out_seq_no: 0,
            exchange_timestamp: 0,
            handshake: DhExchange::new(),
        }
    }
}

impl DurableRecord for PfsState {
    const KEY: &'static str = "pfs_state";

    fn store(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(2);
        w.put_u8(self.stage.to_u8());
        put_auth_key(&mut w, &self.auth_key);
        put_auth_key(&mut w, &self.other_auth_key);
        w.put_bool(self.can_forget_other_key);
        w.put_i32(self.message_id);
        w.put_i32(self.wait_message_id);
        w.put_i64(self.exchange_id);
        w.put_i32(self.last_message_id);
        w.put_i64(self.last_timestamp);
        w.put_i32(self.last_out_seq_no);
        put_handshake(&mut w, &self.handshake);
        w.put_i64(self.exchange_timestamp);
        w.finish()
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let version = r.get_u8()?;
        check_version(version, 2, "PFS state")?;

        let mut state = PfsState {
            stage: PfsStage::from_u8(r.get_u8()?)?,
            auth_key: get_auth_key(&mut r)?,
            other_auth_key: get_auth_key(&mut r)?,
            can_forget_other_key: r.get_bool()?,
            message_id: r.get_i32()?,
            wait_message_id: r.get_i32()?,
            exchange_id: r.get_i64()?,
            last_message_id: r.get_i32()?,
            last_timestamp: r.get_i64()?,
            last_out_seq_no: r.get_i32()?,
            handshake: get_handshake(&mut r)?,
            ..PfsState::default()
        };
        if version >= 2 {
            state.exchange_timestamp = r.get_i64()?;
        }
        r.finish()?;
        Ok(state)
    }
}
