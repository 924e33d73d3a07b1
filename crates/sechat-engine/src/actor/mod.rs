//! One task per chat.
//!
//! The task owns every piece of chat state. Handles post [`Command`]s; RPCs,
//! binlog syncs and application acks run as spawned tasks that post
//! [`Event`]s back, so all state transitions happen on this task in order.
//!
//! Durability follows the write-ahead rule: a message event is appended to
//! the binlog first, and only once it is synced are the resulting state
//! changes written, the packet sent, or the envelope acknowledged. An event
//! is erased once everything it guards is done.

mod inbound;
mod outbound;

use crate::change_log::ChangeLog;
use crate::context::{ChatContext, SecretChatDb};
use crate::error::RpcError;
use crate::handle::{ChatSnapshot, Command, Reply, SecretChatHandle};
use crate::rpc::{call_with_retry, RpcRequest, RpcResponse};
use crate::sync_queue::SyncQueue;
use crate::traits::{Ack, ChatStateUpdate};
use crate::Result;
use outbound::{OutboundQueue, SendFlags};
use sechat_core::lifecycle::{CreateOutcome, UpdateOutcome};
use sechat_core::log_event::{CloseSecretChat, CreateSecretChat};
use sechat_core::wire::{current_layer, LAYER_CURRENT};
use sechat_core::{
    Action, AuthState, ChangeToken, ChatId, ChatState, ChatStatus, ConfigState, DecryptedMessage,
    EncryptedChat, HandshakeRequest, LogEvent, LogId, PfsState, SeqNoChange, SeqNoState,
    SeqNoUpdate, UserId,
};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

type CoreResult<T> = sechat_core::Result<T>;
type CoreError = sechat_core::Error;
type StateId = u64;

/// Work gated on a binlog sync.
enum Followup {
    StartChanges(ChangeToken),
    SendOutbound(StateId),
    Reply(Reply),
    Close { log_id: LogId, event: CloseSecretChat },
}

/// Returned by the change log once a change is written.
enum Hook {
    Inbound(StateId),
    Outbound(StateId),
}

enum AckTarget {
    Inbound(StateId),
    Close,
}

enum Event {
    Synced {
        followups: Vec<Followup>,
        result: Result<()>,
    },
    AppAck(AckTarget),
    SendResult {
        state_id: StateId,
        query_id: u64,
        result: core::result::Result<RpcResponse, RpcError>,
    },
    Handshake(core::result::Result<RpcResponse, RpcError>),
    DhConfig(core::result::Result<RpcResponse, RpcError>),
    Discard(core::result::Result<RpcResponse, RpcError>),
}

enum Step {
    Event(Event),
    Command(Option<Command>),
    Tick,
}

struct InboundState {
    log_id: LogId,
    saved: bool,
    app_done: bool,
}

struct Closing {
    log_id: LogId,
    pending: usize,
}

pub(crate) struct ChatActor {
    chat_id: ChatId,
    ctx: ChatContext,
    db: SecretChatDb,
    auth: AuthState,
    seq: SeqNoState,
    config: ConfigState,
    pfs: PfsState,
    changes: ChangeLog<Hook>,
    sync: SyncQueue<Followup>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::Receiver<Command>,
    outbound: OutboundQueue,
    inbound: HashMap<StateId, InboundState>,
    next_state_id: StateId,
    create_log_id: Option<LogId>,
    pending_actions: VecDeque<Action>,
    close_flag: bool,
    close_reason: Option<String>,
    closing: Option<Closing>,
    replayed_close: Option<(LogId, CloseSecretChat)>,
    replay_finished: bool,
    handshake_in_flight: bool,
    dh_config_in_flight: bool,
    last_read_history_date: i32,
    stopped: bool,
}

/// Loads the chat's records and spawns its task.
///
/// With `finish_replay` the chat starts at once; otherwise it waits for the
/// binlog events routed to it and [`SecretChatHandle::finish_replay`].
pub(crate) fn spawn_chat(
    chat_id: ChatId,
    ctx: ChatContext,
    finish_replay: bool,
) -> Result<SecretChatHandle> {
    let (tx, rx) = mpsc::channel(ctx.config.command_buffer.max(1));
    let actor = ChatActor::load(chat_id, ctx, rx)?;
    tokio::spawn(actor.run(finish_replay));
    Ok(SecretChatHandle::new(chat_id, tx))
}

impl ChatActor {
    fn load(chat_id: ChatId, ctx: ChatContext, commands: mpsc::Receiver<Command>) -> Result<Self> {
        let db = SecretChatDb::new(ctx.kv.clone(), chat_id);
        let mut auth = db.get_value::<AuthState>()?.unwrap_or_default();
        if auth.state == ChatState::Empty {
            auth.id = chat_id;
        }
        let seq = db.get_value::<SeqNoState>()?.unwrap_or_default();
        let config = db.get_value::<ConfigState>()?.unwrap_or_default();
        let pfs = db.get_value::<PfsState>()?.unwrap_or_default();
        tracing::info!(
            chat_id = %chat_id,
            state = ?auth.state,
            message_id = seq.message_id,
            "Loaded secret chat"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sync = SyncQueue::spawn(ctx.binlog.clone(), {
            let events = events_tx.clone();
            move |followups, result| events.send(Event::Synced { followups, result }).is_ok()
        });

        Ok(Self {
            chat_id,
            db,
            close_flag: auth.state == ChatState::Closed,
            changes: ChangeLog::new(pfs.message_id),
            auth,
            seq,
            config,
            pfs,
            sync,
            events_tx,
            events_rx,
            commands,
            outbound: OutboundQueue::default(),
            inbound: HashMap::new(),
            next_state_id: 0,
            create_log_id: None,
            pending_actions: VecDeque::new(),
            close_reason: None,
            closing: None,
            replayed_close: None,
            replay_finished: false,
            handshake_in_flight: false,
            dh_config_in_flight: false,
            last_read_history_date: 0,
            stopped: false,
            ctx,
        })
    }

    async fn run(mut self, finish_replay: bool) {
        let mut tick = tokio::time::interval(self.ctx.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if finish_replay {
            self.replay_finish();
            self.run_loop();
        }

        while !self.stopped {
            let step = tokio::select! {
                Some(event) = self.events_rx.recv() => Step::Event(event),
                command = self.commands.recv() => Step::Command(command),
                _ = tick.tick() => Step::Tick,
            };
            match step {
                Step::Event(event) => self.on_event(event),
                Step::Command(Some(command)) => self.on_command(command),
                Step::Command(None) => {
                    tracing::debug!(chat_id = %self.chat_id, "All handles dropped");
                    break;
                }
                Step::Tick => self.on_tick(),
            }
            if !self.stopped {
                self.run_loop();
            }
        }
        tracing::info!(chat_id = %self.chat_id, "Chat task stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Replay { log_id, event } => self.replay(log_id, event),
            Command::ReplayFinish => self.replay_finish(),
            Command::Create {
                user_id,
                user_access_hash,
                reply,
            } => self.create_chat(user_id, user_access_hash, reply),
            Command::UpdateChat { chat } => self.on_update_chat(chat),
            Command::NewMessage { message, reply } => self.on_new_message(message, reply),
            Command::SendMessage {
                content,
                file,
                reply,
            } => {
                let flags = SendFlags {
                    external: true,
                    push: true,
                    silent: content.silent,
                };
                let result = self.send_message_impl(DecryptedMessage::Content(content), file, flags);
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::SendAction {
                random_id,
                action,
                reply,
            } => {
                let result = self.send_user_action(random_id, action);
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::SendTyping { typing, reply } => self.send_typing(typing, reply),
            Command::ReadHistory { date, reply } => self.send_read_history(date, reply),
            Command::RequestRekey { reply } => {
                let result = self.request_rekey();
                let _ = reply.send(result.map_err(Into::into));
            }
            Command::Cancel {
                delete_history,
                reply,
            } => self.cancel_chat(delete_history, false, Some(reply)),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Synced { followups, result } => match result {
                Ok(()) => self.run_followups(followups),
                Err(e) => self.on_fatal_error(format!("Binlog sync failed: {}", e)),
            },
            Event::AppAck(AckTarget::Inbound(state_id)) => {
                if let Some(state) = self.inbound.get_mut(&state_id) {
                    state.app_done = true;
                }
                if let Err(e) = self.inbound_loop(state_id) {
                    self.on_fatal_error(e.to_string());
                }
            }
            Event::AppAck(AckTarget::Close) => self.on_close_step_done(),
            Event::SendResult {
                state_id,
                query_id,
                result,
            } => {
                if let Err(e) = self.on_send_result(state_id, query_id, result) {
                    self.on_fatal_error(e.to_string());
                }
            }
            Event::Handshake(result) => self.on_handshake_result(result),
            Event::DhConfig(result) => self.on_dh_config_result(result),
            Event::Discard(result) => {
                if let Err(e) = result {
                    tracing::warn!(chat_id = %self.chat_id, error = %e, "DiscardEncryption failed");
                }
                self.on_close_step_done();
            }
        }
    }

    fn on_tick(&mut self) {
        if self.close_flag || !self.replay_finished {
            return;
        }
        if let Some(timeout) = self.ctx.config.handshake_timeout {
            let now = self.ctx.clock.now();
            if self.auth.state.is_handshake() && i64::from(self.auth.date) + timeout < now {
                self.on_fatal_error("Handshake timed out".into());
            }
        }
    }

    /// Drives the handshake, the key rotation and the send queue.
    fn run_loop(&mut self) {
        if self.close_flag || !self.replay_finished {
            return;
        }
        self.request_dh_config();
        if let Err(e) = self.run_auth() {
            return self.on_fatal_error(e.to_string());
        }
        if self.auth.state == ChatState::Ready {
            if let Err(e) = self.run_pfs() {
                return self.on_fatal_error(e.to_string());
            }
        }
        self.pump_sends();
    }

    fn run_followups(&mut self, followups: Vec<Followup>) {
        for followup in followups {
            let result = match followup {
                Followup::StartChanges(token) => self.start_changes(token),
                Followup::SendOutbound(state_id) => self.on_outbound_log_synced(state_id),
                Followup::Reply(reply) => {
                    let _ = reply.send(Ok(()));
                    Ok(())
                }
                Followup::Close { log_id, event } => {
                    self.do_close(log_id, event);
                    Ok(())
                }
            };
            if let Err(e) = result {
                return self.on_fatal_error(e.to_string());
            }
        }
    }

    fn start_changes(&mut self, token: ChangeToken) -> CoreResult<()> {
        let hooks = self.changes.start(token, &self.db)?;
        for hook in hooks {
            match hook {
                Hook::Inbound(state_id) => {
                    if let Some(state) = self.inbound.get_mut(&state_id) {
                        state.saved = true;
                    }
                    self.inbound_loop(state_id)?;
                }
                Hook::Outbound(state_id) => self.on_outbound_saved(state_id)?,
            }
        }
        Ok(())
    }

    /// Either runs the follow-ups now or after the next sync.
    fn after_sync(&mut self, need_sync: bool, followups: Vec<Followup>) {
        if need_sync {
            self.sync.push(followups);
        } else {
            self.run_followups(followups);
        }
    }

    fn next_state_id(&mut self) -> StateId {
        self.next_state_id += 1;
        self.next_state_id
    }

    fn apply_seq_update(&mut self, update: &SeqNoUpdate) -> CoreResult<()> {
        match self.seq.apply(update) {
            SeqNoChange::Stale => Ok(()),
            SeqNoChange::Applied { his_in_changed } => {
                self.changes.mark_seq_changed();
                if his_in_changed {
                    self.on_his_in_seq_no_updated()?;
                }
                Ok(())
            }
        }
    }

    fn watch_ack(&self, target: AckTarget) -> Ack {
        let (ack, rx) = Ack::channel();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = rx.await;
            let _ = events.send(Event::AppAck(target));
        });
        ack
    }

    fn spawn_rpc<F>(&self, request: RpcRequest, wrap: F)
    where
        F: FnOnce(core::result::Result<RpcResponse, RpcError>) -> Event + Send + 'static,
    {
        tracing::debug!(chat_id = %self.chat_id, request = request.name(), "RPC start");
        tokio::spawn({
            let rpc = self.ctx.rpc.clone();
            let retry = self.ctx.config.retry;
            let events = self.events_tx.clone();
            async move {
                let result = call_with_retry(rpc.as_ref(), request, &retry).await;
                let _ = events.send(wrap(result));
            }
        });
    }

    fn send_state_update(&self) {
        let status = if self.close_flag {
            ChatStatus::Closed
        } else {
            self.auth.status()
        };
        self.ctx.callbacks.on_chat_state_changed(ChatStateUpdate {
            chat_id: self.chat_id,
            status,
            reason: self.close_reason.clone(),
            user_id: self.auth.user_id,
            is_outbound: self.auth.is_creator(),
            key_hash: self.auth.key_hash.clone(),
            layer: current_layer(self.config.his_layer),
            ttl: self.config.ttl,
            date: self.auth.date,
        });
    }

    fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            auth: self.auth.clone(),
            seq: self.seq,
            config: self.config,
            pfs: self.pfs.clone(),
            pending_outbound: self.outbound.len(),
            pending_inbound: self.inbound.len(),
            closed: self.close_flag,
        }
    }

    fn save_config(&self) -> CoreResult<()> {
        self.db.set_value(&self.config)?;
        Ok(())
    }

    // Replay.

    fn replay(&mut self, log_id: LogId, event: LogEvent) {
        if self.replay_finished {
            tracing::warn!(chat_id = %self.chat_id, log_id = %log_id, "Replay after start ignored");
            return;
        }
        tracing::debug!(chat_id = %self.chat_id, log_id = %log_id, event = event.name(), "Replaying");
        let result = match event {
            LogEvent::InboundMessage(message) => {
                if self.close_flag {
                    Ok(())
                } else {
                    self.do_inbound_message_decrypted(message, Some(log_id))
                        .map(|followups| self.run_followups(followups))
                }
            }
            LogEvent::OutboundMessage(message) => {
                if self.close_flag {
                    Ok(())
                } else {
                    self.do_outbound_message(message, Some(log_id))
                }
            }
            LogEvent::CloseChat(event) => {
                self.close_flag = true;
                self.replayed_close = Some((log_id, event));
                Ok(())
            }
            LogEvent::CreateChat(event) => self.replay_create_chat(log_id, event),
        };
        if let Err(e) = result {
            self.on_fatal_error(e.to_string());
        }
    }

    fn replay_create_chat(&mut self, log_id: LogId, event: CreateSecretChat) -> CoreResult<()> {
        let now = self.ctx.clock.now() as i32;
        match self
            .auth
            .apply_create(event.random_id, event.user_id, event.user_access_hash, now)
        {
            CreateOutcome::Started | CreateOutcome::Resumed => {
                self.create_log_id = Some(log_id);
            }
            CreateOutcome::Obsolete => {
                self.ctx.binlog.erase(log_id)?;
            }
        }
        Ok(())
    }

    fn replay_finish(&mut self) {
        if self.replay_finished {
            return;
        }
        self.replay_finished = true;
        tracing::debug!(chat_id = %self.chat_id, "Replay finished");

        if let Some((log_id, event)) = self.replayed_close.take() {
            self.do_close(log_id, event);
            return;
        }
        if self.close_flag {
            self.send_state_update();
            return;
        }

        if let Err(e) = self.on_his_in_seq_no_updated() {
            return self.on_fatal_error(e.to_string());
        }
        self.send_state_update();
        if self.auth.state == ChatState::Ready && self.config.my_layer < LAYER_CURRENT {
            if let Err(e) = self.send_service_action(Action::NotifyLayer {
                layer: LAYER_CURRENT,
            }) {
                self.on_fatal_error(e.to_string());
            }
        }
    }

    // Lifecycle.

    fn create_chat(&mut self, user_id: UserId, user_access_hash: i64, reply: Reply) {
        if self.close_flag {
            let _ = reply.send(Err(CoreError::ChatClosed.into()));
            return;
        }
        if self.auth.state != ChatState::Empty {
            let _ = reply.send(Err(CoreError::InvalidState.into()));
            return;
        }
        let event = CreateSecretChat {
            random_id: self.chat_id.0,
            user_id,
            user_access_hash,
        };
        let log_id = match self.ctx.binlog.append(LogEvent::CreateChat(event).serialize()) {
            Ok(log_id) => log_id,
            Err(e) => {
                let reason = e.to_string();
                let _ = reply.send(Err(e));
                return self.on_fatal_error(reason);
            }
        };
        self.create_log_id = Some(log_id);
        let now = self.ctx.clock.now() as i32;
        self.auth
            .apply_create(self.chat_id.0, user_id, user_access_hash, now);
        tracing::info!(chat_id = %self.chat_id, user_id = user_id.0, "Creating secret chat");
        if let Err(e) = self.db.set_value(&self.auth) {
            let reason = e.to_string();
            let _ = reply.send(Err(e));
            return self.on_fatal_error(reason);
        }
        self.send_state_update();
        self.after_sync(true, vec![Followup::Reply(reply)]);
    }

    fn request_dh_config(&mut self) {
        let needs_config = matches!(
            self.auth.state,
            ChatState::Empty | ChatState::SendRequest | ChatState::SendAccept
        ) && !self.auth.handshake.has_config();
        if !needs_config || self.dh_config_in_flight {
            return;
        }
        if self.auth.dh_config.is_empty() {
            if let Some(cached) = self.ctx.dh_config.get() {
                self.auth.dh_config = cached;
            }
        }
        self.dh_config_in_flight = true;
        self.spawn_rpc(
            RpcRequest::GetDhConfig {
                version: self.auth.dh_config.version,
            },
            Event::DhConfig,
        );
    }

    fn on_dh_config_result(&mut self, result: core::result::Result<RpcResponse, RpcError>) {
        self.dh_config_in_flight = false;
        if self.close_flag {
            return;
        }
        let config = match result {
            Ok(RpcResponse::DhConfig(config)) => {
                self.ctx.dh_config.set(config.clone());
                config
            }
            Ok(RpcResponse::DhConfigNotModified) if !self.auth.dh_config.is_empty() => {
                self.auth.dh_config.clone()
            }
            Ok(other) => {
                return self.on_fatal_error(format!("Unexpected GetDhConfig answer: {:?}", other));
            }
            Err(e) => return self.on_fatal_error(format!("GetDhConfig failed: {}", e)),
        };
        tracing::debug!(chat_id = %self.chat_id, version = config.version, "Got DH config");
        if let Err(e) = self.auth.set_dh_config(config, &self.ctx.primes) {
            return self.on_fatal_error(e.to_string());
        }
        if self.auth.state.is_handshake() {
            if let Err(e) = self.db.set_value(&self.auth) {
                self.on_fatal_error(e.to_string());
            }
        }
    }

    fn run_auth(&mut self) -> CoreResult<()> {
        if self.handshake_in_flight {
            return Ok(());
        }
        let Some(request) = self.auth.next_request(&self.ctx.primes, &mut self.pfs)? else {
            return Ok(());
        };
        let request = match request {
            HandshakeRequest::Request {
                user_id,
                user_access_hash,
                random_id,
                g_a,
            } => RpcRequest::RequestEncryption {
                user_id,
                user_access_hash,
                random_id,
                g_a,
            },
            HandshakeRequest::Accept {
                chat_id,
                access_hash,
                g_b,
                key_fingerprint,
            } => RpcRequest::AcceptEncryption {
                chat_id,
                access_hash,
                g_b,
                key_fingerprint,
            },
        };
        tracing::info!(chat_id = %self.chat_id, request = request.name(), "Sending handshake");
        self.db.set_value(&self.auth)?;
        self.handshake_in_flight = true;
        self.send_state_update();
        self.spawn_rpc(request, Event::Handshake);
        Ok(())
    }

    fn on_handshake_result(&mut self, result: core::result::Result<RpcResponse, RpcError>) {
        self.handshake_in_flight = false;
        if self.close_flag {
            return;
        }
        match result {
            Ok(RpcResponse::Chat(chat)) => self.on_update_chat(chat),
            Ok(other) => {
                tracing::warn!(chat_id = %self.chat_id, response = ?other, "Unexpected handshake answer");
            }
            Err(e) => self.on_fatal_error(format!("Handshake request failed: {}", e)),
        }
    }

    fn on_update_chat(&mut self, chat: EncryptedChat) {
        if self.close_flag {
            return;
        }
        if !self.replay_finished {
            tracing::warn!(chat_id = %self.chat_id, "Chat update before replay finished ignored");
            return;
        }
        tracing::info!(chat_id = %self.chat_id, update = chat.name(), state = ?self.auth.state, "Chat update");
        let now = self.ctx.clock.now() as i32;
        match self.auth.on_update(&chat, &self.ctx.primes, &mut self.pfs, now) {
            Err(e) => self.on_fatal_error(e.to_string()),
            Ok(UpdateOutcome::Ignored) => {}
            Ok(UpdateOutcome::Updated) => {
                if self.auth.state.is_handshake() {
                    if let Err(e) = self.db.set_value(&self.auth) {
                        return self.on_fatal_error(e.to_string());
                    }
                }
                self.send_state_update();
            }
            Ok(UpdateOutcome::Ready) => {
                if let Err(e) = self.on_ready() {
                    self.on_fatal_error(e.to_string());
                }
            }
            Ok(UpdateOutcome::Discarded { history_deleted }) => {
                self.cancel_chat(history_deleted, true, None)
            }
        }
    }

    fn on_ready(&mut self) -> CoreResult<()> {
        if let Some(log_id) = self.create_log_id.take() {
            self.ctx.binlog.erase(log_id)?;
        }
        self.pfs.last_timestamp = self.ctx.clock.now();
        self.db.set_value(&self.pfs)?;
        self.db.set_value(&self.auth)?;
        tracing::info!(
            chat_id = %self.chat_id,
            key_id = self.pfs.auth_key.id(),
            "Secret chat ready"
        );
        self.send_state_update();
        self.send_service_action(Action::NotifyLayer {
            layer: LAYER_CURRENT,
        })
    }

    /// Closes the chat for good.
    ///
    /// Pending message events are dropped, then a close event is logged; once
    /// it is durable the records are cleared and the server is told.
    fn cancel_chat(&mut self, delete_history: bool, is_already_discarded: bool, reply: Option<Reply>) {
        if self.close_flag {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        tracing::info!(chat_id = %self.chat_id, delete_history, is_already_discarded, "Closing chat");
        self.close_flag = true;

        let result = self.drop_pending_work();
        let event = CloseSecretChat {
            chat_id: self.chat_id,
            delete_history,
            is_already_discarded,
        };
        let appended = result.and_then(|()| {
            self.ctx
                .binlog
                .append(LogEvent::CloseChat(event.clone()).serialize())
        });
        match appended {
            Ok(log_id) => {
                let mut followups = vec![Followup::Close { log_id, event }];
                if let Some(reply) = reply {
                    followups.push(Followup::Reply(reply));
                }
                self.sync.push(followups);
            }
            Err(e) => {
                tracing::error!(chat_id = %self.chat_id, error = %e, "Failed to log close");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                self.send_state_update();
                self.stopped = true;
            }
        }
    }

    fn drop_pending_work(&mut self) -> Result<()> {
        for log_id in self.outbound.clear() {
            self.ctx.binlog.erase(log_id)?;
        }
        for (_, state) in self.inbound.drain() {
            self.ctx.binlog.erase(state.log_id)?;
        }
        if let Some(log_id) = self.create_log_id.take() {
            self.ctx.binlog.erase(log_id)?;
        }
        self.changes.clear();
        self.pending_actions.clear();
        Ok(())
    }

    fn do_close(&mut self, log_id: LogId, event: CloseSecretChat) {
        self.close_flag = true;
        self.auth.state = ChatState::Closed;
        let result = self
            .db
            .set_value(&self.auth)
            .and_then(|()| self.db.erase_value::<SeqNoState>())
            .and_then(|()| self.db.erase_value::<ConfigState>())
            .and_then(|()| self.db.erase_value::<PfsState>());
        if let Err(e) = result {
            tracing::error!(chat_id = %self.chat_id, error = %e, "Failed to clear chat records");
        }
        self.send_state_update();

        let mut pending = 0;
        if event.delete_history {
            pending += 1;
            let ack = self.watch_ack(AckTarget::Close);
            self.ctx
                .callbacks
                .on_flush_history(self.chat_id, true, i32::MAX, ack);
        }
        if !event.is_already_discarded && self.auth.access_hash != 0 {
            pending += 1;
            self.spawn_rpc(
                RpcRequest::DiscardEncryption {
                    chat_id: self.chat_id,
                    delete_history: event.delete_history,
                },
                Event::Discard,
            );
        }
        self.closing = Some(Closing { log_id, pending });
        if pending == 0 {
            self.on_closed();
        }
    }

    fn on_close_step_done(&mut self) {
        let done = match self.closing.as_mut() {
            Some(closing) => {
                closing.pending = closing.pending.saturating_sub(1);
                closing.pending == 0
            }
            None => false,
        };
        if done {
            self.on_closed();
        }
    }

    fn on_closed(&mut self) {
        let Some(closing) = self.closing.take() else {
            return;
        };
        if let Err(e) = self.db.erase_value::<AuthState>() {
            tracing::error!(chat_id = %self.chat_id, error = %e, "Failed to erase auth state");
        }
        if let Err(e) = self.ctx.binlog.erase(closing.log_id) {
            tracing::error!(chat_id = %self.chat_id, error = %e, "Failed to erase close event");
        }
        tracing::info!(chat_id = %self.chat_id, "Chat closed");
        self.stopped = true;
    }

    fn on_fatal_error(&mut self, reason: String) {
        if self.close_flag {
            tracing::warn!(chat_id = %self.chat_id, reason = %reason, "Error while closing");
            return;
        }
        tracing::error!(chat_id = %self.chat_id, reason = %reason, "Fatal error, closing chat");
        self.close_reason = Some(reason);
        self.cancel_chat(false, false, None);
    }

    // Forward secrecy.

    fn request_rekey(&mut self) -> CoreResult<()> {
        if self.close_flag {
            return Err(CoreError::ChatClosed);
        }
        if self.auth.state != ChatState::Ready {
            return Err(CoreError::ChatNotReady);
        }
        let now = self.ctx.clock.now();
        self.pfs.request_new_key(&self.auth.dh_config, now)?;
        self.changes.mark_pfs_changed();
        Ok(())
    }

    fn run_pfs(&mut self) -> CoreResult<()> {
        while let Some(action) = self.pending_actions.pop_front() {
            self.send_service_action(action)?;
        }

        let now = self.ctx.clock.now();
        let policy = self.ctx.config.rekey;
        if let Some(abort) = self.pfs.abort_if_expired(now, &policy) {
            self.changes.mark_pfs_changed();
            self.send_service_action(abort)?;
        }
        if self.pfs.needs_rekey(self.seq.message_id, now, &policy) {
            tracing::info!(chat_id = %self.chat_id, message_id = self.seq.message_id, "Rotating key");
            self.pfs.request_new_key(&self.auth.dh_config, now)?;
            self.changes.mark_pfs_changed();
        }
        while let Some(action) = self.pfs.next_action(self.changes.saved_pfs_message_id()) {
            self.changes.mark_pfs_changed();
            self.send_service_action(action)?;
        }
        Ok(())
    }

    fn send_service_action(&mut self, action: Action) -> CoreResult<()> {
        let random_id = rand::random::<i64>();
        self.send_message_impl(
            DecryptedMessage::Service { random_id, action },
            None,
            SendFlags::default(),
        )
    }

    fn send_user_action(&mut self, random_id: i64, action: Action) -> CoreResult<()> {
        match action {
            Action::ReadMessages { .. }
            | Action::DeleteMessages { .. }
            | Action::ScreenshotMessages { .. }
            | Action::FlushHistory
            | Action::SetTtl { .. } => self.send_message_impl(
                DecryptedMessage::Service { random_id, action },
                None,
                SendFlags {
                    external: true,
                    push: true,
                    silent: false,
                },
            ),
            other => Err(CoreError::ProtocolViolation(format!(
                "{} can't be sent by the application",
                other.name()
            ))),
        }
    }

    fn send_typing(&mut self, typing: bool, reply: Reply) {
        if self.close_flag || self.auth.state != ChatState::Ready {
            let _ = reply.send(Err(CoreError::ChatNotReady.into()));
            return;
        }
        let request = RpcRequest::SetTyping {
            chat_id: self.chat_id,
            access_hash: self.auth.access_hash,
            typing,
        };
        let rpc = self.ctx.rpc.clone();
        tokio::spawn(async move {
            let result = rpc.send(request).await;
            let _ = reply.send(result.map(|_| ()).map_err(Into::into));
        });
    }

    fn send_read_history(&mut self, date: i32, reply: Reply) {
        if self.close_flag {
            let _ = reply.send(Err(CoreError::ChatClosed.into()));
            return;
        }
        if self.auth.state != ChatState::Ready {
            let _ = reply.send(Err(CoreError::ChatNotReady.into()));
            return;
        }
        if date <= self.last_read_history_date {
            let _ = reply.send(Ok(()));
            return;
        }
        self.last_read_history_date = date;
        let request = RpcRequest::ReadHistory {
            chat_id: self.chat_id,
            access_hash: self.auth.access_hash,
            max_date: date,
        };
        tokio::spawn({
            let rpc = self.ctx.rpc.clone();
            let retry = self.ctx.config.retry;
            async move {
                let result = call_with_retry(rpc.as_ref(), request, &retry).await;
                let _ = reply.send(result.map(|_| ()).map_err(Into::into));
            }
        });
    }
}
