//! Outbound pipeline.
//!
//! A message is numbered, encrypted and applied to memory at once, then
//! logged. It goes on the wire only after its event is synced, one request at
//! a time so the peer sees our sequence in order. The event is rewritten once
//! the send finished and erased once the peer acknowledged it through
//! `his_in_seq_no` and its state change is written.

use super::{ChatActor, CoreError, CoreResult, Event, Followup, Hook, StateId};
use crate::error::RpcError;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::traits::Ack;
use sechat_core::log_event::OutboundSecretMessage;
use sechat_core::wire::current_layer;
use sechat_core::{
    Action, ChatState, DecryptedMessage, InputEncryptedFile, LogEvent, LogId, MessageLayer,
    SeqNoUpdate, WireSeqNo,
};
use sechat_crypto::packet::encrypt_packet;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// How a message is delivered and reported.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct SendFlags {
    /// Requested by the application, which hears about the outcome.
    pub(super) external: bool,
    /// The peer's user is notified.
    pub(super) push: bool,
    /// Delivered without sound.
    pub(super) silent: bool,
}

struct OutboundState {
    message: OutboundSecretMessage,
    log_id: LogId,
    saved: bool,
    acked: bool,
    send_finished: bool,
    query_id: Option<u64>,
}

#[derive(Default)]
pub(super) struct OutboundQueue {
    states: HashMap<StateId, OutboundState>,
    by_random_id: HashMap<i64, StateId>,
    by_out_index: BTreeMap<i32, StateId>,
    send_queue: VecDeque<StateId>,
    in_flight: Option<StateId>,
    next_query_id: u64,
}

impl OutboundQueue {
    pub(super) fn len(&self) -> usize {
        self.states.len()
    }

    /// Forgets every message and returns their log events.
    pub(super) fn clear(&mut self) -> Vec<LogId> {
        self.by_random_id.clear();
        self.by_out_index.clear();
        self.send_queue.clear();
        self.in_flight = None;
        self.states.drain().map(|(_, state)| state.log_id).collect()
    }

    fn remove(&mut self, state_id: StateId) -> Option<OutboundState> {
        let state = self.states.remove(&state_id)?;
        self.by_random_id.remove(&state.message.random_id);
        let out_index = state.message.my_out_seq_no - 1;
        if self.by_out_index.get(&out_index) == Some(&state_id) {
            self.by_out_index.remove(&out_index);
        }
        self.send_queue.retain(|id| *id != state_id);
        if self.in_flight == Some(state_id) {
            self.in_flight = None;
        }
        Some(state)
    }

    fn requeue_front(&mut self, state_id: StateId) {
        self.send_queue.retain(|id| *id != state_id);
        self.send_queue.push_front(state_id);
    }
}

impl ChatActor {
    /// Numbers, encrypts and logs one message.
    ///
    /// A `random_id` that is already pending is accepted without a second
    /// send.
    pub(super) fn send_message_impl(
        &mut self,
        message: DecryptedMessage,
        file: Option<InputEncryptedFile>,
        flags: SendFlags,
    ) -> CoreResult<()> {
        if self.close_flag {
            return Err(CoreError::ChatClosed);
        }
        if self.auth.state != ChatState::Ready {
            return Err(CoreError::ChatNotReady);
        }
        let random_id = message.random_id();
        if self.outbound.by_random_id.contains_key(&random_id) {
            tracing::debug!(chat_id = %self.chat_id, random_id, "Message already pending");
            return Ok(());
        }
        let layer = current_layer(self.config.his_layer);
        let action = message.action().cloned();
        if let Some(action) = &action {
            if action.min_layer() > layer {
                return Err(CoreError::ProtocolViolation(format!(
                    "{} needs layer {}, peer speaks {}",
                    action.name(),
                    action.min_layer(),
                    layer
                )));
            }
        }

        // The sequence number is spent from here on; any failure closes the chat.
        let result = self.number_and_log(message, action, file, flags, layer);
        if let Err(e) = &result {
            self.on_fatal_error(e.to_string());
        }
        result
    }

    fn number_and_log(
        &mut self,
        message: DecryptedMessage,
        action: Option<Action>,
        file: Option<InputEncryptedFile>,
        flags: SendFlags,
        layer: i32,
    ) -> CoreResult<()> {
        let random_id = message.random_id();
        let update = self.seq.next_outbound();
        let wire = WireSeqNo::encode(update.my_in_seq_no, update.my_out_seq_no, self.auth.x);
        let is_content = action.is_none();
        let payload = MessageLayer::new(layer, wire.in_seq_no, wire.out_seq_no, message).serialize();
        let encrypted_message =
            encrypt_packet(&self.pfs.auth_key, &payload, self.auth.is_creator())?;

        let event = OutboundSecretMessage {
            chat_id: self.chat_id,
            random_id,
            message_id: update.message_id,
            my_in_seq_no: update.my_in_seq_no,
            my_out_seq_no: update.my_out_seq_no,
            his_in_seq_no: update.his_in_seq_no,
            encrypted_message,
            file,
            is_sent: false,
            is_service: !is_content,
            is_rewritable: is_content && flags.external,
            is_external: flags.external,
            is_silent: flags.silent,
            is_push: flags.push,
            action,
        };
        tracing::debug!(
            chat_id = %self.chat_id,
            random_id,
            message_id = event.message_id,
            out_seq_no = wire.out_seq_no,
            "Sending message"
        );
        self.do_outbound_message(event, None)
    }

    /// Applies an outbound event to memory and queues it.
    ///
    /// Without `log_id` the event is new and gets appended; with one it is
    /// being replayed.
    pub(super) fn do_outbound_message(
        &mut self,
        event: OutboundSecretMessage,
        log_id: Option<LogId>,
    ) -> CoreResult<()> {
        let update = SeqNoUpdate {
            message_id: event.message_id,
            my_in_seq_no: event.my_in_seq_no,
            my_out_seq_no: event.my_out_seq_no,
            his_in_seq_no: event.his_in_seq_no,
            his_layer: -1,
        };
        self.apply_seq_update(&update)?;
        if let Some(action) = &event.action {
            self.on_outbound_action(action, event.message_id, event.my_out_seq_no)?;
        }

        let (log_id, need_sync) = match log_id {
            Some(log_id) => (log_id, false),
            None => {
                let data = LogEvent::OutboundMessage(event.clone()).serialize();
                (self.ctx.binlog.append(data)?, true)
            }
        };
        let state_id = self.next_state_id();
        let token = self
            .changes
            .add(&self.seq, &self.pfs, Hook::Outbound(state_id));

        let out_index = event.my_out_seq_no - 1;
        let acked = self.seq.is_acked(out_index);
        self.outbound.by_random_id.insert(event.random_id, state_id);
        if !acked {
            self.outbound.by_out_index.insert(out_index, state_id);
        }
        self.outbound.states.insert(
            state_id,
            OutboundState {
                message: event,
                log_id,
                saved: false,
                acked,
                send_finished: false,
                query_id: None,
            },
        );
        self.after_sync(
            need_sync,
            vec![
                Followup::StartChanges(token),
                Followup::SendOutbound(state_id),
            ],
        );
        Ok(())
    }

    fn on_outbound_action(
        &mut self,
        action: &Action,
        message_id: i32,
        my_out_seq_no: i32,
    ) -> CoreResult<()> {
        if !self.pfs.admit_action(message_id, self.seq.message_id) {
            tracing::debug!(chat_id = %self.chat_id, message_id, action = action.name(), "Outbound action already applied");
            return Ok(());
        }
        self.changes.mark_pfs_changed();
        match action {
            Action::SetTtl { ttl_seconds } => {
                self.config.ttl = *ttl_seconds;
                self.save_config()?;
                self.send_state_update();
            }
            Action::DeleteMessages { random_ids } => self.rewrite_pending(Some(random_ids))?,
            Action::FlushHistory => self.rewrite_pending(None)?,
            Action::Resend { end_seq_no, .. } => {
                self.seq.resend_end_seq_no = *end_seq_no;
                self.changes.mark_seq_changed();
            }
            Action::NotifyLayer { layer } => {
                self.config.my_layer = *layer;
                self.save_config()?;
            }
            other if other.is_pfs() => {
                let now = self.ctx.clock.now();
                self.pfs.on_outbound_action(other, my_out_seq_no, now)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Turns pending content messages into self-deleting service messages.
    ///
    /// `None` selects every pending content message.
    pub(super) fn rewrite_pending(&mut self, random_ids: Option<&[i64]>) -> CoreResult<()> {
        let state_ids: Vec<StateId> = match random_ids {
            Some(random_ids) => random_ids
                .iter()
                .filter_map(|random_id| self.outbound.by_random_id.get(random_id).copied())
                .collect(),
            None => self.outbound.states.keys().copied().collect(),
        };
        for state_id in state_ids {
            self.rewrite_with_empty(state_id)?;
        }
        Ok(())
    }

    /// Replaces a content message by `DeleteMessages` of itself, keeping its
    /// sequence numbers.
    fn rewrite_with_empty(&mut self, state_id: StateId) -> CoreResult<()> {
        let layer = current_layer(self.config.his_layer);
        let x = self.auth.x;
        let from_creator = self.auth.is_creator();
        let Some(state) = self.outbound.states.get_mut(&state_id) else {
            return Ok(());
        };
        if !state.message.is_rewritable {
            return Ok(());
        }
        let random_id = state.message.random_id;
        let wire = WireSeqNo::encode(state.message.my_in_seq_no, state.message.my_out_seq_no, x);
        let payload = MessageLayer::new(
            layer,
            wire.in_seq_no,
            wire.out_seq_no,
            DecryptedMessage::Service {
                random_id,
                action: Action::DeleteMessages {
                    random_ids: vec![random_id],
                },
            },
        )
        .serialize();

        let message = &mut state.message;
        message.encrypted_message = encrypt_packet(&self.pfs.auth_key, &payload, from_creator)?;
        message.is_rewritable = false;
        message.is_external = false;
        message.is_push = false;
        message.is_silent = true;
        message.is_service = true;
        message.file = None;
        tracing::info!(chat_id = %self.chat_id, random_id, "Rewrote pending message as deleted");
        self.ctx
            .binlog
            .rewrite(state.log_id, LogEvent::OutboundMessage(message.clone()).serialize())?;
        Ok(())
    }

    /// The event of a message is durable; it may go on the wire.
    pub(super) fn on_outbound_log_synced(&mut self, state_id: StateId) -> CoreResult<()> {
        let Some(state) = self.outbound.states.get_mut(&state_id) else {
            return Ok(());
        };
        if state.acked || state.message.is_sent {
            state.send_finished = true;
        } else {
            self.outbound.send_queue.push_back(state_id);
        }
        self.outbound_loop(state_id)
    }

    /// The state change of a message is written.
    pub(super) fn on_outbound_saved(&mut self, state_id: StateId) -> CoreResult<()> {
        if let Some(state) = self.outbound.states.get_mut(&state_id) {
            state.saved = true;
        }
        self.outbound_loop(state_id)
    }

    fn outbound_loop(&mut self, state_id: StateId) -> CoreResult<()> {
        let Some(state) = self.outbound.states.get_mut(&state_id) else {
            return Ok(());
        };
        if !state.saved {
            return Ok(());
        }
        if state.acked && (state.send_finished || state.message.is_sent) {
            if let Some(state) = self.outbound.remove(state_id) {
                tracing::debug!(chat_id = %self.chat_id, random_id = state.message.random_id, "Outbound message done");
                self.ctx.binlog.erase(state.log_id)?;
            }
            return Ok(());
        }
        if state.send_finished && !state.message.is_sent {
            state.message.is_sent = true;
            self.ctx.binlog.rewrite(
                state.log_id,
                LogEvent::OutboundMessage(state.message.clone()).serialize(),
            )?;
        }
        Ok(())
    }

    /// Starts the next send unless one is in flight.
    pub(super) fn pump_sends(&mut self) {
        if self.outbound.in_flight.is_some() || self.auth.state != ChatState::Ready {
            return;
        }
        while let Some(state_id) = self.outbound.send_queue.pop_front() {
            let query_id = self.outbound.next_query_id + 1;
            let Some(state) = self.outbound.states.get_mut(&state_id) else {
                continue;
            };
            if state.acked {
                continue;
            }
            state.query_id = Some(query_id);
            let message = &state.message;
            let request = RpcRequest::SendEncrypted {
                chat_id: self.chat_id,
                access_hash: self.auth.access_hash,
                random_id: message.random_id,
                data: message.encrypted_message.clone(),
                file: message.file.clone(),
                is_service: !message.is_push,
                silent: message.is_silent,
            };
            self.outbound.next_query_id = query_id;
            self.outbound.in_flight = Some(state_id);
            self.spawn_rpc(request, move |result| Event::SendResult {
                state_id,
                query_id,
                result,
            });
            return;
        }
    }

    pub(super) fn on_send_result(
        &mut self,
        state_id: StateId,
        query_id: u64,
        result: core::result::Result<RpcResponse, RpcError>,
    ) -> CoreResult<()> {
        let current = self.outbound.states.get(&state_id).and_then(|s| s.query_id);
        if current != Some(query_id) {
            tracing::debug!(chat_id = %self.chat_id, query_id, "Stale send result ignored");
            return Ok(());
        }
        if self.outbound.in_flight == Some(state_id) {
            self.outbound.in_flight = None;
        }
        let Some(state) = self.outbound.states.get_mut(&state_id) else {
            return Ok(());
        };
        state.query_id = None;
        let random_id = state.message.random_id;
        let is_external = state.message.is_external;

        match result {
            Ok(response) => {
                state.send_finished = true;
                if is_external {
                    let (date, file) = match response {
                        RpcResponse::Sent { date, file } => (date, file),
                        _ => (0, None),
                    };
                    self.ctx
                        .callbacks
                        .on_send_ok(self.chat_id, random_id, date, file);
                }
                self.outbound_loop(state_id)
            }
            Err(RpcError::Permanent(reason)) if state.message.is_rewritable => {
                tracing::warn!(chat_id = %self.chat_id, random_id, reason = %reason, "Message rejected, deleting it");
                self.report_send_error(random_id, reason);
                self.rewrite_with_empty(state_id)?;
                self.outbound.requeue_front(state_id);
                Ok(())
            }
            Err(e) => {
                if is_external {
                    self.report_send_error(random_id, e.to_string());
                }
                Err(CoreError::Network(format!("sending message {} failed: {}", random_id, e)))
            }
        }
    }

    fn report_send_error(&self, random_id: i64, reason: String) {
        let (ack, _) = Ack::channel();
        self.ctx
            .callbacks
            .on_send_error(self.chat_id, random_id, reason, ack);
    }

    /// The peer received more of our messages.
    pub(super) fn on_his_in_seq_no_updated(&mut self) -> CoreResult<()> {
        if !self.replay_finished {
            return Ok(());
        }
        let remaining = self
            .outbound
            .by_out_index
            .split_off(&self.seq.his_in_seq_no);
        let acked = std::mem::replace(&mut self.outbound.by_out_index, remaining);
        for state_id in acked.into_values() {
            let in_flight = self.outbound.in_flight == Some(state_id);
            let Some(state) = self.outbound.states.get_mut(&state_id) else {
                continue;
            };
            state.acked = true;
            if !in_flight {
                state.send_finished = true;
                state.query_id = None;
            }
            if state.message.is_external {
                self.ctx
                    .callbacks
                    .on_send_ack(self.chat_id, state.message.random_id);
            }
            self.outbound.send_queue.retain(|id| *id != state_id);
            self.outbound_loop(state_id)?;
        }
        Ok(())
    }

    /// Puts our messages with out index in `start..=end` back on the wire.
    pub(super) fn resend_outbound(&mut self, start: i32, end: i32) -> CoreResult<()> {
        tracing::info!(chat_id = %self.chat_id, start, end, "Resending messages");
        for out_index in (start..=end).rev() {
            let Some(&state_id) = self.outbound.by_out_index.get(&out_index) else {
                return Err(CoreError::ProtocolViolation(format!(
                    "message {} to resend is gone",
                    out_index
                )));
            };
            if self.outbound.in_flight == Some(state_id) {
                continue;
            }
            if let Some(state) = self.outbound.states.get_mut(&state_id) {
                state.send_finished = false;
            }
            self.outbound.requeue_front(state_id);
        }
        Ok(())
    }
}
