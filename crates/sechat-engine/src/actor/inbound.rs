//! Inbound pipeline.

use super::{AckTarget, ChatActor, CoreError, CoreResult, Followup, Hook, InboundState, StateId};
use crate::handle::{EncryptedMessage, Reply};
use crate::traits::InboundMessage;
use sechat_core::log_event::InboundSecretMessage;
use sechat_core::{
    Action, ChatState, DecryptedMessage, ErrorClass, LogEvent, LogId, MessageLayer, SeqNoUpdate,
    WireSeqNo,
};
use sechat_crypto::packet::{decrypt_packet, read_auth_key_id};

impl ChatActor {
    pub(super) fn on_new_message(&mut self, message: EncryptedMessage, reply: Reply) {
        if self.close_flag {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.auth.state != ChatState::Ready {
            tracing::warn!(
                chat_id = %self.chat_id,
                state = ?self.auth.state,
                "Encrypted message for a chat that isn't ready"
            );
            let _ = reply.send(Err(CoreError::ChatNotReady.into()));
            return;
        }
        let result = self
            .decrypt_inbound(message)
            .and_then(|event| self.do_inbound_message_decrypted(event, None));
        match result {
            Ok(mut followups) => {
                followups.push(Followup::Reply(reply));
                self.sync.push(followups);
            }
            Err(e) if e.class() == ErrorClass::Ignorable => {
                tracing::debug!(chat_id = %self.chat_id, error = %e, "Inbound message dropped");
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                let reason = e.to_string();
                let _ = reply.send(Err(e.into()));
                self.on_fatal_error(reason);
            }
        }
    }

    /// Decrypts and admits a packet, producing the event to log.
    fn decrypt_inbound(&mut self, message: EncryptedMessage) -> CoreResult<InboundSecretMessage> {
        let auth_key_id = read_auth_key_id(&message.data)?;
        let key = if auth_key_id == self.pfs.auth_key.id() {
            &self.pfs.auth_key
        } else if !self.pfs.other_auth_key.is_empty() && auth_key_id == self.pfs.other_auth_key.id()
        {
            &self.pfs.other_auth_key
        } else {
            return Err(CoreError::UnknownAuthKey(auth_key_id));
        };
        let payload = decrypt_packet(key, &message.data, !self.auth.is_creator())?;
        let mut layer = MessageLayer::parse(&payload)?;

        if layer.layer > self.config.his_layer {
            tracing::info!(chat_id = %self.chat_id, layer = layer.layer, "Peer layer raised");
            self.config.his_layer = layer.layer;
            self.save_config()?;
            self.send_state_update();
        }

        let wire = WireSeqNo {
            in_seq_no: layer.in_seq_no,
            out_seq_no: layer.out_seq_no,
        };
        let admission = self.seq.check_inbound(self.auth.x, wire, layer.layer)?;
        if let DecryptedMessage::Service {
            random_id,
            action: Action::Resend {
                start_seq_no,
                end_seq_no,
            },
        } = layer.message
        {
            let (start, end) = self.seq.resend_range(start_seq_no, end_seq_no)?;
            self.resend_outbound(start, end)?;
            layer.message = DecryptedMessage::Service {
                random_id,
                action: Action::Noop,
            };
        }
        let update = self.seq.next_inbound(admission);

        tracing::debug!(
            chat_id = %self.chat_id,
            message_id = update.message_id,
            in_seq_no = wire.in_seq_no,
            out_seq_no = wire.out_seq_no,
            "Admitted inbound message"
        );
        Ok(InboundSecretMessage {
            chat_id: self.chat_id,
            date: message.date,
            auth_key_id,
            message_id: update.message_id,
            my_in_seq_no: update.my_in_seq_no,
            my_out_seq_no: update.my_out_seq_no,
            his_in_seq_no: update.his_in_seq_no,
            his_layer: update.his_layer,
            decrypted_message_layer: layer.serialize(),
            file: message.file,
        })
    }

    /// Applies an admitted inbound event and hands its content over.
    ///
    /// Without `log_id` the event is appended and the returned follow-ups
    /// must wait for a sync; with one it is being replayed.
    pub(super) fn do_inbound_message_decrypted(
        &mut self,
        event: InboundSecretMessage,
        log_id: Option<LogId>,
    ) -> CoreResult<Vec<Followup>> {
        let layer = MessageLayer::parse(&event.decrypted_message_layer)?;
        let log_id = match log_id {
            Some(log_id) => log_id,
            None => self
                .ctx
                .binlog
                .append(LogEvent::InboundMessage(event.clone()).serialize())?,
        };

        self.apply_seq_update(&SeqNoUpdate {
            message_id: event.message_id,
            my_in_seq_no: event.my_in_seq_no,
            my_out_seq_no: event.my_out_seq_no,
            his_in_seq_no: event.his_in_seq_no,
            his_layer: event.his_layer,
        })?;
        if self.pfs.maybe_drop_other_key(event.auth_key_id) {
            self.changes.mark_pfs_changed();
        }

        let state_id = self.next_state_id();
        self.inbound.insert(
            state_id,
            InboundState {
                log_id,
                saved: false,
                app_done: false,
            },
        );
        let waits_for_app = match layer.message {
            DecryptedMessage::Content(content) => {
                let ack = self.watch_ack(AckTarget::Inbound(state_id));
                self.ctx.callbacks.on_inbound_message(
                    self.chat_id,
                    InboundMessage {
                        message_id: event.message_id,
                        date: event.date,
                        content,
                        file: event.file,
                    },
                    ack,
                );
                true
            }
            DecryptedMessage::Service { random_id, action } => self.on_inbound_action(
                state_id,
                event.message_id,
                event.date,
                random_id,
                action,
            )?,
        };
        if !waits_for_app {
            if let Some(state) = self.inbound.get_mut(&state_id) {
                state.app_done = true;
            }
        }

        let token = self
            .changes
            .add(&self.seq, &self.pfs, Hook::Inbound(state_id));
        Ok(vec![Followup::StartChanges(token)])
    }

    /// Dispatches a peer action. Returns whether the application must ack.
    fn on_inbound_action(
        &mut self,
        state_id: StateId,
        message_id: i32,
        date: i32,
        random_id: i64,
        action: Action,
    ) -> CoreResult<bool> {
        tracing::debug!(chat_id = %self.chat_id, message_id, action = action.name(), "Inbound action");
        let callbacks = self.ctx.callbacks.clone();
        match action {
            Action::SetTtl { ttl_seconds } => {
                if self.config.ttl != ttl_seconds {
                    self.config.ttl = ttl_seconds;
                    self.save_config()?;
                    self.send_state_update();
                }
                let ack = self.watch_ack(AckTarget::Inbound(state_id));
                callbacks.on_set_ttl(self.chat_id, message_id, date, ttl_seconds, random_id, ack);
                Ok(true)
            }
            Action::ReadMessages { random_ids } => {
                let ack = self.watch_ack(AckTarget::Inbound(state_id));
                callbacks.on_read_messages(self.chat_id, random_ids, ack);
                Ok(true)
            }
            Action::DeleteMessages { random_ids } => {
                self.rewrite_pending(Some(&random_ids))?;
                let ack = self.watch_ack(AckTarget::Inbound(state_id));
                callbacks.on_delete_messages(self.chat_id, random_ids, ack);
                Ok(true)
            }
            Action::ScreenshotMessages { .. } => {
                let ack = self.watch_ack(AckTarget::Inbound(state_id));
                callbacks.on_screenshot_taken(self.chat_id, message_id, date, random_id, ack);
                Ok(true)
            }
            Action::FlushHistory => {
                self.rewrite_pending(None)?;
                let ack = self.watch_ack(AckTarget::Inbound(state_id));
                callbacks.on_flush_history(self.chat_id, false, message_id, ack);
                Ok(true)
            }
            Action::NotifyLayer { layer } => {
                if layer > self.config.his_layer {
                    self.config.his_layer = layer;
                    self.save_config()?;
                    self.send_state_update();
                }
                Ok(false)
            }
            Action::Resend { .. } | Action::Typing { .. } | Action::Noop => Ok(false),
            pfs_action => {
                if !self.pfs.admit_action(message_id, self.seq.message_id) {
                    tracing::debug!(chat_id = %self.chat_id, message_id, "Stale key exchange action");
                    return Ok(false);
                }
                self.changes.mark_pfs_changed();
                let now = self.ctx.clock.now();
                let answer = self.pfs.on_inbound_action(
                    &pfs_action,
                    &self.auth.dh_config,
                    &self.ctx.primes,
                    self.seq.my_out_seq_no,
                    now,
                );
                match answer {
                    Ok(Some(answer)) => self.pending_actions.push_back(answer),
                    Ok(None) => {}
                    Err(e) if e.class() == ErrorClass::Recoverable => {
                        tracing::warn!(chat_id = %self.chat_id, error = %e, "Key exchange abandoned");
                    }
                    Err(e) => return Err(e),
                }
                Ok(false)
            }
        }
    }

    /// Erases an inbound event once its change is written and the
    /// application is done with it.
    pub(super) fn inbound_loop(&mut self, state_id: StateId) -> CoreResult<()> {
        let done = matches!(self.inbound.get(&state_id), Some(state) if state.saved && state.app_done);
        if done {
            if let Some(state) = self.inbound.remove(&state_id) {
                self.ctx.binlog.erase(state.log_id)?;
            }
        }
        Ok(())
    }
}
