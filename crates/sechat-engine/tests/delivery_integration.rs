//! Message delivery integration tests.
//!
//! Tests verify end-to-end sequencing between two accounts:
//! - In-order, exactly-once delivery
//! - Transient send failures are retried without reordering
//! - Duplicate packets are dropped
//! - A lost packet closes the receiving chat
//! - A rejected message is replaced by a self-deleting service message
//! - Service actions reach the peer's application
//! - Resend requests and invalid sequence numbers


use sechat_core::{Action, ContentMessage, DecryptedMessage};
use sechat_engine::mock::CallbackEvent;
use std::time::Duration;
use test_helpers::{wait_until, Fault, Pair, Side};

/// Test: three messages arrive once and in order
#[tokio::test]
async fn test_messages_arrive_in_order() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);

    for (random_id, text) in [(11, "one"), (12, "two"), (13, "three")] {
        alice.send_text(chat_id, random_id, text).await;
    }
    wait_until("three messages", || async move { bob.texts(chat_id).len() == 3 }).await;
    assert_eq!(bob.texts(chat_id), vec!["one", "two", "three"]);

    let ids: Vec<i32> = bob
        .callbacks
        .messages(chat_id)
        .iter()
        .map(|message| message.message_id)
        .collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

    // A reply carries the acknowledgement of everything Bob received.
    bob.send_text(chat_id, 21, "ack").await;
    wait_until("send acks", || async move {
        let acked = alice
            .callbacks
            .events()
            .into_iter()
            .filter(|event| matches!(event, CallbackEvent::SendAck(..)))
            .count();
        acked == 3
    })
    .await;
    assert_eq!(alice.texts(chat_id), vec!["ack"]);

    let events = alice.callbacks.events();
    for random_id in [11, 12, 13] {
        assert!(events.contains(&CallbackEvent::SendOk(chat_id, random_id)));
        assert!(events.contains(&CallbackEvent::SendAck(chat_id, random_id)));
    }
}

/// Test: a transient failure delays but does not reorder
#[tokio::test]
async fn test_transient_failure_is_retried() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);
    pair.server.inject(Side::Alice, 2, Fault::FailOnce);

    for (random_id, text) in [(11, "one"), (12, "two"), (13, "three")] {
        alice.send_text(chat_id, random_id, text).await;
    }
    wait_until("three messages", || async move { bob.texts(chat_id).len() == 3 }).await;

    assert_eq!(bob.texts(chat_id), vec!["one", "two", "three"]);
    assert_eq!(pair.server.content_count(Side::Alice), 4);
    assert!(!bob.is_closed(chat_id));
}

/// Test: the second copy of a packet is dropped
#[tokio::test]
async fn test_duplicate_packet_is_dropped() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);
    pair.server.inject(Side::Alice, 1, Fault::Duplicate);

    alice.send_text(chat_id, 11, "one").await;
    alice.send_text(chat_id, 12, "two").await;
    wait_until("two messages", || async move { bob.texts(chat_id).len() == 2 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bob.texts(chat_id), vec!["one", "two"]);
    assert!(!bob.is_closed(chat_id));
    assert_eq!(bob.snapshot(chat_id).await.pending_inbound, 0);
}

/// Test: a lost packet is detected as a gap and closes the chat
#[tokio::test]
async fn test_sequence_gap_closes_chat() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);
    pair.server.inject(Side::Alice, 1, Fault::Drop);

    alice.send_text(chat_id, 11, "one").await;
    alice.send_text(chat_id, 12, "two").await;
    wait_until("both sides closed", || async move {
        bob.is_closed(chat_id) && alice.is_closed(chat_id)
    })
    .await;

    let reason = bob
        .callbacks
        .last_state(chat_id)
        .and_then(|update| update.reason)
        .expect("close reason missing");
    assert!(reason.contains("gap"), "unexpected reason: {}", reason);
    assert!(bob.texts(chat_id).is_empty());
    assert_eq!(pair.server.request_count(Side::Bob, "DiscardEncryption"), 1);
}

/// Test: a message the server rejects is replaced by its own deletion
#[tokio::test]
async fn test_rejected_message_is_replaced() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);
    pair.server.inject(Side::Alice, 1, Fault::Reject);

    alice.send_text(chat_id, 11, "too long").await;
    wait_until("deletion delivered", || async move {
        bob.callbacks
            .events()
            .contains(&CallbackEvent::DeleteMessages(chat_id, vec![11]))
    })
    .await;

    assert!(alice
        .callbacks
        .events()
        .iter()
        .any(|event| matches!(event, CallbackEvent::SendError(id, 11, _) if *id == chat_id)));
    assert!(bob.texts(chat_id).is_empty());

    // The sequence is intact.
    alice.send_text(chat_id, 12, "short").await;
    wait_until("next message", || async move { bob.texts(chat_id).len() == 1 }).await;
    assert_eq!(bob.texts(chat_id), vec!["short"]);
    assert!(!bob.is_closed(chat_id));
}

/// Test: timer, read and screenshot actions reach the peer
#[tokio::test]
async fn test_service_actions_reach_peer() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);

    alice.send_text(chat_id, 11, "one").await;
    wait_until("message", || async move { bob.texts(chat_id).len() == 1 }).await;

    let handle = alice.chat(chat_id);
    handle
        .send_set_ttl_message(30, 101)
        .await
        .expect("set ttl failed");
    bob.chat(chat_id)
        .send_action(201, Action::ReadMessages { random_ids: vec![11] })
        .await
        .expect("read failed");
    bob.chat(chat_id)
        .send_action(202, Action::ScreenshotMessages { random_ids: vec![11] })
        .await
        .expect("screenshot failed");

    wait_until("actions delivered", || async move {
        let bob_events = bob.callbacks.events();
        let alice_events = alice.callbacks.events();
        bob_events.contains(&CallbackEvent::SetTtl(chat_id, 30))
            && alice_events.contains(&CallbackEvent::ReadMessages(chat_id, vec![11]))
            && alice_events.contains(&CallbackEvent::Screenshot(chat_id, 202))
    })
    .await;

    assert_eq!(alice.snapshot(chat_id).await.config.ttl, 30);
    assert_eq!(bob.snapshot(chat_id).await.config.ttl, 30);
    assert_eq!(bob.callbacks.last_state(chat_id).map(|update| update.ttl), Some(30));
}

/// Test: a packet with negative sequence numbers is rejected and closes the
/// chat instead of being delivered
#[tokio::test]
async fn test_negative_sequence_number_closes_chat() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);

    let content = DecryptedMessage::Content(ContentMessage {
        random_id: 777,
        text: "replayed".to_string(),
        ..ContentMessage::default()
    });
    let packet = alice.seal(chat_id, -1, 999, content).await;
    let result = bob.registry.on_new_message(chat_id, packet.clone()).await;
    assert!(result.is_err());

    wait_until("receiver closed", || async move { bob.is_closed(chat_id) }).await;
    let reason = bob
        .callbacks
        .last_state(chat_id)
        .and_then(|update| update.reason)
        .expect("close reason missing");
    assert!(reason.contains("-1/999"), "unexpected reason: {}", reason);

    // A second copy finds the chat gone or closing and delivers nothing.
    let _ = bob.registry.on_new_message(chat_id, packet).await;
    assert!(bob.texts(chat_id).is_empty());
}

/// Test: a resend request puts pending messages back on the wire with their
/// original sequence numbers
#[tokio::test]
async fn test_resend_request_repeats_pending_messages() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);
    let first_index = alice.snapshot(chat_id).await.seq.my_out_seq_no;

    alice.send_text(chat_id, 11, "one").await;
    alice.send_text(chat_id, 12, "two").await;
    wait_until("both sent", || async move {
        let events = alice.callbacks.events();
        bob.texts(chat_id).len() == 2
            && events.contains(&CallbackEvent::SendOk(chat_id, 11))
            && events.contains(&CallbackEvent::SendOk(chat_id, 12))
    })
    .await;
    assert_eq!(pair.server.content_count(Side::Alice), 2);
    let before = alice.snapshot(chat_id).await.seq;

    // Bob's account asks for both again without acknowledging them.
    let request = bob
        .seal(
            chat_id,
            2 * before.his_in_seq_no + 1,
            2 * before.my_in_seq_no,
            DecryptedMessage::Service {
                random_id: 901,
                action: Action::Resend {
                    start_seq_no: 2 * first_index + 1,
                    end_seq_no: 2 * (first_index + 1) + 1,
                },
            },
        )
        .await;
    alice
        .registry
        .on_new_message(chat_id, request)
        .await
        .expect("resend request refused");

    let server = &pair.server;
    wait_until("messages resent", || async move {
        server.content_count(Side::Alice) == 4
    })
    .await;
    wait_until("copies dropped", || async move {
        bob.snapshot(chat_id).await.pending_inbound == 0
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(bob.texts(chat_id), vec!["one", "two"]);
    assert!(!bob.is_closed(chat_id));
    assert!(!alice.is_closed(chat_id));
    let after = alice.snapshot(chat_id).await.seq;
    assert_eq!(after.my_out_seq_no, before.my_out_seq_no);
    assert_eq!(after.my_in_seq_no, before.my_in_seq_no + 1);
}

/// Test: asking again for a message that was acknowledged and dropped
/// closes the chat
#[tokio::test]
async fn test_resend_of_erased_message_closes_chat() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);
    let first_index = alice.snapshot(chat_id).await.seq.my_out_seq_no;

    alice.send_text(chat_id, 11, "one").await;
    wait_until("message", || async move { bob.texts(chat_id).len() == 1 }).await;
    bob.send_text(chat_id, 21, "ack").await;
    wait_until("acknowledged and dropped", || async move {
        alice
            .callbacks
            .events()
            .contains(&CallbackEvent::SendAck(chat_id, 11))
            && alice.snapshot(chat_id).await.pending_outbound == 0
    })
    .await;

    let seq = alice.snapshot(chat_id).await.seq;
    let request = bob
        .seal(
            chat_id,
            2 * seq.his_in_seq_no + 1,
            2 * seq.my_in_seq_no,
            DecryptedMessage::Service {
                random_id: 902,
                action: Action::Resend {
                    start_seq_no: 2 * first_index + 1,
                    end_seq_no: 2 * first_index + 1,
                },
            },
        )
        .await;
    let result = alice.registry.on_new_message(chat_id, request).await;
    assert!(result.is_err());

    wait_until("sender closed", || async move { alice.is_closed(chat_id) }).await;
    let reason = alice
        .callbacks
        .last_state(chat_id)
        .and_then(|update| update.reason)
        .expect("close reason missing");
    assert!(reason.contains("gone"), "unexpected reason: {}", reason);
    assert_eq!(pair.server.content_count(Side::Alice), 1);
}
