//! Crash recovery integration tests.
//!
//! A crash keeps only what was synced to the binlog plus the key-value
//! store; the restarted account must continue the chat where it stopped.


use sechat_core::{ChatId, ConfigState, PfsState, SeqNoState};
use sechat_engine::{KeyValueStore, SecretChatDb};
use std::sync::Arc;
use test_helpers::{wait_until, Fault, Pair, Party, Side};

fn db(party: &Party, chat_id: ChatId) -> SecretChatDb {
    let kv: Arc<dyn KeyValueStore> = Arc::new(party.kv.clone());
    SecretChatDb::new(kv, chat_id)
}

fn same_pfs(a: &PfsState, b: &PfsState) -> bool {
    a.stage == b.stage
        && a.auth_key.id() == b.auth_key.id()
        && a.other_auth_key.id() == b.other_auth_key.id()
        && a.message_id == b.message_id
        && a.exchange_id == b.exchange_id
        && a.last_timestamp == b.last_timestamp
}

/// Waits until the stored records of `party` match its in-memory state.
async fn wait_durable(party: &Party, chat_id: ChatId) {
    wait_until("state written", || async move {
        let snapshot = party.snapshot(chat_id).await;
        let db = db(party, chat_id);
        db.get_value::<SeqNoState>().ok().flatten() == Some(snapshot.seq)
            && db.get_value::<ConfigState>().ok().flatten() == Some(snapshot.config)
            && db
                .get_value::<PfsState>()
                .ok()
                .flatten()
                .map(|pfs| same_pfs(&pfs, &snapshot.pfs))
                .unwrap_or(false)
            && snapshot.pending_inbound == 0
    })
    .await;
}

/// Test: a restarted account resumes with identical state
#[tokio::test]
async fn test_restart_preserves_state() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    pair.alice.send_text(chat_id, 11, "one").await;
    {
        let bob = &pair.bob;
        wait_until("first message", || async move { bob.texts(chat_id).len() == 1 }).await;
    }
    pair.bob.send_text(chat_id, 21, "two").await;
    {
        let alice = &pair.alice;
        wait_until("reply", || async move { alice.texts(chat_id).len() == 1 }).await;
    }
    pair.quiesce(chat_id).await;
    wait_durable(&pair.bob, chat_id).await;
    let before = pair.bob.snapshot(chat_id).await;

    let Pair { server, alice, bob } = pair;
    let bob = bob.crash_and_restore(&server).await;
    let after = bob.snapshot(chat_id).await;

    assert_eq!(after.seq, before.seq);
    assert_eq!(after.config, before.config);
    assert_eq!(after.auth.state, before.auth.state);
    assert_eq!(after.auth.key_hash, before.auth.key_hash);
    assert_eq!(after.auth.access_hash, before.auth.access_hash);
    assert!(same_pfs(&after.pfs, &before.pfs));

    // Traffic continues in both directions.
    alice.send_text(chat_id, 12, "three").await;
    bob.send_text(chat_id, 22, "four").await;
    {
        let (alice, bob) = (&alice, &bob);
        wait_until("traffic after restart", || async move {
            bob.texts(chat_id).last().map(String::as_str) == Some("three")
                && alice.texts(chat_id).len() == 2
        })
        .await;
    }
    assert_eq!(alice.texts(chat_id), vec!["two", "four"]);
    assert_eq!(
        bob.texts(chat_id).iter().filter(|text| *text == "three").count(),
        1
    );
    assert!(!alice.is_closed(chat_id));
    assert!(!bob.is_closed(chat_id));
}

/// Test: messages logged but never answered by the server are sent after a
/// restart, exactly once and in order
#[tokio::test]
async fn test_unsent_messages_survive_crash() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    pair.server.inject(Side::Alice, 1, Fault::Hang);

    pair.alice.send_text(chat_id, 11, "one").await;
    pair.alice.send_text(chat_id, 12, "two").await;
    {
        let server = &pair.server;
        wait_until("first send in flight", || async move {
            server.content_count(Side::Alice) == 1
        })
        .await;
    }
    assert!(pair.alice.snapshot(chat_id).await.pending_outbound >= 2);

    let Pair { server, alice, bob } = pair;
    let alice = alice.crash_and_restore(&server).await;
    assert_eq!(alice.registry.chat_ids(), vec![chat_id]);

    {
        let bob = &bob;
        wait_until("both messages", || async move { bob.texts(chat_id).len() == 2 }).await;
    }
    assert_eq!(bob.texts(chat_id), vec!["one", "two"]);
    assert_eq!(server.content_count(Side::Alice), 3);
    assert!(!bob.is_closed(chat_id));
}

/// Test: a chat with nothing in the binlog is loaded from the store on demand
#[tokio::test]
async fn test_idle_chat_loads_from_store() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let Pair { server, alice, bob } = pair;
    let key_id = bob.snapshot(chat_id).await.pfs.auth_key.id();
    wait_durable(&bob, chat_id).await;

    let bob = bob.crash_and_restore(&server).await;
    let snapshot = bob.snapshot(chat_id).await;
    assert_eq!(snapshot.pfs.auth_key.id(), key_id);

    alice.send_text(chat_id, 11, "hello").await;
    {
        let bob = &bob;
        wait_until("message", || async move { bob.texts(chat_id).len() == 1 }).await;
    }
    assert_eq!(bob.texts(chat_id), vec!["hello"]);
}
