//! Forward-secrecy key rotation integration tests.


use sechat_core::PfsStage;
use test_helpers::{wait_until, Pair, Side};

/// Test: a rotation with a message in flight switches both sides to the
/// same new key without losing traffic
#[tokio::test]
async fn test_rekey_with_message_in_flight() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);
    let initial_key = alice.snapshot(chat_id).await.pfs.auth_key.id();

    alice
        .chat(chat_id)
        .request_rekey()
        .await
        .expect("request_rekey failed");
    alice.send_text(chat_id, 11, "during rekey").await;

    wait_until("rotation finished", || async move {
        let a = alice.snapshot(chat_id).await;
        let b = bob.snapshot(chat_id).await;
        a.pfs.stage == PfsStage::Empty
            && b.pfs.stage == PfsStage::Empty
            && a.pfs.auth_key.id() != initial_key
            && a.pfs.auth_key.id() == b.pfs.auth_key.id()
    })
    .await;

    alice.send_text(chat_id, 12, "after rekey").await;
    bob.send_text(chat_id, 21, "reply").await;
    wait_until("traffic under the new key", || async move {
        bob.texts(chat_id).len() == 2 && alice.texts(chat_id).len() == 1
    })
    .await;
    assert_eq!(bob.texts(chat_id), vec!["during rekey", "after rekey"]);
    assert_eq!(alice.texts(chat_id), vec!["reply"]);

    let a = alice.snapshot(chat_id).await;
    let b = bob.snapshot(chat_id).await;
    assert_eq!(a.pfs.auth_key.id(), b.pfs.auth_key.id());
    assert!(a.pfs.other_auth_key.is_empty());
    assert!(!bob.is_closed(chat_id));
    assert_eq!(pair.server.request_count(Side::Bob, "DiscardEncryption"), 0);
}

/// Test: both sides asking for a rotation at once still converges
#[tokio::test]
async fn test_simultaneous_rekey_requests() {
    let pair = Pair::new();
    let chat_id = pair.establish().await;
    let (alice, bob) = (&pair.alice, &pair.bob);
    let initial_key = alice.snapshot(chat_id).await.pfs.auth_key.id();

    let alice_chat = alice.chat(chat_id);
    let bob_chat = bob.chat(chat_id);
    let (a, b) = tokio::join!(alice_chat.request_rekey(), bob_chat.request_rekey());
    a.expect("alice request_rekey failed");
    b.expect("bob request_rekey failed");

    wait_until("rotation finished", || async move {
        let a = alice.snapshot(chat_id).await;
        let b = bob.snapshot(chat_id).await;
        a.pfs.stage == PfsStage::Empty
            && b.pfs.stage == PfsStage::Empty
            && a.pfs.auth_key.id() != initial_key
            && a.pfs.auth_key.id() == b.pfs.auth_key.id()
    })
    .await;

    alice.send_text(chat_id, 11, "after").await;
    wait_until("message", || async move { bob.texts(chat_id).len() == 1 }).await;
    assert!(!alice.is_closed(chat_id));
    assert!(!bob.is_closed(chat_id));
}
