mod common;

use std::sync::Arc;

use outreach_worker::db::{SqliteStore, Store};
use outreach_worker::models::{ConversationType, Direction, EmailEnvelope};
use outreach_worker::services::InboxReconciler;

use common::{count, file_store, seed_account, seed_org, seed_sent, store};

fn envelope(message_id: &str, counterpart: &str, thread: Option<&str>, sent_at: i64) -> EmailEnvelope {
    EmailEnvelope {
        organization_id: "org-1".into(),
        account_id: "acc-1".into(),
        message_id_header: message_id.into(),
        thread_id: thread.map(str::to_string),
        counterpart: counterpart.into(),
        subject: Some("Quick question".into()),
        sent_at,
        scheduled_send_id: None,
    }
}

async fn reconciler() -> (Arc<SqliteStore>, Arc<InboxReconciler>) {
    let store = store().await;
    seed_org(&store, "org-1").await;
    seed_account(&store, "acc-1", "org-1", 50, 0).await;
    let dyn_store: Arc<dyn Store> = store.clone();
    (store, Arc::new(InboxReconciler::new(dyn_store)))
}

#[tokio::test]
async fn double_ingest_is_a_no_op() {
    let (store, reconciler) = reconciler().await;
    let msg = envelope("<m1@ours.example>", "jane@lead.example", None, 100);

    let first = reconciler.ingest_email(&msg, Direction::Sent).await.unwrap();
    let second = reconciler.ingest_email(&msg, Direction::Sent).await.unwrap();

    assert!(first.created_message);
    assert!(!second.created_message);
    assert_eq!(first.conversation.id, second.conversation.id);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM conversation_messages").await, 1);
}

#[tokio::test]
async fn bracketed_and_bare_ids_dedupe() {
    let (store, reconciler) = reconciler().await;
    reconciler
        .ingest_email(&envelope("<m1@ours.example>", "jane@lead.example", None, 100), Direction::Sent)
        .await
        .unwrap();
    let again = reconciler
        .ingest_email(&envelope(" m1@ours.example ", "jane@lead.example", None, 100), Direction::Sent)
        .await
        .unwrap();
    assert!(!again.created_message);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM conversation_messages").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_new_thread_messages_share_one_conversation() {
    let (store, reconciler) = reconciler().await;
    let a = envelope("a@ours.example", "Jane@Lead.example", Some("thread-1"), 100);
    let b = envelope("b@lead.example", "jane@lead.example", Some("thread-1"), 110);

    let r1 = reconciler.clone();
    let r2 = reconciler.clone();
    let (first, second) = tokio::join!(
        tokio::spawn(async move { r1.ingest_email(&a, Direction::Sent).await }),
        tokio::spawn(async move { r2.ingest_email(&b, Direction::Received).await }),
    );
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();

    assert_eq!(first.conversation.id, second.conversation.id);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM conversations").await, 1);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM conversation_messages").await, 2);
}

#[tokio::test]
async fn activity_never_moves_backwards() {
    let (store, reconciler) = reconciler().await;
    reconciler
        .ingest_email(&envelope("late@x", "jane@lead.example", None, 200), Direction::Sent)
        .await
        .unwrap();
    let outcome = reconciler
        .ingest_email(&envelope("early@x", "jane@lead.example", None, 100), Direction::Sent)
        .await
        .unwrap();

    assert_eq!(outcome.conversation.last_activity_at, 200);
    let stored = store.conversation(&outcome.conversation.id).await.unwrap().unwrap();
    assert_eq!(stored.last_activity_at, 200);
}

#[tokio::test]
async fn mixed_type_is_sticky() {
    let (_store, reconciler) = reconciler().await;
    let first = reconciler
        .ingest_email(&envelope("s1@x", "jane@lead.example", None, 100), Direction::Sent)
        .await
        .unwrap();
    assert_eq!(first.conversation.conversation_type, ConversationType::Sent);

    let second = reconciler
        .ingest_email(&envelope("r1@x", "jane@lead.example", None, 110), Direction::Received)
        .await
        .unwrap();
    assert_eq!(second.conversation.conversation_type, ConversationType::Mixed);

    let third = reconciler
        .ingest_email(&envelope("s2@x", "jane@lead.example", None, 120), Direction::Sent)
        .await
        .unwrap();
    assert_eq!(third.conversation.conversation_type, ConversationType::Mixed);
}

#[tokio::test]
async fn thread_mapping_wins_over_participant() {
    let (store, reconciler) = reconciler().await;
    let sent = reconciler
        .ingest_email(&envelope("s1@x", "jane@lead.example", Some("s1@x"), 100), Direction::Sent)
        .await
        .unwrap();
    // A colleague answers in the same thread from another address.
    let reply = reconciler
        .ingest_email(&envelope("r1@y", "boss@lead.example", Some("s1@x"), 120), Direction::Received)
        .await
        .unwrap();

    assert_eq!(sent.conversation.id, reply.conversation.id);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM conversations").await, 1);
}

#[tokio::test]
async fn outbound_rows_link_their_scheduled_send() {
    let (store, reconciler) = reconciler().await;
    seed_sent(&store, "send-1", "org-1", "acc-1", None, "jane@lead.example", "<orig-1@ours.example>", 100).await;
    let send = store.sent_history(Some("org-1"), None, 10).await.unwrap().remove(0);

    let outcome = reconciler.record_outbound(&send).await.unwrap();
    let messages = store.conversation_messages(&outcome.conversation.id).await.unwrap();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id_header, "orig-1@ours.example");
    assert_eq!(messages[0].scheduled_send_id.as_deref(), Some("send-1"));
    assert_eq!(messages[0].thread_id.as_deref(), Some("orig-1@ours.example"));
}

#[tokio::test]
async fn message_without_id_is_rejected() {
    let (_store, reconciler) = reconciler().await;
    let err = reconciler
        .ingest_email(&envelope("  ", "jane@lead.example", None, 100), Direction::Received)
        .await
        .unwrap_err();
    assert!(!err.is_conflict());
}

#[tokio::test]
async fn failed_commit_does_not_wedge_later_ingests() {
    let (store, reconciler) = reconciler().await;
    // A deferred foreign key only fails at COMMIT time.
    sqlx::raw_sql(
        r#"CREATE TABLE commit_guard (
             org_id TEXT REFERENCES organizations(id) DEFERRABLE INITIALLY DEFERRED
           );
           CREATE TRIGGER poison_commit AFTER INSERT ON conversation_messages
           WHEN NEW.message_id_header = 'poison@x'
           BEGIN
             INSERT INTO commit_guard (org_id) VALUES ('no-such-org');
           END;"#,
    )
    .execute(store.pool())
    .await
    .unwrap();

    let failed = reconciler
        .ingest_email(&envelope("poison@x", "jane@lead.example", None, 100), Direction::Sent)
        .await;
    assert!(failed.is_err());
    assert_eq!(count(&store, "SELECT COUNT(*) FROM conversation_messages").await, 0);

    let next = reconciler
        .ingest_email(&envelope("fine@x", "bob@lead.example", None, 110), Direction::Sent)
        .await
        .unwrap();
    assert!(next.created_message);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM conversation_messages").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ingests_serialize_across_pool_connections() {
    let (_dir, store) = file_store(5).await;
    seed_org(&store, "org-1").await;
    seed_account(&store, "acc-1", "org-1", 50, 0).await;
    let dyn_store: Arc<dyn Store> = store.clone();
    let reconciler = Arc::new(InboxReconciler::new(dyn_store));

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let reconciler = reconciler.clone();
            let direction = if i % 2 == 0 { Direction::Sent } else { Direction::Received };
            let msg = envelope(&format!("m{i}@x"), "jane@lead.example", None, 100 + i);
            tokio::spawn(async move { reconciler.ingest_email(&msg, direction).await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().created_message);
    }

    assert_eq!(count(&store, "SELECT COUNT(*) FROM conversations").await, 1);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM conversation_messages").await, 20);
    let conversation_type: String = sqlx::query_scalar("SELECT conversation_type FROM conversations")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(conversation_type, "mixed");
}
