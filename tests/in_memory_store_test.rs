//! Store contract exercised against the in-memory backend

use chrono::{Duration as ChronoDuration, Utc};
use dead_letter_core::config::DeadLetterConfig;
use dead_letter_core::dead_letter::{
    ChannelNotifier, DeadLetterRequest, DeadLetterService, DeadLetterStore, FailedMessageInfo,
    HandlerFailure, InMemoryDeadLetterStore, NotificationDispatcher, StoreContext,
};
use dead_letter_core::RuntimeEnvironment;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct OrderPlaced {
    order_id: u64,
    customer: String,
}

fn config() -> DeadLetterConfig {
    let mut config = DeadLetterConfig::default();
    config.dead_letter.source_queues = vec!["orders".into(), "invoices".into()];
    config
}

fn context() -> StoreContext {
    StoreContext::from_config(&config(), RuntimeEnvironment::Test)
}

fn store() -> DeadLetterStore {
    DeadLetterStore::InMemory(InMemoryDeadLetterStore::new(context()))
}

fn in_memory(store: &DeadLetterStore) -> &InMemoryDeadLetterStore {
    store.as_in_memory().expect("in-memory store")
}

async fn dead_letter(store: &DeadLetterStore, source: &str, order_id: u64) -> FailedMessageInfo {
    store
        .send_failure(
            &OrderPlaced {
                order_id,
                customer: "acme".into(),
            },
            &HandlerFailure::validation("customer missing"),
            "OrderHandler",
            source,
            3,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn reprocess_republishes_exactly_once_and_removes_entry() {
    let store = store();
    let first = dead_letter(&store, "orders", 1).await;
    let second = dead_letter(&store, "orders", 2).await;

    assert!(store
        .reprocess_dead_letter_message("dlq.orders", first.message_id)
        .await
        .unwrap());

    let remaining = store
        .list_dead_letter_messages("dlq.orders", usize::MAX)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message_id, second.message_id);

    let republished = in_memory(&store).republished("orders");
    assert_eq!(republished.len(), 1);
    assert_eq!(republished[0].body, first.original_message);
    assert_eq!(republished[0].headers["reprocessed-from-dlq"], true);
    assert_eq!(
        republished[0].headers["original-message-id"],
        first.message_id.to_string()
    );

    // a second reprocess of the same id finds nothing and republishes nothing
    assert!(!store
        .reprocess_dead_letter_message("orders", first.message_id)
        .await
        .unwrap());
    assert_eq!(in_memory(&store).republished("orders").len(), 1);
}

#[tokio::test]
async fn purge_twice_is_a_noop_the_second_time() {
    let store = store();
    let target = dead_letter(&store, "orders", 1).await;
    let bystander = dead_letter(&store, "orders", 2).await;

    assert!(store
        .purge_dead_letter_message("orders", target.message_id)
        .await
        .unwrap());
    assert!(!store
        .purge_dead_letter_message("orders", target.message_id)
        .await
        .unwrap());

    let remaining = store.list_dead_letter_messages("orders", 10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message_id, bystander.message_id);
    assert!(in_memory(&store).republished("orders").is_empty());
}

#[tokio::test]
async fn browse_does_not_remove_or_reorder() {
    let store = store();
    let mut sent = Vec::new();
    for id in 0..5 {
        sent.push(dead_letter(&store, "orders", id).await.message_id);
    }

    let first: Vec<_> = store
        .list_dead_letter_messages("orders", 3)
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.message_id)
        .collect();
    let second: Vec<_> = store
        .list_dead_letter_messages("orders", 10)
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.message_id)
        .collect();

    assert_eq!(first, sent[..3]);
    assert_eq!(second, sent);
}

#[tokio::test]
async fn statistics_match_listing_every_known_queue() {
    let store = store();
    for id in 0..4 {
        dead_letter(&store, "orders", id).await;
    }
    for id in 0..2 {
        dead_letter(&store, "invoices", id).await;
    }
    dead_letter(&store, "default", 99).await;

    let stats = store.get_dead_letter_statistics().await.unwrap();
    assert!(stats.is_consistent());
    assert!(stats.unavailable_queues.is_empty());

    let mut listed = 0u64;
    for queue in store.known_queues() {
        listed += store
            .list_dead_letter_messages(&queue, usize::MAX)
            .await
            .unwrap()
            .len() as u64;
    }

    assert_eq!(stats.total_dead_letter_messages, 7);
    assert_eq!(stats.total_dead_letter_messages, listed);
    assert_eq!(stats.messages_by_queue["dlq.orders"], 4);
    assert_eq!(stats.messages_by_queue["dlq.invoices"], 2);
    assert_eq!(stats.messages_by_queue["dlq.default"], 1);
}

#[tokio::test]
async fn concurrent_senders_each_land_exactly_once() {
    const TASKS: u64 = 32;
    const PER_TASK: u64 = 25;

    let store = Arc::new(store());
    let mut handles = Vec::new();
    for task in 0..TASKS {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for n in 0..PER_TASK {
                ids.push(dead_letter(&store, "orders", task * 1_000 + n).await.message_id);
            }
            ids
        }));
    }

    let mut sent = HashSet::new();
    for ids in futures::future::join_all(handles).await {
        for id in ids.unwrap() {
            assert!(sent.insert(id), "duplicate message id {id}");
        }
    }

    let listed = store
        .list_dead_letter_messages("orders", usize::MAX)
        .await
        .unwrap();
    let listed_ids: HashSet<_> = listed.iter().map(|info| info.message_id).collect();

    assert_eq!(listed.len() as u64, TASKS * PER_TASK);
    assert_eq!(listed_ids, sent);
}

#[tokio::test]
async fn infrastructure_failures_are_returned_not_swallowed() {
    let store = store();
    let existing = dead_letter(&store, "orders", 1).await;
    in_memory(&store).set_unavailable(true);

    let send = store
        .send_failure(&"payload", &HandlerFailure::timeout("slow"), "H", "orders", 1)
        .await;
    assert!(send.unwrap_err().is_infrastructure());

    let purge = store
        .purge_dead_letter_message("orders", existing.message_id)
        .await;
    assert!(purge.unwrap_err().is_infrastructure());

    let reprocess = store
        .reprocess_dead_letter_message("orders", existing.message_id)
        .await;
    assert!(reprocess.unwrap_err().is_infrastructure());

    // statistics degrade per queue instead of failing
    let stats = store.get_dead_letter_statistics().await.unwrap();
    assert_eq!(stats.unavailable_queues.len(), store.known_queues().len());
    assert_eq!(stats.total_dead_letter_messages, 0);
    assert!(!store.health_check().await.unwrap());

    in_memory(&store).set_unavailable(false);
    assert_eq!(store.list_dead_letter_messages("orders", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn envelope_survives_storage_unchanged() {
    let store = store();
    let sent = dead_letter(&store, "orders", 7).await;

    let listed = store.list_dead_letter_messages("orders", 1).await.unwrap();
    assert_eq!(listed[0], sent);
    assert_eq!(listed[0].failure_attempts.len(), 1);
    assert_eq!(listed[0].failure_attempts[0].handler_type, "OrderHandler");
    assert_eq!(listed[0].original_message, r#"{"order_id":7,"customer":"acme"}"#);
}

#[tokio::test]
async fn first_attempt_is_estimated_unless_supplied() {
    let store = store();

    let estimated = dead_letter(&store, "orders", 1).await;
    assert!(estimated.first_attempt_estimated);
    assert_eq!(
        estimated.last_attempt_at - estimated.first_attempt_at,
        ChronoDuration::minutes(6)
    );

    let started = Utc::now() - ChronoDuration::minutes(42);
    let request = DeadLetterRequest::new(
        &OrderPlaced {
            order_id: 2,
            customer: "acme".into(),
        },
        &HandlerFailure::validation("customer missing"),
        "OrderHandler",
        "orders",
        3,
    )
    .unwrap()
    .with_first_attempt_at(started);
    let tracked = store.send_to_dead_letter(request).await.unwrap();

    assert!(!tracked.first_attempt_estimated);
    assert_eq!(tracked.first_attempt_at, started);
}

#[tokio::test]
async fn administrators_are_notified_after_persistence() {
    let (notifier, mut receiver) = ChannelNotifier::new(8);
    let context =
        context().with_notifications(NotificationDispatcher::new(true, Arc::new(notifier)));
    let store = DeadLetterStore::InMemory(InMemoryDeadLetterStore::new(context));

    let info = dead_letter(&store, "orders", 1).await;
    let notification = receiver.recv().await.unwrap();

    assert_eq!(notification.message_id, info.message_id);
    assert_eq!(notification.queue_name, "dlq.orders");
    assert_eq!(notification.attempt_count, 3);
}

#[tokio::test]
async fn failed_notification_does_not_fail_dead_lettering() {
    let (notifier, receiver) = ChannelNotifier::new(1);
    drop(receiver);
    let context =
        context().with_notifications(NotificationDispatcher::new(true, Arc::new(notifier)));
    let store = DeadLetterStore::InMemory(InMemoryDeadLetterStore::new(context));

    let info = dead_letter(&store, "orders", 1).await;
    let listed = store.list_dead_letter_messages("orders", 10).await.unwrap();
    assert_eq!(listed[0].message_id, info.message_id);
}

#[tokio::test]
async fn invalid_source_queue_is_rejected_before_any_io() {
    let store = store();
    let err = store
        .send_failure(&"payload", &HandlerFailure::timeout("slow"), "H", "bad queue", 1)
        .await
        .unwrap_err();
    assert!(!err.is_infrastructure());
    assert!(store.get_dead_letter_statistics().await.unwrap().total_dead_letter_messages == 0);
}
