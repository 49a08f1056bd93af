use super::*;
use crate::test_support::{new_office_deal, seeded_storage};
use chrono::{Duration as ChronoDuration, Utc};
use shared::{domain::ActivityId, error::PipelineError};
use std::time::Duration;

async fn feed_for_new_deal() -> (storage::Storage, ActivityFeed) {
    let (storage, _) = seeded_storage().await;
    let deal = storage
        .insert_deal(new_office_deal("Cedar"))
        .await
        .expect("deal");
    let feed = ActivityFeed::load(Arc::new(storage.clone()), deal.id)
        .await
        .expect("load");
    (storage, feed)
}

#[tokio::test]
async fn posts_show_newest_first() {
    let (_, mut feed) = feed_for_new_deal().await;
    let author = UserId::random();
    feed.post(author, ActivityKind::Meeting, "Met the seller")
        .await
        .expect("first");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let latest = feed
        .post(author, ActivityKind::PhoneCall, "  Called the bank ")
        .await
        .expect("second");

    assert_eq!(latest.content, "Called the bank");
    assert_eq!(feed.entries()[0].id, latest.id);
    assert_eq!(feed.entries().len(), 2);
}

#[tokio::test]
async fn blank_post_is_rejected_before_writing() {
    let (storage, mut feed) = feed_for_new_deal().await;
    let before = storage.last_sequence();
    let err = feed
        .post(UserId::random(), ActivityKind::Comment, "   ")
        .await
        .expect_err("blank");
    assert!(matches!(err, PipelineError::Validation(_)));
    assert_eq!(storage.last_sequence(), before);
}

#[tokio::test]
async fn apply_resorts_by_time_then_id() {
    let (_, mut feed) = feed_for_new_deal().await;
    let now = Utc::now();
    let entry = |minutes_ago: i64| ActivityEntry {
        id: ActivityId::random(),
        deal_id: feed.deal_id(),
        user_id: UserId::random(),
        content: format!("{minutes_ago} minutes ago"),
        kind: ActivityKind::Comment,
        created_at: now - ChronoDuration::minutes(minutes_ago),
    };
    let old = entry(30);
    let recent = entry(1);
    feed.apply(vec![old.clone(), recent.clone()]);
    assert_eq!(feed.entries()[0].id, recent.id);
    assert_eq!(feed.entries()[1].id, old.id);
}

#[tokio::test]
async fn watched_feed_sees_other_authors() {
    let (storage, feed) = feed_for_new_deal().await;
    let deal_id = feed.deal_id();
    let feed = Arc::new(Mutex::new(feed));
    let _watch = ActivityFeed::watch(&feed).await.expect("watch");

    storage
        .insert_activity(NewActivity {
            deal_id,
            user_id: UserId::random(),
            content: "Uploaded tax returns".into(),
            kind: ActivityKind::Document,
        })
        .await
        .expect("remote post");

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !feed.lock().await.entries().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("feed refreshed");
    assert_eq!(feed.lock().await.entries()[0].kind, ActivityKind::Document);
}
