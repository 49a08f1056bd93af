use chrono::Utc;
use shared::{
    domain::{ActivityKind, DealDetails, UserId},
    protocol::{
        ChangeKind, ChecklistPatch, CollectionScope, DealPatch, NewActivity, NewChecklistItem,
        NewDeal,
    },
};
use storage::Storage;

#[tokio::test]
async fn deal_lifecycle_across_stages_checklist_and_activity() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let stages = storage.seed_default_stages().await.expect("stages");
    let mut changes = storage.subscribe_changes();

    let deal = storage
        .insert_deal(NewDeal {
            stage_id: None,
            sort_order: None,
            details: DealDetails::for_office("Lakeside Vet", Utc::now()),
        })
        .await
        .expect("deal");
    let inserted = changes.recv().await.expect("insert note");
    assert_eq!(inserted.kind, ChangeKind::Insert);
    assert_eq!(inserted.entity_id, Some(deal.id.0));

    let loi = storage
        .stage_by_name("loi")
        .await
        .expect("lookup")
        .expect("loi stage");
    assert_eq!(loi.id, stages[3].id);

    storage
        .update_deal(
            deal.id,
            &DealPatch::Move {
                stage_id: loi.id,
                sort_order: 1000.0,
            },
        )
        .await
        .expect("move");
    storage
        .update_deal(
            deal.id,
            &DealPatch::SetValue {
                deal_value: 875_000.0,
            },
        )
        .await
        .expect("value");

    let item = storage
        .insert_checklist_item(NewChecklistItem {
            deal_id: deal.id,
            title: "Letter of intent signed".into(),
            completed: false,
            is_custom: true,
            display_order: 10,
            template_key: None,
        })
        .await
        .expect("checklist");
    storage
        .update_checklist_item(item.id, &ChecklistPatch::SetCompleted { completed: true })
        .await
        .expect("complete");

    storage
        .insert_activity(NewActivity {
            deal_id: deal.id,
            user_id: UserId::random(),
            content: "Moved to LOI after site visit".into(),
            kind: ActivityKind::DealUpdate,
        })
        .await
        .expect("activity");

    let reloaded = storage
        .load_deal(deal.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(reloaded.stage_id, loi.id);
    assert_eq!(reloaded.details.deal_value, 875_000.0);

    let checklist = storage.list_checklist(deal.id).await.expect("checklist");
    assert!(checklist[0].completed);

    let feed = storage.list_activity(deal.id).await.expect("feed");
    assert_eq!(feed[0].kind, ActivityKind::DealUpdate);

    let mut scopes = Vec::new();
    while let Ok(note) = changes.try_recv() {
        scopes.push(note.scope);
    }
    assert_eq!(
        scopes,
        vec![
            CollectionScope::Deals,
            CollectionScope::Deals,
            CollectionScope::Checklist(deal.id),
            CollectionScope::Checklist(deal.id),
            CollectionScope::Activity(deal.id),
        ]
    );
}
