use super::*;
use crate::test_support::{new_office_deal, seeded_storage, FlakyGateway};
use shared::protocol::NewDeal;
use std::time::Duration;
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;

async fn wait_for(
    events: &mut broadcast::Receiver<BoardEvent>,
    matches: impl Fn(&BoardEvent) -> bool,
) -> BoardEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("board events closed"),
            }
        }
    })
    .await
    .expect("board event in time")
}

async fn storage_with_deals(count: usize) -> (Storage, Vec<shared::domain::Stage>, Vec<DealId>) {
    let (storage, stages) = seeded_storage().await;
    let mut ids = Vec::new();
    for n in 0..count {
        let deal = storage
            .insert_deal(new_office_deal(&format!("Office {n}")))
            .await
            .expect("deal");
        ids.push(deal.id);
    }
    (storage, stages, ids)
}

fn card_ids(group: &StageGroup) -> Vec<DealId> {
    group.cards.iter().map(|card| card.id).collect()
}

#[tokio::test]
async fn mount_loads_active_columns() {
    let (storage, stages, ids) = storage_with_deals(3).await;
    let board = Board::mount(Arc::new(storage)).await.expect("mount");

    let columns = board.columns().await;
    assert_eq!(columns.len(), stages.len());
    assert_eq!(card_ids(&columns[0]), ids);
}

#[tokio::test]
async fn dropping_last_card_at_head_applies_and_persists() {
    let (storage, stages, ids) = storage_with_deals(3).await;
    let mut board = Board::mount(Arc::new(storage.clone())).await.expect("mount");
    let mut events = board.subscribe_events();

    board.pick_up(ids[2]).await.expect("pick up");
    board
        .hover(Some(DropTarget::new(stages[0].id, 0)))
        .expect("hover");
    let result = board.drop_card().await.expect("drop");
    assert_eq!(
        result,
        DropResult::Moved {
            card_id: ids[2],
            stage_id: stages[0].id,
            sort_order: 500.0,
            renormalized: 0,
        }
    );

    // Visible before the store has answered.
    assert_eq!(
        card_ids(&board.columns().await[0]),
        vec![ids[2], ids[0], ids[1]]
    );

    wait_for(&mut events, |event| {
        matches!(event, BoardEvent::WriteSettled { card_id } if *card_id == ids[2])
    })
    .await;
    wait_for(&mut events, |event| {
        matches!(event, BoardEvent::Synced { pending: 0, .. })
    })
    .await;

    let stored = storage
        .load_deal(ids[2])
        .await
        .expect("load")
        .expect("present");
    assert_eq!(stored.sort_order, 500.0);
    assert_eq!(
        card_ids(&board.columns().await[0]),
        vec![ids[2], ids[0], ids[1]]
    );
}

#[tokio::test]
async fn moving_to_another_stage_appends() {
    let (storage, stages, ids) = storage_with_deals(1).await;
    let board = Board::mount(Arc::new(storage.clone())).await.expect("mount");
    let mut events = board.subscribe_events();

    let result = board
        .move_card(ids[0], DropTarget::new(stages[3].id, 7))
        .await
        .expect("move");
    assert!(matches!(result, DropResult::Moved { sort_order, .. } if sort_order == 1000.0));

    wait_for(&mut events, |event| {
        matches!(event, BoardEvent::Synced { pending: 0, .. })
    })
    .await;
    let columns = board.columns().await;
    assert!(columns[0].cards.is_empty());
    assert_eq!(card_ids(&columns[3]), vec![ids[0]]);
}

#[tokio::test]
async fn dropping_onto_own_slot_writes_nothing() {
    let (storage, stages, ids) = storage_with_deals(3).await;
    let mut board = Board::mount(Arc::new(storage.clone())).await.expect("mount");
    let before = storage.last_sequence();

    board.pick_up(ids[1]).await.expect("pick up");
    let result = board.drop_card().await.expect("drop");
    assert_eq!(result, DropResult::Unchanged);

    board
        .move_card(ids[1], DropTarget::new(stages[0].id, 1))
        .await
        .expect("same slot");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(storage.last_sequence(), before);
    assert_eq!(board.mirror().lock().await.pending_count(), 0);
}

#[tokio::test]
async fn released_outside_is_cancelled() {
    let (storage, _, ids) = storage_with_deals(1).await;
    let mut board = Board::mount(Arc::new(storage)).await.expect("mount");

    board.pick_up(ids[0]).await.expect("pick up");
    board.hover(None).expect("hover");
    assert_eq!(board.drop_card().await.expect("drop"), DropResult::Cancelled);
    assert!(!board.drag().is_dragging());
}

#[tokio::test]
async fn unknown_or_inactive_stage_is_rejected() {
    let (storage, stages, ids) = storage_with_deals(1).await;
    storage
        .set_stage_active(stages[5].id, false)
        .await
        .expect("deactivate");
    let board = Board::mount(Arc::new(storage)).await.expect("mount");

    for stage_id in [stages[5].id, shared::domain::StageId::random()] {
        let err = board
            .move_card(ids[0], DropTarget::new(stage_id, 0))
            .await
            .expect_err("rejected");
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }
}

#[tokio::test]
async fn failed_persist_reports_and_restores_server_state() {
    let (storage, stages, ids) = storage_with_deals(2).await;
    let gateway = FlakyGateway::new(storage.clone());
    gateway.fail_writes(true);
    let board = Board::mount(gateway.clone()).await.expect("mount");
    let mut events = board.subscribe_events();

    board
        .move_card(ids[1], DropTarget::new(stages[2].id, 0))
        .await
        .expect("optimistic move");
    assert_eq!(card_ids(&board.columns().await[2]), vec![ids[1]]);

    let failed = wait_for(&mut events, |event| {
        matches!(event, BoardEvent::WriteFailed { .. })
    })
    .await;
    assert!(matches!(failed, BoardEvent::WriteFailed { card_id, .. } if card_id == ids[1]));

    wait_for(&mut events, |event| {
        matches!(event, BoardEvent::Synced { pending: 0, .. })
    })
    .await;
    let columns = board.columns().await;
    assert_eq!(card_ids(&columns[0]), ids);
    assert!(columns[2].cards.is_empty());
}

#[tokio::test]
async fn exhausted_stage_is_renormalized() {
    let (storage, stages) = seeded_storage().await;
    let mut crowded = Vec::new();
    for key in [1000.0000001, 1000.0000002] {
        let mut new_deal: NewDeal = new_office_deal("Crowded");
        new_deal.stage_id = Some(stages[1].id);
        new_deal.sort_order = Some(key);
        crowded.push(storage.insert_deal(new_deal).await.expect("deal").id);
    }
    let mover = storage
        .insert_deal(new_office_deal("Mover"))
        .await
        .expect("mover")
        .id;
    let board = Board::mount(Arc::new(storage.clone())).await.expect("mount");
    let mut events = board.subscribe_events();

    let result = board
        .move_card(mover, DropTarget::new(stages[1].id, 1))
        .await
        .expect("move");
    assert_eq!(
        result,
        DropResult::Moved {
            card_id: mover,
            stage_id: stages[1].id,
            sort_order: 1500.0,
            renormalized: 2,
        }
    );

    let mut settled = 0;
    while settled < 3 {
        wait_for(&mut events, |event| {
            matches!(event, BoardEvent::WriteSettled { .. })
        })
        .await;
        settled += 1;
    }

    let stored: Vec<_> = storage
        .list_deals()
        .await
        .expect("list")
        .into_iter()
        .filter(|deal| deal.stage_id == stages[1].id)
        .map(|deal| (deal.id, deal.sort_order))
        .collect();
    assert_eq!(
        stored,
        vec![(crowded[0], 1000.0), (mover, 1500.0), (crowded[1], 2000.0)]
    );
}

#[tokio::test]
async fn remote_writes_reach_the_mirror() {
    let (storage, stages, ids) = storage_with_deals(1).await;
    let board = Board::mount(Arc::new(storage.clone())).await.expect("mount");
    let mut events = board.subscribe_events();

    storage
        .update_deal(
            ids[0],
            &DealPatch::Move {
                stage_id: stages[4].id,
                sort_order: 1000.0,
            },
        )
        .await
        .expect("remote move");

    wait_for(&mut events, |event| matches!(event, BoardEvent::Synced { .. })).await;
    assert_eq!(card_ids(&board.columns().await[4]), vec![ids[0]]);
}

#[tokio::test]
async fn unmount_stops_watching() {
    let (storage, _, _) = storage_with_deals(0).await;
    let board = Board::mount(Arc::new(storage.clone())).await.expect("mount");
    let mut events = board.subscribe_events();
    board.unmount();

    storage
        .insert_deal(new_office_deal("After unmount"))
        .await
        .expect("insert");
    assert!(matches!(
        tokio::time::timeout(Duration::from_millis(100), events.recv()).await,
        Ok(Err(RecvError::Closed)) | Err(_)
    ));
}
