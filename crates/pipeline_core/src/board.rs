use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{DealId, StageId},
    error::{PipelineError, PipelineResult},
    protocol::{CollectionScope, DealPatch},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    drag::{DragError, DragOutcome, DragSessionController, DropTarget},
    gateway::DataGateway,
    mirror::{MirrorStore, Snapshot, StageGroup},
    ordering::compute_key_or_renormalize,
    reconciler::{sync_once, Fetched, ReconcileSink, ReconcilerHandle, SyncReconciler},
};

const BOARD_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    /// The mirror was replaced by a fetched snapshot.
    Synced { cards: usize, pending: usize },
    StagesChanged { stages: usize },
    WriteSettled { card_id: DealId },
    WriteFailed { card_id: DealId, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropResult {
    Cancelled,
    /// Dropped back onto its own slot; nothing written.
    Unchanged,
    Moved {
        card_id: DealId,
        stage_id: StageId,
        sort_order: f64,
        /// Siblings whose keys were rewritten to make room.
        renormalized: usize,
    },
}

struct MirrorSink {
    mirror: Arc<Mutex<MirrorStore>>,
    events: broadcast::Sender<BoardEvent>,
}

#[async_trait]
impl ReconcileSink for MirrorSink {
    async fn begin_fetch(&self, scope: CollectionScope) -> u64 {
        match scope {
            CollectionScope::Deals => self.mirror.lock().await.begin_batch(),
            _ => 0,
        }
    }

    async fn apply(&self, batch_seq: u64, fetched: Fetched) {
        let event = {
            let mut mirror = self.mirror.lock().await;
            match fetched {
                Fetched::Deals(cards) => {
                    mirror.reconcile(Snapshot { batch_seq, cards });
                    BoardEvent::Synced {
                        cards: mirror.cards().count(),
                        pending: mirror.pending_count(),
                    }
                }
                Fetched::Stages(stages) => {
                    mirror.replace_stages(stages);
                    BoardEvent::StagesChanged {
                        stages: mirror.stages().len(),
                    }
                }
                Fetched::Checklist(..) | Fetched::Activity(..) => return,
            }
        };
        let _ = self.events.send(event);
    }
}

/// A mounted pipeline board. Owns the mirror, the drag controller and the
/// watchers keeping the mirror in sync; unmounting releases all of them.
pub struct Board {
    gateway: Arc<dyn DataGateway>,
    mirror: Arc<Mutex<MirrorStore>>,
    sink: Arc<MirrorSink>,
    drag: DragSessionController,
    events: broadcast::Sender<BoardEvent>,
    watchers: Vec<ReconcilerHandle>,
}

impl Board {
    /// Loads stages and cards, then starts watching both collections.
    pub async fn mount(gateway: Arc<dyn DataGateway>) -> PipelineResult<Self> {
        let mirror = Arc::new(Mutex::new(MirrorStore::new()));
        let (events, _) = broadcast::channel(BOARD_EVENT_BUFFER);
        let sink = Arc::new(MirrorSink {
            mirror: Arc::clone(&mirror),
            events: events.clone(),
        });

        let mut watchers = Vec::with_capacity(2);
        for scope in [CollectionScope::Stages, CollectionScope::Deals] {
            let sink: Arc<dyn ReconcileSink> = sink.clone();
            watchers.push(SyncReconciler::spawn(Arc::clone(&gateway), scope, sink).await?);
        }

        let stages = gateway.fetch_stages().await?;
        let batch_seq = mirror.lock().await.begin_batch();
        let cards = gateway.fetch_cards().await?;
        {
            let mut mirror = mirror.lock().await;
            mirror.replace_stages(stages);
            mirror.reconcile(Snapshot { batch_seq, cards });
            info!(
                stages = mirror.stages().len(),
                cards = mirror.cards().count(),
                "board mounted"
            );
        }

        Ok(Self {
            gateway,
            mirror,
            sink,
            drag: DragSessionController::new(),
            events,
            watchers,
        })
    }

    pub fn unmount(self) {
        debug!(watchers = self.watchers.len(), "board unmounted");
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    pub fn mirror(&self) -> Arc<Mutex<MirrorStore>> {
        Arc::clone(&self.mirror)
    }

    pub async fn columns(&self) -> Vec<StageGroup> {
        self.mirror.lock().await.group_by_stage()
    }

    /// Re-reads every card now instead of waiting for a notification.
    pub async fn resync(&self) {
        sync_once(self.gateway.as_ref(), CollectionScope::Deals, self.sink.as_ref()).await;
    }

    pub async fn pick_up(&mut self, card_id: DealId) -> PipelineResult<()> {
        let source = {
            let mirror = self.mirror.lock().await;
            let card = mirror
                .card(card_id)
                .ok_or_else(|| PipelineError::not_found("deal", card_id))?;
            let index = mirror
                .siblings(card.stage_id, None)
                .iter()
                .position(|sibling| sibling.id == card_id)
                .unwrap_or_default();
            DropTarget::new(card.stage_id, index)
        };
        self.drag
            .pick_up(card_id, source.stage_id, source.index)
            .map_err(|err| PipelineError::validation(err.to_string()))
    }

    pub fn hover(&mut self, target: Option<DropTarget>) -> Result<(), DragError> {
        self.drag.hover(target)
    }

    pub fn cancel_drag(&mut self) {
        self.drag.cancel();
    }

    pub fn drag(&self) -> &DragSessionController {
        &self.drag
    }

    /// Releases the current drag. A valid drop is applied to the mirror
    /// before this returns; persisting happens in the background.
    pub async fn drop_card(&mut self) -> PipelineResult<DropResult> {
        match self.drag.drop() {
            DragOutcome::Cancelled => Ok(DropResult::Cancelled),
            DragOutcome::Dropped {
                card_id, target, ..
            } => self.move_card(card_id, target).await,
        }
    }

    /// Moves a card to `target` optimistically and persists in the
    /// background.
    pub async fn move_card(&self, card_id: DealId, target: DropTarget) -> PipelineResult<DropResult> {
        let (writes, result) = {
            let mut mirror = self.mirror.lock().await;
            let card = mirror
                .card(card_id)
                .cloned()
                .ok_or_else(|| PipelineError::not_found("deal", card_id))?;
            if mirror
                .stage(target.stage_id)
                .filter(|stage| stage.is_active)
                .is_none()
            {
                return Err(PipelineError::not_found("stage", target.stage_id));
            }

            let siblings: Vec<(DealId, f64)> = mirror
                .siblings(target.stage_id, Some(card_id))
                .into_iter()
                .map(|sibling| (sibling.id, sibling.sort_order))
                .collect();
            let index = target.index.min(siblings.len());

            if card.stage_id == target.stage_id {
                let current = mirror
                    .siblings(card.stage_id, None)
                    .iter()
                    .position(|sibling| sibling.id == card_id);
                if current == Some(index) {
                    debug!(card_id = %card_id, "drop onto own slot ignored");
                    return Ok(DropResult::Unchanged);
                }
            }

            let keys: Vec<f64> = siblings.iter().map(|(_, key)| *key).collect();
            let placement = compute_key_or_renormalize(&keys, index)?;

            let mut writes = Vec::new();
            if let Some(renormalized) = &placement.renormalized {
                for ((sibling_id, old_key), new_key) in siblings.iter().zip(renormalized) {
                    if old_key != new_key {
                        mirror.apply_optimistic_move(*sibling_id, target.stage_id, *new_key);
                        writes.push((*sibling_id, *new_key));
                    }
                }
            }
            mirror.apply_optimistic_move(card_id, target.stage_id, placement.key);
            writes.push((card_id, placement.key));

            let result = DropResult::Moved {
                card_id,
                stage_id: target.stage_id,
                sort_order: placement.key,
                renormalized: writes.len() - 1,
            };
            (writes, result)
        };

        info!(
            card_id = %card_id,
            stage_id = %target.stage_id,
            writes = writes.len(),
            "card moved"
        );
        self.spawn_persist(target.stage_id, writes);
        Ok(result)
    }

    fn spawn_persist(&self, stage_id: StageId, writes: Vec<(DealId, f64)>) {
        let gateway = Arc::clone(&self.gateway);
        let mirror = Arc::clone(&self.mirror);
        let sink = Arc::clone(&self.sink);
        let events = self.events.clone();

        tokio::spawn(async move {
            for (card_id, sort_order) in writes {
                let outcome = gateway
                    .update_card(
                        card_id,
                        DealPatch::Move {
                            stage_id,
                            sort_order,
                        },
                    )
                    .await;
                mirror.lock().await.settle_write(card_id);
                let event = match outcome {
                    Ok(()) => BoardEvent::WriteSettled { card_id },
                    Err(err) => {
                        warn!(card_id = %card_id, error = %err, "persisting card move failed");
                        BoardEvent::WriteFailed {
                            card_id,
                            message: err.to_string(),
                        }
                    }
                };
                let _ = events.send(event);
            }

            // Every marker is settled now, so this fetch replaces the
            // optimistic values with whatever the store accepted.
            sync_once(gateway.as_ref(), CollectionScope::Deals, sink.as_ref()).await;
        });
    }
}

#[cfg(test)]
#[path = "tests/board_tests.rs"]
mod tests;
