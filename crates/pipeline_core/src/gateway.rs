use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{ActivityEntry, ChecklistItem, ChecklistItemId, Deal, DealId, Stage},
    error::{PipelineError, PipelineResult},
    protocol::{
        ChangeKind, ChangeNotification, ChecklistPatch, CollectionScope, DealPatch, NewActivity,
        NewChecklistItem, NewDeal,
    },
};
use storage::Storage;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

/// Everything the pipeline core needs from the store of record.
#[async_trait]
pub trait DataGateway: Send + Sync {
    /// Stages ordered by display order.
    async fn fetch_stages(&self) -> PipelineResult<Vec<Stage>>;
    /// All cards ordered by sort key, then id.
    async fn fetch_cards(&self) -> PipelineResult<Vec<Deal>>;
    async fn fetch_card(&self, card_id: DealId) -> PipelineResult<Deal>;
    async fn update_card(&self, card_id: DealId, patch: DealPatch) -> PipelineResult<()>;
    async fn insert_card(&self, new_deal: NewDeal) -> PipelineResult<Deal>;
    async fn fetch_checklist(&self, deal_id: DealId) -> PipelineResult<Vec<ChecklistItem>>;
    async fn insert_checklist_item(&self, item: NewChecklistItem) -> PipelineResult<ChecklistItem>;
    async fn update_checklist_item(
        &self,
        item_id: ChecklistItemId,
        patch: ChecklistPatch,
    ) -> PipelineResult<()>;
    /// Entries newest first.
    async fn fetch_activity(&self, deal_id: DealId) -> PipelineResult<Vec<ActivityEntry>>;
    async fn insert_activity(&self, activity: NewActivity) -> PipelineResult<ActivityEntry>;
    async fn subscribe(&self, scope: CollectionScope) -> PipelineResult<Subscription>;
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Change notifications for one collection. Dropping it releases the
/// underlying channel and any reader task feeding it.
pub struct Subscription {
    scope: CollectionScope,
    stream: BroadcastStream<ChangeNotification>,
    last_sequence: u64,
    _reader: Option<AbortOnDrop>,
}

impl Subscription {
    pub fn new(scope: CollectionScope, rx: broadcast::Receiver<ChangeNotification>) -> Self {
        Self {
            scope,
            stream: BroadcastStream::new(rx),
            last_sequence: 0,
            _reader: None,
        }
    }

    /// Ties the lifetime of `reader` to this subscription.
    pub fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self._reader = Some(AbortOnDrop(reader));
        self
    }

    pub fn scope(&self) -> CollectionScope {
        self.scope
    }

    /// Next notification for this scope, or `None` once the source is gone.
    /// A lagged receiver yields a synthetic bulk change so the caller
    /// re-fetches instead of silently missing writes.
    pub async fn next(&mut self) -> Option<ChangeNotification> {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(notification) if notification.matches(&self.scope) => {
                    self.last_sequence = notification.sequence;
                    return Some(notification);
                }
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(scope = ?self.scope, skipped, "change subscription lagged");
                    return Some(ChangeNotification {
                        scope: self.scope,
                        kind: ChangeKind::Bulk,
                        entity_id: None,
                        sequence: self.last_sequence,
                    });
                }
            }
        }
        None
    }

    pub fn unsubscribe(self) {}
}

fn classify(err: anyhow::Error, fallback: fn(String) -> PipelineError) -> PipelineError {
    match err.downcast::<PipelineError>() {
        Ok(known) => known,
        Err(other) => fallback(format!("{other:#}")),
    }
}

#[async_trait]
impl DataGateway for Storage {
    async fn fetch_stages(&self) -> PipelineResult<Vec<Stage>> {
        self.list_stages()
            .await
            .map_err(|err| classify(err, PipelineError::Fetch))
    }

    async fn fetch_cards(&self) -> PipelineResult<Vec<Deal>> {
        self.list_deals()
            .await
            .map_err(|err| classify(err, PipelineError::Fetch))
    }

    async fn fetch_card(&self, card_id: DealId) -> PipelineResult<Deal> {
        self.load_deal(card_id)
            .await
            .map_err(|err| classify(err, PipelineError::Fetch))?
            .ok_or_else(|| PipelineError::not_found("deal", card_id))
    }

    async fn update_card(&self, card_id: DealId, patch: DealPatch) -> PipelineResult<()> {
        self.update_deal(card_id, &patch)
            .await
            .map_err(|err| classify(err, PipelineError::Write))
    }

    async fn insert_card(&self, new_deal: NewDeal) -> PipelineResult<Deal> {
        self.insert_deal(new_deal)
            .await
            .map_err(|err| classify(err, PipelineError::Write))
    }

    async fn fetch_checklist(&self, deal_id: DealId) -> PipelineResult<Vec<ChecklistItem>> {
        self.list_checklist(deal_id)
            .await
            .map_err(|err| classify(err, PipelineError::Fetch))
    }

    async fn insert_checklist_item(&self, item: NewChecklistItem) -> PipelineResult<ChecklistItem> {
        Storage::insert_checklist_item(self, item)
            .await
            .map_err(|err| classify(err, PipelineError::Write))
    }

    async fn update_checklist_item(
        &self,
        item_id: ChecklistItemId,
        patch: ChecklistPatch,
    ) -> PipelineResult<()> {
        Storage::update_checklist_item(self, item_id, &patch)
            .await
            .map_err(|err| classify(err, PipelineError::Write))
    }

    async fn fetch_activity(&self, deal_id: DealId) -> PipelineResult<Vec<ActivityEntry>> {
        self.list_activity(deal_id)
            .await
            .map_err(|err| classify(err, PipelineError::Fetch))
    }

    async fn insert_activity(&self, activity: NewActivity) -> PipelineResult<ActivityEntry> {
        Storage::insert_activity(self, activity)
            .await
            .map_err(|err| classify(err, PipelineError::Write))
    }

    async fn subscribe(&self, scope: CollectionScope) -> PipelineResult<Subscription> {
        Ok(Subscription::new(scope, self.subscribe_changes()))
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
