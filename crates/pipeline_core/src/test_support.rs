use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{
        ActivityEntry, ChecklistItem, ChecklistItemId, Deal, DealDetails, DealId, Stage, StageId,
    },
    error::{PipelineError, PipelineResult},
    protocol::{
        ChecklistPatch, CollectionScope, DealPatch, NewActivity, NewChecklistItem, NewDeal,
    },
};
use storage::Storage;

use crate::gateway::{DataGateway, Subscription};

pub fn stage(name: &str, display_order: i32) -> Stage {
    Stage {
        id: StageId::random(),
        name: name.to_string(),
        display_order,
        is_active: true,
    }
}

pub fn card(stage_id: StageId, sort_order: f64) -> Deal {
    let now = Utc::now();
    Deal {
        id: DealId::random(),
        stage_id,
        sort_order,
        details: DealDetails::for_office("Test Office", now),
        created_at: now,
        updated_at: now,
    }
}

pub fn new_office_deal(office: &str) -> NewDeal {
    NewDeal {
        stage_id: None,
        sort_order: None,
        details: DealDetails::for_office(office, Utc::now()),
    }
}

pub async fn seeded_storage() -> (Storage, Vec<Stage>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let stages = storage.seed_default_stages().await.expect("seed stages");
    (storage, stages)
}

/// Storage-backed gateway whose card writes can be switched to fail.
pub struct FlakyGateway {
    inner: Storage,
    fail_writes: AtomicBool,
}

impl FlakyGateway {
    pub fn new(inner: Storage) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataGateway for FlakyGateway {
    async fn fetch_stages(&self) -> PipelineResult<Vec<Stage>> {
        self.inner.fetch_stages().await
    }

    async fn fetch_cards(&self) -> PipelineResult<Vec<Deal>> {
        self.inner.fetch_cards().await
    }

    async fn fetch_card(&self, card_id: DealId) -> PipelineResult<Deal> {
        self.inner.fetch_card(card_id).await
    }

    async fn update_card(&self, card_id: DealId, patch: DealPatch) -> PipelineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PipelineError::Write("connection reset".into()));
        }
        DataGateway::update_card(&self.inner, card_id, patch).await
    }

    async fn insert_card(&self, new_deal: NewDeal) -> PipelineResult<Deal> {
        self.inner.insert_card(new_deal).await
    }

    async fn fetch_checklist(&self, deal_id: DealId) -> PipelineResult<Vec<ChecklistItem>> {
        self.inner.fetch_checklist(deal_id).await
    }

    async fn insert_checklist_item(&self, item: NewChecklistItem) -> PipelineResult<ChecklistItem> {
        DataGateway::insert_checklist_item(&self.inner, item).await
    }

    async fn update_checklist_item(
        &self,
        item_id: ChecklistItemId,
        patch: ChecklistPatch,
    ) -> PipelineResult<()> {
        DataGateway::update_checklist_item(&self.inner, item_id, patch).await
    }

    async fn fetch_activity(&self, deal_id: DealId) -> PipelineResult<Vec<ActivityEntry>> {
        self.inner.fetch_activity(deal_id).await
    }

    async fn insert_activity(&self, activity: NewActivity) -> PipelineResult<ActivityEntry> {
        DataGateway::insert_activity(&self.inner, activity).await
    }

    async fn subscribe(&self, scope: CollectionScope) -> PipelineResult<Subscription> {
        self.inner.subscribe(scope).await
    }
}
