use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ActivityEntry, ActivityKind, DealId, UserId},
    error::PipelineResult,
    protocol::{CollectionScope, NewActivity},
};
use tokio::sync::Mutex;

use crate::{
    gateway::DataGateway,
    reconciler::{Fetched, ReconcileSink, ReconcilerHandle, SyncReconciler},
};

/// Comment and event history of one deal, newest first.
pub struct ActivityFeed {
    gateway: Arc<dyn DataGateway>,
    deal_id: DealId,
    entries: Vec<ActivityEntry>,
}

impl ActivityFeed {
    pub async fn load(gateway: Arc<dyn DataGateway>, deal_id: DealId) -> PipelineResult<Self> {
        let entries = gateway.fetch_activity(deal_id).await?;
        let mut feed = Self {
            gateway,
            deal_id,
            entries: Vec::new(),
        };
        feed.apply(entries);
        Ok(feed)
    }

    pub async fn watch(feed: &Arc<Mutex<ActivityFeed>>) -> PipelineResult<ReconcilerHandle> {
        let (gateway, deal_id) = {
            let feed = feed.lock().await;
            (Arc::clone(&feed.gateway), feed.deal_id)
        };
        let sink: Arc<dyn ReconcileSink> = feed.clone();
        SyncReconciler::spawn(gateway, CollectionScope::Activity(deal_id), sink).await
    }

    pub fn deal_id(&self) -> DealId {
        self.deal_id
    }

    pub fn entries(&self) -> &[ActivityEntry] {
        &self.entries
    }

    pub fn apply(&mut self, mut entries: Vec<ActivityEntry>) {
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        self.entries = entries;
    }

    pub async fn post(
        &mut self,
        author: UserId,
        kind: ActivityKind,
        content: &str,
    ) -> PipelineResult<ActivityEntry> {
        let activity = NewActivity {
            deal_id: self.deal_id,
            user_id: author,
            content: content.trim().to_string(),
            kind,
        };
        activity.validate()?;

        let entry = self.gateway.insert_activity(activity).await?;
        let mut entries = std::mem::take(&mut self.entries);
        entries.push(entry.clone());
        self.apply(entries);
        Ok(entry)
    }
}

#[async_trait]
impl ReconcileSink for Mutex<ActivityFeed> {
    async fn apply(&self, _batch_seq: u64, fetched: Fetched) {
        if let Fetched::Activity(deal_id, entries) = fetched {
            let mut feed = self.lock().await;
            if feed.deal_id == deal_id {
                feed.apply(entries);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/activity_tests.rs"]
mod tests;
