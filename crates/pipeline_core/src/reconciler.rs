use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ActivityEntry, ChecklistItem, Deal, DealId, Stage},
    error::{PipelineError, PipelineResult},
    protocol::CollectionScope,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::gateway::DataGateway;

/// A collection re-read from the gateway in full.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Stages(Vec<Stage>),
    Deals(Vec<Deal>),
    Checklist(DealId, Vec<ChecklistItem>),
    Activity(DealId, Vec<ActivityEntry>),
}

/// Receives fetched collections. `begin_fetch` runs right before the fetch
/// is issued and its value is handed back with the result.
#[async_trait]
pub trait ReconcileSink: Send + Sync {
    async fn begin_fetch(&self, _scope: CollectionScope) -> u64 {
        0
    }

    async fn apply(&self, batch_seq: u64, fetched: Fetched);
}

/// Watches one collection and re-fetches it on every change notification.
pub struct SyncReconciler;

impl SyncReconciler {
    /// Subscribes before returning, so no notification committed after this
    /// call is missed.
    pub async fn spawn(
        gateway: Arc<dyn DataGateway>,
        scope: CollectionScope,
        sink: Arc<dyn ReconcileSink>,
    ) -> PipelineResult<ReconcilerHandle> {
        if scope == CollectionScope::All {
            return Err(PipelineError::validation("watchers need a concrete collection scope"));
        }
        let mut subscription = gateway.subscribe(scope).await?;
        let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = subscription.next() => match notification {
                        Some(notification) => debug!(
                            ?scope,
                            kind = ?notification.kind,
                            sequence = notification.sequence,
                            "change notification received"
                        ),
                        None => {
                            warn!(?scope, "change stream ended; watcher stopped");
                            break;
                        }
                    },
                    request = refresh_rx.recv() => {
                        if request.is_none() {
                            break;
                        }
                    }
                }
                sync_once(gateway.as_ref(), scope, sink.as_ref()).await;
            }
            debug!(?scope, "reconciler stopped");
        });

        Ok(ReconcilerHandle {
            scope,
            task,
            refresh: refresh_tx,
        })
    }
}

/// Fetches `scope` once and hands the result to `sink`. Errors are logged and
/// the sink keeps its last-known-good state.
pub async fn sync_once(gateway: &dyn DataGateway, scope: CollectionScope, sink: &dyn ReconcileSink) {
    let batch_seq = sink.begin_fetch(scope).await;
    let fetched = match scope {
        CollectionScope::Stages => gateway.fetch_stages().await.map(Fetched::Stages),
        CollectionScope::Deals => gateway.fetch_cards().await.map(Fetched::Deals),
        CollectionScope::Checklist(deal_id) => gateway
            .fetch_checklist(deal_id)
            .await
            .map(|items| Fetched::Checklist(deal_id, items)),
        CollectionScope::Activity(deal_id) => gateway
            .fetch_activity(deal_id)
            .await
            .map(|entries| Fetched::Activity(deal_id, entries)),
        CollectionScope::All => {
            debug!("wildcard scope has nothing to fetch");
            return;
        }
    };
    match fetched {
        Ok(fetched) => sink.apply(batch_seq, fetched).await,
        Err(err) => warn!(?scope, error = %err, "refetch failed; keeping last known state"),
    }
}

/// Live subscription for one scope. Dropping it stops the watcher.
pub struct ReconcilerHandle {
    scope: CollectionScope,
    task: JoinHandle<()>,
    refresh: mpsc::Sender<()>,
}

impl ReconcilerHandle {
    pub fn scope(&self) -> CollectionScope {
        self.scope
    }

    /// False once the watcher has stopped, either because its change
    /// stream ended or because it was aborted.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Queues one fetch without waiting for a notification. A refresh that
    /// is already queued absorbs this one. Returns false when the watcher
    /// is gone and nothing will be fetched.
    pub fn refresh(&self) -> bool {
        match self.refresh.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!(scope = ?self.scope, "refresh requested on a stopped watcher");
                false
            }
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
