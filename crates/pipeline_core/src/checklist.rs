use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ChecklistItem, ChecklistItemId, DealId},
    error::{PipelineError, PipelineResult},
    protocol::{ChecklistPatch, CollectionScope, NewChecklistItem},
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    gateway::DataGateway,
    reconciler::{Fetched, ReconcileSink, ReconcilerHandle, SyncReconciler},
};

/// A milestone every deal starts with. Shown without being stored until
/// someone toggles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecklistTemplate {
    pub key: &'static str,
    pub title: &'static str,
}

pub const CHECKLIST_TEMPLATES: [ChecklistTemplate; 9] = [
    ChecklistTemplate { key: "nda_signed", title: "NDA Signed" },
    ChecklistTemplate { key: "document_requests", title: "Document Requests" },
    ChecklistTemplate { key: "qualification_determined", title: "Qualification Determined" },
    ChecklistTemplate { key: "pro_forma_models", title: "Pro Forma Models Completed" },
    ChecklistTemplate { key: "partner_introductions", title: "Partner Introductions" },
    ChecklistTemplate { key: "loi_sent", title: "LOI Sent" },
    ChecklistTemplate { key: "employment_agreement_sent", title: "Employment Agreement Sent" },
    ChecklistTemplate { key: "purchase_agreement_sent", title: "Purchase Agreement Sent" },
    ChecklistTemplate { key: "due_diligence_sent", title: "Due Diligence Sent" },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecklistEntry {
    Template {
        template: ChecklistTemplate,
        display_order: i32,
    },
    Stored(ChecklistItem),
}

/// Identifies an entry across reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecklistKey {
    Template(&'static str),
    Item(ChecklistItemId),
}

impl ChecklistEntry {
    pub fn key(&self) -> ChecklistKey {
        match self {
            ChecklistEntry::Template { template, .. } => ChecklistKey::Template(template.key),
            ChecklistEntry::Stored(item) => ChecklistKey::Item(item.id),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            ChecklistEntry::Template { template, .. } => template.title,
            ChecklistEntry::Stored(item) => &item.title,
        }
    }

    pub fn completed(&self) -> bool {
        match self {
            ChecklistEntry::Template { .. } => false,
            ChecklistEntry::Stored(item) => item.completed,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, ChecklistEntry::Stored(item) if item.is_custom)
    }

    pub fn display_order(&self) -> i32 {
        match self {
            ChecklistEntry::Template { display_order, .. } => *display_order,
            ChecklistEntry::Stored(item) => item.display_order,
        }
    }
}

/// Overlays stored items on the fixed templates: templates first in their
/// fixed order, then custom items by display order.
pub fn merge_with_templates(items: Vec<ChecklistItem>) -> Vec<ChecklistEntry> {
    let (mut from_templates, mut custom): (Vec<_>, Vec<_>) =
        items.into_iter().partition(|item| {
            !item.is_custom
                && item
                    .template_key
                    .as_deref()
                    .is_some_and(|key| CHECKLIST_TEMPLATES.iter().any(|t| t.key == key))
        });

    let mut entries = Vec::with_capacity(CHECKLIST_TEMPLATES.len() + custom.len());
    for (position, template) in CHECKLIST_TEMPLATES.iter().enumerate() {
        let stored = from_templates
            .iter()
            .position(|item| item.template_key.as_deref() == Some(template.key))
            .map(|found| from_templates.swap_remove(found));
        entries.push(match stored {
            Some(item) => ChecklistEntry::Stored(item),
            None => ChecklistEntry::Template {
                template: *template,
                display_order: position as i32 + 1,
            },
        });
    }

    custom.sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.id.cmp(&b.id)));
    entries.extend(custom.into_iter().map(ChecklistEntry::Stored));
    entries
}

/// The checklist of one deal.
pub struct ChecklistView {
    gateway: Arc<dyn DataGateway>,
    deal_id: DealId,
    entries: Vec<ChecklistEntry>,
}

impl ChecklistView {
    pub async fn load(gateway: Arc<dyn DataGateway>, deal_id: DealId) -> PipelineResult<Self> {
        let items = gateway.fetch_checklist(deal_id).await?;
        Ok(Self {
            gateway,
            deal_id,
            entries: merge_with_templates(items),
        })
    }

    /// Keeps `view` current with changes from other clients.
    pub async fn watch(view: &Arc<Mutex<ChecklistView>>) -> PipelineResult<ReconcilerHandle> {
        let (gateway, deal_id) = {
            let view = view.lock().await;
            (Arc::clone(&view.gateway), view.deal_id)
        };
        let sink: Arc<dyn ReconcileSink> = view.clone();
        SyncReconciler::spawn(gateway, CollectionScope::Checklist(deal_id), sink).await
    }

    pub fn deal_id(&self) -> DealId {
        self.deal_id
    }

    pub fn entries(&self) -> &[ChecklistEntry] {
        &self.entries
    }

    pub fn completed_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.completed()).count()
    }

    pub fn apply(&mut self, items: Vec<ChecklistItem>) {
        self.entries = merge_with_templates(items);
    }

    /// Marks an entry done or not done. A template entry is stored as a
    /// customized row for this deal the first time it is toggled.
    pub async fn toggle(&mut self, key: ChecklistKey, completed: bool) -> PipelineResult<()> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.key() == key)
            .ok_or_else(|| PipelineError::not_found("checklist entry", format!("{key:?}")))?;

        match &mut self.entries[position] {
            ChecklistEntry::Template {
                template,
                display_order,
            } => {
                let item = self
                    .gateway
                    .insert_checklist_item(NewChecklistItem {
                        deal_id: self.deal_id,
                        title: template.title.to_string(),
                        completed,
                        is_custom: false,
                        display_order: *display_order,
                        template_key: Some(template.key.to_string()),
                    })
                    .await?;
                debug!(deal_id = %self.deal_id, template = template.key, "template milestone stored");
                self.entries[position] = ChecklistEntry::Stored(item);
            }
            ChecklistEntry::Stored(item) => {
                self.gateway
                    .update_checklist_item(item.id, ChecklistPatch::SetCompleted { completed })
                    .await?;
                item.completed = completed;
                item.completed_at = completed.then(Utc::now);
            }
        }
        Ok(())
    }

    /// Adds a deal-specific item after everything already listed.
    pub async fn add_custom(&mut self, title: &str) -> PipelineResult<ChecklistItem> {
        let title = title.trim();
        if title.is_empty() {
            return Err(PipelineError::validation("checklist item title cannot be empty"));
        }
        let display_order = self
            .entries
            .iter()
            .map(ChecklistEntry::display_order)
            .max()
            .unwrap_or(0)
            + 1;

        let item = self
            .gateway
            .insert_checklist_item(NewChecklistItem {
                deal_id: self.deal_id,
                title: title.to_string(),
                completed: false,
                is_custom: true,
                display_order,
                template_key: None,
            })
            .await?;
        self.entries.push(ChecklistEntry::Stored(item.clone()));
        Ok(item)
    }
}

#[async_trait]
impl ReconcileSink for Mutex<ChecklistView> {
    async fn apply(&self, _batch_seq: u64, fetched: Fetched) {
        if let Fetched::Checklist(deal_id, items) = fetched {
            let mut view = self.lock().await;
            if view.deal_id == deal_id {
                view.apply(items);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/checklist_tests.rs"]
mod tests;
