use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{ActivityKind, Deal, DealDetails, DealId, DealStatus, StageId, UserId},
    error::{PipelineError, PipelineResult},
};

/// Collections a client can subscribe to. Checklist and activity feeds are
/// scoped to one deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "collection", content = "deal_id", rename_all = "snake_case")]
pub enum CollectionScope {
    Stages,
    Deals,
    Checklist(DealId),
    Activity(DealId),
    /// Every collection. Only carried by resync notices; it names nothing
    /// that can be fetched.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Bulk,
}

/// One committed write, as announced by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub scope: CollectionScope,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    /// Monotonic per store instance.
    pub sequence: u64,
}

impl ChangeNotification {
    /// Tells every subscriber to refetch because notifications up to
    /// `sequence` may have been dropped on the way.
    pub fn resync(sequence: u64) -> Self {
        Self {
            scope: CollectionScope::All,
            kind: ChangeKind::Bulk,
            entity_id: None,
            sequence,
        }
    }

    pub fn matches(&self, scope: &CollectionScope) -> bool {
        self.scope == CollectionScope::All || self.scope == *scope
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<f64>,
    pub details: DealDetails,
}

impl NewDeal {
    pub fn validate(&self) -> PipelineResult<()> {
        validate_title(&self.details.title)?;
        validate_deal_value(self.details.deal_value)?;
        if let Some(sort_order) = self.sort_order {
            validate_sort_order(sort_order)?;
        }
        Ok(())
    }
}

/// The closed set of deal updates a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DealPatch {
    Move {
        stage_id: StageId,
        sort_order: f64,
    },
    Rename {
        title: String,
    },
    SetValue {
        deal_value: f64,
    },
    SetStatus {
        status: DealStatus,
    },
    SetLocation {
        office_name: Option<String>,
        address: Option<String>,
        city: Option<String>,
        state: Option<String>,
    },
    SetDueDate {
        due_date: DateTime<Utc>,
    },
}

impl DealPatch {
    pub fn validate(&self) -> PipelineResult<()> {
        match self {
            DealPatch::Move { sort_order, .. } => validate_sort_order(*sort_order),
            DealPatch::Rename { title } => validate_title(title),
            DealPatch::SetValue { deal_value } => validate_deal_value(*deal_value),
            DealPatch::SetStatus { .. }
            | DealPatch::SetLocation { .. }
            | DealPatch::SetDueDate { .. } => Ok(()),
        }
    }

    pub fn apply_to(&self, deal: &mut Deal) {
        match self {
            DealPatch::Move {
                stage_id,
                sort_order,
            } => {
                deal.stage_id = *stage_id;
                deal.sort_order = *sort_order;
            }
            DealPatch::Rename { title } => deal.details.title = title.trim().to_string(),
            DealPatch::SetValue { deal_value } => deal.details.deal_value = *deal_value,
            DealPatch::SetStatus { status } => deal.details.status = *status,
            DealPatch::SetLocation {
                office_name,
                address,
                city,
                state,
            } => {
                deal.details.office_name = office_name.clone();
                deal.details.address = address.clone();
                deal.details.city = city.clone();
                deal.details.state = state.clone();
            }
            DealPatch::SetDueDate { due_date } => deal.details.due_date = *due_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChecklistItem {
    pub deal_id: DealId,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    pub is_custom: bool,
    pub display_order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_key: Option<String>,
}

impl NewChecklistItem {
    pub fn validate(&self) -> PipelineResult<()> {
        validate_title(&self.title)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChecklistPatch {
    SetCompleted { completed: bool },
    Rename { title: String },
}

impl ChecklistPatch {
    pub fn validate(&self) -> PipelineResult<()> {
        match self {
            ChecklistPatch::SetCompleted { .. } => Ok(()),
            ChecklistPatch::Rename { title } => validate_title(title),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewActivity {
    pub deal_id: DealId,
    pub user_id: UserId,
    pub content: String,
    pub kind: ActivityKind,
}

impl NewActivity {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.content.trim().is_empty() {
            return Err(PipelineError::validation("activity content cannot be empty"));
        }
        Ok(())
    }
}

fn validate_title(title: &str) -> PipelineResult<()> {
    if title.trim().is_empty() {
        return Err(PipelineError::validation("title cannot be empty"));
    }
    Ok(())
}

fn validate_deal_value(deal_value: f64) -> PipelineResult<()> {
    if !deal_value.is_finite() || deal_value < 0.0 {
        return Err(PipelineError::validation(format!(
            "deal value must be a non-negative number, got {deal_value}"
        )));
    }
    Ok(())
}

fn validate_sort_order(sort_order: f64) -> PipelineResult<()> {
    if !sort_order.is_finite() {
        return Err(PipelineError::validation(format!(
            "sort order must be finite, got {sort_order}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deal_patch_uses_op_tag_on_the_wire() {
        let stage_id = StageId::random();
        let patch = DealPatch::Move {
            stage_id,
            sort_order: 1500.0,
        };
        let json = serde_json::to_value(&patch).expect("json");
        assert_eq!(json["op"], "move");
        assert_eq!(json["sort_order"], 1500.0);
    }

    #[test]
    fn unknown_patch_fields_are_rejected() {
        let raw = serde_json::json!({ "op": "set_colour", "colour": "red" });
        assert!(serde_json::from_value::<DealPatch>(raw).is_err());
    }

    #[test]
    fn patch_validation_rejects_bad_values() {
        assert!(DealPatch::Rename {
            title: "   ".into()
        }
        .validate()
        .is_err());
        assert!(DealPatch::SetValue { deal_value: -1.0 }.validate().is_err());
        assert!(DealPatch::Move {
            stage_id: StageId::random(),
            sort_order: f64::NAN,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn scoped_notifications_only_match_their_deal() {
        let deal = DealId::random();
        let note = ChangeNotification {
            scope: CollectionScope::Activity(deal),
            kind: ChangeKind::Insert,
            entity_id: None,
            sequence: 7,
        };
        assert!(note.matches(&CollectionScope::Activity(deal)));
        assert!(!note.matches(&CollectionScope::Activity(DealId::random())));
        assert!(!note.matches(&CollectionScope::Deals));
    }

    #[test]
    fn resync_notice_matches_every_scope() {
        let note = ChangeNotification::resync(42);
        assert_eq!(note.kind, ChangeKind::Bulk);
        assert!(note.matches(&CollectionScope::Deals));
        assert!(note.matches(&CollectionScope::Stages));
        assert!(note.matches(&CollectionScope::Checklist(DealId::random())));

        let json = serde_json::to_value(&note).expect("json");
        assert_eq!(json["scope"]["collection"], "all");
        let back: ChangeNotification = serde_json::from_value(json).expect("decode");
        assert_eq!(back, note);
    }

    #[test]
    fn blank_activity_is_invalid() {
        let activity = NewActivity {
            deal_id: DealId::random(),
            user_id: UserId::random(),
            content: "  \n".into(),
            kind: ActivityKind::Comment,
        };
        assert!(matches!(
            activity.validate(),
            Err(PipelineError::Validation(_))
        ));
    }
}
