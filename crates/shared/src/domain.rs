use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_newtype!(DealId);
id_newtype!(StageId);
id_newtype!(ChecklistItemId);
id_newtype!(ActivityId);
id_newtype!(UserId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    #[default]
    Active,
    Pending,
    Completed,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Active => "active",
            DealStatus::Pending => "pending",
            DealStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(DealStatus::Active),
            "pending" => Some(DealStatus::Pending),
            "completed" => Some(DealStatus::Completed),
            _ => None,
        }
    }
}

/// Business attributes of a deal. The ordering logic never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealDetails {
    pub title: String,
    pub company_name: String,
    pub deal_value: f64,
    pub due_date: DateTime<Utc>,
    #[serde(default)]
    pub status: DealStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub office_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Remaining practice attributes (EBITDA, lease terms, seller contact...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DealDetails {
    pub fn for_office(office_name: &str, due_date: DateTime<Utc>) -> Self {
        Self {
            title: format!("{office_name} Deal"),
            company_name: office_name.to_string(),
            deal_value: 0.0,
            due_date,
            status: DealStatus::Active,
            office_name: Some(office_name.to_string()),
            address: None,
            city: None,
            state: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Key given to the first card of an empty stage.
pub const SORT_KEY_BASELINE: f64 = 1000.0;
/// Gap left after the last card when appending.
pub const SORT_KEY_STEP: f64 = 1000.0;

/// A card on the pipeline board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub stage_id: StageId,
    pub sort_order: f64,
    pub details: DealDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    pub display_order: i32,
    pub is_active: bool,
}

/// Stage names seeded into an empty store, in display order.
pub const DEFAULT_STAGE_NAMES: [&str; 6] = [
    "Awareness",
    "Qualification",
    "Active Deals",
    "LOI",
    "Due Diligence",
    "Closed",
];

/// Stage new deals land in when the caller does not pick one.
pub const DEFAULT_STAGE_NAME: &str = "Awareness";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: ChecklistItemId,
    pub deal_id: DealId,
    pub title: String,
    pub completed: bool,
    pub is_custom: bool,
    pub display_order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Comment,
    Milestone,
    DealUpdate,
    Document,
    Meeting,
    Review,
    PhoneCall,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 7] = [
        ActivityKind::Comment,
        ActivityKind::Milestone,
        ActivityKind::DealUpdate,
        ActivityKind::Document,
        ActivityKind::Meeting,
        ActivityKind::Review,
        ActivityKind::PhoneCall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Comment => "comment",
            ActivityKind::Milestone => "milestone",
            ActivityKind::DealUpdate => "deal_update",
            ActivityKind::Document => "document",
            ActivityKind::Meeting => "meeting",
            ActivityKind::Review => "review",
            ActivityKind::PhoneCall => "phone_call",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

/// Immutable feed entry attached to a deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: ActivityId,
    pub deal_id: DealId,
    pub user_id: UserId,
    pub content: String,
    pub kind: ActivityKind,
    pub created_at: DateTime<Utc>,
}
