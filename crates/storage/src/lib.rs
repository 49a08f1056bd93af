use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ActivityEntry, ActivityId, ActivityKind, ChecklistItem, ChecklistItemId, Deal,
        DealDetails, DealId, DealStatus, Stage, StageId, UserId, DEFAULT_STAGE_NAME,
        DEFAULT_STAGE_NAMES, SORT_KEY_BASELINE, SORT_KEY_STEP,
    },
    error::PipelineError,
    protocol::{
        ChangeKind, ChangeNotification, ChecklistPatch, CollectionScope, DealPatch, NewActivity,
        NewChecklistItem, NewDeal,
    },
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const CHANGE_FEED_CAPACITY: usize = 256;

const DEAL_COLUMNS: &str = "id, stage_id, sort_order, title, company_name, deal_value, due_date, \
     status, office_name, address, city, state, extra, created_at, updated_at";

const CHECKLIST_COLUMNS: &str =
    "id, deal_id, title, completed, completed_at, is_custom, template_key, display_order";

/// SQLite-backed store of record. Every committed write is announced on an
/// in-process change feed carrying a monotonic sequence number.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: ChangeFeed,
}

#[derive(Clone)]
struct ChangeFeed {
    tx: broadcast::Sender<ChangeNotification>,
    sequence: Arc<AtomicU64>,
}

impl ChangeFeed {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    fn publish(&self, scope: CollectionScope, kind: ChangeKind, entity_id: Option<Uuid>) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let notification = ChangeNotification {
            scope,
            kind,
            entity_id,
            sequence,
        };
        debug!(?scope, ?kind, sequence, "storage: change committed");
        // No subscribers is fine; nobody is watching that view.
        let _ = self.tx.send(notification);
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_change_capacity(database_url, CHANGE_FEED_CAPACITY).await
    }

    pub async fn with_change_capacity(database_url: &str, capacity: usize) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if is_in_memory(database_url) {
            // One connection keeps a private in-memory database alive and
            // avoids shared-cache table locks.
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            changes: ChangeFeed::new(capacity.max(1)),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Receives every change committed after this call.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.tx.subscribe()
    }

    /// Sequence number of the most recent committed change.
    pub fn last_sequence(&self) -> u64 {
        self.changes.sequence.load(Ordering::SeqCst)
    }

    pub async fn create_stage(&self, name: &str, display_order: i32) -> Result<Stage> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PipelineError::validation("stage name cannot be empty").into());
        }
        let taken: Option<String> =
            sqlx::query_scalar("SELECT name FROM deal_stages WHERE display_order = ?")
                .bind(display_order)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(existing) = taken {
            return Err(PipelineError::validation(format!(
                "display order {display_order} is already used by stage '{existing}'"
            ))
            .into());
        }
        if self.stage_by_name(name).await?.is_some() {
            return Err(PipelineError::validation(format!("stage '{name}' already exists")).into());
        }
        let stage = Stage {
            id: StageId::random(),
            name: name.to_string(),
            display_order,
            is_active: true,
        };
        sqlx::query(
            "INSERT INTO deal_stages (id, name, display_order, is_active) VALUES (?, ?, ?, 1)",
        )
        .bind(stage.id.to_string())
        .bind(&stage.name)
        .bind(stage.display_order)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create stage '{name}'"))?;
        self.changes.publish(
            CollectionScope::Stages,
            ChangeKind::Insert,
            Some(stage.id.0),
        );
        Ok(stage)
    }

    /// Seeds the default pipeline when no stage exists yet. Returns the
    /// stages in display order either way.
    pub async fn seed_default_stages(&self) -> Result<Vec<Stage>> {
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deal_stages")
            .fetch_one(&self.pool)
            .await?;
        if existing == 0 {
            let mut tx = self.pool.begin().await?;
            for (position, name) in DEFAULT_STAGE_NAMES.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO deal_stages (id, name, display_order, is_active) VALUES (?, ?, ?, 1)",
                )
                .bind(StageId::random().to_string())
                .bind(*name)
                .bind(position as i32 + 1)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            self.changes
                .publish(CollectionScope::Stages, ChangeKind::Bulk, None);
        }
        self.list_stages().await
    }

    pub async fn set_stage_active(&self, stage_id: StageId, is_active: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE deal_stages SET is_active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(is_active)
        .bind(stage_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("stage", stage_id).into());
        }
        self.changes.publish(
            CollectionScope::Stages,
            ChangeKind::Update,
            Some(stage_id.0),
        );
        Ok(())
    }

    pub async fn list_stages(&self) -> Result<Vec<Stage>> {
        let rows = sqlx::query(
            "SELECT id, name, display_order, is_active FROM deal_stages ORDER BY display_order",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_stage).collect()
    }

    pub async fn load_stage(&self, stage_id: StageId) -> Result<Option<Stage>> {
        let row = sqlx::query(
            "SELECT id, name, display_order, is_active FROM deal_stages WHERE id = ?",
        )
        .bind(stage_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_stage).transpose()
    }

    pub async fn stage_by_name(&self, name: &str) -> Result<Option<Stage>> {
        let row = sqlx::query(
            "SELECT id, name, display_order, is_active FROM deal_stages WHERE name = ? COLLATE NOCASE",
        )
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_stage).transpose()
    }

    /// The named default stage when active, else the first active stage.
    async fn default_stage(&self) -> Result<Option<Stage>> {
        if let Some(stage) = self.stage_by_name(DEFAULT_STAGE_NAME).await? {
            if stage.is_active {
                return Ok(Some(stage));
            }
        }
        let row = sqlx::query(
            "SELECT id, name, display_order, is_active FROM deal_stages
             WHERE is_active = 1 ORDER BY display_order LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_stage).transpose()
    }

    pub async fn list_deals(&self) -> Result<Vec<Deal>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals ORDER BY sort_order ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_deal).collect()
    }

    pub async fn load_deal(&self, deal_id: DealId) -> Result<Option<Deal>> {
        let row = sqlx::query(&format!("SELECT {DEAL_COLUMNS} FROM deals WHERE id = ?"))
            .bind(deal_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_deal).transpose()
    }

    pub async fn insert_deal(&self, new_deal: NewDeal) -> Result<Deal> {
        new_deal.validate()?;

        let stage = match new_deal.stage_id {
            Some(stage_id) => self
                .load_stage(stage_id)
                .await?
                .ok_or_else(|| PipelineError::not_found("stage", stage_id))?,
            None => self.default_stage().await?.ok_or_else(|| {
                PipelineError::validation("no active stage is available for a new deal")
            })?,
        };

        let sort_order = match new_deal.sort_order {
            Some(sort_order) => sort_order,
            None => {
                let last: Option<f64> =
                    sqlx::query_scalar("SELECT MAX(sort_order) FROM deals WHERE stage_id = ?")
                        .bind(stage.id.to_string())
                        .fetch_one(&self.pool)
                        .await?;
                last.map_or(SORT_KEY_BASELINE, |last| last + SORT_KEY_STEP)
            }
        };

        let now = Utc::now();
        let mut details = new_deal.details;
        details.title = details.title.trim().to_string();
        let deal = Deal {
            id: DealId::random(),
            stage_id: stage.id,
            sort_order,
            details,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(&format!(
            "INSERT INTO deals ({DEAL_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(deal.id.to_string())
        .bind(deal.stage_id.to_string())
        .bind(deal.sort_order)
        .bind(&deal.details.title)
        .bind(&deal.details.company_name)
        .bind(deal.details.deal_value)
        .bind(deal.details.due_date)
        .bind(deal.details.status.as_str())
        .bind(&deal.details.office_name)
        .bind(&deal.details.address)
        .bind(&deal.details.city)
        .bind(&deal.details.state)
        .bind(serde_json::to_string(&deal.details.extra)?)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert deal")?;

        self.changes
            .publish(CollectionScope::Deals, ChangeKind::Insert, Some(deal.id.0));
        Ok(deal)
    }

    pub async fn update_deal(&self, deal_id: DealId, patch: &DealPatch) -> Result<()> {
        patch.validate()?;
        let now = Utc::now();
        let id = deal_id.to_string();

        let query = match patch {
            DealPatch::Move {
                stage_id,
                sort_order,
            } => {
                if self.load_stage(*stage_id).await?.is_none() {
                    return Err(PipelineError::not_found("stage", stage_id).into());
                }
                sqlx::query(
                    "UPDATE deals SET stage_id = ?, sort_order = ?, updated_at = ? WHERE id = ?",
                )
                .bind(stage_id.to_string())
                .bind(*sort_order)
            }
            DealPatch::Rename { title } => {
                sqlx::query("UPDATE deals SET title = ?, updated_at = ? WHERE id = ?")
                    .bind(title.trim().to_string())
            }
            DealPatch::SetValue { deal_value } => {
                sqlx::query("UPDATE deals SET deal_value = ?, updated_at = ? WHERE id = ?")
                    .bind(*deal_value)
            }
            DealPatch::SetStatus { status } => {
                sqlx::query("UPDATE deals SET status = ?, updated_at = ? WHERE id = ?")
                    .bind(status.as_str())
            }
            DealPatch::SetLocation {
                office_name,
                address,
                city,
                state,
            } => sqlx::query(
                "UPDATE deals SET office_name = ?, address = ?, city = ?, state = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(office_name.clone())
            .bind(address.clone())
            .bind(city.clone())
            .bind(state.clone()),
            DealPatch::SetDueDate { due_date } => {
                sqlx::query("UPDATE deals SET due_date = ?, updated_at = ? WHERE id = ?")
                    .bind(*due_date)
            }
        };

        let result = query.bind(now).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::not_found("deal", deal_id).into());
        }

        self.changes
            .publish(CollectionScope::Deals, ChangeKind::Update, Some(deal_id.0));
        Ok(())
    }

    /// Rewrites many sort keys in one transaction, announced as one bulk change.
    pub async fn rewrite_sort_orders(&self, keys: &[(DealId, f64)]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (deal_id, sort_order) in keys {
            if !sort_order.is_finite() {
                return Err(PipelineError::validation(format!(
                    "sort order must be finite, got {sort_order}"
                ))
                .into());
            }
            let result =
                sqlx::query("UPDATE deals SET sort_order = ?, updated_at = ? WHERE id = ?")
                    .bind(*sort_order)
                    .bind(now)
                    .bind(deal_id.to_string())
                    .execute(&mut *tx)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(PipelineError::not_found("deal", deal_id).into());
            }
        }
        tx.commit().await?;
        self.changes
            .publish(CollectionScope::Deals, ChangeKind::Bulk, None);
        Ok(())
    }

    pub async fn list_checklist(&self, deal_id: DealId) -> Result<Vec<ChecklistItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHECKLIST_COLUMNS} FROM deal_milestones WHERE deal_id = ?
             ORDER BY display_order ASC, created_at ASC, id ASC"
        ))
        .bind(deal_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_checklist_item).collect()
    }

    pub async fn insert_checklist_item(&self, item: NewChecklistItem) -> Result<ChecklistItem> {
        item.validate()?;
        self.ensure_deal_exists(item.deal_id).await?;

        let created = ChecklistItem {
            id: ChecklistItemId::random(),
            deal_id: item.deal_id,
            title: item.title.trim().to_string(),
            completed: item.completed,
            is_custom: item.is_custom,
            display_order: item.display_order,
            template_key: item.template_key,
            completed_at: item.completed.then(Utc::now),
        };

        sqlx::query(&format!(
            "INSERT INTO deal_milestones ({CHECKLIST_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(created.id.to_string())
        .bind(created.deal_id.to_string())
        .bind(&created.title)
        .bind(created.completed)
        .bind(created.completed_at)
        .bind(created.is_custom)
        .bind(&created.template_key)
        .bind(created.display_order)
        .execute(&self.pool)
        .await
        .context("failed to insert checklist item")?;

        self.changes.publish(
            CollectionScope::Checklist(created.deal_id),
            ChangeKind::Insert,
            Some(created.id.0),
        );
        Ok(created)
    }

    pub async fn update_checklist_item(
        &self,
        item_id: ChecklistItemId,
        patch: &ChecklistPatch,
    ) -> Result<()> {
        patch.validate()?;
        let deal_id: Option<String> =
            sqlx::query_scalar("SELECT deal_id FROM deal_milestones WHERE id = ?")
                .bind(item_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        let Some(deal_id) = deal_id else {
            return Err(PipelineError::not_found("checklist item", item_id).into());
        };
        let deal_id: DealId = parse_id(&deal_id)?;

        match patch {
            ChecklistPatch::SetCompleted { completed } => {
                sqlx::query(
                    "UPDATE deal_milestones
                     SET completed = ?, completed_at = ?, updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?",
                )
                .bind(*completed)
                .bind(completed.then(Utc::now))
                .bind(item_id.to_string())
                .execute(&self.pool)
                .await?;
            }
            ChecklistPatch::Rename { title } => {
                sqlx::query(
                    "UPDATE deal_milestones SET title = ?, updated_at = CURRENT_TIMESTAMP
                     WHERE id = ?",
                )
                .bind(title.trim().to_string())
                .bind(item_id.to_string())
                .execute(&self.pool)
                .await?;
            }
        }

        self.changes.publish(
            CollectionScope::Checklist(deal_id),
            ChangeKind::Update,
            Some(item_id.0),
        );
        Ok(())
    }

    pub async fn list_activity(&self, deal_id: DealId) -> Result<Vec<ActivityEntry>> {
        let rows = sqlx::query(
            "SELECT id, deal_id, user_id, content, type, created_at FROM activities
             WHERE deal_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(deal_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_activity).collect()
    }

    pub async fn insert_activity(&self, activity: NewActivity) -> Result<ActivityEntry> {
        activity.validate()?;
        self.ensure_deal_exists(activity.deal_id).await?;

        let entry = ActivityEntry {
            id: ActivityId::random(),
            deal_id: activity.deal_id,
            user_id: activity.user_id,
            content: activity.content.trim().to_string(),
            kind: activity.kind,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO activities (id, deal_id, user_id, content, type, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.deal_id.to_string())
        .bind(entry.user_id.to_string())
        .bind(&entry.content)
        .bind(entry.kind.as_str())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("failed to insert activity")?;

        self.changes.publish(
            CollectionScope::Activity(entry.deal_id),
            ChangeKind::Insert,
            Some(entry.id.0),
        );
        Ok(entry)
    }

    async fn ensure_deal_exists(&self, deal_id: DealId) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM deals WHERE id = ?")
            .bind(deal_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(PipelineError::not_found("deal", deal_id).into());
        }
        Ok(())
    }
}

fn parse_id<T>(raw: &str) -> Result<T>
where
    T: FromStr<Err = uuid::Error>,
{
    raw.parse::<T>()
        .with_context(|| format!("stored id '{raw}' is not a uuid"))
}

fn row_to_stage(row: &SqliteRow) -> Result<Stage> {
    Ok(Stage {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        name: row.try_get("name")?,
        display_order: row.try_get("display_order")?,
        is_active: row.try_get("is_active")?,
    })
}

fn row_to_deal(row: &SqliteRow) -> Result<Deal> {
    let status: String = row.try_get("status")?;
    let extra: String = row.try_get("extra")?;
    Ok(Deal {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        stage_id: parse_id(&row.try_get::<String, _>("stage_id")?)?,
        sort_order: row.try_get("sort_order")?,
        details: DealDetails {
            title: row.try_get("title")?,
            company_name: row.try_get("company_name")?,
            deal_value: row.try_get("deal_value")?,
            due_date: row.try_get::<DateTime<Utc>, _>("due_date")?,
            status: DealStatus::parse(&status)
                .with_context(|| format!("unknown deal status '{status}'"))?,
            office_name: row.try_get("office_name")?,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            extra: serde_json::from_str(&extra).context("deal extra column is not a JSON object")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_checklist_item(row: &SqliteRow) -> Result<ChecklistItem> {
    Ok(ChecklistItem {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        deal_id: parse_id(&row.try_get::<String, _>("deal_id")?)?,
        title: row.try_get("title")?,
        completed: row.try_get("completed")?,
        is_custom: row.try_get("is_custom")?,
        display_order: row.try_get("display_order")?,
        template_key: row.try_get("template_key")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_activity(row: &SqliteRow) -> Result<ActivityEntry> {
    let kind: String = row.try_get("type")?;
    let kind = ActivityKind::parse(&kind)
        .with_context(|| format!("unknown activity type '{kind}'"))?;
    Ok(ActivityEntry {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        deal_id: parse_id(&row.try_get::<String, _>("deal_id")?)?,
        user_id: parse_id::<UserId>(&row.try_get::<String, _>("user_id")?)?,
        content: row.try_get("content")?,
        kind,
        created_at: row.try_get("created_at")?,
    })
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

pub fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
