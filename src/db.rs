use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params, params_from_iter};
use uuid::Uuid;

use crate::errors::MarketError;
use crate::models::*;

/// Async-safe handle to the marketplace database.
///
/// Wraps `MarketDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<MarketDb>>,
}

impl DbHandle {
    pub fn new(db: MarketDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, MarketError>
    where
        F: FnOnce(&MarketDb) -> Result<R, MarketError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| MarketError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| MarketError::Other(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

pub struct MarketDb {
    conn: Connection,
}

impl MarketDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    subscription_tier TEXT NOT NULL DEFAULT 'free',
                    api_token TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    access_level TEXT NOT NULL DEFAULT 'public',
                    framework TEXT NOT NULL DEFAULT '',
                    version TEXT NOT NULL DEFAULT '0.1.0',
                    webhook_url TEXT,
                    download_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS deployment_metrics (
                    deployment_id INTEGER PRIMARY KEY
                        REFERENCES deployments(id) ON DELETE CASCADE,
                    error_rate REAL NOT NULL DEFAULT 0,
                    success_rate REAL NOT NULL DEFAULT 0,
                    active_users INTEGER NOT NULL DEFAULT 0,
                    total_requests INTEGER NOT NULL DEFAULT 0,
                    average_response_time REAL NOT NULL DEFAULT 0,
                    requests_per_minute REAL NOT NULL DEFAULT 0,
                    average_tokens_used REAL NOT NULL DEFAULT 0,
                    cost_per_request REAL NOT NULL DEFAULT 0,
                    total_cost REAL NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS executions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    deployment_id INTEGER NOT NULL
                        REFERENCES deployments(id) ON DELETE CASCADE,
                    user_id INTEGER REFERENCES users(id),
                    status TEXT NOT NULL DEFAULT 'pending',
                    response_time_ms REAL,
                    tokens_used INTEGER,
                    cost REAL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS agent_feedback (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    deployment_id INTEGER NOT NULL
                        REFERENCES deployments(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    rating INTEGER NOT NULL,
                    comment TEXT,
                    categories TEXT NOT NULL DEFAULT '{}',
                    sentiment_score REAL,
                    sentiment_label TEXT,
                    creator_response TEXT,
                    response_at TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(deployment_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    kind TEXT NOT NULL,
                    message TEXT NOT NULL,
                    read INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_deployments_owner ON deployments(owner_id);
                CREATE INDEX IF NOT EXISTS idx_executions_deployment
                    ON executions(deployment_id, status);
                CREATE INDEX IF NOT EXISTS idx_feedback_deployment
                    ON agent_feedback(deployment_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── User access ───────────────────────────────────────────────────

    pub fn create_user(&self, name: &str, tier: &SubscriptionTier) -> Result<User> {
        let token = format!("agora_{}", Uuid::new_v4().simple());
        self.conn
            .execute(
                "INSERT INTO users (name, subscription_tier, api_token) VALUES (?1, ?2, ?3)",
                params![name, tier.as_str(), token],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.query_user("SELECT id, name, subscription_tier, api_token, created_at FROM users WHERE id = ?1", params![id])
    }

    pub fn get_user_by_token(&self, token: &str) -> Result<Option<User>> {
        self.query_user("SELECT id, name, subscription_tier, api_token, created_at FROM users WHERE api_token = ?1", params![token])
    }

    fn query_user(&self, sql: &str, args: impl rusqlite::Params) -> Result<Option<User>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare user query")?;
        let mut rows = stmt
            .query_map(args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query user")?;
        match rows.next() {
            Some(row) => {
                let (id, name, tier, api_token, created_at) =
                    row.context("Failed to read user row")?;
                Ok(Some(User {
                    id,
                    name,
                    subscription_tier: SubscriptionTier::from_str(&tier)
                        .map_err(|e| anyhow::anyhow!(e))?,
                    api_token,
                    created_at,
                }))
            }
            None => Ok(None),
        }
    }

    // ── Deployment CRUD ───────────────────────────────────────────────

    /// Create a deployment and its zeroed metrics row in one transaction, so
    /// a failure partway cannot leave a deployment without metrics.
    pub fn create_deployment(
        &self,
        owner_id: i64,
        name: &str,
        description: &str,
        access_level: &AccessLevel,
        framework: &str,
        version: &str,
        webhook_url: Option<&str>,
    ) -> Result<DeploymentWithMetrics> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO deployments (owner_id, name, description, access_level, framework, version, webhook_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![owner_id, name, description, access_level.as_str(), framework, version, webhook_url],
        )
        .context("Failed to insert deployment")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO deployment_metrics (deployment_id) VALUES (?1)",
            params![id],
        )
        .context("Failed to insert metrics row")?;
        tx.commit().context("Failed to commit deployment creation")?;

        self.get_deployment_with_metrics(id)?
            .context("Deployment not found after insert")
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner_id, name, description, status, access_level, framework,
                        version, webhook_url, download_count, created_at, updated_at
                 FROM deployments WHERE id = ?1",
            )
            .context("Failed to prepare get_deployment")?;
        let mut rows = stmt
            .query_map(params![id], Self::map_deployment_row)
            .context("Failed to query deployment")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read deployment row")?.into_deployment()?)),
            None => Ok(None),
        }
    }

    pub fn list_deployments(&self) -> Result<Vec<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner_id, name, description, status, access_level, framework,
                        version, webhook_url, download_count, created_at, updated_at
                 FROM deployments ORDER BY id",
            )
            .context("Failed to prepare list_deployments")?;
        let rows = stmt
            .query_map([], Self::map_deployment_row)
            .context("Failed to query deployments")?;
        let mut deployments = Vec::new();
        for row in rows {
            deployments.push(row.context("Failed to read deployment row")?.into_deployment()?);
        }
        Ok(deployments)
    }

    fn map_deployment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeploymentRow> {
        Ok(DeploymentRow {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            status: row.get(4)?,
            access_level: row.get(5)?,
            framework: row.get(6)?,
            version: row.get(7)?,
            webhook_url: row.get(8)?,
            download_count: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    pub fn get_deployment_with_metrics(&self, id: i64) -> Result<Option<DeploymentWithMetrics>> {
        let deployment = match self.get_deployment(id)? {
            Some(d) => d,
            None => return Ok(None),
        };
        let metrics = self
            .get_metrics(id)?
            .context("Metrics row missing for deployment")?;
        Ok(Some(DeploymentWithMetrics { deployment, metrics }))
    }

    pub fn update_deployment_status(
        &self,
        id: i64,
        status: &DeploymentStatus,
    ) -> Result<Deployment> {
        self.conn
            .execute(
                "UPDATE deployments SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update deployment status")?;
        self.get_deployment(id)?
            .context("Deployment not found after status update")
    }

    pub fn delete_deployment(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM deployments WHERE id = ?1", params![id])
            .context("Failed to delete deployment")?;
        Ok(affected > 0)
    }

    // ── Metrics & executions ──────────────────────────────────────────

    pub fn get_metrics(&self, deployment_id: i64) -> Result<Option<DeploymentMetrics>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT deployment_id, error_rate, success_rate, active_users, total_requests,
                        average_response_time, requests_per_minute, average_tokens_used,
                        cost_per_request, total_cost, updated_at
                 FROM deployment_metrics WHERE deployment_id = ?1",
            )
            .context("Failed to prepare get_metrics")?;
        let mut rows = stmt
            .query_map(params![deployment_id], |row| {
                Ok(DeploymentMetrics {
                    deployment_id: row.get(0)?,
                    error_rate: row.get(1)?,
                    success_rate: row.get(2)?,
                    active_users: row.get(3)?,
                    total_requests: row.get(4)?,
                    average_response_time: row.get(5)?,
                    requests_per_minute: row.get(6)?,
                    average_tokens_used: row.get(7)?,
                    cost_per_request: row.get(8)?,
                    total_cost: row.get(9)?,
                    updated_at: row.get(10)?,
                })
            })
            .context("Failed to query metrics")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read metrics row")?)),
            None => Ok(None),
        }
    }

    pub fn record_execution(
        &self,
        deployment_id: i64,
        user_id: Option<i64>,
        status: &ExecutionStatus,
        response_time_ms: Option<f64>,
        tokens_used: Option<i64>,
        cost: Option<f64>,
    ) -> Result<Execution> {
        let completed_at = status.is_resolved();
        self.conn
            .execute(
                "INSERT INTO executions
                    (deployment_id, user_id, status, response_time_ms, tokens_used, cost, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                         CASE WHEN ?7 THEN datetime('now') ELSE NULL END)",
                params![deployment_id, user_id, status.as_str(), response_time_ms, tokens_used, cost, completed_at],
            )
            .context("Failed to insert execution")?;
        let id = self.conn.last_insert_rowid();
        if status.is_resolved() {
            self.recompute_metrics(deployment_id)?;
        }
        self.get_execution(id)?
            .context("Execution not found after insert")
    }

    pub fn get_execution(&self, id: i64) -> Result<Option<Execution>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, deployment_id, user_id, status, response_time_ms, tokens_used,
                        cost, created_at, completed_at
                 FROM executions WHERE id = ?1",
            )
            .context("Failed to prepare get_execution")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })
            .context("Failed to query execution")?;
        match rows.next() {
            Some(row) => {
                let (id, deployment_id, user_id, status, response_time_ms, tokens_used, cost, created_at, completed_at) =
                    row.context("Failed to read execution row")?;
                Ok(Some(Execution {
                    id,
                    deployment_id,
                    user_id,
                    status: ExecutionStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?,
                    response_time_ms,
                    tokens_used,
                    cost,
                    created_at,
                    completed_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// Mark a pending execution resolved and fold it into the metrics row.
    /// Policy checks (existence, pending state) belong to the caller.
    pub fn resolve_execution(
        &self,
        id: i64,
        success: bool,
        response_time_ms: Option<f64>,
        tokens_used: Option<i64>,
        cost: Option<f64>,
    ) -> Result<Execution> {
        let status = if success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        self.conn
            .execute(
                "UPDATE executions
                 SET status = ?1,
                     response_time_ms = COALESCE(?2, response_time_ms),
                     tokens_used = COALESCE(?3, tokens_used),
                     cost = COALESCE(?4, cost),
                     completed_at = datetime('now')
                 WHERE id = ?5",
                params![status.as_str(), response_time_ms, tokens_used, cost, id],
            )
            .context("Failed to resolve execution")?;
        let execution = self
            .get_execution(id)?
            .context("Execution not found after resolve")?;
        self.recompute_metrics(execution.deployment_id)?;
        Ok(execution)
    }

    /// Recompute the metrics snapshot from resolved executions only. Pending
    /// executions never move any figure until they resolve.
    pub fn recompute_metrics(&self, deployment_id: i64) -> Result<DeploymentMetrics> {
        let (total, completed, avg_response, avg_tokens, total_cost): (i64, i64, f64, f64, f64) =
            self.conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                            COALESCE(AVG(response_time_ms), 0),
                            COALESCE(AVG(tokens_used), 0),
                            COALESCE(SUM(cost), 0)
                     FROM executions
                     WHERE deployment_id = ?1 AND status != 'pending'",
                    params![deployment_id],
                    |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    },
                )
                .context("Failed to aggregate executions")?;

        let recent: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM executions
                 WHERE deployment_id = ?1 AND status != 'pending'
                   AND completed_at >= datetime('now', '-60 seconds')",
                params![deployment_id],
                |row| row.get(0),
            )
            .context("Failed to count recent executions")?;

        let active_users: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(DISTINCT user_id) FROM executions
                 WHERE deployment_id = ?1 AND user_id IS NOT NULL
                   AND created_at >= datetime('now', '-1 hour')",
                params![deployment_id],
                |row| row.get(0),
            )
            .context("Failed to count active users")?;

        let (error_rate, success_rate, cost_per_request) = if total > 0 {
            let failed = (total - completed) as f64;
            (
                failed / total as f64,
                completed as f64 / total as f64,
                total_cost / total as f64,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        self.conn
            .execute(
                "UPDATE deployment_metrics
                 SET error_rate = ?1, success_rate = ?2, active_users = ?3,
                     total_requests = ?4, average_response_time = ?5,
                     requests_per_minute = ?6, average_tokens_used = ?7,
                     cost_per_request = ?8, total_cost = ?9,
                     updated_at = datetime('now')
                 WHERE deployment_id = ?10",
                params![
                    error_rate,
                    success_rate,
                    active_users,
                    total,
                    avg_response,
                    recent as f64,
                    avg_tokens,
                    cost_per_request,
                    total_cost,
                    deployment_id
                ],
            )
            .context("Failed to update metrics row")?;

        self.get_metrics(deployment_id)?
            .context("Metrics row missing after recompute")
    }

    // ── Feedback ──────────────────────────────────────────────────────

    pub fn create_feedback(
        &self,
        deployment_id: i64,
        user_id: i64,
        rating: i64,
        comment: Option<&str>,
        categories: &BTreeMap<String, f64>,
        sentiment_score: Option<f64>,
        sentiment_label: Option<&SentimentLabel>,
    ) -> Result<AgentFeedback> {
        let categories_json =
            serde_json::to_string(categories).context("Failed to serialize categories")?;
        self.conn
            .execute(
                "INSERT INTO agent_feedback
                    (deployment_id, user_id, rating, comment, categories, sentiment_score, sentiment_label)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    deployment_id,
                    user_id,
                    rating,
                    comment,
                    categories_json,
                    sentiment_score,
                    sentiment_label.map(|l| l.as_str())
                ],
            )
            .context("Failed to insert feedback")?;
        let id = self.conn.last_insert_rowid();
        self.get_feedback(id)?
            .context("Feedback not found after insert")
    }

    pub fn get_feedback(&self, id: i64) -> Result<Option<AgentFeedback>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", FEEDBACK_SELECT))
            .context("Failed to prepare get_feedback")?;
        let mut rows = stmt
            .query_map(params![id], Self::map_feedback_row)
            .context("Failed to query feedback")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read feedback row")?.into_feedback()?)),
            None => Ok(None),
        }
    }

    pub fn get_feedback_by_user(
        &self,
        deployment_id: i64,
        user_id: i64,
    ) -> Result<Option<AgentFeedback>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE deployment_id = ?1 AND user_id = ?2",
                FEEDBACK_SELECT
            ))
            .context("Failed to prepare get_feedback_by_user")?;
        let mut rows = stmt
            .query_map(params![deployment_id, user_id], Self::map_feedback_row)
            .context("Failed to query feedback")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read feedback row")?.into_feedback()?)),
            None => Ok(None),
        }
    }

    /// Load a deployment's feedback, newest first, optionally bounded by an
    /// inclusive `YYYY-MM-DD` date range.
    pub fn list_feedback(
        &self,
        deployment_id: i64,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<Vec<AgentFeedback>> {
        let mut sql = format!("{} WHERE deployment_id = ?1", FEEDBACK_SELECT);
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(deployment_id)];
        if let Some(start) = start_date {
            args.push(Box::new(start.to_string()));
            sql.push_str(&format!(" AND date(created_at) >= date(?{})", args.len()));
        }
        if let Some(end) = end_date {
            args.push(Box::new(end.to_string()));
            sql.push_str(&format!(" AND date(created_at) <= date(?{})", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_feedback")?;
        let rows = stmt
            .query_map(
                params_from_iter(args.iter().map(|a| a.as_ref())),
                Self::map_feedback_row,
            )
            .context("Failed to query feedback")?;
        let mut feedback = Vec::new();
        for row in rows {
            feedback.push(row.context("Failed to read feedback row")?.into_feedback()?);
        }
        Ok(feedback)
    }

    pub fn set_feedback_response(&self, id: i64, response: &str) -> Result<AgentFeedback> {
        self.conn
            .execute(
                "UPDATE agent_feedback
                 SET creator_response = ?1, response_at = datetime('now')
                 WHERE id = ?2",
                params![response, id],
            )
            .context("Failed to set feedback response")?;
        self.get_feedback(id)?
            .context("Feedback not found after response update")
    }

    fn map_feedback_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeedbackRow> {
        Ok(FeedbackRow {
            id: row.get(0)?,
            deployment_id: row.get(1)?,
            user_id: row.get(2)?,
            rating: row.get(3)?,
            comment: row.get(4)?,
            categories: row.get(5)?,
            sentiment_score: row.get(6)?,
            sentiment_label: row.get(7)?,
            creator_response: row.get(8)?,
            response_at: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    // ── Notifications ─────────────────────────────────────────────────

    pub fn create_notification(
        &self,
        user_id: i64,
        kind: &str,
        message: &str,
    ) -> Result<Notification> {
        self.conn
            .execute(
                "INSERT INTO notifications (user_id, kind, message) VALUES (?1, ?2, ?3)",
                params![user_id, kind, message],
            )
            .context("Failed to insert notification")?;
        let id = self.conn.last_insert_rowid();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, kind, message, read, created_at
                 FROM notifications WHERE id = ?1",
            )
            .context("Failed to prepare notification query")?;
        let notification = stmt
            .query_row(params![id], Self::map_notification_row)
            .context("Notification not found after insert")?;
        Ok(notification)
    }

    pub fn list_notifications(&self, user_id: i64) -> Result<Vec<Notification>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, user_id, kind, message, read, created_at
                 FROM notifications WHERE user_id = ?1 ORDER BY id DESC",
            )
            .context("Failed to prepare list_notifications")?;
        let rows = stmt
            .query_map(params![user_id], Self::map_notification_row)
            .context("Failed to query notifications")?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row.context("Failed to read notification row")?);
        }
        Ok(notifications)
    }

    fn map_notification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
        Ok(Notification {
            id: row.get(0)?,
            user_id: row.get(1)?,
            kind: row.get(2)?,
            message: row.get(3)?,
            read: row.get::<_, i64>(4)? != 0,
            created_at: row.get(5)?,
        })
    }
}

const FEEDBACK_SELECT: &str = "SELECT id, deployment_id, user_id, rating, comment, categories,
        sentiment_score, sentiment_label, creator_response, response_at, created_at
 FROM agent_feedback";

/// Raw feedback row before the categories JSON and label string are parsed.
struct FeedbackRow {
    id: i64,
    deployment_id: i64,
    user_id: i64,
    rating: i64,
    comment: Option<String>,
    categories: String,
    sentiment_score: Option<f64>,
    sentiment_label: Option<String>,
    creator_response: Option<String>,
    response_at: Option<String>,
    created_at: String,
}

impl FeedbackRow {
    fn into_feedback(self) -> Result<AgentFeedback> {
        let categories: BTreeMap<String, f64> =
            serde_json::from_str(&self.categories).context("Failed to parse categories JSON")?;
        let sentiment_label = match self.sentiment_label {
            Some(l) => Some(SentimentLabel::from_str(&l).map_err(|e| anyhow::anyhow!(e))?),
            None => None,
        };
        Ok(AgentFeedback {
            id: self.id,
            deployment_id: self.deployment_id,
            user_id: self.user_id,
            rating: self.rating,
            comment: self.comment,
            categories,
            sentiment_score: self.sentiment_score,
            sentiment_label,
            creator_response: self.creator_response,
            response_at: self.response_at,
            created_at: self.created_at,
        })
    }
}

struct DeploymentRow {
    id: i64,
    owner_id: i64,
    name: String,
    description: String,
    status: String,
    access_level: String,
    framework: String,
    version: String,
    webhook_url: Option<String>,
    download_count: i64,
    created_at: String,
    updated_at: String,
}

impl DeploymentRow {
    fn into_deployment(self) -> Result<Deployment> {
        Ok(Deployment {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            description: self.description,
            status: DeploymentStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            access_level: AccessLevel::from_str(&self.access_level)
                .map_err(|e| anyhow::anyhow!(e))?,
            framework: self.framework,
            version: self.version,
            webhook_url: self.webhook_url,
            download_count: self.download_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
