#[cfg(feature = "sqlite")]
use crate::store::{
    Result, StateError, StateStore, StatusEvent, StatusStore, UsageStore,
};
#[cfg(feature = "sqlite")]
use agentflow_core::schema::OutputFormat;
#[cfg(feature = "sqlite")]
use agentflow_core::tokens::{TokenSettings, UsageRecord};
#[cfg(feature = "sqlite")]
use agentflow_core::workflow::{Step, StepStatus, StepType, Workflow, WorkflowStatus};
#[cfg(feature = "sqlite")]
use async_trait::async_trait;
#[cfg(feature = "sqlite")]
use chrono::{DateTime, Utc};
#[cfg(feature = "sqlite")]
use sqlx::sqlite::SqlitePoolOptions;
#[cfg(feature = "sqlite")]
use sqlx::{Row, SqlitePool};
#[cfg(feature = "sqlite")]
use uuid::Uuid;

#[cfg(feature = "sqlite")]
/// SQLite-backed implementation of all persistence traits
pub struct SqliteStore {
    pool: SqlitePool,
}

#[cfg(feature = "sqlite")]
impl SqliteStore {
    /// Connect to a SQLite database URL (e.g. `sqlite://agentflow.db?mode=rwc`)
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Create a store over an existing pool
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                intent TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_steps (
                workflow_id TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                step_type TEXT NOT NULL,
                description TEXT NOT NULL,
                tool TEXT,
                parameters TEXT NOT NULL,
                output_format TEXT,
                skip_if TEXT,
                requires_confirmation INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                result TEXT,
                error TEXT,
                completed_at TEXT,
                PRIMARY KEY (workflow_id, step_number)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS agent_status (
                id TEXT PRIMARY KEY,
                session TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                message TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS token_usage_records (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                model TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                cost_micros INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS token_settings (
                user_id TEXT PRIMARY KEY,
                settings TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_workflows_session ON workflows(session_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_status_session ON agent_status(session, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_usage_user ON token_usage_records(user_id, created_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StateError::Database(e.to_string()))?;
        }

        Ok(())
    }

    fn row_to_workflow(row: &sqlx::sqlite::SqliteRow) -> Result<Workflow> {
        let id: String = row.get("id");
        let id = Uuid::parse_str(&id).map_err(|e| StateError::Database(e.to_string()))?;

        Ok(Workflow {
            id,
            session_id: row.get("session_id"),
            intent: row.get("intent"),
            status: parse_workflow_status(&row.get::<String, _>("status")),
            current_step: row.get::<i64, _>("current_step") as u32,
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
            steps: Vec::new(),
        })
    }

    fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<Step> {
        let parameters: String = row.get("parameters");
        let output_format: Option<String> = row.get("output_format");
        let result: Option<String> = row.get("result");

        Ok(Step {
            step_number: row.get::<i64, _>("step_number") as u32,
            step_type: parse_step_type(&row.get::<String, _>("step_type")),
            description: row.get("description"),
            tool: row.get("tool"),
            parameters: serde_json::from_str(&parameters)?,
            output_format: match output_format {
                Some(text) => Some(serde_json::from_str::<OutputFormat>(&text)?),
                None => None,
            },
            skip_if: row.get("skip_if"),
            requires_confirmation: row.get::<i64, _>("requires_confirmation") != 0,
            status: parse_step_status(&row.get::<String, _>("status")),
            result: match result {
                Some(text) => Some(serde_json::from_str(&text)?),
                None => None,
            },
            error: row.get("error"),
            completed_at: row.get("completed_at"),
        })
    }

    async fn load_steps(&self, workflow_id: Uuid) -> Result<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_steps WHERE workflow_id = ? ORDER BY step_number ASC",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_step).collect()
    }

    async fn insert_step(&self, workflow_id: Uuid, step: &Step) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflow_steps (
                workflow_id, step_number, step_type, description, tool,
                parameters, output_format, skip_if, requires_confirmation,
                status, result, error, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(step.step_number as i64)
        .bind(step.step_type.as_str())
        .bind(&step.description)
        .bind(&step.tool)
        .bind(serde_json::to_string(&step.parameters)?)
        .bind(match &step.output_format {
            Some(format) => Some(serde_json::to_string(format)?),
            None => None,
        })
        .bind(&step.skip_if)
        .bind(step.requires_confirmation as i64)
        .bind(step.status.as_str())
        .bind(match &step.result {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        })
        .bind(&step.error)
        .bind(step.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(feature = "sqlite")]
fn parse_workflow_status(raw: &str) -> WorkflowStatus {
    match raw {
        "planning" => WorkflowStatus::Planning,
        "running" => WorkflowStatus::Running,
        "waiting_confirmation" => WorkflowStatus::WaitingConfirmation,
        "completed" => WorkflowStatus::Completed,
        "failed" => WorkflowStatus::Failed,
        "cancelled" => WorkflowStatus::Cancelled,
        _ => WorkflowStatus::Failed,
    }
}

#[cfg(feature = "sqlite")]
fn parse_step_status(raw: &str) -> StepStatus {
    match raw {
        "pending" => StepStatus::Pending,
        "running" => StepStatus::Running,
        "completed" => StepStatus::Completed,
        "skipped" => StepStatus::Skipped,
        "failed" => StepStatus::Failed,
        _ => StepStatus::Failed,
    }
}

#[cfg(feature = "sqlite")]
fn parse_step_type(raw: &str) -> StepType {
    match raw {
        "tool_call" => StepType::ToolCall,
        "analysis" => StepType::Analysis,
        "decision" => StepType::Decision,
        _ => StepType::Notification,
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl StateStore for SqliteStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflows (
                id, session_id, intent, status, current_step, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.session_id)
        .bind(&workflow.intent)
        .bind(workflow.status.as_str())
        .bind(workflow.current_step as i64)
        .bind(workflow.created_at)
        .bind(workflow.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        for step in &workflow.steps {
            self.insert_step(workflow.id, step).await?;
        }

        Ok(())
    }

    async fn load_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StateError::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let mut workflow = Self::row_to_workflow(&row)?;
                workflow.steps = self.load_steps(workflow.id).await?;
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    async fn find_by_session(&self, session: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query(
            "SELECT * FROM workflows WHERE session_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(session)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let mut workflow = Self::row_to_workflow(&row)?;
                workflow.steps = self.load_steps(workflow.id).await?;
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    async fn update_workflow_status(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        current_step: u32,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workflows SET status = ?, current_step = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(current_step as i64)
        .bind(completed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StateError::WorkflowNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn update_step(&self, workflow_id: Uuid, step: &Step) -> Result<()> {
        self.insert_step(workflow_id, step).await
    }

    async fn list_active(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query(
            "SELECT * FROM workflows WHERE status IN ('planning', 'running', 'waiting_confirmation') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut workflow = Self::row_to_workflow(row)?;
            workflow.steps = self.load_steps(workflow.id).await?;
            workflows.push(workflow);
        }

        Ok(workflows)
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl StatusStore for SqliteStore {
    async fn append(&self, event: StatusEvent) -> Result<()> {
        sqlx::query("INSERT INTO agent_status (id, session, timestamp, message) VALUES (?, ?, ?, ?)")
            .bind(event.id.to_string())
            .bind(&event.session)
            .bind(event.timestamp)
            .bind(&event.message)
            .execute(&self.pool)
            .await
            .map_err(|e| StateError::Database(e.to_string()))?;

        Ok(())
    }

    async fn events_since(
        &self,
        session: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StatusEvent>> {
        let rows = match since {
            Some(cursor) => {
                sqlx::query(
                    "SELECT * FROM agent_status WHERE session = ? AND timestamp > ? ORDER BY timestamp ASC",
                )
                .bind(session)
                .bind(cursor)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM agent_status WHERE session = ? ORDER BY timestamp ASC")
                    .bind(session)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StateError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                Ok(StatusEvent {
                    id: Uuid::parse_str(&id).map_err(|e| StateError::Database(e.to_string()))?,
                    session: row.get("session"),
                    timestamp: row.get("timestamp"),
                    message: row.get("message"),
                })
            })
            .collect()
    }
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl UsageStore for SqliteStore {
    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_usage_records (
                id, user_id, model, agent_type, prompt_tokens,
                completion_tokens, total_tokens, cost_micros, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.user_id)
        .bind(&record.model)
        .bind(&record.agent_type)
        .bind(record.prompt_tokens as i64)
        .bind(record.completion_tokens as i64)
        .bind(record.total_tokens as i64)
        .bind(record.cost_micros as i64)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        Ok(())
    }

    async fn usage_since(&self, user_id: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_tokens), 0) AS total FROM token_usage_records WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        let total: i64 = row.get("total");
        Ok(total as u64)
    }

    async fn usage_records(&self, user_id: &str, limit: u32) -> Result<Vec<UsageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM token_usage_records WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StateError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                Ok(UsageRecord {
                    id: Uuid::parse_str(&id).map_err(|e| StateError::Database(e.to_string()))?,
                    user_id: row.get("user_id"),
                    model: row.get("model"),
                    agent_type: row.get("agent_type"),
                    prompt_tokens: row.get::<i64, _>("prompt_tokens") as u64,
                    completion_tokens: row.get::<i64, _>("completion_tokens") as u64,
                    total_tokens: row.get::<i64, _>("total_tokens") as u64,
                    cost_micros: row.get::<i64, _>("cost_micros") as u64,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    async fn settings(&self, user_id: &str) -> Result<TokenSettings> {
        let row = sqlx::query("SELECT settings FROM token_settings WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StateError::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let text: String = row.get("settings");
                Ok(serde_json::from_str(&text)?)
            }
            None => Ok(TokenSettings::default()),
        }
    }

    async fn put_settings(&self, user_id: &str, settings: &TokenSettings) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO token_settings (user_id, settings) VALUES (?, ?)")
            .bind(user_id)
            .bind(serde_json::to_string(settings)?)
            .execute(&self.pool)
            .await
            .map_err(|e| StateError::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
#[cfg(feature = "sqlite")]
mod tests {
    use super::*;
    use agentflow_core::workflow::{Step, StepType};
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqliteStore {
        let path = dir.path().join("agentflow.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let store = SqliteStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn workflow() -> Workflow {
        let steps = vec![
            Step::new(1, StepType::ToolCall, "Suche Jobs")
                .with_tool("job_search")
                .with_parameters(json!({"what": "Entwickler", "where": "Berlin"})),
            Step::new(2, StepType::Decision, "Bewerte Ergebnisse"),
        ];
        Workflow::new("session-1", "Finde Jobs in Berlin", steps)
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let wf = workflow();
        store.save_workflow(&wf).await.unwrap();

        let loaded = store.load_workflow(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "session-1");
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].tool.as_deref(), Some("job_search"));
        assert_eq!(loaded.steps[0].parameters["what"], json!("Entwickler"));
    }

    #[tokio::test]
    async fn test_step_update_and_unique_numbering() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let wf = workflow();
        store.save_workflow(&wf).await.unwrap();

        let mut step = wf.steps[0].clone();
        step.complete(json!({"jobs": [{"title": "Dev"}]}));
        store.update_step(wf.id, &step).await.unwrap();

        let loaded = store.load_workflow(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].status, StepStatus::Completed);
        assert_eq!(loaded.steps[0].result.as_ref().unwrap()["jobs"][0]["title"], json!("Dev"));
    }

    #[tokio::test]
    async fn test_crash_leaves_running_step() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let mut wf = workflow();
        wf.status = WorkflowStatus::Running;
        wf.steps[0].status = StepStatus::Running;
        store.save_workflow(&wf).await.unwrap();

        // Simulated crash: nothing else is written. Re-attach sees the
        // step still running, never a phantom completion.
        let loaded = store.load_workflow(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps[0].status, StepStatus::Running);
        assert!(loaded.steps[0].result.is_none());

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_status_events_cursor() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let first = StatusEvent::new("s-1", "started");
        let cursor = first.timestamp;
        store.append(first).await.unwrap();

        let mut second = StatusEvent::new("s-1", "step 1 done");
        second.timestamp = cursor + chrono::Duration::milliseconds(50);
        store.append(second).await.unwrap();

        let after = store.events_since("s-1", Some(cursor)).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].message, "step 1 done");
    }

    #[tokio::test]
    async fn test_usage_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let record = UsageRecord::new("u-1", "gemini-2.5-flash", "workflow", 800, 200, 150_000);
        store.record_usage(&record).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        assert_eq!(store.usage_since("u-1", cutoff).await.unwrap(), 1000);
        assert_eq!(store.usage_since("u-2", cutoff).await.unwrap(), 0);

        let records = store.usage_records("u-1", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cost_micros, 150);
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        assert_eq!(store.settings("u-1").await.unwrap(), TokenSettings::default());

        let mut custom = TokenSettings::default();
        custom.warning_threshold_percent = 60;
        store.put_settings("u-1", &custom).await.unwrap();

        assert_eq!(store.settings("u-1").await.unwrap().warning_threshold_percent, 60);
    }
}
