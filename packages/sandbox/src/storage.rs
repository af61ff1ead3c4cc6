// ABOUTME: State Store for environments, executions and the per-environment event log
// ABOUTME: StateStore trait plus the SQLite implementation with deadline-bounded queries

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_storage::{Result, StorageError};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::types::{
    Environment, EnvironmentEvent, EnvironmentFilter, EnvironmentStatus, EventType, Execution,
    ExecutionFilter, ExecutionStatus,
};

const DEFAULT_QUERY_DEADLINE: Duration = Duration::from_secs(10);

/// Durable record of environments, executions and reconciliation bookkeeping
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn upsert_environment(&self, env: &Environment) -> Result<()>;
    async fn get_environment(&self, id: &str) -> Result<Environment>;
    async fn list_environments(&self, filter: &EnvironmentFilter) -> Result<Vec<Environment>>;
    /// Removes the record together with its executions and events
    async fn delete_environment(&self, id: &str) -> Result<()>;
    /// Stamps `last_activity_at` on a running environment without touching any other column.
    /// Returns `false` when the environment is missing or no longer running.
    async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Returns `false` when the stored execution is already terminal and was left untouched
    async fn upsert_execution(&self, exec: &Execution) -> Result<bool>;
    async fn get_execution(&self, id: &str) -> Result<Execution>;
    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>>;
    async fn delete_execution(&self, id: &str) -> Result<()>;

    async fn append_event(&self, event: &EnvironmentEvent) -> Result<()>;
    /// Newest first
    async fn list_events(&self, environment_id: &str, limit: u32) -> Result<Vec<EnvironmentEvent>>;
}

pub struct SqliteStateStore {
    pool: SqlitePool,
    deadline: Duration,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            deadline: DEFAULT_QUERY_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.deadline, fut)
            .await
            .map_err(|_| StorageError::Timeout(self.deadline))?
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    fn row_to_environment(row: &SqliteRow) -> Result<Environment> {
        Ok(Environment {
            id: row.get("id"),
            name: row.get("name"),
            image: row.get("image"),
            resources: serde_json::from_str(&row.get::<String, _>("resources"))?,
            status: EnvironmentStatus::from_str(&row.get::<String, _>("status"))?,
            namespace: row.get("namespace"),
            pod_name: row.get("pod_name"),
            isolation: json_column(row, "isolation")?,
            node_affinity: json_column(row, "node_affinity")?,
            standby_pool: json_column(row, "standby_pool")?,
            labels: json_column::<BTreeMap<String, String>>(row, "labels")?.unwrap_or_default(),
            env_vars: json_column::<BTreeMap<String, String>>(row, "env_vars")?
                .unwrap_or_default(),
            owner_id: row.get("owner_id"),
            created_at: timestamp(row, "created_at")?,
            started_at: optional_timestamp(row, "started_at")?,
            terminated_at: optional_timestamp(row, "terminated_at")?,
            last_activity_at: optional_timestamp(row, "last_activity_at")?,
            retry_count: row.get::<i64, _>("retry_count") as u32,
            last_error: row.get("last_error"),
            last_attempt_at: optional_timestamp(row, "last_attempt_at")?,
        })
    }

    fn row_to_execution(row: &SqliteRow) -> Result<Execution> {
        Ok(Execution {
            id: row.get("id"),
            environment_id: row.get("environment_id"),
            command: serde_json::from_str(&row.get::<String, _>("command"))?,
            env_vars: json_column::<BTreeMap<String, String>>(row, "env_vars")?.unwrap_or_default(),
            timeout_secs: row.get::<i64, _>("timeout_secs") as u64,
            status: ExecutionStatus::from_str(&row.get::<String, _>("status"))?,
            owner_id: row.get("owner_id"),
            namespace: row.get("namespace"),
            pod_name: row.get("pod_name"),
            from_standby: row.get("from_standby"),
            created_at: timestamp(row, "created_at")?,
            queued_at: optional_timestamp(row, "queued_at")?,
            started_at: optional_timestamp(row, "started_at")?,
            completed_at: optional_timestamp(row, "completed_at")?,
            exit_code: row.get("exit_code"),
            stdout: row.get("stdout"),
            stderr: row.get("stderr"),
            error: row.get("error"),
            duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|d| d as u64),
        })
    }

    fn row_to_event(row: &SqliteRow) -> Result<EnvironmentEvent> {
        Ok(EnvironmentEvent {
            id: Some(row.get("id")),
            environment_id: row.get("environment_id"),
            event_type: EventType::from_str(&row.get::<String, _>("event_type"))?,
            message: row.get("message"),
            detail: json_column(row, "detail")?,
            created_at: timestamp(row, "created_at")?,
        })
    }
}

fn timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let value: String = row.get(column);
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp {
            column: column.to_string(),
            value,
        })
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    match row.get::<Option<String>, _>(column) {
        Some(value) => DateTime::parse_from_rfc3339(&value)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| StorageError::InvalidTimestamp {
                column: column.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

fn json_column<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    match row.get::<Option<String>, _>(column) {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StorageError::from)
}

fn placeholders(count: usize, start: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

const TERMINAL_EXECUTION_STATUSES: &str = "('completed', 'failed', 'canceled')";

#[async_trait]
impl StateStore for SqliteStateStore {
    // ========================================================================
    // ENVIRONMENT OPERATIONS
    // ========================================================================

    async fn upsert_environment(&self, env: &Environment) -> Result<()> {
        let resources = serde_json::to_string(&env.resources)?;
        let isolation = to_json_opt(&env.isolation)?;
        let node_affinity = to_json_opt(&env.node_affinity)?;
        let standby_pool = to_json_opt(&env.standby_pool)?;
        let labels = serde_json::to_string(&env.labels)?;
        let env_vars = serde_json::to_string(&env.env_vars)?;

        self.bounded(async {
            sqlx::query(
                r#"
                INSERT INTO environments (
                    id, name, image, resources, status, namespace, pod_name,
                    isolation, node_affinity, standby_pool, labels, env_vars,
                    owner_id, created_at, started_at, terminated_at, last_activity_at,
                    retry_count, last_error, last_attempt_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                    ?8, ?9, ?10, ?11, ?12,
                    ?13, ?14, ?15, ?16, ?17,
                    ?18, ?19, ?20
                )
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    image = excluded.image,
                    resources = excluded.resources,
                    status = excluded.status,
                    pod_name = excluded.pod_name,
                    isolation = excluded.isolation,
                    node_affinity = excluded.node_affinity,
                    standby_pool = excluded.standby_pool,
                    labels = excluded.labels,
                    env_vars = excluded.env_vars,
                    started_at = excluded.started_at,
                    terminated_at = excluded.terminated_at,
                    last_activity_at = excluded.last_activity_at,
                    retry_count = excluded.retry_count,
                    last_error = excluded.last_error,
                    last_attempt_at = excluded.last_attempt_at
                "#,
            )
            .bind(&env.id)
            .bind(&env.name)
            .bind(&env.image)
            .bind(&resources)
            .bind(env.status.as_str())
            .bind(&env.namespace)
            .bind(&env.pod_name)
            .bind(&isolation)
            .bind(&node_affinity)
            .bind(&standby_pool)
            .bind(&labels)
            .bind(&env_vars)
            .bind(&env.owner_id)
            .bind(env.created_at.to_rfc3339())
            .bind(env.started_at.map(|d| d.to_rfc3339()))
            .bind(env.terminated_at.map(|d| d.to_rfc3339()))
            .bind(env.last_activity_at.map(|d| d.to_rfc3339()))
            .bind(env.retry_count as i64)
            .bind(&env.last_error)
            .bind(env.last_attempt_at.map(|d| d.to_rfc3339()))
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_environment(&self, id: &str) -> Result<Environment> {
        let row = self
            .bounded(async {
                Ok(sqlx::query("SELECT * FROM environments WHERE id = ?1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?)
            })
            .await?;

        match row {
            Some(row) => Self::row_to_environment(&row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    async fn list_environments(&self, filter: &EnvironmentFilter) -> Result<Vec<Environment>> {
        let mut query = String::from("SELECT * FROM environments WHERE 1=1");
        let mut param_count = 0;

        if !filter.statuses.is_empty() {
            query.push_str(&format!(
                " AND status IN ({})",
                placeholders(filter.statuses.len(), param_count + 1)
            ));
            param_count += filter.statuses.len();
        }
        if filter.owner_id.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND owner_id = ?{}", param_count));
        }
        query.push_str(" ORDER BY created_at ASC, id ASC");

        let rows = self
            .bounded(async {
                let mut q = sqlx::query(&query);
                for status in &filter.statuses {
                    q = q.bind(status.as_str());
                }
                if let Some(owner) = &filter.owner_id {
                    q = q.bind(owner);
                }
                Ok(q.fetch_all(&self.pool).await?)
            })
            .await?;

        // Label matching happens after decoding since labels are a JSON blob
        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for row in &rows {
            let env = Self::row_to_environment(row)?;
            if filter
                .labels
                .iter()
                .all(|(k, v)| env.labels.get(k) == Some(v))
            {
                out.push(env);
            }
        }
        Ok(out.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_environment(&self, id: &str) -> Result<()> {
        let result = self
            .bounded(async {
                Ok(sqlx::query("DELETE FROM environments WHERE id = ?1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?)
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = self
            .bounded(async {
                Ok(sqlx::query(
                    "UPDATE environments SET last_activity_at = ?2 WHERE id = ?1 AND status = ?3",
                )
                .bind(id)
                .bind(at.to_rfc3339())
                .bind(EnvironmentStatus::Running.as_str())
                .execute(&self.pool)
                .await?)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // EXECUTION OPERATIONS
    // ========================================================================

    async fn upsert_execution(&self, exec: &Execution) -> Result<bool> {
        let command = serde_json::to_string(&exec.command)?;
        let env_vars = serde_json::to_string(&exec.env_vars)?;

        let sql = format!(
            r#"
            INSERT INTO executions (
                id, environment_id, command, env_vars, timeout_secs, status, owner_id,
                namespace, pod_name, from_standby,
                created_at, queued_at, started_at, completed_at,
                exit_code, stdout, stderr, error, duration_ms
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10,
                ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19
            )
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                namespace = excluded.namespace,
                pod_name = excluded.pod_name,
                from_standby = excluded.from_standby,
                queued_at = excluded.queued_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                exit_code = excluded.exit_code,
                stdout = excluded.stdout,
                stderr = excluded.stderr,
                error = excluded.error,
                duration_ms = excluded.duration_ms
            WHERE executions.status NOT IN {}
            "#,
            TERMINAL_EXECUTION_STATUSES
        );

        let result = self
            .bounded(async {
                Ok(sqlx::query(&sql)
                    .bind(&exec.id)
                    .bind(&exec.environment_id)
                    .bind(&command)
                    .bind(&env_vars)
                    .bind(exec.timeout_secs as i64)
                    .bind(exec.status.as_str())
                    .bind(&exec.owner_id)
                    .bind(&exec.namespace)
                    .bind(&exec.pod_name)
                    .bind(exec.from_standby)
                    .bind(exec.created_at.to_rfc3339())
                    .bind(exec.queued_at.map(|d| d.to_rfc3339()))
                    .bind(exec.started_at.map(|d| d.to_rfc3339()))
                    .bind(exec.completed_at.map(|d| d.to_rfc3339()))
                    .bind(exec.exit_code)
                    .bind(&exec.stdout)
                    .bind(&exec.stderr)
                    .bind(&exec.error)
                    .bind(exec.duration_ms.map(|d| d as i64))
                    .execute(&self.pool)
                    .await?)
            })
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_execution(&self, id: &str) -> Result<Execution> {
        let row = self
            .bounded(async {
                Ok(sqlx::query("SELECT * FROM executions WHERE id = ?1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?)
            })
            .await?;

        match row {
            Some(row) => Self::row_to_execution(&row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut query = String::from("SELECT * FROM executions WHERE 1=1");
        let mut param_count = 0;

        if filter.environment_id.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND environment_id = ?{}", param_count));
        }
        if !filter.statuses.is_empty() {
            query.push_str(&format!(
                " AND status IN ({})",
                placeholders(filter.statuses.len(), param_count + 1)
            ));
            param_count += filter.statuses.len();
        }
        if filter.owner_id.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND owner_id = ?{}", param_count));
        }
        query.push_str(" ORDER BY created_at DESC, id DESC");
        query.push_str(&format!(
            " LIMIT ?{} OFFSET ?{}",
            param_count + 1,
            param_count + 2
        ));

        let rows = self
            .bounded(async {
                let mut q = sqlx::query(&query);
                if let Some(env_id) = &filter.environment_id {
                    q = q.bind(env_id);
                }
                for status in &filter.statuses {
                    q = q.bind(status.as_str());
                }
                if let Some(owner) = &filter.owner_id {
                    q = q.bind(owner);
                }
                // SQLite treats a negative LIMIT as unbounded
                q = q
                    .bind(filter.limit.map(|l| l as i64).unwrap_or(-1))
                    .bind(filter.offset.unwrap_or(0) as i64);
                Ok(q.fetch_all(&self.pool).await?)
            })
            .await?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn delete_execution(&self, id: &str) -> Result<()> {
        let result = self
            .bounded(async {
                Ok(sqlx::query("DELETE FROM executions WHERE id = ?1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?)
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // EVENT LOG
    // ========================================================================

    async fn append_event(&self, event: &EnvironmentEvent) -> Result<()> {
        let detail = to_json_opt(&event.detail)?;

        self.bounded(async {
            sqlx::query(
                r#"
                INSERT INTO environment_events (environment_id, event_type, message, detail, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&event.environment_id)
            .bind(event.event_type.as_str())
            .bind(&event.message)
            .bind(&detail)
            .bind(event.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_events(&self, environment_id: &str, limit: u32) -> Result<Vec<EnvironmentEvent>> {
        let rows = self
            .bounded(async {
                Ok(sqlx::query(
                    r#"
                    SELECT id, environment_id, event_type, message, detail, created_at
                    FROM environment_events
                    WHERE environment_id = ?1
                    ORDER BY id DESC
                    LIMIT ?2
                    "#,
                )
                .bind(environment_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?)
            })
            .await?;

        rows.iter().map(Self::row_to_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IsolationPolicy, ResourceSpec, StandbyPoolPolicy};
    use pretty_assertions::assert_eq;

    async fn setup_store() -> SqliteStateStore {
        let pool = corral_storage::connect_in_memory().await.unwrap();
        SqliteStateStore::new(pool)
    }

    fn sample_environment(id: &str) -> Environment {
        Environment {
            id: id.to_string(),
            name: format!("sb-{}", id),
            image: "python:3.11-slim".to_string(),
            resources: ResourceSpec::default(),
            status: EnvironmentStatus::Pending,
            namespace: format!("corral-{}", id),
            pod_name: None,
            isolation: Some(IsolationPolicy {
                runtime_class: Some("gvisor".to_string()),
                ..Default::default()
            }),
            node_affinity: None,
            standby_pool: Some(StandbyPoolPolicy {
                enabled: true,
                size: 2,
                min_ready: 1,
            }),
            labels: BTreeMap::from([("team".to_string(), "infra".to_string())]),
            env_vars: BTreeMap::new(),
            owner_id: "user-1".to_string(),
            created_at: Utc::now(),
            started_at: None,
            terminated_at: None,
            last_activity_at: None,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    fn sample_execution(id: &str, env_id: &str) -> Execution {
        Execution {
            id: id.to_string(),
            environment_id: env_id.to_string(),
            command: vec!["echo".to_string(), "hi".to_string()],
            env_vars: BTreeMap::new(),
            timeout_secs: 30,
            status: ExecutionStatus::Pending,
            owner_id: "user-1".to_string(),
            namespace: None,
            pod_name: None,
            from_standby: false,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
            duration_ms: None,
        }
    }

    #[tokio::test]
    async fn test_environment_upsert_roundtrip() {
        let store = setup_store().await;
        let mut env = sample_environment("env-a");
        store.upsert_environment(&env).await.unwrap();

        env.status = EnvironmentStatus::Failed;
        env.retry_count = 3;
        env.last_error = Some("image pull backoff".to_string());
        store.upsert_environment(&env).await.unwrap();

        let loaded = store.get_environment("env-a").await.unwrap();
        assert_eq!(loaded.status, EnvironmentStatus::Failed);
        assert_eq!(loaded.retry_count, 3);
        assert_eq!(loaded.last_error.as_deref(), Some("image pull backoff"));
        assert_eq!(loaded.isolation, env.isolation);
        assert_eq!(loaded.standby_pool, env.standby_pool);
        assert_eq!(loaded.labels, env.labels);
    }

    #[tokio::test]
    async fn test_get_missing_environment_is_not_found() {
        let store = setup_store().await;
        let err = store.get_environment("env-missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_environments_filters_and_pages() {
        let store = setup_store().await;
        for i in 0..5 {
            let mut env = sample_environment(&format!("env-{}", i));
            if i % 2 == 0 {
                env.status = EnvironmentStatus::Running;
            }
            if i == 4 {
                env.labels.insert("team".to_string(), "ml".to_string());
            }
            store.upsert_environment(&env).await.unwrap();
        }

        let running = store
            .list_environments(&EnvironmentFilter::with_statuses(&[
                EnvironmentStatus::Running,
            ]))
            .await
            .unwrap();
        assert_eq!(running.len(), 3);

        let infra = store
            .list_environments(&EnvironmentFilter {
                labels: BTreeMap::from([("team".to_string(), "infra".to_string())]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(infra.len(), 4);

        let page = store
            .list_environments(&EnvironmentFilter {
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_touch_activity_only_stamps_running_environments() {
        let store = setup_store().await;
        let mut env = sample_environment("env-a");
        env.status = EnvironmentStatus::Running;
        store.upsert_environment(&env).await.unwrap();

        let at = Utc::now();
        assert!(store.touch_activity("env-a", at).await.unwrap());
        let loaded = store.get_environment("env-a").await.unwrap();
        assert_eq!(
            loaded.last_activity_at.map(|t| t.timestamp()),
            Some(at.timestamp())
        );
        assert_eq!(loaded.status, EnvironmentStatus::Running);

        env.status = EnvironmentStatus::Terminating;
        store.upsert_environment(&env).await.unwrap();
        assert!(!store.touch_activity("env-a", Utc::now()).await.unwrap());
        assert_eq!(
            store.get_environment("env-a").await.unwrap().status,
            EnvironmentStatus::Terminating
        );
        assert!(!store.touch_activity("env-missing", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_execution_is_immutable() {
        let store = setup_store().await;
        store
            .upsert_environment(&sample_environment("env-a"))
            .await
            .unwrap();

        let mut exec = sample_execution("exec-1", "env-a");
        assert!(store.upsert_execution(&exec).await.unwrap());

        exec.status = ExecutionStatus::Completed;
        exec.exit_code = Some(0);
        exec.stdout = Some("hi\n".to_string());
        assert!(store.upsert_execution(&exec).await.unwrap());

        exec.status = ExecutionStatus::Failed;
        exec.exit_code = Some(1);
        assert!(!store.upsert_execution(&exec).await.unwrap());

        let loaded = store.get_execution("exec-1").await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.exit_code, Some(0));
        assert_eq!(loaded.stdout.as_deref(), Some("hi\n"));
    }

    #[tokio::test]
    async fn test_list_executions_by_status() {
        let store = setup_store().await;
        store
            .upsert_environment(&sample_environment("env-a"))
            .await
            .unwrap();

        let mut running = sample_execution("exec-1", "env-a");
        running.status = ExecutionStatus::Running;
        store.upsert_execution(&running).await.unwrap();
        store
            .upsert_execution(&sample_execution("exec-2", "env-a"))
            .await
            .unwrap();

        let active = store
            .list_executions(&ExecutionFilter {
                statuses: vec![ExecutionStatus::Running],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "exec-1");

        let all = store
            .list_executions(&ExecutionFilter {
                environment_id: Some("env-a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_events_newest_first_and_removed_with_environment() {
        let store = setup_store().await;
        store
            .upsert_environment(&sample_environment("env-a"))
            .await
            .unwrap();

        store
            .append_event(&EnvironmentEvent::new("env-a", EventType::Created, "created"))
            .await
            .unwrap();
        store
            .append_event(
                &EnvironmentEvent::new("env-a", EventType::ProvisionFailed, "boom")
                    .with_detail(serde_json::json!({ "attempt": 1 })),
            )
            .await
            .unwrap();

        let events = store.list_events("env-a", 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::ProvisionFailed);
        assert_eq!(events[0].detail, Some(serde_json::json!({ "attempt": 1 })));

        store.delete_environment("env-a").await.unwrap();
        assert!(store.list_events("env-a", 10).await.unwrap().is_empty());
    }
}
