//! SQLite implementation of the `TaskRepository`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Complexity, NodeId, ReviewStatus, Task, TaskStatus};
use crate::domain::ports::{TaskFilter, TaskRepository};

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_dependencies(&self, task: &mut Task) -> DomainResult<()> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = ? ORDER BY depends_on")
                .bind(task.id.to_string())
                .fetch_all(&self.pool)
                .await?;
        task.depends_on = rows
            .into_iter()
            .filter_map(|(id,)| Uuid::parse_str(&id).ok())
            .collect();
        Ok(())
    }

    async fn replace_dependencies(&self, task: &Task) -> DomainResult<()> {
        sqlx::query("DELETE FROM task_dependencies WHERE task_id = ?")
            .bind(task.id.to_string())
            .execute(&self.pool)
            .await?;
        for dep in &task.depends_on {
            self.add_dependency(task.id, *dep).await?;
        }
        Ok(())
    }

    async fn rows_to_tasks(&self, rows: Vec<TaskRow>) -> DomainResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task: Task = row.try_into()?;
            self.load_dependencies(&mut task).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        let caps_json = serde_json::to_string(&task.required_capabilities)?;

        sqlx::query(
            r#"INSERT INTO tasks (id, parent_id, title, description, status, priority, complexity,
               required_capabilities, assigned_to, result, error, progress, project_path, context,
               work_instructions, acceptance_criteria, review_status, review_feedback, archived,
               git_branch, merge_attempts, test_command, auto_merge, pr_url, origin_node,
               lamport_ts, claimed_at, completed_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(task.parent_id.map(|id| id.to_string()))
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.complexity.as_str())
        .bind(&caps_json)
        .bind(task.assigned_to.map(|id| id.to_string()))
        .bind(&task.result)
        .bind(&task.error)
        .bind(&task.progress)
        .bind(&task.project_path)
        .bind(&task.context)
        .bind(&task.work_instructions)
        .bind(&task.acceptance_criteria)
        .bind(task.review_status.map(|r| r.as_str()))
        .bind(&task.review_feedback)
        .bind(i64::from(task.archived))
        .bind(&task.git_branch)
        .bind(i64::from(task.merge_attempts))
        .bind(&task.test_command)
        .bind(i64::from(task.auto_merge))
        .bind(&task.pr_url)
        .bind(task.origin_node.as_str())
        .bind(ts_to_i64(task.lamport_ts))
        .bind(task.claimed_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        for dep_id in &task.depends_on {
            self.add_dependency(task.id, *dep_id).await?;
        }

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let mut task = r.try_into()?;
                self.load_dependencies(&mut task).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, task: &Task) -> DomainResult<()> {
        let caps_json = serde_json::to_string(&task.required_capabilities)?;

        let result = sqlx::query(
            r#"UPDATE tasks SET parent_id = ?, title = ?, description = ?, status = ?, priority = ?,
               complexity = ?, required_capabilities = ?, assigned_to = ?, result = ?, error = ?,
               progress = ?, project_path = ?, context = ?, work_instructions = ?,
               acceptance_criteria = ?, review_status = ?, review_feedback = ?, archived = ?,
               git_branch = ?, merge_attempts = ?, test_command = ?, auto_merge = ?, pr_url = ?,
               origin_node = ?, lamport_ts = ?, claimed_at = ?, completed_at = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(task.parent_id.map(|id| id.to_string()))
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.complexity.as_str())
        .bind(&caps_json)
        .bind(task.assigned_to.map(|id| id.to_string()))
        .bind(&task.result)
        .bind(&task.error)
        .bind(&task.progress)
        .bind(&task.project_path)
        .bind(&task.context)
        .bind(&task.work_instructions)
        .bind(&task.acceptance_criteria)
        .bind(task.review_status.map(|r| r.as_str()))
        .bind(&task.review_feedback)
        .bind(i64::from(task.archived))
        .bind(&task.git_branch)
        .bind(i64::from(task.merge_attempts))
        .bind(&task.test_command)
        .bind(i64::from(task.auto_merge))
        .bind(&task.pr_url)
        .bind(task.origin_node.as_str())
        .bind(ts_to_i64(task.lamport_ts))
        .bind(task.claimed_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.updated_at.to_rfc3339())
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task.id));
        }

        Ok(())
    }

    async fn upsert_replica(&self, task: &Task) -> DomainResult<bool> {
        let caps_json = serde_json::to_string(&task.required_capabilities)?;

        // Last-writer-wins on the (lamport_ts, origin_node) tuple. The
        // conflict guard rejects stale and identical writes, so replaying a
        // record is a no-op.
        let result = sqlx::query(
            r#"INSERT INTO tasks (id, parent_id, title, description, status, priority, complexity,
               required_capabilities, assigned_to, result, error, progress, project_path, context,
               work_instructions, acceptance_criteria, review_status, review_feedback, archived,
               git_branch, merge_attempts, test_command, auto_merge, pr_url, origin_node,
               lamport_ts, claimed_at, completed_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 parent_id = excluded.parent_id,
                 title = excluded.title,
                 description = excluded.description,
                 status = excluded.status,
                 priority = excluded.priority,
                 complexity = excluded.complexity,
                 required_capabilities = excluded.required_capabilities,
                 assigned_to = excluded.assigned_to,
                 result = excluded.result,
                 error = excluded.error,
                 progress = excluded.progress,
                 project_path = excluded.project_path,
                 context = excluded.context,
                 work_instructions = excluded.work_instructions,
                 acceptance_criteria = excluded.acceptance_criteria,
                 review_status = excluded.review_status,
                 review_feedback = excluded.review_feedback,
                 archived = excluded.archived,
                 git_branch = excluded.git_branch,
                 merge_attempts = excluded.merge_attempts,
                 test_command = excluded.test_command,
                 auto_merge = excluded.auto_merge,
                 pr_url = excluded.pr_url,
                 origin_node = excluded.origin_node,
                 lamport_ts = excluded.lamport_ts,
                 claimed_at = excluded.claimed_at,
                 completed_at = excluded.completed_at,
                 updated_at = excluded.updated_at
               WHERE excluded.lamport_ts > tasks.lamport_ts
                  OR (excluded.lamport_ts = tasks.lamport_ts
                      AND excluded.origin_node > tasks.origin_node)"#,
        )
        .bind(task.id.to_string())
        .bind(task.parent_id.map(|id| id.to_string()))
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.complexity.as_str())
        .bind(&caps_json)
        .bind(task.assigned_to.map(|id| id.to_string()))
        .bind(&task.result)
        .bind(&task.error)
        .bind(&task.progress)
        .bind(&task.project_path)
        .bind(&task.context)
        .bind(&task.work_instructions)
        .bind(&task.acceptance_criteria)
        .bind(task.review_status.map(|r| r.as_str()))
        .bind(&task.review_feedback)
        .bind(i64::from(task.archived))
        .bind(&task.git_branch)
        .bind(i64::from(task.merge_attempts))
        .bind(&task.test_command)
        .bind(i64::from(task.auto_merge))
        .bind(&task.pr_url)
        .bind(task.origin_node.as_str())
        .bind(ts_to_i64(task.lamport_ts))
        .bind(task.claimed_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            self.replace_dependencies(task).await?;
        }
        Ok(applied)
    }

    async fn try_claim(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        node_id: &NodeId,
        lamport_ts: u64,
    ) -> DomainResult<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"UPDATE tasks SET status = 'claimed', assigned_to = ?, origin_node = ?,
               lamport_ts = ?, claimed_at = ?, updated_at = ?
               WHERE id = ? AND status IN ('pending', 'blocked') AND assigned_to IS NULL"#,
        )
        .bind(agent_id.to_string())
        .bind(node_id.as_str())
        .bind(ts_to_i64(lamport_ts))
        .bind(&now)
        .bind(&now)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(parent_id) = &filter.parent_id {
            query.push_str(" AND parent_id = ?");
            bindings.push(parent_id.to_string());
        }
        if let Some(assigned_to) = &filter.assigned_to {
            query.push_str(" AND assigned_to = ?");
            bindings.push(assigned_to.to_string());
        }
        if !filter.include_archived {
            query.push_str(" AND archived = 0");
        }

        query.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<TaskRow> = q.fetch_all(&self.pool).await?;
        self.rows_to_tasks(rows).await
    }

    async fn subtasks(&self, parent_id: Uuid) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE parent_id = ? AND archived = 0 ORDER BY created_at, id")
                .bind(parent_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        self.rows_to_tasks(rows).await
    }

    async fn list_dispatchable(&self, limit: usize) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT * FROM tasks
               WHERE status IN ('pending', 'blocked') AND parent_id IS NOT NULL AND archived = 0
               ORDER BY priority DESC, created_at ASC, id ASC
               LIMIT ?"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        self.rows_to_tasks(rows).await
    }

    async fn active_for_agent(&self, agent_id: Uuid) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT * FROM tasks WHERE assigned_to = ?
               AND status IN ('claimed', 'in_progress', 'waiting_input', 'pending_review')"#,
        )
        .bind(agent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        self.rows_to_tasks(rows).await
    }

    async fn add_dependency(&self, task_id: Uuid, depends_on: Uuid) -> DomainResult<()> {
        if task_id == depends_on {
            return Err(DomainError::DependencyCycle(task_id));
        }
        sqlx::query("INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?, ?)")
            .bind(task_id.to_string())
            .bind(depends_on.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dependencies(&self, task_id: Uuid) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT t.* FROM tasks t
               INNER JOIN task_dependencies d ON d.depends_on = t.id
               WHERE d.task_id = ?"#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        self.rows_to_tasks(rows).await
    }

    async fn dependents(&self, task_id: Uuid) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT t.* FROM tasks t
               INNER JOIN task_dependencies d ON d.task_id = t.id
               WHERE d.depends_on = ?"#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        self.rows_to_tasks(rows).await
    }

    async fn since(&self, lamport_ts: u64) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE lamport_ts > ? ORDER BY lamport_ts")
                .bind(ts_to_i64(lamport_ts))
                .fetch_all(&self.pool)
                .await?;
        self.rows_to_tasks(rows).await
    }

    async fn max_lamport_ts(&self) -> DomainResult<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(lamport_ts), 0) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.max(0).unsigned_abs())
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<TaskStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks WHERE archived = 0 GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = HashMap::new();
        for (status, count) in rows {
            if let Some(status) = TaskStatus::from_str(&status) {
                counts.insert(status, count.max(0).unsigned_abs());
            }
        }
        Ok(counts)
    }

    async fn archive(&self, id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("UPDATE tasks SET archived = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(id));
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)]
fn ts_to_i64(ts: u64) -> i64 {
    ts as i64
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    parent_id: Option<String>,
    title: String,
    description: String,
    status: String,
    priority: i64,
    complexity: String,
    required_capabilities: String,
    assigned_to: Option<String>,
    result: Option<String>,
    error: Option<String>,
    progress: Option<String>,
    project_path: Option<String>,
    context: Option<String>,
    work_instructions: Option<String>,
    acceptance_criteria: Option<String>,
    review_status: Option<String>,
    review_feedback: Option<String>,
    archived: i64,
    git_branch: Option<String>,
    merge_attempts: i64,
    test_command: Option<String>,
    auto_merge: i64,
    pr_url: Option<String>,
    origin_node: String,
    lamport_ts: i64,
    claimed_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::ValidationFailed(format!("unknown task status: {}", row.status)))?;
        let complexity = Complexity::parse_str(&row.complexity).unwrap_or_default();
        let review_status = row.review_status.as_deref().and_then(ReviewStatus::parse_str);

        Ok(Task {
            id: parse_uuid(&row.id)?,
            parent_id: row.parent_id.as_deref().map(parse_uuid).transpose()?,
            title: row.title,
            description: row.description,
            status,
            priority: row.priority,
            complexity,
            required_capabilities: serde_json::from_str(&row.required_capabilities)?,
            assigned_to: row.assigned_to.as_deref().map(parse_uuid).transpose()?,
            result: row.result,
            error: row.error,
            progress: row.progress,
            project_path: row.project_path,
            context: row.context,
            work_instructions: row.work_instructions,
            acceptance_criteria: row.acceptance_criteria,
            review_status,
            review_feedback: row.review_feedback,
            archived: row.archived != 0,
            git_branch: row.git_branch,
            merge_attempts: u32::try_from(row.merge_attempts.max(0)).unwrap_or(u32::MAX),
            test_command: row.test_command,
            depends_on: Vec::new(),
            auto_merge: row.auto_merge != 0,
            pr_url: row.pr_url,
            origin_node: NodeId::from_string(row.origin_node),
            lamport_ts: row.lamport_ts.max(0).unsigned_abs(),
            claimed_at: parse_optional_datetime(row.claimed_at.as_deref())?,
            completed_at: parse_optional_datetime(row.completed_at.as_deref())?,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DomainError> {
    Uuid::parse_str(s).map_err(|_| DomainError::ValidationFailed(format!("invalid uuid: {s}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| DomainError::ValidationFailed(format!("invalid timestamp: {s}")))
}

fn parse_optional_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, DomainError> {
    s.map(parse_datetime).transpose()
}
