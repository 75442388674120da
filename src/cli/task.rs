//! Task subcommands. These operate on the local replica directly; a
//! running daemon picks changes up on its next dispatch tick, and peers
//! converge through anti-entropy.

use anyhow::{bail, Context, Result};
use comfy_table::Table;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::models::{Config, NodeId, NodeRole, Task, TaskStatus};
use crate::domain::ports::{state_keys, NodeStateRepository, TaskFilter, TaskRepository};
use crate::infrastructure::database::{
    apply_migrations, open_store, SqliteAgentRepository, SqliteNodeStateRepository,
    SqliteTaskRepository,
};
use crate::mesh::{GossipEngine, LamportClock, MeshIdentity, TcpMesh};
use crate::services::TaskQueue;

/// Local handle over the node database, with an offline (peerless) gossip
/// engine so queue mutations still follow the stamp-persist-publish path.
pub struct LocalQueue {
    pub node_id: NodeId,
    pub tasks: Arc<dyn TaskRepository>,
    pub queue: TaskQueue,
}

pub async fn open_local_queue(config: &Config) -> Result<LocalQueue> {
    let pool = open_store(&config.database_path(), config.database.max_connections)
        .await
        .context("failed to open database")?;
    apply_migrations(&pool).await.context("failed to run migrations")?;

    let node_state = SqliteNodeStateRepository::new(pool.clone());
    let node_id = match node_state.get(state_keys::NODE_ID).await? {
        Some(id) => NodeId::from_string(id),
        None => {
            let id = NodeId::generate();
            node_state.put(state_keys::NODE_ID, id.as_str()).await?;
            id
        }
    };
    let clock_start = node_state
        .get(state_keys::LAMPORT_CLOCK)
        .await?
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let agents = Arc::new(SqliteAgentRepository::new(pool.clone()));
    let (mesh, _events) = TcpMesh::new(
        MeshIdentity {
            node_id: node_id.clone(),
            http_port: config.node.http_port,
            role: NodeRole::parse_str(&config.node.role).unwrap_or_default(),
        },
        None,
        1,
    );
    let queue = TaskQueue::new(
        node_id.clone(),
        Arc::new(LamportClock::new(clock_start)),
        tasks.clone(),
        agents,
        Arc::new(GossipEngine::new(mesh)),
    );

    Ok(LocalQueue { node_id, tasks, queue })
}

fn parse_task_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid task id: {raw}"))
}

#[allow(clippy::too_many_arguments)]
pub async fn handle_submit(
    config: &Config,
    title: String,
    description: String,
    priority: i64,
    capabilities: Vec<String>,
    depends_on: Vec<String>,
    test_command: Option<String>,
    project_path: Option<String>,
    json: bool,
) -> Result<()> {
    let local = open_local_queue(config).await?;

    let mut task = Task::new(title, description, local.node_id.clone())
        .with_priority(priority)
        .with_capabilities(capabilities);
    for dep in depends_on {
        task = task.with_dependency(parse_task_id(&dep)?);
    }
    task.test_command = test_command;
    task.project_path = project_path;

    let task = local.queue.submit(task).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!("Submitted task {} ({})", task.id, task.title);
    }
    Ok(())
}

pub async fn handle_list(
    config: &Config,
    status: Option<String>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let local = open_local_queue(config).await?;
    let status = match status {
        Some(raw) => match TaskStatus::from_str(&raw) {
            Some(status) => Some(status),
            None => bail!("unknown status: {raw}"),
        },
        None => None,
    };
    let tasks = local
        .tasks
        .list(TaskFilter { status, limit: Some(limit), ..Default::default() })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Title", "Status", "Priority", "Parent", "Attempts"]);
    for task in tasks {
        table.add_row(vec![
            task.id.to_string()[..8].to_string(),
            task.title.chars().take(48).collect(),
            task.status.as_str().to_string(),
            task.priority.to_string(),
            task.parent_id.map_or_else(|| "-".to_string(), |p| p.to_string()[..8].to_string()),
            task.merge_attempts.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn handle_show(config: &Config, task_id: String, json: bool) -> Result<()> {
    let local = open_local_queue(config).await?;
    let id = parse_task_id(&task_id)?;
    let Some(task) = local.tasks.get(id).await? else {
        bail!("task not found: {task_id}");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["id".to_string(), task.id.to_string()]);
    table.add_row(vec!["title".to_string(), task.title.clone()]);
    table.add_row(vec!["status".to_string(), task.status.as_str().to_string()]);
    table.add_row(vec!["priority".to_string(), task.priority.to_string()]);
    table.add_row(vec![
        "assigned_to".to_string(),
        task.assigned_to.map_or_else(|| "-".to_string(), |a| a.to_string()),
    ]);
    table.add_row(vec![
        "review".to_string(),
        task.review_status.map_or("-", |r| r.as_str()).to_string(),
    ]);
    table.add_row(vec!["merge_attempts".to_string(), task.merge_attempts.to_string()]);
    table.add_row(vec![
        "depends_on".to_string(),
        if task.depends_on.is_empty() {
            "-".to_string()
        } else {
            task.depends_on.iter().map(|d| d.to_string()[..8].to_string()).collect::<Vec<_>>().join(", ")
        },
    ]);
    table.add_row(vec!["branch".to_string(), task.git_branch.clone().unwrap_or_else(|| "-".to_string())]);
    table.add_row(vec!["pr_url".to_string(), task.pr_url.clone().unwrap_or_else(|| "-".to_string())]);
    table.add_row(vec!["lamport_ts".to_string(), task.lamport_ts.to_string()]);
    println!("{table}");

    if let Some(result) = &task.result {
        println!("\nResult:\n{result}");
    }
    if let Some(error) = &task.error {
        println!("\nError:\n{error}");
    }
    if let Some(feedback) = &task.review_feedback {
        println!("\nReview feedback:\n{feedback}");
    }
    Ok(())
}

pub async fn handle_cancel(config: &Config, task_id: String, json: bool) -> Result<()> {
    let local = open_local_queue(config).await?;
    let id = parse_task_id(&task_id)?;
    let task = local.queue.cancel(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!("Cancelled task {}", task.id);
    }
    Ok(())
}
