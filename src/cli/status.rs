//! The `status` command: summarize the local replica.

use anyhow::{Context, Result};
use comfy_table::Table;
use serde_json::json;

use crate::domain::models::{Config, TaskStatus};
use crate::infrastructure::database::{
    apply_migrations, open_store, SqliteAgentRepository, SqliteNodeRepository,
    SqliteTaskRepository,
};
use crate::domain::ports::{AgentRepository, NodeRepository, TaskRepository};

pub async fn handle_status(config: &Config, json: bool) -> Result<()> {
    let pool = open_store(&config.database_path(), config.database.max_connections)
        .await
        .context("failed to open database")?;
    apply_migrations(&pool).await?;

    let tasks = SqliteTaskRepository::new(pool.clone());
    let agents = SqliteAgentRepository::new(pool.clone());
    let nodes = SqliteNodeRepository::new(pool.clone());

    let counts = tasks.count_by_status().await?;
    let agent_list = agents.list().await?;
    let node_list = nodes.list().await?;

    if json {
        let counts_json: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(status, count)| (status.as_str().to_string(), json!(count)))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "tasks": counts_json,
                "agents": agent_list,
                "nodes": node_list,
            }))?
        );
        return Ok(());
    }

    let mut queue_table = Table::new();
    queue_table.set_header(vec!["Status", "Count"]);
    let order = [
        TaskStatus::Pending,
        TaskStatus::Planning,
        TaskStatus::Blocked,
        TaskStatus::Claimed,
        TaskStatus::InProgress,
        TaskStatus::WaitingInput,
        TaskStatus::PendingReview,
        TaskStatus::Merging,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];
    for status in order {
        if let Some(count) = counts.get(&status) {
            queue_table.add_row(vec![status.as_str().to_string(), count.to_string()]);
        }
    }
    println!("Task queue:\n{queue_table}");

    let mut node_table = Table::new();
    node_table.set_header(vec!["Node", "Role", "Status", "Agents", "Active", "Last heartbeat"]);
    for node in node_list {
        node_table.add_row(vec![
            node.node_id.short().to_string(),
            node.role.as_str().to_string(),
            node.status.as_str().to_string(),
            node.agent_count.to_string(),
            node.active_task_count.to_string(),
            node.last_heartbeat.to_rfc3339(),
        ]);
    }
    println!("\nNodes:\n{node_table}");

    let mut agent_table = Table::new();
    agent_table.set_header(vec!["Agent", "Node", "Status", "Current task"]);
    for agent in agent_list {
        agent_table.add_row(vec![
            agent.name.clone(),
            agent.node_id.short().to_string(),
            agent.status.as_str().to_string(),
            agent
                .current_task_id
                .map_or_else(|| "-".to_string(), |t| t.to_string()[..8].to_string()),
        ]);
    }
    println!("\nAgents:\n{agent_table}");
    Ok(())
}
