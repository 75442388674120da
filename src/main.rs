//! VoidLux CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;

use voidlux::cli::{start, status, task, Cli, Commands, TaskCommands};
use voidlux::infrastructure::config::ConfigLoader;
use voidlux::infrastructure::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::load().context("Failed to load configuration")?;

    match cli.command {
        Commands::Start { p2p_port, discovery_port, seeds, data_dir, role, http_port } => {
            start::apply_overrides(
                &mut config,
                start::StartOverrides { p2p_port, discovery_port, seeds, data_dir, role, http_port },
            );
            logging::init(&config.logging)?;
            start::handle_start(config).await?;
        }
        Commands::Task(task_cmd) => match task_cmd {
            TaskCommands::Submit {
                title,
                description,
                priority,
                capabilities,
                depends_on,
                test_command,
                project_path,
            } => {
                task::handle_submit(
                    &config,
                    title,
                    description,
                    priority,
                    capabilities,
                    depends_on,
                    test_command,
                    project_path,
                    cli.json,
                )
                .await?;
            }
            TaskCommands::List { status, limit } => {
                task::handle_list(&config, status, limit, cli.json).await?;
            }
            TaskCommands::Show { task_id } => {
                task::handle_show(&config, task_id, cli.json).await?;
            }
            TaskCommands::Cancel { task_id } => {
                task::handle_cancel(&config, task_id, cli.json).await?;
            }
        },
        Commands::Status => {
            status::handle_status(&config, cli.json).await?;
        }
    }

    Ok(())
}
