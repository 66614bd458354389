use anyhow::{bail, Context, Result};
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use crawl_agent::connection::protocol::ScheduledTaskSpec;
use crawl_agent::schedule::period;

use crate::api::ApiClient;
use crate::config::Config;
use crate::local::LocalState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest<'a> {
    client_id: &'a str,
    tasks: &'a [ScheduledTaskSpec],
}

/// Read a JSON array of scheduled tasks
pub fn read_tasks(path: &Path) -> Result<Vec<ScheduledTaskSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let tasks: Vec<ScheduledTaskSpec> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of scheduled tasks", path.display()))?;

    for task in &tasks {
        if task.task_key.trim().is_empty() {
            bail!("Every task needs a taskKey");
        }
        if let Err(e) = regex::Regex::new(&task.domain) {
            bail!("Task '{}' has an invalid domain pattern: {}", task.task_key, e);
        }
    }

    Ok(tasks)
}

fn session(config: &Config) -> Result<(ApiClient, String)> {
    let local = LocalState::open(config)?;
    let token = local.require_token()?;
    let api = ApiClient::from_config(config, Some(&token))?;
    Ok((api, local.identity().id))
}

/// List the scheduled tasks configured for this client
pub async fn list() -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let (api, client_id) = session(&config)?;

    let tasks: Vec<ScheduledTaskSpec> = api
        .get(&format!("/scheduled-task/list/{}", client_id))
        .await?
        .unwrap_or_default();

    if tasks.is_empty() {
        println!("{}", "No scheduled tasks.".dimmed());
        return Ok(());
    }

    println!("{}", "Scheduled Tasks".bold());
    println!("{}", "─".repeat(78));
    println!(
        "  {:<20} {:<16} {:<22} {:>6} {:<8} {:<5}",
        "KEY".dimmed(),
        "SCRIPT".dimmed(),
        "DOMAIN".dimmed(),
        "EVERY".dimmed(),
        "STATE".dimmed(),
        "IDLE".dimmed(),
    );
    println!("{}", "─".repeat(78));

    for task in &tasks {
        let state = if task.enabled {
            "enabled".green()
        } else {
            "disabled".dimmed()
        };
        let every = format!("{}m", period(task.interval).as_secs() / 60);
        let idle = if task.execute_on_idle { "yes" } else { "no" };

        println!(
            "  {:<20} {:<16} {:<22} {:>6} {:<8} {:<5}",
            task.task_key, task.script_id, task.domain, every, state, idle,
        );
        if let Some(name) = &task.task_name {
            println!("    {}", name.dimmed());
        }
    }

    println!();
    println!("{} task(s)", tasks.len());

    Ok(())
}

/// Replace the server-side task set with the contents of `file`
pub async fn sync(file: &Path) -> Result<()> {
    let tasks = read_tasks(file)?;
    let config = Config::load().unwrap_or_default();
    let (api, client_id) = session(&config)?;

    let _: Option<Value> = api
        .post(
            "/scheduled-task/sync",
            &SyncRequest {
                client_id: &client_id,
                tasks: &tasks,
            },
        )
        .await?;

    println!("{} Synced {} task(s)", "✓".green().bold(), tasks.len());
    println!("  The agent picks them up with the next scheduled_task_config push");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_read_tasks() {
        let file = write(
            r#"[{"taskKey":"daily","scriptId":"s1","domain":"example\\.com$","interval":3600000}]"#,
        );
        let tasks = read_tasks(file.path()).unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].enabled);
        assert!(!tasks[0].execute_on_idle);
    }

    #[test]
    fn test_read_tasks_rejects_bad_domain() {
        let file = write(r#"[{"taskKey":"x","scriptId":"s1","domain":"(","interval":60000}]"#);
        assert!(read_tasks(file.path()).is_err());
    }

    #[test]
    fn test_sync_request_shape() {
        let tasks = Vec::new();
        let body = serde_json::to_value(SyncRequest {
            client_id: "client_1",
            tasks: &tasks,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"clientId": "client_1", "tasks": []}));
    }
}
