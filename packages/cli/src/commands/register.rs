use anyhow::{bail, Result};
use colored::Colorize;
use dialoguer::Password;
use serde_json::Value;

use crate::api::ApiClient;
use crate::commands::login::{prompt_username, Credentials};
use crate::config::Config;
use crate::local::LocalState;

/// Handle the register command
pub async fn run(username: Option<String>) -> Result<()> {
    println!("{}", "Create a Crawl Agent account".bold());
    println!();

    let config = Config::load().unwrap_or_default();
    let local = LocalState::open(&config)?;

    let username = prompt_username(username)?;
    let password: String = Password::new()
        .with_prompt("Password")
        .with_confirmation("Confirm password", "Passwords do not match")
        .interact()?;
    if password.is_empty() {
        bail!("Password cannot be empty");
    }

    let api = ApiClient::from_config(&config, None)?;
    let _: Option<Value> = api
        .post(
            "/register",
            &Credentials {
                username: username.clone(),
                password,
                client_id: local.identity().id,
            },
        )
        .await?;

    println!();
    println!("{} Account {} created", "✓".green().bold(), username.bold());
    println!("  Run {} to sign in", "crawlctl login".bold());

    Ok(())
}
