use anyhow::{bail, Context, Result};
use colored::Colorize;
use dialoguer::{Input, Password};
use serde::{Deserialize, Serialize};

use crate::api::ApiClient;
use crate::config::Config;
use crate::local::LocalState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

/// Prompt for whatever was not given on the command line
pub fn prompt_username(username: Option<String>) -> Result<String> {
    let username = match username {
        Some(username) => username,
        None => Input::new().with_prompt("Username").interact_text()?,
    };
    if username.trim().is_empty() {
        bail!("Username cannot be empty");
    }
    Ok(username.trim().to_string())
}

/// Handle the login command
pub async fn run(api_url: Option<String>, username: Option<String>) -> Result<()> {
    println!("{}", "Crawl Agent Login".bold());
    println!();

    let mut config = Config::load().unwrap_or_default();
    if let Some(url) = api_url {
        config.api_url = Some(url);
    }

    let local = LocalState::open(&config)?;
    let identity = local.identity();

    let username = prompt_username(username)?;
    let password: String = Password::new().with_prompt("Password").interact()?;
    if password.is_empty() {
        bail!("Password cannot be empty");
    }

    let api = ApiClient::from_config(&config, None)?;
    let data: LoginData = api
        .post(
            "/login",
            &Credentials {
                username: username.clone(),
                password,
                client_id: identity.id.clone(),
            },
        )
        .await?
        .context("Login succeeded but no token was returned")?;

    local.save_session(&data.token, &username)?;
    config.save()?;

    println!();
    println!(
        "{} Logged in to {} as {}",
        "✓".green().bold(),
        config.api_url(),
        username.bold()
    );
    println!("  Client ID: {}", identity.id.dimmed());
    println!(
        "  Restart {} to connect with the new session",
        "crawl-agent".bold()
    );

    Ok(())
}
