use anyhow::Result;
use colored::Colorize;
use serde_json::{json, Value};

use crate::api::ApiClient;
use crate::config::Config;
use crate::local::LocalState;

/// Handle the logout command. The local session is cleared even when the
/// server cannot be reached.
pub async fn run() -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let local = LocalState::open(&config)?;

    let Some(token) = local.token()? else {
        println!("{}", "Not logged in.".dimmed());
        return Ok(());
    };

    let api = ApiClient::from_config(&config, Some(&token))?;
    let result: Result<Option<Value>> = api
        .post("/logout", &json!({ "clientId": local.identity().id }))
        .await;
    if let Err(e) = result {
        println!("{} Server logout failed: {}", "!".yellow().bold(), e);
    }

    local.clear_session()?;
    println!("{} Logged out", "✓".green().bold());

    Ok(())
}
