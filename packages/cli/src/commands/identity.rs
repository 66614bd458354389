use anyhow::Result;
use colored::Colorize;
use dialoguer::Confirm;

use crate::config::Config;
use crate::local::LocalState;

/// Show the client identity
pub fn show() -> Result<()> {
    let config = Config::load().unwrap_or_default();
    let local = LocalState::open(&config)?;
    let identity = local.identity();

    println!("{}", "Client Identity".bold());
    println!("{}", "─".repeat(60));
    println!("  ID:      {}", identity.id.bold());
    println!("  Source:  {:?}", identity.derived_from);
    println!("  Storage: {}", local.store().base_dir().display().to_string().dimmed());
    match local.username()? {
        Some(username) => println!("  User:    {}", username),
        None => println!("  User:    {}", "not logged in".dimmed()),
    }

    Ok(())
}

/// Discard the identity and derive a new one
pub fn reset(yes: bool) -> Result<()> {
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt("The server will see this agent as a new client. Continue?")
            .default(false)
            .interact()?;
        if !confirmed {
            println!("{}", "Aborted.".dimmed());
            return Ok(());
        }
    }

    let config = Config::load().unwrap_or_default();
    let local = LocalState::open(&config)?;
    let previous = local.identity();
    let identity = local.reset_identity();

    println!("{} Identity reset", "✓".green().bold());
    println!("  Old: {}", previous.id.dimmed());
    println!("  New: {}", identity.id.bold());

    Ok(())
}
