//! `haven context` commands

use anyhow::Result;
use colored::Colorize;
use haven_core::{Config, Context, ContextRegistry, ContextUpdate};
use tabled::{settings::Style, Table, Tabled};

/// Register a new context
pub fn create(
    config: &Config,
    name: &str,
    subscription_name: &str,
    admin_group_name: &str,
    description: &str,
) -> Result<()> {
    let mut registry = ContextRegistry::load(config.contexts_path())?;
    let context = Context::new(name, subscription_name, admin_group_name, description)?;
    registry.add(context)?;
    registry.save()?;

    println!("{} Created context {}", "✓".green().bold(), name.bold());
    Ok(())
}

/// Show one context with its derived resource names
pub fn show(config: &Config, name: &str) -> Result<()> {
    let registry = ContextRegistry::load(config.contexts_path())?;
    let context = registry.get(name)?;

    println!("{}", context.name().bold());
    println!("  Subscription:       {}", context.subscription_name());
    println!("  Admin group:        {}", context.admin_group_name());
    println!("  Description:        {}", context.description());
    println!("  Resource group:     {}", context.resource_group_name());
    println!("  Storage account:    {}", context.storage_account_name());
    println!("  Key vault:          {}", context.key_vault_name());
    println!("  Managed identity:   {}", context.managed_identity_name());
    println!("  Hub stack:          {}", context.hub_stack_id());
    Ok(())
}

/// List every context
pub fn list(config: &Config) -> Result<()> {
    let registry = ContextRegistry::load(config.contexts_path())?;

    #[derive(Tabled)]
    struct ContextRow {
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "SUBSCRIPTION")]
        subscription: String,
        #[tabled(rename = "ADMIN GROUP")]
        admin_group: String,
        #[tabled(rename = "DESCRIPTION")]
        description: String,
    }

    let rows: Vec<ContextRow> = registry
        .list()
        .map(|c| ContextRow {
            name: c.name().to_string(),
            subscription: c.subscription_name().to_string(),
            admin_group: c.admin_group_name().to_string(),
            description: c.description().to_string(),
        })
        .collect();

    if rows.is_empty() {
        println!("No contexts found.");
        return Ok(());
    }

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
    Ok(())
}

/// Change the description or admin group of a context
pub fn migrate(
    config: &Config,
    name: &str,
    admin_group_name: Option<String>,
    description: Option<String>,
) -> Result<()> {
    if admin_group_name.is_none() && description.is_none() {
        println!("Nothing to change.");
        return Ok(());
    }

    let mut registry = ContextRegistry::load(config.contexts_path())?;
    registry.migrate(name, ContextUpdate { admin_group_name, description })?;
    registry.save()?;

    println!("{} Migrated context {}", "✓".green().bold(), name.bold());
    Ok(())
}
