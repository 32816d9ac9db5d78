//! Store and collection commands.

use super::StoreArgs;
use anyhow::Result;
use colored::Colorize;
use docbridge_core::Filter;

/// Run the ping command.
pub async fn ping(store: &StoreArgs) -> Result<()> {
    let db = store.open().await?;
    db.ping().await?;
    println!(
        "{} {} store is reachable",
        "✓".green(),
        db.backend().as_str()
    );
    db.close().await?;
    Ok(())
}

/// Run the collections command.
pub async fn list(store: &StoreArgs) -> Result<()> {
    let db = store.open().await?;
    let names = db.list_collections().await?;

    if names.is_empty() {
        println!("{} No collections.", "→".yellow());
        return Ok(());
    }

    println!("{} {} collections:", "→".blue(), names.len());
    for name in names {
        let count = db.collection(&name).count_documents(&Filter::all()).await?;
        println!("  {} {} ({})", "•".dimmed(), name.cyan(), count.to_string().green());
    }
    Ok(())
}

/// Run the drop command.
pub async fn drop(store: &StoreArgs, collection: &str) -> Result<()> {
    let db = store.open().await?;
    db.drop_collection(collection).await?;
    println!("{} Dropped collection {}", "✓".green(), collection.yellow());
    Ok(())
}
