//! Document commands.

use super::{parse_filter, StoreArgs};
use anyhow::{bail, Context, Result};
use colored::Colorize;
use docbridge_core::index::IndexKey;
use docbridge_core::{FindOptions, SortKey};

/// Run the count command.
pub async fn count(store: &StoreArgs, collection: &str, filter: Option<&str>) -> Result<()> {
    let filter = parse_filter(filter)?;
    let db = store.open().await?;
    let n = db.collection(collection).count_documents(&filter).await?;
    println!("{}", n.to_string().green());
    Ok(())
}

/// Run the find command.
pub async fn find(
    store: &StoreArgs,
    collection: &str,
    filter: Option<&str>,
    limit: u64,
    sort: &[String],
) -> Result<()> {
    let filter = parse_filter(filter)?;
    let mut options = FindOptions::new().limit(limit);
    for key in sort {
        let key = IndexKey::parse(key)?;
        options = options.sort(SortKey {
            field: key.field,
            direction: key.direction,
        });
    }

    let db = store.open().await?;
    let mut cursor = db.collection(collection).find(&filter, &options).await?;
    let mut shown = 0;
    while let Some(record) = cursor.next_raw().await? {
        let id = record.id;
        let doc = serde_json::Value::Object(record.into_map());
        println!("{} {}", id.to_string().blue(), serde_json::to_string_pretty(&doc)?);
        shown += 1;
    }

    if shown == 0 {
        println!("{} No documents found.", "→".yellow());
    }
    Ok(())
}

/// Run the insert command.
pub async fn insert(store: &StoreArgs, collection: &str, document: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(document).context("document is not valid JSON")?;
    let serde_json::Value::Object(map) = value else {
        bail!("document must be a JSON object");
    };

    let db = store.open().await?;
    let id = db.collection(collection).insert_one(map).await?;
    println!("{} Inserted {}", "✓".green(), id.to_string().yellow());
    Ok(())
}
