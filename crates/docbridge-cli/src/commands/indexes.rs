//! Index commands.

use super::StoreArgs;
use anyhow::Result;
use colored::Colorize;
use docbridge_core::index::IndexKey;
use docbridge_core::{Direction, Index};

/// Options of the create-index command.
pub struct IndexArgs {
    pub keys: Vec<String>,
    pub name: Option<String>,
    pub unique: bool,
    pub sparse: bool,
    pub ttl: Option<u64>,
}

impl IndexArgs {
    fn to_index(&self) -> Result<Index> {
        let mut index = Index::new();
        for key in &self.keys {
            let key = IndexKey::parse(key)?;
            index = index.key(key.field, key.direction);
        }
        if let Some(name) = &self.name {
            index = index.name(name.clone());
        }
        if self.unique {
            index = index.unique();
        }
        if self.sparse {
            index = index.sparse();
        }
        if let Some(ttl) = self.ttl {
            index = index.ttl(ttl);
        }
        Ok(index)
    }
}

/// Run the indexes command.
pub async fn list(store: &StoreArgs, collection: &str) -> Result<()> {
    let db = store.open().await?;
    let indexes = db.collection(collection).list_indexes().await?;

    println!("{} Indexes on {}:", "→".blue(), collection.cyan());
    for index in indexes {
        let keys: Vec<String> = index
            .keys
            .iter()
            .map(|k| match k.direction {
                Direction::Ascending => k.field.clone(),
                Direction::Descending => format!("{} desc", k.field),
            })
            .collect();
        let mut flags = Vec::new();
        if index.unique {
            flags.push("unique".to_string());
        }
        if index.sparse {
            flags.push("sparse".to_string());
        }
        if let Some(ttl) = index.ttl {
            flags.push(format!("ttl {}s", ttl));
        }
        println!(
            "  {} {} ({}) {}",
            "•".dimmed(),
            index.name_str().yellow(),
            keys.join(", "),
            flags.join(" ").dimmed()
        );
    }
    Ok(())
}

/// Run the create-index command.
pub async fn create(store: &StoreArgs, collection: &str, args: IndexArgs) -> Result<()> {
    let index = args.to_index()?;
    let db = store.open().await?;
    let name = db.collection(collection).create_index(&index).await?;
    println!("{} Index {} ready on {}", "✓".green(), name.yellow(), collection.cyan());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_args() {
        let args = IndexArgs {
            keys: vec!["email".to_string(), "created:-1".to_string()],
            name: None,
            unique: true,
            sparse: false,
            ttl: None,
        };
        let index = args.to_index().unwrap().normalized().unwrap();
        assert_eq!(index.name_str(), "created_-1_email_1");
        assert!(index.unique);
    }
}
