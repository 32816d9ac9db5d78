//! Test utilities for docbridge.
//!
//! Provides reusable fixtures and store constructors.

use crate::config::StoreConfig;
use crate::json::Map;
use crate::storage::{connect, Database, NativeDatabase, SqliteDatabase};
use serde_json::{json, Value};
use std::sync::Arc;

/// Test fixture for creating sample documents.
pub struct TestFixtures;

impl TestFixtures {
    /// Convert a JSON object literal into a payload.
    pub fn doc(value: Value) -> Map {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture is not an object: {}", other),
        }
    }

    /// A user document with nested settings.
    pub fn user(name: &str, age: u32) -> Map {
        Self::doc(json!({
            "name": name,
            "age": age,
            "email": format!("{}@example.com", name.to_lowercase()),
            "settings": {"theme": "dark", "notifications": true},
        }))
    }

    /// An article with text and tags.
    pub fn article(title: &str, body: &str, tags: &[&str]) -> Map {
        Self::doc(json!({
            "title": title,
            "body": body,
            "tags": tags,
        }))
    }

    /// Unit-ish vector pointing mostly along `axis`.
    pub fn axis_vector(dimensions: usize, axis: usize) -> Vec<f32> {
        (0..dimensions)
            .map(|i| if i == axis { 1.0 } else { 0.05 })
            .collect()
    }
}

/// Create an in-memory SQLite store for testing.
pub async fn test_sqlite() -> Arc<SqliteDatabase> {
    SqliteDatabase::in_memory()
        .await
        .expect("Failed to create in-memory SQLite store")
}

/// Create a native document store for testing.
pub async fn test_native() -> Arc<NativeDatabase> {
    NativeDatabase::connect(&StoreConfig::document())
        .await
        .expect("Failed to start document engine")
}

/// Both backends behind the shared trait.
pub async fn test_backends() -> Vec<Arc<dyn Database>> {
    vec![
        connect(&StoreConfig::sqlite_in_memory())
            .await
            .expect("Failed to create SQLite store"),
        connect(&StoreConfig::document())
            .await
            .expect("Failed to start document engine"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;

    #[test]
    fn test_user_fixture() {
        let user = TestFixtures::user("Alice", 30);
        assert_eq!(user["name"], "Alice");
        assert_eq!(user["email"], "alice@example.com");
        assert_eq!(user["settings"]["theme"], "dark");
    }

    #[test]
    fn test_axis_vector() {
        let v = TestFixtures::axis_vector(4, 2);
        assert_eq!(v.len(), 4);
        assert_eq!(v[2], 1.0);
    }

    #[tokio::test]
    async fn test_backends_fixture() {
        let backends = test_backends().await;
        assert_eq!(backends[0].backend(), Backend::Sqlite);
        assert_eq!(backends[1].backend(), Backend::Document);
        assert!(test_sqlite().await.ping().await.is_ok());
        assert!(test_native().await.ping().await.is_ok());
    }
}
