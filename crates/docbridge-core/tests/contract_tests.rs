//! Contract tests run against both backends.
//!
//! Every behaviour here must be indistinguishable between the document engine
//! and the SQLite adapter unless a test says otherwise.

use docbridge_core::storage::SqliteDatabase;
use docbridge_core::{
    connect, with_transaction, Backend, Collection, CollectionExt, Database, DistanceMetric, DocId,
    Document, Error, Filter, FindOptions, HybridQuery, Index, Map, Projection, Record, RecordMeta,
    SortKey, Stage, StoreConfig, Update, UpdateOptions, VectorField, VectorHit, VectorIndexType,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn doc(value: Value) -> Map {
    value.as_object().cloned().expect("fixture must be an object")
}

async fn backends() -> Vec<Arc<dyn Database>> {
    vec![
        connect(&StoreConfig::sqlite_in_memory()).await.unwrap(),
        connect(&StoreConfig::document()).await.unwrap(),
    ]
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct User {
    name: String,
    age: u32,
    #[serde(default)]
    tags: Vec<String>,
}

impl Record for User {}

/// Keeps its credential hash out of normal deserialization.
#[derive(Debug, Serialize, Deserialize)]
struct Account {
    email: String,
    #[serde(skip_deserializing)]
    password_hash: String,
}

impl Record for Account {
    fn reconcile(&mut self, payload: &Map, _meta: &RecordMeta) {
        if let Some(hash) = payload.get("password_hash").and_then(Value::as_str) {
            self.password_hash = hash.to_string();
        }
    }
}

/// Insert then read back by identity.
#[tokio::test]
async fn test_round_trip() {
    for db in backends().await {
        let users = db.collection("users");
        let id = users
            .insert_one(doc(json!({"name": "Alice", "age": 30, "tags": ["admin"]})))
            .await
            .unwrap();
        assert_eq!(id.to_hex().len(), 24);

        let record = users.find_by_id(&id).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.data["name"], "Alice");

        let user: User = users.find_one_as(&Filter::eq("name", "Alice")).await.unwrap();
        assert_eq!(
            user,
            User {
                name: "Alice".to_string(),
                age: 30,
                tags: vec!["admin".to_string()],
            }
        );

        let document: Document = users.find_one_as(&Filter::id(&id)).await.unwrap();
        assert_eq!(document.id, id);
        assert_eq!(document.get("age"), Some(&json!(30)));
    }
}

#[tokio::test]
async fn test_supplied_identity_is_kept() {
    for db in backends().await {
        let items = db.collection("items");
        let id = DocId::new();
        let returned = items
            .insert_one(doc(json!({"_id": id.to_hex(), "n": 1})))
            .await
            .unwrap();
        assert_eq!(returned, id);
        assert!(items.find_by_id(&id).await.is_ok());
    }
}

#[tokio::test]
async fn test_typed_insert() {
    for db in backends().await {
        let users = db.collection("users");
        let user = User {
            name: "Bob".to_string(),
            age: 41,
            tags: Vec::new(),
        };
        let id = users.insert(&user).await.unwrap();
        let back: User = users.find_one_as(&Filter::id(&id)).await.unwrap();
        assert_eq!(back, user);
    }
}

#[tokio::test]
async fn test_find_one_no_documents() {
    for db in backends().await {
        let err = db
            .collection("missing")
            .find_one(&Filter::eq("name", "nobody"))
            .await
            .unwrap_err();
        assert!(err.is_no_documents(), "{:?}", err);
    }
}

#[tokio::test]
async fn test_idempotent_indexing() {
    for db in backends().await {
        let users = db.collection("users");
        let first = users
            .create_index(&Index::new().asc("name").desc("age"))
            .await
            .unwrap();
        let second = users
            .create_index(&Index::new().desc("age").asc("name"))
            .await
            .unwrap();
        assert_eq!(first, "age_-1_name_1");
        assert_eq!(first, second);

        let indexes = users.list_indexes().await.unwrap();
        assert_eq!(indexes.len(), 2, "{:?} on {:?}", indexes, db.backend());
        assert_eq!(indexes[0].name_str(), "_id_");

        users.drop_index(&first).await.unwrap();
        assert_eq!(users.list_indexes().await.unwrap().len(), 1);
        assert!(users.drop_index("_id_").await.is_err());
        assert!(users.create_index(&Index::new()).await.is_err());
    }
}

#[tokio::test]
async fn test_unique_index_and_atomic_insert_many() {
    for db in backends().await {
        let users = db.collection("users");
        users
            .create_index(&Index::new().asc("email").unique())
            .await
            .unwrap();
        users
            .insert_one(doc(json!({"email": "a@example.com"})))
            .await
            .unwrap();

        let err = users
            .insert_many(vec![
                doc(json!({"email": "b@example.com"})),
                doc(json!({"email": "a@example.com"})),
            ])
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key(), "{:?}", err);
        assert_eq!(users.count_documents(&Filter::all()).await.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_nested_merge_preserves_siblings() {
    for db in backends().await {
        let users = db.collection("users");
        let id = users
            .insert_one(doc(json!({
                "name": "Carol",
                "settings": {"theme": "dark", "notifications": true, "limits": {"daily": 5}},
            })))
            .await
            .unwrap();

        let update = Update::new()
            .set("settings.auditing", true)
            .set("settings.limits.weekly", 20)
            .set("profile.address.city", "Oslo");
        let result = users
            .update_one(&Filter::id(&id), &update, &UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!((result.matched, result.modified), (1, 1));

        let record = users.find_by_id(&id).await.unwrap();
        assert_eq!(
            record.data["settings"],
            json!({
                "theme": "dark",
                "notifications": true,
                "auditing": true,
                "limits": {"daily": 5, "weekly": 20},
            })
        );
        assert_eq!(record.data["profile"], json!({"address": {"city": "Oslo"}}));
        assert_eq!(record.data["name"], "Carol");
    }
}

#[tokio::test]
async fn test_update_from_operator_document() {
    for db in backends().await {
        let users = db.collection("users");
        users
            .insert_many(vec![
                doc(json!({"team": "a", "active": false})),
                doc(json!({"team": "a", "active": false})),
                doc(json!({"team": "b", "active": false})),
            ])
            .await
            .unwrap();

        let update = Update::from_value(&json!({"$set": {"active": true}})).unwrap();
        let result = users
            .update_many(&Filter::eq("team", "a"), &update, &UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!((result.matched, result.modified), (2, 2));
        assert_eq!(
            users.count_documents(&Filter::eq("active", true)).await.unwrap(),
            2
        );
        assert!(Update::from_value(&json!({"$inc": {"n": 1}})).is_err());
    }
}

#[tokio::test]
async fn test_null_and_absence_are_equivalent() {
    for db in backends().await {
        let items = db.collection("items");
        items
            .insert_many(vec![
                doc(json!({"n": 1, "note": null})),
                doc(json!({"n": 2})),
                doc(json!({"n": 3, "note": "set"})),
            ])
            .await
            .unwrap();

        assert_eq!(items.count_documents(&Filter::is_null("note")).await.unwrap(), 2);
        assert_eq!(
            items.count_documents(&Filter::eq("note", Value::Null)).await.unwrap(),
            2
        );
        assert_eq!(items.count_documents(&Filter::eq("note", "set")).await.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_containment_and_typed_equality() {
    for db in backends().await {
        let articles = db.collection("articles");
        articles
            .insert_many(vec![
                doc(json!({"title": "one", "tags": ["rust", "db"], "meta": {"lang": "en", "draft": false}})),
                doc(json!({"title": "two", "tags": ["go"], "meta": {"lang": "en", "draft": true}})),
                doc(json!({"title": "3", "tags": [], "meta": {"lang": "de"}})),
            ])
            .await
            .unwrap();

        let rust = Filter::contains("tags", json!(["rust"]));
        assert_eq!(articles.count_documents(&rust).await.unwrap(), 1);
        let english = Filter::contains("meta", json!({"lang": "en"}));
        assert_eq!(articles.count_documents(&english).await.unwrap(), 2);
        let published = Filter::eq("meta.lang", "en").and(Filter::eq("meta.draft", false));
        assert_eq!(articles.count_documents(&published).await.unwrap(), 1);
        // "3" is a string, never the number 3
        assert_eq!(articles.count_documents(&Filter::eq("title", 3)).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_find_options_and_cursor_batches() {
    for db in backends().await {
        let items = db.collection("items");
        let docs = (0..25).map(|i| doc(json!({"n": i, "parity": i % 2}))).collect();
        items.insert_many(docs).await.unwrap();

        let options = FindOptions::new()
            .sort(SortKey::desc("n"))
            .skip(3)
            .limit(12)
            .batch_size(5)
            .projection(Projection::Include(vec!["n".to_string()]));
        let records = items
            .find(&Filter::all(), &options)
            .await
            .unwrap()
            .collect_raw()
            .await
            .unwrap();
        let ns: Vec<i64> = records
            .iter()
            .map(|r| r.data["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, (10..=21).rev().collect::<Vec<i64>>());
        assert!(records.iter().all(|r| !r.data.contains_key("parity")));

        let mut cursor = items
            .find(&Filter::eq("parity", 0), &FindOptions::new().batch_size(4))
            .await
            .unwrap();
        let mut seen = 0;
        while let Some(record) = cursor.next::<Map>().await.unwrap() {
            assert_eq!(record["parity"], 0);
            seen += 1;
        }
        assert_eq!(seen, 13);
        cursor.close();
        assert!(matches!(cursor.next_raw().await, Err(Error::CursorClosed)));
    }
}

#[tokio::test]
async fn test_updating_documents_while_iterating() {
    for db in backends().await {
        let jobs = db.collection("jobs");
        let docs = (0..6).map(|i| doc(json!({"n": i, "status": "pending"}))).collect();
        jobs.insert_many(docs).await.unwrap();

        let mut cursor = jobs
            .find(&Filter::eq("status", "pending"), &FindOptions::new().batch_size(2))
            .await
            .unwrap();
        let mut visited = Vec::new();
        while let Some(job) = cursor.next_raw().await.unwrap() {
            visited.push(job.data["n"].as_i64().unwrap());
            jobs.update_one(
                &Filter::id(&job.id),
                &Update::new().set("status", "done"),
                &UpdateOptions::default(),
            )
            .await
            .unwrap();
        }
        assert_eq!(visited, vec![0, 1, 2, 3, 4, 5], "{:?}", db.backend());
        assert_eq!(
            jobs.count_documents(&Filter::eq("status", "pending")).await.unwrap(),
            0
        );

        // Deleting as we go behaves the same way
        let mut cursor = jobs
            .find(&Filter::eq("status", "done"), &FindOptions::new().batch_size(4))
            .await
            .unwrap();
        let mut seen = 0;
        while let Some(job) = cursor.next_raw().await.unwrap() {
            jobs.delete_one(&Filter::id(&job.id)).await.unwrap();
            seen += 1;
        }
        assert_eq!(seen, 6, "{:?}", db.backend());
    }
}

#[tokio::test]
async fn test_decode_recovers_fields_skipped_by_serde() {
    for db in backends().await {
        let accounts = db.collection("accounts");
        let account = Account {
            email: "ops@example.com".to_string(),
            password_hash: "$argon2id$v=19$c2FsdA".to_string(),
        };
        accounts.insert(&account).await.unwrap();

        let back: Account = accounts
            .find_one_as(&Filter::eq("email", "ops@example.com"))
            .await
            .unwrap();
        assert_eq!(back.email, account.email);
        assert_eq!(back.password_hash, account.password_hash, "{:?}", db.backend());

        let mut cursor = accounts.find(&Filter::all(), &FindOptions::new()).await.unwrap();
        let listed: Account = cursor.next().await.unwrap().unwrap();
        assert_eq!(listed.password_hash, account.password_hash);
    }
}

#[tokio::test]
async fn test_close_rejects_further_calls() {
    for db in backends().await {
        let items = db.collection("items");
        items.insert_one(doc(json!({"n": 1}))).await.unwrap();

        db.close().await.unwrap();
        assert!(db.ping().await.is_err());
        let err = items.count_documents(&Filter::all()).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "{:?}", err);
        assert!(db
            .collection("other")
            .insert_one(doc(json!({"n": 2})))
            .await
            .is_err());
        assert!(db.begin().await.is_err());
    }
}

#[tokio::test]
async fn test_distinct_and_aggregate() {
    for db in backends().await {
        let orders = db.collection("orders");
        orders
            .insert_many(vec![
                doc(json!({"customer": "a", "status": "open", "total": 10})),
                doc(json!({"customer": "b", "status": "open", "total": 30})),
                doc(json!({"customer": "a", "status": "closed", "total": 20})),
            ])
            .await
            .unwrap();

        let mut customers = orders.distinct("customer", &Filter::all()).await.unwrap();
        customers.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
        assert_eq!(customers, vec![json!("a"), json!("b")]);

        let top = orders
            .aggregate(&[
                Stage::Match(Filter::eq("status", "open")),
                Stage::Sort(vec![SortKey::desc("total")]),
                Stage::Limit(1),
            ])
            .await
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0]["customer"], "b");

        let counted = orders
            .aggregate(&[
                Stage::Match(Filter::eq("customer", "a")),
                Stage::Count("orders".to_string()),
            ])
            .await
            .unwrap();
        assert_eq!(counted, vec![doc(json!({"orders": 2}))]);
    }
}

#[tokio::test]
async fn test_upsert_and_replace() {
    for db in backends().await {
        let pages = db.collection("pages");
        let result = pages
            .update_one(
                &Filter::eq("slug", "home"),
                &Update::new().set("title", "Home"),
                &UpdateOptions::upsert(),
            )
            .await
            .unwrap();
        assert_eq!(result.matched, 0);
        let id = result.upserted_id.expect("upsert should insert");

        let record = pages.find_by_id(&id).await.unwrap();
        assert_eq!(record.data["slug"], "home");
        assert_eq!(record.data["title"], "Home");

        let replaced = pages
            .replace_one(&Filter::id(&id), doc(json!({"slug": "home", "title": "Start"})))
            .await
            .unwrap();
        assert_eq!((replaced.matched, replaced.modified), (1, 1));
        let record = pages.find_by_id(&id).await.unwrap();
        assert_eq!(record.data["title"], "Start");
        assert_eq!(record.id, id);
    }
}

#[tokio::test]
async fn test_delete_hides_documents() {
    for db in backends().await {
        let items = db.collection("items");
        items
            .insert_many(vec![
                doc(json!({"kind": "x"})),
                doc(json!({"kind": "x"})),
                doc(json!({"kind": "y"})),
            ])
            .await
            .unwrap();
        assert_eq!(items.delete_one(&Filter::eq("kind", "x")).await.unwrap(), 1);
        assert_eq!(items.delete_many(&Filter::all()).await.unwrap(), 2);
        assert_eq!(items.count_documents(&Filter::all()).await.unwrap(), 0);
        assert!(items.find_one(&Filter::all()).await.unwrap_err().is_no_documents());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts() {
    const WRITERS: usize = 8;
    const PER_WRITER: usize = 25;

    for db in backends().await {
        let mut handles = Vec::new();
        for writer in 0..WRITERS {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let events = db.collection("events");
                for seq in 0..PER_WRITER {
                    events
                        .insert_one(doc(json!({"writer": writer, "seq": seq})))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let events = db.collection("events");
        assert_eq!(
            events.count_documents(&Filter::all()).await.unwrap(),
            (WRITERS * PER_WRITER) as u64
        );
        assert_eq!(
            events.count_documents(&Filter::eq("writer", 3)).await.unwrap(),
            PER_WRITER as u64
        );
    }
}

#[tokio::test]
async fn test_with_transaction_commit_and_rollback() {
    for db in backends().await {
        let committed = with_transaction(db.as_ref(), |tx| {
            Box::pin(async move {
                let accounts = tx.collection("accounts");
                accounts.insert_one(doc(json!({"owner": "a", "balance": 10}))).await?;
                accounts.insert_one(doc(json!({"owner": "b", "balance": 5}))).await
            })
        })
        .await;
        assert!(committed.is_ok());

        let failed: docbridge_core::Result<()> = with_transaction(db.as_ref(), |tx| {
            Box::pin(async move {
                tx.collection("accounts")
                    .insert_one(doc(json!({"owner": "c", "balance": 1})))
                    .await?;
                Err(Error::Other(anyhow::anyhow!("abort transfer")))
            })
        })
        .await;
        assert!(failed.is_err());

        let accounts = db.collection("accounts");
        assert_eq!(accounts.count_documents(&Filter::all()).await.unwrap(), 2);
        assert_eq!(accounts.count_documents(&Filter::eq("owner", "c")).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_collection_lifecycle() {
    for db in backends().await {
        db.create_collection("alpha").await.unwrap();
        db.collection("beta").insert_one(doc(json!({"n": 1}))).await.unwrap();
        let mut names = db.list_collections().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);

        db.drop_collection("beta").await.unwrap();
        assert_eq!(db.list_collections().await.unwrap(), vec!["alpha".to_string()]);
        assert_eq!(db.collection("beta").count_documents(&Filter::all()).await.unwrap(), 0);
        db.ping().await.unwrap();
    }
}

// -----------------------------------------------------------------------------
// Relational backend specifics
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_soft_delete_keeps_rows() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let users = db.sqlite_collection("users");
    let id = users.insert_one(doc(json!({"name": "Dan"}))).await.unwrap();

    assert_eq!(users.delete_one(&Filter::id(&id)).await.unwrap(), 1);
    assert!(users.find_by_id(&id).await.unwrap_err().is_no_documents());
    assert_eq!(users.count_documents(&Filter::all()).await.unwrap(), 0);
    assert_eq!(users.count_including_deleted(&Filter::all()).await.unwrap(), 1);

    // Soft-deleted rows are not updated either
    let result = users
        .update_many(&Filter::all(), &Update::new().set("name", "X"), &UpdateOptions::default())
        .await
        .unwrap();
    assert_eq!(result.matched, 0);

    assert_eq!(users.restore_many(&Filter::id(&id)).await.unwrap(), 1);
    let record = users.find_by_id(&id).await.unwrap();
    assert_eq!(record.data["name"], "Dan");
}

#[tokio::test]
async fn test_version_bumps_only_on_change() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let users = db.sqlite_collection("users");
    let id = users
        .insert_one(doc(json!({"name": "Eve", "created_by": "admin"})))
        .await
        .unwrap();

    let unchanged = users
        .update_one(&Filter::id(&id), &Update::new().set("name", "Eve"), &UpdateOptions::default())
        .await
        .unwrap();
    assert_eq!((unchanged.matched, unchanged.modified), (1, 0));
    let document: Document = users.find_one_as(&Filter::id(&id)).await.unwrap();
    assert_eq!(document.version, 1);
    assert_eq!(document.created_by.as_deref(), Some("admin"));

    let changed = users
        .update_one(
            &Filter::id(&id),
            &Update::new().set("name", "Eva").updated_by("ops"),
            &UpdateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(changed.modified, 1);
    let document: Document = users.find_one_as(&Filter::id(&id)).await.unwrap();
    assert_eq!(document.version, 2);
    assert_eq!(document.updated_by.as_deref(), Some("ops"));
    assert!(document.physical_key.is_some());

    let same = users
        .replace_one(&Filter::id(&id), doc(json!({"name": "Eva"})))
        .await
        .unwrap();
    assert_eq!(same.modified, 0);
    let document: Document = users.find_one_as(&Filter::id(&id)).await.unwrap();
    assert_eq!(document.version, 2);
}

#[tokio::test]
async fn test_uuid_identity_becomes_physical_key() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let users = db.sqlite_collection("users");
    let uuid = "8f14e45f-ceea-467f-a0e6-7a1c2b3d4e5f";
    let id = users
        .insert_one(doc(json!({"_id": uuid, "name": "Fay"})))
        .await
        .unwrap();
    let record = users.find_by_id(&id).await.unwrap();
    assert_eq!(
        record.meta.physical_key.map(|k| k.to_string()),
        Some(uuid.to_string())
    );
}

#[tokio::test]
async fn test_unsupported_filter_on_sqlite() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let users = db.collection("users");
    users.insert_one(doc(json!({"age": 5}))).await.unwrap();

    let filter = Filter::from_value(&json!({"age": {"$gt": 3}})).unwrap();
    let err = users.count_documents(&filter).await.unwrap_err();
    assert!(
        matches!(err, Error::UnsupportedFilter { backend: "sqlite", .. }),
        "{:?}",
        err
    );

    let native = connect(&StoreConfig::document()).await.unwrap();
    let people = native.collection("users");
    people.insert_one(doc(json!({"age": 5}))).await.unwrap();
    assert_eq!(people.count_documents(&filter).await.unwrap(), 1);
}

#[tokio::test]
async fn test_ambient_collection_inside_transaction_times_out() {
    let config = StoreConfig::sqlite_in_memory().with_op_timeout(Duration::from_millis(200));
    let db = SqliteDatabase::connect(&config).await.unwrap();
    assert_eq!(db.backend(), Backend::Sqlite);

    let tx = db.begin().await.unwrap();
    tx.collection("items").insert_one(doc(json!({"n": 1}))).await.unwrap();

    let err = db
        .collection("items")
        .count_documents(&Filter::all())
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "{:?}", err);

    tx.commit().await.unwrap();
    assert_eq!(
        db.collection("items").count_documents(&Filter::all()).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_file_persistence() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("store.db");

    let id = {
        let db = SqliteDatabase::open(&db_path).await.unwrap();
        let notes = db.collection("notes");
        notes
            .create_index(&Index::new().asc("title").unique())
            .await
            .unwrap();
        let id = notes.insert_one(doc(json!({"title": "persisted"}))).await.unwrap();
        db.close().await.unwrap();
        id
    };

    let db = SqliteDatabase::open(&db_path).await.unwrap();
    let notes = db.collection("notes");
    let record = notes.find_by_id(&id).await.unwrap();
    assert_eq!(record.data["title"], "persisted");
    assert_eq!(notes.list_indexes().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_vector_search_ranking() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let docs = db.sqlite_collection("docs");
    docs.add_vector_field(&VectorField::new("embedding", 3).metric(DistanceMetric::Cosine))
        .await
        .unwrap();
    // Re-adding the same field is a no-op
    docs.add_vector_field(&VectorField::new("embedding", 3)).await.unwrap();

    let vectors = [
        ("north", [0.0f32, 1.0, 0.0]),
        ("east", [1.0, 0.0, 0.0]),
        ("north-east", [0.7, 0.7, 0.0]),
        ("up", [0.0, 0.0, 1.0]),
    ];
    for (name, vector) in &vectors {
        let id = docs.insert_one(doc(json!({"name": name}))).await.unwrap();
        docs.set_vector(&id, "embedding", vector).await.unwrap();
        assert_eq!(docs.get_vector(&id, "embedding").await.unwrap(), Some(vector.to_vec()));
    }
    docs.insert_one(doc(json!({"name": "no-vector"}))).await.unwrap();

    let hits = docs
        .vector_search("embedding", &[0.9, 0.1, 0.0], 3, &Filter::all())
        .await
        .unwrap();
    let names: Vec<&str> = hits
        .iter()
        .map(|h| h.record.data["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["east", "north-east", "north"]);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));

    let filtered = docs
        .vector_search("embedding", &[0.9, 0.1, 0.0], 10, &Filter::eq("name", "up"))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);

    let err = docs
        .vector_search("embedding", &[1.0, 0.0], 3, &Filter::all())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Vector(_)));
}

#[tokio::test]
async fn test_vector_index_definition() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let docs = db.sqlite_collection("docs");
    docs.add_vector_field(
        &VectorField::new("embedding", 8)
            .metric(DistanceMetric::L2)
            .index(VectorIndexType::hnsw()),
    )
    .await
    .unwrap();

    let info = docs.create_vector_index("embedding").await.unwrap();
    assert_eq!(info.operator_class, "vector_l2_ops");
    assert!(info.definition.contains("USING hnsw"));
    assert!(info.definition.contains("m = 16, ef_construction = 64"));
    assert_eq!(docs.vector_index("embedding").await.unwrap(), Some(info));

    assert!(docs.drop_vector_index("embedding").await.unwrap());
    assert!(!docs.drop_vector_index("embedding").await.unwrap());
    assert_eq!(docs.vector_index("embedding").await.unwrap(), None);
    assert_eq!(docs.vector_fields().await.unwrap().len(), 1);
}

fn ns(hits: &[VectorHit]) -> Vec<i64> {
    hits.iter().map(|h| h.record.data["n"].as_i64().unwrap()).collect()
}

#[tokio::test]
async fn test_vector_index_matches_exact_scan() {
    for kind in [VectorIndexType::hnsw(), VectorIndexType::IvfFlat { lists: 2 }] {
        let db = SqliteDatabase::in_memory().await.unwrap();
        let points = db.sqlite_collection("points");
        points
            .add_vector_field(
                &VectorField::new("embedding", 4)
                    .metric(DistanceMetric::L2)
                    .index(kind),
            )
            .await
            .unwrap();
        for i in 0..50 {
            let angle = i as f32 * 0.41;
            let group = if i % 3 == 0 { "a" } else { "b" };
            let id = points
                .insert_one(doc(json!({"n": i, "group": group})))
                .await
                .unwrap();
            let vector = [angle.cos(), angle.sin(), (i % 5) as f32 * 0.2, 1.0];
            points.set_vector(&id, "embedding", &vector).await.unwrap();
        }

        let query = [0.3f32, -0.8, 0.4, 1.0];
        let in_group = Filter::eq("group", "a");
        let exact = points
            .vector_search("embedding", &query, 7, &Filter::all())
            .await
            .unwrap();
        let exact_in_group = points
            .vector_search("embedding", &query, 5, &in_group)
            .await
            .unwrap();

        points.create_vector_index("embedding").await.unwrap();
        let indexed = points
            .vector_search("embedding", &query, 7, &Filter::all())
            .await
            .unwrap();
        assert_eq!(ns(&indexed), ns(&exact), "{:?}", kind);
        assert!(indexed
            .iter()
            .zip(&exact)
            .all(|(a, b)| (a.distance - b.distance).abs() < 1e-9));
        let indexed_in_group = points
            .vector_search("embedding", &query, 5, &in_group)
            .await
            .unwrap();
        assert_eq!(ns(&indexed_in_group), ns(&exact_in_group), "{:?}", kind);

        // Writes after the index was built are searchable
        let id = points.insert_one(doc(json!({"n": 99}))).await.unwrap();
        points.set_vector(&id, "embedding", &query).await.unwrap();
        let nearest = points
            .vector_search("embedding", &query, 1, &Filter::all())
            .await
            .unwrap();
        assert_eq!(ns(&nearest), vec![99]);

        let all = points
            .hybrid_search(
                &HybridQuery::new("label", "none", "embedding", query.to_vec())
                    .alpha(1.0)
                    .limit(usize::MAX),
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 51);
        assert_eq!(all[0].record.data["n"], 99);
    }
}

#[tokio::test]
async fn test_hybrid_search() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let articles = db.sqlite_collection("articles");
    articles
        .add_vector_field(&VectorField::new("embedding", 2))
        .await
        .unwrap();

    let rows = [
        ("rust storage engine in rust", [1.0f32, 0.0]),
        ("cooking with rust pans", [0.0, 1.0]),
        ("vector databases", [0.9, 0.1]),
    ];
    for (body, vector) in &rows {
        let id = articles.insert_one(doc(json!({"body": body}))).await.unwrap();
        articles.set_vector(&id, "embedding", vector).await.unwrap();
    }

    let text_only = articles
        .hybrid_search(&HybridQuery::new("body", "rust", "embedding", vec![1.0, 0.0]).alpha(0.0))
        .await
        .unwrap();
    assert_eq!(text_only[0].record.data["body"], "rust storage engine in rust");
    assert!(text_only.iter().all(|h| (h.score - h.text_score).abs() < 1e-9));

    let vector_only = articles
        .hybrid_search(&HybridQuery::new("body", "rust", "embedding", vec![0.0, 1.0]).alpha(1.0))
        .await
        .unwrap();
    assert_eq!(vector_only[0].record.data["body"], "cooking with rust pans");

    // A document matched only by the vector side still appears
    let blended = articles
        .hybrid_search(&HybridQuery::new("body", "databases", "embedding", vec![1.0, 0.0]).limit(3))
        .await
        .unwrap();
    assert_eq!(blended.len(), 3);
    assert!(blended.windows(2).all(|w| w[0].score >= w[1].score));

    let unbounded = articles
        .hybrid_search(&HybridQuery::new("body", "rust", "embedding", vec![1.0, 0.0]).limit(usize::MAX))
        .await
        .unwrap();
    assert_eq!(unbounded.len(), 3);

    let err = articles
        .hybrid_search(&HybridQuery::new("body", "rust", "embedding", vec![1.0, 0.0]).alpha(1.5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Vector(_)));
}

#[tokio::test]
async fn test_invalid_collection_name() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let err = db
        .collection("bad\"name")
        .insert_one(doc(json!({"n": 1})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidName(_)));
}
