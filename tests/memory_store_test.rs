// ABOUTME: Integration tests for the in-memory object store
// ABOUTME: Snapshot persistence, linked lookups and transaction checkpoints

use object_replicator::query::{Condition, ConditionPath, DeletePredicate, LookupQuery};
use object_replicator::store::memory::Snapshot;
use object_replicator::{MemoryStore, ObjectStore, PersistedObject, Value};
use tempfile::TempDir;

fn condition(path: ConditionPath, value: &str) -> Condition {
    Condition {
        alias: "code".to_string(),
        path,
        value: Value::from(value),
        case_sensitive: false,
    }
}

#[tokio::test]
async fn test_snapshot_round_trip_keeps_ids() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("store.json");

    let store = MemoryStore::new();
    store
        .insert(PersistedObject::new(4, "Crm.Customer").with("Code", "A"))
        .await;
    store.save(&path).await.unwrap();

    let loaded = MemoryStore::load(&path).await.unwrap();
    assert_eq!(loaded.len().await, 1);
    assert_eq!(
        loaded.get(4).await.unwrap().get("Code"),
        &Value::from("A")
    );
    // new ids continue after the highest stored id
    let created = loaded.instantiate("Crm.Customer").await.unwrap();
    assert_eq!(created.id, 5);
}

#[tokio::test]
async fn test_load_or_default_starts_empty() {
    let temp_dir = TempDir::new().unwrap();
    let store = MemoryStore::load_or_default(&temp_dir.path().join("missing.json"))
        .await
        .unwrap();
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_load_rejects_garbage() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.json");
    std::fs::write(&path, "not json").unwrap();
    let err = MemoryStore::load(&path).await.unwrap_err();
    assert!(format!("{:#}", err).contains("store.json"));
}

#[tokio::test]
async fn test_lookup_follows_links_in_both_directions() {
    let store = MemoryStore::from_snapshot(Snapshot::default());
    store
        .insert(PersistedObject::new(1, "Crm.Country").with("Code", "NL"))
        .await;
    store
        .insert(
            PersistedObject::new(2, "Crm.Customer")
                .with("Code", "A")
                .with("Crm.Customer_Country", Value::Reference(Some(1))),
        )
        .await;
    store
        .insert(
            PersistedObject::new(3, "Crm.Contact")
                .with("Code", "C1")
                .with("Crm.Contact_Customer", Value::Reference(Some(2))),
        )
        .await;

    let by_country = LookupQuery {
        object_type: "Crm.Customer".to_string(),
        clauses: vec![vec![condition(
            ConditionPath::Associated {
                association: "Crm.Customer_Country".to_string(),
                target_type: "Crm.Country".to_string(),
                member: "Code".to_string(),
            },
            "nl",
        )]],
    };
    assert_eq!(store.find_ids(&by_country).await.unwrap(), vec![2]);

    let by_contact = LookupQuery {
        object_type: "Crm.Customer".to_string(),
        clauses: vec![vec![condition(
            ConditionPath::Associated {
                association: "Crm.Contact_Customer".to_string(),
                target_type: "Crm.Contact".to_string(),
                member: "Code".to_string(),
            },
            "C1",
        )]],
    };
    assert_eq!(store.find_ids(&by_contact).await.unwrap(), vec![2]);
}

#[tokio::test]
async fn test_transactions_cannot_nest() {
    let store = MemoryStore::new();
    store.begin_transaction().await.unwrap();
    assert!(store.begin_transaction().await.is_err());
    store.commit_transaction().await.unwrap();
    store.begin_transaction().await.unwrap();
}

#[tokio::test]
async fn test_commit_then_rollback_discards_objects() {
    let store = MemoryStore::new();
    store.begin_transaction().await.unwrap();
    let object = store
        .instantiate("Crm.Customer")
        .await
        .unwrap()
        .with("Code", "A");
    store.commit(vec![object]).await.unwrap();
    assert_eq!(store.len().await, 1);

    store.rollback_transaction().await.unwrap();
    assert!(store.is_empty().await);
    assert_eq!(store.commit_log().await.len(), 1);
}

#[tokio::test]
async fn test_delete_where_keeps_current_marker() {
    let store = MemoryStore::new();
    store
        .insert(PersistedObject::new(1, "Crm.Customer").with("Marker", 2))
        .await;
    store
        .insert(PersistedObject::new(2, "Crm.Customer").with("Marker", 1))
        .await;
    store.insert(PersistedObject::new(3, "Crm.Customer")).await;
    store
        .insert(PersistedObject::new(4, "Crm.Country").with("Marker", 1))
        .await;

    let predicate = DeletePredicate {
        object_type: "Crm.Customer".to_string(),
        marker_member: "Marker".to_string(),
        keep_value: Value::Integer(2),
    };
    assert_eq!(store.delete_where(&predicate, 10).await.unwrap(), 2);
    assert!(store.get(1).await.is_some());
    assert!(store.get(4).await.is_some());
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_distinct_values_skip_nulls() {
    let store = MemoryStore::new();
    for (id, marker) in [(1, Some(3)), (2, Some(3)), (3, Some(1)), (4, None)] {
        let mut object = PersistedObject::new(id, "Crm.Customer");
        if let Some(marker) = marker {
            object.set("Marker", Value::Integer(marker));
        }
        store.insert(object).await;
    }
    let mut values = store
        .distinct_values("Crm.Customer", "Marker")
        .await
        .unwrap();
    values.sort_by_key(|value| value.as_integer());
    assert_eq!(values, vec![Value::Integer(1), Value::Integer(3)]);
}
