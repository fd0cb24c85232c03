//! The enqueue contract from §4.5: dedup on `(kind, entity_id, operation)`,
//! a fresh, stable `client_request_id` per accepted mutation.

use serde_json::Value;
use sync_core::{EntityKind, Operation, PropertyValue, Result};
use uuid::Uuid;

use crate::local_store::LocalStore;

/// Enqueue a mutation. Returns `true` if it was accepted, `false` if it was
/// dropped as a duplicate of an already-pending mutation for the same
/// `(kind, entity_id, operation)` triple. A malformed `properties` bag is
/// rejected here rather than after a round trip to the server.
pub fn enqueue(
    store: &LocalStore,
    kind: EntityKind,
    operation: Operation,
    entity_id: &str,
    payload: &Value,
) -> Result<bool> {
    PropertyValue::validate_bag(payload)?;
    if store.has_pending_mutation(kind, entity_id, operation)? {
        return Ok(false);
    }
    let client_request_id = Uuid::now_v7().to_string();
    store.insert_pending_mutation(kind, entity_id, operation, payload, &client_request_id)?;
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_second_enqueue_for_same_triple_is_dropped() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = enqueue(
            &store,
            EntityKind::Event,
            Operation::Update,
            "e1",
            &json!({"title": "a"}),
        )
        .unwrap();
        let second = enqueue(
            &store,
            EntityKind::Event,
            Operation::Update,
            "e1",
            &json!({"title": "b"}),
        )
        .unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(store.fetch_pending_mutations().unwrap().len(), 1);
    }

    #[test]
    fn test_enqueue_rejects_malformed_property_bag() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = enqueue(
            &store,
            EntityKind::Event,
            Operation::Create,
            "e1",
            &json!({"properties": {"distance_km": {"type": "number", "value": "oops"}}}),
        )
        .unwrap_err();
        assert!(matches!(err, sync_core::Error::Api { status: 422, .. }));
        assert!(store.fetch_pending_mutations().unwrap().is_empty());
    }

    #[test]
    fn test_different_operations_on_same_entity_both_enqueue() {
        let store = LocalStore::open_in_memory().unwrap();
        enqueue(&store, EntityKind::Event, Operation::Create, "e1", &json!({})).unwrap();
        let accepted = enqueue(&store, EntityKind::Event, Operation::Delete, "e1", &json!({})).unwrap();
        assert!(accepted);
        assert_eq!(store.fetch_pending_mutations().unwrap().len(), 2);
    }
}
