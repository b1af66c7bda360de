use std::collections::BTreeSet;

use qra_engine::allocation::{
    ActivityRef, AllocationKey, AllocationModel, BusinessYear, SubcomponentParams,
};
use qra_engine::normalize::{NormalizedRowSet, from_normalized_rows, normalize_business_year};
use qra_engine::store::{
    AllocationStore, InMemoryAllocationStore, StoreKey, StoredEnvelope, decode_business_year,
    encode_business_year,
};
use qra_engine::taxonomy::InMemoryTaxonomyCatalog;

fn seeded_model() -> (AllocationModel, BusinessYear) {
    let mut model = AllocationModel::new();
    let activity = ActivityRef::new("biz-1", 2024, "act-1");
    model.select_activity(activity.clone(), "Assay Development", 50.0, BTreeSet::new());
    model
        .select_subcomponent(
            &activity,
            AllocationKey::new("Research", "Protocol Design", "sub-1"),
            SubcomponentParams {
                subcomponent_name: "Reagent Selection".to_string(),
                time_percent: 100.0,
                frequency_percent: 100.0,
                year_percent: 100.0,
                start_year: None,
                selected_roles: BTreeSet::new(),
                is_non_rd: false,
            },
        )
        .expect("select");
    (model, BusinessYear::new("biz-1", 2024))
}

#[test]
fn persist_and_reload_a_business_year_through_the_store() {
    let (model, scope) = seeded_model();
    let catalog = InMemoryTaxonomyCatalog::new();
    let rows = normalize_business_year(&model, &scope, &catalog);

    let mut store = InMemoryAllocationStore::new();
    let key = StoreKey::BusinessYear(scope.clone());
    let envelope = encode_business_year(&rows.configurations).expect("encode");
    store.set(&key, envelope, None).expect("persist");

    let loaded = store.get(&key).expect("get").expect("present");
    let decoded = decode_business_year(&loaded);
    assert!(!decoded.was_recovered());

    // The configuration rows alone are enough to rebuild the model.
    let mut reloaded = NormalizedRowSet::new();
    reloaded.configurations = decoded.rows();
    let rebuilt = from_normalized_rows(&reloaded);
    assert_eq!(rebuilt, model);
}

#[test]
fn concurrent_editors_conflict_instead_of_silently_overwriting() {
    let (model, scope) = seeded_model();
    let catalog = InMemoryTaxonomyCatalog::new();
    let rows = normalize_business_year(&model, &scope, &catalog);

    let mut store = InMemoryAllocationStore::new();
    let key = StoreKey::BusinessYear(scope);
    let envelope = encode_business_year(&rows.configurations).expect("encode");

    // Editor A loads version 0 (nothing stored yet) and writes.
    let version_a = store.set(&key, envelope.clone(), Some(0)).expect("editor a");
    assert_eq!(version_a, 1);

    // Editor B also loaded version 0 before A's write landed.
    let err = store.set(&key, envelope.clone(), Some(0)).expect_err("editor b");
    assert_eq!(err.stable_code(), "QRA-STOR-0002");

    // B re-reads, picks up A's version, and retries successfully.
    let current = store.get(&key).expect("get").expect("present").record_version;
    let version_b = store.set(&key, envelope, Some(current)).expect("retry");
    assert_eq!(version_b, 2);
}

#[test]
fn malformed_persisted_blob_loads_as_zero_allocations() {
    let mut store = InMemoryAllocationStore::new();
    let key = StoreKey::BusinessYear(BusinessYear::new("biz-1", 2024));
    store
        .set(
            &key,
            StoredEnvelope::new(serde_json::json!({"corrupted": [1, 2, 3]})),
            None,
        )
        .expect("seed corrupt blob");

    let loaded = store.get(&key).expect("get").expect("present");
    let decoded = decode_business_year(&loaded);
    assert!(decoded.was_recovered());
    assert!(decoded.rows().is_empty());
}

#[test]
fn per_activity_records_list_by_scope() {
    let mut store = InMemoryAllocationStore::new();
    for (business, year, activity) in [
        ("biz-1", 2024, "act-1"),
        ("biz-1", 2024, "act-2"),
        ("biz-1", 2023, "act-1"),
        ("biz-9", 2024, "act-1"),
    ] {
        let key = StoreKey::ActivityConfig(ActivityRef::new(business, year, activity));
        store
            .set(&key, StoredEnvelope::new(serde_json::Value::Null), None)
            .expect("seed");
    }

    let listed = store
        .list_business_year(&BusinessYear::new("biz-1", 2024))
        .expect("list");
    assert_eq!(listed.len(), 2);
}

#[test]
fn store_outage_is_a_visible_failure() {
    let (model, scope) = seeded_model();
    let rows = normalize_business_year(&model, &scope, &InMemoryTaxonomyCatalog::new());

    let mut store = InMemoryAllocationStore::new();
    store.set_fail_requests(true);
    let key = StoreKey::BusinessYear(scope);
    let envelope = encode_business_year(&rows.configurations).expect("encode");
    let err = store.set(&key, envelope, None).expect_err("outage");
    assert_eq!(err.stable_code(), "QRA-STOR-0001");
    // No retry happened behind the caller's back.
    assert!(store.events().is_empty());
}
