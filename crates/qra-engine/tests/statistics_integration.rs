use std::collections::BTreeSet;

use qra_engine::allocation::{
    ActivityRef, AllocationKey, AllocationModel, BusinessYear, SubcomponentParams,
};
use qra_engine::normalize::normalize_business_year;
use qra_engine::statistics::{TOP_ACTIVITY_LIMIT, compute_statistics};
use qra_engine::taxonomy::InMemoryTaxonomyCatalog;

fn params(frequency: f64) -> SubcomponentParams {
    SubcomponentParams {
        subcomponent_name: "Component".to_string(),
        time_percent: 100.0,
        frequency_percent: frequency,
        year_percent: 100.0,
        start_year: None,
        selected_roles: BTreeSet::new(),
        is_non_rd: false,
    }
}

#[test]
fn adding_an_allocation_flips_an_activity_from_non_rd_to_rd() {
    let mut model = AllocationModel::new();
    let scope = BusinessYear::new("biz-1", 2024);
    let activity = ActivityRef::new("biz-1", 2024, "act-1");
    model.select_activity(activity.clone(), "Assay Development", 50.0, BTreeSet::new());

    let catalog = InMemoryTaxonomyCatalog::new();
    let rows = normalize_business_year(&model, &scope, &catalog);
    let before = compute_statistics(&rows.configurations);
    assert_eq!(before.rd_activities, 0);
    assert_eq!(before.non_rd_activities, 1);

    model
        .select_subcomponent(
            &activity,
            AllocationKey::new("Research", "Protocol Design", "sub-1"),
            params(100.0),
        )
        .expect("select");

    let rows = normalize_business_year(&model, &scope, &catalog);
    let after = compute_statistics(&rows.configurations);
    assert_eq!(after.rd_activities, 1);
    assert_eq!(after.non_rd_activities, 0);
    assert!(after.total_applied_percent > before.total_applied_percent);
}

#[test]
fn statistics_aggregate_a_whole_business_year() {
    let mut model = AllocationModel::new();
    let scope = BusinessYear::new("biz-1", 2024);
    let catalog = InMemoryTaxonomyCatalog::new();

    // Six activities with descending practice percents; the top list
    // keeps the five largest.
    for i in 0..6u16 {
        let activity = ActivityRef::new("biz-1", 2024, format!("act-{i}"));
        model.select_activity(
            activity.clone(),
            format!("Activity {i}"),
            f64::from(60 - i * 10),
            BTreeSet::new(),
        );
        model
            .select_subcomponent(
                &activity,
                AllocationKey::new("Research", "Main Step", format!("sub-{i}")),
                params(100.0),
            )
            .expect("select");
    }

    let rows = normalize_business_year(&model, &scope, &catalog);
    let stats = compute_statistics(&rows.configurations);
    assert_eq!(stats.total_activities, 6);
    assert_eq!(stats.total_subcomponents, 6);
    // 60 + 50 + 40 + 30 + 20 + 10.
    assert!((stats.total_applied_percent - 210.0).abs() < 1e-9);
    assert!((stats.average_applied_percent - 35.0).abs() < 1e-9);
    assert_eq!(stats.rd_activities, 6);

    assert_eq!(stats.top_activities.len(), TOP_ACTIVITY_LIMIT);
    assert_eq!(stats.top_activities[0].activity_id.as_str(), "act-0");
    assert!((stats.top_activities[0].applied_percent - 60.0).abs() < 1e-9);
    // act-5 at 10% fell off the list.
    assert!(
        stats
            .top_activities
            .iter()
            .all(|share| share.activity_id.as_str() != "act-5")
    );
}

#[test]
fn zero_activities_yield_a_zero_guarded_average() {
    let stats = compute_statistics(&[]);
    assert_eq!(stats.total_activities, 0);
    assert_eq!(stats.average_applied_percent, 0.0);
}
