//! Advisory validation over one activity configuration.
//!
//! Validation is a pure function: it returns a structured report and
//! never throws, never blocks persistence, and never drops data.  All
//! findings are informational; the only derived gate is the
//! `qra_completed` flag surfaced on the export row.
//!
//! Key behaviors:
//! - Sum-to-100 checks carry a 0.01 tolerance: 99.99 and 100.01 pass,
//!   95 and 105 do not.
//! - Step-time balance applies to active configurations with at least
//!   one allocation.
//! - An allocation whose (phase, step) pair does not resolve in the
//!   catalog under its parent activity is an orphan finding, but the
//!   allocation itself is retained for the user to reconcile.
//!   `is_non_rd` allocations are exempt; an activity the catalog has no
//!   record of produces no orphan findings at all ("no catalog data").

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::allocation::{ActivityConfiguration, AllocationKey, StepKey};
use crate::rollup::step_aggregates;
use crate::taxonomy::{NodeId, TaxonomyCatalog};

/// Component name for structured events.
pub const VALIDATION_COMPONENT: &str = "validation_engine";

/// Absolute tolerance for sum-to-100 invariants.
pub const BALANCE_TOLERANCE: f64 = 0.01;

/// Padding so a sum sitting exactly on the tolerance boundary is not
/// rejected by floating-point representation error (100.01 - 100.0 is
/// slightly more than 0.01 in f64).
const FLOAT_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// ValidationFinding
// ---------------------------------------------------------------------------

/// One advisory finding.  Never fatal, never blocks save or export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationFinding {
    /// Step time percents across the activity do not sum to 100.
    StepTimeImbalance { activity_id: NodeId, total: f64 },
    /// Frequency percents within one step do not sum to 100.
    FrequencyImbalance {
        activity_id: NodeId,
        step: StepKey,
        total: f64,
    },
    /// The allocation's (phase, step) pair has no catalog counterpart
    /// under its parent activity.
    OrphanAllocation {
        activity_id: NodeId,
        key: AllocationKey,
    },
}

impl ValidationFinding {
    /// Canonical tag for structured events.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StepTimeImbalance { .. } => "step_time_imbalance",
            Self::FrequencyImbalance { .. } => "frequency_imbalance",
            Self::OrphanAllocation { .. } => "orphan_allocation",
        }
    }

    /// Whether the finding counts against `qra_completed`.  Orphans are
    /// advisory only.
    pub const fn affects_completeness(&self) -> bool {
        matches!(
            self,
            Self::StepTimeImbalance { .. } | Self::FrequencyImbalance { .. }
        )
    }
}

impl fmt::Display for ValidationFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepTimeImbalance { activity_id, total } => {
                write!(f, "step time for activity `{activity_id}` sums to {total}, expected 100")
            }
            Self::FrequencyImbalance {
                activity_id,
                step,
                total,
            } => write!(
                f,
                "frequency within step `{step}` of activity `{activity_id}` sums to {total}, expected 100"
            ),
            Self::OrphanAllocation { activity_id, key } => {
                write!(f, "allocation `{key}` has no catalog step under activity `{activity_id}`")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationReport
// ---------------------------------------------------------------------------

/// The structured result of validating one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub activity_id: NodeId,
    pub findings: Vec<ValidationFinding>,
    pub subcomponent_count: usize,
    /// `true` when at least one subcomponent is selected and no balance
    /// finding was raised.
    pub qra_completed: bool,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn has_finding(&self, tag: &str) -> bool {
        self.findings.iter().any(|f| f.as_str() == tag)
    }
}

/// Whether a percentage sum balances to 100 within tolerance.
pub fn balances_to_100(total: f64) -> bool {
    (total - 100.0).abs() <= BALANCE_TOLERANCE + FLOAT_EPSILON
}

// ---------------------------------------------------------------------------
// validate_configuration
// ---------------------------------------------------------------------------

/// Validate one configuration against the catalog.  Pure and total.
pub fn validate_configuration(
    config: &ActivityConfiguration,
    catalog: &dyn TaxonomyCatalog,
) -> ValidationReport {
    let mut findings = Vec::new();
    let aggregates = step_aggregates(config);

    // Step-time invariant: only meaningful for an active configuration
    // that has allocations at all.
    if config.active && !aggregates.is_empty() {
        let total: f64 = aggregates.iter().map(|agg| agg.time_percent).sum();
        if !balances_to_100(total) {
            findings.push(ValidationFinding::StepTimeImbalance {
                activity_id: config.activity_id.clone(),
                total,
            });
        }
    }

    // Frequency invariant, per step.
    for aggregate in &aggregates {
        let total: f64 = config
            .step_members(&aggregate.key)
            .iter()
            .map(|a| a.frequency_percent)
            .sum();
        if !balances_to_100(total) {
            findings.push(ValidationFinding::FrequencyImbalance {
                activity_id: config.activity_id.clone(),
                step: aggregate.key.clone(),
                total,
            });
        }
    }

    // Ownership invariant: every (phase, step) must resolve under the
    // parent activity unless opted out via `is_non_rd`.
    if let Some(activity) = catalog.activity_by_id(&config.activity_id) {
        for allocation in config.allocations_by_sequence() {
            if allocation.is_non_rd {
                continue;
            }
            if !step_resolves(catalog, &activity.id, &allocation.phase, &allocation.step) {
                findings.push(ValidationFinding::OrphanAllocation {
                    activity_id: config.activity_id.clone(),
                    key: allocation.key(),
                });
            }
        }
    }

    let subcomponent_count = config.allocations.len();
    let qra_completed =
        subcomponent_count > 0 && !findings.iter().any(|f| f.affects_completeness());

    ValidationReport {
        activity_id: config.activity_id.clone(),
        findings,
        subcomponent_count,
        qra_completed,
    }
}

/// Resolve a denormalized (phase, step) name pair under an activity.
/// Name comparison is case-insensitive, matching the catalog's tolerant
/// lookup posture.
fn step_resolves(
    catalog: &dyn TaxonomyCatalog,
    activity_id: &NodeId,
    phase_name: &str,
    step_name: &str,
) -> bool {
    for phase in catalog.children_of(activity_id) {
        if !phase.name.eq_ignore_ascii_case(phase_name) {
            continue;
        }
        for step in catalog.children_of(&phase.id) {
            if step.name.eq_ignore_ascii_case(step_name) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::allocation::{ActivityRef, AllocationModel, SubcomponentParams};
    use crate::taxonomy::{InMemoryTaxonomyCatalog, NodeKind, TaxonomyNode};

    fn catalog() -> InMemoryTaxonomyCatalog {
        let mut cat = InMemoryTaxonomyCatalog::new();
        cat.insert(TaxonomyNode::bare("cat-1", NodeKind::Category, "Healthcare", None))
            .expect("category");
        cat.insert(TaxonomyNode::bare(
            "area-1",
            NodeKind::Area,
            "Clinical Research",
            Some(NodeId::new("cat-1")),
        ))
        .expect("area");
        cat.insert(TaxonomyNode::bare(
            "focus-1",
            NodeKind::Focus,
            "Diagnostics",
            Some(NodeId::new("area-1")),
        ))
        .expect("focus");
        cat.insert(TaxonomyNode::bare(
            "act-1",
            NodeKind::Activity,
            "Assay Development",
            Some(NodeId::new("focus-1")),
        ))
        .expect("activity");
        cat.insert(TaxonomyNode::bare(
            "phase-1",
            NodeKind::Phase,
            "Research",
            Some(NodeId::new("act-1")),
        ))
        .expect("phase");
        cat.insert(TaxonomyNode::bare(
            "step-1",
            NodeKind::Step,
            "Protocol Design",
            Some(NodeId::new("phase-1")),
        ))
        .expect("step");
        cat
    }

    fn configured_model(time_a: f64, time_b: f64) -> (AllocationModel, ActivityRef) {
        let mut model = AllocationModel::new();
        let activity = ActivityRef::new("biz-1", 2024, "act-1");
        model.select_activity(activity.clone(), "Assay Development", 50.0, BTreeSet::new());
        model
            .select_subcomponent(
                &activity,
                AllocationKey::new("Research", "Protocol Design", "sub-a"),
                SubcomponentParams {
                    subcomponent_name: "A".to_string(),
                    time_percent: time_a,
                    frequency_percent: 100.0,
                    year_percent: 100.0,
                    start_year: None,
                    selected_roles: BTreeSet::new(),
                    is_non_rd: false,
                },
            )
            .expect("a");
        model
            .select_subcomponent(
                &activity,
                AllocationKey::new("Research", "Data Review", "sub-b"),
                SubcomponentParams {
                    subcomponent_name: "B".to_string(),
                    time_percent: time_b,
                    frequency_percent: 100.0,
                    year_percent: 100.0,
                    start_year: None,
                    selected_roles: BTreeSet::new(),
                    is_non_rd: false,
                },
            )
            .expect("b");
        (model, activity)
    }

    #[test]
    fn balanced_configuration_within_tolerance_is_complete() {
        for (a, b) in [(50.0, 50.0), (49.99, 50.0), (50.0, 50.01)] {
            let (model, activity) = configured_model(a, b);
            let config = model.configuration(&activity).expect("config");
            let report = validate_configuration(config, &catalog());
            assert!(
                !report.has_finding("step_time_imbalance"),
                "{a} + {b} must balance"
            );
            assert!(report.qra_completed);
        }
    }

    #[test]
    fn sums_of_95_and_105_raise_step_time_imbalance() {
        for (a, b) in [(45.0, 50.0), (55.0, 50.0)] {
            let (model, activity) = configured_model(a, b);
            let config = model.configuration(&activity).expect("config");
            let report = validate_configuration(config, &catalog());
            assert!(report.has_finding("step_time_imbalance"), "{a} + {b} must flag");
            assert!(!report.qra_completed);
        }
    }

    #[test]
    fn frequency_imbalance_is_reported_per_step() {
        let (mut model, activity) = configured_model(50.0, 50.0);
        model
            .select_subcomponent(
                &activity,
                AllocationKey::new("Research", "Protocol Design", "sub-c"),
                SubcomponentParams {
                    subcomponent_name: "C".to_string(),
                    time_percent: 50.0,
                    frequency_percent: 80.0,
                    year_percent: 100.0,
                    start_year: None,
                    selected_roles: BTreeSet::new(),
                    is_non_rd: false,
                },
            )
            .expect("c");
        let config = model.configuration(&activity).expect("config");
        let report = validate_configuration(config, &catalog());
        let freq_findings: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.as_str() == "frequency_imbalance")
            .collect();
        assert_eq!(freq_findings.len(), 1);
        match freq_findings[0] {
            ValidationFinding::FrequencyImbalance { step, total, .. } => {
                assert_eq!(step.step, "Protocol Design");
                assert!((total - 180.0).abs() < 1e-9);
            }
            other => panic!("unexpected finding {other:?}"),
        }
    }

    #[test]
    fn orphan_allocations_are_reported_and_retained() {
        let (mut model, activity) = configured_model(50.0, 50.0);
        // "Data Review" does not exist in the catalog under act-1.
        let config = model.configuration_mut(&activity).expect("config");
        let report = validate_configuration(config, &catalog());
        let orphans: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.as_str() == "orphan_allocation")
            .collect();
        assert_eq!(orphans.len(), 1);
        // Retained: the allocation is still in the model.
        assert_eq!(config.allocations.len(), 2);
        // Orphans never affect completeness.
        assert!(report.qra_completed);
    }

    #[test]
    fn non_rd_allocations_are_exempt_from_the_orphan_check() {
        let (mut model, activity) = configured_model(50.0, 50.0);
        model
            .select_subcomponent(
                &activity,
                AllocationKey::new("Research", "Data Review", "sub-b"),
                SubcomponentParams {
                    subcomponent_name: "B".to_string(),
                    time_percent: 50.0,
                    frequency_percent: 100.0,
                    year_percent: 100.0,
                    start_year: None,
                    selected_roles: BTreeSet::new(),
                    is_non_rd: true,
                },
            )
            .expect("flag non-rd");
        let config = model.configuration(&activity).expect("config");
        let report = validate_configuration(config, &catalog());
        assert!(!report.has_finding("orphan_allocation"));
    }

    #[test]
    fn unknown_activity_yields_no_orphan_findings() {
        let (model, activity) = configured_model(50.0, 50.0);
        let config = model.configuration(&activity).expect("config");
        // Empty catalog: no data for the activity at all.
        let report = validate_configuration(config, &InMemoryTaxonomyCatalog::new());
        assert!(!report.has_finding("orphan_allocation"));
    }

    #[test]
    fn empty_configuration_is_incomplete_but_clean() {
        let mut model = AllocationModel::new();
        let activity = ActivityRef::new("biz-1", 2024, "act-1");
        model.select_activity(activity.clone(), "Assay Development", 50.0, BTreeSet::new());
        let config = model.configuration(&activity).expect("config");
        let report = validate_configuration(config, &catalog());
        assert!(report.is_clean());
        assert!(!report.qra_completed);
    }

    #[test]
    fn inactive_configuration_skips_the_step_time_check() {
        let (mut model, activity) = configured_model(10.0, 10.0);
        model.set_active(&activity, false).expect("deactivate");
        let config = model.configuration(&activity).expect("config");
        let report = validate_configuration(config, &catalog());
        assert!(!report.has_finding("step_time_imbalance"));
    }
}
