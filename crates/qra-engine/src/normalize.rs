//! Round-trip normalization between the sparse editing map and the
//! relational export rows.
//!
//! Export deduplicates taxonomy rows per table (one row per unique id,
//! first seen wins for descriptive fields) and computes the persisted
//! rollups on each configuration row.  Import is the exact inverse:
//! `from_normalized_rows(to_normalized_rows(model)) == model`
//! field-for-field.
//!
//! Key behaviors:
//! - A descriptive-field disagreement during dedup is recorded as a
//!   `NormalizationConflict` on the row set and resolved first-seen-wins;
//!   it is never an error.
//! - Catalog misses synthesize phase/step rows from the allocation's
//!   own denormalized names, with SHA-256-derived ids so re-export is
//!   deterministic.
//! - The row set is the single source for every serialization format
//!   (see `export`); nothing here touches the store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::allocation::{
    ActivityConfiguration, ActivityRef, AllocationModel, BusinessId, BusinessYear, RoleId,
    StepKey, SubcomponentAllocation,
};
use crate::rollup::activity_rollup;
use crate::taxonomy::{NodeId, NodeKind, TaxonomyCatalog, TaxonomyNode};
use crate::validation::validate_configuration;

/// Component name for structured events.
pub const NORMALIZE_COMPONENT: &str = "normalizer";

/// Schema version carried by every exported row set.
pub const ROW_SET_SCHEMA_VERSION: &str = "qra-engine.normalized-rows.v1";

// ---------------------------------------------------------------------------
// Taxonomy table rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRow {
    pub id: NodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaRow {
    pub id: NodeId,
    pub name: String,
    pub category_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusRow {
    pub id: NodeId,
    pub name: String,
    pub area_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRow {
    pub id: NodeId,
    pub name: String,
    /// Absent when the catalog has no record of the activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertainties: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternatives: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developmental_process: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRow {
    pub id: NodeId,
    pub name: String,
    pub activity_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRow {
    pub id: NodeId,
    pub name: String,
    pub phase_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubcomponentRow {
    pub id: NodeId,
    pub name: String,
    pub step_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

// ---------------------------------------------------------------------------
// QraConfigurationRow — persistence-ready projection of one configuration
// ---------------------------------------------------------------------------

/// The unit written to normalized storage and emitted by every export
/// format: one activity configuration with its allocations and rollups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QraConfigurationRow {
    pub business_id: BusinessId,
    pub year: u16,
    pub activity_id: NodeId,
    pub activity_name: String,
    pub practice_percent: f64,
    pub non_rd_time: f64,
    pub active: bool,
    pub selected_roles: Vec<RoleId>,
    /// Allocations in original insertion order.
    pub allocations: Vec<SubcomponentAllocation>,
    pub locked_steps: Vec<StepKey>,
    pub next_sequence: u64,
    pub qra_completed: bool,
    pub total_applied_percent: f64,
    pub subcomponent_count: usize,
    pub step_count: usize,
}

impl QraConfigurationRow {
    pub fn activity_ref(&self) -> ActivityRef {
        ActivityRef {
            business_id: self.business_id.clone(),
            year: self.year,
            activity_id: self.activity_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// NormalizationConflict — recorded, never raised
// ---------------------------------------------------------------------------

/// Two source rows disagreed on a descriptive field for the same id.
/// Resolution is first-seen-wins; the losing value is recorded here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationConflict {
    pub table: String,
    pub id: String,
    pub field: String,
    pub kept: String,
    pub ignored: String,
}

// ---------------------------------------------------------------------------
// NormalizedRowSet
// ---------------------------------------------------------------------------

/// The full deduplicated relational projection for one business/year.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRowSet {
    pub schema_version: String,
    pub categories: Vec<CategoryRow>,
    pub areas: Vec<AreaRow>,
    pub focuses: Vec<FocusRow>,
    pub activities: Vec<ActivityRow>,
    pub phases: Vec<PhaseRow>,
    pub steps: Vec<StepRow>,
    pub subcomponents: Vec<SubcomponentRow>,
    pub configurations: Vec<QraConfigurationRow>,
    /// Dedup disagreements observed while building the set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<NormalizationConflict>,
}

impl NormalizedRowSet {
    pub fn new() -> Self {
        Self {
            schema_version: ROW_SET_SCHEMA_VERSION.to_string(),
            ..Self::default()
        }
    }

    /// Total entity rows across all tables.
    pub fn row_count(&self) -> usize {
        self.categories.len()
            + self.areas.len()
            + self.focuses.len()
            + self.activities.len()
            + self.phases.len()
            + self.steps.len()
            + self.subcomponents.len()
            + self.configurations.len()
    }
}

// ---------------------------------------------------------------------------
// Dedup machinery
// ---------------------------------------------------------------------------

struct DedupTable<T> {
    name: &'static str,
    rows: Vec<T>,
    index: BTreeMap<NodeId, usize>,
}

impl<T: Serialize> DedupTable<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    /// Insert with first-seen-wins semantics; field disagreements are
    /// appended to `conflicts`.
    fn insert(&mut self, id: &NodeId, row: T, conflicts: &mut Vec<NormalizationConflict>) {
        if let Some(&existing) = self.index.get(id) {
            record_field_conflicts(self.name, id, &self.rows[existing], &row, conflicts);
            return;
        }
        self.index.insert(id.clone(), self.rows.len());
        self.rows.push(row);
    }
}

/// Diff two serialized rows field-by-field, recording each disagreement.
fn record_field_conflicts<T: Serialize>(
    table: &'static str,
    id: &NodeId,
    kept: &T,
    ignored: &T,
    conflicts: &mut Vec<NormalizationConflict>,
) {
    let kept = serde_json::to_value(kept).unwrap_or_default();
    let ignored = serde_json::to_value(ignored).unwrap_or_default();
    let (Some(kept), Some(ignored)) = (kept.as_object(), ignored.as_object()) else {
        return;
    };
    for (field, ignored_value) in ignored {
        let kept_value = kept.get(field).cloned().unwrap_or(serde_json::Value::Null);
        if &kept_value != ignored_value {
            conflicts.push(NormalizationConflict {
                table: table.to_string(),
                id: id.to_string(),
                field: field.clone(),
                kept: kept_value.to_string(),
                ignored: ignored_value.to_string(),
            });
        }
    }
}

/// Deterministic id for a phase/step the catalog has no record of.
fn synthetic_node_id(kind: NodeKind, scope: &NodeId, name: &str) -> NodeId {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(scope.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(19);
    hex.push_str("syn-");
    for byte in &digest[..8] {
        hex.push_str(&format!("{byte:02x}"));
    }
    NodeId(hex)
}

// ---------------------------------------------------------------------------
// Export direction
// ---------------------------------------------------------------------------

/// Project a set of configurations into deduplicated relational rows.
pub fn to_normalized_rows(
    configs: &[&ActivityConfiguration],
    catalog: &dyn TaxonomyCatalog,
) -> NormalizedRowSet {
    let mut conflicts = Vec::new();
    let mut categories = DedupTable::new("category");
    let mut areas = DedupTable::new("area");
    let mut focuses = DedupTable::new("focus");
    let mut activities = DedupTable::new("activity");
    let mut phases = DedupTable::new("phase");
    let mut steps = DedupTable::new("step");
    let mut subcomponents = DedupTable::new("subcomponent");
    let mut configurations = Vec::new();

    for config in configs {
        let activity_node = catalog.activity_by_id(&config.activity_id);

        // Ancestry rows, as far up as the catalog can take us.
        if let Some(activity) = activity_node {
            let focus = activity.parent.as_ref().and_then(|id| catalog.node(id));
            let area = focus
                .and_then(|f| f.parent.as_ref())
                .and_then(|id| catalog.node(id));
            let category = area
                .and_then(|a| a.parent.as_ref())
                .and_then(|id| catalog.node(id));
            if let Some(category) = category {
                categories.insert(
                    &category.id,
                    CategoryRow {
                        id: category.id.clone(),
                        name: category.name.clone(),
                    },
                    &mut conflicts,
                );
            }
            if let (Some(area), Some(category)) = (area, category) {
                areas.insert(
                    &area.id,
                    AreaRow {
                        id: area.id.clone(),
                        name: area.name.clone(),
                        category_id: category.id.clone(),
                    },
                    &mut conflicts,
                );
            }
            if let (Some(focus), Some(area)) = (focus, area) {
                focuses.insert(
                    &focus.id,
                    FocusRow {
                        id: focus.id.clone(),
                        name: focus.name.clone(),
                        area_id: area.id.clone(),
                    },
                    &mut conflicts,
                );
            }
            activities.insert(
                &activity.id,
                ActivityRow {
                    id: activity.id.clone(),
                    name: activity.name.clone(),
                    focus_id: activity.parent.clone(),
                    goal: activity.goal.clone(),
                    hypothesis: activity.hypothesis.clone(),
                    uncertainties: activity.uncertainties.clone(),
                    alternatives: activity.alternatives.clone(),
                    developmental_process: activity.developmental_process.clone(),
                },
                &mut conflicts,
            );
        } else {
            // No catalog data: the configuration itself still exports.
            activities.insert(
                &config.activity_id,
                ActivityRow {
                    id: config.activity_id.clone(),
                    name: config.activity_name.clone(),
                    focus_id: None,
                    goal: None,
                    hypothesis: None,
                    uncertainties: None,
                    alternatives: None,
                    developmental_process: None,
                },
                &mut conflicts,
            );
        }

        // Phase/step/subcomponent rows per allocation.
        for allocation in config.allocations_by_sequence() {
            let phase_node = activity_node
                .and_then(|a| find_child_by_name(catalog, &a.id, &allocation.phase));
            let phase_id = phase_node.map(|p| p.id.clone()).unwrap_or_else(|| {
                synthetic_node_id(NodeKind::Phase, &config.activity_id, &allocation.phase)
            });
            let phase_name = phase_node
                .map(|p| p.name.clone())
                .unwrap_or_else(|| allocation.phase.clone());
            phases.insert(
                &phase_id,
                PhaseRow {
                    id: phase_id.clone(),
                    name: phase_name,
                    activity_id: config.activity_id.clone(),
                },
                &mut conflicts,
            );

            let step_node =
                phase_node.and_then(|p| find_child_by_name(catalog, &p.id, &allocation.step));
            let step_id = step_node
                .map(|s| s.id.clone())
                .unwrap_or_else(|| synthetic_node_id(NodeKind::Step, &phase_id, &allocation.step));
            let step_name = step_node
                .map(|s| s.name.clone())
                .unwrap_or_else(|| allocation.step.clone());
            steps.insert(
                &step_id,
                StepRow {
                    id: step_id.clone(),
                    name: step_name,
                    phase_id: phase_id.clone(),
                },
                &mut conflicts,
            );

            let hint = catalog
                .lookup_subcomponent(&config.activity_name, &allocation.subcomponent_name)
                .and_then(|s| s.hint.clone());
            subcomponents.insert(
                &allocation.subcomponent_id,
                SubcomponentRow {
                    id: allocation.subcomponent_id.clone(),
                    name: allocation.subcomponent_name.clone(),
                    step_id: step_id.clone(),
                    hint,
                },
                &mut conflicts,
            );
        }

        // The configuration row with its computed rollups.
        let rollup = activity_rollup(config);
        let report = validate_configuration(config, catalog);
        configurations.push(QraConfigurationRow {
            business_id: config.business_id.clone(),
            year: config.year,
            activity_id: config.activity_id.clone(),
            activity_name: config.activity_name.clone(),
            practice_percent: config.practice_percent,
            non_rd_time: config.non_rd_time,
            active: config.active,
            selected_roles: config.selected_roles.iter().cloned().collect(),
            allocations: config
                .allocations_by_sequence()
                .into_iter()
                .cloned()
                .collect(),
            locked_steps: config.locked_steps.iter().cloned().collect(),
            next_sequence: config.next_sequence,
            qra_completed: report.qra_completed,
            total_applied_percent: rollup.total_applied_percent,
            subcomponent_count: rollup.subcomponent_count,
            step_count: rollup.step_count,
        });
    }

    NormalizedRowSet {
        schema_version: ROW_SET_SCHEMA_VERSION.to_string(),
        categories: categories.rows,
        areas: areas.rows,
        focuses: focuses.rows,
        activities: activities.rows,
        phases: phases.rows,
        steps: steps.rows,
        subcomponents: subcomponents.rows,
        configurations,
        conflicts,
    }
}

/// Normalize every configuration in one (business, year) scope.
pub fn normalize_business_year(
    model: &AllocationModel,
    scope: &BusinessYear,
    catalog: &dyn TaxonomyCatalog,
) -> NormalizedRowSet {
    to_normalized_rows(&model.configurations_for(scope), catalog)
}

fn find_child_by_name<'a>(
    catalog: &'a dyn TaxonomyCatalog,
    parent: &NodeId,
    name: &str,
) -> Option<&'a TaxonomyNode> {
    catalog
        .children_of(parent)
        .into_iter()
        .find(|n| n.name.eq_ignore_ascii_case(name))
}

// ---------------------------------------------------------------------------
// Import direction
// ---------------------------------------------------------------------------

/// Reconstruct the sparse allocation model from configuration rows.
/// Inverse of `to_normalized_rows`; export → import is idempotent.
pub fn from_normalized_rows(rows: &NormalizedRowSet) -> AllocationModel {
    let mut model = AllocationModel::new();
    for row in &rows.configurations {
        let mut config = ActivityConfiguration::new(
            row.business_id.as_str(),
            row.year,
            row.activity_id.as_str(),
            row.activity_name.clone(),
            row.practice_percent,
            row.selected_roles.iter().cloned().collect(),
        );
        config.non_rd_time = row.non_rd_time;
        config.active = row.active;
        config.locked_steps = row.locked_steps.iter().cloned().collect();
        config.next_sequence = row.next_sequence;
        for allocation in &row.allocations {
            config
                .allocations
                .insert(allocation.key(), allocation.clone());
        }
        model.configurations.insert(row.activity_ref(), config);
    }
    model
}
