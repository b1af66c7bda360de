//! Sparse allocation model for one or more business-year editing sessions.
//!
//! An `ActivityConfiguration` holds everything a user has entered for one
//! (business, year, activity): the practice percent, the independent
//! non-R&D time indicator, selected roles, step locks, and a sparse map
//! of subcomponent allocations keyed by the composite
//! (phase, step, subcomponent) key.
//!
//! Key behaviors:
//! - All percentage writes clamp to [0, 100].
//! - `non_rd_time` is an independent field, never derived from
//!   `practice_percent`.
//! - Every allocation carries a `sequence` number assigned at first
//!   insertion; sequences define "original ordering" for redistribution
//!   and reporting and survive the persistence round trip.
//! - Operations apply strictly in issue order; no hidden I/O anywhere.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::taxonomy::NodeId;

/// Component name for structured events.
pub const ALLOCATION_COMPONENT: &str = "allocation_model";

const ERROR_UNKNOWN_ACTIVITY: &str = "QRA-ALLOC-0001";
const ERROR_UNKNOWN_ALLOCATION: &str = "QRA-ALLOC-0002";
const ERROR_UNKNOWN_STEP: &str = "QRA-ALLOC-0003";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Business identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessId(pub String);

impl BusinessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role identifier referenced by an allocation or configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One (business, year) editing scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusinessYear {
    pub business_id: BusinessId,
    pub year: u16,
}

impl BusinessYear {
    pub fn new(business_id: impl Into<String>, year: u16) -> Self {
        Self {
            business_id: BusinessId::new(business_id),
            year,
        }
    }
}

impl fmt::Display for BusinessYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.business_id, self.year)
    }
}

/// Fully qualified reference to one activity configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActivityRef {
    pub business_id: BusinessId,
    pub year: u16,
    pub activity_id: NodeId,
}

impl ActivityRef {
    pub fn new(business_id: impl Into<String>, year: u16, activity_id: impl Into<String>) -> Self {
        Self {
            business_id: BusinessId::new(business_id),
            year,
            activity_id: NodeId::new(activity_id),
        }
    }

    pub fn business_year(&self) -> BusinessYear {
        BusinessYear {
            business_id: self.business_id.clone(),
            year: self.year,
        }
    }
}

impl fmt::Display for ActivityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.business_id, self.year, self.activity_id)
    }
}

// ---------------------------------------------------------------------------
// Composite keys
// ---------------------------------------------------------------------------

/// One step within an activity, identified by its denormalized names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub phase: String,
    pub step: String,
}

impl StepKey {
    pub fn new(phase: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            step: step.into(),
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.phase, self.step)
    }
}

/// Composite allocation key: disambiguates subcomponents sharing a name
/// across steps.  Typed equality and ordering replace delimited string
/// concatenation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationKey {
    pub phase: String,
    pub step: String,
    pub subcomponent_id: NodeId,
}

impl AllocationKey {
    pub fn new(
        phase: impl Into<String>,
        step: impl Into<String>,
        subcomponent_id: impl Into<String>,
    ) -> Self {
        Self {
            phase: phase.into(),
            step: step.into(),
            subcomponent_id: NodeId::new(subcomponent_id),
        }
    }

    pub fn step_key(&self) -> StepKey {
        StepKey {
            phase: self.phase.clone(),
            step: self.step.clone(),
        }
    }
}

impl fmt::Display for AllocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} / {}", self.phase, self.step, self.subcomponent_id)
    }
}

// ---------------------------------------------------------------------------
// SubcomponentAllocation
// ---------------------------------------------------------------------------

/// Caller-supplied fields for one subcomponent selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubcomponentParams {
    pub subcomponent_name: String,
    pub time_percent: f64,
    pub frequency_percent: f64,
    pub year_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_year: Option<u16>,
    #[serde(default)]
    pub selected_roles: BTreeSet<RoleId>,
    #[serde(default)]
    pub is_non_rd: bool,
}

/// One selected subcomponent with its nested allocation percentages.
///
/// `applied_percent` is deliberately absent as a field: it is a pure
/// function of the three percentages here and the parent practice
/// percent, recomputed on every read (see `rollup::applied_percent`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubcomponentAllocation {
    pub subcomponent_id: NodeId,
    pub subcomponent_name: String,
    pub phase: String,
    pub step: String,
    /// Share of the activity's time occupied by this subcomponent's step.
    pub time_percent: f64,
    pub frequency_percent: f64,
    pub year_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_year: Option<u16>,
    #[serde(default)]
    pub selected_roles: BTreeSet<RoleId>,
    /// Opt-out flag: exempts the allocation from the orphan check.
    #[serde(default)]
    pub is_non_rd: bool,
    /// Insertion index within the parent configuration.
    pub sequence: u64,
}

impl SubcomponentAllocation {
    pub fn key(&self) -> AllocationKey {
        AllocationKey {
            phase: self.phase.clone(),
            step: self.step.clone(),
            subcomponent_id: self.subcomponent_id.clone(),
        }
    }

    pub fn step_key(&self) -> StepKey {
        StepKey {
            phase: self.phase.clone(),
            step: self.step.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ActivityConfiguration
// ---------------------------------------------------------------------------

/// Everything entered for one (business, year, activity).
///
/// Session state, not a wire type: persistence and export go through
/// the normalized configuration row, never through this struct.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityConfiguration {
    pub business_id: BusinessId,
    pub year: u16,
    pub activity_id: NodeId,
    pub activity_name: String,
    /// Share of total business practice devoted to this activity, [0, 100].
    pub practice_percent: f64,
    /// Independent non-R&D indicator, [0, 100].  Not the complement of
    /// `practice_percent`; a third "unaccounted" bucket stays possible.
    pub non_rd_time: f64,
    pub active: bool,
    pub selected_roles: BTreeSet<RoleId>,
    pub allocations: BTreeMap<AllocationKey, SubcomponentAllocation>,
    /// Steps whose time percent is user-pinned and excluded from
    /// auto-redistribution.
    pub locked_steps: BTreeSet<StepKey>,
    /// Next sequence number to assign; persisted so that the round trip
    /// is exact even after deletions at the end of the sequence space.
    pub next_sequence: u64,
}

impl ActivityConfiguration {
    pub fn new(
        business_id: impl Into<String>,
        year: u16,
        activity_id: impl Into<String>,
        activity_name: impl Into<String>,
        practice_percent: f64,
        selected_roles: BTreeSet<RoleId>,
    ) -> Self {
        Self {
            business_id: BusinessId::new(business_id),
            year,
            activity_id: NodeId::new(activity_id),
            activity_name: activity_name.into(),
            practice_percent: clamp_percent(practice_percent),
            non_rd_time: 0.0,
            active: true,
            selected_roles,
            allocations: BTreeMap::new(),
            locked_steps: BTreeSet::new(),
            next_sequence: 0,
        }
    }

    pub fn activity_ref(&self) -> ActivityRef {
        ActivityRef {
            business_id: self.business_id.clone(),
            year: self.year,
            activity_id: self.activity_id.clone(),
        }
    }

    /// Allocations in original insertion order.
    pub fn allocations_by_sequence(&self) -> Vec<&SubcomponentAllocation> {
        let mut out: Vec<&SubcomponentAllocation> = self.allocations.values().collect();
        out.sort_by_key(|a| a.sequence);
        out
    }

    /// Allocations belonging to one step, in original insertion order.
    pub fn step_members(&self, step: &StepKey) -> Vec<&SubcomponentAllocation> {
        let mut out: Vec<&SubcomponentAllocation> = self
            .allocations
            .values()
            .filter(|a| a.phase == step.phase && a.step == step.step)
            .collect();
        out.sort_by_key(|a| a.sequence);
        out
    }

    /// Distinct subcomponent ids across all allocations.
    pub fn distinct_subcomponent_count(&self) -> usize {
        self.allocations
            .values()
            .map(|a| &a.subcomponent_id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Distinct step keys across all allocations.
    pub fn distinct_step_count(&self) -> usize {
        self.allocations
            .values()
            .map(|a| a.step_key())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Clamp a percentage to [0, 100]; NaN collapses to 0.
pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// AllocationError
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no configuration for activity `{activity}`")]
    UnknownActivity { activity: ActivityRef },
    #[error("no allocation under `{activity}` for key `{key}`")]
    UnknownAllocation {
        activity: ActivityRef,
        key: AllocationKey,
    },
    #[error("no step `{step}` under activity `{activity}`")]
    UnknownStep { activity: ActivityRef, step: StepKey },
}

impl AllocationError {
    /// Stable machine-readable error code.
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::UnknownActivity { .. } => ERROR_UNKNOWN_ACTIVITY,
            Self::UnknownAllocation { .. } => ERROR_UNKNOWN_ALLOCATION,
            Self::UnknownStep { .. } => ERROR_UNKNOWN_STEP,
        }
    }
}

// ---------------------------------------------------------------------------
// AllocationModel — the in-memory session state
// ---------------------------------------------------------------------------

/// All activity configurations held by one editing session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationModel {
    pub configurations: BTreeMap<ActivityRef, ActivityConfiguration>,
}

impl AllocationModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configuration(&self, activity: &ActivityRef) -> Option<&ActivityConfiguration> {
        self.configurations.get(activity)
    }

    pub fn configuration_mut(
        &mut self,
        activity: &ActivityRef,
    ) -> Result<&mut ActivityConfiguration, AllocationError> {
        self.configurations
            .get_mut(activity)
            .ok_or_else(|| AllocationError::UnknownActivity {
                activity: activity.clone(),
            })
    }

    /// Configurations for one (business, year), in key order.
    pub fn configurations_for(&self, scope: &BusinessYear) -> Vec<&ActivityConfiguration> {
        self.configurations
            .values()
            .filter(|c| c.business_id == scope.business_id && c.year == scope.year)
            .collect()
    }

    /// Create or update the configuration for an activity.  Updates keep
    /// existing allocations, locks, and sequence state.
    pub fn select_activity(
        &mut self,
        activity: ActivityRef,
        activity_name: impl Into<String>,
        practice_percent: f64,
        selected_roles: BTreeSet<RoleId>,
    ) -> &mut ActivityConfiguration {
        let name = activity_name.into();
        let entry = self
            .configurations
            .entry(activity.clone())
            .or_insert_with(|| {
                ActivityConfiguration::new(
                    activity.business_id.as_str(),
                    activity.year,
                    activity.activity_id.as_str(),
                    name.clone(),
                    practice_percent,
                    BTreeSet::new(),
                )
            });
        entry.activity_name = name;
        entry.practice_percent = clamp_percent(practice_percent);
        entry.selected_roles = selected_roles;
        entry.active = true;
        entry
    }

    pub fn set_non_rd_time(
        &mut self,
        activity: &ActivityRef,
        non_rd_time: f64,
    ) -> Result<(), AllocationError> {
        self.configuration_mut(activity)?.non_rd_time = clamp_percent(non_rd_time);
        Ok(())
    }

    pub fn set_active(
        &mut self,
        activity: &ActivityRef,
        active: bool,
    ) -> Result<(), AllocationError> {
        self.configuration_mut(activity)?.active = active;
        Ok(())
    }

    /// Insert or update one subcomponent allocation.  Insertion assigns
    /// the next sequence number; update preserves the original one.
    pub fn select_subcomponent(
        &mut self,
        activity: &ActivityRef,
        key: AllocationKey,
        params: SubcomponentParams,
    ) -> Result<(), AllocationError> {
        let config = self.configuration_mut(activity)?;
        let sequence = match config.allocations.get(&key) {
            Some(existing) => existing.sequence,
            None => {
                let s = config.next_sequence;
                config.next_sequence += 1;
                s
            }
        };
        let allocation = SubcomponentAllocation {
            subcomponent_id: key.subcomponent_id.clone(),
            subcomponent_name: params.subcomponent_name,
            phase: key.phase.clone(),
            step: key.step.clone(),
            time_percent: clamp_percent(params.time_percent),
            frequency_percent: clamp_percent(params.frequency_percent),
            year_percent: clamp_percent(params.year_percent),
            start_year: params.start_year,
            selected_roles: params.selected_roles,
            is_non_rd: params.is_non_rd,
            sequence,
        };
        config.allocations.insert(key, allocation);
        Ok(())
    }

    /// Remove one allocation.  Removing the last member of a step also
    /// drops that step's lock flag; the derived aggregate disappears
    /// with its members.
    pub fn deselect_subcomponent(
        &mut self,
        activity: &ActivityRef,
        key: &AllocationKey,
    ) -> Result<SubcomponentAllocation, AllocationError> {
        let config = self.configuration_mut(activity)?;
        let removed =
            config
                .allocations
                .remove(key)
                .ok_or_else(|| AllocationError::UnknownAllocation {
                    activity: activity.clone(),
                    key: key.clone(),
                })?;
        let step = removed.step_key();
        if config.step_members(&step).is_empty() {
            config.locked_steps.remove(&step);
        }
        Ok(removed)
    }

    /// Remove a whole configuration.
    pub fn deselect_activity(
        &mut self,
        activity: &ActivityRef,
    ) -> Result<ActivityConfiguration, AllocationError> {
        self.configurations
            .remove(activity)
            .ok_or_else(|| AllocationError::UnknownActivity {
                activity: activity.clone(),
            })
    }

    /// Pin a step's time percent, excluding it from redistribution.
    pub fn lock_step(
        &mut self,
        activity: &ActivityRef,
        step: StepKey,
    ) -> Result<(), AllocationError> {
        let config = self.configuration_mut(activity)?;
        if config.step_members(&step).is_empty() {
            return Err(AllocationError::UnknownStep {
                activity: activity.clone(),
                step,
            });
        }
        config.locked_steps.insert(step);
        Ok(())
    }

    pub fn unlock_step(
        &mut self,
        activity: &ActivityRef,
        step: &StepKey,
    ) -> Result<bool, AllocationError> {
        Ok(self.configuration_mut(activity)?.locked_steps.remove(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(ids: &[&str]) -> BTreeSet<RoleId> {
        ids.iter().map(|r| RoleId::new(*r)).collect()
    }

    fn params(name: &str) -> SubcomponentParams {
        SubcomponentParams {
            subcomponent_name: name.to_string(),
            time_percent: 100.0,
            frequency_percent: 100.0,
            year_percent: 100.0,
            start_year: Some(2024),
            selected_roles: roles(&["engineer"]),
            is_non_rd: false,
        }
    }

    #[test]
    fn select_activity_clamps_practice_percent() {
        let mut model = AllocationModel::new();
        let config = model.select_activity(
            ActivityRef::new("biz-1", 2024, "act-1"),
            "Assay Development",
            140.0,
            roles(&["scientist"]),
        );
        assert_eq!(config.practice_percent, 100.0);

        let config = model.select_activity(
            ActivityRef::new("biz-1", 2024, "act-1"),
            "Assay Development",
            -5.0,
            roles(&["scientist"]),
        );
        assert_eq!(config.practice_percent, 0.0);
    }

    #[test]
    fn reselect_preserves_allocations_and_sequences() {
        let mut model = AllocationModel::new();
        let activity = ActivityRef::new("biz-1", 2024, "act-1");
        model.select_activity(activity.clone(), "Assay Development", 50.0, roles(&[]));
        model
            .select_subcomponent(
                &activity,
                AllocationKey::new("Research", "Protocol Design", "sub-1"),
                params("Reagent Selection"),
            )
            .expect("select sub");

        model.select_activity(activity.clone(), "Assay Development", 60.0, roles(&["lead"]));
        let config = model.configuration(&activity).expect("config");
        assert_eq!(config.allocations.len(), 1);
        assert_eq!(config.practice_percent, 60.0);
    }

    #[test]
    fn sequences_are_assigned_in_insertion_order_and_survive_updates() {
        let mut model = AllocationModel::new();
        let activity = ActivityRef::new("biz-1", 2024, "act-1");
        model.select_activity(activity.clone(), "Assay Development", 50.0, roles(&[]));

        let key_a = AllocationKey::new("Research", "Protocol Design", "sub-a");
        let key_b = AllocationKey::new("Research", "Protocol Design", "sub-b");
        model
            .select_subcomponent(&activity, key_a.clone(), params("A"))
            .expect("a");
        model
            .select_subcomponent(&activity, key_b.clone(), params("B"))
            .expect("b");
        // Update A; its sequence must not change.
        model
            .select_subcomponent(&activity, key_a.clone(), params("A updated"))
            .expect("a update");

        let config = model.configuration(&activity).expect("config");
        assert_eq!(config.allocations[&key_a].sequence, 0);
        assert_eq!(config.allocations[&key_b].sequence, 1);
        assert_eq!(config.next_sequence, 2);
    }

    #[test]
    fn removing_last_step_member_drops_the_lock() {
        let mut model = AllocationModel::new();
        let activity = ActivityRef::new("biz-1", 2024, "act-1");
        model.select_activity(activity.clone(), "Assay Development", 50.0, roles(&[]));

        let key = AllocationKey::new("Research", "Protocol Design", "sub-1");
        model
            .select_subcomponent(&activity, key.clone(), params("Reagent Selection"))
            .expect("select");
        let step = key.step_key();
        model.lock_step(&activity, step.clone()).expect("lock");
        assert!(model.configuration(&activity).expect("config").locked_steps.contains(&step));

        model.deselect_subcomponent(&activity, &key).expect("deselect");
        assert!(!model.configuration(&activity).expect("config").locked_steps.contains(&step));
    }

    #[test]
    fn lock_step_requires_members() {
        let mut model = AllocationModel::new();
        let activity = ActivityRef::new("biz-1", 2024, "act-1");
        model.select_activity(activity.clone(), "Assay Development", 50.0, roles(&[]));
        let err = model
            .lock_step(&activity, StepKey::new("Research", "Nothing Here"))
            .expect_err("no members");
        assert_eq!(err.stable_code(), "QRA-ALLOC-0003");
    }

    #[test]
    fn operations_on_missing_activity_fail_with_stable_code() {
        let mut model = AllocationModel::new();
        let missing = ActivityRef::new("biz-1", 2024, "act-404");
        let err = model
            .select_subcomponent(
                &missing,
                AllocationKey::new("Research", "Protocol Design", "sub-1"),
                params("Reagent Selection"),
            )
            .expect_err("missing activity");
        assert_eq!(err.stable_code(), "QRA-ALLOC-0001");
    }

    #[test]
    fn distinct_counts_deduplicate_ids_and_steps() {
        let mut model = AllocationModel::new();
        let activity = ActivityRef::new("biz-1", 2024, "act-1");
        model.select_activity(activity.clone(), "Assay Development", 50.0, roles(&[]));
        // Same subcomponent id under two different steps.
        model
            .select_subcomponent(
                &activity,
                AllocationKey::new("Research", "Protocol Design", "sub-1"),
                params("Reagent Selection"),
            )
            .expect("first");
        model
            .select_subcomponent(
                &activity,
                AllocationKey::new("Research", "Data Analysis", "sub-1"),
                params("Reagent Selection"),
            )
            .expect("second");

        let config = model.configuration(&activity).expect("config");
        assert_eq!(config.allocations.len(), 2);
        assert_eq!(config.distinct_subcomponent_count(), 1);
        assert_eq!(config.distinct_step_count(), 2);
    }
}
