//! Percentage cascade and rollup computation.
//!
//! The applied percent of one subcomponent allocation is the fully
//! cascaded share of business practice attributable to R&D:
//!
//! ```text
//! applied = practice * time * frequency * year / 1_000_000
//! ```
//!
//! Key behaviors:
//! - Applied percent is recomputed on every read, never stored; editing
//!   any of its four inputs can never leave a stale value behind.
//! - Step aggregates are derived views ordered by each step's first
//!   insertion sequence ("original ordering").
//! - Even distribution is exact: shares always sum to the distributable
//!   total.  Whole points first (`floor(total / n)`, one extra point to
//!   the first `total mod n` shares), any fractional residue left by
//!   locked steps goes to the first share.
//! - Locked steps keep their pinned time percent and are excluded from
//!   redistribution.

use serde::{Deserialize, Serialize};

use crate::allocation::{
    ActivityConfiguration, ActivityRef, AllocationError, AllocationModel, BusinessYear, StepKey,
    SubcomponentAllocation,
};

// ---------------------------------------------------------------------------
// Applied percent
// ---------------------------------------------------------------------------

/// The cascade formula.  Inputs are percentages in [0, 100].
pub fn applied_percent(
    practice_percent: f64,
    time_percent: f64,
    frequency_percent: f64,
    year_percent: f64,
) -> f64 {
    practice_percent * time_percent * frequency_percent * year_percent / 1_000_000.0
}

impl SubcomponentAllocation {
    /// Applied percent under the given parent practice percent.
    pub fn applied_percent(&self, practice_percent: f64) -> f64 {
        applied_percent(
            practice_percent,
            self.time_percent,
            self.frequency_percent,
            self.year_percent,
        )
    }
}

// ---------------------------------------------------------------------------
// StepAggregate — derived, never stored
// ---------------------------------------------------------------------------

/// Per-step view over one activity's allocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAggregate {
    pub key: StepKey,
    /// The step's time percent (shared by all members).
    pub time_percent: f64,
    pub is_locked: bool,
    pub subcomponent_count: usize,
    pub total_applied_percent: f64,
    /// Sequence of the step's earliest member; defines step ordering.
    pub first_sequence: u64,
}

/// Derive the step aggregates for one configuration, ordered by first
/// insertion sequence.
pub fn step_aggregates(config: &ActivityConfiguration) -> Vec<StepAggregate> {
    let mut out: Vec<StepAggregate> = Vec::new();
    for allocation in config.allocations_by_sequence() {
        let key = allocation.step_key();
        match out.iter_mut().find(|agg| agg.key == key) {
            Some(agg) => {
                agg.subcomponent_count += 1;
                agg.total_applied_percent += allocation.applied_percent(config.practice_percent);
            }
            None => out.push(StepAggregate {
                is_locked: config.locked_steps.contains(&key),
                key,
                // First member by sequence carries the step time.
                time_percent: allocation.time_percent,
                subcomponent_count: 1,
                total_applied_percent: allocation.applied_percent(config.practice_percent),
                first_sequence: allocation.sequence,
            }),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// ActivityRollup
// ---------------------------------------------------------------------------

/// Rollups persisted on the export row for one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRollup {
    pub total_applied_percent: f64,
    pub subcomponent_count: usize,
    pub step_count: usize,
}

/// Compute the export rollups for one configuration.
pub fn activity_rollup(config: &ActivityConfiguration) -> ActivityRollup {
    ActivityRollup {
        total_applied_percent: config
            .allocations
            .values()
            .map(|a| a.applied_percent(config.practice_percent))
            .sum(),
        subcomponent_count: config.distinct_subcomponent_count(),
        step_count: config.distinct_step_count(),
    }
}

/// Total applied percent across one (business, year).
pub fn business_year_total_applied(model: &AllocationModel, scope: &BusinessYear) -> f64 {
    model
        .configurations_for(scope)
        .iter()
        .map(|c| activity_rollup(c).total_applied_percent)
        .sum()
}

// ---------------------------------------------------------------------------
// Even distribution
// ---------------------------------------------------------------------------

/// Split `total` percentage points across `n` shares so that the shares
/// sum to exactly `total`.
///
/// Whole-point remainder rule: every share gets `floor(total / n)`, and
/// the first `total mod n` shares get one extra point.  A fractional
/// residue (possible when locked steps pin a non-integer total) is added
/// to the first share.  `n = 0` yields no shares.
pub fn even_split(total: f64, n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let total = total.max(0.0);
    let base = (total / n as f64).floor();
    let after_base = total - base * n as f64;
    let whole_extra = (after_base.floor() as usize).min(n);
    let residue = after_base - whole_extra as f64;

    let mut shares = vec![base; n];
    for share in shares.iter_mut().take(whole_extra) {
        *share += 1.0;
    }
    shares[0] += residue;
    shares
}

/// Assign each unlocked step an even share of the time remaining after
/// locked steps, in original step order.  Locked steps are untouched; a
/// configuration with no unlocked steps is left unchanged.
pub fn distribute_step_time_evenly(config: &mut ActivityConfiguration) {
    let aggregates = step_aggregates(config);
    let locked_total: f64 = aggregates
        .iter()
        .filter(|agg| agg.is_locked)
        .map(|agg| agg.time_percent)
        .sum();
    let unlocked: Vec<StepKey> = aggregates
        .iter()
        .filter(|agg| !agg.is_locked)
        .map(|agg| agg.key.clone())
        .collect();
    if unlocked.is_empty() {
        return;
    }

    let remaining = (100.0 - locked_total).max(0.0);
    let shares = even_split(remaining, unlocked.len());
    for (step, share) in unlocked.iter().zip(shares) {
        for allocation in config.allocations.values_mut() {
            if allocation.phase == step.phase && allocation.step == step.step {
                allocation.time_percent = share;
            }
        }
    }
}

/// Even frequency split across one step's subcomponents, in original
/// insertion order.
pub fn distribute_subcomponent_frequency_evenly(
    config: &mut ActivityConfiguration,
    step: &StepKey,
) -> Result<(), AllocationError> {
    let members: Vec<crate::allocation::AllocationKey> = config
        .step_members(step)
        .iter()
        .map(|a| a.key())
        .collect();
    if members.is_empty() {
        return Err(AllocationError::UnknownStep {
            activity: config.activity_ref(),
            step: step.clone(),
        });
    }
    let shares = even_split(100.0, members.len());
    for (key, share) in members.iter().zip(shares) {
        if let Some(allocation) = config.allocations.get_mut(key) {
            allocation.frequency_percent = share;
        }
    }
    Ok(())
}

// Model-level conveniences mirroring the public operation names.
impl AllocationModel {
    pub fn distribute_step_time_evenly(
        &mut self,
        activity: &ActivityRef,
    ) -> Result<(), AllocationError> {
        distribute_step_time_evenly(self.configuration_mut(activity)?);
        Ok(())
    }

    pub fn distribute_subcomponent_frequency_evenly(
        &mut self,
        activity: &ActivityRef,
        step: &StepKey,
    ) -> Result<(), AllocationError> {
        distribute_subcomponent_frequency_evenly(self.configuration_mut(activity)?, step)
    }
}
