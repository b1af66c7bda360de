//! Reporting statistics over exported configuration rows.
//!
//! Read-only aggregation for presentation-layer reporting: totals,
//! R&D vs non-R&D activity counts, a zero-guarded average, and the top
//! activities by applied percent.  Ties keep the caller's input order
//! (stable sort), so repeated reports over the same rows are identical.

use serde::{Deserialize, Serialize};

use crate::normalize::QraConfigurationRow;
use crate::taxonomy::NodeId;

/// Component name for structured events.
pub const STATISTICS_COMPONENT: &str = "statistics_aggregator";

/// How many activities the top list keeps.
pub const TOP_ACTIVITY_LIMIT: usize = 5;

// ---------------------------------------------------------------------------
// AllocationStatistics
// ---------------------------------------------------------------------------

/// One activity's share in the top list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityShare {
    pub activity_id: NodeId,
    pub activity_name: String,
    pub applied_percent: f64,
}

/// The aggregate report for one business/year's exported rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationStatistics {
    pub total_activities: usize,
    pub total_subcomponents: usize,
    pub total_applied_percent: f64,
    /// Activities with a positive total applied percent.
    pub rd_activities: usize,
    pub non_rd_activities: usize,
    /// Zero when there are no activities.
    pub average_applied_percent: f64,
    /// Descending by applied percent, ties in input order, at most
    /// `TOP_ACTIVITY_LIMIT` entries.
    pub top_activities: Vec<ActivityShare>,
}

/// Aggregate a set of configuration rows.
pub fn compute_statistics(rows: &[QraConfigurationRow]) -> AllocationStatistics {
    let total_activities = rows.len();
    let total_subcomponents = rows.iter().map(|r| r.subcomponent_count).sum();
    let total_applied_percent: f64 = rows.iter().map(|r| r.total_applied_percent).sum();
    let rd_activities = rows.iter().filter(|r| r.total_applied_percent > 0.0).count();

    let average_applied_percent = if total_activities == 0 {
        0.0
    } else {
        total_applied_percent / total_activities as f64
    };

    let mut top_activities: Vec<ActivityShare> = rows
        .iter()
        .map(|r| ActivityShare {
            activity_id: r.activity_id.clone(),
            activity_name: r.activity_name.clone(),
            applied_percent: r.total_applied_percent,
        })
        .collect();
    // Stable sort keeps input order among ties.
    top_activities.sort_by(|a, b| {
        b.applied_percent
            .partial_cmp(&a.applied_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    top_activities.truncate(TOP_ACTIVITY_LIMIT);

    AllocationStatistics {
        total_activities,
        total_subcomponents,
        total_applied_percent,
        rd_activities,
        non_rd_activities: total_activities - rd_activities,
        average_applied_percent,
        top_activities,
    }
}
