//! Research taxonomy reference data and the catalog lookup contract.
//!
//! The taxonomy is a six-level hierarchy (Category → Area → Focus →
//! Activity → Phase → Step → Subcomponent) supplied by an external
//! provider.  The engine only ever reads it, and it must keep working
//! when the catalog has no descriptive content for user-entered data:
//! a failed lookup is "no catalog data", never an error.
//!
//! Key behaviors:
//! - Stable ids; names need not be unique at any level.
//! - Every non-root node has exactly one parent whose kind is the
//!   immediate ancestor kind.  `InMemoryTaxonomyCatalog::insert`
//!   enforces this at the edge.
//! - Tolerant subcomponent lookup: exact name scoped to the named
//!   activity, then case-insensitive substring scoped to the activity,
//!   then unscoped case-insensitive substring as a last resort.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Component name for structured events.
pub const TAXONOMY_COMPONENT: &str = "taxonomy_catalog";

const ERROR_DUPLICATE_NODE: &str = "QRA-TAX-0001";
const ERROR_MISSING_PARENT: &str = "QRA-TAX-0002";
const ERROR_KIND_MISMATCH: &str = "QRA-TAX-0003";

// ---------------------------------------------------------------------------
// NodeId / NodeKind
// ---------------------------------------------------------------------------

/// Stable identifier for one taxonomy node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The seven node kinds, ordered root-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Category,
    Area,
    Focus,
    Activity,
    Phase,
    Step,
    Subcomponent,
}

impl NodeKind {
    /// All kinds in hierarchy order.
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Category,
        NodeKind::Area,
        NodeKind::Focus,
        NodeKind::Activity,
        NodeKind::Phase,
        NodeKind::Step,
        NodeKind::Subcomponent,
    ];

    /// Canonical string tag (also the export table name).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Area => "area",
            Self::Focus => "focus",
            Self::Activity => "activity",
            Self::Phase => "phase",
            Self::Step => "step",
            Self::Subcomponent => "subcomponent",
        }
    }

    /// The kind a parent of this kind must have; `None` for the root.
    pub const fn parent_kind(self) -> Option<NodeKind> {
        match self {
            Self::Category => None,
            Self::Area => Some(Self::Category),
            Self::Focus => Some(Self::Area),
            Self::Activity => Some(Self::Focus),
            Self::Phase => Some(Self::Activity),
            Self::Step => Some(Self::Phase),
            Self::Subcomponent => Some(Self::Step),
        }
    }

    /// The kind of this kind's children; `None` for the leaf.
    pub const fn child_kind(self) -> Option<NodeKind> {
        match self {
            Self::Category => Some(Self::Area),
            Self::Area => Some(Self::Focus),
            Self::Focus => Some(Self::Activity),
            Self::Activity => Some(Self::Phase),
            Self::Phase => Some(Self::Step),
            Self::Step => Some(Self::Subcomponent),
            Self::Subcomponent => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaxonomyNode
// ---------------------------------------------------------------------------

/// One node of the research taxonomy.
///
/// Descriptive fields are optional at every level; `hint` is only
/// meaningful on subcomponents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    /// Parent node id; `None` only for categories.
    pub parent: Option<NodeId>,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl TaxonomyNode {
    /// A node with no descriptive content.
    pub fn bare(
        id: impl Into<String>,
        kind: NodeKind,
        name: impl Into<String>,
        parent: Option<NodeId>,
    ) -> Self {
        Self {
            id: NodeId::new(id),
            kind,
            name: name.into(),
            parent,
            goal: None,
            hypothesis: None,
            uncertainties: None,
            alternatives: None,
            developmental_process: None,
            hint: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TaxonomyError
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaxonomyError {
    #[error("duplicate node id `{id}`")]
    DuplicateNode { id: NodeId },
    #[error("node `{id}` references missing parent `{parent}`")]
    MissingParent { id: NodeId, parent: NodeId },
    #[error("node `{id}` of kind {kind} cannot have parent of kind {parent_kind}")]
    KindMismatch {
        id: NodeId,
        kind: NodeKind,
        parent_kind: NodeKind,
    },
}

impl TaxonomyError {
    /// Stable machine-readable error code.
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::DuplicateNode { .. } => ERROR_DUPLICATE_NODE,
            Self::MissingParent { .. } => ERROR_MISSING_PARENT,
            Self::KindMismatch { .. } => ERROR_KIND_MISMATCH,
        }
    }
}

// ---------------------------------------------------------------------------
// TaxonomyCatalog — the read-only contract consumed by the engine
// ---------------------------------------------------------------------------

/// Read-only catalog contract.
///
/// Implementations must keep `children_of` in the provider's original
/// ordering; the even-distribution and normalization paths depend on a
/// stable order.
pub trait TaxonomyCatalog {
    /// Node by id, any kind.
    fn node(&self, id: &NodeId) -> Option<&TaxonomyNode>;

    /// Activity node by id; `None` when absent or not an activity.
    fn activity_by_id(&self, id: &NodeId) -> Option<&TaxonomyNode> {
        self.node(id).filter(|n| n.kind == NodeKind::Activity)
    }

    /// Direct children in insertion order.
    fn children_of(&self, id: &NodeId) -> Vec<&TaxonomyNode>;

    /// Tolerant subcomponent lookup scoped to an activity name.
    ///
    /// Match order: exact subcomponent name under the named activity,
    /// case-insensitive substring under the named activity, then
    /// case-insensitive substring anywhere.  `None` means "no catalog
    /// data" and is not an error condition.
    fn lookup_subcomponent(
        &self,
        activity_name: &str,
        subcomponent_name: &str,
    ) -> Option<&TaxonomyNode>;
}

// ---------------------------------------------------------------------------
// InMemoryTaxonomyCatalog — deterministic reference implementation
// ---------------------------------------------------------------------------

/// Deterministic in-memory catalog used by tests and local workflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryTaxonomyCatalog {
    nodes: BTreeMap<NodeId, TaxonomyNode>,
    /// Child ids per parent, in insertion order.
    children: BTreeMap<NodeId, Vec<NodeId>>,
    /// All subcomponent ids in insertion order, for unscoped fallback.
    subcomponents: Vec<NodeId>,
}

impl InMemoryTaxonomyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one node, enforcing the parent-kind invariant.
    pub fn insert(&mut self, node: TaxonomyNode) -> Result<(), TaxonomyError> {
        if self.nodes.contains_key(&node.id) {
            return Err(TaxonomyError::DuplicateNode { id: node.id });
        }
        match (node.kind.parent_kind(), &node.parent) {
            (None, _) => {}
            (Some(expected), Some(parent_id)) => {
                let parent =
                    self.nodes
                        .get(parent_id)
                        .ok_or_else(|| TaxonomyError::MissingParent {
                            id: node.id.clone(),
                            parent: parent_id.clone(),
                        })?;
                if parent.kind != expected {
                    return Err(TaxonomyError::KindMismatch {
                        id: node.id.clone(),
                        kind: node.kind,
                        parent_kind: parent.kind,
                    });
                }
            }
            (Some(_), None) => {
                return Err(TaxonomyError::MissingParent {
                    id: node.id.clone(),
                    parent: NodeId::new(""),
                });
            }
        }
        if let Some(parent_id) = &node.parent {
            self.children
                .entry(parent_id.clone())
                .or_default()
                .push(node.id.clone());
        }
        if node.kind == NodeKind::Subcomponent {
            self.subcomponents.push(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Number of nodes across all kinds.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The activity node a subcomponent belongs to, walking step → phase
    /// → activity.
    fn activity_of_subcomponent(&self, sub: &TaxonomyNode) -> Option<&TaxonomyNode> {
        let step = self.nodes.get(sub.parent.as_ref()?)?;
        let phase = self.nodes.get(step.parent.as_ref()?)?;
        self.nodes.get(phase.parent.as_ref()?)
    }

    fn subcomponents_under_activity<'a>(
        &'a self,
        activity_name: &str,
    ) -> impl Iterator<Item = &'a TaxonomyNode> + 'a {
        let wanted = activity_name.to_ascii_lowercase();
        self.subcomponents
            .iter()
            .filter_map(move |id| {
                let sub = self.nodes.get(id)?;
                let activity = self.activity_of_subcomponent(sub)?;
                if activity.name.to_ascii_lowercase() == wanted {
                    Some(sub)
                } else {
                    None
                }
            })
    }
}

impl TaxonomyCatalog for InMemoryTaxonomyCatalog {
    fn node(&self, id: &NodeId) -> Option<&TaxonomyNode> {
        self.nodes.get(id)
    }

    fn children_of(&self, id: &NodeId) -> Vec<&TaxonomyNode> {
        self.children
            .get(id)
            .map(|ids| ids.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    fn lookup_subcomponent(
        &self,
        activity_name: &str,
        subcomponent_name: &str,
    ) -> Option<&TaxonomyNode> {
        // Pass 1: exact name under the named activity.
        if let Some(hit) = self
            .subcomponents_under_activity(activity_name)
            .find(|s| s.name == subcomponent_name)
        {
            return Some(hit);
        }
        // Pass 2: case-insensitive substring under the named activity.
        let needle = subcomponent_name.to_ascii_lowercase();
        if let Some(hit) = self
            .subcomponents_under_activity(activity_name)
            .find(|s| s.name.to_ascii_lowercase().contains(&needle))
        {
            return Some(hit);
        }
        // Pass 3: unscoped substring, last resort.
        self.subcomponents
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .find(|s| s.name.to_ascii_lowercase().contains(&needle))
    }
}
