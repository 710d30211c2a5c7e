//! Per-cell ECS components.
//!
//! Every cell is one hecs entity. Spatial state uses the `Transform` and
//! `BoundingVolume` value types; graph links are stored as [`CellId`]s rather
//! than entity handles so the arena never holds ownership cycles.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::bounds::BoundingVolume;
use crate::cell_map::CellId;
use crate::events::{ListenerId, TransformListener};
use crate::proximity::ProximityRecord;
use crate::transform::Transform;

/// The id this entity was registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellTag(pub CellId);

/// Placement relative to the parent frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalTransform(pub Transform);

/// Extent relative to the parent frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalBounds(pub BoundingVolume);

/// Cached absolute placement, derived by the bounds engine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WorldTransform(pub Transform);

/// Cached absolute extent of the cell and its whole subtree.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WorldBounds(pub BoundingVolume);

/// `None` for parentless cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Parent(pub Option<CellId>);

/// Children in attach order. Never holds duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Children(pub Vec<CellId>);

impl Children {
    pub fn insert(&mut self, child: CellId) {
        if !self.0.contains(&child) {
            self.0.push(child);
        }
    }

    pub fn remove(&mut self, child: CellId) -> bool {
        let before = self.0.len();
        self.0.retain(|&c| c != child);
        self.0.len() != before
    }
}

/// Marker: the cell is a viewer for every proximity record.
#[derive(Debug, Clone, Copy)]
pub struct ViewCell;

/// Marker: the cell may adopt descendants that drift out of their parent.
#[derive(Debug, Clone, Copy)]
pub struct Container;

/// Proximity listeners registered on the cell.
#[derive(Default)]
pub struct ProximityRecords(pub Vec<ProximityRecord>);

/// Transform-change listeners registered on the cell.
#[derive(Default)]
pub struct TransformListeners(pub Vec<(ListenerId, Arc<dyn TransformListener>)>);

/// Column-major 4x4 snapshot of a world transform, ready to hand to a
/// renderer or a network encoder as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct WorldMatrix(pub [f32; 16]);

impl Default for WorldMatrix {
    fn default() -> Self {
        Self::from(&Transform::IDENTITY)
    }
}

impl From<&Transform> for WorldMatrix {
    fn from(transform: &Transform) -> Self {
        Self(transform.to_matrix().to_cols_array())
    }
}
