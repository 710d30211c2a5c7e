//! Lazy region queries over the applied world.

use std::sync::Arc;

use crate::bounds::BoundingVolume;
use crate::cell_map::{CellId, ROOT_CELL};
use crate::error::SpatialError;
use crate::space::Space;
use crate::universe::Shared;

/// Cells under a subtree whose world bounds intersect a query volume, in
/// depth-first order.
///
/// The read lock is taken per step and never held between calls to
/// [`Iterator::next`], so a long-lived iterator does not stall the applier.
/// Each step sees a consistent world, but consecutive steps may see
/// different ones if the applier ran in between.
pub struct VisibleCells {
    shared: Arc<Shared>,
    root: CellId,
    query: BoundingVolume,
    stack: Vec<CellId>,
}

impl VisibleCells {
    pub(crate) fn new(
        shared: Arc<Shared>,
        root: CellId,
        query: BoundingVolume,
    ) -> Result<Self, SpatialError> {
        let stack = seeds(&shared.space.read(), root)?;
        Ok(Self {
            shared,
            root,
            query,
            stack,
        })
    }

    pub fn query(&self) -> BoundingVolume {
        self.query
    }

    /// Start over from the subtree root. A root that has since been removed
    /// yields an empty sequence.
    pub fn restart(&mut self) {
        self.stack = seeds(&self.shared.space.read(), self.root).unwrap_or_default();
    }
}

/// [`ROOT_CELL`] stands for every registered root.
fn seeds(space: &Space, root: CellId) -> Result<Vec<CellId>, SpatialError> {
    if root == ROOT_CELL {
        return Ok(space.roots.iter().rev().copied().collect());
    }
    if !space.contains(root) {
        return Err(SpatialError::UnknownCell(root));
    }
    Ok(vec![root])
}

impl Iterator for VisibleCells {
    type Item = CellId;

    fn next(&mut self) -> Option<CellId> {
        let space = self.shared.space.read();
        while let Some(id) = self.stack.pop() {
            let Some(bounds) = space.world_bounds(id) else {
                continue;
            };
            // World bounds cover the whole subtree, so a miss prunes it.
            if !bounds.intersects(&self.query) {
                continue;
            }
            self.stack.extend(space.children_of(id).into_iter().rev());
            return Some(id);
        }
        None
    }
}
