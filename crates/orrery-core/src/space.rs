//! The applied world state: a hecs arena of cells plus the index sets the
//! applier and queries need.

use std::collections::BTreeSet;

use hecs::{Component, World};

use crate::bounds::BoundingVolume;
use crate::cell_map::{CellId, CellKind, CellMap};
use crate::components::*;
use crate::transform::Transform;

/// A cell's graph links as the arena currently has them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Links {
    pub(crate) parent: Option<CellId>,
    pub(crate) children: Vec<CellId>,
    pub(crate) root: bool,
}

#[derive(Default)]
pub(crate) struct Space {
    pub(crate) world: World,
    pub(crate) cells: CellMap,
    pub(crate) roots: BTreeSet<CellId>,
    pub(crate) viewers: BTreeSet<CellId>,
    /// Cells carrying at least one proximity record.
    pub(crate) listening: BTreeSet<CellId>,
}

impl Space {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn a parentless cell whose world state equals its local state.
    pub(crate) fn spawn_cell(
        &mut self,
        id: CellId,
        kind: CellKind,
        transform: Transform,
        bounds: BoundingVolume,
    ) -> hecs::Entity {
        let entity = self.world.spawn((
            CellTag(id),
            LocalTransform(transform),
            LocalBounds(bounds),
            WorldTransform(transform),
            WorldBounds(transform.apply_to_volume(&bounds)),
            Parent(None),
            Children::default(),
            ProximityRecords::default(),
            TransformListeners::default(),
        ));
        self.cells.insert(id, entity);
        match kind {
            CellKind::Plain => {}
            CellKind::View => {
                self.add_viewer(id);
            }
            CellKind::Container => {
                let _ = self.world.insert_one(entity, Container);
            }
        }
        entity
    }

    /// Mark `id` as a viewer. False if the cell is unknown or already one.
    pub(crate) fn add_viewer(&mut self, id: CellId) -> bool {
        let Some(entity) = self.cells.get(id) else {
            return false;
        };
        if !self.viewers.insert(id) {
            return false;
        }
        let _ = self.world.insert_one(entity, ViewCell);
        true
    }

    /// Clear the viewer marker. False if the cell is unknown or not a viewer.
    pub(crate) fn remove_viewer(&mut self, id: CellId) -> bool {
        let Some(entity) = self.cells.get(id) else {
            return false;
        };
        if !self.viewers.remove(&id) {
            return false;
        }
        let _ = self.world.remove_one::<ViewCell>(entity);
        true
    }

    /// Drop the entity and every index entry. Graph links must already
    /// have been cut by the caller.
    pub(crate) fn despawn_cell(&mut self, id: CellId) -> bool {
        let Some(entity) = self.cells.remove(id) else {
            return false;
        };
        let _ = self.world.despawn(entity);
        self.roots.remove(&id);
        self.viewers.remove(&id);
        self.listening.remove(&id);
        true
    }

    pub(crate) fn contains(&self, id: CellId) -> bool {
        self.cells.contains(id)
    }

    /// Copy a component out of the arena.
    pub(crate) fn read<T: Component + Clone>(&self, id: CellId) -> Option<T> {
        let entity = self.cells.get(id)?;
        self.world.get::<&T>(entity).ok().map(|c| (*c).clone())
    }

    /// Overwrite a component. Returns false for unknown cells.
    pub(crate) fn write<T: Component>(&mut self, id: CellId, value: T) -> bool {
        let Some(entity) = self.cells.get(id) else {
            return false;
        };
        match self.world.get::<&mut T>(entity) {
            Ok(mut slot) => {
                *slot = value;
                true
            }
            Err(_) => false,
        }
    }

    /// Mutate a component in place.
    pub(crate) fn update<T: Component, R>(
        &mut self,
        id: CellId,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let entity = self.cells.get(id)?;
        let mut slot = self.world.get::<&mut T>(entity).ok()?;
        Some(f(&mut *slot))
    }

    pub(crate) fn has<T: Component>(&self, id: CellId) -> bool {
        self.cells
            .get(id)
            .is_some_and(|entity| self.world.get::<&T>(entity).is_ok())
    }

    pub(crate) fn parent_of(&self, id: CellId) -> Option<CellId> {
        self.read::<Parent>(id).and_then(|p| p.0)
    }

    pub(crate) fn children_of(&self, id: CellId) -> Vec<CellId> {
        self.read::<Children>(id).map(|c| c.0).unwrap_or_default()
    }

    pub(crate) fn links(&self, id: CellId) -> Option<Links> {
        if !self.contains(id) {
            return None;
        }
        Some(Links {
            parent: self.parent_of(id),
            children: self.children_of(id),
            root: self.roots.contains(&id),
        })
    }

    /// Walks up from `start`; true if `target` is `start` or an ancestor.
    pub(crate) fn is_ancestor_or_self(&self, target: CellId, start: CellId) -> bool {
        let mut current = Some(start);
        while let Some(id) = current {
            if id == target {
                return true;
            }
            current = self.parent_of(id);
        }
        false
    }

    pub(crate) fn world_transform(&self, id: CellId) -> Option<Transform> {
        self.read::<WorldTransform>(id).map(|w| w.0)
    }

    pub(crate) fn world_bounds(&self, id: CellId) -> Option<BoundingVolume> {
        self.read::<WorldBounds>(id).map(|w| w.0)
    }

    /// A cell's own local bounds placed with its world transform, ignoring
    /// its children.
    pub(crate) fn preferred_bounds(&self, id: CellId) -> Option<BoundingVolume> {
        let world = self.world_transform(id)?;
        let local = self.read::<LocalBounds>(id)?.0;
        Some(world.apply_to_volume(&local))
    }
}
