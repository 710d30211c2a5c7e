//! Bounds recalculation: keeps cached world transforms and bounds in step
//! with local edits and graph changes, then turns the resulting moves into
//! listener events.
//!
//! Every function here runs under the world write lock.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::bounds::BoundingVolume;
use crate::cell_map::CellId;
use crate::components::*;
use crate::config::{Composition, ReparentPolicy, TransitionPolicy};
use crate::events::{Outbox, TransformEvent};
use crate::space::Space;
use crate::transform::Transform;

/// A move decided by [`check_reparent`], applied with [`reparent`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Reparent {
    pub(crate) cell: CellId,
    pub(crate) from: CellId,
    pub(crate) to: CellId,
    /// Local transform under `to` that keeps the cell's world placement.
    pub(crate) local: Transform,
}

/// Recompute world transform and bounds for `id` and its whole subtree in
/// one pass: transforms on the way down, bounds on the way back up. Cells
/// whose world transform changed are appended to `moved`.
pub(crate) fn propagate(
    space: &mut Space,
    id: CellId,
    parent_world: Option<Transform>,
    mode: Composition,
    moved: &mut Vec<CellId>,
) -> Option<BoundingVolume> {
    let local = space.read::<LocalTransform>(id)?.0;
    let world = match parent_world {
        Some(parent) => Transform::compose(&parent, &local, mode),
        None => local,
    };
    if space.world_transform(id) != Some(world) {
        moved.push(id);
    }
    space.write(id, WorldTransform(world));

    let mut bounds = world.apply_to_volume(&space.read::<LocalBounds>(id)?.0);
    for child in space.children_of(id) {
        if let Some(child_bounds) = propagate(space, child, Some(world), mode, moved) {
            bounds = bounds.combine(&child_bounds);
        }
    }
    space.write(id, WorldBounds(bounds));
    Some(bounds)
}

/// The cell's local transform changed.
pub(crate) fn transform_changed(
    space: &mut Space,
    id: CellId,
    mode: Composition,
    moved: &mut Vec<CellId>,
) {
    let parent_world = space.parent_of(id).and_then(|p| space.world_transform(p));
    propagate(space, id, parent_world, mode, moved);
    enclose_upward(space, id);
}

/// Rebuild a cell's world bounds from its own bounds and its children's
/// current world bounds.
pub(crate) fn recompute_bounds(space: &mut Space, id: CellId) -> Option<BoundingVolume> {
    let mut bounds = space.preferred_bounds(id)?;
    for child in space.children_of(id) {
        if let Some(child_bounds) = space.world_bounds(child) {
            bounds = bounds.combine(&child_bounds);
        }
    }
    space.write(id, WorldBounds(bounds));
    Some(bounds)
}

/// The cell's local bounds changed.
pub(crate) fn bounds_changed(space: &mut Space, id: CellId) {
    recompute_bounds(space, id);
    enclose_upward(space, id);
}

/// Grow ancestors until one already encloses the subtree below it.
pub(crate) fn enclose_upward(space: &mut Space, id: CellId) {
    let Some(mut bounds) = space.world_bounds(id) else {
        return;
    };
    let mut current = id;
    while let Some(parent) = space.parent_of(current) {
        let Some(parent_bounds) = space.world_bounds(parent) else {
            break;
        };
        if parent_bounds.encloses(&bounds) {
            break;
        }
        bounds = parent_bounds.combine(&bounds);
        space.write(parent, WorldBounds(bounds));
        current = parent;
    }
}

fn attach(space: &mut Space, parent: CellId, child: CellId) {
    space.update::<Children, _>(parent, |c| c.insert(child));
    space.write(child, Parent(Some(parent)));
}

fn detach(space: &mut Space, parent: CellId, child: CellId) {
    space.update::<Children, _>(parent, |c| c.remove(child));
    space.write(child, Parent(None));
}

/// Link `child` under `parent` and bring the child's subtree into the
/// parent's frame.
pub(crate) fn child_added(
    space: &mut Space,
    parent: CellId,
    child: CellId,
    mode: Composition,
    moved: &mut Vec<CellId>,
) {
    attach(space, parent, child);
    let parent_world = space.world_transform(parent);
    propagate(space, child, parent_world, mode, moved);
    enclose_upward(space, child);
}

/// Unlink `child`: the parent shrinks to its remaining children and the
/// child's subtree is recomputed as parentless.
pub(crate) fn child_removed(
    space: &mut Space,
    parent: CellId,
    child: CellId,
    mode: Composition,
    moved: &mut Vec<CellId>,
) {
    detach(space, parent, child);
    bounds_changed(space, parent);
    propagate(space, child, None, mode, moved);
}

/// Check whether a moved cell's center is still inside its parent's
/// preferred bounds. Parents without bounds of their own are grouping nodes
/// and never complain.
pub(crate) fn check_reparent(
    space: &Space,
    id: CellId,
    policy: ReparentPolicy,
    mode: Composition,
) -> Option<Reparent> {
    let parent = space.parent_of(id)?;
    let preferred = space.preferred_bounds(parent)?;
    if preferred.is_empty() {
        return None;
    }
    let world = space.world_transform(id)?;
    let center = world.translation();
    if preferred.contains(center) {
        return None;
    }

    match policy {
        ReparentPolicy::WarnOnly => {
            warn!(cell = %id, %parent, "cell center left its parent's preferred bounds");
            None
        }
        ReparentPolicy::ToContainer => {
            let mut candidate = space.parent_of(parent);
            while let Some(target) = candidate {
                let holds = space.has::<Container>(target)
                    && space.preferred_bounds(target).is_some_and(|b| b.contains(center));
                if holds {
                    let target_world = space.world_transform(target)?;
                    let scale = space.read::<LocalTransform>(id)?.0.scale();
                    let Some(local) = Transform::relative_to(&target_world, &world, scale, mode)
                    else {
                        warn!(
                            cell = %id,
                            container = %target,
                            "container scale is degenerate or non-uniform; not reparenting"
                        );
                        return None;
                    };
                    return Some(Reparent {
                        cell: id,
                        from: parent,
                        to: target,
                        local,
                    });
                }
                candidate = space.parent_of(target);
            }
            warn!(
                cell = %id,
                %parent,
                "cell center left its parent's preferred bounds and no container holds it"
            );
            None
        }
    }
}

/// Move a cell under a new parent, keeping its world placement.
pub(crate) fn reparent(
    space: &mut Space,
    change: &Reparent,
    mode: Composition,
    moved: &mut Vec<CellId>,
) {
    detach(space, change.from, change.cell);
    bounds_changed(space, change.from);
    space.write(change.cell, LocalTransform(change.local));
    child_added(space, change.to, change.cell, mode, moved);
    debug!(
        cell = %change.cell,
        from = %change.from,
        to = %change.to,
        "reparented cell into container"
    );
}

fn evaluate(
    space: &mut Space,
    cell: CellId,
    viewers: &[(CellId, Transform)],
    policy: TransitionPolicy,
    outbox: &mut Outbox,
) {
    space.update::<ProximityRecords, _>(cell, |records| {
        for record in &mut records.0 {
            for (viewer, world) in viewers {
                for event in record.viewer_moved(cell, *viewer, world, policy) {
                    outbox.push_proximity(record.listener(), event);
                }
            }
        }
    });
}

/// Evaluate every viewer against the proximity records on `cell`.
pub(crate) fn evaluate_viewers(
    space: &mut Space,
    cell: CellId,
    policy: TransitionPolicy,
    outbox: &mut Outbox,
) {
    let viewers: Vec<(CellId, Transform)> = space
        .viewers
        .iter()
        .filter(|&&viewer| viewer != cell)
        .filter_map(|&viewer| space.world_transform(viewer).map(|w| (viewer, w)))
        .collect();
    evaluate(space, cell, &viewers, policy, outbox);
}

/// Evaluate one viewer against every proximity record except its own.
pub(crate) fn evaluate_viewer(
    space: &mut Space,
    viewer: CellId,
    policy: TransitionPolicy,
    outbox: &mut Outbox,
) {
    let Some(world) = space.world_transform(viewer) else {
        return;
    };
    let cells: Vec<CellId> = space.listening.iter().copied().filter(|&c| c != viewer).collect();
    for cell in cells {
        evaluate(space, cell, &[(viewer, world)], policy, outbox);
    }
}

/// Report `viewer` leaving every proximity volume it was inside.
pub(crate) fn viewer_left(
    space: &mut Space,
    viewer: CellId,
    policy: TransitionPolicy,
    outbox: &mut Outbox,
) {
    let cells: Vec<CellId> = space.listening.iter().copied().collect();
    for cell in cells {
        space.update::<ProximityRecords, _>(cell, |records| {
            for record in &mut records.0 {
                for event in record.viewer_left(cell, viewer, policy) {
                    outbox.push_proximity(record.listener(), event);
                }
            }
        });
    }
}

/// Queue transform events for moved cells, refresh the world volumes of
/// moved proximity cells, and re-evaluate the viewers affected by the move.
///
/// Every moved record is refreshed before any viewer is evaluated, so a
/// viewer carried along with a record never sees the record's old volumes.
pub(crate) fn notify_moved(
    space: &mut Space,
    moved: &[CellId],
    policy: TransitionPolicy,
    outbox: &mut Outbox,
) {
    let mut seen = BTreeSet::new();
    let moved: Vec<(CellId, Transform)> = moved
        .iter()
        .copied()
        .filter(|&id| seen.insert(id))
        .filter_map(|id| space.world_transform(id).map(|world| (id, world)))
        .collect();

    for &(id, world) in &moved {
        if space.listening.contains(&id) {
            space.update::<ProximityRecords, _>(id, |records| {
                for record in &mut records.0 {
                    record.update_world_bounds(&world);
                }
            });
        }
    }

    for &(id, world) in &moved {
        if let Some(local) = space.read::<LocalTransform>(id)
            && let Some(entity) = space.cells.get(id)
            && let Ok(listeners) = space.world.get::<&TransformListeners>(entity)
        {
            let event = TransformEvent {
                cell: id,
                local: local.0,
                world,
            };
            for (_, listener) in &listeners.0 {
                outbox.push_transform(listener.clone(), event);
            }
        }

        if space.listening.contains(&id) {
            evaluate_viewers(space, id, policy, outbox);
        }
        if space.viewers.contains(&id) {
            evaluate_viewer(space, id, policy, outbox);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell_map::CellKind;
    use crate::events::{ListenerId, ProximityEvent, ProximityListener};
    use crate::proximity::ProximityRecord;
    use glam::Vec3;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const MODE: Composition = Composition::Affine;

    fn cell(space: &mut Space, id: u64, at: Vec3, radius: f32) -> CellId {
        let id = CellId(id);
        space.spawn_cell(
            id,
            CellKind::Plain,
            Transform::from_translation(at),
            BoundingVolume::sphere(Vec3::ZERO, radius),
        );
        id
    }

    fn link(space: &mut Space, parent: CellId, child: CellId) -> Vec<CellId> {
        let mut moved = Vec::new();
        child_added(space, parent, child, MODE, &mut moved);
        moved
    }

    #[test]
    fn child_added_composes_and_encloses() {
        let mut space = Space::new();
        let root = cell(&mut space, 1, Vec3::new(10.0, 0.0, 0.0), 1.0);
        let child = cell(&mut space, 2, Vec3::new(5.0, 0.0, 0.0), 1.0);

        let moved = link(&mut space, root, child);
        assert_eq!(moved, vec![child]);

        let world = space.world_transform(child).unwrap();
        assert!(world.translation().abs_diff_eq(Vec3::new(15.0, 0.0, 0.0), 1e-5));
        let parent_bounds = space.world_bounds(root).unwrap();
        assert!(parent_bounds.encloses(&space.world_bounds(child).unwrap()));
        assert_eq!(space.children_of(root), vec![child]);
    }

    #[test]
    fn transform_change_reaches_grandchildren_and_ancestors() {
        let mut space = Space::new();
        let a = cell(&mut space, 1, Vec3::ZERO, 1.0);
        let b = cell(&mut space, 2, Vec3::X, 1.0);
        let c = cell(&mut space, 3, Vec3::X, 1.0);
        link(&mut space, a, b);
        link(&mut space, b, c);

        space.write(b, LocalTransform(Transform::from_translation(Vec3::new(50.0, 0.0, 0.0))));
        let mut moved = Vec::new();
        transform_changed(&mut space, b, MODE, &mut moved);
        assert_eq!(moved, vec![b, c]);

        let c_world = space.world_transform(c).unwrap();
        assert!(c_world.translation().abs_diff_eq(Vec3::new(51.0, 0.0, 0.0), 1e-5));
        let a_bounds = space.world_bounds(a).unwrap();
        assert!(a_bounds.encloses(&space.world_bounds(b).unwrap()));
        assert!(a_bounds.encloses(&space.world_bounds(c).unwrap()));
    }

    #[test]
    fn sibling_subtrees_are_untouched() {
        let mut space = Space::new();
        let root = cell(&mut space, 1, Vec3::ZERO, 100.0);
        let left = cell(&mut space, 2, Vec3::new(-10.0, 0.0, 0.0), 1.0);
        let right = cell(&mut space, 3, Vec3::new(10.0, 0.0, 0.0), 1.0);
        link(&mut space, root, left);
        link(&mut space, root, right);
        let before = space.world_bounds(left);

        space.write(right, LocalBounds(BoundingVolume::sphere(Vec3::ZERO, 4.0)));
        bounds_changed(&mut space, right);

        assert_eq!(space.world_bounds(left), before);
    }

    #[test]
    fn removing_a_child_shrinks_parent_and_frees_child() {
        let mut space = Space::new();
        let root = cell(&mut space, 1, Vec3::ZERO, 1.0);
        let child = cell(&mut space, 2, Vec3::new(20.0, 0.0, 0.0), 1.0);
        link(&mut space, root, child);
        assert!(space.world_bounds(root).unwrap().contains(Vec3::new(20.0, 0.0, 0.0)));

        let mut moved = Vec::new();
        child_removed(&mut space, root, child, MODE, &mut moved);

        assert!(!space.world_bounds(root).unwrap().contains(Vec3::new(20.0, 0.0, 0.0)));
        assert_eq!(space.parent_of(child), None);
        // Parentless again: world equals local.
        assert!(space
            .world_transform(child)
            .unwrap()
            .translation()
            .abs_diff_eq(Vec3::new(20.0, 0.0, 0.0), 1e-5));
    }

    #[test]
    fn warn_only_leaves_drifting_cells_in_place() {
        let mut space = Space::new();
        let root = cell(&mut space, 1, Vec3::ZERO, 5.0);
        let child = cell(&mut space, 2, Vec3::new(20.0, 0.0, 0.0), 1.0);
        link(&mut space, root, child);
        assert!(check_reparent(&space, child, ReparentPolicy::WarnOnly, MODE).is_none());
        assert_eq!(space.parent_of(child), Some(root));
    }

    #[test]
    fn to_container_moves_into_enclosing_container() {
        let mut space = Space::new();
        let room = CellId(1);
        space.spawn_cell(
            room,
            CellKind::Container,
            Transform::IDENTITY,
            BoundingVolume::sphere(Vec3::ZERO, 100.0),
        );
        let table = cell(&mut space, 2, Vec3::new(5.0, 0.0, 0.0), 2.0);
        let cup = cell(&mut space, 3, Vec3::new(0.5, 0.0, 0.0), 0.1);
        link(&mut space, room, table);
        link(&mut space, table, cup);

        space.write(cup, LocalTransform(Transform::from_translation(Vec3::new(30.0, 0.0, 0.0))));
        let mut moved = Vec::new();
        transform_changed(&mut space, cup, MODE, &mut moved);
        let world_before = space.world_transform(cup).unwrap();

        let decided = check_reparent(&space, cup, ReparentPolicy::ToContainer, MODE).unwrap();
        assert_eq!((decided.from, decided.to), (table, room));

        reparent(&mut space, &decided, MODE, &mut moved);
        assert_eq!(space.parent_of(cup), Some(room));
        assert!(space.children_of(table).is_empty());
        assert!(space.world_transform(cup).unwrap().abs_diff_eq(&world_before, 1e-4));
        assert!(space.world_bounds(room).unwrap().encloses(&space.world_bounds(cup).unwrap()));
    }

    #[test]
    fn moved_viewer_triggers_proximity_events() {
        let mut space = Space::new();
        let speaker = cell(&mut space, 1, Vec3::ZERO, 1.0);
        let avatar = CellId(2);
        space.spawn_cell(
            avatar,
            CellKind::View,
            Transform::from_translation(Vec3::new(50.0, 0.0, 0.0)),
            BoundingVolume::EMPTY,
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn ProximityListener> =
            Arc::new(move |e: &ProximityEvent| sink.lock().push((e.entered, e.index)));
        let record = ProximityRecord::new(
            ListenerId(1),
            listener,
            vec![BoundingVolume::sphere(Vec3::ZERO, 10.0)],
            &Transform::IDENTITY,
        )
        .unwrap();
        space.update::<ProximityRecords, _>(speaker, |r| r.0.push(record));
        space.listening.insert(speaker);

        space.write(avatar, LocalTransform(Transform::from_translation(Vec3::new(2.0, 0.0, 0.0))));
        let mut moved = Vec::new();
        transform_changed(&mut space, avatar, MODE, &mut moved);

        let mut outbox = Outbox::default();
        notify_moved(&mut space, &moved, TransitionPolicy::Collapse, &mut outbox);
        assert_eq!(outbox.len(), 1);
        outbox.dispatch();
        assert_eq!(*seen.lock(), vec![(true, 0)]);

        // Moving the speaker away drags its volume off the viewer.
        let away = Transform::from_translation(Vec3::new(-40.0, 0.0, 0.0));
        space.write(speaker, LocalTransform(away));
        let mut moved = Vec::new();
        transform_changed(&mut space, speaker, MODE, &mut moved);
        let mut outbox = Outbox::default();
        notify_moved(&mut space, &moved, TransitionPolicy::Collapse, &mut outbox);
        outbox.dispatch();
        assert_eq!(*seen.lock(), vec![(true, 0), (false, 0)]);
    }
}
