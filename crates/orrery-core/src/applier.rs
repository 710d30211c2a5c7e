//! The single applier thread and the translation of queued changes into
//! arena mutations.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use tracing::{debug, debug_span, trace, warn};

use crate::cell_map::CellId;
use crate::change::{ApplierMessage, Change};
use crate::components::*;
use crate::config::{Composition, UniverseConfig};
use crate::error::SpatialError;
use crate::events::Outbox;
use crate::proximity::ProximityRecord;
use crate::space::Space;
use crate::systems;
use crate::universe::Shared;

pub(crate) fn spawn(
    shared: Arc<Shared>,
    receiver: Receiver<ApplierMessage>,
) -> Result<JoinHandle<()>, SpatialError> {
    thread::Builder::new()
        .name(shared.config.applier_thread_name.clone())
        .spawn(move || run(&shared, &receiver))
        .map_err(|e| SpatialError::ApplierSpawn(e.to_string()))
}

/// Closes the ledger and releases waiters however the run loop ends.
struct Closing<'a>(&'a Shared);

impl Drop for Closing<'_> {
    fn drop(&mut self) {
        self.0.registry.lock().close();
        self.0.watermark.close();
    }
}

fn run(shared: &Shared, receiver: &Receiver<ApplierMessage>) {
    let _closing = Closing(shared);
    debug!("change applier started");
    for message in receiver.iter() {
        match message {
            ApplierMessage::Batch { seq, changes } => apply_batch(shared, seq, changes),
            ApplierMessage::Shutdown => break,
        }
    }
    debug!("change applier stopped");
}

fn apply_batch(shared: &Shared, seq: u64, changes: Vec<Change>) {
    let span = debug_span!("apply_batch", seq);
    let _enter = span.enter();

    let count = changes.len();
    let mut outbox = Outbox::default();
    {
        let mut space = shared.space.write();
        let drifted = apply_changes(&mut space, changes, &shared.config, &mut outbox);
        shared.registry.lock().reconcile(seq, drifted, |id| space.links(id));
    }
    trace!(changes = count, events = outbox.len(), "batch applied");
    outbox.dispatch();
    shared.watermark.advance(seq);
}

/// Apply `changes` in order. Proximity and transform events for each change
/// are evaluated before the next one runs. Returns the cells whose links
/// the applier changed beyond what the ledger recorded.
pub(crate) fn apply_changes(
    space: &mut Space,
    changes: Vec<Change>,
    config: &UniverseConfig,
    outbox: &mut Outbox,
) -> BTreeSet<CellId> {
    let mut drifted = BTreeSet::new();
    for change in changes {
        trace!(?change, "applying change");
        let mut moved = Vec::new();
        apply_change(space, change, config, &mut moved, &mut drifted, outbox);
        systems::notify_moved(space, &moved, config.transitions, outbox);
    }
    drifted
}

fn skip(kind: &str, id: CellId) {
    warn!(cell = %id, change = kind, "unknown cell; skipping change");
}

fn apply_change(
    space: &mut Space,
    change: Change,
    config: &UniverseConfig,
    moved: &mut Vec<CellId>,
    drifted: &mut BTreeSet<CellId>,
    outbox: &mut Outbox,
) {
    let kind = change.kind_name();
    let mode = config.composition;
    match change {
        Change::CreateCell {
            id,
            kind: cell_kind,
            transform,
            bounds,
        } => {
            if space.contains(id) {
                warn!(cell = %id, "cell already exists; skipping create");
                return;
            }
            space.spawn_cell(id, cell_kind, transform, bounds);
            moved.push(id);
        }

        Change::RemoveCell { id } => {
            if !space.contains(id) {
                return skip(kind, id);
            }
            remove_cell(space, id, mode, moved);
        }

        Change::SetLocalTransform { id, transform } => {
            if !space.write(id, LocalTransform(transform)) {
                return skip(kind, id);
            }
            systems::transform_changed(space, id, mode, moved);
            if let Some(decided) = systems::check_reparent(space, id, config.reparent, mode) {
                systems::reparent(space, &decided, mode, moved);
                drifted.extend([decided.cell, decided.from, decided.to]);
            }
        }

        Change::SetLocalBounds { id, bounds } => {
            if !space.write(id, LocalBounds(bounds)) {
                return skip(kind, id);
            }
            systems::bounds_changed(space, id);
        }

        Change::AddChild { parent, child } => {
            if !space.contains(parent) {
                return skip(kind, parent);
            }
            if !space.contains(child) {
                return skip(kind, child);
            }
            let current = space.parent_of(child);
            if current == Some(parent) {
                return;
            }
            if space.is_ancestor_or_self(child, parent) {
                warn!(%child, %parent, "link would close a cycle; skipping add_child");
                drifted.extend([child, parent]);
                return;
            }
            // The ledger saw the child free, so any other link is one the
            // applier made itself.
            if let Some(current) = current {
                debug!(%child, %current, %parent, "moving relinked child to its committed parent");
                systems::child_removed(space, current, child, mode, moved);
                drifted.extend([child, current, parent]);
            }
            systems::child_added(space, parent, child, mode, moved);
        }

        Change::RemoveChild { parent, child } => {
            let Some(current) = space.parent_of(child) else {
                warn!(%child, %parent, "child has no parent; skipping remove_child");
                return;
            };
            if current != parent {
                debug!(%child, %current, %parent, "detaching relinked child from current parent");
                drifted.extend([child, current, parent]);
            }
            systems::child_removed(space, current, child, mode, moved);
        }

        Change::AddRoot { id } => {
            if !space.contains(id) {
                return skip(kind, id);
            }
            if let Some(parent) = space.parent_of(id) {
                debug!(cell = %id, %parent, "detaching relinked cell before making it a root");
                systems::child_removed(space, parent, id, mode, moved);
                drifted.extend([id, parent]);
            }
            space.roots.insert(id);
        }

        Change::RemoveRoot { id } => {
            if !space.roots.remove(&id) {
                warn!(cell = %id, "cell is not a root; skipping remove_root");
            }
        }

        Change::AddProximityListener {
            id,
            listener_id,
            volumes,
            listener,
        } => {
            let Some(world) = space.world_transform(id) else {
                return skip(kind, id);
            };
            match ProximityRecord::new(listener_id, listener, volumes, &world) {
                Ok(record) => {
                    space.update::<ProximityRecords, _>(id, |records| records.0.push(record));
                    space.listening.insert(id);
                    systems::evaluate_viewers(space, id, config.transitions, outbox);
                }
                Err(err) => warn!(cell = %id, %err, "rejected proximity listener"),
            }
        }

        Change::SetProximityBounds {
            id,
            listener_id,
            volumes,
        } => {
            let Some(world) = space.world_transform(id) else {
                return skip(kind, id);
            };
            let result = space
                .update::<ProximityRecords, _>(id, |records| {
                    records
                        .0
                        .iter_mut()
                        .find(|r| r.id() == listener_id)
                        .map(|r| r.set_proximity_bounds(volumes, &world))
                })
                .flatten();
            match result {
                Some(Ok(())) => systems::evaluate_viewers(space, id, config.transitions, outbox),
                Some(Err(err)) => warn!(cell = %id, %err, "rejected proximity bounds"),
                None => warn!(cell = %id, listener = %listener_id, "unknown proximity listener"),
            }
        }

        Change::RemoveProximityListener { id, listener_id } => {
            let remaining = space.update::<ProximityRecords, _>(id, |records| {
                records.0.retain(|r| r.id() != listener_id);
                records.0.len()
            });
            match remaining {
                None => skip(kind, id),
                Some(0) => {
                    space.listening.remove(&id);
                }
                Some(_) => {}
            }
        }

        Change::AddTransformListener {
            id,
            listener_id,
            listener,
        } => {
            let added = space.update::<TransformListeners, _>(id, |listeners| {
                listeners.0.push((listener_id, listener));
            });
            if added.is_none() {
                skip(kind, id);
            }
        }

        Change::RemoveTransformListener { id, listener_id } => {
            let removed = space.update::<TransformListeners, _>(id, |listeners| {
                listeners.0.retain(|(existing, _)| *existing != listener_id);
            });
            if removed.is_none() {
                skip(kind, id);
            }
        }

        Change::ViewLogin { id } => {
            if !space.contains(id) {
                return skip(kind, id);
            }
            if space.add_viewer(id) {
                systems::evaluate_viewer(space, id, config.transitions, outbox);
                debug!(cell = %id, "viewer logged in");
            }
        }

        Change::ViewLogout { id } => {
            if !space.contains(id) {
                return skip(kind, id);
            }
            if space.remove_viewer(id) {
                systems::viewer_left(space, id, config.transitions, outbox);
                debug!(cell = %id, "viewer logged out");
            }
        }
    }
}

/// Detach from the parent, orphan the children, then drop the cell. Viewer
/// state held for a removed view cell is forgotten without exit events.
fn remove_cell(space: &mut Space, id: CellId, mode: Composition, moved: &mut Vec<CellId>) {
    if let Some(parent) = space.parent_of(id) {
        space.update::<Children, _>(parent, |children| children.remove(id));
        systems::bounds_changed(space, parent);
    }
    for child in space.children_of(id) {
        space.write(child, Parent(None));
        systems::propagate(space, child, None, mode, moved);
    }

    let was_viewer = space.viewers.contains(&id);
    space.despawn_cell(id);
    if was_viewer {
        let cells: Vec<CellId> = space.listening.iter().copied().collect();
        for cell in cells {
            space.update::<ProximityRecords, _>(cell, |records| {
                for record in &mut records.0 {
                    record.forget_viewer(id);
                }
            });
        }
    }
    moved.retain(|&m| m != id);
    debug!(cell = %id, "cell removed");
}
