//! Recording, validating and committing batches of changes.

use std::sync::Arc;

use tracing::debug;

use crate::bounds::BoundingVolume;
use crate::cell_map::{CellId, CellKind};
use crate::change::{Change, ChangeState, CommitTicket};
use crate::error::SpatialError;
use crate::events::{ListenerId, ProximityListener, TransformListener};
use crate::transform::Transform;
use crate::universe::Universe;

/// An open batch of changes against one [`Universe`].
///
/// Each call validates its change against the committed graph plus the
/// changes recorded so far, so configuration errors surface at the call that
/// introduces them. Nothing reaches the world until [`Transaction::commit`];
/// dropping the transaction discards everything it recorded.
pub struct Transaction<'u> {
    universe: &'u Universe,
    changes: Vec<Change>,
    state: ChangeState,
}

impl<'u> Transaction<'u> {
    pub(crate) fn new(universe: &'u Universe) -> Self {
        Self {
            universe,
            changes: Vec::new(),
            state: ChangeState::Pending,
        }
    }

    fn stage(&mut self, change: Change) -> Result<(), SpatialError> {
        self.universe
            .shared()
            .registry
            .lock()
            .validate(&self.changes, &change)?;
        self.changes.push(change);
        Ok(())
    }

    pub fn create_cell(
        &mut self,
        id: CellId,
        kind: CellKind,
        transform: Transform,
        bounds: BoundingVolume,
    ) -> Result<(), SpatialError> {
        self.stage(Change::CreateCell {
            id,
            kind,
            transform,
            bounds,
        })
    }

    pub fn remove_cell(&mut self, id: CellId) -> Result<(), SpatialError> {
        self.stage(Change::RemoveCell { id })
    }

    pub fn set_local_transform(
        &mut self,
        id: CellId,
        transform: Transform,
    ) -> Result<(), SpatialError> {
        self.stage(Change::SetLocalTransform { id, transform })
    }

    pub fn set_local_bounds(
        &mut self,
        id: CellId,
        bounds: BoundingVolume,
    ) -> Result<(), SpatialError> {
        self.stage(Change::SetLocalBounds { id, bounds })
    }

    pub fn add_child(&mut self, parent: CellId, child: CellId) -> Result<(), SpatialError> {
        self.stage(Change::AddChild { parent, child })
    }

    pub fn remove_child(&mut self, parent: CellId, child: CellId) -> Result<(), SpatialError> {
        self.stage(Change::RemoveChild { parent, child })
    }

    pub fn add_root(&mut self, id: CellId) -> Result<(), SpatialError> {
        self.stage(Change::AddRoot { id })
    }

    pub fn remove_root(&mut self, id: CellId) -> Result<(), SpatialError> {
        self.stage(Change::RemoveRoot { id })
    }

    /// Install nested containment volumes on `id`, outermost first, and
    /// register `listener` for enter/exit events. Viewers already inside
    /// are reported as soon as the change is applied.
    pub fn add_proximity_listener(
        &mut self,
        id: CellId,
        volumes: Vec<BoundingVolume>,
        listener: Arc<dyn ProximityListener>,
    ) -> Result<ListenerId, SpatialError> {
        let listener_id = self.universe.next_listener_id();
        self.stage(Change::AddProximityListener {
            id,
            listener_id,
            volumes,
            listener,
        })?;
        Ok(listener_id)
    }

    pub fn set_proximity_bounds(
        &mut self,
        id: CellId,
        listener: ListenerId,
        volumes: Vec<BoundingVolume>,
    ) -> Result<(), SpatialError> {
        self.stage(Change::SetProximityBounds {
            id,
            listener_id: listener,
            volumes,
        })
    }

    pub fn remove_proximity_listener(
        &mut self,
        id: CellId,
        listener: ListenerId,
    ) -> Result<(), SpatialError> {
        self.stage(Change::RemoveProximityListener {
            id,
            listener_id: listener,
        })
    }

    pub fn add_transform_listener(
        &mut self,
        id: CellId,
        listener: Arc<dyn TransformListener>,
    ) -> Result<ListenerId, SpatialError> {
        let listener_id = self.universe.next_listener_id();
        self.stage(Change::AddTransformListener {
            id,
            listener_id,
            listener,
        })?;
        Ok(listener_id)
    }

    pub fn remove_transform_listener(
        &mut self,
        id: CellId,
        listener: ListenerId,
    ) -> Result<(), SpatialError> {
        self.stage(Change::RemoveTransformListener {
            id,
            listener_id: listener,
        })
    }

    /// Start treating `id` as a viewer. Proximity records it is already
    /// inside report enters when the change is applied.
    pub fn view_login(&mut self, id: CellId) -> Result<(), SpatialError> {
        self.stage(Change::ViewLogin { id })
    }

    /// Stop treating `id` as a viewer. Every volume it was inside reports
    /// an exit.
    pub fn view_logout(&mut self, id: CellId) -> Result<(), SpatialError> {
        self.stage(Change::ViewLogout { id })
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn state(&self) -> ChangeState {
        self.state
    }

    /// Changes recorded so far, in order.
    pub fn pending(&self) -> &[Change] {
        &self.changes
    }

    /// Revalidate against everything committed in the meantime and hand the
    /// batch to the applier. On error the batch is discarded.
    pub fn commit(mut self) -> Result<CommitTicket, SpatialError> {
        let changes = std::mem::take(&mut self.changes);
        let count = changes.len();
        let shared = self.universe.shared();
        let result = shared.registry.lock().commit(changes);
        match result {
            Ok(seq) => {
                self.state = ChangeState::Queued;
                debug!(seq, changes = count, "transaction committed");
                Ok(CommitTicket::new(seq, shared.watermark.clone()))
            }
            Err(err) => {
                self.state = ChangeState::Discarded;
                debug!(changes = count, %err, "transaction rejected at commit");
                Err(err)
            }
        }
    }

    /// Drop every recorded change.
    pub fn abort(mut self) {
        self.state = ChangeState::Discarded;
        debug!(changes = self.changes.len(), "transaction aborted");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == ChangeState::Pending && !self.changes.is_empty() {
            debug!(
                changes = self.changes.len(),
                "transaction dropped without commit; changes discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UniverseConfig;
    use glam::Vec3;

    fn universe() -> Universe {
        Universe::new(UniverseConfig::default()).unwrap()
    }

    #[test]
    fn errors_surface_at_the_offending_call() {
        let universe = universe();
        let mut tx = universe.begin();
        tx.create_cell(CellId(1), CellKind::Plain, Transform::IDENTITY, BoundingVolume::EMPTY)
            .unwrap();
        assert_eq!(
            tx.create_cell(CellId(1), CellKind::Plain, Transform::IDENTITY, BoundingVolume::EMPTY),
            Err(SpatialError::DuplicateCell(CellId(1)))
        );
        assert_eq!(tx.add_child(CellId(1), CellId(2)), Err(SpatialError::UnknownCell(CellId(2))));
        // Rejected calls are not recorded.
        assert_eq!(tx.len(), 1);
        assert_eq!(tx.state(), ChangeState::Pending);
    }

    #[test]
    fn invalid_proximity_ordering_is_rejected() {
        let universe = universe();
        let mut tx = universe.begin();
        tx.create_cell(CellId(1), CellKind::Plain, Transform::IDENTITY, BoundingVolume::EMPTY)
            .unwrap();
        let listener: Arc<dyn ProximityListener> = Arc::new(|_: &crate::events::ProximityEvent| {});
        let inverted = vec![
            BoundingVolume::sphere(Vec3::ZERO, 5.0),
            BoundingVolume::sphere(Vec3::ZERO, 10.0),
        ];
        assert_eq!(
            tx.add_proximity_listener(CellId(1), inverted, listener),
            Err(SpatialError::InvalidOrdering { index: 1 })
        );
    }

    #[test]
    fn commit_returns_a_ticket_in_order() {
        let universe = universe();
        let mut first = universe.begin();
        first
            .create_cell(CellId(1), CellKind::Plain, Transform::IDENTITY, BoundingVolume::EMPTY)
            .unwrap();
        let a = first.commit().unwrap();

        let mut second = universe.begin();
        second.add_root(CellId(1)).unwrap();
        let b = second.commit().unwrap();

        assert!(b.seq() > a.seq());
        b.wait().unwrap();
        assert_eq!(a.state(), ChangeState::Applied);
        assert!(universe.is_root(CellId(1)));
    }

    #[test]
    fn losing_a_commit_race_discards_the_batch() {
        let universe = universe();
        let mut first = universe.begin();
        let mut second = universe.begin();
        first
            .create_cell(CellId(5), CellKind::Plain, Transform::IDENTITY, BoundingVolume::EMPTY)
            .unwrap();
        second
            .create_cell(CellId(5), CellKind::Plain, Transform::IDENTITY, BoundingVolume::EMPTY)
            .unwrap();
        first.commit().unwrap();
        assert_eq!(second.commit().unwrap_err(), SpatialError::DuplicateCell(CellId(5)));
    }

    #[test]
    fn aborted_changes_never_apply() {
        let universe = universe();
        let mut tx = universe.begin();
        tx.create_cell(CellId(3), CellKind::Plain, Transform::IDENTITY, BoundingVolume::EMPTY)
            .unwrap();
        tx.abort();
        universe.sync().unwrap();
        assert!(!universe.contains_cell(CellId(3)));

        // The id is still free.
        let mut tx = universe.begin();
        assert!(tx
            .create_cell(CellId(3), CellKind::Plain, Transform::IDENTITY, BoundingVolume::EMPTY)
            .is_ok());
    }
}
