//! Commit-side ledger of the cell graph.
//!
//! The applier works asynchronously, so the world state can lag behind what
//! has already been committed. Validation (duplicate ids, multiple parents,
//! cycles) therefore runs against this ledger, which reflects every
//! committed change the moment its batch is queued.
//!
//! The applier can also relink cells on its own (container reparenting).
//! Those cells are marked stale and copied back from the arena once the
//! queue has drained, when arena and ledger describe the same history.

use std::collections::{BTreeSet, HashMap};

use crossbeam_channel::Sender;

use crate::cell_map::{CellId, ROOT_CELL};
use crate::change::{ApplierMessage, Change};
use crate::error::SpatialError;
use crate::events::ListenerId;
use crate::proximity::validate_ordering;
use crate::space::Links;

/// Structural view of one committed cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CellRecord {
    pub(crate) parent: Option<CellId>,
    pub(crate) children: Vec<CellId>,
    pub(crate) root: bool,
    pub(crate) proximity: Vec<ListenerId>,
    pub(crate) transform_listeners: Vec<ListenerId>,
}

type Delta = HashMap<CellId, Option<CellRecord>>;

pub(crate) struct Registry {
    cells: HashMap<CellId, CellRecord>,
    next_seq: u64,
    queue: Option<Sender<ApplierMessage>>,
    stale: BTreeSet<CellId>,
}

impl Registry {
    pub(crate) fn new(queue: Sender<ApplierMessage>) -> Self {
        Self {
            cells: HashMap::new(),
            next_seq: 0,
            queue: Some(queue),
            stale: BTreeSet::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: CellId) -> Option<&CellRecord> {
        self.cells.get(&id)
    }

    /// Sequence number of the most recently queued batch.
    pub(crate) fn last_seq(&self) -> u64 {
        self.next_seq
    }

    pub(crate) fn is_open(&self) -> bool {
        self.queue.is_some()
    }

    /// Check `next` as if `staged` had already been committed.
    pub(crate) fn validate(&self, staged: &[Change], next: &Change) -> Result<(), SpatialError> {
        let mut delta = Delta::new();
        let mut overlay = Overlay::new(&self.cells, &mut delta);
        for change in staged {
            overlay.apply(change)?;
        }
        overlay.apply(next)
    }

    /// Revalidate a whole transaction, hand it to the applier and fold it
    /// into the ledger. The send happens under the caller's ledger lock, so
    /// queue order matches validation order.
    pub(crate) fn commit(&mut self, changes: Vec<Change>) -> Result<u64, SpatialError> {
        let queue = self.queue.as_ref().ok_or(SpatialError::ApplierStopped)?;
        let mut delta = Delta::new();
        let mut overlay = Overlay::new(&self.cells, &mut delta);
        for change in &changes {
            overlay.apply(change)?;
        }
        let seq = self.next_seq + 1;
        queue
            .send(ApplierMessage::Batch { seq, changes })
            .map_err(|_| SpatialError::ApplierStopped)?;
        self.next_seq = seq;
        self.merge(delta);
        Ok(seq)
    }

    /// Stop accepting commits and tell the applier to exit once it has
    /// drained everything queued before this call.
    pub(crate) fn close(&mut self) {
        if let Some(queue) = self.queue.take() {
            let _ = queue.send(ApplierMessage::Shutdown);
        }
    }

    fn merge(&mut self, delta: Delta) {
        for (id, record) in delta {
            match record {
                Some(record) => {
                    self.cells.insert(id, record);
                }
                None => {
                    self.cells.remove(&id);
                }
            }
        }
    }

    /// Record cells whose links the applier changed on its own after batch
    /// `seq`, and copy the arena's links for every stale cell once no later
    /// batch is queued. Until then a later commit may still be validated
    /// against the old links.
    pub(crate) fn reconcile(
        &mut self,
        seq: u64,
        drifted: impl IntoIterator<Item = CellId>,
        links: impl Fn(CellId) -> Option<Links>,
    ) {
        self.stale.extend(drifted);
        if self.next_seq != seq || self.stale.is_empty() {
            return;
        }
        for id in std::mem::take(&mut self.stale) {
            if let Some(record) = self.cells.get_mut(&id)
                && let Some(links) = links(id)
            {
                record.parent = links.parent;
                record.children = links.children;
                record.root = links.root;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn stale_len(&self) -> usize {
        self.stale.len()
    }
}

/// Copy-on-write view over the ledger. A failed [`Overlay::apply`] leaves
/// the view untouched.
pub(crate) struct Overlay<'a> {
    base: &'a HashMap<CellId, CellRecord>,
    delta: &'a mut Delta,
}

impl<'a> Overlay<'a> {
    pub(crate) fn new(base: &'a HashMap<CellId, CellRecord>, delta: &'a mut Delta) -> Self {
        Self { base, delta }
    }

    pub(crate) fn get(&self, id: CellId) -> Option<&CellRecord> {
        match self.delta.get(&id) {
            Some(entry) => entry.as_ref(),
            None => self.base.get(&id),
        }
    }

    fn require(&self, id: CellId) -> Result<&CellRecord, SpatialError> {
        self.get(id).ok_or(SpatialError::UnknownCell(id))
    }

    fn record_mut(&mut self, id: CellId) -> Option<&mut CellRecord> {
        if !self.delta.contains_key(&id) {
            let record = self.base.get(&id)?.clone();
            self.delta.insert(id, Some(record));
        }
        self.delta.get_mut(&id)?.as_mut()
    }

    /// Walks up from `start`; true if `target` is `start` or an ancestor.
    fn is_ancestor_or_self(&self, target: CellId, start: CellId) -> bool {
        let mut current = Some(start);
        while let Some(id) = current {
            if id == target {
                return true;
            }
            current = self.get(id).and_then(|r| r.parent);
        }
        false
    }

    fn require_listener(
        &self,
        id: CellId,
        listener: ListenerId,
        pick: fn(&CellRecord) -> &Vec<ListenerId>,
    ) -> Result<(), SpatialError> {
        if pick(self.require(id)?).contains(&listener) {
            Ok(())
        } else {
            Err(SpatialError::UnknownListener { cell: id, listener })
        }
    }

    pub(crate) fn apply(&mut self, change: &Change) -> Result<(), SpatialError> {
        match change {
            &Change::CreateCell { id, .. } => {
                if id == ROOT_CELL {
                    return Err(SpatialError::ReservedCellId(id));
                }
                if self.get(id).is_some() {
                    return Err(SpatialError::DuplicateCell(id));
                }
                self.delta.insert(id, Some(CellRecord::default()));
            }
            &Change::RemoveCell { id } => {
                let record = self.require(id)?.clone();
                if let Some(parent) = record.parent
                    && let Some(p) = self.record_mut(parent)
                {
                    p.children.retain(|&c| c != id);
                }
                for child in record.children {
                    if let Some(c) = self.record_mut(child) {
                        c.parent = None;
                    }
                }
                self.delta.insert(id, None);
            }
            &Change::SetLocalTransform { id, .. }
            | &Change::SetLocalBounds { id, .. }
            | &Change::ViewLogin { id }
            | &Change::ViewLogout { id } => {
                self.require(id)?;
            }
            &Change::AddChild { parent, child } => {
                self.require(parent)?;
                let record = self.require(child)?;
                if record.root {
                    return Err(SpatialError::RootCannotBeChild(child));
                }
                match record.parent {
                    Some(current) if current == parent => return Ok(()),
                    Some(current) => return Err(SpatialError::MultipleParent { child, current }),
                    None => {}
                }
                if self.is_ancestor_or_self(child, parent) {
                    return Err(SpatialError::Cycle { parent, child });
                }
                if let Some(c) = self.record_mut(child) {
                    c.parent = Some(parent);
                }
                if let Some(p) = self.record_mut(parent) {
                    p.children.push(child);
                }
            }
            &Change::RemoveChild { parent, child } => {
                self.require(parent)?;
                if self.require(child)?.parent != Some(parent) {
                    return Err(SpatialError::NotAChild { parent, child });
                }
                if let Some(c) = self.record_mut(child) {
                    c.parent = None;
                }
                if let Some(p) = self.record_mut(parent) {
                    p.children.retain(|&c| c != child);
                }
            }
            &Change::AddRoot { id } => {
                if self.require(id)?.parent.is_some() {
                    return Err(SpatialError::RootHasParent(id));
                }
                if let Some(r) = self.record_mut(id) {
                    r.root = true;
                }
            }
            &Change::RemoveRoot { id } => {
                if !self.require(id)?.root {
                    return Err(SpatialError::NotARoot(id));
                }
                if let Some(r) = self.record_mut(id) {
                    r.root = false;
                }
            }
            Change::AddProximityListener {
                id,
                listener_id,
                volumes,
                ..
            } => {
                self.require(*id)?;
                validate_ordering(volumes)?;
                if let Some(r) = self.record_mut(*id) {
                    r.proximity.push(*listener_id);
                }
            }
            Change::SetProximityBounds {
                id,
                listener_id,
                volumes,
            } => {
                self.require_listener(*id, *listener_id, |r| &r.proximity)?;
                validate_ordering(volumes)?;
            }
            &Change::RemoveProximityListener { id, listener_id } => {
                self.require_listener(id, listener_id, |r| &r.proximity)?;
                if let Some(r) = self.record_mut(id) {
                    r.proximity.retain(|&l| l != listener_id);
                }
            }
            &Change::AddTransformListener { id, listener_id, .. } => {
                self.require(id)?;
                if let Some(r) = self.record_mut(id) {
                    r.transform_listeners.push(listener_id);
                }
            }
            &Change::RemoveTransformListener { id, listener_id } => {
                self.require_listener(id, listener_id, |r| &r.transform_listeners)?;
                if let Some(r) = self.record_mut(id) {
                    r.transform_listeners.retain(|&l| l != listener_id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::BoundingVolume;
    use crate::cell_map::CellKind;
    use crate::transform::Transform;
    use crossbeam_channel::unbounded;
    use glam::Vec3;

    fn create(id: u64) -> Change {
        Change::CreateCell {
            id: CellId(id),
            kind: CellKind::Plain,
            transform: Transform::IDENTITY,
            bounds: BoundingVolume::EMPTY,
        }
    }

    fn link(parent: u64, child: u64) -> Change {
        Change::AddChild {
            parent: CellId(parent),
            child: CellId(child),
        }
    }

    fn registry() -> (Registry, crossbeam_channel::Receiver<ApplierMessage>) {
        let (tx, rx) = unbounded();
        (Registry::new(tx), rx)
    }

    #[test]
    fn commit_queues_in_sequence_and_merges() {
        let (mut reg, rx) = registry();
        assert_eq!(reg.commit(vec![create(1), create(2)]), Ok(1));
        assert_eq!(reg.commit(vec![link(1, 2)]), Ok(2));
        assert_eq!(reg.get(CellId(2)).and_then(|r| r.parent), Some(CellId(1)));
        assert_eq!(reg.get(CellId(1)).map(|r| r.children.clone()), Some(vec![CellId(2)]));

        let seqs: Vec<u64> = rx
            .try_iter()
            .filter_map(|m| match m {
                ApplierMessage::Batch { seq, .. } => Some(seq),
                ApplierMessage::Shutdown => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn failed_commit_changes_nothing() {
        let (mut reg, rx) = registry();
        reg.commit(vec![create(1)]).unwrap();
        assert_eq!(
            reg.commit(vec![create(2), create(1)]),
            Err(SpatialError::DuplicateCell(CellId(1)))
        );
        assert!(reg.get(CellId(2)).is_none());
        assert_eq!(reg.last_seq(), 1);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn validation_sees_staged_changes() {
        let (reg, _rx) = registry();
        let staged = vec![create(1), create(2)];
        assert!(reg.validate(&staged, &link(1, 2)).is_ok());
        assert_eq!(
            reg.validate(&[], &link(1, 2)),
            Err(SpatialError::UnknownCell(CellId(1)))
        );
    }

    #[test]
    fn structural_rules() {
        let (mut reg, _rx) = registry();
        reg.commit(vec![create(1), create(2), create(3), link(1, 2), link(2, 3)])
            .unwrap();

        assert_eq!(
            reg.validate(&[], &link(3, 2)),
            Err(SpatialError::MultipleParent {
                child: CellId(2),
                current: CellId(1)
            })
        );
        assert_eq!(
            reg.validate(&[], &link(3, 1)),
            Err(SpatialError::Cycle {
                parent: CellId(3),
                child: CellId(1)
            })
        );
        assert_eq!(
            reg.validate(&[], &link(1, 1)),
            Err(SpatialError::Cycle {
                parent: CellId(1),
                child: CellId(1)
            })
        );
        assert_eq!(
            reg.validate(&[], &Change::AddRoot { id: CellId(2) }),
            Err(SpatialError::RootHasParent(CellId(2)))
        );
        assert_eq!(
            reg.validate(&[], &Change::RemoveChild { parent: CellId(1), child: CellId(3) }),
            Err(SpatialError::NotAChild {
                parent: CellId(1),
                child: CellId(3)
            })
        );
        assert_eq!(
            reg.validate(&[], &Change::RemoveRoot { id: CellId(1) }),
            Err(SpatialError::NotARoot(CellId(1)))
        );
        assert_eq!(reg.validate(&[], &create(0)), Err(SpatialError::ReservedCellId(CellId(0))));
        // Re-adding an existing link is a no-op.
        assert!(reg.validate(&[], &link(1, 2)).is_ok());
    }

    #[test]
    fn roots_cannot_be_children() {
        let (mut reg, _rx) = registry();
        reg.commit(vec![create(1), create(2), Change::AddRoot { id: CellId(2) }])
            .unwrap();
        assert_eq!(
            reg.validate(&[], &link(1, 2)),
            Err(SpatialError::RootCannotBeChild(CellId(2)))
        );
    }

    #[test]
    fn remove_cell_orphans_children() {
        let (mut reg, _rx) = registry();
        reg.commit(vec![create(1), create(2), create(3), link(1, 2), link(2, 3)])
            .unwrap();
        reg.commit(vec![Change::RemoveCell { id: CellId(2) }]).unwrap();
        assert!(reg.get(CellId(2)).is_none());
        assert_eq!(reg.get(CellId(3)).and_then(|r| r.parent), None);
        assert!(reg.get(CellId(1)).is_some_and(|r| r.children.is_empty()));
        // The orphan may now be attached elsewhere.
        assert!(reg.validate(&[], &link(1, 3)).is_ok());
    }

    #[test]
    fn proximity_listeners_are_tracked() {
        let (mut reg, _rx) = registry();
        let listener: std::sync::Arc<dyn crate::events::ProximityListener> =
            std::sync::Arc::new(|_: &crate::events::ProximityEvent| {});
        let volumes = vec![BoundingVolume::sphere(Vec3::ZERO, 2.0)];
        reg.commit(vec![
            create(1),
            Change::AddProximityListener {
                id: CellId(1),
                listener_id: ListenerId(7),
                volumes: volumes.clone(),
                listener,
            },
        ])
        .unwrap();

        let set = |listener_id| Change::SetProximityBounds {
            id: CellId(1),
            listener_id,
            volumes: volumes.clone(),
        };
        assert!(reg.validate(&[], &set(ListenerId(7))).is_ok());
        assert_eq!(
            reg.validate(&[], &set(ListenerId(8))),
            Err(SpatialError::UnknownListener {
                cell: CellId(1),
                listener: ListenerId(8)
            })
        );
    }

    #[test]
    fn reconcile_waits_for_the_queue_to_drain() {
        let (mut reg, _rx) = registry();
        reg.commit(vec![create(1), create(2), create(3), link(1, 2), link(2, 3)])
            .unwrap();
        reg.commit(vec![create(4)]).unwrap();

        // The arena after batch 1 moved 3 from 2 up to 1.
        let arena: HashMap<CellId, Links> = HashMap::from([
            (
                CellId(1),
                Links {
                    parent: None,
                    children: vec![CellId(2), CellId(3)],
                    root: false,
                },
            ),
            (CellId(2), Links::default()),
            (
                CellId(3),
                Links {
                    parent: Some(CellId(1)),
                    children: Vec::new(),
                    root: false,
                },
            ),
        ]);
        let lookup = |id: CellId| arena.get(&id).cloned();

        // Batch 2 is still queued.
        reg.reconcile(1, [CellId(3), CellId(2), CellId(1)], lookup);
        assert_eq!(reg.get(CellId(3)).and_then(|r| r.parent), Some(CellId(2)));
        assert_eq!(reg.stale_len(), 3);

        reg.reconcile(2, [], lookup);
        assert_eq!(reg.stale_len(), 0);
        assert_eq!(reg.get(CellId(3)).and_then(|r| r.parent), Some(CellId(1)));
        assert!(reg.get(CellId(2)).is_some_and(|r| r.children.is_empty()));
        assert_eq!(
            reg.get(CellId(1)).map(|r| r.children.clone()),
            Some(vec![CellId(2), CellId(3)])
        );
        assert_eq!(
            reg.validate(&[], &Change::RemoveChild { parent: CellId(2), child: CellId(3) }),
            Err(SpatialError::NotAChild {
                parent: CellId(2),
                child: CellId(3)
            })
        );
    }

    #[test]
    fn closed_registry_refuses_commits() {
        let (mut reg, rx) = registry();
        reg.close();
        assert!(!reg.is_open());
        assert_eq!(reg.commit(vec![create(1)]), Err(SpatialError::ApplierStopped));
        assert!(matches!(rx.try_recv(), Ok(ApplierMessage::Shutdown)));
    }
}
