//! Nested containment volumes and the enter/exit tracking of viewers.
//!
//! A record holds its volumes outermost first; each must enclose the next.
//! For every viewer the record remembers the innermost volume the viewer was
//! last seen in, and a move is turned into enter/exit events by comparing
//! that with where the viewer is now.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::bounds::BoundingVolume;
use crate::cell_map::CellId;
use crate::config::TransitionPolicy;
use crate::error::SpatialError;
use crate::events::{ListenerId, ProximityEvent, ProximityListener};
use crate::transform::Transform;

/// Check that `volumes` is non-empty and ordered outermost first.
pub fn validate_ordering(volumes: &[BoundingVolume]) -> Result<(), SpatialError> {
    if volumes.is_empty() {
        return Err(SpatialError::EmptyProximityBounds);
    }
    for (i, pair) in volumes.windows(2).enumerate() {
        if !pair[0].encloses(&pair[1]) {
            return Err(SpatialError::InvalidOrdering { index: i + 1 });
        }
    }
    Ok(())
}

/// Where a viewer was last seen within a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Occupancy {
    /// Innermost volume holding the viewer.
    pub index: usize,
    /// That volume in world space at the time of the enter.
    pub volume: BoundingVolume,
}

pub struct ProximityRecord {
    id: ListenerId,
    listener: Arc<dyn ProximityListener>,
    local: Vec<BoundingVolume>,
    world: Vec<BoundingVolume>,
    occupancy: BTreeMap<CellId, Occupancy>,
}

impl fmt::Debug for ProximityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProximityRecord")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("world", &self.world)
            .field("occupancy", &self.occupancy)
            .finish_non_exhaustive()
    }
}

impl ProximityRecord {
    /// A record for volumes given in the owning cell's frame, placed with the
    /// cell's current world transform.
    pub fn new(
        id: ListenerId,
        listener: Arc<dyn ProximityListener>,
        volumes: Vec<BoundingVolume>,
        cell_world: &Transform,
    ) -> Result<Self, SpatialError> {
        validate_ordering(&volumes)?;
        let mut record = Self {
            id,
            listener,
            local: volumes,
            world: Vec::new(),
            occupancy: BTreeMap::new(),
        };
        record.update_world_bounds(cell_world);
        Ok(record)
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn listener(&self) -> Arc<dyn ProximityListener> {
        self.listener.clone()
    }

    pub fn local_volumes(&self) -> &[BoundingVolume] {
        &self.local
    }

    pub fn world_volumes(&self) -> &[BoundingVolume] {
        &self.world
    }

    pub fn occupancy(&self, viewer: CellId) -> Option<Occupancy> {
        self.occupancy.get(&viewer).copied()
    }

    /// Replace the volumes. Viewer state is kept; the next evaluation
    /// reconciles it with the new volumes.
    pub fn set_proximity_bounds(
        &mut self,
        volumes: Vec<BoundingVolume>,
        cell_world: &Transform,
    ) -> Result<(), SpatialError> {
        validate_ordering(&volumes)?;
        self.local = volumes;
        self.update_world_bounds(cell_world);
        Ok(())
    }

    /// Recompute the world-space volumes after the owning cell moved.
    pub fn update_world_bounds(&mut self, cell_world: &Transform) {
        self.world = self
            .local
            .iter()
            .map(|v| cell_world.apply_to_volume(v))
            .collect();
    }

    /// Index of the innermost volume holding `point`. Volumes are nested, so
    /// the walk stops at the first one that misses.
    fn innermost(&self, point: glam::Vec3) -> Option<usize> {
        let mut found = None;
        for (i, volume) in self.world.iter().enumerate() {
            if !volume.contains(point) {
                break;
            }
            found = Some(i);
        }
        found
    }

    fn volume_at(&self, index: usize, previous: Option<Occupancy>) -> BoundingVolume {
        match previous {
            Some(occ) if occ.index == index => occ.volume,
            _ => self.world.get(index).copied().unwrap_or(BoundingVolume::EMPTY),
        }
    }

    fn event(
        &self,
        cell: CellId,
        viewer: CellId,
        entered: bool,
        index: usize,
        volume: BoundingVolume,
    ) -> ProximityEvent {
        ProximityEvent {
            cell,
            listener: self.id,
            viewer,
            entered,
            index,
            volume,
        }
    }

    /// Evaluate `viewer` at its new world transform and return the events
    /// the move produced, in delivery order.
    pub fn viewer_moved(
        &mut self,
        cell: CellId,
        viewer: CellId,
        viewer_world: &Transform,
        policy: TransitionPolicy,
    ) -> Vec<ProximityEvent> {
        let now = self.innermost(viewer_world.translation());
        self.transition(cell, viewer, now, policy)
    }

    /// The viewer stopped viewing: report it leaving every volume it was in.
    pub fn viewer_left(
        &mut self,
        cell: CellId,
        viewer: CellId,
        policy: TransitionPolicy,
    ) -> Vec<ProximityEvent> {
        self.transition(cell, viewer, None, policy)
    }

    fn transition(
        &mut self,
        cell: CellId,
        viewer: CellId,
        now: Option<usize>,
        policy: TransitionPolicy,
    ) -> Vec<ProximityEvent> {
        let previous = self.occupancy.get(&viewer).copied();
        if now == previous.map(|occ| occ.index) {
            return Vec::new();
        }

        // 0 is "outside every volume", i + 1 is "inside volume i".
        let from = previous.map_or(0, |occ| occ.index + 1);
        let to = now.map_or(0, |i| i + 1);
        let mut events = Vec::new();

        match policy {
            TransitionPolicy::Collapse => {
                if from.abs_diff(to) > 1 {
                    debug!(
                        %cell,
                        %viewer,
                        from,
                        to,
                        "viewer crossed several proximity levels in one move"
                    );
                }
                if to > from {
                    let index = to - 1;
                    events.push(self.event(cell, viewer, true, index, self.volume_at(index, None)));
                } else if let Some(occ) = previous {
                    events.push(self.event(cell, viewer, false, occ.index, occ.volume));
                }
            }
            TransitionPolicy::PerBoundary => {
                for index in (to..from).rev() {
                    let volume = self.volume_at(index, previous);
                    events.push(self.event(cell, viewer, false, index, volume));
                }
                for index in from..to {
                    events.push(self.event(cell, viewer, true, index, self.volume_at(index, None)));
                }
            }
        }

        match now {
            Some(index) => {
                let volume = self.volume_at(index, None);
                self.occupancy.insert(viewer, Occupancy { index, volume });
            }
            None => {
                self.occupancy.remove(&viewer);
            }
        }
        events
    }

    /// Drop a viewer without firing anything.
    pub fn forget_viewer(&mut self, viewer: CellId) -> bool {
        self.occupancy.remove(&viewer).is_some()
    }
}
