//! Queued mutations and the bookkeeping that tracks them to the applier.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::bounds::BoundingVolume;
use crate::cell_map::{CellId, CellKind};
use crate::error::SpatialError;
use crate::events::{ListenerId, ProximityListener, TransformListener};
use crate::transform::Transform;

/// One pending mutation, replayed in order by the applier.
#[derive(Clone)]
pub enum Change {
    CreateCell {
        id: CellId,
        kind: CellKind,
        transform: Transform,
        bounds: BoundingVolume,
    },
    RemoveCell {
        id: CellId,
    },
    SetLocalTransform {
        id: CellId,
        transform: Transform,
    },
    SetLocalBounds {
        id: CellId,
        bounds: BoundingVolume,
    },
    AddChild {
        parent: CellId,
        child: CellId,
    },
    RemoveChild {
        parent: CellId,
        child: CellId,
    },
    AddRoot {
        id: CellId,
    },
    RemoveRoot {
        id: CellId,
    },
    AddProximityListener {
        id: CellId,
        listener_id: ListenerId,
        volumes: Vec<BoundingVolume>,
        listener: Arc<dyn ProximityListener>,
    },
    SetProximityBounds {
        id: CellId,
        listener_id: ListenerId,
        volumes: Vec<BoundingVolume>,
    },
    RemoveProximityListener {
        id: CellId,
        listener_id: ListenerId,
    },
    AddTransformListener {
        id: CellId,
        listener_id: ListenerId,
        listener: Arc<dyn TransformListener>,
    },
    RemoveTransformListener {
        id: CellId,
        listener_id: ListenerId,
    },
    ViewLogin {
        id: CellId,
    },
    ViewLogout {
        id: CellId,
    },
}

impl Change {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::CreateCell { .. } => "create_cell",
            Self::RemoveCell { .. } => "remove_cell",
            Self::SetLocalTransform { .. } => "set_local_transform",
            Self::SetLocalBounds { .. } => "set_local_bounds",
            Self::AddChild { .. } => "add_child",
            Self::RemoveChild { .. } => "remove_child",
            Self::AddRoot { .. } => "add_root",
            Self::RemoveRoot { .. } => "remove_root",
            Self::AddProximityListener { .. } => "add_proximity_listener",
            Self::SetProximityBounds { .. } => "set_proximity_bounds",
            Self::RemoveProximityListener { .. } => "remove_proximity_listener",
            Self::AddTransformListener { .. } => "add_transform_listener",
            Self::RemoveTransformListener { .. } => "remove_transform_listener",
            Self::ViewLogin { .. } => "view_login",
            Self::ViewLogout { .. } => "view_logout",
        }
    }

    /// The cell the change is addressed to. For child edits, the parent.
    pub fn cell(&self) -> CellId {
        match *self {
            Self::CreateCell { id, .. }
            | Self::RemoveCell { id }
            | Self::SetLocalTransform { id, .. }
            | Self::SetLocalBounds { id, .. }
            | Self::AddRoot { id }
            | Self::RemoveRoot { id }
            | Self::AddProximityListener { id, .. }
            | Self::SetProximityBounds { id, .. }
            | Self::RemoveProximityListener { id, .. }
            | Self::AddTransformListener { id, .. }
            | Self::RemoveTransformListener { id, .. }
            | Self::ViewLogin { id }
            | Self::ViewLogout { id } => id,
            Self::AddChild { parent, .. } | Self::RemoveChild { parent, .. } => parent,
        }
    }
}

impl fmt::Debug for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.kind_name());
        s.field("cell", &self.cell());
        match self {
            Self::AddChild { child, .. } | Self::RemoveChild { child, .. } => {
                s.field("child", child);
            }
            Self::SetLocalTransform { transform, .. } => {
                s.field("transform", transform);
            }
            Self::SetLocalBounds { bounds, .. } => {
                s.field("bounds", bounds);
            }
            Self::AddProximityListener { listener_id, .. }
            | Self::SetProximityBounds { listener_id, .. }
            | Self::RemoveProximityListener { listener_id, .. }
            | Self::AddTransformListener { listener_id, .. }
            | Self::RemoveTransformListener { listener_id, .. } => {
                s.field("listener", listener_id);
            }
            _ => {}
        }
        s.finish()
    }
}

/// Lifecycle of a recorded change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    /// Recorded in an open transaction.
    Pending,
    /// Committed and handed to the applier.
    Queued,
    /// Run by the applier.
    Applied,
    /// Dropped with its transaction; never reached the applier.
    Discarded,
}

/// What travels down the FIFO to the applier thread.
pub(crate) enum ApplierMessage {
    Batch { seq: u64, changes: Vec<Change> },
    Shutdown,
}

#[derive(Debug, Default)]
struct Mark {
    applied: u64,
    closed: bool,
}

/// Highest batch sequence the applier has finished, with a condvar for
/// callers that want to wait for it.
#[derive(Debug, Default)]
pub(crate) struct Watermark {
    mark: Mutex<Mark>,
    cv: Condvar,
}

impl Watermark {
    pub(crate) fn advance(&self, seq: u64) {
        let mut mark = self.mark.lock();
        mark.applied = mark.applied.max(seq);
        self.cv.notify_all();
    }

    /// Wake every waiter for good; used when the applier exits.
    pub(crate) fn close(&self) {
        self.mark.lock().closed = true;
        self.cv.notify_all();
    }

    pub(crate) fn applied(&self) -> u64 {
        self.mark.lock().applied
    }

    pub(crate) fn wait_until(&self, seq: u64) -> Result<(), SpatialError> {
        let mut mark = self.mark.lock();
        while mark.applied < seq {
            if mark.closed {
                return Err(SpatialError::ApplierStopped);
            }
            self.cv.wait(&mut mark);
        }
        Ok(())
    }
}

/// Receipt for a committed transaction.
#[derive(Debug, Clone)]
pub struct CommitTicket {
    seq: u64,
    watermark: Arc<Watermark>,
}

impl CommitTicket {
    pub(crate) fn new(seq: u64, watermark: Arc<Watermark>) -> Self {
        Self { seq, watermark }
    }

    /// Position of the transaction in the global commit order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// `Queued` until the applier has run every change of the transaction
    /// and delivered its listener events, `Applied` afterwards.
    pub fn state(&self) -> ChangeState {
        if self.watermark.applied() >= self.seq {
            ChangeState::Applied
        } else {
            ChangeState::Queued
        }
    }

    /// Block until the transaction has been applied.
    pub fn wait(&self) -> Result<(), SpatialError> {
        self.watermark.wait_until(self.seq)
    }
}
