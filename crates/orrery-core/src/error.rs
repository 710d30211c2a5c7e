//! Typed failures surfaced by the mutation and query API.
//!
//! Configuration errors are reported synchronously by the call that would
//! introduce them. Lookup failures that only show up once a change reaches
//! the applier are logged there and never come back through this type.

use thiserror::Error;

use crate::cell_map::CellId;
use crate::events::ListenerId;

/// Every failure the spatial core reports to its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpatialError {
    /// The id collides with [`ROOT_CELL`](crate::cell_map::ROOT_CELL).
    #[error("cell id {0} is reserved for the root sentinel")]
    ReservedCellId(CellId),

    /// A cell with this id is already registered.
    #[error("cell {0} already exists")]
    DuplicateCell(CellId),

    /// No cell with this id is registered.
    #[error("unknown cell {0}")]
    UnknownCell(CellId),

    /// The child is already attached somewhere else.
    #[error("cell {child} already has parent {current}")]
    MultipleParent { child: CellId, current: CellId },

    /// `remove_child` named a pair that is not linked.
    #[error("cell {child} is not a child of {parent}")]
    NotAChild { parent: CellId, child: CellId },

    /// Linking `child` under `parent` would close a loop.
    #[error("adding {child} under {parent} would create a cycle")]
    Cycle { parent: CellId, child: CellId },

    /// Roots are parentless by definition.
    #[error("cell {0} has a parent and cannot become a root")]
    RootHasParent(CellId),

    /// A root must be demoted before it can be attached to a parent.
    #[error("root cell {0} cannot be added as a child")]
    RootCannotBeChild(CellId),

    /// `remove_root` named a cell that is not a root.
    #[error("cell {0} is not a root")]
    NotARoot(CellId),

    /// Proximity volume `index` is not enclosed by volume `index - 1`.
    #[error("proximity bounds {index} is not enclosed by the bounds before it")]
    InvalidOrdering { index: usize },

    /// A proximity listener needs at least one volume.
    #[error("proximity bounds must contain at least one volume")]
    EmptyProximityBounds,

    /// No listener with this id is registered on the cell.
    #[error("no listener {listener} on cell {cell}")]
    UnknownListener { cell: CellId, listener: ListenerId },

    /// The applier thread could not be started.
    #[error("failed to spawn the change applier: {0}")]
    ApplierSpawn(String),

    /// The applier thread is gone; nothing more can be queued or awaited.
    #[error("the change applier has stopped")]
    ApplierStopped,
}
