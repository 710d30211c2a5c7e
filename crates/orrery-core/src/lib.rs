//! Server-side spatial core for a shared 3D world.
//!
//! Cells form a scene graph stored in a hecs arena. Mutations are recorded
//! in transactions, validated at the call that introduces them, and applied
//! in commit order by one dedicated applier thread that keeps every cell's
//! world transform and bounds current and reports proximity transitions to
//! registered listeners.

pub mod bounds;
pub mod cell_map;
pub mod change;
pub mod components;
pub mod config;
pub mod error;
pub mod events;
pub mod proximity;
pub mod transaction;
pub mod transform;
pub mod universe;
pub mod visibility;

mod applier;
mod registry;
mod space;
mod systems;

pub use bounds::BoundingVolume;
pub use cell_map::{CellId, CellKind, ROOT_CELL};
pub use change::{ChangeState, CommitTicket};
pub use components::WorldMatrix;
pub use config::{Composition, ReparentPolicy, TransitionPolicy, UniverseConfig};
pub use error::SpatialError;
pub use events::{ListenerId, ProximityEvent, ProximityListener, TransformEvent, TransformListener};
pub use transaction::Transaction;
pub use transform::Transform;
pub use universe::{SpatialCore, Universe};
pub use visibility::VisibleCells;
