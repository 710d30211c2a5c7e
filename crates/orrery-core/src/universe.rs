//! The explicit world instance: owns the arena, the commit ledger and the
//! applier thread, and answers queries against the applied state.
//!
//! Reads see the world as of the last applied batch. A commit returns before
//! its changes are applied; use [`CommitTicket::wait`] or
//! [`Universe::sync`] when a caller needs to observe its own writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::unbounded;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::applier;
use crate::bounds::BoundingVolume;
use crate::cell_map::CellId;
use crate::change::{CommitTicket, Watermark};
use crate::components::*;
use crate::config::UniverseConfig;
use crate::error::SpatialError;
use crate::events::ListenerId;
use crate::registry::Registry;
use crate::space::Space;
use crate::transaction::Transaction;
use crate::transform::Transform;
use crate::visibility::VisibleCells;

/// State shared between the universe handle, the applier thread and live
/// iterators. Lock order: `space` before `registry`.
pub(crate) struct Shared {
    pub(crate) config: UniverseConfig,
    pub(crate) space: RwLock<Space>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) watermark: Arc<Watermark>,
    next_listener: AtomicU64,
}

/// The capability surface the rest of a world server programs against.
pub trait SpatialCore {
    fn begin(&self) -> Transaction<'_>;
    fn world_transform(&self, id: CellId) -> Result<Transform, SpatialError>;
    fn world_bounds(&self, id: CellId) -> Result<BoundingVolume, SpatialError>;
    fn visible_cells(
        &self,
        root: CellId,
        query: BoundingVolume,
    ) -> Result<VisibleCells, SpatialError>;
}

pub struct Universe {
    shared: Arc<Shared>,
    applier: Mutex<Option<JoinHandle<()>>>,
}

impl Universe {
    /// Create an empty world and start its applier thread.
    pub fn new(config: UniverseConfig) -> Result<Self, SpatialError> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            config,
            space: RwLock::new(Space::new()),
            registry: Mutex::new(Registry::new(sender)),
            watermark: Arc::new(Watermark::default()),
            next_listener: AtomicU64::new(1),
        });
        let handle = applier::spawn(shared.clone(), receiver)?;
        debug!(config = ?shared.config, "universe created");
        Ok(Self {
            shared,
            applier: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    pub fn config(&self) -> &UniverseConfig {
        &self.shared.config
    }

    /// Open a transaction.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Record changes with `f` and commit them. If `f` fails the
    /// transaction is discarded and the error returned.
    pub fn transact<F>(&self, f: F) -> Result<CommitTicket, SpatialError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), SpatialError>,
    {
        let mut tx = self.begin();
        f(&mut tx)?;
        tx.commit()
    }

    /// Block until the committed transaction behind `ticket` is applied.
    pub fn wait_for(&self, ticket: &CommitTicket) -> Result<(), SpatialError> {
        ticket.wait()
    }

    /// Block until everything committed before this call is applied.
    ///
    /// Must not be called from a listener callback: callbacks run on the
    /// applier thread, which would then wait on itself.
    pub fn sync(&self) -> Result<(), SpatialError> {
        let last = self.shared.registry.lock().last_seq();
        self.shared.watermark.wait_until(last)
    }

    /// Stop accepting commits, let the applier drain the queue, and join it.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shared.registry.lock().close();
        let handle = self.applier.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Called from a listener; the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                tracing::error!("change applier panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.registry.lock().is_open()
    }

    pub fn world_transform(&self, id: CellId) -> Result<Transform, SpatialError> {
        self.shared
            .space
            .read()
            .world_transform(id)
            .ok_or(SpatialError::UnknownCell(id))
    }

    pub fn world_bounds(&self, id: CellId) -> Result<BoundingVolume, SpatialError> {
        self.shared
            .space
            .read()
            .world_bounds(id)
            .ok_or(SpatialError::UnknownCell(id))
    }

    /// World bounds of several cells read under one lock, so the values are
    /// mutually consistent.
    pub fn world_bounds_of(&self, ids: &[CellId]) -> Result<Vec<BoundingVolume>, SpatialError> {
        let space = self.shared.space.read();
        ids.iter()
            .map(|&id| space.world_bounds(id).ok_or(SpatialError::UnknownCell(id)))
            .collect()
    }

    pub fn world_matrix(&self, id: CellId) -> Result<WorldMatrix, SpatialError> {
        self.world_transform(id).map(|t| WorldMatrix::from(&t))
    }

    pub fn local_transform(&self, id: CellId) -> Result<Transform, SpatialError> {
        self.read::<LocalTransform>(id).map(|t| t.0)
    }

    pub fn local_bounds(&self, id: CellId) -> Result<BoundingVolume, SpatialError> {
        self.read::<LocalBounds>(id).map(|b| b.0)
    }

    pub fn parent(&self, id: CellId) -> Result<Option<CellId>, SpatialError> {
        self.read::<Parent>(id).map(|p| p.0)
    }

    pub fn children(&self, id: CellId) -> Result<Vec<CellId>, SpatialError> {
        self.read::<Children>(id).map(|c| c.0)
    }

    pub fn roots(&self) -> Vec<CellId> {
        self.shared.space.read().roots.iter().copied().collect()
    }

    pub fn is_root(&self, id: CellId) -> bool {
        self.shared.space.read().roots.contains(&id)
    }

    pub fn contains_cell(&self, id: CellId) -> bool {
        self.shared.space.read().contains(id)
    }

    pub fn cell_count(&self) -> usize {
        self.shared.space.read().cells.len()
    }

    /// Cells under `root` (or under every root for
    /// [`ROOT_CELL`](crate::cell_map::ROOT_CELL)) whose world bounds
    /// intersect `query`.
    pub fn visible_cells(
        &self,
        root: CellId,
        query: BoundingVolume,
    ) -> Result<VisibleCells, SpatialError> {
        VisibleCells::new(self.shared.clone(), root, query)
    }

    fn read<T: hecs::Component + Clone>(&self, id: CellId) -> Result<T, SpatialError> {
        self.shared
            .space
            .read()
            .read::<T>(id)
            .ok_or(SpatialError::UnknownCell(id))
    }
}

impl Drop for Universe {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SpatialCore for Universe {
    fn begin(&self) -> Transaction<'_> {
        Universe::begin(self)
    }

    fn world_transform(&self, id: CellId) -> Result<Transform, SpatialError> {
        Universe::world_transform(self, id)
    }

    fn world_bounds(&self, id: CellId) -> Result<BoundingVolume, SpatialError> {
        Universe::world_bounds(self, id)
    }

    fn visible_cells(
        &self,
        root: CellId,
        query: BoundingVolume,
    ) -> Result<VisibleCells, SpatialError> {
        Universe::visible_cells(self, root, query)
    }
}

// ── Dev-tools debug methods ──────────────────────────────────────
#[cfg(feature = "dev-tools")]
impl Universe {
    /// Number of cells in the applied world.
    pub fn debug_cell_count(&self) -> usize {
        self.cell_count()
    }

    /// Indented dump of every root's subtree with world transforms and
    /// bounds, one cell per line.
    pub fn debug_dump_tree(&self) -> String {
        use std::fmt::Write;

        fn dump(space: &Space, id: CellId, depth: usize, out: &mut String) {
            let t = space.world_transform(id).map(|w| w.translation()).unwrap_or_default();
            let b = space.world_bounds(id).unwrap_or_default();
            let _ = writeln!(
                out,
                "{:indent$}{id} at ({:.2}, {:.2}, {:.2}) bounds {:?}",
                "",
                t.x,
                t.y,
                t.z,
                b,
                indent = depth * 2
            );
            for child in space.children_of(id) {
                dump(space, child, depth + 1, out);
            }
        }

        let space = self.shared.space.read();
        let mut out = String::new();
        for &root in &space.roots {
            dump(&space, root, 0, &mut out);
        }
        out
    }
}
