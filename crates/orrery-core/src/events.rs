//! Listener callbacks and the outbox that defers their dispatch.
//!
//! The applier collects events while it holds the world write lock and only
//! calls listeners after releasing it, so listener code can freely query the
//! universe.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::error;

use crate::bounds::BoundingVolume;
use crate::cell_map::CellId;
use crate::transform::Transform;

/// Identifier handed out when a listener is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A viewer crossed one of a cell's proximity volumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityEvent {
    /// Cell owning the proximity volumes.
    pub cell: CellId,
    pub listener: ListenerId,
    /// The view cell that moved (or was moved relative to).
    pub viewer: CellId,
    /// `true` for enter, `false` for exit.
    pub entered: bool,
    /// Index into the listener's volumes, outermost first.
    pub index: usize,
    /// World-space volume that was entered or left.
    pub volume: BoundingVolume,
}

/// A cell's world transform changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformEvent {
    pub cell: CellId,
    pub local: Transform,
    pub world: Transform,
}

pub trait ProximityListener: Send + Sync {
    fn view_enter_exit(&self, event: &ProximityEvent);
}

impl<F> ProximityListener for F
where
    F: Fn(&ProximityEvent) + Send + Sync,
{
    fn view_enter_exit(&self, event: &ProximityEvent) {
        self(event)
    }
}

pub trait TransformListener: Send + Sync {
    fn transform_changed(&self, event: &TransformEvent);
}

impl<F> TransformListener for F
where
    F: Fn(&TransformEvent) + Send + Sync,
{
    fn transform_changed(&self, event: &TransformEvent) {
        self(event)
    }
}

/// Events waiting to be delivered once the write lock is released.
#[derive(Default)]
pub(crate) struct Outbox {
    proximity: Vec<(Arc<dyn ProximityListener>, ProximityEvent)>,
    transforms: Vec<(Arc<dyn TransformListener>, TransformEvent)>,
}

impl Outbox {
    pub(crate) fn push_proximity(
        &mut self,
        listener: Arc<dyn ProximityListener>,
        event: ProximityEvent,
    ) {
        self.proximity.push((listener, event));
    }

    pub(crate) fn push_transform(
        &mut self,
        listener: Arc<dyn TransformListener>,
        event: TransformEvent,
    ) {
        self.transforms.push((listener, event));
    }

    pub(crate) fn len(&self) -> usize {
        self.proximity.len() + self.transforms.len()
    }

    /// Deliver everything in recorded order. A panicking listener is logged
    /// and skipped; it never takes the applier down with it.
    pub(crate) fn dispatch(self) {
        for (listener, event) in self.transforms {
            if catch_unwind(AssertUnwindSafe(|| listener.transform_changed(&event))).is_err() {
                error!(cell = %event.cell, "transform listener panicked");
            }
        }
        for (listener, event) in self.proximity {
            if catch_unwind(AssertUnwindSafe(|| listener.view_enter_exit(&event))).is_err() {
                error!(
                    cell = %event.cell,
                    listener = %event.listener,
                    "proximity listener panicked"
                );
            }
        }
    }
}
