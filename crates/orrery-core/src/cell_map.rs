//! Cell identifiers and the map from [`CellId`] to hecs entities.

use std::collections::HashMap;
use std::fmt;

/// Opaque, globally unique identifier of a cell within one universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u64);

/// Sentinel naming the whole world graph in queries such as
/// [`Universe::visible_cells`](crate::universe::Universe::visible_cells).
/// It can never be registered as a real cell.
pub const ROOT_CELL: CellId = CellId(0);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == ROOT_CELL {
            f.write_str("ROOT")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Capabilities a cell is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellKind {
    #[default]
    Plain,
    /// An observer (typically an avatar's view). Its moves are checked
    /// against every proximity listener in the universe.
    View,
    /// A cell that may adopt drifting descendants under
    /// [`ReparentPolicy::ToContainer`](crate::config::ReparentPolicy::ToContainer).
    Container,
}

/// Maps cell ids (assigned by the owning cell layer) to hecs entities.
#[derive(Debug, Default)]
pub struct CellMap {
    map: HashMap<CellId, hecs::Entity>,
}

impl CellMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapping. Returns the entity previously mapped to `id`.
    pub fn insert(&mut self, id: CellId, entity: hecs::Entity) -> Option<hecs::Entity> {
        self.map.insert(id, entity)
    }

    pub fn get(&self, id: CellId) -> Option<hecs::Entity> {
        self.map.get(&id).copied()
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn remove(&mut self, id: CellId) -> Option<hecs::Entity> {
        self.map.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate every mapped `(CellId, Entity)` pair in no particular order.
    pub fn iter_mapped(&self) -> impl Iterator<Item = (CellId, hecs::Entity)> + '_ {
        self.map.iter().map(|(&id, &entity)| (id, entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hecs::World;

    #[test]
    fn insert_get_remove() {
        let mut world = World::new();
        let mut map = CellMap::new();
        let e = world.spawn((1u32,));

        assert!(map.insert(CellId(42), e).is_none());
        assert_eq!(map.get(CellId(42)), Some(e));
        assert!(map.contains(CellId(42)));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove(CellId(42)), Some(e));
        assert!(map.get(CellId(42)).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn iter_mapped_yields_every_pair() {
        let mut world = World::new();
        let mut map = CellMap::new();
        for i in 1..=3u64 {
            map.insert(CellId(i), world.spawn((i,)));
        }
        let mut ids: Vec<u64> = map.iter_mapped().map(|(id, _)| id.0).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn root_sentinel_displays_by_name() {
        assert_eq!(ROOT_CELL.to_string(), "ROOT");
        assert_eq!(CellId(17).to_string(), "17");
    }
}
