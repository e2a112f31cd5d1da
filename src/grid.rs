//! Occupancy state of one plate.
//!
//! `GridState` owns every item of the batch and tracks where it currently is:
//! in exactly one well of the grid, or in the ordered pool of unplaced items.
//! It also records which items were moved since the last load or commit.
//! The placement rules themselves live in `engine`; this module only keeps the
//! bookkeeping consistent.

use std::collections::{BTreeMap, HashMap, HashSet};

use indexmap::IndexSet;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::coordinates::{CellCoordinate, CoordinateKey, FillMode, RowLabeler, to_linear_index};
use crate::model::{GridDimensions, Item, ItemId, ItemUpdate};

/// Broken structural invariant. Only reachable through a bug in a transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("item {0} is both on the grid and in the pool")]
    PlacedAndAvailable(ItemId),
    #[error("item {0} is neither on the grid nor in the pool")]
    Lost(ItemId),
    #[error("item {0} occupies more than one well")]
    PlacedTwice(ItemId),
    #[error("item {0} is listed twice in the pool")]
    PooledTwice(ItemId),
    #[error("well ({row}, {column}) lies outside the plate")]
    OutOfBounds { row: u32, column: u32 },
    #[error("item {0} is referenced but not registered")]
    Unregistered(ItemId),
}

/// Where an item currently sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Cell(CellCoordinate),
    Pool,
}

#[derive(Clone, Debug)]
pub struct GridState {
    dims: GridDimensions,
    items: HashMap<ItemId, Item>,
    cells: BTreeMap<CellCoordinate, ItemId>,
    available: Vec<ItemId>,
    moved: IndexSet<ItemId>,
}

impl GridState {
    /// Creates an empty plate.
    pub fn new(dims: GridDimensions) -> Self {
        Self {
            dims,
            items: HashMap::new(),
            cells: BTreeMap::new(),
            available: Vec::new(),
            moved: IndexSet::new(),
        }
    }

    pub fn dims(&self) -> GridDimensions {
        self.dims
    }

    pub fn item(&self, id: &ItemId) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    /// Number of items known to the plate, placed or not.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn placed_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &BTreeMap<CellCoordinate, ItemId> {
        &self.cells
    }

    pub fn occupant(&self, coord: CellCoordinate) -> Option<&ItemId> {
        self.cells.get(&coord)
    }

    pub fn available(&self) -> &[ItemId] {
        &self.available
    }

    pub fn moved(&self) -> &IndexSet<ItemId> {
        &self.moved
    }

    pub fn is_moved(&self, id: &ItemId) -> bool {
        self.moved.contains(id)
    }

    /// Reverse lookup of an item's current well.
    pub fn coordinate_of(&self, id: &ItemId) -> Option<CellCoordinate> {
        self.cells
            .iter()
            .find_map(|(coord, occupant)| (occupant == id).then_some(*coord))
    }

    pub fn location_of(&self, id: &ItemId) -> Option<Location> {
        if let Some(coord) = self.coordinate_of(id) {
            return Some(Location::Cell(coord));
        }
        self.available
            .iter()
            .any(|candidate| candidate == id)
            .then_some(Location::Pool)
    }

    /// Placed items ordered by their position in the given fill order.
    pub fn placed_in_fill_order(&self, mode: FillMode) -> Vec<ItemId> {
        let mut placed: Vec<(u32, &ItemId)> = self
            .cells
            .iter()
            .filter_map(|(coord, id)| to_linear_index(*coord, &self.dims, mode).map(|n| (n, id)))
            .collect();
        placed.sort_by_key(|(n, _)| *n);
        placed.into_iter().map(|(_, id)| id.clone()).collect()
    }

    /// Registers an item on a well while loading.
    ///
    /// Hands the item back if the well is outside the plate or already taken.
    pub(crate) fn insert_placed(&mut self, item: Item, coord: CellCoordinate) -> Result<(), Item> {
        if !coord.is_within(&self.dims) || self.cells.contains_key(&coord) || self.contains(&item.id) {
            return Err(item);
        }
        self.cells.insert(coord, item.id.clone());
        self.items.insert(item.id.clone(), item);
        Ok(())
    }

    /// Registers an unplaced item while loading. Duplicate ids are ignored.
    pub(crate) fn insert_available(&mut self, item: Item) -> bool {
        if self.contains(&item.id) {
            return false;
        }
        self.available.push(item.id.clone());
        self.items.insert(item.id.clone(), item);
        true
    }

    /// Takes an item out of the grid or pool, leaving it temporarily homeless.
    pub(crate) fn detach(&mut self, id: &ItemId) -> Option<Location> {
        if let Some(coord) = self.coordinate_of(id) {
            self.cells.remove(&coord);
            return Some(Location::Cell(coord));
        }
        let index = self.available.iter().position(|candidate| candidate == id)?;
        self.available.remove(index);
        Some(Location::Pool)
    }

    /// Writes a detached item into a well. A previous occupant is pushed to
    /// the end of the pool and returned.
    pub(crate) fn place(&mut self, id: ItemId, coord: CellCoordinate) -> Option<ItemId> {
        debug_assert!(coord.is_within(&self.dims));
        let displaced = self.cells.insert(coord, id);
        if let Some(ref occupant) = displaced {
            self.available.push(occupant.clone());
        }
        displaced
    }

    pub(crate) fn push_available(&mut self, id: ItemId) {
        self.available.push(id);
    }

    /// Returns `true` if the item was not marked before.
    pub(crate) fn mark_moved(&mut self, id: &ItemId) -> bool {
        self.moved.insert(id.clone())
    }

    pub(crate) fn clear_moved(&mut self) {
        self.moved.clear();
    }

    /// Makes committed coordinates the new persisted baseline.
    pub(crate) fn rebase(&mut self, updates: &[ItemUpdate]) {
        for update in updates {
            if let Some(item) = self.items.get_mut(&update.id) {
                item.row_coordinate = update.row_coordinate.clone();
                item.column_coordinate = update.column_coordinate;
            }
        }
    }

    /// Verifies partition, uniqueness and bounds.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut placed = HashSet::new();
        for (coord, id) in &self.cells {
            if !coord.is_within(&self.dims) {
                return Err(InvariantViolation::OutOfBounds {
                    row: coord.row,
                    column: coord.column,
                });
            }
            if !self.contains(id) {
                return Err(InvariantViolation::Unregistered(id.clone()));
            }
            if !placed.insert(id) {
                return Err(InvariantViolation::PlacedTwice(id.clone()));
            }
        }

        let mut pooled = HashSet::new();
        for id in &self.available {
            if !self.contains(id) {
                return Err(InvariantViolation::Unregistered(id.clone()));
            }
            if placed.contains(id) {
                return Err(InvariantViolation::PlacedAndAvailable(id.clone()));
            }
            if !pooled.insert(id) {
                return Err(InvariantViolation::PooledTwice(id.clone()));
            }
        }

        if let Some(lost) = self
            .items
            .keys()
            .find(|id| !placed.contains(id) && !pooled.contains(id))
        {
            return Err(InvariantViolation::Lost(lost.clone()));
        }

        if let Some(unknown) = self.moved.iter().find(|id| !self.contains(id)) {
            return Err(InvariantViolation::Unregistered(unknown.clone()));
        }

        Ok(())
    }

    /// Serializable view of the plate with printable well keys.
    pub fn snapshot<L: RowLabeler + ?Sized>(&self, labels: &L) -> GridSnapshot {
        GridSnapshot {
            dimensions: self.dims,
            capacity: self.dims.capacity(),
            placed_count: self.cells.len(),
            cells: self
                .cells
                .iter()
                .filter_map(|(coord, id)| Some((CoordinateKey::new(*coord, labels)?, id.clone())))
                .collect(),
            available: self.available.clone(),
            moved: self.moved.iter().cloned().collect(),
        }
    }
}

/// Read-only view of a plate for clients.
#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GridSnapshot {
    pub dimensions: GridDimensions,
    pub capacity: u32,
    pub placed_count: usize,
    #[schema(value_type = std::collections::BTreeMap<String, String>)]
    pub cells: BTreeMap<CoordinateKey, ItemId>,
    pub available: Vec<ItemId>,
    pub moved: Vec<ItemId>,
}
