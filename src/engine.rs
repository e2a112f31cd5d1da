//! Placement engine for well plates.
//!
//! Implements the move semantics used by the plate editor:
//! - multi-item drops fill consecutive wells in the active fill order
//! - an occupied target well displaces its occupant back to the pool
//! - items that run past the last well overflow back to the pool
//! - every move clears the current selection
//!
//! All operations are synchronous state transitions without I/O.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::coordinates::{
    CellCoordinate, CoordinateKey, FillMode, RowLabelScheme, RowLabeler, from_linear_index,
    to_linear_index,
};
use crate::grid::{GridState, Location};
use crate::model::{GridDimensions, Item, ItemId, ValidationError};
use crate::natural_sort::compare_items;
use crate::selection::SelectionState;

/// Which moved items a commit sends to the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CommitPolicy {
    /// Only items whose final well differs from the loaded one.
    #[default]
    Changed,
    /// Every item that was moved at all, even if it ended up where it started.
    Touched,
}

impl std::fmt::Display for CommitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CommitPolicy::Changed => "changed",
            CommitPolicy::Touched => "touched",
        })
    }
}

impl std::str::FromStr for CommitPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "changed" | "diff" => Ok(CommitPolicy::Changed),
            "touched" | "all" => Ok(CommitPolicy::Touched),
            other => Err(format!("unknown commit policy '{other}'")),
        }
    }
}

/// Engine settings.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlacementConfig {
    /// Fill direction for multi-item drops and relayouts.
    pub fill_mode: FillMode,
    /// How rows are printed in well keys.
    pub row_labels: RowLabelScheme,
    /// Which items a commit emits.
    pub commit_policy: CommitPolicy,
}

impl PlacementConfig {
    pub fn builder() -> PlacementConfigBuilder {
        PlacementConfigBuilder::default()
    }

    /// Checks that every row of the plate has a printable label.
    pub fn validate_for(&self, dims: &GridDimensions) -> Result<(), ValidationError> {
        match self.row_labels.max_rows() {
            Some(max) if dims.number_of_rows > max => Err(ValidationError::TooManyRows {
                rows: dims.number_of_rows,
                max,
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlacementConfigBuilder {
    config: PlacementConfig,
}

impl PlacementConfigBuilder {
    pub fn fill_mode(mut self, mode: FillMode) -> Self {
        self.config.fill_mode = mode;
        self
    }

    pub fn row_labels(mut self, scheme: RowLabelScheme) -> Self {
        self.config.row_labels = scheme;
        self
    }

    pub fn commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.config.commit_policy = policy;
        self
    }

    pub fn build(self) -> PlacementConfig {
        self.config
    }
}

/// Steps of a move, suitable for live display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "type")]
pub enum PlacementEvent {
    /// An item was written into a well.
    ItemPlaced { id: ItemId, well: CoordinateKey },
    /// A previous occupant was evicted to the pool.
    ItemDisplaced { id: ItemId, from: CoordinateKey },
    /// An item ran past the last well and went back to the pool.
    ItemOverflowed { id: ItemId },
    /// An item was dropped on the pool.
    ItemReturned {
        id: ItemId,
        from: Option<CoordinateKey>,
    },
    /// An item is not known to the plate and was skipped.
    ItemIgnored { id: ItemId },
    SelectionChanged { selected: Vec<ItemId> },
    FillModeChanged { mode: FillMode },
    MoveFinished {
        placed: usize,
        displaced: usize,
        overflowed: usize,
        returned: usize,
    },
}

/// Outcome of a single move.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MoveReport {
    pub placed: Vec<(ItemId, CellCoordinate)>,
    pub displaced: Vec<ItemId>,
    pub overflowed: Vec<ItemId>,
    pub returned: Vec<ItemId>,
    pub ignored: Vec<ItemId>,
    pub events: Vec<PlacementEvent>,
}

impl MoveReport {
    /// `true` if nothing changed location.
    pub fn is_noop(&self) -> bool {
        self.placed.is_empty()
            && self.displaced.is_empty()
            && self.overflowed.is_empty()
            && self.returned.is_empty()
    }

    fn emit(&mut self, on_event: &mut dyn FnMut(&PlacementEvent), event: PlacementEvent) {
        on_event(&event);
        self.events.push(event);
    }
}

fn well_key(coord: CellCoordinate, labels: &RowLabelScheme) -> CoordinateKey {
    CoordinateKey::new(coord, labels)
        .unwrap_or_else(|| CoordinateKey::from(format!("{}_{}", coord.row, coord.column)))
}

/// Core move transition.
///
/// Removes `items` from wherever they are, then either appends them to the
/// pool (`target == None`) or writes them into consecutive wells starting at
/// `target`. Unknown and repeated ids are skipped.
fn apply_move(
    grid: &mut GridState,
    items: &[ItemId],
    target: Option<CellCoordinate>,
    config: &PlacementConfig,
    on_event: &mut dyn FnMut(&PlacementEvent),
) -> MoveReport {
    let mut report = MoveReport::default();
    let dims = grid.dims();

    let mut seen = HashSet::new();
    let mut moving: Vec<(ItemId, Location)> = Vec::with_capacity(items.len());
    for id in items {
        if !seen.insert(id) {
            continue;
        }
        match grid.detach(id) {
            Some(location) => moving.push((id.clone(), location)),
            None => {
                debug!(item = %id, "ignoring move of unknown item");
                report.ignored.push(id.clone());
                report.emit(on_event, PlacementEvent::ItemIgnored { id: id.clone() });
            }
        }
    }

    match target {
        None => {
            for (id, location) in moving {
                grid.push_available(id.clone());
                let from = match location {
                    Location::Cell(coord) => {
                        grid.mark_moved(&id);
                        Some(well_key(coord, &config.row_labels))
                    }
                    Location::Pool => None,
                };
                report.returned.push(id.clone());
                report.emit(on_event, PlacementEvent::ItemReturned { id, from });
            }
        }
        Some(target) => {
            let start = to_linear_index(target, &dims, config.fill_mode);
            for (offset, (id, _)) in moving.into_iter().enumerate() {
                let cell = start
                    .zip(u32::try_from(offset).ok())
                    .and_then(|(n0, offset)| n0.checked_add(offset))
                    .and_then(|n| from_linear_index(n, &dims, config.fill_mode));

                match cell {
                    Some(coord) => {
                        if let Some(displaced) = grid.place(id.clone(), coord) {
                            grid.mark_moved(&displaced);
                            report.displaced.push(displaced.clone());
                            report.emit(
                                on_event,
                                PlacementEvent::ItemDisplaced {
                                    id: displaced,
                                    from: well_key(coord, &config.row_labels),
                                },
                            );
                        }
                        report.placed.push((id.clone(), coord));
                        report.emit(
                            on_event,
                            PlacementEvent::ItemPlaced {
                                id: id.clone(),
                                well: well_key(coord, &config.row_labels),
                            },
                        );
                    }
                    None => {
                        grid.push_available(id.clone());
                        report.overflowed.push(id.clone());
                        report.emit(on_event, PlacementEvent::ItemOverflowed { id: id.clone() });
                    }
                }
                grid.mark_moved(&id);
            }
        }
    }

    let finished = PlacementEvent::MoveFinished {
        placed: report.placed.len(),
        displaced: report.displaced.len(),
        overflowed: report.overflowed.len(),
        returned: report.returned.len(),
    };
    report.emit(on_event, finished);

    debug_assert_eq!(grid.check_invariants(), Ok(()));
    report
}

impl GridState {
    /// Value-style variant of a move: returns the resulting plate and leaves
    /// `self` untouched.
    pub fn with_move(
        &self,
        items: &[ItemId],
        target: Option<CellCoordinate>,
        config: &PlacementConfig,
    ) -> (GridState, MoveReport) {
        let mut next = self.clone();
        let report = apply_move(&mut next, items, target, config, &mut |_| {});
        (next, report)
    }
}

/// Interactive editor state for one plate: grid, selection and settings.
#[derive(Clone, Debug)]
pub struct PlacementEngine {
    grid: GridState,
    selection: SelectionState,
    config: PlacementConfig,
}

impl PlacementEngine {
    /// Creates an engine with an empty plate.
    pub fn new(dims: GridDimensions, config: PlacementConfig) -> Result<Self, ValidationError> {
        Self::from_grid(GridState::new(dims), config)
    }

    /// Wraps an existing plate, e.g. one produced by loading.
    pub fn from_grid(grid: GridState, config: PlacementConfig) -> Result<Self, ValidationError> {
        config.validate_for(&grid.dims())?;
        Ok(Self {
            grid,
            selection: SelectionState::new(),
            config,
        })
    }

    pub fn grid(&self) -> &GridState {
        &self.grid
    }

    pub(crate) fn grid_mut(&mut self) -> &mut GridState {
        &mut self.grid
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    pub fn fill_mode(&self) -> FillMode {
        self.config.fill_mode
    }

    pub fn into_grid(self) -> GridState {
        self.grid
    }

    /// Swaps in a freshly loaded plate and drops the selection.
    pub(crate) fn replace_grid(&mut self, grid: GridState) {
        self.grid = grid;
        self.selection.clear();
    }

    /// Printable key for a well.
    pub fn key_for(&self, coord: CellCoordinate) -> CoordinateKey {
        well_key(coord, &self.config.row_labels)
    }

    /// Parses a well key; `None` if malformed or outside the plate.
    pub fn parse_key(&self, key: &CoordinateKey) -> Option<CellCoordinate> {
        key.to_cell(&self.config.row_labels)
            .filter(|coord| coord.is_within(&self.grid.dims()))
    }

    /// Moves `items` onto the plate starting at `target`, or back to the pool
    /// when `target` is `None`.
    pub fn move_items(&mut self, items: &[ItemId], target: Option<CellCoordinate>) -> MoveReport {
        self.move_items_with_progress(items, target, |_| {})
    }

    /// Like `move_items`, reporting each step through `on_event` as it happens.
    pub fn move_items_with_progress(
        &mut self,
        items: &[ItemId],
        target: Option<CellCoordinate>,
        mut on_event: impl FnMut(&PlacementEvent),
    ) -> MoveReport {
        self.selection.clear();
        let report = apply_move(&mut self.grid, items, target, &self.config, &mut on_event);
        debug!(
            placed = report.placed.len(),
            displaced = report.displaced.len(),
            overflowed = report.overflowed.len(),
            returned = report.returned.len(),
            "move applied"
        );
        report
    }

    /// Drop onto a well. A selected item drags the whole selection along.
    pub fn on_grid_drop(&mut self, item: &ItemId, coord: CellCoordinate) -> MoveReport {
        let items = if self.selection.contains(item) {
            self.selection.selected().to_vec()
        } else {
            vec![item.clone()]
        };
        self.move_items(&items, Some(coord))
    }

    /// Drop onto the pool. Always moves the single dropped item.
    pub fn on_list_drop(&mut self, item: &ItemId) -> MoveReport {
        self.move_items(std::slice::from_ref(item), None)
    }

    /// Click on a pool item. Returns `false` if the click was ignored.
    pub fn on_item_click(&mut self, item: &ItemId, shift: bool) -> bool {
        self.selection.click(item, shift, self.grid.available())
    }

    /// Sends every placed item back to the pool, in fill order.
    pub fn clear_grid(&mut self) -> MoveReport {
        let placed = self.grid.placed_in_fill_order(self.config.fill_mode);
        self.move_items(&placed, None)
    }

    /// Relays out pool and plate items from the first well in fill order.
    pub fn move_all(&mut self) -> MoveReport {
        let items = self.relayout_candidates();
        self.move_items(&items, Some(CellCoordinate::origin()))
    }

    /// Like `move_all`, but sorts the items with `compare` first.
    pub fn move_all_sorted_by(
        &mut self,
        mut compare: impl FnMut(&Item, &Item) -> Ordering,
    ) -> MoveReport {
        let mut items: Vec<&Item> = self
            .relayout_candidates()
            .iter()
            .filter_map(|id| self.grid.item(id))
            .collect();
        items.sort_by(|a, b| compare(a, b));
        let ids: Vec<ItemId> = items.into_iter().map(|item| item.id.clone()).collect();
        self.move_items(&ids, Some(CellCoordinate::origin()))
    }

    /// `move_all` with items in natural name order.
    pub fn move_all_natural(&mut self) -> MoveReport {
        self.move_all_sorted_by(compare_items)
    }

    /// Switches the fill direction for later moves. Existing wells stay put.
    pub fn set_fill_mode(&mut self, mode: FillMode) -> PlacementEvent {
        self.config.fill_mode = mode;
        PlacementEvent::FillModeChanged { mode }
    }

    fn relayout_candidates(&self) -> Vec<ItemId> {
        let mut items = self.grid.available().to_vec();
        items.extend(self.grid.placed_in_fill_order(self.config.fill_mode));
        items
    }
}
