//! Coordinate math for rectangular well plates.
//!
//! Maps between 1-based linear fill positions and `(row, column)` cells for both
//! fill directions, and between row numbers and their printed labels.
//! Everything in here is pure and stateless.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::model::GridDimensions;

/// Traversal order used to hand out consecutive positions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillMode {
    /// Row-major: A1, A2, ... A12, B1, ...
    #[default]
    Row,
    /// Column-major: A1, B1, ... H1, A2, ...
    Column,
}

impl FillMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillMode::Row => "ROW",
            FillMode::Column => "COLUMN",
        }
    }
}

impl fmt::Display for FillMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FillMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "row" | "rows" => Ok(FillMode::Row),
            "column" | "col" | "columns" => Ok(FillMode::Column),
            other => Err(format!("unknown fill mode '{other}'")),
        }
    }
}

/// A single well, 1-based in both axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoordinate {
    pub row: u32,
    pub column: u32,
}

impl CellCoordinate {
    pub const fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }

    /// The first cell of every grid.
    pub const fn origin() -> Self {
        Self::new(1, 1)
    }

    pub fn is_within(&self, dims: &GridDimensions) -> bool {
        (1..=dims.number_of_rows).contains(&self.row)
            && (1..=dims.number_of_columns).contains(&self.column)
    }
}

/// Converts a cell into its 1-based position in fill order.
///
/// Returns `None` for cells outside the grid.
pub fn to_linear_index(coord: CellCoordinate, dims: &GridDimensions, mode: FillMode) -> Option<u32> {
    if !coord.is_within(dims) {
        return None;
    }
    let index = match mode {
        FillMode::Row => (coord.row - 1) * dims.number_of_columns + coord.column,
        FillMode::Column => (coord.column - 1) * dims.number_of_rows + coord.row,
    };
    Some(index)
}

/// Converts a 1-based fill position back into a cell.
///
/// Returns `None` for `0` and for positions past the grid capacity (overflow).
pub fn from_linear_index(index: u32, dims: &GridDimensions, mode: FillMode) -> Option<CellCoordinate> {
    if index == 0 || index > dims.capacity() {
        return None;
    }
    let zero_based = index - 1;
    let coord = match mode {
        FillMode::Row => CellCoordinate::new(
            zero_based / dims.number_of_columns + 1,
            zero_based % dims.number_of_columns + 1,
        ),
        FillMode::Column => CellCoordinate::new(
            zero_based % dims.number_of_rows + 1,
            zero_based / dims.number_of_rows + 1,
        ),
    };
    Some(coord)
}

/// Iterates all cells of the grid in fill order.
pub fn cells_in_fill_order(
    dims: GridDimensions,
    mode: FillMode,
) -> impl Iterator<Item = CellCoordinate> {
    (1..=dims.capacity()).filter_map(move |n| from_linear_index(n, &dims, mode))
}

/// Printable row labels.
///
/// Implement this to support plates whose row naming differs from the
/// built-in letter schemes.
pub trait RowLabeler {
    /// Label for a 1-based row, `None` if the scheme cannot express it.
    fn label(&self, row: u32) -> Option<String>;

    /// 1-based row for a label, `None` if the label is not valid.
    fn parse(&self, label: &str) -> Option<u32>;

    /// Largest row number the scheme can express, if bounded.
    fn max_rows(&self) -> Option<u32> {
        None
    }
}

/// Built-in row label schemes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RowLabelScheme {
    /// Single letters `A`..`Z`; plates are capped at 26 rows.
    Alphabetic,
    /// `A`..`Z`, then `AA`, `AB`, ... like spreadsheet columns.
    #[default]
    Spreadsheet,
}

impl RowLabelScheme {
    const LETTERS: u32 = 26;
}

impl RowLabeler for RowLabelScheme {
    fn label(&self, row: u32) -> Option<String> {
        if row == 0 {
            return None;
        }
        match self {
            RowLabelScheme::Alphabetic => {
                if row > Self::LETTERS {
                    return None;
                }
                Some(char::from(b'A' + (row - 1) as u8).to_string())
            }
            RowLabelScheme::Spreadsheet => {
                let mut remaining = row;
                let mut letters = Vec::new();
                while remaining > 0 {
                    remaining -= 1;
                    letters.push(b'A' + (remaining % Self::LETTERS) as u8);
                    remaining /= Self::LETTERS;
                }
                letters.reverse();
                Some(letters.into_iter().map(char::from).collect())
            }
        }
    }

    fn parse(&self, label: &str) -> Option<u32> {
        let label = label.trim();
        if label.is_empty() || !label.bytes().all(|b| b.is_ascii_alphabetic()) {
            return None;
        }
        let row = label.bytes().try_fold(0u32, |acc, byte| {
            let digit = u32::from(byte.to_ascii_uppercase() - b'A') + 1;
            acc.checked_mul(Self::LETTERS)?.checked_add(digit)
        })?;
        match self.max_rows() {
            Some(max) if row > max => None,
            _ => Some(row),
        }
    }

    fn max_rows(&self) -> Option<u32> {
        match self {
            RowLabelScheme::Alphabetic => Some(Self::LETTERS),
            RowLabelScheme::Spreadsheet => None,
        }
    }
}

impl fmt::Display for RowLabelScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RowLabelScheme::Alphabetic => "alphabetic",
            RowLabelScheme::Spreadsheet => "spreadsheet",
        })
    }
}

impl FromStr for RowLabelScheme {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "alphabetic" | "letters" => Ok(RowLabelScheme::Alphabetic),
            "spreadsheet" | "extended" => Ok(RowLabelScheme::Spreadsheet),
            other => Err(format!("unknown row label scheme '{other}'")),
        }
    }
}

/// Canonical `"<rowLabel>_<column>"` key, e.g. `"B_7"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct CoordinateKey(String);

impl CoordinateKey {
    pub fn new<L: RowLabeler + ?Sized>(coord: CellCoordinate, labels: &L) -> Option<Self> {
        let row = labels.label(coord.row)?;
        if coord.column == 0 {
            return None;
        }
        Some(Self(format!("{row}_{}", coord.column)))
    }

    /// Parses the key back into a cell. Bounds are not checked here.
    pub fn to_cell<L: RowLabeler + ?Sized>(&self, labels: &L) -> Option<CellCoordinate> {
        let (row, column) = self.0.split_once('_')?;
        let row = labels.parse(row)?;
        let column = column.trim().parse::<u32>().ok().filter(|c| *c > 0)?;
        Some(CellCoordinate::new(row, column))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CoordinateKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for CoordinateKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl fmt::Display for CoordinateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
