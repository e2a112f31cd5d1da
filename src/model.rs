//! Data models for plate layout editing.
//!
//! - `Item`: a lab entity (PCR batch item, material sample) with its persisted well
//! - `GridDimensions`: the rectangular size of the plate
//! - `ItemUpdate`: the coordinate change sent back to the store on commit

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

/// Validation error for plate and item data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid dimension: {0}")]
    InvalidDimension(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Row label scheme supports at most {max} rows, plate has {rows}")]
    TooManyRows { rows: u32, max: u32 },
}

/// Stable identifier of an item. Never reused within a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Identifier of the batch whose items are being laid out.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A lab item as fetched from the store.
///
/// `row_coordinate` / `column_coordinate` are the persisted well; both are
/// `None` for an unplaced item. Items compare by `id` only.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({ "id": "item-1", "name": "S-0001", "rowCoordinate": "A", "columnCoordinate": 1 }))]
pub struct Item {
    pub id: ItemId,
    /// Display name, used by the natural sort before a full relayout.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub row_coordinate: Option<String>,
    #[serde(default)]
    pub column_coordinate: Option<u32>,
}

impl Item {
    pub fn unplaced(id: impl Into<String>) -> Self {
        Self {
            id: ItemId::new(id),
            name: None,
            row_coordinate: None,
            column_coordinate: None,
        }
    }

    pub fn placed(id: impl Into<String>, row: impl Into<String>, column: u32) -> Self {
        Self {
            id: ItemId::new(id),
            name: None,
            row_coordinate: Some(row.into()),
            column_coordinate: Some(column),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Classifies the persisted coordinate pair.
    pub fn persisted_coordinate(&self) -> PersistedCoordinate<'_> {
        match (self.row_coordinate.as_deref(), self.column_coordinate) {
            (Some(row), Some(column)) => PersistedCoordinate::Placed { row, column },
            (None, None) => PersistedCoordinate::Unplaced,
            _ => PersistedCoordinate::Partial,
        }
    }

    /// Label used for natural sorting: the name, or the id when unnamed.
    pub fn sort_label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Item {}

/// How an item's stored coordinates look on load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistedCoordinate<'a> {
    Placed { row: &'a str, column: u32 },
    Unplaced,
    /// Only one of row/column is set.
    Partial,
}

/// Size of the plate. Fixed for the lifetime of an editing session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GridDimensions {
    pub number_of_rows: u32,
    pub number_of_columns: u32,
}

impl GridDimensions {
    /// Creates validated dimensions.
    ///
    /// # Examples
    /// ```
    /// use plate_layout::model::GridDimensions;
    ///
    /// assert_eq!(GridDimensions::new(8, 12).unwrap().capacity(), 96);
    /// assert!(GridDimensions::new(0, 12).is_err());
    /// ```
    pub fn new(number_of_rows: u32, number_of_columns: u32) -> Result<Self, ValidationError> {
        validate_axis(number_of_rows, "numberOfRows")?;
        validate_axis(number_of_columns, "numberOfColumns")?;
        if number_of_rows.checked_mul(number_of_columns).is_none() {
            return Err(ValidationError::InvalidDimension(format!(
                "{number_of_rows} x {number_of_columns} wells exceed the addressable capacity"
            )));
        }
        Ok(Self {
            number_of_rows,
            number_of_columns,
        })
    }

    /// Number of wells.
    pub fn capacity(&self) -> u32 {
        self.number_of_rows * self.number_of_columns
    }

    /// Re-validates values that arrived through deserialization.
    pub fn validated(self) -> Result<Self, ValidationError> {
        Self::new(self.number_of_rows, self.number_of_columns)
    }
}

fn validate_axis(value: u32, name: &str) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::InvalidDimension(format!(
            "{name} must be at least 1"
        )));
    }
    Ok(())
}

/// Coordinate change for one item, as handed to the save collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ItemUpdate {
    pub id: ItemId,
    pub row_coordinate: Option<String>,
    pub column_coordinate: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_reject_zero_axes() {
        assert!(matches!(
            GridDimensions::new(0, 12),
            Err(ValidationError::InvalidDimension(_))
        ));
        assert!(GridDimensions::new(8, 0).is_err());
        assert_eq!(GridDimensions::new(16, 24).unwrap().capacity(), 384);
    }

    #[test]
    fn dimensions_reject_overflowing_capacity() {
        assert!(GridDimensions::new(u32::MAX, 2).is_err());
    }

    #[test]
    fn persisted_coordinate_classification() {
        assert_eq!(
            Item::placed("a", "B", 3).persisted_coordinate(),
            PersistedCoordinate::Placed { row: "B", column: 3 }
        );
        assert_eq!(
            Item::unplaced("b").persisted_coordinate(),
            PersistedCoordinate::Unplaced
        );
        let mut partial = Item::unplaced("c");
        partial.column_coordinate = Some(4);
        assert_eq!(partial.persisted_coordinate(), PersistedCoordinate::Partial);
    }

    #[test]
    fn items_compare_by_id() {
        let a = Item::placed("x", "A", 1);
        let b = Item::unplaced("x").with_name("other");
        assert_eq!(a, b);
    }

    #[test]
    fn item_deserializes_from_camel_case_with_nulls() {
        let item: Item =
            serde_json::from_str(r#"{"id":"i1","rowCoordinate":null,"columnCoordinate":null}"#)
                .expect("valid item JSON");
        assert_eq!(item.persisted_coordinate(), PersistedCoordinate::Unplaced);
        assert_eq!(item.sort_label(), "i1");
    }
}
