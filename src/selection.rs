//! Multi-select over the pool of unplaced items.
//!
//! Plain clicks select one item and set the range anchor; shift-clicks select the
//! inclusive range between the anchor and the clicked item, in pool order.

use crate::model::ItemId;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectionState {
    selected: Vec<ItemId>,
    last_clicked: Option<ItemId>,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selected items in pool order.
    pub fn selected(&self) -> &[ItemId] {
        &self.selected
    }

    /// Anchor for the next shift-click.
    pub fn anchor(&self) -> Option<&ItemId> {
        self.last_clicked.as_ref()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.selected.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn clear(&mut self) {
        self.selected.clear();
        self.last_clicked = None;
    }

    /// Applies a click on `item` given the current pool order.
    ///
    /// Returns `false` (and leaves the selection alone) when the item is not in
    /// the pool: wells on the grid are not selectable.
    pub fn click(&mut self, item: &ItemId, shift: bool, available: &[ItemId]) -> bool {
        let Some(clicked_at) = available.iter().position(|id| id == item) else {
            return false;
        };

        let anchor_at = if shift {
            self.last_clicked
                .as_ref()
                .and_then(|anchor| available.iter().position(|id| id == anchor))
        } else {
            None
        };

        self.selected = match anchor_at {
            Some(anchor_at) => {
                let low = anchor_at.min(clicked_at);
                let high = anchor_at.max(clicked_at);
                available[low..=high].to_vec()
            }
            None => vec![item.clone()],
        };
        self.last_clicked = Some(item.clone());
        true
    }
}
