//! Plate layout editing: placing lab items into the wells of a rectangular
//! grid, tracking what moved, and committing the changes back to a store.

pub mod api;
pub mod client;
pub mod config;
pub mod coordinates;
pub mod engine;
pub mod error;
pub mod grid;
pub mod model;
pub mod natural_sort;
pub mod selection;
pub mod session;
