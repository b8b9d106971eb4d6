//! Service table for meshwatch.
//!
//! Services live in memory behind a mutex and are persisted to a JSON file
//! on every change.

mod models;
mod store;

pub use models::*;
pub use store::*;
