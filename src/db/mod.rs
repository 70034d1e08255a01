//! Database module for Vigil.
//!
//! Provides SQLite storage with embedded migrations. [`Store`] owns the
//! connection; [`queries`] holds the row-level SQL that engine modules run
//! inside [`Store::transaction`].

mod models;
pub mod queries;
mod store;

pub use models::*;
pub use store::*;
