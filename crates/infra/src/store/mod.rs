//! Relational store boundary.
//!
//! The schema and SQL live outside this crate; everything here talks to the
//! store through [`Queries`] inside a [`Transaction`]. [`StoreExt::execute_atomic`]
//! is the only way to run writes: the closure's calls share one transaction
//! that commits when it returns `Ok` and rolls back otherwise.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryStore;
pub use r#trait::{Queries, Store, StoreError, StoreExt, Transaction};
