//! Latchkey Store - the coordination store contract
//!
//! Every lock, rate limit and token decision in latchkey is made by a single
//! atomic store operation. This crate provides:
//! - `CoordinationStore`: the async contract the primitives are written against
//! - `MemoryCoordinationStore`: an in-process implementation backed by `DashMap`
//! - `StoreError`: infrastructure failures reaching the store

pub mod error;
pub mod memory;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryCoordinationStore;
pub use store::{CoordinationEntry, CoordinationStore, RateWindow, WindowAlgorithm};
