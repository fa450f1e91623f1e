//! Persistence Adapter layer (spec.md §4.H, §4.I)
//!
//! Row-oriented over `workflow`/`call`/`execution_info`, not event-sourced.
//!
//! - [`PersistenceAdapter`] — the contract
//! - [`InMemoryPersistence`] — for tests and the local-engine path
//! - [`PostgresPersistence`] — production, via `sqlx`

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryPersistence;
pub use postgres::PostgresPersistence;
pub use store::{ExecutionInfoWrite, PersistenceAdapter, StoreError, TransientPredicate};
