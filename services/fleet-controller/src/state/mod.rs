//! Checkpoint persistence for the fleet controller.
//!
//! The active node set is written through on every state change so a
//! restarted controller can reconcile its records against the backend
//! instead of leaking nodes it no longer knows about.

mod store;

pub use store::{NodeRecord, StateStore, StateStoreError};
