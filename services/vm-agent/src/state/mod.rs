//! Durable VM state.
//!
//! The lifecycle manager talks to storage through the [`StateStore`] trait;
//! [`SqliteStateStore`] is the implementation the agent ships with. Records
//! survive agent restarts and are the input to startup recovery.

mod store;

pub use store::{SqliteStateStore, StateStore, StateStoreError, VmRecord, VmStatus};
