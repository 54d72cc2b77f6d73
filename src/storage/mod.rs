//! Dual-store persistence: local JSON collections plus a remote document
//! store, kept consistent by a compensating transaction manager.

pub mod dual;
pub mod local;
pub mod remote;
pub mod transaction;

pub use dual::{StoreMode, TokenStore};
pub use local::LocalStore;
pub use remote::{MemoryRemoteStore, RemoteStore};
pub use transaction::{
    OpIntent, TransactionManager, TransactionOutcome, TransactionScope, TransactionState,
};
