//! Append-only per-session event log and small-file metadata store.
//!
//! The Store is the single owner of everything under `<root>/sessions/<id>/`.
//! Every other crate reaches the filesystem only through here.

mod error;
mod event;
mod metadata;
mod session_id;
mod store;

pub use error::{ErrorKind, StoreError};
pub use event::{Event, EventKind};
pub use metadata::{Flags, Metadata, SessionStatus};
pub use session_id::SessionId;
pub use store::Store;
