//! Path-confined access to the project tree.
//!
//! `ProjectRoot` validates every caller-supplied path; `FileStore` builds
//! the read/write/list/snapshot operations on top of it.

mod error;
mod guard;
mod snapshot;
mod store;

pub(crate) use error::FileError;
pub(crate) use guard::ProjectRoot;
pub(crate) use snapshot::FileSnapshot;
pub(crate) use store::FileStore;
