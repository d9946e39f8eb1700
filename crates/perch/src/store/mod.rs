//! Persistent user records.
//!
//! This module covers everything the session engine needs from storage:
//!
//! - OAuth credentials surviving a gateway restart
//! - Poll cursors bounding what has already been delivered
//! - The user's display mode and legacy-scheme flag
//!
//! The engine accesses storage exclusively through the [`UserStore`] trait;
//! [`FileUserStore`] is the shipped backend.

mod error;
mod file;
mod user;

pub use error::{StorageError, StorageResult};
pub use file::FileUserStore;
pub use user::{UserRecord, UserStore};
